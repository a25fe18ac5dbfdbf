use thiserror::Error;

/// Fatal configuration errors.
///
/// Any of these prevents the node from starting; there is no recovery path
/// at runtime for a bad configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML or is missing required structure.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// `overlay.public_ip` is not a public IPv4 address.
    #[error("configured public IP is invalid: {0}")]
    InvalidPublicIp(String),

    /// `overlay.ip_limit` is negative.
    #[error("configured IP limit is invalid")]
    InvalidIpLimit,

    /// A validator key entry or the configured manifest is malformed.
    #[error("invalid validator entry: {0}")]
    InvalidValidatorEntry(String),
}
