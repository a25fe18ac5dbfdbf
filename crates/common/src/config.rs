//! Node configuration.
//!
//! Loaded from a TOML file. Validation happens at load time: a config that
//! parses but carries invalid values (negative IP limit, private public_ip)
//! is rejected with a fatal [`ConfigError`] and the node refuses to start.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Overlay tuning.
    #[serde(default)]
    pub overlay: OverlaySection,

    /// Peer connection policy.
    #[serde(default)]
    pub peer: PeerSection,

    /// Bootstrap endpoints, `"ip port"` or `"ip:port"` strings.
    #[serde(default)]
    pub ips: Vec<String>,

    /// Fixed peers the node always keeps a connection to.
    #[serde(default)]
    pub ips_fixed: Vec<String>,

    /// Fallback bootstrap endpoint used when both `ips` and `ips_fixed`
    /// are empty. Network-specific, so it lives in configuration rather
    /// than in code.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: String,

    /// Trusted validator master keys, base64.
    #[serde(default)]
    pub validator_keys: Vec<String>,

    /// Optional base64 manifest for this node's own validator key.
    #[serde(default)]
    pub validation_manifest: Option<String>,
}

/// The `[overlay]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlaySection {
    /// Self-reported public IPv4 address, advertised to peers in the
    /// handshake. Must be public; a private or unparseable address is a
    /// fatal error.
    #[serde(default)]
    pub public_ip: Option<String>,

    /// Inclusive cap on concurrent inbound connections per source IP.
    /// Negative values are a fatal error.
    #[serde(default = "default_ip_limit")]
    pub ip_limit: i64,

    /// When true, hop counts are stripped from outbound relays so that
    /// downstream nodes cannot observe our relay topology.
    #[serde(default)]
    pub expire: bool,

    /// Maximum permitted hop count before a message is no longer relayed.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
}

/// The `[peer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    /// Total connection slots.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// When true the node neither accepts nor solicits connections beyond
    /// its fixed peers.
    #[serde(default)]
    pub peer_private: bool,

    /// Listening port for peer connections. 0 disables listening.
    #[serde(default = "default_peer_port")]
    pub port: u16,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            public_ip: None,
            ip_limit: default_ip_limit(),
            expire: false,
            max_ttl: default_max_ttl(),
        }
    }
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            max_peers: default_max_peers(),
            peer_private: false,
            port: default_peer_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            overlay: OverlaySection::default(),
            peer: PeerSection::default(),
            ips: Vec::new(),
            ips_fixed: Vec::new(),
            bootstrap: default_bootstrap(),
            validator_keys: Vec::new(),
            validation_manifest: None,
        }
    }
}

fn default_ip_limit() -> i64 {
    5
}

fn default_max_ttl() -> u32 {
    3
}

fn default_max_peers() -> usize {
    21
}

fn default_peer_port() -> u16 {
    51235
}

fn default_bootstrap() -> String {
    "boot.rill.net 51235".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce the rules a parseable config can still break.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.overlay.ip_limit < 0 {
            return Err(ConfigError::InvalidIpLimit);
        }
        if let Some(ip) = &self.overlay.public_ip {
            let parsed: Ipv4Addr = ip
                .parse()
                .map_err(|_| ConfigError::InvalidPublicIp(ip.clone()))?;
            if is_private_v4(parsed) {
                return Err(ConfigError::InvalidPublicIp(ip.clone()));
            }
        }
        Ok(())
    }

    /// Public IP as a parsed address, when configured.
    ///
    /// [`validate`](Config::validate) has already guaranteed this parses,
    /// so a `None` here means the key was absent.
    pub fn public_ip(&self) -> Option<Ipv4Addr> {
        self.overlay
            .public_ip
            .as_ref()
            .and_then(|ip| ip.parse().ok())
    }

    /// Bootstrap endpoint strings: `ips`, falling back to `ips_fixed`,
    /// falling back to the built-in `bootstrap` entry.
    pub fn bootstrap_ips(&self) -> Vec<String> {
        if !self.ips.is_empty() {
            self.ips.clone()
        } else if !self.ips_fixed.is_empty() {
            self.ips_fixed.clone()
        } else {
            vec![self.bootstrap.clone()]
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.peer.max_peers, 21);
        assert_eq!(config.overlay.max_ttl, 3);
        assert!(!config.overlay.expire);
    }

    #[test]
    fn negative_ip_limit_is_fatal() {
        let err = Config::from_toml("[overlay]\nip_limit = -1\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIpLimit));
    }

    #[test]
    fn private_public_ip_is_fatal() {
        for ip in ["10.1.2.3", "192.168.0.1", "127.0.0.1", "not-an-ip"] {
            let text = format!("[overlay]\npublic_ip = \"{ip}\"\n");
            let err = Config::from_toml(&text).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidPublicIp(_)), "{ip}");
        }
    }

    #[test]
    fn public_ip_must_be_v4() {
        let err = Config::from_toml("[overlay]\npublic_ip = \"2001:db8::1\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPublicIp(_)));
    }

    #[test]
    fn valid_public_ip_accepted() {
        let config = Config::from_toml("[overlay]\npublic_ip = \"203.0.113.7\"\n").unwrap();
        assert_eq!(config.public_ip(), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn bootstrap_fallback_chain() {
        let mut config = Config::default();
        assert_eq!(config.bootstrap_ips(), vec!["boot.rill.net 51235".to_string()]);

        config.ips_fixed = vec!["198.51.100.2 51235".to_string()];
        assert_eq!(config.bootstrap_ips(), config.ips_fixed);

        config.ips = vec!["198.51.100.1 51235".to_string()];
        assert_eq!(config.bootstrap_ips(), config.ips);
    }
}
