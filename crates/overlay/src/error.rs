//! Error types for overlay operations.

use thiserror::Error;

/// Failures while negotiating the peer handshake.
///
/// Every variant terminates the connection attempt. Handshake failures are
/// expected in normal operation (wrong network, stale software, port
/// scanners) and are logged at debug/info, never as errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Required hello headers are missing or unparseable.
    #[error("malformed hello: {0}")]
    Malformed(String),

    /// The session signature does not verify against the advertised key.
    #[error("hello signature verification failed")]
    BadSignature,

    /// The remote presented our own node key.
    #[error("self connection")]
    SelfConnect,

    /// Another live session already uses this node key.
    #[error("duplicate node")]
    DuplicateNode,

    /// No overlap between our protocol versions and the peer's.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The TLS session cannot produce exporter keying material.
    #[error("no shared value for session")]
    NoSharedValue,

    /// The peer's reported network time is too far from ours.
    #[error("network time out of range")]
    ClockSkew,
}

/// Errors that can occur during overlay network operations.
#[derive(Debug, Error)]
pub enum OverlayError {
    // ===== Transport =====
    /// Low-level I/O error. Recovered locally by closing the connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect or handshake phase exceeded its watchdog.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote closed the connection.
    #[error("peer disconnected")]
    PeerDisconnected,

    // ===== Handshake =====
    /// Handshake verification failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The HTTP exchange preceding the upgrade was invalid.
    #[error("bad HTTP exchange: {0}")]
    Http(String),

    // ===== Admission =====
    /// The source address exceeded its resource budget.
    #[error("over resource limit")]
    OverResourceLimit,

    /// No connection slot available.
    #[error("slots full")]
    SlotsFull,

    // ===== Protocol =====
    /// A framed message could not be decoded. Fails only the offending
    /// session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer's outbound queue overflowed; the session closes rather
    /// than grow without bound.
    #[error("send queue overflow")]
    QueueOverflow,

    // ===== Lifecycle =====
    /// New work was refused because the overlay is stopping.
    #[error("overlay is shutting down")]
    ShuttingDown,

    // ===== Wrapped =====
    /// Configuration error, fatal at startup.
    #[error(transparent)]
    Config(#[from] rill_common::ConfigError),

    /// Key or signature handling error.
    #[error("crypto error: {0}")]
    Crypto(#[from] rill_crypto::CryptoError),

    /// Manifest/boot-cache database error.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// JSON body error (redirect lists, crawl).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OverlayError {
    /// True when the error is the normal result of shutdown or the remote
    /// going away; such errors close the owning object and are not logged
    /// as failures.
    pub fn is_benign_close(&self) -> bool {
        match self {
            OverlayError::PeerDisconnected | OverlayError::ShuttingDown => true,
            OverlayError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
