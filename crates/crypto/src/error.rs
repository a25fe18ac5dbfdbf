use thiserror::Error;

/// Errors from key handling and signature verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Byte slice is not a valid public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Text is not valid base64 or decodes to the wrong length.
    #[error("invalid key encoding: {0}")]
    InvalidEncoding(String),

    /// Signature did not verify.
    #[error("signature verification failed")]
    BadSignature,
}
