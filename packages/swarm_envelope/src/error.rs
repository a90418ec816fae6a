//! Failure modes of opening or sealing an envelope.

/// An envelope could not be sealed or opened.
///
/// Callers treat any of these as "value unusable": fall back to the raw
/// payload, never abort.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("invalid base64 payload")]
    Encoding,

    #[error("authentication tag mismatch")]
    Authentication,

    #[error("encryption failed")]
    Encryption,

    #[error("invalid key: {0}")]
    InvalidKey(String),
}
