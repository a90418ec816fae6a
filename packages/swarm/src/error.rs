//! Error taxonomy for sessions, the pool and the chat sub-channel.
//!
//! Only `JoinInProgress` and `InvalidInput` are meant to reach the caller of a
//! pool operation as an outright failure. Everything else is collected per
//! session and degrades to "fewer active sessions".

use swarm_envelope::CryptoError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwarmError {
    /// Network or connect failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The credential service explicitly refused.
    #[error("rejected: {0}")]
    Auth(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("a join is already in progress")]
    JoinInProgress,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The orchestrator has no pool to act through. A single session that is
    /// not connected reports `Transport` instead.
    #[error("not connected")]
    NotConnected,

    #[error("chat channel is not connected")]
    ChatUnavailable,

    #[error("banned from chat")]
    Banned,
}

impl SwarmError {
    /// Whether a join attempt that failed this way is worth repeating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwarmError::Transport(_) | SwarmError::Auth(_))
    }
}

impl From<reqwest::Error> for SwarmError {
    fn from(err: reqwest::Error) -> Self {
        SwarmError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SwarmError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SwarmError::Transport(err.to_string())
    }
}
