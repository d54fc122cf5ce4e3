use super::bridge::BridgeState;

/// Errors surfaced to the terminal UI by a session bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Could not reach or handshake with the spawner or the server.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The spawner or server answered with an error.
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    #[error("connection closed")]
    LinkClosed,

    #[error("not allowed while {0:?}")]
    InvalidState(BridgeState),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn negotiation(err: anyhow::Error) -> Self {
        BridgeError::Negotiation(format!("{:#}", err))
    }
}
