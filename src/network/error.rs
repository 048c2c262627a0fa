//! Signaling error types

use thiserror::Error;

/// Errors that can occur while negotiating a peer connection
#[derive(Error, Debug)]
pub enum SignalingError {
    /// A relay call failed at the network or HTTP layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// A relay message could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection engine rejected a description or candidate
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Handshake timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Negotiation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalingError {
    /// Whether the error ends the whole session rather than one peer's negotiation
    pub fn ends_session(&self) -> bool {
        matches!(self, SignalingError::Transport(_) | SignalingError::Cancelled)
    }
}

impl From<reqwest::Error> for SignalingError {
    fn from(err: reqwest::Error) -> Self {
        SignalingError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Protocol(err.to_string())
    }
}

impl From<webrtc::Error> for SignalingError {
    fn from(err: webrtc::Error) -> Self {
        SignalingError::Negotiation(err.to_string())
    }
}

impl From<url::ParseError> for SignalingError {
    fn from(err: url::ParseError) -> Self {
        SignalingError::Config(format!("invalid relay url: {}", err))
    }
}
