//! Error types for the data channel.

use peerxfer_protocol::ProtocolError;
use peerxfer_transfer::TransferError;

/// Errors produced by sockets, signaling and configuration.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("signaling failed: {0}")]
    Signaling(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<DataChannelError> for TransferError {
    /// Mapping used while a tier is still negotiating: socket trouble lets
    /// the next tier try, a protocol violation blames the peer.
    fn from(err: DataChannelError) -> Self {
        match err {
            DataChannelError::Io(e) => TransferError::TransportFailed(e.to_string()),
            DataChannelError::Timeout(what) => TransferError::TransportFailed(format!("timed out: {what}")),
            DataChannelError::Protocol(e) if e.is_violation() => TransferError::Remote(e.to_string()),
            DataChannelError::Protocol(e) => TransferError::TransportFailed(e.to_string()),
            DataChannelError::Json(e) => TransferError::Remote(e.to_string()),
            DataChannelError::Signaling(msg) | DataChannelError::Config(msg) => {
                TransferError::Local(msg)
            }
            DataChannelError::Cancelled => TransferError::Cancelled,
        }
    }
}
