//! Wire-level error types.

/// Errors produced while encoding or decoding negotiation wire formats.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("no acceptable SOCKS authentication method")]
    NoAcceptableMethod,

    #[error("SOCKS request failed with reply code {0:#04x}")]
    RequestFailed(u8),

    #[error("destination hash mismatch")]
    HashMismatch,

    #[error("packet length mismatch: declared {declared}, header + body is {actual}")]
    LengthMismatch { declared: u32, actual: u32 },

    #[error("packet body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Returns `true` if the error means the peer sent something invalid,
    /// as opposed to the local side failing to read or write.
    pub fn is_violation(&self) -> bool {
        !matches!(self, ProtocolError::Io(_))
    }
}
