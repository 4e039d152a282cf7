use std::fmt;

/// Direction of a transfer, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferType {
    Send,
    Receive,
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    /// Created, waiting for the local user (receive) or for `request`.
    NotStarted,
    /// Local filename known; the negotiator is establishing a transport.
    Accepted,
    /// Bytes are flowing.
    Started,
    /// All bytes delivered.
    Done,
    /// Aborted by the local side.
    CancelLocal,
    /// Aborted by, or blamed on, the peer.
    CancelRemote,
}

impl XferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            XferStatus::Done | XferStatus::CancelLocal | XferStatus::CancelRemote
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, XferStatus::CancelLocal | XferStatus::CancelRemote)
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(&self, next: XferStatus) -> bool {
        use XferStatus::*;
        match (self, next) {
            (NotStarted, Accepted) | (Accepted, Started) | (Started, Done) => true,
            (from, CancelLocal | CancelRemote) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Human-readable label for progress displays.
    pub fn label(&self) -> &'static str {
        match self {
            XferStatus::NotStarted => "waiting",
            XferStatus::Accepted => "negotiating",
            XferStatus::Started => "transferring",
            XferStatus::Done => "completed",
            XferStatus::CancelLocal => "cancelled",
            XferStatus::CancelRemote => "cancelled by peer",
        }
    }
}

impl fmt::Display for XferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Optional preview image attached to an offer. Never needed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub data: Vec<u8>,
    pub mime_type: String,
}
