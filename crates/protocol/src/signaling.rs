//! Signaling messages exchanged over the existing IM session channel.
//!
//! Every message travels inside an [`Envelope`] naming the stream session
//! and both endpoints. Receivers correlate it to a transfer with
//! [`Envelope::key`], which is always keyed by the *sender* of the envelope.

use serde::{Deserialize, Serialize};

use crate::types::{FileOffer, Method, SessionKey, Streamhost};

/// Routing wrapper for a [`SignalMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sid: String,
    pub from: String,
    pub to: String,
    pub message: SignalMessage,
}

impl Envelope {
    pub fn new(
        sid: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        message: SignalMessage,
    ) -> Self {
        Self {
            sid: sid.into(),
            from: from.into(),
            to: to.into(),
            message,
        }
    }

    /// The key under which the recipient tracks this transfer.
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.sid, &self.from)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Negotiation and in-band data messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Sender proposes a file and the transport methods it supports.
    Offer { file: FileOffer, methods: Vec<Method> },
    /// Receiver accepts with the methods both sides will walk, in order.
    Accept { methods: Vec<Method> },
    /// Receiver declined the offer.
    Decline,

    /// Sender lists SOCKS5 candidates, most preferred first.
    StreamhostOffer { hosts: Vec<Streamhost> },
    /// Receiver connected through the named streamhost.
    StreamhostUsed { jid: String },
    /// Receiver could not connect to any candidate.
    StreamhostFailed,

    /// Sender advertises the relay endpoint and handshake nonce (hex).
    #[serde(rename_all = "camelCase")]
    RelayOffer {
        host: String,
        port: u16,
        session: u32,
        nonce: String,
    },
    /// Either side gave up on the relay tier.
    RelayFailed,

    #[serde(rename_all = "camelCase")]
    InBandOpen { block_size: u16 },
    #[serde(rename_all = "camelCase")]
    InBandOpened { block_size: u16 },
    InBandData {
        seq: u16,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    InBandAck { seq: u16 },
    InBandClose,

    /// The peer aborted the transfer.
    Cancel {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
    },
}

impl SignalMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Accept { .. } => "accept",
            SignalMessage::Decline => "decline",
            SignalMessage::StreamhostOffer { .. } => "streamhost_offer",
            SignalMessage::StreamhostUsed { .. } => "streamhost_used",
            SignalMessage::StreamhostFailed => "streamhost_failed",
            SignalMessage::RelayOffer { .. } => "relay_offer",
            SignalMessage::RelayFailed => "relay_failed",
            SignalMessage::InBandOpen { .. } => "in_band_open",
            SignalMessage::InBandOpened { .. } => "in_band_opened",
            SignalMessage::InBandData { .. } => "in_band_data",
            SignalMessage::InBandAck { .. } => "in_band_ack",
            SignalMessage::InBandClose => "in_band_close",
            SignalMessage::Cancel { .. } => "cancel",
        }
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
