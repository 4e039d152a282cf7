use std::fmt;

use serde::{Deserialize, Serialize};

/// Correlation key for a transfer: the stream session id plus the remote
/// peer's identity. Both sides key their transfers by the *remote* peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub session_id: String,
    pub peer: String,
}

impl SessionKey {
    pub fn new(session_id: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            peer: peer.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.session_id)
    }
}

/// A candidate endpoint a peer may use to establish a direct or proxied
/// bytestream socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Streamhost {
    /// Identity of the entity running the streamhost (a peer or a proxy).
    pub jid: String,
    pub host: String,
    pub port: u16,
    /// Zeroconf (link-local) service name, when the host was discovered that way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zeroconf: Option<String>,
}

impl Streamhost {
    pub fn new(jid: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            jid: jid.into(),
            host: host.into(),
            port,
            zeroconf: None,
        }
    }
}

/// Transport method tiers, listed in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Method {
    /// SOCKS5 bytestreams over a direct or proxied socket.
    #[serde(rename = "bytestreams")]
    Bytestreams,
    /// Length-prefixed direct-connect framing through a relay.
    #[serde(rename = "relay")]
    Relay,
    /// Data tunnelled through the signaling channel.
    #[serde(rename = "in-band")]
    InBand,
}

impl Method {
    /// Every tier, most preferred first.
    pub const FALLBACK_ORDER: [Method; 3] = [Method::Bytestreams, Method::Relay, Method::InBand];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Bytestreams => "bytestreams",
            Method::Relay => "relay",
            Method::InBand => "in-band",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes the tiers both sides will walk: the intersection of the
/// offered and locally supported methods, in fallback order.
pub fn agree_methods(offered: &[Method], supported: &[Method]) -> Vec<Method> {
    Method::FALLBACK_ORDER
        .into_iter()
        .filter(|m| offered.contains(m) && supported.contains(m))
        .collect()
}

/// Description of the file being offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOffer {
    pub name: String,
    /// Size in bytes; 0 means unknown (receive until EOF).
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}
