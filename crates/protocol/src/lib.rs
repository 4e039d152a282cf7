//! Wire formats for peer-to-peer file-transfer negotiation.
//!
//! - [`signaling`]: JSON messages carried over the existing IM session.
//! - [`socks5`]: the SOCKS5 subset spoken on bytestream sockets.
//! - [`relay`]: length-prefixed direct-connect framing for relayed sockets.

pub mod error;
pub mod relay;
pub mod signaling;
pub mod socks5;
pub mod types;

pub use error::ProtocolError;
pub use signaling::{Envelope, SignalMessage};
pub use types::{FileOffer, Method, SessionKey, Streamhost, agree_methods};
