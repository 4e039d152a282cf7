//! Transport negotiation for peer-to-peer file transfers.
//!
//! A transfer is offered over the signaling channel, then the two peers walk
//! the agreed transport tiers in order until one carries the data:
//!
//! 1. [`direct`]: SOCKS5 bytestreams through the sender's own streamhost or
//!    a proxy.
//! 2. [`relay`]: length-prefixed direct-connect framing through a relay
//!    endpoint, guarded by a liveness timer.
//! 3. [`inband`]: base64 blocks tunnelled through the signaling channel.
//!
//! [`fallback`] drives the walk and [`session`] ties an account's signaling
//! inbox to its transfers.

pub mod config;
pub mod context;
pub mod direct;
pub mod error;
pub mod fallback;
pub mod inband;
pub mod memory;
pub mod net;
pub mod nonce;
pub mod relay;
pub mod session;
pub mod signaling;

pub use config::{NegotiationConfig, RelayEndpoint};
pub use context::NegotiatorContext;
pub use direct::DirectNegotiator;
pub use error::DataChannelError;
pub use fallback::FallbackNegotiator;
pub use inband::InBandNegotiator;
pub use memory::MemoryNetwork;
pub use net::{
    Listener, NetFuture, Network, NoPortMapping, PortMapper, StaticPortMapping, TcpNetwork,
    connect_with_timeout,
};
pub use nonce::{generate_nonce, generate_session_id, nonce_response, parse_nonce, validate_nonce};
pub use relay::{RelayNegotiator, RelayPhase};
pub use session::TransferSession;
pub use signaling::{HubChannel, SignalFuture, Signaler, SignalingChannel, SignalingHub};

use std::time::Duration;

/// Time allowed to connect to one streamhost and finish its SOCKS5 handshake.
pub const STREAMHOST_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A relay connection with no traffic in either direction for this long is dead.
pub const RELAY_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for the peer to answer an in-band open or data block.
pub const IN_BAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Block size proposed when opening an in-band stream.
pub const DEFAULT_BLOCK_SIZE: u16 = 4096;

/// Largest message a relay write hook sends before waiting for its ack.
pub const RELAY_MAX_MESSAGE: usize = 64 * 1024;
