//! Collaborators shared by every negotiator of one account.

use std::sync::Arc;

use peerxfer_protocol::SignalMessage;
use peerxfer_transfer::{TransferError, Xfer};

use crate::config::NegotiationConfig;
use crate::net::{Network, NoPortMapping, PortMapper, StaticPortMapping};
use crate::signaling::Signaler;

#[derive(Clone)]
pub struct NegotiatorContext {
    pub signaler: Signaler,
    pub network: Arc<dyn Network>,
    pub port_mapper: Arc<dyn PortMapper>,
    pub config: Arc<NegotiationConfig>,
}

impl NegotiatorContext {
    /// Builds a context whose port mapping follows `config.public_host`.
    pub fn new(signaler: Signaler, network: Arc<dyn Network>, config: NegotiationConfig) -> Self {
        let port_mapper: Arc<dyn PortMapper> = match &config.public_host {
            Some(host) => Arc::new(StaticPortMapping {
                public_host: host.clone(),
            }),
            None => Arc::new(NoPortMapping),
        };
        Self {
            signaler,
            network,
            port_mapper,
            config: Arc::new(config),
        }
    }

    pub fn with_port_mapper(mut self, port_mapper: Arc<dyn PortMapper>) -> Self {
        self.port_mapper = port_mapper;
        self
    }

    pub fn local_jid(&self) -> &str {
        self.signaler.local_jid()
    }

    /// Sends `message` to the peer of `xfer`. An undeliverable message is a
    /// local failure.
    pub(crate) async fn signal(&self, xfer: &Xfer, message: SignalMessage) -> Result<(), TransferError> {
        self.signaler
            .send(xfer, message)
            .await
            .map_err(TransferError::from)
    }
}
