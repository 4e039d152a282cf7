//! Relay tier: direct-connect packet framing over a single TCP connection.
//!
//! The sender listens and advertises an endpoint with a session id and a
//! nonce. The receiver connects, sends the `foo` probe and a handshake
//! packet carrying the nonce; the sender answers with a handshake carrying
//! the SHA-1 derived response. Data then flows as messages of at most
//! [`RELAY_MAX_MESSAGE`] bytes, each split into packets and acknowledged
//! once the receiver has consumed it.
//!
//! A liveness timer covers the whole connection: a full window without
//! traffic in either direction ends it.

use std::fmt;
use std::sync::Arc;

use peerxfer_protocol::relay::{self, MAX_BODY_LEN, NONCE_LEN, Packet, PacketHeader};
use peerxfer_protocol::{ProtocolError, SignalMessage};
use peerxfer_transfer::{
    BoundedQueue, BoxedStream, ByteRing, LivenessTimer, OpsFuture, TransferError, Transport, Xfer, XferOps,
    XferType, with_deadline,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};

use crate::context::NegotiatorContext;
use crate::error::DataChannelError;
use crate::net::connect_with_timeout;
use crate::nonce::{generate_nonce, generate_session_id, nonce_response, parse_nonce, validate_nonce};
use crate::RELAY_MAX_MESSAGE;

/// How far a relay connection has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Closed,
    /// The `foo` probe has been exchanged.
    FooSent,
    /// The initiator's handshake packet has been exchanged.
    Handshake,
    Established,
}

impl fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayPhase::Closed => "closed",
            RelayPhase::FooSent => "foo-sent",
            RelayPhase::Handshake => "handshake",
            RelayPhase::Established => "established",
        };
        f.write_str(name)
    }
}

struct RelayConnection {
    stream: BoxedStream,
    session_id: u32,
    phase: RelayPhase,
    timer: LivenessTimer,
    /// Id of the next outgoing message. Acks take the following id.
    next_id: u32,
    /// Packets of the message being sent, written one at a time.
    outbound: BoundedQueue<Packet>,
    inbound: ByteRing,
    /// Header of the last fully received message, acked once drained.
    pending_ack: Option<PacketHeader>,
    eof: bool,
}

impl RelayConnection {
    fn new(stream: BoxedStream, session_id: u32, timer: LivenessTimer) -> Self {
        Self {
            stream,
            session_id,
            phase: RelayPhase::Closed,
            timer,
            next_id: 1,
            outbound: BoundedQueue::new(RELAY_MAX_MESSAGE.div_ceil(MAX_BODY_LEN)),
            inbound: ByteRing::new(RELAY_MAX_MESSAGE),
            pending_ack: None,
            eof: false,
        }
    }

    fn idle_error(&self) -> DataChannelError {
        DataChannelError::Timeout(format!(
            "relay connection idle for {}s",
            self.timer.window().as_secs()
        ))
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), DataChannelError> {
        relay::write_packet(&mut self.stream, packet).await?;
        self.timer.touch();
        Ok(())
    }

    async fn receive(&mut self) -> Result<Packet, DataChannelError> {
        let packet = tokio::select! {
            biased;
            _ = self.timer.expired() => return Err(self.idle_error()),
            packet = relay::read_packet(&mut self.stream) => packet?,
        };
        self.timer.touch();
        Ok(packet)
    }

    /// Initiator side: probe, handshake with `nonce`, check the response.
    async fn initiate(&mut self, nonce: &[u8; NONCE_LEN]) -> Result<(), DataChannelError> {
        relay::write_foo(&mut self.stream).await?;
        self.timer.touch();
        self.phase = RelayPhase::FooSent;

        let mut hello = PacketHeader::handshake(nonce);
        hello.session_id = self.session_id;
        self.send(&Packet::control(hello)).await?;
        self.phase = RelayPhase::Handshake;

        let reply = self.receive().await?;
        check_handshake(&reply.header, self.session_id, &nonce_response(nonce))?;
        self.phase = RelayPhase::Established;
        Ok(())
    }

    /// Responder side: expect the probe and a handshake with `nonce`, answer
    /// with the derived response.
    async fn respond(&mut self, nonce: &[u8; NONCE_LEN]) -> Result<(), DataChannelError> {
        tokio::select! {
            biased;
            _ = self.timer.expired() => return Err(self.idle_error()),
            probe = relay::read_foo(&mut self.stream) => probe?,
        }
        self.timer.touch();
        self.phase = RelayPhase::FooSent;

        let hello = self.receive().await?;
        check_handshake(&hello.header, self.session_id, nonce)?;
        self.phase = RelayPhase::Handshake;

        let mut reply = PacketHeader::handshake(&nonce_response(nonce));
        reply.session_id = self.session_id;
        self.send(&Packet::control(reply)).await?;
        self.phase = RelayPhase::Established;
        Ok(())
    }

    /// Sends one message and waits for its acknowledgement.
    async fn send_message(&mut self, data: &[u8]) -> Result<(), DataChannelError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(2);
        self.outbound.clear();
        for packet in relay::split_message(self.session_id, id, data, MAX_BODY_LEN) {
            if self.outbound.push(packet).is_err() {
                return Err(DataChannelError::Protocol(ProtocolError::BodyTooLarge(data.len())));
            }
        }
        while let Some(packet) = self.outbound.pop() {
            self.send(&packet).await?;
        }
        loop {
            let packet = self.receive().await?;
            self.check_session(&packet.header)?;
            if packet.header.is_ack() && packet.header.ack_id == id {
                trace!(id, bytes = data.len(), "relay message acknowledged");
                return Ok(());
            }
            trace!(id = packet.header.id, flags = packet.header.flags, "ignoring relay packet while awaiting ack");
        }
    }

    /// Reads packets until one whole message sits in the inbound buffer.
    /// Returns `false` on a clean end of stream between messages.
    async fn receive_message(&mut self) -> Result<bool, DataChannelError> {
        let mut current: Option<PacketHeader> = None;
        loop {
            let packet = match self.receive().await {
                Ok(packet) => packet,
                Err(DataChannelError::Protocol(ProtocolError::Io(e)))
                    if current.is_none() && e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            let header = packet.header;
            self.check_session(&header)?;
            if header.is_ack() || header.is_handshake() {
                trace!(id = header.id, "ignoring control packet between messages");
                continue;
            }

            let expected_offset = match &current {
                Some(first) if first.id != header.id => {
                    return Err(violation(format!(
                        "message {} interrupted by message {}",
                        first.id, header.id
                    )));
                }
                Some(_) => self.inbound.len() as u64,
                None => 0,
            };
            if header.offset != expected_offset {
                return Err(violation(format!(
                    "packet offset {} where {expected_offset} was expected",
                    header.offset
                )));
            }
            if header.total_size == 0 {
                return Err(violation(format!("empty relay message {}", header.id)));
            }
            match &current {
                Some(first) if first.total_size != header.total_size => {
                    return Err(violation(format!(
                        "message {} changed size from {} to {}",
                        header.id, first.total_size, header.total_size
                    )));
                }
                _ => {}
            }
            if header.offset + u64::from(header.length) > header.total_size {
                return Err(violation(format!(
                    "packet ends at {} past the {} byte message",
                    header.offset + u64::from(header.length),
                    header.total_size
                )));
            }
            if header.total_size > RELAY_MAX_MESSAGE as u64 {
                return Err(violation(format!(
                    "message of {} bytes exceeds the {RELAY_MAX_MESSAGE} byte limit",
                    header.total_size
                )));
            }
            self.inbound
                .push(&packet.body)
                .map_err(|e| violation(e.to_string()))?;

            if header.offset + header.length as u64 >= header.total_size {
                self.pending_ack = Some(header);
                return Ok(true);
            }
            current = Some(header);
        }
    }

    fn check_session(&self, header: &PacketHeader) -> Result<(), DataChannelError> {
        if header.session_id != self.session_id {
            return Err(violation(format!(
                "packet for session {} on relay session {}",
                header.session_id, self.session_id
            )));
        }
        Ok(())
    }
}

fn violation(reason: String) -> DataChannelError {
    DataChannelError::Protocol(ProtocolError::Malformed(reason))
}

fn check_handshake(
    header: &PacketHeader,
    session_id: u32,
    expected: &[u8; NONCE_LEN],
) -> Result<(), DataChannelError> {
    if !header.is_handshake() {
        return Err(violation(format!("expected handshake, got flags {:#x}", header.flags)));
    }
    if header.session_id != session_id {
        return Err(violation(format!(
            "handshake for session {}, expected {session_id}",
            header.session_id
        )));
    }
    if !validate_nonce(&header.nonce(), expected) {
        return Err(violation("handshake nonce mismatch".into()));
    }
    Ok(())
}

/// Failures once data is flowing end the transfer and blame the peer.
fn data_error(err: DataChannelError) -> TransferError {
    match err {
        DataChannelError::Timeout(what) => TransferError::Timeout(what),
        DataChannelError::Protocol(ProtocolError::Io(e)) => {
            TransferError::Remote(format!("relay connection lost: {e}"))
        }
        other => TransferError::Remote(other.to_string()),
    }
}

pub struct RelayNegotiator {
    ctx: NegotiatorContext,
    conn: tokio::sync::Mutex<Option<RelayConnection>>,
}

impl RelayNegotiator {
    pub fn new(ctx: NegotiatorContext) -> Self {
        Self {
            ctx,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn phase(&self) -> RelayPhase {
        self.conn
            .lock()
            .await
            .as_ref()
            .map_or(RelayPhase::Closed, |conn| conn.phase)
    }

    /// Reports the tier as failed to the peer and returns the fallback error.
    async fn give_up(&self, xfer: &Arc<Xfer>, reason: String) -> TransferError {
        warn!(key = %xfer.key(), %reason, "relay failed");
        if let Err(e) = self.ctx.signal(xfer, SignalMessage::RelayFailed).await {
            debug!(key = %xfer.key(), error = %e, "could not report relay failure");
        }
        TransferError::TransportFailed(reason)
    }

    async fn negotiate_send(&self, xfer: &Arc<Xfer>) -> Result<(), TransferError> {
        let config = &self.ctx.config;
        let (mut listener, bound) = match self
            .ctx
            .network
            .listen(&config.listen_host, config.relay_listen_port)
            .await
        {
            Ok(bound) => bound,
            Err(e) => return Err(self.give_up(xfer, format!("cannot open relay listener: {e}")).await),
        };
        let (host, port) = match &config.relay {
            Some(endpoint) => (endpoint.host.clone(), endpoint.port),
            None => self.ctx.port_mapper.map(bound),
        };
        let session_id = generate_session_id();
        let nonce = generate_nonce();

        info!(key = %xfer.key(), %host, port, session_id, "offering relay");
        self.ctx
            .signal(
                xfer,
                SignalMessage::RelayOffer {
                    host,
                    port,
                    session: session_id,
                    nonce: hex::encode(nonce),
                },
            )
            .await?;

        let window = config.relay_liveness();
        let (stream, peer_addr) = tokio::select! {
            biased;
            failed = xfer.wait_signal(|m| matches!(m, SignalMessage::RelayFailed)) => {
                failed?;
                return Err(TransferError::TransportFailed("peer could not reach the relay".into()));
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => return Err(self.give_up(xfer, format!("relay accept failed: {e}")).await),
            },
            _ = tokio::time::sleep(window) => {
                return Err(self.give_up(xfer, format!("no relay connection within {}s", window.as_secs())).await);
            }
        };
        drop(listener);
        debug!(key = %xfer.key(), addr = %peer_addr, "relay connection accepted");

        let mut conn = RelayConnection::new(stream, session_id, LivenessTimer::start(window));
        let handshake = tokio::select! {
            biased;
            failed = xfer.wait_signal(|m| matches!(m, SignalMessage::RelayFailed)) => {
                failed?;
                return Err(TransferError::TransportFailed("peer abandoned the relay".into()));
            }
            result = conn.respond(&nonce) => result,
        };
        if let Err(e) = handshake {
            let reason = format!("relay handshake failed in phase {}: {e}", conn.phase);
            return Err(self.give_up(xfer, reason).await);
        }

        *self.conn.lock().await = Some(conn);
        xfer.start(Transport::Negotiated, Some(peer_addr)).await
    }

    async fn negotiate_receive(&self, xfer: &Arc<Xfer>) -> Result<(), TransferError> {
        let config = &self.ctx.config;
        let offer = with_deadline(
            "waiting for relay offer",
            config.negotiation_timeout(),
            xfer.wait_signal(|m| {
                matches!(m, SignalMessage::RelayOffer { .. } | SignalMessage::RelayFailed)
            }),
        )
        .await??;
        let SignalMessage::RelayOffer {
            host,
            port,
            session,
            nonce,
        } = offer
        else {
            return Err(TransferError::TransportFailed("peer could not open a relay".into()));
        };
        let Some(nonce) = parse_nonce(&nonce) else {
            return Err(self.give_up(xfer, format!("malformed relay nonce {nonce:?}")).await);
        };

        debug!(key = %xfer.key(), %host, port, session, "connecting to relay");
        let stream =
            match connect_with_timeout(self.ctx.network.as_ref(), &host, port, config.connect_timeout())
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    return Err(self.give_up(xfer, format!("cannot reach relay {host}:{port}: {e}")).await);
                }
            };

        let mut conn = RelayConnection::new(stream, session, LivenessTimer::start(config.relay_liveness()));
        let handshake = tokio::select! {
            biased;
            failed = xfer.wait_signal(|m| matches!(m, SignalMessage::RelayFailed)) => {
                failed?;
                return Err(TransferError::TransportFailed("peer abandoned the relay".into()));
            }
            result = conn.initiate(&nonce) => result,
        };
        if let Err(e) = handshake {
            let reason = format!("relay handshake failed in phase {}: {e}", conn.phase);
            return Err(self.give_up(xfer, reason).await);
        }

        *self.conn.lock().await = Some(conn);
        let addr = format!("{host}:{port}").parse().ok();
        xfer.start(Transport::Negotiated, addr).await
    }

    async fn close(&self, xfer: &Arc<Xfer>) {
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            conn.timer.cancel();
            if let Err(e) = conn.stream.shutdown().await {
                debug!(key = %xfer.key(), error = %e, "relay shutdown failed");
            }
        }
    }
}

impl XferOps for RelayNegotiator {
    fn init<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            match xfer.xfer_type() {
                XferType::Send => self.negotiate_send(xfer).await,
                XferType::Receive => self.negotiate_receive(xfer).await,
            }
        })
    }

    fn read<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        buf: &'a mut [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(TransferError::Cancelled)?;
            if conn.inbound.is_empty() {
                if conn.eof {
                    return Ok(0);
                }
                if !conn.receive_message().await.map_err(data_error)? {
                    return Ok(0);
                }
            }
            Ok(conn.inbound.drain_into(buf))
        })
    }

    fn write<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        data: &'a [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(TransferError::Cancelled)?;
            if data.is_empty() {
                return Ok(0);
            }
            let len = data.len().min(RELAY_MAX_MESSAGE);
            conn.send_message(&data[..len]).await.map_err(data_error)?;
            Ok(len)
        })
    }

    fn ack<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        _data: &'a [u8],
    ) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let Some(conn) = guard.as_mut() else {
                return Ok(());
            };
            if !conn.inbound.is_empty() {
                return Ok(());
            }
            if let Some(header) = conn.pending_ack.take() {
                conn.send(&Packet::control(PacketHeader::ack_for(&header)))
                    .await
                    .map_err(data_error)?;
            }
            Ok(())
        })
    }

    fn end<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(self.close(xfer))
    }

    fn cancel_send<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(self.close(xfer))
    }

    fn cancel_recv<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(self.close(xfer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn pair(session_id: u32) -> (RelayConnection, RelayConnection) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let window = Duration::from_secs(30);
        (
            RelayConnection::new(Box::new(a), session_id, LivenessTimer::start(window)),
            RelayConnection::new(Box::new(b), session_id, LivenessTimer::start(window)),
        )
    }

    #[tokio::test]
    async fn handshake_establishes_both_sides() {
        let (mut initiator, mut responder) = pair(77);
        let nonce = generate_nonce();
        let (a, b) = tokio::join!(initiator.initiate(&nonce), responder.respond(&nonce));
        a.unwrap();
        b.unwrap();
        assert_eq!(initiator.phase, RelayPhase::Established);
        assert_eq!(responder.phase, RelayPhase::Established);
    }

    #[tokio::test]
    async fn wrong_nonce_fails_after_probe() {
        let (mut initiator, mut responder) = pair(77);
        let responder = tokio::spawn(async move {
            let result = responder.respond(&generate_nonce()).await;
            (result, responder.phase)
        });
        // The responder hangs up without answering.
        assert!(initiator.initiate(&generate_nonce()).await.is_err());
        assert_eq!(initiator.phase, RelayPhase::Handshake);

        let (result, phase) = responder.await.unwrap();
        assert!(result.is_err());
        assert_eq!(phase, RelayPhase::FooSent);
    }

    #[tokio::test]
    async fn session_mismatch_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let window = Duration::from_secs(30);
        let mut initiator = RelayConnection::new(Box::new(a), 1, LivenessTimer::start(window));
        let mut responder = RelayConnection::new(Box::new(b), 2, LivenessTimer::start(window));
        let nonce = generate_nonce();
        let responder = tokio::spawn(async move { responder.respond(&nonce).await });

        assert!(initiator.initiate(&nonce).await.is_err());
        assert!(matches!(
            responder.await.unwrap(),
            Err(DataChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn message_is_split_acked_and_reassembled() {
        let (mut sender, mut receiver) = pair(9);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let receive = async {
            assert!(receiver.receive_message().await.unwrap());
            let mut out = vec![0u8; 8192];
            let n = receiver.inbound.drain_into(&mut out);
            let header = receiver.pending_ack.take().unwrap();
            receiver
                .send(&Packet::control(PacketHeader::ack_for(&header)))
                .await
                .unwrap();
            out.truncate(n);
            out
        };
        let (sent, received) = tokio::join!(sender.send_message(&data), receive);
        sent.unwrap();
        assert_eq!(received, data);
        assert_eq!(sender.next_id, 3);
    }

    #[tokio::test]
    async fn oversized_message_never_reaches_the_wire() {
        let (mut sender, receiver) = pair(9);
        let data = vec![0u8; 2 * RELAY_MAX_MESSAGE];
        assert!(matches!(
            sender.send_message(&data).await,
            Err(DataChannelError::Protocol(ProtocolError::BodyTooLarge(_)))
        ));
        drop(sender);
        let mut receiver = receiver;
        assert!(!receiver.receive_message().await.unwrap());
    }

    #[tokio::test]
    async fn clean_eof_between_messages() {
        let (sender, mut receiver) = pair(9);
        drop(sender);
        assert!(!receiver.receive_message().await.unwrap());
        assert!(receiver.eof);
    }

    #[tokio::test]
    async fn foreign_session_packet_is_violation() {
        let (mut sender, mut receiver) = pair(9);
        let packets = relay::split_message(10, 1, b"hello", MAX_BODY_LEN);
        sender.send(&packets[0]).await.unwrap();
        assert!(matches!(
            receiver.receive_message().await,
            Err(DataChannelError::Protocol(ProtocolError::Malformed(_)))
        ));
    }

    fn data_packet(id: u32, offset: u64, total_size: u64, body: Vec<u8>) -> Packet {
        Packet {
            header: PacketHeader {
                session_id: 9,
                id,
                offset,
                total_size,
                length: body.len() as u32,
                flags: relay::FLAG_FILE_DATA,
                ..Default::default()
            },
            body,
        }
    }

    #[tokio::test]
    async fn packet_past_message_end_is_violation() {
        let (mut sender, mut receiver) = pair(9);
        sender.send(&data_packet(1, 0, 10, vec![0; 1000])).await.unwrap();
        assert!(matches!(
            receiver.receive_message().await,
            Err(DataChannelError::Protocol(ProtocolError::Malformed(_)))
        ));
        assert!(receiver.inbound.is_empty());
    }

    #[tokio::test]
    async fn empty_message_is_violation() {
        let (mut sender, mut receiver) = pair(9);
        sender.send(&data_packet(1, 0, 0, Vec::new())).await.unwrap();
        assert!(matches!(
            receiver.receive_message().await,
            Err(DataChannelError::Protocol(ProtocolError::Malformed(_)))
        ));
        assert!(receiver.pending_ack.is_none());
    }

    #[tokio::test]
    async fn message_size_must_not_change_midway() {
        let (mut sender, mut receiver) = pair(9);
        sender.send(&data_packet(1, 0, 3000, vec![1; 1352])).await.unwrap();
        sender.send(&data_packet(1, 1352, 1400, vec![2; 48])).await.unwrap();
        assert!(matches!(
            receiver.receive_message().await,
            Err(DataChannelError::Protocol(ProtocolError::Malformed(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let (_keep, stream): (DuplexStream, DuplexStream) = tokio::io::duplex(64);
        let mut conn =
            RelayConnection::new(Box::new(stream), 1, LivenessTimer::start(Duration::from_secs(30)));
        let result = conn.respond(&generate_nonce()).await;
        assert!(matches!(result, Err(DataChannelError::Timeout(_))));
        assert_eq!(conn.phase, RelayPhase::Closed);
    }

    #[tokio::test]
    async fn probe_bytes_on_the_wire() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut conn =
            RelayConnection::new(Box::new(a), 5, LivenessTimer::start(Duration::from_secs(30)));
        let nonce = [7u8; NONCE_LEN];
        let initiate = tokio::spawn(async move {
            let _ = conn.initiate(&nonce).await;
        });
        let mut probe = [0u8; 8];
        b.read_exact(&mut probe).await.unwrap();
        assert_eq!(probe, relay::FOO_PACKET);
        let hello = relay::read_packet(&mut b).await.unwrap();
        assert!(hello.header.is_handshake());
        assert_eq!(hello.header.session_id, 5);
        assert_eq!(hello.header.nonce(), nonce);
        drop(b);
        initiate.await.unwrap();
    }
}
