//! Direct-connect binary framing used by the relay transport.
//!
//! # Wire format
//!
//! ```text
//! FOO PROBE:  [4 bytes LE: 4] ["foo\0"]
//!
//! PACKET:     [4 bytes LE: packet_len = 48 + body_len]
//!             [48-byte header, all fields little-endian]
//!             [body_len bytes, at most 1352]
//!
//! HEADER:     0  session_id  u32     28 flags       u32
//!             4  id          u32     32 ack_id      u32
//!             8  offset      u64     36 ack_sub_id  u32
//!             16 total_size  u64     40 ack_size    u64
//!             24 length      u32
//! ```
//!
//! Handshake packets are header-only with [`FLAG_HANDSHAKE`] set and the
//! 16-byte nonce occupying the ack fields (bytes 32..48).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 48;

/// Largest body carried by a single packet.
pub const MAX_BODY_LEN: usize = 1352;

/// Liveness probe sent before the handshake.
pub const FOO_PACKET: [u8; 8] = [4, 0, 0, 0, b'f', b'o', b'o', 0];

pub const FLAG_NONE: u32 = 0;
pub const FLAG_ACK: u32 = 0x02;
pub const FLAG_HANDSHAKE: u32 = 0x100;
pub const FLAG_FILE_DATA: u32 = 0x0100_0030;

/// Handshake nonce length.
pub const NONCE_LEN: usize = 16;

/// The fixed 48-byte packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub session_id: u32,
    pub id: u32,
    pub offset: u64,
    pub total_size: u64,
    pub length: u32,
    pub flags: u32,
    pub ack_id: u32,
    pub ack_sub_id: u32,
    pub ack_size: u64,
}

impl PacketHeader {
    /// Builds a header-only handshake packet carrying `nonce`.
    pub fn handshake(nonce: &[u8; NONCE_LEN]) -> Self {
        let mut header = PacketHeader {
            flags: FLAG_HANDSHAKE,
            ..Default::default()
        };
        header.set_nonce(nonce);
        header
    }

    /// Builds the acknowledgement for a received data header.
    pub fn ack_for(data: &PacketHeader) -> Self {
        PacketHeader {
            session_id: data.session_id,
            id: data.id.wrapping_add(1),
            offset: 0,
            total_size: data.total_size,
            length: 0,
            flags: FLAG_ACK,
            ack_id: data.id,
            ack_sub_id: data.ack_id,
            ack_size: data.total_size,
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.flags & FLAG_HANDSHAKE != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags == FLAG_ACK
    }

    /// Stores a nonce in the ack fields.
    pub fn set_nonce(&mut self, nonce: &[u8; NONCE_LEN]) {
        self.ack_id = u32::from_le_bytes([nonce[0], nonce[1], nonce[2], nonce[3]]);
        self.ack_sub_id = u32::from_le_bytes([nonce[4], nonce[5], nonce[6], nonce[7]]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&nonce[8..]);
        self.ack_size = u64::from_le_bytes(size);
    }

    /// Reads the nonce back out of the ack fields.
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.ack_id.to_le_bytes());
        nonce[4..8].copy_from_slice(&self.ack_sub_id.to_le_bytes());
        nonce[8..].copy_from_slice(&self.ack_size.to_le_bytes());
        nonce
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.session_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.total_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.length.to_le_bytes());
        buf[28..32].copy_from_slice(&self.flags.to_le_bytes());
        buf[32..36].copy_from_slice(&self.ack_id.to_le_bytes());
        buf[36..40].copy_from_slice(&self.ack_sub_id.to_le_bytes());
        buf[40..48].copy_from_slice(&self.ack_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        Ok(PacketHeader {
            session_id: u32_at(0),
            id: u32_at(4),
            offset: u64_at(8),
            total_size: u64_at(16),
            length: u32_at(24),
            flags: u32_at(28),
            ack_id: u32_at(32),
            ack_sub_id: u32_at(36),
            ack_size: u64_at(40),
        })
    }
}

/// A header plus its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Vec<u8>,
}

impl Packet {
    /// Header-only packet.
    pub fn control(header: PacketHeader) -> Self {
        Self {
            header: PacketHeader { length: 0, ..header },
            body: Vec::new(),
        }
    }

    /// Value of the 4-byte length prefix for this packet.
    pub fn declared_len(&self) -> u32 {
        (HEADER_LEN + self.body.len()) as u32
    }

    /// Encodes the packet including its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge(self.body.len()));
        }
        if self.header.length as usize != self.body.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: self.declared_len(),
                actual: HEADER_LEN as u32 + self.header.length,
            });
        }
        let mut buf = Vec::with_capacity(4 + HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.declared_len().to_le_bytes());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Decodes a complete frame (length prefix, header and body).
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < 4 {
            return Err(ProtocolError::Malformed("missing length prefix".into()));
        }
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let rest = &frame[4..];
        if rest.len() != declared as usize {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: rest.len() as u32,
            });
        }
        let header = PacketHeader::decode(rest)?;
        validate_lengths(declared, &header)?;
        Ok(Packet {
            header,
            body: rest[HEADER_LEN..].to_vec(),
        })
    }
}

/// Checks that the length prefix agrees with the header's body length.
fn validate_lengths(declared: u32, header: &PacketHeader) -> Result<(), ProtocolError> {
    let body_len = header.length as usize;
    if body_len > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge(body_len));
    }
    let expected = HEADER_LEN as u32 + header.length;
    if declared != expected {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: expected,
        });
    }
    Ok(())
}

/// Splits one application message into data packets of at most `max_body` bytes.
///
/// All packets share the message id; `offset` advances through the message and
/// `total_size` is the full message length.
pub fn split_message(session_id: u32, id: u32, data: &[u8], max_body: usize) -> Vec<Packet> {
    let max_body = max_body.clamp(1, MAX_BODY_LEN);
    let total = data.len() as u64;
    data.chunks(max_body)
        .scan(0u64, |offset, chunk| {
            let header = PacketHeader {
                session_id,
                id,
                offset: *offset,
                total_size: total,
                length: chunk.len() as u32,
                flags: FLAG_FILE_DATA,
                ..Default::default()
            };
            *offset += chunk.len() as u64;
            Some(Packet {
                header,
                body: chunk.to_vec(),
            })
        })
        .collect()
}

/// Writes the liveness probe.
pub async fn write_foo<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProtocolError> {
    writer.write_all(&FOO_PACKET).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and checks the liveness probe.
pub async fn read_foo<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), ProtocolError> {
    let mut buf = [0u8; FOO_PACKET.len()];
    reader.read_exact(&mut buf).await?;
    if buf != FOO_PACKET {
        return Err(ProtocolError::Malformed("expected foo probe".into()));
    }
    Ok(())
}

/// Writes one framed packet and flushes it.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), ProtocolError> {
    let frame = packet.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed packet, validating the declared length before reading the body.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, ProtocolError> {
    let declared = reader.read_u32_le().await?;
    if (declared as usize) < HEADER_LEN || declared as usize > HEADER_LEN + MAX_BODY_LEN {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: HEADER_LEN as u32,
        });
    }
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = PacketHeader::decode(&header_buf)?;
    validate_lengths(declared, &header)?;

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    Ok(Packet { header, body })
}
