//! The SOCKS5 subset used by bytestream negotiation.
//!
//! Only version 5, the "no authentication" method and CONNECT with a
//! domain-name address are supported. The "domain name" is the 40-character
//! hex SHA-1 of `session_id + initiator + target`, and the port is always 0.
//!
//! ```text
//! GREETING (client):  [0x05] [n_methods] [methods...]
//! SELECTION (server): [0x05] [method]            method 0xFF = none acceptable
//! REQUEST (client):   [0x05] [0x01] [0x00] [0x03] [len] [hash] [0x00 0x00]
//! REPLY (server):     [0x05] [rep]  [0x00] [0x03] [len] [hash] [0x00 0x00]
//! ```

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Computes the hashed destination address for a bytestream session.
pub fn destination_hash(session_id: &str, initiator: &str, target: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(session_id.as_bytes());
    hasher.update(initiator.as_bytes());
    hasher.update(target.as_bytes());
    hex::encode(hasher.finalize())
}

/// A CONNECT request or reply with a domain-name address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectMessage {
    /// Command for requests, reply code for replies.
    pub code: u8,
    pub address: String,
    pub port: u16,
}

impl ConnectMessage {
    pub fn request(address: impl Into<String>) -> Self {
        Self {
            code: CMD_CONNECT,
            address: address.into(),
            port: 0,
        }
    }

    pub fn reply(code: u8, address: impl Into<String>) -> Self {
        Self {
            code,
            address: address.into(),
            port: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let addr = self.address.as_bytes();
        if addr.len() > u8::MAX as usize {
            return Err(ProtocolError::Malformed(format!(
                "domain name too long: {} bytes",
                addr.len()
            )));
        }
        let mut buf = Vec::with_capacity(7 + addr.len());
        buf.extend_from_slice(&[VERSION, self.code, 0x00, ATYP_DOMAIN, addr.len() as u8]);
        buf.extend_from_slice(addr);
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(buf)
    }

    /// Reads a request or reply; the address type must be a domain name.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut head = [0u8; 4];
        reader.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(ProtocolError::UnsupportedVersion(head[0]));
        }
        if head[3] != ATYP_DOMAIN {
            return Err(ProtocolError::Malformed(format!(
                "unsupported address type {:#04x}",
                head[3]
            )));
        }
        let len = reader.read_u8().await? as usize;
        let mut addr = vec![0u8; len];
        reader.read_exact(&mut addr).await?;
        let port = reader.read_u16().await?;
        let address = String::from_utf8(addr)
            .map_err(|e| ProtocolError::Malformed(format!("invalid domain name: {e}")))?;
        Ok(Self {
            code: head[1],
            address,
            port,
        })
    }
}

/// Runs the client side of the handshake (the peer connecting to a streamhost).
///
/// Succeeds only if the streamhost selects "no authentication", answers the
/// CONNECT with success and echoes the expected hash.
pub async fn client_handshake<S>(stream: &mut S, dst_hash: &str) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?;
    stream.flush().await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != VERSION {
        return Err(ProtocolError::UnsupportedVersion(selection[0]));
    }
    if selection[1] != METHOD_NO_AUTH {
        return Err(ProtocolError::NoAcceptableMethod);
    }

    stream
        .write_all(&ConnectMessage::request(dst_hash).encode()?)
        .await?;
    stream.flush().await?;

    let reply = ConnectMessage::read_from(stream).await?;
    if reply.code != REP_SUCCEEDED {
        return Err(ProtocolError::RequestFailed(reply.code));
    }
    if reply.address != dst_hash {
        return Err(ProtocolError::HashMismatch);
    }
    Ok(())
}

/// Runs the server side of the handshake (a local streamhost accepting a peer).
///
/// A CONNECT naming any address other than `expected_hash` is refused and
/// reported as [`ProtocolError::HashMismatch`].
pub async fn server_handshake<S>(stream: &mut S, expected_hash: &str) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != VERSION {
        return Err(ProtocolError::UnsupportedVersion(greeting[0]));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        stream.flush().await?;
        return Err(ProtocolError::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;

    let request = match ConnectMessage::read_from(stream).await {
        Ok(r) => r,
        Err(ProtocolError::Malformed(reason)) => {
            write_reply(stream, REP_ADDRESS_NOT_SUPPORTED, "").await?;
            return Err(ProtocolError::Malformed(reason));
        }
        Err(e) => return Err(e),
    };
    if request.code != CMD_CONNECT {
        write_reply(stream, REP_COMMAND_NOT_SUPPORTED, "").await?;
        return Err(ProtocolError::Malformed(format!(
            "unsupported command {:#04x}",
            request.code
        )));
    }
    if request.address != expected_hash {
        write_reply(stream, REP_NOT_ALLOWED, "").await?;
        return Err(ProtocolError::HashMismatch);
    }

    write_reply(stream, REP_SUCCEEDED, expected_hash).await
}

async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: u8,
    address: &str,
) -> Result<(), ProtocolError> {
    writer
        .write_all(&ConnectMessage::reply(code, address).encode()?)
        .await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_hash_is_hex_sha1() {
        let hash = destination_hash("sid", "alice@a/x", "bob@b/y");
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, destination_hash("sid", "bob@b/y", "alice@a/x"));
    }

    #[test]
    fn known_hash_vector() {
        // SHA-1("abc")
        assert_eq!(
            destination_hash("a", "b", "c"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn connect_request_layout() {
        let hash = "a9993e364706816aba3e25717850c26c9cd0d89d";
        let bytes = ConnectMessage::request(hash).encode().unwrap();
        assert_eq!(&bytes[..5], &[0x05, 0x01, 0x00, 0x03, 40]);
        assert_eq!(&bytes[5..45], hash.as_bytes());
        assert_eq!(&bytes[45..], &[0, 0]);
    }

    #[tokio::test]
    async fn handshake_succeeds_with_matching_hash() {
        let hash = destination_hash("s", "i", "t");
        let (mut client, mut server) = tokio::io::duplex(256);
        let expected = hash.clone();
        let server_task =
            tokio::spawn(async move { server_handshake(&mut server, &expected).await });
        client_handshake(&mut client, &hash).await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_hash() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let server_task = tokio::spawn(async move {
            server_handshake(&mut server, &destination_hash("s", "i", "t")).await
        });
        let client_result = client_handshake(&mut client, &destination_hash("x", "i", "t")).await;
        assert!(matches!(
            client_result,
            Err(ProtocolError::RequestFailed(REP_NOT_ALLOWED))
        ));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(ProtocolError::HashMismatch)
        ));
    }

    #[tokio::test]
    async fn server_refuses_authenticated_only_client() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let server_task =
            tokio::spawn(async move { server_handshake(&mut server, "unused").await });
        // Offer only username/password (0x02).
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [VERSION, METHOD_NONE_ACCEPTABLE]);
        assert!(matches!(
            server_task.await.unwrap(),
            Err(ProtocolError::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn client_rejects_socks4_server() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x04, 0x00]).await.unwrap();
        });
        assert!(matches!(
            client_handshake(&mut client, "h").await,
            Err(ProtocolError::UnsupportedVersion(0x04))
        ));
    }
}
