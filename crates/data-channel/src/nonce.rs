//! Relay handshake nonces and session ids.

use peerxfer_protocol::relay::NONCE_LEN;
use rand::Rng;
use sha1::{Digest, Sha1};

/// Generates a random 16-byte handshake nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut bytes);
    bytes
}

/// The responder's proof of knowing `nonce`: the first 16 bytes of its SHA-1.
pub fn nonce_response(nonce: &[u8; NONCE_LEN]) -> [u8; NONCE_LEN] {
    let digest = Sha1::digest(nonce);
    let mut out = [0u8; NONCE_LEN];
    out.copy_from_slice(&digest[..NONCE_LEN]);
    out
}

/// Validates a received nonce against the expected value.
///
/// Uses constant-time comparison.
pub fn validate_nonce(received: &[u8], expected: &[u8]) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.iter().zip(expected) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Parses a hex nonce as carried in a relay offer.
pub fn parse_nonce(hex_nonce: &str) -> Option<[u8; NONCE_LEN]> {
    let bytes = hex::decode(hex_nonce).ok()?;
    bytes.try_into().ok()
}

/// Random non-zero relay session id.
pub fn generate_session_id() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn response_differs_from_nonce() {
        let nonce = generate_nonce();
        let response = nonce_response(&nonce);
        assert_ne!(response, nonce);
        assert_eq!(response, nonce_response(&nonce));
    }

    #[test]
    fn response_is_sha1_prefix() {
        // SHA-1 of 16 zero bytes.
        let response = nonce_response(&[0u8; NONCE_LEN]);
        assert_eq!(hex::encode(response), "e129f27c5103bc5cc44bcdf0a15e160d");
    }

    #[test]
    fn validate_matching() {
        let nonce = generate_nonce();
        assert!(validate_nonce(&nonce, &nonce));
    }

    #[test]
    fn validate_mismatch_and_length() {
        assert!(!validate_nonce(&generate_nonce(), &generate_nonce()));
        assert!(!validate_nonce(&[1, 2], &[1, 2, 3]));
    }

    #[test]
    fn parse_roundtrip() {
        let nonce = generate_nonce();
        assert_eq!(parse_nonce(&hex::encode(nonce)), Some(nonce));
        assert_eq!(parse_nonce("abcd"), None);
        assert_eq!(parse_nonce("zz"), None);
    }

    #[test]
    fn session_id_non_zero() {
        for _ in 0..100 {
            assert_ne!(generate_session_id(), 0);
        }
    }
}
