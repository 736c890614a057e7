//! Session handshake messages
//!
//! Right after the TCP connect both ends exchange length-delimited bincode
//! messages to prove possession of their keys:
//!
//! 1. client -> [`HandshakeMessage::ClientHello`]
//! 2. server -> [`HandshakeMessage::ServerHello`], signing [`server_proof`]
//! 3. client -> [`HandshakeMessage::ClientAuth`], signing [`client_proof`]
//! 4. server -> [`HandshakeMessage::ServerAccept`] or [`HandshakeMessage::Rejected`]
//!
//! Once accepted, both sides switch the connection over to [`crate::FrameCodec`].

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::cipher::{PubKey, Sig};
use crate::error::ProtocolError;

/// Protocol version exchanged in the hellos
pub const PROTOCOL_VERSION: &str = "1.0";

/// Largest accepted handshake message
pub const MAX_HANDSHAKE_MESSAGE: usize = 4096;

/// Length of handshake nonces
pub const NONCE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    ClientHello {
        version: String,
        pk: PubKey,
        nonce: [u8; NONCE_LEN],
    },
    ServerHello {
        version: String,
        pk: PubKey,
        nonce: [u8; NONCE_LEN],
        sig: Sig,
    },
    ClientAuth {
        sig: Sig,
    },
    ServerAccept,
    Rejected {
        code: u16,
    },
}

impl HandshakeMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientHello { .. } => "client_hello",
            Self::ServerHello { .. } => "server_hello",
            Self::ClientAuth { .. } => "client_auth",
            Self::ServerAccept => "server_accept",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Bytes the server signs in its hello
pub fn server_proof(
    client_nonce: &[u8; NONCE_LEN],
    server_nonce: &[u8; NONCE_LEN],
    client_pk: &PubKey,
) -> Vec<u8> {
    proof(b"server", client_nonce, server_nonce, client_pk)
}

/// Bytes the client signs in its auth message
pub fn client_proof(
    server_nonce: &[u8; NONCE_LEN],
    client_nonce: &[u8; NONCE_LEN],
    server_pk: &PubKey,
) -> Vec<u8> {
    proof(b"client", server_nonce, client_nonce, server_pk)
}

fn proof(label: &[u8], first: &[u8], second: &[u8], pk: &PubKey) -> Vec<u8> {
    let mut buf = Vec::with_capacity(label.len() + NONCE_LEN * 2 + pk.as_bytes().len());
    buf.extend_from_slice(label);
    buf.extend_from_slice(first);
    buf.extend_from_slice(second);
    buf.extend_from_slice(pk.as_bytes());
    buf
}

/// Fresh random nonce
pub fn nonce() -> [u8; NONCE_LEN] {
    rand::random()
}

/// Codec for handshake messages: u32 length prefix + bincode body
#[derive(Debug)]
pub struct HandshakeCodec {
    inner: LengthDelimitedCodec,
}

impl HandshakeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_HANDSHAKE_MESSAGE)
                .new_codec(),
        }
    }
}

impl Default for HandshakeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HandshakeCodec {
    type Item = HandshakeMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(body) => Ok(Some(bincode::deserialize(&body)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<HandshakeMessage> for HandshakeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: HandshakeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::serialize(&msg)?;
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::generate_keypair;

    #[test]
    fn test_handshake_codec() {
        let (pk, sk) = generate_keypair();
        let client_nonce = nonce();
        let server_nonce = nonce();
        let msg = HandshakeMessage::ServerHello {
            version: PROTOCOL_VERSION.to_string(),
            pk,
            nonce: server_nonce,
            sig: sk.sign(&server_proof(&client_nonce, &server_nonce, &pk)),
        };

        let mut codec = HandshakeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        codec.encode(HandshakeMessage::ServerAccept, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(HandshakeMessage::ServerAccept)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_proofs_are_direction_bound() {
        let (pk, _) = generate_keypair();
        let a = nonce();
        let b = nonce();
        assert_ne!(server_proof(&a, &b, &pk), client_proof(&a, &b, &pk));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut codec = HandshakeCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_HANDSHAKE_MESSAGE as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
