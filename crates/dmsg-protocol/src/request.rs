//! Signed OPEN and ACCEPT bodies
//!
//! OPEN layout (142 bytes):
//! `src_pk[33] src_port u16 dst_pk[33] dst_port u16 timestamp u64 sig[64]`,
//! where the signature covers the first 78 bytes.
//!
//! ACCEPT layout (96 bytes): `sha256(OPEN body)[32] sig[64]`, the signature
//! covering the hash and made by the accepting side.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::addr::Addr;
use crate::cipher::{sha256, PubKey, SecKey, Sig, PUB_KEY_LEN, SIG_LEN};
use crate::error::ProtocolError;

/// Bytes covered by the OPEN signature
pub const DIAL_REQUEST_SIGNED_LEN: usize = PUB_KEY_LEN * 2 + 2 * 2 + 8;

/// Encoded OPEN body size
pub const DIAL_REQUEST_LEN: usize = DIAL_REQUEST_SIGNED_LEN + SIG_LEN;

/// Encoded ACCEPT body size
pub const DIAL_RESPONSE_LEN: usize = 32 + SIG_LEN;

/// Request to open a stream from `src` to `dst`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub src: Addr,
    pub dst: Addr,
    /// Nanoseconds since the Unix epoch, strictly increasing per source
    pub timestamp: u64,
    pub sig: Sig,
}

impl DialRequest {
    /// Build a request signed by `sk`
    pub fn signed(src: Addr, dst: Addr, timestamp: u64, sk: &SecKey) -> Self {
        let mut req = Self {
            src,
            dst,
            timestamp,
            sig: Sig::default(),
        };
        req.sig = sk.sign(&req.signed_bytes());
        req
    }

    fn signed_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DIAL_REQUEST_LEN);
        buf.put_slice(self.src.pk.as_bytes());
        buf.put_u16(self.src.port);
        buf.put_slice(self.dst.pk.as_bytes());
        buf.put_u16(self.dst.port);
        buf.put_u64(self.timestamp);
        buf
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = self.signed_bytes();
        buf.put_slice(self.sig.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() != DIAL_REQUEST_LEN {
            return Err(ProtocolError::Malformed {
                what: "dial request",
                expected: DIAL_REQUEST_LEN,
                actual: src.len(),
            });
        }
        let src_pk = PubKey::from_slice(&src[..PUB_KEY_LEN])?;
        src.advance(PUB_KEY_LEN);
        let src_port = src.get_u16();
        let dst_pk = PubKey::from_slice(&src[..PUB_KEY_LEN])?;
        src.advance(PUB_KEY_LEN);
        let dst_port = src.get_u16();
        let timestamp = src.get_u64();
        let sig = Sig::from_slice(src)?;

        Ok(Self {
            src: Addr::new(src_pk, src_port),
            dst: Addr::new(dst_pk, dst_port),
            timestamp,
            sig,
        })
    }

    /// Check the signature against the claimed source key
    pub fn verify(&self) -> Result<(), ProtocolError> {
        self.src.pk.verify(&self.signed_bytes(), &self.sig)
    }

    /// Hash identifying this request in the matching ACCEPT
    pub fn hash(&self) -> [u8; 32] {
        sha256(&self.encode())
    }
}

/// Acceptance of a [`DialRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialResponse {
    pub req_hash: [u8; 32],
    pub sig: Sig,
}

impl DialResponse {
    /// Accept `req`, signing its hash with the responder's key
    pub fn accept(req: &DialRequest, sk: &SecKey) -> Self {
        let req_hash = req.hash();
        Self {
            req_hash,
            sig: sk.sign(&req_hash),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DIAL_RESPONSE_LEN);
        buf.put_slice(&self.req_hash);
        buf.put_slice(self.sig.as_bytes());
        buf.freeze()
    }

    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() != DIAL_RESPONSE_LEN {
            return Err(ProtocolError::Malformed {
                what: "dial response",
                expected: DIAL_RESPONSE_LEN,
                actual: src.len(),
            });
        }
        let mut req_hash = [0u8; 32];
        req_hash.copy_from_slice(&src[..32]);
        Ok(Self {
            req_hash,
            sig: Sig::from_slice(&src[32..])?,
        })
    }

    /// Whether this response refers to `req`
    pub fn matches(&self, req: &DialRequest) -> bool {
        self.req_hash == req.hash()
    }

    /// Check the responder's signature
    pub fn verify(&self, responder: &PubKey) -> Result<(), ProtocolError> {
        responder.verify(&self.req_hash, &self.sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::generate_keypair;

    fn request() -> (DialRequest, SecKey, SecKey) {
        let (pk_a, sk_a) = generate_keypair();
        let (pk_b, sk_b) = generate_keypair();
        let req = DialRequest::signed(Addr::new(pk_a, 49152), Addr::new(pk_b, 80), 42, &sk_a);
        (req, sk_a, sk_b)
    }

    #[test]
    fn test_request_layout() {
        let (req, _, _) = request();
        let encoded = req.encode();
        assert_eq!(encoded.len(), DIAL_REQUEST_LEN);
        assert_eq!(DIAL_REQUEST_LEN, 142);

        let decoded = DialRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn test_tampered_request_fails_verification() {
        let (mut req, _, _) = request();
        req.dst.port = 81;
        assert!(matches!(req.verify(), Err(ProtocolError::InvalidSignature)));
    }

    #[test]
    fn test_response_matches_request() {
        let (req, _, sk_b) = request();
        let resp = DialResponse::accept(&req, &sk_b);
        let decoded = DialResponse::decode(&resp.encode()).unwrap();

        assert!(decoded.matches(&req));
        assert!(decoded.verify(&req.dst.pk).is_ok());
        assert!(decoded.verify(&req.src.pk).is_err());

        let (other, _, _) = request();
        assert!(!decoded.matches(&other));
    }

    #[test]
    fn test_truncated_bodies() {
        assert!(DialRequest::decode(&[0u8; 10]).is_err());
        assert!(DialResponse::decode(&[0u8; 95]).is_err());
    }
}
