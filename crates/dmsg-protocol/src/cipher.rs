//! Key material and signatures
//!
//! Entities are identified by secp256k1 keys. A [`PubKey`] is the 33-byte
//! compressed point; the all-zero key is the "null" key and never refers to
//! a real entity. Signatures are 64-byte compact ECDSA over the SHA-256 of
//! the signed bytes.

use std::fmt;
use std::str::FromStr;

use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::ProtocolError;

/// Length of a compressed public key
pub const PUB_KEY_LEN: usize = 33;

/// Length of a secret key
pub const SEC_KEY_LEN: usize = 32;

/// Length of a compact signature
pub const SIG_LEN: usize = 64;

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Public key identifying a client or server
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey([u8; PUB_KEY_LEN]);

impl PubKey {
    /// The null key
    pub const NULL: PubKey = PubKey([0u8; PUB_KEY_LEN]);

    /// Parse and validate a compressed key
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != PUB_KEY_LEN {
            return Err(ProtocolError::Malformed {
                what: "public key",
                expected: PUB_KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; PUB_KEY_LEN];
        raw.copy_from_slice(bytes);
        if raw == [0u8; PUB_KEY_LEN] {
            return Ok(Self::NULL);
        }
        PublicKey::from_slice(&raw).map_err(|_| ProtocolError::InvalidPublicKey)?;
        Ok(Self(raw))
    }

    /// Whether this is the null key
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUB_KEY_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; PUB_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify `sig` over `data` against this key
    pub fn verify(&self, data: &[u8], sig: &Sig) -> Result<(), ProtocolError> {
        if self.is_null() {
            return Err(ProtocolError::InvalidPublicKey);
        }
        let pk = PublicKey::from_slice(&self.0).map_err(|_| ProtocolError::InvalidPublicKey)?;
        let sig =
            Signature::from_compact(&sig.0).map_err(|_| ProtocolError::InvalidSignature)?;
        let msg = Message::from_digest(sha256(data));
        SECP256K1
            .verify_ecdsa(&msg, &sig, &pk)
            .map_err(|_| ProtocolError::InvalidSignature)
    }
}

impl Default for PubKey {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", &self.to_hex()[..12])
    }
}

impl FromStr for PubKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::NULL);
        }
        Self::from_slice(&hex::decode(s)?)
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Secret key paired with a [`PubKey`]
#[derive(Clone, PartialEq, Eq)]
pub struct SecKey([u8; SEC_KEY_LEN]);

impl SecKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let sk = SecretKey::from_slice(bytes).map_err(|_| ProtocolError::InvalidSecretKey)?;
        Ok(Self(sk.secret_bytes()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn inner(&self) -> SecretKey {
        // The bytes were validated on construction.
        SecretKey::from_slice(&self.0).unwrap_or_else(|_| unreachable!("validated secret key"))
    }

    /// Public key derived from this secret key
    pub fn pub_key(&self) -> PubKey {
        PubKey(PublicKey::from_secret_key(SECP256K1, &self.inner()).serialize())
    }

    /// Sign the SHA-256 of `data`
    pub fn sign(&self, data: &[u8]) -> Sig {
        let msg = Message::from_digest(sha256(data));
        Sig(SECP256K1.sign_ecdsa(&msg, &self.inner()).serialize_compact())
    }
}

impl fmt::Debug for SecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecKey(..)")
    }
}

impl FromStr for SecKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(&hex::decode(s)?)
    }
}

impl Serialize for SecKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SecKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Compact ECDSA signature
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sig([u8; SIG_LEN]);

impl Sig {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != SIG_LEN {
            return Err(ProtocolError::Malformed {
                what: "signature",
                expected: SIG_LEN,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; SIG_LEN];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; SIG_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; SIG_LEN]
    }
}

impl Default for Sig {
    fn default() -> Self {
        Self([0u8; SIG_LEN])
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({}..)", hex::encode(&self.0[..6]))
    }
}

impl Serialize for Sig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Sig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Self::default());
        }
        let raw = hex::decode(&s).map_err(de::Error::custom)?;
        Self::from_slice(&raw).map_err(de::Error::custom)
    }
}

/// Generate a fresh random key pair
pub fn generate_keypair() -> (PubKey, SecKey) {
    let sk = SecretKey::new(&mut rand::thread_rng());
    let sk = SecKey(sk.secret_bytes());
    (sk.pub_key(), sk)
}

/// Derive a key pair from `seed`
///
/// The seed is hashed until the digest is a valid scalar, so the same seed
/// always yields the same pair.
pub fn generate_deterministic_keypair(seed: &[u8]) -> (PubKey, SecKey) {
    let mut digest = sha256(seed);
    loop {
        if let Ok(sk) = SecKey::from_slice(&digest) {
            return (sk.pub_key(), sk);
        }
        digest = sha256(&digest);
    }
}
