//! Discovery entries
//!
//! An entry describes one entity on the network: a client with its delegated
//! relay servers, or a relay server with its public address. Entries are
//! signed by the entity's static key over the JSON encoding of the entry with
//! the signature left empty.

use serde::{Deserialize, Serialize};

use dmsg_protocol::cipher::{PubKey, SecKey, Sig};

use crate::error::DiscoveryError;
use crate::time::unix_nanos;

/// Entry format version
pub const ENTRY_VERSION: &str = "0.0.1";

/// Client part of an entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Relay servers the client keeps sessions with
    pub delegated_servers: Vec<PubKey>,
}

/// Server part of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// host:port clients dial
    pub address: String,
    /// Number of further sessions the server accepts
    pub available_sessions: usize,
}

/// A discovery record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub version: String,
    pub sequence: u64,
    /// When the entity first registered (unix nanos)
    pub registered: u64,
    /// When this revision was produced (unix nanos)
    pub timestamp: u64,
    #[serde(rename = "public_key")]
    pub static_pk: PubKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Sig>,
}

impl Entry {
    fn base(pk: PubKey) -> Self {
        let now = unix_nanos();
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence: 0,
            registered: now,
            timestamp: now,
            static_pk: pk,
            client: None,
            server: None,
            signature: None,
        }
    }

    /// Unsigned client entry
    pub fn client(pk: PubKey, delegated_servers: Vec<PubKey>) -> Self {
        Self {
            client: Some(ClientInfo { delegated_servers }),
            ..Self::base(pk)
        }
    }

    /// Unsigned server entry
    pub fn server(pk: PubKey, address: String, available_sessions: usize) -> Self {
        Self {
            server: Some(ServerInfo {
                address,
                available_sessions,
            }),
            ..Self::base(pk)
        }
    }

    pub fn is_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    /// Delegated servers of a client entry (empty for servers)
    pub fn delegated_servers(&self) -> &[PubKey] {
        self.client
            .as_ref()
            .map(|c| c.delegated_servers.as_slice())
            .unwrap_or(&[])
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, DiscoveryError> {
        let unsigned = Entry {
            signature: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign the entry with the entity's secret key
    pub fn sign(&mut self, sk: &SecKey) -> Result<(), DiscoveryError> {
        if sk.pub_key() != self.static_pk {
            return Err(DiscoveryError::Validation(
                "secret key does not match entry key".to_string(),
            ));
        }
        self.signature = Some(sk.sign(&self.signed_bytes()?));
        Ok(())
    }

    /// Bump the sequence and timestamp, then re-sign
    pub fn next_revision(&mut self, sk: &SecKey) -> Result<(), DiscoveryError> {
        self.sequence += 1;
        self.timestamp = unix_nanos().max(self.timestamp + 1);
        self.sign(sk)
    }

    /// Check the signature against the entry key
    pub fn verify_signature(&self) -> Result<(), DiscoveryError> {
        let sig = self
            .signature
            .as_ref()
            .ok_or_else(|| DiscoveryError::Validation("entry is not signed".to_string()))?;
        self.static_pk
            .verify(&self.signed_bytes()?, sig)
            .map_err(|_| DiscoveryError::Validation("entry has invalid signature".to_string()))
    }

    /// Structural checks independent of any stored revision
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.static_pk.is_null() {
            return Err(DiscoveryError::Validation("entry key is null".to_string()));
        }
        match (&self.client, &self.server) {
            (None, None) => {
                return Err(DiscoveryError::Validation(
                    "entry is neither client nor server".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(DiscoveryError::Validation(
                    "entry is both client and server".to_string(),
                ))
            }
            _ => {}
        }
        if let Some(server) = &self.server {
            if server.address.is_empty() {
                return Err(DiscoveryError::Validation(
                    "server entry has no address".to_string(),
                ));
            }
        }
        self.verify_signature()
    }

    /// Check that this entry may replace `prev`
    pub fn validate_iteration(&self, prev: &Entry) -> Result<(), DiscoveryError> {
        if self.static_pk != prev.static_pk {
            return Err(DiscoveryError::Validation("entry key changed".to_string()));
        }
        if self.sequence <= prev.sequence {
            return Err(DiscoveryError::Validation(format!(
                "sequence {} is not above {}",
                self.sequence, prev.sequence
            )));
        }
        if self.timestamp <= prev.timestamp {
            return Err(DiscoveryError::Validation(
                "timestamp is not above the stored revision".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmsg_protocol::cipher::generate_keypair;

    #[test]
    fn test_sign_and_verify() {
        let (pk, sk) = generate_keypair();
        let (srv, _) = generate_keypair();
        let mut entry = Entry::client(pk, vec![srv]);
        entry.sign(&sk).unwrap();
        assert!(entry.validate().is_ok());

        entry.client = Some(ClientInfo::default());
        assert!(entry.verify_signature().is_err());
    }

    #[test]
    fn test_sign_with_wrong_key() {
        let (pk, _) = generate_keypair();
        let (_, other_sk) = generate_keypair();
        let mut entry = Entry::server(pk, "127.0.0.1:8081".to_string(), 10);
        assert!(entry.sign(&other_sk).is_err());
    }

    #[test]
    fn test_validate_iteration() {
        let (pk, sk) = generate_keypair();
        let mut first = Entry::server(pk, "127.0.0.1:8081".to_string(), 10);
        first.sign(&sk).unwrap();

        let mut second = first.clone();
        second.next_revision(&sk).unwrap();
        assert!(second.validate_iteration(&first).is_ok());
        assert!(first.validate_iteration(&second).is_err());
    }

    #[test]
    fn test_json_shape() {
        let (pk, sk) = generate_keypair();
        let mut entry = Entry::client(pk, vec![]);
        entry.sign(&sk).unwrap();
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["public_key"], pk.to_string());
        assert!(value.get("server").is_none());
        assert!(value["signature"].is_string());
    }
}
