//! In-process discovery store

use async_trait::async_trait;
use dashmap::DashMap;

use dmsg_protocol::PubKey;

use super::{Discovery, Entry};
use crate::error::{DiscoveryError, DmsgError};

/// Discovery backed by an in-memory map
///
/// Applies the same validation as the HTTP service: entries must be signed
/// and every update must advance the sequence.
#[derive(Debug, Default)]
pub struct MemoryDiscovery {
    entries: DashMap<PubKey, Entry>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove an entry, returning it
    pub fn remove(&self, pk: &PubKey) -> Option<Entry> {
        self.entries.remove(pk).map(|(_, e)| e)
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn entry(&self, pk: &PubKey) -> Result<Entry, DiscoveryError> {
        self.entries
            .get(pk)
            .map(|e| e.clone())
            .ok_or(DiscoveryError::Entry(DmsgError::DiscEntryNotFound))
    }

    async fn post_entry(&self, entry: &Entry) -> Result<(), DiscoveryError> {
        entry.validate()?;
        match self.entries.entry(entry.static_pk) {
            dashmap::mapref::entry::Entry::Occupied(mut stored) => {
                entry.validate_iteration(stored.get())?;
                stored.insert(entry.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }
        tracing::trace!(pk = %entry.static_pk, sequence = entry.sequence, "Stored entry");
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<Entry>, DiscoveryError> {
        let mut servers: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| {
                e.server
                    .as_ref()
                    .is_some_and(|s| s.available_sessions > 0)
            })
            .map(|e| e.clone())
            .collect();
        servers.sort_by_key(|e| e.static_pk);
        Ok(servers)
    }

    async fn client_entries(&self) -> Result<Vec<Entry>, DiscoveryError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.is_client())
            .map(|e| e.clone())
            .collect())
    }
}
