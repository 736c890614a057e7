//! Keeping an entity's entry current in discovery

use std::sync::Arc;

use tokio::sync::Mutex;

use dmsg_core::disc::{Discovery, Entry};
use dmsg_core::{DiscoveryError, DmsgError};
use dmsg_protocol::SecKey;

/// Posts successive revisions of one entity's entry
///
/// The first post continues from whatever revision discovery already holds
/// for the key, so a restarted entity does not trip the sequence check.
pub(crate) struct Registration {
    sk: SecKey,
    discovery: Arc<dyn Discovery>,
    current: Mutex<Option<Entry>>,
}

impl Registration {
    pub(crate) fn new(sk: SecKey, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            sk,
            discovery,
            current: Mutex::new(None),
        }
    }

    pub(crate) fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    /// Sign and post `entry` as the next revision
    pub(crate) async fn post(&self, entry: Entry) -> Result<(), DiscoveryError> {
        self.post_if(entry, || true).await
    }

    /// Like [`Registration::post`], skipped when `wanted` returns false once
    /// earlier posts have finished
    pub(crate) async fn post_if(
        &self,
        mut entry: Entry,
        wanted: impl FnOnce() -> bool,
    ) -> Result<(), DiscoveryError> {
        let mut current = self.current.lock().await;
        if !wanted() {
            return Ok(());
        }
        let prev = match current.take() {
            Some(prev) => Some(prev),
            None => match self.discovery.entry(&entry.static_pk).await {
                Ok(prev) => Some(prev),
                Err(e) if e.dmsg() == Some(DmsgError::DiscEntryNotFound) => None,
                Err(e) => return Err(e),
            },
        };

        if let Some(prev) = &prev {
            entry.sequence = prev.sequence + 1;
            entry.registered = prev.registered;
            entry.timestamp = entry.timestamp.max(prev.timestamp + 1);
        }
        entry.sign(&self.sk)?;

        match self.discovery.post_entry(&entry).await {
            Ok(()) => {
                tracing::debug!(sequence = entry.sequence, "Discovery entry updated");
                *current = Some(entry);
                Ok(())
            }
            Err(e) => {
                *current = prev;
                Err(e)
            }
        }
    }
}
