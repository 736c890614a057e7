//! Discovery client
//!
//! The discovery service maps public keys to entries. Clients look up the
//! delegated servers of the peers they dial, relay servers advertise their
//! address, and both keep their own entry fresh.

mod api;
mod entry;
mod http;
mod memory;

pub use api::router;
pub use entry::{ClientInfo, Entry, ServerInfo, ENTRY_VERSION};
pub use http::HttpDiscovery;
pub use memory::MemoryDiscovery;

use async_trait::async_trait;

use dmsg_protocol::PubKey;

use crate::error::{DiscoveryError, DmsgError};

/// Access to a discovery service
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Look up the entry of `pk`
    async fn entry(&self, pk: &PubKey) -> Result<Entry, DiscoveryError>;

    /// Create or update an entry; the caller may retry on failure
    async fn post_entry(&self, entry: &Entry) -> Result<(), DiscoveryError>;

    /// Server entries that still accept sessions
    async fn available_servers(&self) -> Result<Vec<Entry>, DiscoveryError>;

    /// All client entries
    async fn client_entries(&self) -> Result<Vec<Entry>, DiscoveryError>;

    /// Entry of `pk`, which must be a server
    async fn server_entry(&self, pk: &PubKey) -> Result<Entry, DiscoveryError> {
        let entry = self.entry(pk).await?;
        if !entry.is_server() {
            return Err(DmsgError::DiscEntryIsNotServer.into());
        }
        Ok(entry)
    }

    /// Entry of `pk`, which must be a client with delegated servers
    async fn client_entry(&self, pk: &PubKey) -> Result<Entry, DiscoveryError> {
        let entry = self.entry(pk).await?;
        if !entry.is_client() {
            return Err(DmsgError::DiscEntryIsNotClient.into());
        }
        if entry.delegated_servers().is_empty() {
            return Err(DmsgError::DiscEntryHasNoDelegated.into());
        }
        Ok(entry)
    }
}
