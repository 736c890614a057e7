//! Stream identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session-scoped identifier of a stream
///
/// IDs are allocated by the side that opens the stream on a given session:
/// clients use even IDs, relay servers use odd IDs. ID 0 is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(u16);

impl StreamId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Whether a client allocated this ID
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for StreamId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl From<StreamId> for u16 {
    fn from(id: StreamId) -> Self {
        id.0
    }
}
