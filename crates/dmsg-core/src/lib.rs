//! dmsg-core: Core types, configuration, and discovery for dmsg
//!
//! This crate provides the coded error taxonomy, configuration structures,
//! the discovery client abstraction, the port and ID allocators, and the
//! JSON RPC framing shared by the dmsg client, the relay server, dmsgpty,
//! and appnet.

pub mod backoff;
pub mod config;
pub mod disc;
pub mod error;
pub mod ids;
pub mod netutil;
pub mod rpc;
pub mod time;

pub use error::{DiscoveryError, DmsgError, Error, Result};
