//! dmsg: relayed, multiplexed streams between public keys
//!
//! A [`Client`] keeps authenticated sessions with relay servers found through
//! discovery and multiplexes [`Stream`]s over them. A [`Server`] accepts
//! client sessions and relays streams between them.

pub mod client;
pub mod listener;
mod registration;
pub mod server;
mod session;
pub mod stream;

pub use client::{Callbacks, Client};
pub use listener::Listener;
pub use server::Server;
pub use stream::{Stream, INITIAL_WINDOW, MAX_DATA_CHUNK};

pub use dmsg_core::{DmsgError, Error, Result};
pub use dmsg_protocol::{Addr, PubKey, SecKey};
