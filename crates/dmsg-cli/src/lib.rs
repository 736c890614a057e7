//! dmsg-cli: command-line interface for dmsg
//!
//! Provides the `dmsg` binary, which runs a relay server, an in-memory
//! discovery service or a dmsgpty host, and drives a running host's CLI
//! listener.

pub mod commands;
pub mod output;
