//! Sessions: one authenticated connection between a client and a relay
//!
//! A session starts with the key handshake, then carries stream frames in
//! both directions. Each side runs a read loop that demultiplexes frames and
//! a writer task that serializes them.

mod client_session;
mod handshake;
mod server_session;
mod writer;

pub(crate) use client_session::{ClientSession, ClientShared, PortUse};
pub(crate) use handshake::{client_handshake, server_handshake};
pub(crate) use server_session::{ServerSession, SessionMap};
pub(crate) use writer::{spawn_writer, FrameSender};

#[cfg(test)]
pub(crate) use writer::test_frame_sender;
