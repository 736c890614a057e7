//! dmsg-protocol: Wire protocol for dmsg session and stream multiplexing
//!
//! This crate defines the binary formats spoken between dmsg clients and
//! dmsg relay servers: key material and signatures, the stream frame
//! header and codec, the signed OPEN/ACCEPT bodies, and the messages of the
//! session handshake.

pub mod addr;
pub mod cipher;
pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod request;
pub mod stream_id;

pub use addr::Addr;
pub use cipher::{PubKey, SecKey, Sig};
pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, FrameType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use handshake::{HandshakeCodec, HandshakeMessage, PROTOCOL_VERSION};
pub use request::{DialRequest, DialResponse};
pub use stream_id::StreamId;
