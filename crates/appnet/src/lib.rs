//! appnet: network-typed dialing and listening for apps
//!
//! An [`Addr`] names a network type plus a public key and port. A
//! [`Networkers`] registry maps each [`NetType`] to the [`Networker`] that
//! serves it: the [`SkywireNetworker`] bridges a route-group layer, the
//! [`DmsgNetworker`] bridges a dmsg client. Every [`Conn`] and listener
//! gives its local port back exactly once, however it is closed.

pub mod addr;
pub mod conn;
pub mod dmsg_net;
pub mod error;
pub mod gateway;
pub mod networker;
pub mod skynet;

pub use addr::{Addr, NetType};
pub use conn::{Conn, RawConn};
pub use dmsg_net::DmsgNetworker;
pub use error::AppnetError;
pub use gateway::{AppGateway, AppGatewayClient, ConnInfo};
pub use networker::{Listener, Networker, Networkers};
pub use skynet::{RouteGroup, RouteGroupLayer, SkywireNetworker};

pub type Result<T> = std::result::Result<T, AppnetError>;
