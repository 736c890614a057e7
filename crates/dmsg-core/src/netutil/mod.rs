//! Network utilities shared by dmsg and appnet

mod porter;

pub use porter::{PortGuard, Porter, MIN_EPHEMERAL};
