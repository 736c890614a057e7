//! Networker abstraction and the per-network registry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::addr::{Addr, NetType};
use crate::conn::Conn;
use crate::error::AppnetError;
use crate::Result;

/// Accepts connections for one local address
#[async_trait]
pub trait Listener: Send + Sync {
    /// Next inbound connection; fails with [`AppnetError::ListenerClosed`]
    /// once the listener is closed
    async fn accept(&self) -> Result<Conn>;

    /// Stop accepting and give back the port; later calls are no-ops
    fn close(&self);

    fn addr(&self) -> Addr;
}

/// Dials and listens on one network type
///
/// Dropping a pending `dial` future cancels it; callers bound it with
/// `tokio::time::timeout` where they need a deadline.
#[async_trait]
pub trait Networker: Send + Sync {
    fn net_type(&self) -> NetType;

    async fn dial(&self, addr: Addr) -> Result<Conn>;

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>>;
}

/// Fail unless `addr` belongs on `net`
pub(crate) fn check_net(net: NetType, addr: &Addr) -> Result<()> {
    if addr.net != net {
        return Err(AppnetError::WrongNetType {
            networker: net,
            requested: addr.net,
        });
    }
    Ok(())
}

/// Registry of networkers by type
///
/// Built once at startup and passed to whatever dials; there is no global
/// instance.
#[derive(Default)]
pub struct Networkers {
    by_type: RwLock<HashMap<NetType, Arc<dyn Networker>>>,
}

impl Networkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `networker` under its own type
    pub fn add(&self, networker: Arc<dyn Networker>) -> Result<()> {
        let net = networker.net_type();
        let mut by_type = self.by_type.write().unwrap_or_else(|e| e.into_inner());
        if by_type.contains_key(&net) {
            return Err(AppnetError::NetworkerAlreadyExists(net));
        }
        tracing::debug!(%net, "Networker registered");
        by_type.insert(net, networker);
        Ok(())
    }

    pub fn resolve(&self, net: NetType) -> Result<Arc<dyn Networker>> {
        self.by_type
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&net)
            .cloned()
            .ok_or(AppnetError::NoSuchNetworker(net))
    }

    pub async fn dial(&self, addr: Addr) -> Result<Conn> {
        self.resolve(addr.net)?.dial(addr).await
    }

    pub async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
        self.resolve(addr.net)?.listen(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmsg_protocol::cipher::generate_keypair;

    struct Refusing(NetType);

    #[async_trait]
    impl Networker for Refusing {
        fn net_type(&self) -> NetType {
            self.0
        }

        async fn dial(&self, addr: Addr) -> Result<Conn> {
            check_net(self.0, &addr)?;
            Err(AppnetError::InvalidPort(addr.port))
        }

        async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
            Err(AppnetError::InvalidPort(addr.port))
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_type() {
        let nets = Networkers::new();
        nets.add(Arc::new(Refusing(NetType::Skynet))).unwrap();
        assert!(matches!(
            nets.add(Arc::new(Refusing(NetType::Skynet))),
            Err(AppnetError::NetworkerAlreadyExists(NetType::Skynet))
        ));

        let (pk, _) = generate_keypair();
        assert!(matches!(
            nets.dial(Addr::skynet(pk, 7)).await,
            Err(AppnetError::InvalidPort(7))
        ));
        assert!(matches!(
            nets.dial(Addr::dmsg(pk, 7)).await,
            Err(AppnetError::NoSuchNetworker(NetType::Dmsg))
        ));
    }
}
