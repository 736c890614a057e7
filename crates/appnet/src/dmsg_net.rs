//! Networker over a dmsg client

use async_trait::async_trait;

use crate::addr::{Addr, NetType};
use crate::conn::Conn;
use crate::error::AppnetError;
use crate::networker::{check_net, Listener, Networker};
use crate::Result;

/// [`Networker`] for [`NetType::Dmsg`]
///
/// Ports are owned by the dmsg client itself, so connections carry no
/// extra port guard.
#[derive(Clone)]
pub struct DmsgNetworker {
    client: dmsg::Client,
}

impl DmsgNetworker {
    pub fn new(client: dmsg::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Networker for DmsgNetworker {
    fn net_type(&self) -> NetType {
        NetType::Dmsg
    }

    async fn dial(&self, addr: Addr) -> Result<Conn> {
        check_net(NetType::Dmsg, &addr)?;
        let stream = self.client.dial_stream(addr.to_dmsg()).await?;
        let local = Addr::from_dmsg(stream.local_addr());
        let remote = Addr::from_dmsg(stream.remote_addr());
        Ok(Conn::new(Box::new(stream), local, remote, None))
    }

    async fn listen(&self, addr: Addr) -> Result<Box<dyn Listener>> {
        check_net(NetType::Dmsg, &addr)?;
        let inner = self.client.listen(addr.port)?;
        Ok(Box::new(DmsgListener { inner }))
    }
}

struct DmsgListener {
    inner: dmsg::Listener,
}

#[async_trait]
impl Listener for DmsgListener {
    async fn accept(&self) -> Result<Conn> {
        let stream = self.inner.accept().await.map_err(|e| {
            if self.inner.is_closed() {
                AppnetError::ListenerClosed
            } else {
                e.into()
            }
        })?;
        let local = Addr::from_dmsg(stream.local_addr());
        let remote = Addr::from_dmsg(stream.remote_addr());
        Ok(Conn::new(Box::new(stream), local, remote, None))
    }

    fn close(&self) {
        self.inner.close();
    }

    fn addr(&self) -> Addr {
        Addr::from_dmsg(self.inner.addr())
    }
}
