//! Connection request sent once at the start of every host connection
//!
//! Wire form: `type u8 | body_len u16 BE | JSON body`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use dmsg_protocol::{Addr, PubKey};

use crate::error::PtyError;

/// Request body version understood by this host
pub const REQUEST_VERSION: &str = "1.0";

const CFG_REQ: u8 = 0;
const PTY_REQ: u8 = 1;

/// What a new connection wants from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Whitelist configuration
    Cfg,
    /// A pty session; a null key selects the host's own pty
    Pty { dst: Addr },
}

#[derive(Serialize, Deserialize)]
struct CfgBody {
    #[serde(rename = "Version")]
    version: String,
}

#[derive(Serialize, Deserialize)]
struct PtyBody {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "DstPK")]
    dst_pk: PubKey,
    #[serde(rename = "DstPort")]
    dst_port: u16,
}

impl Request {
    /// Pty on the host itself
    pub fn local_pty() -> Self {
        Self::Pty {
            dst: Addr::new(PubKey::NULL, 0),
        }
    }

    /// Pty on the remote host at `pk:port`, proxied by the local host
    pub fn remote_pty(pk: PubKey, port: u16) -> Self {
        Self::Pty {
            dst: Addr::new(pk, port),
        }
    }

    /// Whether this pty request targets `local_pk` itself
    pub fn is_local_to(&self, local_pk: &PubKey) -> bool {
        match self {
            Self::Pty { dst } => dst.pk.is_null() || dst.pk == *local_pk,
            Self::Cfg => true,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PtyError> {
        let version = REQUEST_VERSION.to_string();
        let (tag, body) = match self {
            Self::Cfg => (CFG_REQ, serde_json::to_vec(&CfgBody { version })?),
            Self::Pty { dst } => (
                PTY_REQ,
                serde_json::to_vec(&PtyBody {
                    version,
                    dst_pk: dst.pk,
                    dst_port: dst.port,
                })?,
            ),
        };
        let len = u16::try_from(body.len())
            .map_err(|_| PtyError::Request(format!("body of {} bytes is too long", body.len())))?;

        let mut buf = Vec::with_capacity(3 + body.len());
        buf.push(tag);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<(), PtyError>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&self.encode()?).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, PtyError>
    where
        R: AsyncRead + Unpin,
    {
        let tag = r.read_u8().await?;
        let len = r.read_u16().await?;
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body).await?;

        let (version, req) = match tag {
            CFG_REQ => {
                let body: CfgBody = serde_json::from_slice(&body)?;
                (body.version, Self::Cfg)
            }
            PTY_REQ => {
                let body: PtyBody = serde_json::from_slice(&body)?;
                (body.version, Self::remote_pty(body.dst_pk, body.dst_port))
            }
            other => return Err(PtyError::Request(format!("unknown request type {}", other))),
        };
        if version != REQUEST_VERSION {
            return Err(PtyError::Request(format!(
                "unsupported request version {:?}",
                version
            )));
        }
        Ok(req)
    }
}
