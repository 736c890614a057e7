//! Network-typed addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use dmsg_protocol::PubKey;

/// Network an [`Addr`] lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    /// Routes through the visor router
    Skynet,
    /// Direct dmsg streams
    Dmsg,
}

impl fmt::Display for NetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetType::Skynet => write!(f, "skynet"),
            NetType::Dmsg => write!(f, "dmsg"),
        }
    }
}

impl FromStr for NetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skynet" => Ok(NetType::Skynet),
            "dmsg" => Ok(NetType::Dmsg),
            other => Err(format!("unknown network type: {}", other)),
        }
    }
}

/// Endpoint on one of the app networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub net: NetType,
    #[serde(rename = "public_key")]
    pub pk: PubKey,
    pub port: u16,
}

impl Addr {
    pub fn new(net: NetType, pk: PubKey, port: u16) -> Self {
        Self { net, pk, port }
    }

    pub fn skynet(pk: PubKey, port: u16) -> Self {
        Self::new(NetType::Skynet, pk, port)
    }

    pub fn dmsg(pk: PubKey, port: u16) -> Self {
        Self::new(NetType::Dmsg, pk, port)
    }

    /// The same endpoint as a dmsg address
    pub fn to_dmsg(self) -> dmsg_protocol::Addr {
        dmsg_protocol::Addr::new(self.pk, self.port)
    }

    pub fn from_dmsg(addr: dmsg_protocol::Addr) -> Self {
        Self::dmsg(addr.pk, addr.port)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmsg_protocol::cipher::generate_keypair;

    #[test]
    fn test_net_type_names() {
        assert_eq!("skynet".parse::<NetType>().unwrap(), NetType::Skynet);
        assert_eq!(NetType::Dmsg.to_string(), "dmsg");
        assert!("tcp".parse::<NetType>().is_err());
    }

    #[test]
    fn test_dmsg_conversion_keeps_endpoint() {
        let (pk, _) = generate_keypair();
        let addr = Addr::dmsg(pk, 80);
        assert_eq!(Addr::from_dmsg(addr.to_dmsg()), addr);
        assert_eq!(addr.to_string(), format!("{}:80", pk));
    }
}
