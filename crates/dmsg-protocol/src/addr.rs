//! dmsg endpoint addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cipher::PubKey;
use crate::error::ProtocolError;

/// A dmsg endpoint: public key plus port
///
/// Port 0 is never a valid endpoint port; it stands for "pick an ephemeral
/// port" where allocation is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Addr {
    #[serde(rename = "public_key")]
    pub pk: PubKey,
    pub port: u16,
}

impl Addr {
    pub fn new(pk: PubKey, port: u16) -> Self {
        Self { pk, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}

impl FromStr for Addr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pk, port) = s.rsplit_once(':').ok_or(ProtocolError::Malformed {
            what: "address",
            expected: 2,
            actual: 1,
        })?;
        let port = port.parse::<u16>().map_err(|_| ProtocolError::Malformed {
            what: "address port",
            expected: 2,
            actual: port.len(),
        })?;
        Ok(Self::new(pk.parse()?, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::generate_keypair;

    #[test]
    fn test_addr_display_parse() {
        let (pk, _) = generate_keypair();
        let addr = Addr::new(pk, 80);
        let text = addr.to_string();
        assert!(text.ends_with(":80"));
        assert_eq!(text.parse::<Addr>().unwrap(), addr);
    }

    #[test]
    fn test_addr_parse_rejects_garbage() {
        assert!("no-port".parse::<Addr>().is_err());
        assert!("abcd:80".parse::<Addr>().is_err());
    }
}
