//! Error types for dmsg
//!
//! [`DmsgError`] is the coded taxonomy that travels on the wire (REJECT
//! frames and handshake rejections carry its numeric code). [`Error`] is the
//! top-level error returned by the dmsg client, server, and helpers.

use std::io;
use std::path::PathBuf;

use dmsg_protocol::ProtocolError;
use thiserror::Error;

/// Convenience alias used throughout the dmsg crates
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coded dmsg errors
///
/// Codes are grouped by hundreds: 1xx discovery, 2xx entity and session,
/// 3xx stream requests and responses, 4xx listeners.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DmsgError {
    #[error("dmsg error 100 - entry is not found in discovery")]
    DiscEntryNotFound = 100,
    #[error("dmsg error 101 - entry is not of server in discovery")]
    DiscEntryIsNotServer = 101,
    #[error("dmsg error 102 - entry is not of client in discovery")]
    DiscEntryIsNotClient = 102,
    #[error("dmsg error 103 - client entry in discovery has no delegated servers")]
    DiscEntryHasNoDelegated = 103,

    #[error("dmsg error 200 - local entity closed")]
    EntityClosed = 200,
    #[error("dmsg error 201 - local session closed")]
    SessionClosed = 201,
    #[error("dmsg error 202 - cannot connect to delegated server")]
    CannotConnectToDelegated = 202,
    #[error("dmsg error 203 - extra bytes received during session handshake")]
    SessionHandshakeExtraBytes = 203,

    #[error("dmsg error 300 - request has invalid signature")]
    ReqInvalidSig = 300,
    #[error("dmsg error 301 - request timestamp should be higher than last")]
    ReqInvalidTimestamp = 301,
    #[error("dmsg error 302 - request has invalid source public key")]
    ReqInvalidSrcPk = 302,
    #[error("dmsg error 303 - request has invalid destination public key")]
    ReqInvalidDstPk = 303,
    #[error("dmsg error 304 - request has invalid source port")]
    ReqInvalidSrcPort = 304,
    #[error("dmsg error 305 - request has invalid destination port")]
    ReqInvalidDstPort = 305,
    #[error("dmsg error 306 - request has no associated listener")]
    ReqNoListener = 306,
    #[error("dmsg error 307 - request cannot be forwarded because the next session is non-existent")]
    ReqNoNextSession = 307,

    #[error("dmsg error 350 - response has invalid signature")]
    DialRespInvalidSig = 350,
    #[error("dmsg error 351 - response has invalid hash of associated request")]
    DialRespInvalidHash = 351,
    #[error("dmsg error 352 - response rejected associated request without reason")]
    DialRespNotAccepted = 352,

    #[error("dmsg error 370 - signed object is invalid")]
    SignedObjectInvalid = 370,

    #[error("dmsg error 400 - port already occupied")]
    PortOccupied = 400,
    #[error("dmsg error 401 - listener accept chan maxed")]
    AcceptChanMaxed = 401,
}

impl DmsgError {
    const ALL: [DmsgError; 22] = [
        Self::DiscEntryNotFound,
        Self::DiscEntryIsNotServer,
        Self::DiscEntryIsNotClient,
        Self::DiscEntryHasNoDelegated,
        Self::EntityClosed,
        Self::SessionClosed,
        Self::CannotConnectToDelegated,
        Self::SessionHandshakeExtraBytes,
        Self::ReqInvalidSig,
        Self::ReqInvalidTimestamp,
        Self::ReqInvalidSrcPk,
        Self::ReqInvalidDstPk,
        Self::ReqInvalidSrcPort,
        Self::ReqInvalidDstPort,
        Self::ReqNoListener,
        Self::ReqNoNextSession,
        Self::DialRespInvalidSig,
        Self::DialRespInvalidHash,
        Self::DialRespNotAccepted,
        Self::SignedObjectInvalid,
        Self::PortOccupied,
        Self::AcceptChanMaxed,
    ];

    /// Numeric wire code
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Error for a wire code, if known
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    /// Error for a code received in a REJECT
    ///
    /// Unknown codes surface as [`DmsgError::DialRespNotAccepted`].
    pub fn from_reject_code(code: u16) -> Self {
        Self::from_code(code).unwrap_or(Self::DialRespNotAccepted)
    }

    /// Whether the caller may back off and retry
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::ReqNoListener | Self::AcceptChanMaxed)
    }
}

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Coded entry error (not found, wrong type, no delegated servers)
    #[error(transparent)]
    Entry(#[from] DmsgError),

    /// Transport failure talking to the discovery service
    #[error("Discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status returned by the discovery service
    #[error("Discovery returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Entry failed validation
    #[error("Invalid entry: {0}")]
    Validation(String),

    /// Entry could not be encoded
    #[error("Entry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl DiscoveryError {
    /// Coded error carried by this discovery error, if any
    pub fn dmsg(&self) -> Option<DmsgError> {
        match self {
            Self::Entry(e) => Some(*e),
            _ => None,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level error type for dmsg
#[derive(Error, Debug)]
pub enum Error {
    /// Coded dmsg error
    #[error(transparent)]
    Dmsg(#[from] DmsgError),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Discovery error
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Handshake with a peer failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Port outside the usable range or otherwise invalid
    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    /// Operation did not finish in time
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Coded error carried by this error, if any
    pub fn dmsg(&self) -> Option<DmsgError> {
        match self {
            Self::Dmsg(e) => Some(*e),
            Self::Discovery(e) => e.dmsg(),
            _ => None,
        }
    }

    /// Whether the caller may back off and retry
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            other => other.dmsg().is_some_and(|e| e.is_temporary()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::Dmsg(DmsgError::EntityClosed | DmsgError::SessionClosed) => {
                io::Error::new(io::ErrorKind::BrokenPipe, err)
            }
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for err in DmsgError::ALL {
            assert_eq!(DmsgError::from_code(err.code()), Some(err));
        }
        assert_eq!(DmsgError::from_code(999), None);
        assert_eq!(
            DmsgError::from_reject_code(999),
            DmsgError::DialRespNotAccepted
        );
    }

    #[test]
    fn test_message_format() {
        assert_eq!(
            DmsgError::ReqNoListener.to_string(),
            "dmsg error 306 - request has no associated listener"
        );
        assert_eq!(DmsgError::PortOccupied.code(), 400);
    }

    #[test]
    fn test_temporary_errors() {
        assert!(DmsgError::ReqNoListener.is_temporary());
        assert!(DmsgError::AcceptChanMaxed.is_temporary());
        assert!(!DmsgError::PortOccupied.is_temporary());

        let err: Error = DmsgError::AcceptChanMaxed.into();
        assert!(err.is_temporary());
        let err: Error = DiscoveryError::Entry(DmsgError::ReqNoListener).into();
        assert!(err.is_temporary());
    }

    #[test]
    fn test_into_io_error() {
        let io_err: io::Error = Error::from(DmsgError::SessionClosed).into();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
        let io_err: io::Error = Error::Timeout("read").into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }
}
