//! Crate-wide error type.
//!
//! Follows the shape of [`bluer::Error`]: a plain `kind` plus a free-form
//! detail `message`, with `displaydoc` driving `Display`.

use std::fmt;

/// Bridge error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detail message.
    pub message: String,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

/// Bridge error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// the local SDP server could not be reached
    SdpUnavailable,
    /// registering the SDP record failed
    SdpRegisterFailed,
    /// no SDP record found for the given handle
    SdpNotFound,
    /// the SDP service search failed
    SdpQueryFailed,
    /// binding the RFCOMM listen socket failed
    TransportBindFailed,
    /// listening on the RFCOMM socket failed
    TransportListenFailed,
    /// registering the SPP record for the transport failed
    TransportSdpFailed,
    /// no SPP channel was advertised by the peer
    TransportServiceNotFound,
    /// connecting to the peer failed
    TransportConnectFailed,
    /// connecting to the peer timed out
    TransportConnectTimeout,
    /// the addressed peer is not connected
    TransportNotConnected,
    /// writing to the RFCOMM socket failed
    TransportWriteFailed,
    /// the device has not been discovered yet
    DeviceNotDiscovered,
    /// pairing the device failed: {0}
    PairFailed(String),
    /// connecting the device failed: {0}
    ConnectFailed(String),
    /// removing the device failed: {0}
    RemoveFailed(String),
    /// no PIN has been staged for this device
    PinNotStaged,
    /// the job queue has been stopped
    QueueStopped,
    /// malformed request: {0}
    Parse(String),
    /// internal error: {0}
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::with(ErrorKind::Internal(err.kind().to_string()), err.to_string())
    }
}

impl From<bluer::Error> for Error {
    fn from(err: bluer::Error) -> Self {
        Self::with(ErrorKind::ConnectFailed(err.kind.to_string()), err.message)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::with(ErrorKind::Parse(err.to_string()), "invalid JSON")
    }
}
