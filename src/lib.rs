//! A gateway bridging a local Bluetooth Classic adapter (pairing, RFCOMM
//! Serial Port Profile) to an MQTT message bus.

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod mqtt;
pub mod rfcomm;
pub mod sdp;

pub use error::{Error, ErrorKind, Result};
