//! MQTT proxy (C5): the orchestrator tying the object cache (C3) and RFCOMM
//! transport (C2) to the message bus.

pub mod jobqueue;
pub mod proxy;

pub use jobqueue::JobQueue;
pub use proxy::Proxy;
