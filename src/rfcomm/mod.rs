//! RFCOMM transport (C2): a listening [`server::Server`] accepting peers with
//! per-client receive workers, and an outbound [`client::Client`].
//!
//! Bounded-timeout readiness (the original's `select()`-with-timeout
//! pattern) becomes `tokio::time::timeout` wrapping the async accept/
//! connect/read calls, and per-peer worker threads become `tokio::spawn`
//! tasks guarded by `Arc<Mutex<_>>` records — the idiomatic reading of
//! "OS threads with fine-grained locks" on top of a `tokio`-based stack.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

use std::time::Duration;

pub(crate) fn duration_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
