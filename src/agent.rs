//! Pairing agent (C4): wires `bluer::agent::Agent` callbacks to the object
//! cache's pending-PIN table.

use crate::cache::Cache;
use bluer::agent::{Agent, AgentHandle, ReqError};
use std::sync::Arc;

/// Builds the agent described in the component design: capability
/// `KeyboardDisplay`, PIN/passkey lookups served from the cache's pending
/// table, numeric confirmation auto-accepted, display callbacks informational.
pub fn build(cache: Arc<Cache>) -> Agent {
    let pin_cache = cache.clone();
    let passkey_cache = cache.clone();

    Agent {
        request_default: true,
        request_pin_code: Some(Box::new(move |req| {
            let cache = pin_cache.clone();
            Box::pin(async move {
                let path = device_object_path(&req.adapter, req.device);
                cache.get_pincode(&path, true).ok_or(ReqError::Rejected)
            })
        })),
        request_passkey: Some(Box::new(move |req| {
            let cache = passkey_cache.clone();
            Box::pin(async move {
                let path = device_object_path(&req.adapter, req.device);
                let pin = cache.get_pincode(&path, true).ok_or(ReqError::Rejected)?;
                pin.parse::<u32>().map_err(|_| ReqError::Rejected)
            })
        })),
        request_confirmation: Some(Box::new(|_req| Box::pin(async move { Ok(()) }))),
        display_pin_code: Some(Box::new(|_req| Box::pin(async move { Ok(()) }))),
        display_passkey: Some(Box::new(|_req| Box::pin(async move { Ok(()) }))),
        ..Default::default()
    }
}

fn device_object_path(adapter: &str, device: bluer::Address) -> String {
    // `req.adapter` is the bare name (e.g. "hci0"), stripped of the
    // "/org/bluez/" prefix by `Adapter::parse_dbus_path`; `cache.rs` stages
    // PINs under the full object path, so it must be restored here.
    format!("/org/bluez/{}/dev_{}", adapter, device.to_string().to_uppercase().replace(':', "_"))
}

/// Registers the agent as the platform default, at the well-known path used
/// by the original implementation.
pub async fn register(session: &bluer::Session, cache: Arc<Cache>) -> bluer::Result<AgentHandle> {
    session.register_agent(build(cache)).await
}
