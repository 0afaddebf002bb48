//! MQTT proxy (C5): subscribes to the fixed request topics, drives the
//! object cache (C3) and RFCOMM transport (C2), and publishes lifecycle,
//! data, and error events through the bounded job queue.

use super::jobqueue::JobQueue;
use crate::cache::Cache;
use crate::config::Config;
use crate::error::Result;
use crate::rfcomm::client::{Client, ClientConfig};
use crate::rfcomm::Server;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bluer::Address;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

const TOPIC_CONNECT_DEVICE: &str = "/org/booway/bluetooth/connectDevice";
const TOPIC_DISCONNECT_DEVICE: &str = "/org/booway/bluetooth/disconnectDevice";
const TOPIC_SEND_TO_DEVICE: &str = "/org/booway/bluetooth/sendToDevice";
const TOPIC_REMOVE_DEVICES: &str = "/org/booway/bluetooth/removeDevices";
const TOPIC_CONNECT_BENCHMARK: &str = "/org/booway/bluetooth/connectBenchmarkTest";
const TOPIC_GET_ADAPTERS: &str = "/org/booway/bluetooth/getAdapters";
const TOPIC_GET_DEVICES: &str = "/org/booway/bluetooth/getDevices";
const TOPIC_NEW_CONNECTION: &str = "/org/booway/bluetooth/newConnection";
const TOPIC_LOSE_CONNECTION: &str = "/org/booway/bluetooth/loseConnection";
const TOPIC_RECEIVE_FROM_DEVICE: &str = "/org/booway/bluetooth/receiveFromDevice";
const TOPIC_GET_LAST_ERROR: &str = "/org/booway/bluetooth/getLastError";

fn publish_id() -> String {
    Uuid::new_v4().to_string()
}

fn publish_time() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Best-effort extraction of the caller's `publishId`/`publishTime` from a
/// request payload, checked at the top level and under a nested `device`
/// object (the two shapes the five request topics use), so `getLastError`
/// can echo them back instead of minting fresh ones on every failure.
fn extract_publish_meta(payload: &[u8]) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return (None, None);
    };
    let scope = value.get("device").unwrap_or(&value);
    let publish_id = scope.get("publishId").and_then(|v| v.as_str()).map(String::from);
    let publish_time = scope.get("publishTime").and_then(|v| v.as_str()).map(String::from);
    (publish_id, publish_time)
}

#[derive(Deserialize)]
struct ConnectDeviceBody {
    device: ConnectDeviceFields,
}

#[derive(Deserialize)]
struct ConnectDeviceFields {
    address: String,
    pincode: String,
}

#[derive(Deserialize)]
struct DisconnectDeviceBody {
    device: DisconnectDeviceFields,
}

#[derive(Deserialize)]
struct DisconnectDeviceFields {
    address: String,
}

#[derive(Deserialize)]
struct SendToDeviceBody {
    device: SendToDeviceFields,
}

#[derive(Deserialize)]
struct SendToDeviceFields {
    address: String,
    data: String,
    size: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressOrList {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RemoveDevicesBody {
    address: AddressOrList,
}

#[derive(Deserialize)]
struct ConnectBenchmarkBody {
    address: String,
    times: u32,
}

#[derive(Serialize)]
struct DeviceEventPayload {
    address: String,
    name: String,
    #[serde(rename = "publishId")]
    publish_id: String,
    #[serde(rename = "publishTime")]
    publish_time: String,
}

#[derive(Serialize)]
struct DataEventPayload {
    address: String,
    data: String,
    size: usize,
    #[serde(rename = "publishId")]
    publish_id: String,
    #[serde(rename = "publishTime")]
    publish_time: String,
}

#[derive(Serialize)]
struct LastErrorPayload {
    #[serde(rename = "subscribeId")]
    subscribe_id: String,
    #[serde(rename = "subscribeTime")]
    subscribe_time: String,
    message: String,
}

/// The MQTT proxy: owns the outbound-client map, the inbound-ID index, and
/// the bounded job queue all outgoing publishes flow through.
pub struct Proxy {
    cache: Arc<Cache>,
    server: Arc<Server>,
    mqtt: AsyncClient,
    queue: Arc<JobQueue>,
    outbound: AsyncMutex<HashMap<Address, Arc<Client>>>,
    inbound_index: AsyncMutex<HashMap<Address, u64>>,
}

impl Proxy {
    /// Connects to the broker described by `config`, builds the job queue,
    /// and returns the proxy plus its `rumqttc` event loop (to be driven by
    /// [`Self::run_event_loop`]).
    pub fn new(config: &Config, cache: Arc<Cache>, server: Arc<Server>) -> (Arc<Self>, EventLoop) {
        let host = config.get_str("mqtt.host", "127.0.0.1");
        let port = config.get_i64("mqtt.port", 1883) as u16;
        let username = config.get_str("mqtt.username", "admin");
        let password = config.get_str("mqtt.password", "123456");

        let client_id = Uuid::new_v4().to_string();
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_credentials(username, password);
        opts.set_keep_alive(Duration::from_secs(60));
        opts.set_clean_session(true);
        opts.set_inflight(1);

        let (mqtt, event_loop) = AsyncClient::new(opts, 64);
        let queue = JobQueue::new(64, 2);

        let this = Arc::new(Self {
            cache,
            server,
            mqtt,
            queue,
            outbound: AsyncMutex::new(HashMap::new()),
            inbound_index: AsyncMutex::new(HashMap::new()),
        });
        (this, event_loop)
    }

    /// Subscribes to the fixed request topics, through the job queue like
    /// every other outbound MQTT operation. Call once after construction.
    pub async fn subscribe(&self) -> Result<()> {
        for topic in [
            TOPIC_CONNECT_DEVICE,
            TOPIC_DISCONNECT_DEVICE,
            TOPIC_SEND_TO_DEVICE,
            TOPIC_REMOVE_DEVICES,
            TOPIC_CONNECT_BENCHMARK,
        ] {
            let mqtt = self.mqtt.clone();
            self.queue
                .submit(move || async move {
                    if let Err(err) = mqtt.subscribe(topic, QoS::AtMostOnce).await {
                        log::warn!("mqtt subscribe to {} failed: {}", topic, err);
                    }
                })
                .await
                .map_err(|err| {
                    crate::error::Error::with(crate::error::ErrorKind::Internal(err.to_string()), "mqtt subscribe failed")
                })?;
        }
        Ok(())
    }

    /// Submits an outbound publish through the bounded job queue so it is
    /// serialized FIFO alongside subscribes and inbound dispatch, instead of
    /// calling `rumqttc` directly off whatever task happens to produce it.
    async fn publish_via_queue(&self, topic: &'static str, payload: String) {
        let mqtt = self.mqtt.clone();
        let _ = self
            .queue
            .submit(move || async move {
                if let Err(err) = mqtt.publish(topic, QoS::AtMostOnce, false, payload).await {
                    log::warn!("mqtt publish to {} failed: {}", topic, err);
                }
            })
            .await;
    }

    /// Drives the `rumqttc` event loop, dispatching inbound publishes to
    /// [`Self::handle_message`] through the job queue so the Proxy never
    /// runs on the MQTT library's own task, and so inbound dispatch is
    /// serialized by the same worker pool as outbound publishes.
    pub async fn run_event_loop(self: Arc<Self>, mut event_loop: EventLoop) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let this = self.clone();
                    let topic = publish.topic.clone();
                    let payload = publish.payload.to_vec();
                    let _ = self.queue.submit(move || async move { this.handle_message(&topic, &payload).await }).await;
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("mqtt event loop error: {}", err);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    /// Substring-match dispatch: the first registered topic that is a
    /// substring of the inbound topic handles the message. On failure,
    /// echoes the caller's `publishId`/`publishTime` (when present in the
    /// request) back in the `getLastError` publish.
    async fn handle_message(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let result = if topic.contains(TOPIC_CONNECT_DEVICE) {
            self.handle_connect_device(payload).await
        } else if topic.contains(TOPIC_DISCONNECT_DEVICE) {
            self.handle_disconnect_device(payload).await
        } else if topic.contains(TOPIC_SEND_TO_DEVICE) {
            self.handle_send_to_device(payload).await
        } else if topic.contains(TOPIC_REMOVE_DEVICES) {
            self.handle_remove_devices(payload).await
        } else if topic.contains(TOPIC_CONNECT_BENCHMARK) {
            self.handle_connect_benchmark(payload).await
        } else {
            Ok(())
        };

        if let Err(err) = result {
            let (publish_id, publish_time) = extract_publish_meta(payload);
            self.publish_last_error(publish_id, publish_time, err.to_string()).await;
        }
    }

    async fn handle_connect_device(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let body: ConnectDeviceBody = serde_json::from_slice(payload)?;
        let address: Address = body.device.address.parse().map_err(|_| {
            crate::error::Error::with(crate::error::ErrorKind::Parse("address".into()), "invalid address")
        })?;

        self.cache.request_connect_with_pincode(address, &body.device.pincode).await?;

        let client = {
            let mut outbound = self.outbound.lock().await;
            if let Some(existing) = outbound.get(&address) {
                existing.clone()
            } else {
                let client = Client::new(ClientConfig::default());
                outbound.insert(address, client.clone());
                client
            }
        };
        self.wire_outbound_client(&client, address);
        client.connect(address, 0).await?;

        let name = self.cache.find_device(address).map(|d| d.name).unwrap_or_default();
        self.publish_device_event(TOPIC_NEW_CONNECTION, address, &name).await;
        Ok(())
    }

    fn wire_outbound_client(self: &Arc<Self>, client: &Arc<Client>, address: Address) {
        let this = self.clone();
        client.on_data_received(move |addr, bytes| {
            let this = this.clone();
            tokio::spawn(async move { this.publish_data_event(addr, bytes).await });
        });

        let this2 = self.clone();
        client.on_disconnected(move |addr, _channel| {
            let this2 = this2.clone();
            tokio::spawn(async move {
                this2.outbound.lock().await.remove(&addr);
                let name = this2.cache.find_device(addr).map(|d| d.name).unwrap_or_default();
                this2.publish_device_event(TOPIC_LOSE_CONNECTION, addr, &name).await;
            });
        });
        let _ = address;
    }

    async fn handle_disconnect_device(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let body: DisconnectDeviceBody = serde_json::from_slice(payload)?;
        let address: Address = body.device.address.parse().map_err(|_| {
            crate::error::Error::with(crate::error::ErrorKind::Parse("address".into()), "invalid address")
        })?;

        if let Some(client) = self.outbound.lock().await.get(&address).cloned() {
            client.disconnect(address, 0).await;
        }
        if let Some(id) = self.inbound_index.lock().await.get(&address).copied() {
            self.server.disconnect_client(id).await;
        }
        Ok(())
    }

    async fn handle_send_to_device(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let body: SendToDeviceBody = serde_json::from_slice(payload)?;
        let address: Address = body.device.address.parse().map_err(|_| {
            crate::error::Error::with(crate::error::ErrorKind::Parse("address".into()), "invalid address")
        })?;
        let bytes = BASE64.decode(body.device.data.as_bytes()).map_err(|_| {
            crate::error::Error::with(crate::error::ErrorKind::Parse("data".into()), "invalid base64")
        })?;
        if bytes.len() != body.device.size as usize {
            return Err(crate::error::Error::with(
                crate::error::ErrorKind::Parse("size".into()),
                "数据校验失败",
            ));
        }

        if let Some(id) = self.inbound_index.lock().await.get(&address).copied() {
            let _ = self.server.send_to_client(id, &bytes).await;
        }
        if let Some(client) = self.outbound.lock().await.get(&address).cloned() {
            let _ = client.send(&bytes).await;
        }
        Ok(())
    }

    async fn handle_remove_devices(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let body: RemoveDevicesBody = serde_json::from_slice(payload)?;
        let addresses: Vec<String> = match body.address {
            AddressOrList::One(addr) => vec![addr],
            AddressOrList::Many(addrs) => addrs,
        };

        let mut errors = Vec::new();
        for raw in addresses {
            match raw.parse::<Address>() {
                Ok(address) => {
                    if let Err(err) = self.cache.request_remove_device(address).await {
                        errors.push(err.to_string());
                    }
                }
                Err(_) => errors.push(format!("invalid address: {}", raw)),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(crate::error::Error::with(crate::error::ErrorKind::Internal(errors.join("; ")), "removeDevices failed"))
        }
    }

    /// Internal test helper: publishes alternating connect/disconnect
    /// requests `2*times` times at 100 ms cadence on the same bus.
    async fn handle_connect_benchmark(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let body: ConnectBenchmarkBody = serde_json::from_slice(payload)?;
        let this = self.clone();
        tokio::spawn(async move {
            for i in 0..(body.times * 2) {
                let topic = if i % 2 == 0 { TOPIC_CONNECT_DEVICE } else { TOPIC_DISCONNECT_DEVICE };
                let payload = serde_json::json!({ "device": { "address": body.address } });
                this.publish_via_queue(topic, payload.to_string()).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        Ok(())
    }

    async fn publish_device_event(&self, topic: &'static str, address: Address, name: &str) {
        let payload = serde_json::json!({
            "device": DeviceEventPayload {
                address: address.to_string(),
                name: name.to_string(),
                publish_id: publish_id(),
                publish_time: publish_time(),
            }
        });
        self.publish_via_queue(topic, payload.to_string()).await;
    }

    async fn publish_data_event(&self, address: Address, bytes: Vec<u8>) {
        let payload = serde_json::json!({
            "device": DataEventPayload {
                address: address.to_string(),
                data: BASE64.encode(&bytes),
                size: bytes.len(),
                publish_id: publish_id(),
                publish_time: publish_time(),
            }
        });
        self.publish_via_queue(TOPIC_RECEIVE_FROM_DEVICE, payload.to_string()).await;
    }

    async fn publish_last_error(&self, subscribe_id: Option<String>, subscribe_time: Option<String>, message: String) {
        let payload = LastErrorPayload {
            subscribe_id: subscribe_id.unwrap_or_else(publish_id),
            subscribe_time: subscribe_time.unwrap_or_else(publish_time),
            message,
        };
        if let Ok(body) = serde_json::to_string(&payload) {
            self.publish_via_queue(TOPIC_GET_LAST_ERROR, body).await;
        }
    }

    /// Publishes the current adapter and device inventories; called by the
    /// host's periodic ticker.
    pub async fn publish_inventory(&self) {
        let adapters = self.cache.get_adapters();
        let devices = self.cache.get_devices();
        if let Ok(body) = serde_json::to_string(&adapters) {
            self.publish_via_queue(TOPIC_GET_ADAPTERS, body).await;
        }
        if let Ok(body) = serde_json::to_string(&devices) {
            self.publish_via_queue(TOPIC_GET_DEVICES, body).await;
        }
    }

    /// Wires the RFCOMM server's lifecycle and data callbacks into the
    /// Proxy. Call once after construction, before `Server::start`.
    pub fn wire_server(self: &Arc<Self>) {
        let this = self.clone();
        self.server.on_client_connected(move |id, addr| {
            let this = this.clone();
            tokio::spawn(async move {
                this.inbound_index.lock().await.insert(addr, id);
                let name = this.cache.find_device(addr).map(|d| d.name).unwrap_or_default();
                this.publish_device_event(TOPIC_NEW_CONNECTION, addr, &name).await;
            });
        });

        let this2 = self.clone();
        self.server.on_client_disconnected(move |_id, addr| {
            let this2 = this2.clone();
            tokio::spawn(async move {
                this2.inbound_index.lock().await.remove(&addr);
                let name = this2.cache.find_device(addr).map(|d| d.name).unwrap_or_default();
                this2.publish_device_event(TOPIC_LOSE_CONNECTION, addr, &name).await;
            });
        });

        let this3 = self.clone();
        self.server.on_data_received(move |addr, bytes| {
            let this3 = this3.clone();
            tokio::spawn(async move { this3.publish_data_event(addr, bytes).await });
        });
    }

    pub async fn wait_for_all(&self) {
        self.queue.wait_for_all().await;
    }

    pub async fn shutdown(&self) {
        self.queue.stop().await;
    }
}
