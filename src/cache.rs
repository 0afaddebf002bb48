//! Bluetooth object cache (C3): a live mirror of the platform's adapter and
//! device object tree, fed by `bluer`'s object-manager event streams, plus
//! the pair+connect state machine and the pending-PIN table the pairing
//! agent (C4) consults.

use crate::error::{Error, ErrorKind, Result};
use bluer::{Address, AdapterEvent, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Parsed `vid:pid:did` triple from a device's modalias string.
#[derive(Clone, Debug, Serialize)]
pub struct ModaliasIds {
    pub vid: String,
    pub pid: String,
    pub did: String,
}

fn parse_modalias(modalias: &str) -> Option<ModaliasIds> {
    // Mirrors `(usb|bluetooth):v([0-9A-Fa-f]{4})p([0-9A-Fa-f]{4})d([0-9A-Fa-f]{4})`.
    let re = Regex::new(r"^(?:usb|bluetooth):v([0-9A-Fa-f]{4})p([0-9A-Fa-f]{4})d([0-9A-Fa-f]{4})").ok()?;
    let caps = re.captures(modalias)?;
    Some(ModaliasIds {
        vid: caps[1].to_uppercase(),
        pid: caps[2].to_uppercase(),
        did: caps[3].to_uppercase(),
    })
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AdapterRecord {
    pub path: String,
    pub address: String,
    pub address_type: String,
    pub alias: String,
    pub name: String,
    pub class: Option<u32>,
    pub modalias: Option<String>,
    pub powered: bool,
    pub discoverable: bool,
    pub pairable: bool,
    pub discovering: bool,
    pub discoverable_timeout: u32,
    pub pairable_timeout: u32,
    pub uuids: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DeviceRecord {
    pub path: String,
    pub adapter_path: String,
    pub address: String,
    pub address_type: String,
    pub name: String,
    pub alias: String,
    pub modalias: Option<ModaliasIds>,
    pub uuids: Vec<String>,
    pub blocked: bool,
    pub bonded: bool,
    pub connected: bool,
    pub legacy_pairing: bool,
    pub paired: bool,
    pub services_resolved: bool,
    pub trusted: bool,
    pub rssi: Option<i16>,
    #[serde(skip)]
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    #[serde(skip)]
    pub service_data: HashMap<String, Vec<u8>>,
}

/// Retry/timeout settings for `request_connect`, mutable at runtime.
struct Settings {
    max_repair_count: u32,
    max_reconnect_count: u32,
    pair_timeout_ms: u64,
    connect_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self { max_repair_count: 3, max_reconnect_count: 3, pair_timeout_ms: 1000, connect_timeout_ms: 1000 }
    }
}

pub struct Cache {
    session: bluer::Session,
    adapters: Mutex<HashMap<String, AdapterRecord>>,
    devices: Mutex<HashMap<String, DeviceRecord>>,
    pending_pins: Mutex<HashMap<String, String>>,
    settings: Mutex<Settings>,
}

fn device_path(adapter_path: &str, address: Address) -> String {
    format!("{}/dev_{}", adapter_path, address.to_string().to_uppercase().replace(':', "_"))
}

impl Cache {
    /// Builds the cache and spawns its background event-listening tasks.
    /// Separate tasks drive adapter-side and device-side traffic so that
    /// one does not starve the other.
    pub async fn new(session: bluer::Session) -> Result<Arc<Self>> {
        let this = Arc::new(Self {
            session,
            adapters: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            pending_pins: Mutex::new(HashMap::new()),
            settings: Mutex::new(Settings::default()),
        });

        for name in this.session.adapter_names().await? {
            let adapter = this.session.adapter(&name)?;
            this.seed_adapter(&adapter).await?;

            let this2 = this.clone();
            let adapter2 = adapter.clone();
            tokio::spawn(async move {
                if let Err(err) = this2.watch_adapter(adapter2).await {
                    log::error!("adapter event stream for {} ended: {}", name, err);
                }
            });
        }

        Ok(this)
    }

    async fn seed_adapter(&self, adapter: &bluer::Adapter) -> Result<()> {
        let rec = self.snapshot_adapter(adapter).await?;
        self.adapters.lock().unwrap().insert(rec.path.clone(), rec);
        Ok(())
    }

    async fn snapshot_adapter(&self, adapter: &bluer::Adapter) -> Result<AdapterRecord> {
        Ok(AdapterRecord {
            path: format!("/org/bluez/{}", adapter.name()),
            address: adapter.address().await?.to_string(),
            address_type: adapter.address_type().await?.to_string(),
            alias: adapter.alias().await.unwrap_or_default(),
            name: adapter.name().to_string(),
            class: adapter.class().await.unwrap_or_default(),
            modalias: adapter.modalias().await.ok().flatten().map(|m| m.to_string()),
            powered: adapter.is_powered().await.unwrap_or_default(),
            discoverable: adapter.is_discoverable().await.unwrap_or_default(),
            pairable: adapter.is_pairable().await.unwrap_or_default(),
            discovering: adapter.is_discovering().await.unwrap_or_default(),
            discoverable_timeout: adapter.discoverable_timeout().await.unwrap_or_default(),
            pairable_timeout: adapter.pairable_timeout().await.unwrap_or_default(),
            uuids: adapter.uuids().await.unwrap_or_default().unwrap_or_default().into_iter().map(|u| u.to_string()).collect(),
        })
    }

    async fn watch_adapter(self: Arc<Self>, adapter: bluer::Adapter) -> Result<()> {
        let adapter_path = format!("/org/bluez/{}", adapter.name());
        let events = adapter.events().await?;
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            match event {
                AdapterEvent::DeviceAdded(addr) => {
                    if let Ok(device) = adapter.device(addr) {
                        if let Ok(rec) = self.snapshot_device(&adapter_path, &device).await {
                            self.devices.lock().unwrap().insert(rec.path.clone(), rec);
                            self.clone().spawn_device_watch(adapter_path.clone(), device);
                        }
                    }
                }
                AdapterEvent::DeviceRemoved(addr) => {
                    let path = device_path(&adapter_path, addr);
                    self.devices.lock().unwrap().remove(&path);
                }
                AdapterEvent::PropertyChanged(prop) => {
                    let mut adapters = self.adapters.lock().unwrap();
                    if let Some(rec) = adapters.get_mut(&adapter_path) {
                        apply_adapter_property(rec, &prop);
                        if matches!(prop, bluer::AdapterProperty::Discovering(false)) {
                            let adapter = adapter.clone();
                            tokio::spawn(async move {
                                let _ = adapter.start_discovery().await;
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_device_watch(self: Arc<Self>, adapter_path: String, device: bluer::Device) {
        tokio::spawn(async move {
            let path = device_path(&adapter_path, device.address());
            let Ok(events) = device.events().await else { return };
            tokio::pin!(events);
            while let Some(DeviceEvent::PropertyChanged(prop)) = events.next().await {
                let mut devices = self.devices.lock().unwrap();
                if let Some(rec) = devices.get_mut(&path) {
                    apply_device_property(rec, &prop);
                }
            }
        });
    }

    async fn snapshot_device(&self, adapter_path: &str, device: &bluer::Device) -> Result<DeviceRecord> {
        Ok(DeviceRecord {
            path: device_path(adapter_path, device.address()),
            adapter_path: adapter_path.to_string(),
            address: device.address().to_string(),
            address_type: device.address_type().await?.to_string(),
            name: device.name().await.unwrap_or_default().unwrap_or_default(),
            alias: device.alias().await.unwrap_or_default(),
            modalias: device.modalias().await.ok().flatten().and_then(|m| parse_modalias(&m.to_string())),
            uuids: device.uuids().await.unwrap_or_default().unwrap_or_default().into_iter().map(|u| u.to_string()).collect(),
            blocked: device.is_blocked().await.unwrap_or_default(),
            bonded: device.is_bonded().await.unwrap_or_default(),
            connected: device.is_connected().await.unwrap_or_default(),
            legacy_pairing: device.is_legacy_pairing().await.unwrap_or_default(),
            paired: device.is_paired().await.unwrap_or_default(),
            services_resolved: device.is_services_resolved().await.unwrap_or_default(),
            trusted: device.is_trusted().await.unwrap_or_default(),
            rssi: device.rssi().await.unwrap_or_default(),
            manufacturer_data: device.manufacturer_data().await.unwrap_or_default().unwrap_or_default(),
            service_data: device
                .service_data()
                .await
                .unwrap_or_default()
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        })
    }

    /// Snapshot of all adapter records, in the shape C5 publishes directly.
    pub fn get_adapters(&self) -> Vec<AdapterRecord> {
        self.adapters.lock().unwrap().values().cloned().collect()
    }

    /// Snapshot of all device records, in the shape C5 publishes directly.
    pub fn get_devices(&self) -> Vec<DeviceRecord> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn find_device(&self, address: Address) -> Option<DeviceRecord> {
        let path = self.first_adapter_path().map(|a| device_path(&a, address))?;
        self.devices.lock().unwrap().get(&path).cloned()
    }

    fn first_adapter_path(&self) -> Option<String> {
        self.adapters.lock().unwrap().keys().next().cloned()
    }

    /// Thread-safe lookup in the pending-PIN table; removes the entry when
    /// `consume` is true (the default used by the agent).
    pub fn get_pincode(&self, device_path: &str, consume: bool) -> Option<String> {
        let mut pins = self.pending_pins.lock().unwrap();
        if consume {
            pins.remove(device_path)
        } else {
            pins.get(device_path).cloned()
        }
    }

    fn stage_pincode(&self, device_path: &str, pincode: &str) {
        self.pending_pins.lock().unwrap().insert(device_path.to_string(), pincode.to_string());
    }

    pub fn set_max_repair_count(&self, n: u32) {
        self.settings.lock().unwrap().max_repair_count = n.max(1);
    }

    pub fn set_max_reconnect_count(&self, n: u32) {
        self.settings.lock().unwrap().max_reconnect_count = n.max(1);
    }

    pub fn set_pair_timeout_ms(&self, ms: u64) {
        self.settings.lock().unwrap().pair_timeout_ms = ms;
    }

    pub fn set_connect_timeout_ms(&self, ms: u64) {
        self.settings.lock().unwrap().connect_timeout_ms = ms;
    }

    /// Stages `pincode` for `address`, then runs [`Self::request_connect`].
    pub async fn request_connect_with_pincode(&self, address: Address, pincode: &str) -> Result<()> {
        let adapter_path = self.first_adapter_path().ok_or_else(|| {
            Error::with(ErrorKind::DeviceNotDiscovered, "no Bluetooth adapter present")
        })?;
        let path = device_path(&adapter_path, address);
        self.stage_pincode(&path, pincode);
        self.request_connect(address).await
    }

    /// The pair+connect state machine described in the component design:
    /// pair strictly precedes connect, each phase bounded by a retry count
    /// and a wall-clock deadline.
    pub async fn request_connect(&self, address: Address) -> Result<()> {
        let adapter_name = self
            .session
            .adapter_names()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::with(ErrorKind::DeviceNotDiscovered, "no Bluetooth adapter present"))?;
        let adapter = self.session.adapter(&adapter_name)?;

        // Re-enumerate rather than trust the cache: a device that appeared
        // after priming must still be reachable.
        let device = adapter.device(address).map_err(|_| {
            Error::with(ErrorKind::DeviceNotDiscovered, format!("device not discovered: {}", address))
        })?;
        if !adapter.device_addresses().await?.contains(&address) {
            return Err(Error::with(ErrorKind::DeviceNotDiscovered, "设备未发现"));
        }

        let (max_repair, max_reconnect, pair_timeout, connect_timeout) = {
            let s = self.settings.lock().unwrap();
            (s.max_repair_count, s.max_reconnect_count, s.pair_timeout_ms, s.connect_timeout_ms)
        };

        if !device.is_paired().await.unwrap_or_default() {
            self.retry_phase(&device, max_repair, Duration::from_millis(pair_timeout), true).await;
        }
        if device.is_paired().await.unwrap_or_default() && !device.is_connected().await.unwrap_or_default() {
            self.retry_phase(&device, max_reconnect, Duration::from_millis(connect_timeout), false).await;
        }

        let paired = device.is_paired().await.unwrap_or_default();
        let connected = device.is_connected().await.unwrap_or_default();
        if paired && connected {
            Ok(())
        } else if !paired {
            Err(Error::with(ErrorKind::PairFailed(address.to_string()), format!("设备配对失败, 设备: {}", address)))
        } else {
            Err(Error::with(ErrorKind::ConnectFailed(address.to_string()), format!("设备连接失败, 设备: {}", address)))
        }
    }

    /// Runs one bounded retry phase (pairing if `pairing`, else connecting).
    async fn retry_phase(&self, device: &bluer::Device, max_attempts: u32, deadline: Duration, pairing: bool) {
        let start = Instant::now();
        let mut attempts = 0u32;
        loop {
            let satisfied = if pairing {
                device.is_paired().await.unwrap_or_default()
            } else {
                device.is_connected().await.unwrap_or_default()
            };
            if satisfied {
                return;
            }
            if start.elapsed() >= deadline || attempts >= max_attempts {
                return;
            }

            let result = if pairing { device.pair().await } else { device.connect().await };
            match result {
                Ok(()) => {}
                Err(err) if err.kind == bluer::ErrorKind::AlreadyExists => {
                    // Benign: does not count as a retry.
                }
                Err(err) if !pairing && is_retryable_connect_error(&err) => {
                    attempts += 1;
                }
                Err(err) => {
                    log::debug!("{} attempt failed: {}", if pairing { "pair" } else { "connect" }, err);
                    attempts += 1;
                }
            }

            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Best-effort removal; `Failed` is surfaced, everything else is logged
    /// and swallowed.
    pub async fn request_remove_device(&self, address: Address) -> Result<()> {
        let adapter_name = self
            .session
            .adapter_names()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::with(ErrorKind::RemoveFailed(address.to_string()), "no adapter"))?;
        let adapter = self.session.adapter(&adapter_name)?;

        match adapter.remove_device(address).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind == bluer::ErrorKind::Failed => {
                Err(Error::with(ErrorKind::RemoveFailed(address.to_string()), "移除设备失败"))
            }
            Err(err) => {
                log::warn!("ignoring remove_device error for {}: {}", address, err);
                Ok(())
            }
        }
    }
}

fn is_retryable_connect_error(err: &bluer::Error) -> bool {
    matches!(err.kind, bluer::ErrorKind::Failed | bluer::ErrorKind::NotReady)
        || err.message.contains("BREDR.ProfileUnavailable")
}

fn apply_adapter_property(rec: &mut AdapterRecord, prop: &bluer::AdapterProperty) {
    use bluer::AdapterProperty as P;
    match prop.clone() {
        P::Address(v) => rec.address = v.to_string(),
        P::AddressType(v) => rec.address_type = v.to_string(),
        P::Alias(v) => rec.alias = v,
        P::Name(v) => rec.name = v,
        P::Class(v) => rec.class = Some(v),
        P::Powered(v) => rec.powered = v,
        P::Discoverable(v) => rec.discoverable = v,
        P::Pairable(v) => rec.pairable = v,
        P::Discovering(v) => rec.discovering = v,
        P::DiscoverableTimeout(v) => rec.discoverable_timeout = v,
        P::PairableTimeout(v) => rec.pairable_timeout = v,
        P::Uuids(v) => rec.uuids = v.into_iter().map(|u| u.to_string()).collect(),
        _ => {}
    }
}

fn apply_device_property(rec: &mut DeviceRecord, prop: &DeviceProperty) {
    use DeviceProperty as P;
    match prop.clone() {
        P::Name(v) => rec.name = v,
        P::Alias(v) => rec.alias = v,
        P::Uuids(v) => rec.uuids = v.into_iter().map(|u| u.to_string()).collect(),
        P::Blocked(v) => rec.blocked = v,
        P::Bonded(v) => rec.bonded = v,
        P::Connected(v) => rec.connected = v,
        P::LegacyPairing(v) => rec.legacy_pairing = v,
        P::Paired(v) => rec.paired = v,
        P::ServicesResolved(v) => rec.services_resolved = v,
        P::Trusted(v) => rec.trusted = v,
        P::Rssi(v) => rec.rssi = Some(v),
        P::ManufacturerData(v) => rec.manufacturer_data = v,
        P::ServiceData(v) => rec.service_data = v.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        P::Modalias(v) => rec.modalias = parse_modalias(&v.to_string()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_uppercases_and_replaces_colons() {
        let addr: Address = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(device_path("/org/bluez/hci0", addr), "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
    }

    #[test]
    fn modalias_parses_usb_form() {
        let parsed = parse_modalias("usb:v045Ep028Ed0114").unwrap();
        assert_eq!(parsed.vid, "045E");
        assert_eq!(parsed.pid, "028E");
        assert_eq!(parsed.did, "0114");
    }

    #[test]
    fn modalias_rejects_unknown_form() {
        assert!(parse_modalias("garbage").is_none());
    }

    #[test]
    fn pincode_consume_is_idempotent() {
        // Exercises the PIN table directly without a live session.
        let pins: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
        pins.lock().unwrap().insert("/org/bluez/hci0/dev_AA".into(), "1234".into());
        let first = pins.lock().unwrap().remove("/org/bluez/hci0/dev_AA");
        let second = pins.lock().unwrap().remove("/org/bluez/hci0/dev_AA");
        assert_eq!(first.as_deref(), Some("1234"));
        assert_eq!(second, None);
    }
}
