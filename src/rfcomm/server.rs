//! RFCOMM server (C2, Server half).

use super::duration_ms;
use crate::error::{Error, ErrorKind, Result};
use crate::sdp::{self, SdpHandle, SPP_UUID};
use bluer::rfcomm::{Listener, SocketAddr, Stream};
use bluer::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

type ConnectedFn = Arc<dyn Fn(u64, Address) + Send + Sync>;
type DisconnectedFn = Arc<dyn Fn(u64, Address) + Send + Sync>;
type DataFn = Arc<dyn Fn(Address, Vec<u8>) + Send + Sync>;

/// Server configuration, settable before [`Server::start`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub service_name: String,
    /// 0 means auto-allocate via SDP channel discovery, falling back to 1.
    pub channel: u8,
    pub buffer_size: usize,
    pub accept_timeout_ms: u64,
    pub recv_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: "bluetooth-mqtt-bridge".to_string(),
            channel: 0,
            buffer_size: 1024,
            accept_timeout_ms: 1000,
            recv_timeout_ms: 1000,
        }
    }
}

struct ClientRecord {
    address: Address,
    running: Arc<AtomicBool>,
    write_half: Arc<AsyncMutex<bluer::rfcomm::stream::OwnedWriteHalf>>,
    connected_at: Instant,
}

/// A listening RFCOMM server accepting peers and running a receive worker
/// task per accepted client.
pub struct Server {
    config: ServerConfig,
    on_connected: Mutex<Option<ConnectedFn>>,
    on_disconnected: Mutex<Option<DisconnectedFn>>,
    on_data: Mutex<Option<DataFn>>,
    clients: Mutex<HashMap<u64, ClientRecord>>,
    next_id: AtomicU64,
    sdp_handle: Mutex<Option<SdpHandle>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            on_connected: Mutex::new(None),
            on_disconnected: Mutex::new(None),
            on_data: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sdp_handle: Mutex::new(None),
            accept_task: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn on_client_connected(&self, f: impl Fn(u64, Address) + Send + Sync + 'static) {
        *self.on_connected.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn on_client_disconnected(&self, f: impl Fn(u64, Address) + Send + Sync + 'static) {
        *self.on_disconnected.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn on_data_received(&self, f: impl Fn(Address, Vec<u8>) + Send + Sync + 'static) {
        *self.on_data.lock().unwrap() = Some(Arc::new(f));
    }

    /// Binds the listen socket, registers the SPP record, and spawns the
    /// accept worker.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let channel = if self.config.channel == 0 {
            sdp::find_spp_channel(Address::any()).unwrap_or(1)
        } else {
            self.config.channel
        };

        let listener = Listener::bind(SocketAddr::new(Address::any(), channel))
            .await
            .map_err(|_| Error::new(ErrorKind::TransportBindFailed))?;

        let handle = sdp::register_spp(&self.config.service_name, SPP_UUID, channel)
            .map_err(|_| Error::new(ErrorKind::TransportSdpFailed))?;
        *self.sdp_handle.lock().unwrap() = Some(handle);

        let this = self.clone();
        let task = tokio::spawn(async move { this.accept_loop(listener).await });
        *self.accept_task.lock().unwrap() = Some(task);

        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        while !self.stopping.load(Ordering::SeqCst) {
            match timeout(duration_ms(self.config.accept_timeout_ms), listener.accept()).await {
                Ok(Ok((stream, peer))) => self.handle_accepted(stream, peer.addr).await,
                Ok(Err(err)) => log::debug!("rfcomm accept error (ignored): {}", err),
                Err(_) => {} // accept-timeout, loop again and re-check stopping
            }
        }
    }

    async fn handle_accepted(self: &Arc<Self>, stream: Stream, addr: Address) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (mut read_half, write_half) = stream.into_split();
        let running = Arc::new(AtomicBool::new(true));
        let write_half = Arc::new(AsyncMutex::new(write_half));

        let this = self.clone();
        let worker_running = running.clone();
        let buffer_size = self.config.buffer_size;
        let recv_timeout = self.config.recv_timeout_ms;
        tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size];
            loop {
                if !worker_running.load(Ordering::SeqCst) {
                    break;
                }
                match timeout(duration_ms(recv_timeout), read_half.read(&mut buf)).await {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        if let Some(cb) = this.on_data.lock().unwrap().clone() {
                            cb(addr, buf[..n].to_vec());
                        }
                    }
                    Ok(Err(_)) => break,
                    Err(_) => continue, // recv-timeout, keep waiting
                }
            }
            this.remove_client(id, addr).await;
        });

        self.clients.lock().unwrap().insert(
            id,
            ClientRecord { address: addr, running, write_half, connected_at: Instant::now() },
        );

        if let Some(cb) = self.on_connected.lock().unwrap().clone() {
            cb(id, addr);
        }
    }

    async fn remove_client(self: &Arc<Self>, id: u64, addr: Address) {
        let existed = self.clients.lock().unwrap().remove(&id).is_some();
        if existed {
            if let Some(cb) = self.on_disconnected.lock().unwrap().clone() {
                cb(id, addr);
            }
        }
    }

    /// Writes `bytes` to the client identified by `id`.
    pub async fn send_to_client(&self, id: u64, bytes: &[u8]) -> Result<usize> {
        let write_half = {
            let clients = self.clients.lock().unwrap();
            let rec = clients.get(&id).ok_or_else(|| Error::new(ErrorKind::TransportNotConnected))?;
            rec.write_half.clone()
        };
        let mut wh = write_half.lock().await;
        wh.write_all(bytes).await.map_err(|_| Error::new(ErrorKind::TransportWriteFailed))?;
        Ok(bytes.len())
    }

    /// Looks up the inbound client ID currently associated with `address`,
    /// if any (the most recently accepted live peer for that address).
    pub fn find_client_id(&self, address: Address) -> Option<u64> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, rec)| rec.address == address)
            .max_by_key(|(_, rec)| rec.connected_at)
            .map(|(id, _)| *id)
    }

    /// Best-effort write to every running client; returns the count of
    /// successful writes.
    pub async fn broadcast(&self, bytes: &[u8]) -> usize {
        let handles: Vec<(u64, Arc<AsyncMutex<bluer::rfcomm::stream::OwnedWriteHalf>>)> =
            self.clients.lock().unwrap().iter().map(|(id, rec)| (*id, rec.write_half.clone())).collect();
        let mut count = 0;
        for (_, wh) in handles {
            if wh.lock().await.write_all(bytes).await.is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Signals `id`'s worker to stop and waits for its own cleanup tail
    /// (which removes it from `clients` and fires `on_disconnected`) to run.
    ///
    /// Does not remove the record or abort the worker directly: aborting
    /// would cut the task off before its tail `remove_client` call, so
    /// `on_disconnected` would never fire and `clients` would keep a stale
    /// entry. The worker's own bounded-timeout read loop re-checks `running`
    /// at least once per `recv_timeout_ms`, so this returns within that bound.
    pub async fn disconnect_client(&self, id: u64) {
        let running = {
            let clients = self.clients.lock().unwrap();
            match clients.get(&id) {
                Some(rec) => rec.running.clone(),
                None => return,
            }
        };
        running.store(false, Ordering::SeqCst);
        while self.clients.lock().unwrap().contains_key(&id) {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Stops accepting, joins the accept worker, disconnects every client,
    /// and unregisters the SDP handle.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
            let _ = task.await;
        }

        let ids: Vec<u64> = self.clients.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.disconnect_client(id).await;
        }

        if let Some(handle) = self.sdp_handle.lock().unwrap().take() {
            if let Err(err) = sdp::unregister_spp(handle) {
                log::warn!("failed to unregister SPP record: {}", err);
            }
        }
    }
}
