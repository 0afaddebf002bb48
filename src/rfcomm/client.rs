//! RFCOMM client (C2, Client half): an outbound connection to a remote
//! address+channel with a background receive worker.

use super::duration_ms;
use crate::error::{Error, ErrorKind, Result};
use crate::sdp;
use bluer::rfcomm::stream::OwnedWriteHalf;
use bluer::rfcomm::{Socket, SocketAddr, Stream};
use bluer::Address;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

type ConnectedFn = Arc<dyn Fn(Address, u8) + Send + Sync>;
type DisconnectedFn = Arc<dyn Fn(Address, u8) + Send + Sync>;
type DataFn = Arc<dyn Fn(Address, Vec<u8>) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub buffer_size: usize,
    pub connect_timeout_ms: u64,
    pub recv_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { buffer_size: 1024, connect_timeout_ms: 1000, recv_timeout_ms: 1000 }
    }
}

struct Connection {
    channel: u8,
    running: Arc<AtomicBool>,
    write_half: Arc<AsyncMutex<OwnedWriteHalf>>,
    worker: JoinHandle<()>,
}

/// An outbound RFCOMM connection to a single remote address. At most one
/// [`Connection`] is held at a time; connecting again while connected
/// replaces it after disconnecting the old one.
pub struct Client {
    config: ClientConfig,
    on_connected: std::sync::Mutex<Option<ConnectedFn>>,
    on_disconnected: std::sync::Mutex<Option<DisconnectedFn>>,
    on_data: std::sync::Mutex<Option<DataFn>>,
    conn: AsyncMutex<Option<Connection>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            on_connected: std::sync::Mutex::new(None),
            on_disconnected: std::sync::Mutex::new(None),
            on_data: std::sync::Mutex::new(None),
            conn: AsyncMutex::new(None),
        })
    }

    pub fn on_connected(&self, f: impl Fn(Address, u8) + Send + Sync + 'static) {
        *self.on_connected.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn on_disconnected(&self, f: impl Fn(Address, u8) + Send + Sync + 'static) {
        *self.on_disconnected.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn on_data_received(&self, f: impl Fn(Address, Vec<u8>) + Send + Sync + 'static) {
        *self.on_data.lock().unwrap() = Some(Arc::new(f));
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Connects to `addr` on `channel`; `channel == 0` triggers SDP channel
    /// discovery first, surfacing `TransportServiceNotFound` if that fails.
    pub async fn connect(self: &Arc<Self>, addr: Address, channel: u8) -> Result<()> {
        let channel = if channel == 0 {
            sdp::find_spp_channel(addr).map_err(|_| Error::new(ErrorKind::TransportServiceNotFound))?
        } else {
            channel
        };
        if channel == 0 {
            return Err(Error::new(ErrorKind::TransportServiceNotFound));
        }

        let socket = Socket::new().map_err(|_| Error::new(ErrorKind::TransportConnectFailed))?;
        let peer = SocketAddr::new(addr, channel);

        let stream: Stream = match timeout(duration_ms(self.config.connect_timeout_ms), socket.connect(peer)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) => return Err(Error::new(ErrorKind::TransportConnectFailed)),
            Err(_) => return Err(Error::new(ErrorKind::TransportConnectTimeout)),
        };

        let (mut read_half, write_half) = stream.into_split();
        let running = Arc::new(AtomicBool::new(true));
        let write_half = Arc::new(AsyncMutex::new(write_half));

        let this = self.clone();
        let worker_running = running.clone();
        let buffer_size = self.config.buffer_size;
        let recv_timeout = self.config.recv_timeout_ms;
        let worker = tokio::spawn(async move {
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
                    Err(_) => continue,
                }
            }
            // Never disconnect synchronously from within this worker's own
            // task: spawn the teardown so the worker is not joining itself.
            let this = this.clone();
            tokio::spawn(async move { this.disconnect(addr, channel).await });
        });

        *self.conn.lock().await = Some(Connection { channel, running, write_half, worker });

        if let Some(cb) = self.on_connected.lock().unwrap().clone() {
            cb(addr, channel);
        }
        Ok(())
    }

    /// Writes the full buffer once, serialized under the connection lock.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize> {
        let write_half = {
            let conn = self.conn.lock().await;
            conn.as_ref().ok_or_else(|| Error::new(ErrorKind::TransportNotConnected))?.write_half.clone()
        };
        let mut wh = write_half.lock().await;
        wh.write_all(bytes).await.map_err(|_| Error::new(ErrorKind::TransportWriteFailed))?;
        Ok(bytes.len())
    }

    /// Idempotent disconnect: clears the connection, joins the worker if
    /// called from outside it, and fires the disconnected callback.
    pub async fn disconnect(&self, addr: Address, channel: u8) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.running.store(false, Ordering::SeqCst);
            // Join the receive worker before declaring the connection closed;
            // it unblocks within recv_timeout_ms once `running` goes false.
            // Dropping `conn.write_half` here, plus the worker's own
            // `read_half` going out of scope when its loop returns, releases
            // the last references to the split stream's shared fd.
            let _ = conn.worker.await;
            if let Some(cb) = self.on_disconnected.lock().unwrap().clone() {
                cb(addr, channel);
            }
        }
    }
}
