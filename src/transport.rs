//! # Transport Layer
//!
//! The transport is the socket collaborator of a connection manager. It only
//! knows how to open a link, push bytes out and report what comes back:
//!
//! - `connect(events)` opens the link and starts delivering
//!   [`TransportEvent`]s on the given channel
//! - `write(bytes) -> bool` sends one frame; `false` means the link is gone
//! - `disconnect()` closes the link
//! - `is_connected()` reports the local view of the link
//!
//! Framing, transaction ids and timeouts live above this layer, so a test can
//! swap the TCP implementation for a scripted one.
//!
//! ## Statistics
//!
//! ```rust,no_run
//! # use voltage_poll::transport::Transport;
//! # fn example(transport: &dyn Transport) {
//! let stats = transport.stats();
//! println!("Requests sent: {}", stats.requests_sent);
//! println!("Bytes received: {}", stats.bytes_received);
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::info;

use crate::error::{ModbusError, ModbusResult};

/// Read buffer size of the TCP reader task
const READ_BUFFER_SIZE: usize = 512;

/// What the transport reports back to its connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Bytes received from the device, in arbitrary chunks
    Response(Vec<u8>),
    /// The link went down
    Closed(ModbusError),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Socket collaborator of a connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link; received bytes and link loss are reported on `events`
    async fn connect(&self, events: EventSender) -> ModbusResult<()>;

    /// Close the link. Closing an already closed link is a no-op.
    async fn disconnect(&self);

    /// Send one frame, `false` when it could not be written
    async fn write(&self, frame: &[u8]) -> bool;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> TransportStats;

    /// Count a transaction that went unanswered
    fn record_timeout(&self) {}
}

/// Format raw bytes as hex string for packet logging
fn format_hex_packet(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Log packet with direction
fn log_packet(direction: &str, address: &str, data: &[u8]) {
    info!("[MODBUS-TCP] {} {} {}", direction, address, format_hex_packet(data));
}

/// Modbus TCP transport over a tokio socket
pub struct TcpTransport {
    address: String,
    write_timeout: Duration,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<TransportStats>>,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpTransport {
    /// Create a transport for `address` (`ip:port`); nothing is opened yet
    pub fn new(address: impl Into<String>, write_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            write_timeout,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(TransportStats::default())),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn spawn_reader(&self, mut reader: tokio::net::tcp::OwnedReadHalf, events: EventSender) -> JoinHandle<()> {
        let connected = self.connected.clone();
        let stats = self.stats.clone();
        let address = self.address.clone();
        let packet_logging = self.packet_logging;

        tokio::spawn(async move {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            let reason = loop {
                match reader.read(&mut buffer).await {
                    Ok(0) => break ModbusError::connection(format!("{} closed by peer", address)),
                    Ok(n) => {
                        {
                            let mut stats = stats.lock();
                            stats.responses_received += 1;
                            stats.bytes_received += n as u64;
                        }
                        if packet_logging {
                            log_packet("receive", &address, &buffer[..n]);
                        }
                        if events.send(TransportEvent::Response(buffer[..n].to_vec())).is_err() {
                            // Nobody is listening any more
                            connected.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    Err(e) => {
                        stats.lock().errors += 1;
                        break ModbusError::io(format!("{}: {}", address, e));
                    }
                }
            };
            connected.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Closed(reason));
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, events: EventSender) -> ModbusResult<()> {
        self.disconnect().await;

        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| ModbusError::connection(format!("Failed to connect to {}: {}", self.address, e)))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        let handle = self.spawn_reader(reader, events);
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn write(&self, frame: &[u8]) -> bool {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return false,
        };

        if self.packet_logging {
            log_packet("send", &self.address, frame);
        }

        match timeout(self.write_timeout, writer.write_all(frame)).await {
            Ok(Ok(())) => {
                let mut stats = self.stats.lock();
                stats.requests_sent += 1;
                stats.bytes_sent += frame.len() as u64;
                true
            }
            Ok(Err(_)) | Err(_) => {
                {
                    let mut stats = self.stats.lock();
                    stats.errors += 1;
                }
                // Mark connection as broken
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }

    fn record_timeout(&self) {
        let mut stats = self.stats.lock();
        stats.timeouts += 1;
        stats.errors += 1;
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}
