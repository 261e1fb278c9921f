//! # Modbus Client
//!
//! The facade tying a built configuration to its connection managers and the
//! polling scheduler.
//!
//! ```text
//! init(config) ─► create() ─► connect(on_connected) ⇄ disconnect() ─► destroy()
//!     Init            Init          Connect              Disconnect      Destroy
//! ```
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_poll::{Channel, ClientOptions, ModbusClient, TreeDescriptor};
//!
//! # async fn example() -> voltage_poll::ModbusResult<()> {
//! let yaml = r#"
//! name: plant
//! children:
//!   - kind: connection
//!     name: boiler
//!     ip: 192.168.1.10
//!     children:
//!       - { kind: channel, name: setpoint, address: 4, region: Holdings, type: Int16 }
//! "#;
//! let config = TreeDescriptor::from_yaml_str(yaml)?.build()?;
//! config.set_read_channels(Arc::new(|channels: &[Arc<Channel>]| {
//!     for channel in channels {
//!         println!("{} = {}", channel.name, channel.read_value());
//!     }
//! }));
//!
//! let mut client = ModbusClient::new(ClientOptions::default());
//! client.init(config)?;
//! client.create()?;
//! client.connect(|| println!("connected")).await?;
//! client.write_channel("setpoint", 21.0)?;
//! # client.destroy().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::{Channel, Connection, ExhaustionPolicy, ModbusConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{CallbackLogger, LogLevel};
use crate::manager::{ConnectionListener, ConnectionManager};
use crate::scheduler::{DangerCallback, PollingScheduler, SchedulerHandle, Wakeup, DEFAULT_REQUEST_WAIT_MS};
use crate::transaction::Transaction;
use crate::transport::{TcpTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Init,
    Connect,
    Disconnect,
    Destroy,
}

/// Client lifecycle callbacks; every method defaults to a no-op
pub trait ClientListener: Send + Sync {
    fn on_init(&self) {}

    fn on_create(&self) {}

    fn on_connect(&self) {}

    fn on_disconnect(&self) {}

    fn on_destroy(&self) {}

    /// After every update tick, with the measured elapsed milliseconds
    fn on_tick(&self, _elapsed_ms: f32) {}
}

/// Builds the transport of a connection
pub type TransportFactory = Arc<dyn Fn(&Connection) -> Arc<dyn Transport> + Send + Sync>;

/// Client tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Upper bound of one scheduler wait in milliseconds
    pub request_wait_ms: u64,
    /// Whether the callback logger delivers to its sources
    pub logging_enabled: bool,
    /// Trace every TCP packet
    pub packet_logging: bool,
    /// Socket write timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Overrides the exhaustion policy of every connection when set
    pub exhaustion_policy: Option<ExhaustionPolicy>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_wait_ms: DEFAULT_REQUEST_WAIT_MS,
            logging_enabled: true,
            packet_logging: false,
            write_timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            exhaustion_policy: None,
        }
    }
}

impl ClientOptions {
    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

pub struct ModbusClient {
    options: ClientOptions,
    logger: CallbackLogger,
    config: Option<Arc<ModbusConfig>>,
    managers: Vec<Arc<ConnectionManager>>,
    listeners: Arc<RwLock<Vec<Arc<dyn ClientListener>>>>,
    connection_listeners: Vec<Arc<dyn ConnectionListener>>,
    on_danger: Arc<RwLock<Option<DangerCallback>>>,
    transport_factory: TransportFactory,
    wakeup: Arc<Wakeup>,
    state: watch::Sender<ClientState>,
    created: bool,
    scheduler: Option<SchedulerHandle>,
}

impl ModbusClient {
    /// Create a client talking Modbus TCP
    pub fn new(options: ClientOptions) -> Self {
        let write_timeout = Duration::from_millis(options.write_timeout_ms);
        let packet_logging = options.packet_logging;
        let factory: TransportFactory = Arc::new(move |connection: &Connection| {
            Arc::new(TcpTransport::new(connection.endpoint(), write_timeout).with_packet_logging(packet_logging))
                as Arc<dyn Transport>
        });
        Self::with_transport_factory(options, factory)
    }

    /// Create a client with custom transports
    pub fn with_transport_factory(options: ClientOptions, transport_factory: TransportFactory) -> Self {
        let logger = CallbackLogger::new(None, LogLevel::Info);
        logger.set_enabled(options.logging_enabled);
        let (state, _) = watch::channel(ClientState::Init);
        Self {
            options,
            logger,
            config: None,
            managers: Vec::new(),
            listeners: Arc::new(RwLock::new(Vec::new())),
            connection_listeners: Vec::new(),
            on_danger: Arc::new(RwLock::new(None)),
            transport_factory,
            wakeup: Arc::new(Wakeup::new()),
            state,
            created: false,
            scheduler: None,
        }
    }

    /// Shared logger; register sources on it to receive diagnostics
    pub fn logger(&self) -> &CallbackLogger {
        &self.logger
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        self.listeners.write().push(listener);
    }

    /// Listen to every connection; register before `create`
    pub fn add_connection_listener(&mut self, listener: Arc<dyn ConnectionListener>) {
        for manager in &self.managers {
            manager.add_listener(listener.clone());
        }
        self.connection_listeners.push(listener);
    }

    pub fn set_on_danger(&self, callback: DangerCallback) {
        *self.on_danger.write() = Some(callback);
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connect
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ClientState::Destroy
    }

    pub fn config(&self) -> Option<&Arc<ModbusConfig>> {
        self.config.as_ref()
    }

    pub fn managers(&self) -> &[Arc<ConnectionManager>] {
        &self.managers
    }

    pub fn manager(&self, connection_name: &str) -> Option<&Arc<ConnectionManager>> {
        self.managers.iter().find(|m| m.connection().name == connection_name)
    }

    fn notify_listeners<F: Fn(&dyn ClientListener)>(&self, f: F) {
        let listeners: Vec<Arc<dyn ClientListener>> = self.listeners.read().clone();
        for listener in listeners {
            f(listener.as_ref());
        }
    }

    fn require_config(&self) -> ModbusResult<&Arc<ModbusConfig>> {
        self.config
            .as_ref()
            .ok_or_else(|| ModbusError::configuration("Client has no configuration, call init first"))
    }

    // Lifecycle

    /// Bind a built configuration
    pub fn init(&mut self, config: ModbusConfig) -> ModbusResult<()> {
        if self.created {
            return Err(ModbusError::configuration("Client already created"));
        }
        self.config = Some(Arc::new(config));
        self.notify_listeners(|l| l.on_init());
        Ok(())
    }

    /// Allocate one connection manager per connection and start the scheduler
    ///
    /// Must run inside a Tokio runtime.
    pub fn create(&mut self) -> ModbusResult<()> {
        if self.created {
            return Ok(());
        }
        if self.is_destroyed() {
            return Err(ModbusError::connection("Client is destroyed"));
        }
        let config = self.require_config()?.clone();
        tokio::runtime::Handle::try_current()
            .map_err(|e| ModbusError::internal(format!("No Tokio runtime: {}", e)))?;

        self.managers = config
            .connections()
            .iter()
            .map(|connection| {
                let transport = (self.transport_factory)(connection);
                let manager =
                    ConnectionManager::new(connection.clone(), transport, self.logger.clone(), self.wakeup.clone());
                if let Some(policy) = self.options.exhaustion_policy {
                    manager.set_exhaustion_policy(policy);
                }
                for listener in &self.connection_listeners {
                    manager.add_listener(listener.clone());
                }
                manager
            })
            .collect();

        let scheduler = PollingScheduler::new(
            self.managers.clone(),
            config.clone(),
            self.wakeup.clone(),
            self.state.subscribe(),
        )
        .with_request_wait(Duration::from_millis(self.options.request_wait_ms))
        .with_logger(self.logger.clone())
        .with_listeners(self.listeners.clone())
        .with_danger_callback(self.on_danger.clone());
        self.scheduler = Some(scheduler.spawn());

        self.created = true;
        self.state.send_replace(ClientState::Init);
        info!(
            "Modbus client created: {} connections, {} channels",
            self.managers.len(),
            config.channels().len()
        );
        self.notify_listeners(|l| l.on_create());
        Ok(())
    }

    /// Start every connection, then run `on_connected`
    ///
    /// Connections that fail their first attempt keep retrying in the
    /// background; the client counts as connected either way.
    pub async fn connect<F: FnOnce()>(&mut self, on_connected: F) -> ModbusResult<()> {
        match self.state() {
            ClientState::Connect => return Ok(()),
            ClientState::Destroy => return Err(ModbusError::connection("Client is destroyed")),
            _ => {}
        }
        if !self.created {
            return Err(ModbusError::configuration("Client not created, call create first"));
        }

        let results = join_all(self.managers.iter().map(|manager| manager.connect())).await;
        for (manager, result) in self.managers.iter().zip(results) {
            if let Err(error) = result {
                warn!("{}: {}", manager.connection().name, error);
            }
        }
        self.state.send_replace(ClientState::Connect);
        self.wakeup.wake();
        on_connected();
        self.notify_listeners(|l| l.on_connect());
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if self.state() != ClientState::Connect {
            return;
        }
        for manager in &self.managers {
            manager.disconnect().await;
        }
        self.state.send_replace(ClientState::Disconnect);
        self.notify_listeners(|l| l.on_disconnect());
    }

    /// Tear down connections and both scheduler loops
    pub async fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.state.send_replace(ClientState::Destroy);
        for manager in &self.managers {
            manager.destroy().await;
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.join().await;
        }
        self.notify_listeners(|l| l.on_destroy());
    }

    // Channels

    pub fn find_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.config.as_ref().and_then(|config| config.find_channel(name).cloned())
    }

    fn channel_and_manager(&self, name: &str) -> ModbusResult<(Arc<Channel>, &Arc<ConnectionManager>)> {
        let config = self.require_config()?;
        let channel = config
            .find_channel(name)
            .cloned()
            .ok_or_else(|| ModbusError::invalid_data(format!("Unknown channel '{}'", name)))?;
        let connection = config
            .connection_of(&channel)
            .ok_or_else(|| ModbusError::configuration(format!("Channel '{}' has no connection", name)))?;
        let manager = self
            .managers
            .iter()
            .find(|m| Arc::ptr_eq(m.connection(), connection))
            .ok_or_else(|| ModbusError::configuration("Client not created, call create first"))?;
        Ok((channel, manager))
    }

    /// Write an engineering value to a channel
    ///
    /// The write formula converts the value first; when it fails the value is
    /// written unchanged. Virtual channels only store the value, the update
    /// loop serves it back through their read path.
    pub fn write_channel(&self, name: &str, value: f64) -> ModbusResult<()> {
        let (channel, manager) = self.channel_and_manager(name)?;
        let raw = match channel.apply_write_formula(value) {
            Ok(raw) => raw,
            Err(error) => {
                self.logger.write_formula_error(&channel.name, &error.to_string());
                value
            }
        };

        if channel.is_virtual() {
            channel.set_write_value(raw);
            return Ok(());
        }
        let transaction = Transaction::write(channel.clone(), raw)?;
        manager.push_write(transaction)?;
        channel.set_write_value(raw);
        Ok(())
    }

    /// Write text into a holding register span
    pub fn write_text(&self, name: &str, text: &str) -> ModbusResult<()> {
        let (channel, manager) = self.channel_and_manager(name)?;
        manager.push_write(Transaction::write_text(channel, text)?)
    }
}

impl Drop for ModbusClient {
    fn drop(&mut self) {
        self.state.send_replace(ClientState::Destroy);
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.abort();
        }
    }
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("state", &self.state())
            .field("managers", &self.managers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults_and_overrides() {
        let options = ClientOptions::from_json_str("{}").unwrap();
        assert_eq!(options, ClientOptions::default());
        assert_eq!(options.request_wait_ms, 100);

        let options = ClientOptions::from_yaml_str(
            "request_wait_ms: 20\nexhaustion_policy:\n  policy: backoff\n  interval_ms: 3000\n",
        )
        .unwrap();
        assert_eq!(options.request_wait_ms, 20);
        assert_eq!(options.exhaustion_policy, Some(ExhaustionPolicy::Backoff { interval_ms: 3000 }));
    }

    #[tokio::test]
    async fn test_lifecycle_requires_order() {
        let mut client = ModbusClient::new(ClientOptions::default());
        assert!(client.create().is_err());
        assert!(client.connect(|| {}).await.is_err());
        assert!(client.write_channel("x", 1.0).is_err());
        client.destroy().await;
        assert!(client.is_destroyed());
    }
}
