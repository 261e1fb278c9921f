//! # Connection Manager
//!
//! One manager drives one [`Connection`]:
//!
//! ```text
//!                 connect()
//! Disconnected ─────────────► Connecting ──ok──► Connected
//!      ▲                          │                 │  ▲
//!      │ budget spent             │ failed          │  │ reconnected
//!      │ (GiveUp)                 ▼                 ▼  │
//!      └──────────────────── Reconnecting ◄── link lost / timeout
//!
//! destroy() from any state ──► Destroyed
//! ```
//!
//! While reconnecting the first retry is immediate and every following one
//! waits `retry_timeout`. After `retries_count` failed retries the listeners
//! get `on_reconnect_failed` and the connection's [`ExhaustionPolicy`] decides
//! what happens next.
//!
//! The manager also owns the request queue of its connection: the request
//! loop calls [`send_next`](ConnectionManager::send_next), the update loop
//! calls [`update_queues`](ConnectionManager::update_queues).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::{Channel, Connection, ExhaustionPolicy, ModbusConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusResponse, ResponseDecoder, DEFAULT_UNIT_ID};
use crate::scheduler::Wakeup;
use crate::transaction::{group_due_channels, ChannelGroup, Completion, RequestQueue, Transaction};
use crate::transport::{EventReceiver, Transport, TransportEvent, TransportStats};
use crate::utils::ResponseTimeMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Destroyed,
}

/// Connection lifecycle callbacks; every method defaults to a no-op
pub trait ConnectionListener: Send + Sync {
    fn on_connect_success(&self, _connection: &Connection) {}

    fn on_connect_failed(&self, _connection: &Connection, _error: &ModbusError) {}

    fn on_reconnect_success(&self, _connection: &Connection) {}

    /// The retry budget is spent
    fn on_reconnect_failed(&self, _connection: &Connection, _error: &ModbusError) {}

    fn on_disconnect(&self, _connection: &Connection) {}
}

/// Request counters since the last (re)connect, and reconnections overall
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionCounters {
    pub read_requests: u64,
    pub write_requests: u64,
    pub reconnections: u64,
}

pub struct ConnectionManager {
    connection: Arc<Connection>,
    transport: Arc<dyn Transport>,
    exhaustion_policy: Mutex<ExhaustionPolicy>,
    logger: CallbackLogger,
    wakeup: Arc<Wakeup>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    state: watch::Sender<ConnectionState>,
    queue: Mutex<RequestQueue>,
    decoder: Mutex<ResponseDecoder>,
    events: Mutex<Option<EventReceiver>>,
    counters: Mutex<ConnectionCounters>,
    metrics: Mutex<ResponseTimeMetrics>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped whenever a running reconnect loop must stop
    epoch: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        connection: Arc<Connection>,
        transport: Arc<dyn Transport>,
        logger: CallbackLogger,
        wakeup: Arc<Wakeup>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            exhaustion_policy: Mutex::new(connection.exhaustion_policy),
            connection,
            transport,
            logger,
            wakeup,
            listeners: RwLock::new(Vec::new()),
            state,
            queue: Mutex::new(RequestQueue::new()),
            decoder: Mutex::new(ResponseDecoder::new()),
            events: Mutex::new(None),
            counters: Mutex::new(ConnectionCounters::default()),
            metrics: Mutex::new(ResponseTimeMetrics::new()),
            reconnect_task: Mutex::new(None),
            epoch: AtomicU64::new(0),
        })
    }

    /// Replace the policy taken from the connection
    pub fn set_exhaustion_policy(&self, policy: ExhaustionPolicy) {
        *self.exhaustion_policy.lock() = policy;
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn endpoint(&self) -> String {
        self.connection.endpoint()
    }

    pub fn exhaustion_policy(&self) -> ExhaustionPolicy {
        *self.exhaustion_policy.lock()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn counters(&self) -> ConnectionCounters {
        self.counters.lock().clone()
    }

    pub fn metrics(&self) -> ResponseTimeMetrics {
        self.metrics.lock().clone()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Transactions waiting to be sent
    pub fn pending(&self) -> usize {
        self.queue.lock().pending()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {:?} -> {:?}", self.endpoint(), previous, state);
        }
    }

    /// Move `from` -> `to`; false when the state was something else
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("{}: {:?} -> {:?}", self.endpoint(), from, to);
        }
        changed
    }

    fn notify_listeners<F: Fn(&dyn ConnectionListener)>(&self, f: F) {
        let listeners: Vec<Arc<dyn ConnectionListener>> = self.listeners.read().clone();
        for listener in listeners {
            f(listener.as_ref());
        }
    }

    // Lifecycle

    /// Open the connection
    ///
    /// A failed first attempt is reported through `on_connect_failed` and hands
    /// over to the reconnect loop; the error is returned as well.
    pub async fn connect(self: &Arc<Self>) -> ModbusResult<()> {
        match self.state() {
            ConnectionState::Destroyed => {
                return Err(ModbusError::connection(format!("{} is destroyed", self.endpoint())))
            }
            ConnectionState::Disconnected => {}
            _ => return Ok(()),
        }
        if !self.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Ok(());
        }

        match self.try_connect().await {
            Ok(()) => {
                if !self.on_connected(false) {
                    self.drop_stale_link().await;
                }
                Ok(())
            }
            Err(error) => {
                let endpoint = self.endpoint();
                self.logger.connect_failed(&endpoint, 0, &error.to_string());
                warn!("Connect to {} failed: {}", endpoint, error);
                self.notify_listeners(|l| l.on_connect_failed(&self.connection, &error));
                if self.transition(ConnectionState::Connecting, ConnectionState::Reconnecting) {
                    self.spawn_reconnect();
                }
                Err(error)
            }
        }
    }

    /// Close the connection and stop any reconnect loop
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Destroyed {
            return;
        }
        self.stop_reconnect();
        self.transport.disconnect().await;
        self.reset_queues();
        *self.events.lock() = None;

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous == ConnectionState::Connected {
            self.logger.disconnected(&self.endpoint(), "requested");
            self.notify_listeners(|l| l.on_disconnect(&self.connection));
        }
    }

    /// Disconnect for good
    pub async fn destroy(&self) {
        self.disconnect().await;
        self.set_state(ConnectionState::Destroyed);
    }

    async fn try_connect(&self) -> ModbusResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(rx);
        let limit = self.connection.response_timeout_duration();
        match timeout(limit, self.transport.connect(tx)).await {
            Ok(result) => result,
            Err(_) => {
                self.transport.disconnect().await;
                Err(ModbusError::timeout(
                    format!("connect {}", self.endpoint()),
                    self.connection.response_timeout,
                ))
            }
        }
    }

    /// Enter `Connected` from the connecting state of this attempt
    ///
    /// Returns false, without touching counters or listeners, when a
    /// disconnect or destroy moved the state away in the meantime.
    fn on_connected(&self, reconnect: bool) -> bool {
        let from = if reconnect {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        self.reset_queues();
        if !self.transition(from, ConnectionState::Connected) {
            debug!("{}: connected while {:?}, dropping the link", self.endpoint(), self.state());
            return false;
        }
        {
            let mut counters = self.counters.lock();
            counters.read_requests = 0;
            counters.write_requests = 0;
            if reconnect {
                counters.reconnections += 1;
            }
        }
        self.logger.connect_success(&self.endpoint());
        if reconnect {
            self.notify_listeners(|l| l.on_reconnect_success(&self.connection));
        } else {
            self.notify_listeners(|l| l.on_connect_success(&self.connection));
        }
        self.wakeup.wake();
        true
    }

    /// Close a link that came up after the manager was told to stop
    async fn drop_stale_link(&self) {
        if matches!(self.state(), ConnectionState::Disconnected | ConnectionState::Destroyed) {
            self.transport.disconnect().await;
            *self.events.lock() = None;
        }
    }

    /// The link failed while connected: drop all transactions and reconnect
    fn on_link_failure(self: &Arc<Self>, error: ModbusError) {
        if !self.transition(ConnectionState::Connected, ConnectionState::Reconnecting) {
            return;
        }
        self.logger.disconnected(&self.endpoint(), &error.to_string());
        warn!("{} lost: {}", self.endpoint(), error);
        self.reset_queues();
        self.notify_listeners(|l| l.on_disconnect(&self.connection));
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.reconnect_loop(epoch).await });
        if let Some(previous) = self.reconnect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_reconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.reconnect_task.lock().take() {
            handle.abort();
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch && self.state() == ConnectionState::Reconnecting
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        let endpoint = self.endpoint();
        let retries = self.connection.retries_count;
        let delay = self.connection.retry_timeout_duration();

        loop {
            for attempt in 1..=retries {
                if attempt > 1 {
                    self.logger.reconnect_scheduled(&endpoint, attempt, delay);
                    sleep(delay).await;
                }
                if !self.is_current(epoch) {
                    return;
                }
                self.transport.disconnect().await;
                match self.try_connect().await {
                    Ok(()) => {
                        if !self.is_current(epoch) || !self.on_connected(true) {
                            self.drop_stale_link().await;
                        }
                        return;
                    }
                    Err(error) => {
                        self.logger.connect_failed(&endpoint, attempt, &error.to_string());
                        debug!("Reconnect {} attempt {} failed: {}", endpoint, attempt, error);
                    }
                }
            }

            if !self.is_current(epoch) {
                return;
            }
            let error = ModbusError::retries_exhausted(endpoint.clone(), retries);
            self.logger.reconnect_failed(&endpoint, retries);
            warn!("{}", error);
            self.reset_queues();
            self.notify_listeners(|l| l.on_reconnect_failed(&self.connection, &error));

            match self.exhaustion_policy() {
                ExhaustionPolicy::GiveUp => {
                    self.transition(ConnectionState::Reconnecting, ConnectionState::Disconnected);
                    return;
                }
                ExhaustionPolicy::Backoff { interval_ms } => {
                    sleep(Duration::from_millis(interval_ms)).await;
                    if !self.is_current(epoch) {
                        return;
                    }
                }
            }
        }
    }

    fn reset_queues(&self) {
        self.queue.lock().reset();
        self.decoder.lock().clear();
    }

    // Transactions

    /// Queue a write; it leaves before any pending read
    pub fn push_write(&self, transaction: Transaction) -> ModbusResult<()> {
        if !self.is_connected() {
            return Err(ModbusError::connection(format!("{} is not connected", self.endpoint())));
        }
        self.queue.lock().push_write(transaction);
        self.wakeup.wake_requests();
        Ok(())
    }

    /// Send the next queued transaction; false when nothing went out
    pub async fn send_next(self: &Arc<Self>) -> bool {
        if !self.is_connected() || !self.transport.is_connected() {
            return false;
        }
        let next = self.queue.lock().take_next(DEFAULT_UNIT_ID);
        let (transaction_id, frame, request) = match next {
            Some(next) => next,
            None => return false,
        };

        self.logger
            .log_request(transaction_id, request.function, request.address, request.quantity, &frame);
        if self.transport.write(&frame).await {
            let mut counters = self.counters.lock();
            if request.function.is_write_function() {
                counters.write_requests += 1;
            } else {
                counters.read_requests += 1;
            }
            true
        } else {
            self.on_link_failure(ModbusError::connection(format!(
                "Write of transaction #{} to {} failed",
                transaction_id,
                self.endpoint()
            )));
            false
        }
    }

    /// One update tick of this connection
    ///
    /// Produces read transactions for due channels, serves virtual channels,
    /// consumes received responses and enforces the response timeout.
    /// Returns true when the request loop has something new to do.
    pub fn update_queues(self: &Arc<Self>, elapsed_ms: f32, config: &ModbusConfig) -> bool {
        if !self.is_connected() {
            return false;
        }

        let mut has_work = false;
        for group in group_due_channels(&self.connection, elapsed_ms) {
            match group {
                ChannelGroup::Virtual(channels) => self.apply_virtual(&channels, config),
                ChannelGroup::Physical { region, channels } => match Transaction::read(region, channels) {
                    Ok(transaction) => has_work |= self.queue.lock().push_read(transaction),
                    Err(error) => warn!("{}: cannot build read: {}", self.endpoint(), error),
                },
            }
        }

        has_work |= self.consume_responses(config);
        self.check_response_timeout();
        has_work
    }

    fn apply_virtual(&self, channels: &[Arc<Channel>], config: &ModbusConfig) {
        let mut applied = Vec::with_capacity(channels.len());
        for channel in channels {
            match channel.apply_read_value(channel.write_value()) {
                Ok(_) => applied.push(channel.clone()),
                Err(error) => self.logger.read_formula_error(&channel.name, &error.to_string()),
            }
        }
        config.notify_read_channels(&applied);
    }

    /// Drain transport events and commit answered transactions
    fn consume_responses(self: &Arc<Self>, config: &ModbusConfig) -> bool {
        let mut closed = None;
        {
            let mut events = self.events.lock();
            if let Some(receiver) = events.as_mut() {
                while let Ok(event) = receiver.try_recv() {
                    match event {
                        TransportEvent::Response(bytes) => {
                            self.logger.log_response(&bytes);
                            self.decoder.lock().push(&bytes);
                        }
                        TransportEvent::Closed(error) => closed = Some(error),
                    }
                }
            }
        }

        let mut committed = false;
        loop {
            let frame = self.decoder.lock().next_frame();
            let response = match frame {
                Ok(Some(response)) => response,
                Ok(None) => break,
                Err(error) => {
                    warn!("{}: discarding malformed response: {}", self.endpoint(), error);
                    let Some(transaction_id) = error.transaction_id else {
                        break;
                    };
                    // settle the transaction the bad reply answered
                    let answered = self.queue.lock().take_answered(transaction_id);
                    if let Ok((transaction, _)) = answered {
                        self.metrics.lock().record_failure();
                        self.logger.warn(&format!(
                            "Response to [{}] discarded: {}",
                            transaction.channel_names().join(", "),
                            error.error
                        ));
                        committed = true;
                    }
                    continue;
                }
            };
            let answered = self.queue.lock().take_answered(response.transaction_id);
            match answered {
                Ok((transaction, elapsed)) => {
                    self.commit(transaction, &response, elapsed, config);
                    committed = true;
                }
                Err(error) => warn!("{}: {}", self.endpoint(), error),
            }
        }

        if let Some(error) = closed {
            self.on_link_failure(error);
        }
        committed
    }

    fn commit(&self, transaction: Transaction, response: &ModbusResponse, elapsed: Duration, config: &ModbusConfig) {
        let is_write = transaction.is_write();
        let names = transaction.channel_names();
        match transaction.complete(response) {
            Ok(Completion::Read { channels, failures }) => {
                self.metrics.lock().record_success(elapsed);
                for (channel, error) in failures {
                    self.logger.read_formula_error(&channel.name, &error.to_string());
                }
                self.logger.read_success(&names, elapsed);
                config.notify_read_channels(&channels);
            }
            Ok(Completion::Written { channel, value }) => {
                self.metrics.lock().record_success(elapsed);
                self.logger.write_success(&channel.name, value);
            }
            Ok(Completion::TextWritten { channel, text }) => {
                self.metrics.lock().record_success(elapsed);
                self.logger.debug(&format!("Write success: {} = '{}'", channel.name, text));
            }
            Err(ModbusError::Exception { function, code, message }) => {
                self.metrics.lock().record_failure();
                if is_write {
                    self.logger.warn(&format!("Write failed: [{}] exception 0x{:02X}: {}", names.join(", "), code, message));
                } else {
                    self.logger.read_failed(function, code, &message);
                }
            }
            Err(error) => {
                self.metrics.lock().record_failure();
                warn!("{}: response to [{}] rejected: {}", self.endpoint(), names.join(", "), error);
            }
        }
    }

    fn check_response_timeout(self: &Arc<Self>) {
        let limit = self.connection.response_timeout_duration();
        let expired = self.queue.lock().take_expired(limit);
        if let Some((transaction_id, _)) = expired {
            self.metrics.lock().record_failure();
            self.transport.record_timeout();
            self.logger.response_timeout(&self.endpoint(), transaction_id, limit);
            self.on_link_failure(ModbusError::timeout(
                format!("transaction #{}", transaction_id),
                self.connection.response_timeout,
            ));
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.reconnect_task.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigTree, Region};
    use crate::data_type::DataType;
    use crate::transport::EventSender;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Transport whose connect results and traffic are driven by the test
    #[derive(Default)]
    struct ScriptedTransport {
        connect_calls: AtomicUsize,
        refuse: AtomicBool,
        connected: AtomicBool,
        written: Mutex<Vec<Vec<u8>>>,
        events: Mutex<Option<EventSender>>,
    }

    impl ScriptedTransport {
        fn send(&self, event: TransportEvent) {
            if let Some(sender) = self.events.lock().as_ref() {
                let _ = sender.send(event);
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, events: EventSender) -> ModbusResult<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ModbusError::connection("refused"));
            }
            *self.events.lock() = Some(events);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn write(&self, frame: &[u8]) -> bool {
            self.written.lock().push(frame.to_vec());
            true
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    #[derive(Default)]
    struct CountingListener {
        connect_success: AtomicUsize,
        connect_failed: AtomicUsize,
        reconnect_success: AtomicUsize,
        reconnect_failed: AtomicUsize,
        disconnect: AtomicUsize,
    }

    impl ConnectionListener for CountingListener {
        fn on_connect_success(&self, _: &Connection) {
            self.connect_success.fetch_add(1, Ordering::SeqCst);
        }
        fn on_connect_failed(&self, _: &Connection, _: &ModbusError) {
            self.connect_failed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_reconnect_success(&self, _: &Connection) {
            self.reconnect_success.fetch_add(1, Ordering::SeqCst);
        }
        fn on_reconnect_failed(&self, _: &Connection, error: &ModbusError) {
            assert!(matches!(error, ModbusError::RetriesExhausted { attempts: 3, .. }));
            self.reconnect_failed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnect(&self, _: &Connection) {
            self.disconnect.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(
        refuse: bool,
    ) -> (ModbusConfig, Arc<ConnectionManager>, Arc<ScriptedTransport>, Arc<CountingListener>) {
        let mut tree = ConfigTree::new("plant");
        let plc = tree
            .add_connection(
                tree.root(),
                Connection::new("plc", "127.0.0.1", 502)
                    .with_retries(3, 100)
                    .with_response_timeout(500),
            )
            .unwrap();
        tree.add_channel(
            plc,
            Channel::new("level", Region::Holdings, DataType::UInt16)
                .with_address(10)
                .with_update_interval(100.0),
        )
        .unwrap();
        let config = ModbusConfig::build(tree).unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        transport.refuse.store(refuse, Ordering::SeqCst);
        let manager = ConnectionManager::new(
            config.connections()[0].clone(),
            transport.clone(),
            CallbackLogger::disabled(),
            Arc::new(Wakeup::default()),
        );
        let listener = Arc::new(CountingListener::default());
        manager.add_listener(listener.clone());
        (config, manager, transport, listener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_spent_after_third_retry() {
        let (_config, manager, transport, listener) = setup(true);

        assert!(manager.connect().await.is_err());
        assert_eq!(listener.connect_failed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        // first retry is immediate
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(listener.reconnect_failed.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(listener.reconnect_failed.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 4);
        assert_eq!(listener.reconnect_failed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_policy_starts_a_new_budget() {
        let (_config, manager, transport, listener) = setup(true);
        manager.set_exhaustion_policy(ExhaustionPolicy::Backoff { interval_ms: 1000 });

        let _ = manager.connect().await;
        sleep(Duration::from_millis(500)).await;
        assert_eq!(listener.reconnect_failed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        transport.refuse.store(false, Ordering::SeqCst);
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(listener.reconnect_success.load(Ordering::SeqCst), 1);
        assert_eq!(manager.counters().reconnections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_round_trip() {
        let (config, manager, transport, listener) = setup(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        config.set_read_channels(Arc::new(move |channels: &[Arc<Channel>]| {
            sink.lock().extend(channels.iter().map(|c| c.name.clone()));
        }));

        manager.connect().await.unwrap();
        assert_eq!(listener.connect_success.load(Ordering::SeqCst), 1);

        assert!(manager.update_queues(100.0, &config));
        assert!(manager.send_next().await);
        assert!(!manager.send_next().await);
        let frame = transport.written.lock()[0].clone();
        assert_eq!(&frame[7..12], &[0x03, 0x00, 0x0A, 0x00, 0x01]);

        let mut response = vec![frame[0], frame[1], 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x01, 0x2C];
        // split delivery
        let tail = response.split_off(8);
        transport.send(TransportEvent::Response(response));
        transport.send(TransportEvent::Response(tail));
        manager.update_queues(0.0, &config);

        assert_eq!(config.find_channel("level").unwrap().read_value(), 300.0);
        assert_eq!(seen.lock().as_slice(), ["level"]);
        assert_eq!(manager.counters().read_requests, 1);
        assert_eq!(manager.metrics().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_and_timeout_reconnect() {
        let (config, manager, transport, listener) = setup(false);
        manager.connect().await.unwrap();

        transport.send(TransportEvent::Closed(ModbusError::connection("reset")));
        manager.update_queues(0.0, &config);
        assert_eq!(listener.disconnect.load(Ordering::SeqCst), 1);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(listener.reconnect_success.load(Ordering::SeqCst), 1);

        manager.update_queues(100.0, &config);
        assert!(manager.send_next().await);
        sleep(Duration::from_millis(600)).await;
        manager.update_queues(0.0, &config);
        assert_eq!(listener.disconnect.load(Ordering::SeqCst), 2);
        assert_eq!(manager.metrics().failed, 1);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.counters().reconnections, 2);
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_settles_transaction_without_dropping_link() {
        let (config, manager, transport, listener) = setup(false);
        manager.connect().await.unwrap();

        assert!(manager.update_queues(100.0, &config));
        assert!(manager.send_next().await);
        let frame = transport.written.lock()[0].clone();

        // unknown function code 0x2B answering the outstanding read
        transport.send(TransportEvent::Response(vec![frame[0], frame[1], 0, 0, 0, 3, 1, 0x2B, 0]));
        manager.update_queues(0.0, &config);
        assert!(!manager.queue.lock().has_outstanding());
        assert_eq!(manager.metrics().failed, 1);

        sleep(Duration::from_millis(600)).await;
        manager.update_queues(0.0, &config);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(listener.disconnect.load(Ordering::SeqCst), 0);
        assert_eq!(manager.metrics().failed, 1);

        // the queue sends again
        manager.update_queues(100.0, &config);
        assert!(manager.send_next().await);
        assert_eq!(transport.written.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_connect_does_not_override_disconnect() {
        let (_config, manager, _transport, listener) = setup(false);
        manager.connect().await.unwrap();
        manager.disconnect().await;

        assert!(!manager.on_connected(true));
        assert!(!manager.on_connected(false));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(listener.reconnect_success.load(Ordering::SeqCst), 0);
        assert_eq!(listener.connect_success.load(Ordering::SeqCst), 1);
        assert_eq!(manager.counters().reconnections, 0);
    }

    #[tokio::test]
    async fn test_disconnect_and_destroy() {
        let (_config, manager, _transport, listener) = setup(false);
        manager.connect().await.unwrap();
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(listener.disconnect.load(Ordering::SeqCst), 1);

        manager.destroy().await;
        assert_eq!(manager.state(), ConnectionState::Destroyed);
        assert!(manager.connect().await.is_err());
    }
}
