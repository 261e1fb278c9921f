//! # Polling Scheduler
//!
//! Exactly two tasks per client, whatever the number of connections:
//!
//! - the **request loop** sends at most one transaction per connection per
//!   iteration, then waits up to `request_wait` or until woken
//! - the **update loop** measures the time since its previous tick, advances
//!   every channel, turns due channels into transactions, consumes responses
//!   and evaluates danger conditions
//!
//! Both loops block while the client is not connected and end once it is
//! destroyed. Enqueuing work or a connection coming up wakes them early.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::client::{ClientListener, ClientState};
use crate::config::{Channel, Connection, ModbusConfig};
use crate::logging::CallbackLogger;
use crate::manager::ConnectionManager;

/// Default upper bound of one loop wait
pub const DEFAULT_REQUEST_WAIT_MS: u64 = 100;

/// Callback receiving a channel whose danger condition fired, with its sound
pub type DangerCallback = Arc<dyn Fn(&Arc<Channel>, &str) + Send + Sync>;

/// Early wake-up of the two scheduler loops
///
/// A wake raised while a loop is busy is kept and consumed by its next wait.
#[derive(Debug, Default)]
pub struct Wakeup {
    request: Notify,
    update: Notify,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake both loops
    pub fn wake(&self) {
        self.request.notify_one();
        self.update.notify_one();
    }

    /// Wake the request loop only
    pub fn wake_requests(&self) {
        self.request.notify_one();
    }
}

/// Monotonic delta between ticks; the first tick measures 0
#[derive(Debug, Default)]
struct TickClock {
    last: Option<Instant>,
}

impl TickClock {
    fn elapsed_ms(&mut self) -> f32 {
        let now = Instant::now();
        let elapsed = self
            .last
            .map(|last| now.duration_since(last).as_secs_f32() * 1000.0)
            .unwrap_or(0.0);
        self.last = Some(now);
        elapsed
    }

    fn restart(&mut self) {
        self.last = Some(Instant::now());
    }
}

/// Block until the client is connected; false once it is destroyed
async fn wait_until_connected(state: &mut watch::Receiver<ClientState>) -> bool {
    loop {
        if state.has_changed().is_err() {
            // client dropped
            return false;
        }
        let current = *state.borrow_and_update();
        match current {
            ClientState::Connect => return true,
            ClientState::Destroy => return false,
            _ => {}
        }
        if state.changed().await.is_err() {
            return false;
        }
    }
}

/// Wait up to `limit`, returning early on a wake or a client state change
async fn wait_for_work(notify: &Notify, limit: Duration, state: &mut watch::Receiver<ClientState>) {
    tokio::select! {
        _ = notify.notified() => {}
        _ = sleep(limit) => {}
        _ = state.changed() => {}
    }
}

pub struct PollingScheduler {
    managers: Vec<Arc<ConnectionManager>>,
    config: Arc<ModbusConfig>,
    wakeup: Arc<Wakeup>,
    state: watch::Receiver<ClientState>,
    request_wait: Duration,
    logger: CallbackLogger,
    listeners: Arc<RwLock<Vec<Arc<dyn ClientListener>>>>,
    on_danger: Arc<RwLock<Option<DangerCallback>>>,
}

/// Join handles of the two loops
#[derive(Debug)]
pub struct SchedulerHandle {
    request: JoinHandle<()>,
    update: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Wait for both loops to observe the destroyed client
    pub async fn join(self) {
        let _ = self.request.await;
        let _ = self.update.await;
    }

    pub fn abort(&self) {
        self.request.abort();
        self.update.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.request.is_finished() && self.update.is_finished()
    }
}

impl PollingScheduler {
    pub fn new(
        managers: Vec<Arc<ConnectionManager>>,
        config: Arc<ModbusConfig>,
        wakeup: Arc<Wakeup>,
        state: watch::Receiver<ClientState>,
    ) -> Self {
        Self {
            managers,
            config,
            wakeup,
            state,
            request_wait: Duration::from_millis(DEFAULT_REQUEST_WAIT_MS),
            logger: CallbackLogger::disabled(),
            listeners: Arc::new(RwLock::new(Vec::new())),
            on_danger: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_request_wait(mut self, wait: Duration) -> Self {
        self.request_wait = wait;
        self
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Listeners receiving `on_tick` after every update tick
    pub fn with_listeners(mut self, listeners: Arc<RwLock<Vec<Arc<dyn ClientListener>>>>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_danger_callback(mut self, on_danger: Arc<RwLock<Option<DangerCallback>>>) -> Self {
        self.on_danger = on_danger;
        self
    }

    /// Start both loops on the current runtime
    pub fn spawn(self) -> SchedulerHandle {
        let scheduler = Arc::new(self);
        let request = tokio::spawn(scheduler.clone().request_loop());
        let update = tokio::spawn(scheduler.update_loop());
        SchedulerHandle { request, update }
    }

    async fn request_loop(self: Arc<Self>) {
        self.logger.thread_started("request");
        let mut state = self.state.clone();
        loop {
            if !wait_until_connected(&mut state).await {
                break;
            }
            for manager in &self.managers {
                manager.send_next().await;
            }
            wait_for_work(&self.wakeup.request, self.request_wait, &mut state).await;
        }
        self.logger.thread_stopped("request");
    }

    async fn update_loop(self: Arc<Self>) {
        self.logger.thread_started("update");
        let mut state = self.state.clone();
        let mut clock = TickClock::default();
        loop {
            let connected = *state.borrow() == ClientState::Connect;
            if !connected {
                if !wait_until_connected(&mut state).await {
                    break;
                }
                clock.restart();
            }
            let elapsed = clock.elapsed_ms();
            self.tick(elapsed);
            wait_for_work(&self.wakeup.update, self.request_wait, &mut state).await;
        }
        self.logger.thread_stopped("update");
    }

    /// One pass of the update loop over every connection
    pub fn tick(&self, elapsed_ms: f32) {
        let mut has_work = false;
        for manager in &self.managers {
            has_work |= manager.update_queues(elapsed_ms, &self.config);
            if manager.is_connected() {
                self.check_dangers(manager.connection(), elapsed_ms as f64);
            }
        }
        if has_work {
            self.wakeup.wake_requests();
        }

        let listeners: Vec<Arc<dyn ClientListener>> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_tick(elapsed_ms);
        }
    }

    fn check_dangers(&self, connection: &Connection, elapsed_ms: f64) {
        for channel in connection.channels() {
            if !channel.is_enabled() || !channel.has_danger_feature() {
                continue;
            }
            match channel.check_danger(elapsed_ms) {
                Ok(Some(sound)) => {
                    self.logger
                        .warn(&format!("Danger: {} = {} ({})", channel.name, channel.read_value(), sound));
                    let callback = self.on_danger.read().clone();
                    if let Some(callback) = callback {
                        callback(channel, sound);
                    }
                }
                Ok(None) => {}
                Err(error) => self.logger.error(&format!("Danger formula error on {}: {}", channel.name, error)),
            }
        }
    }
}
