//! One addressable value on a device
//!
//! A `Channel` carries two kinds of data. Its configuration (address, type,
//! formulas, intervals) is fixed once the channel is placed in a tree. Its
//! runtime state (the current engineering value, the poll accumulator, danger
//! bookkeeping) lives in atomics: the update loop is the only writer of the
//! read side, any thread may read it, and writes arrive from any caller.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::Region;
use crate::data_type::DataType;
use crate::error::ModbusResult;
use crate::formula::{channel as channel_formula, Formula};

/// Listener notified with every new write value
pub type WriteListener = Box<dyn Fn(f64) + Send + Sync>;

/// Address of channels that are never read from a device
pub const VIRTUAL_ADDRESS: i16 = -1;

/// Diapason meaning "span follows the data type"
pub const NO_DIAPASON: i16 = -1;

pub struct Channel {
    pub name: String,
    pub address: i16,
    pub diapason: i16,
    pub region: Region,
    pub data_type: DataType,
    /// Poll interval in milliseconds
    pub update_interval: f32,
    /// Decimal places kept after the read formula
    pub fraction_size: u32,
    pub read_formula: Option<Formula>,
    pub write_formula: Option<Formula>,
    pub danger_formula: Option<Formula>,
    pub danger_sound: Option<String>,
    /// Milliseconds between danger checks; 0 checks every tick
    pub check_danger_period: f64,
    pub journal_delta: f64,
    pub journal_timeout: f64,
    state: ChannelState,
}

#[derive(Default)]
struct ChannelState {
    enabled: AtomicBool,
    read_value: AtomicU64,
    read_value_valid: AtomicBool,
    last_read_at: Mutex<Option<DateTime<Utc>>>,
    raw_registers: Mutex<Vec<u16>>,
    write_value: AtomicU64,
    write_listeners: Mutex<Vec<Arc<WriteListener>>>,
    update_progress: AtomicU32,
    should_read: AtomicBool,
    read_formula_error: AtomicBool,
    write_formula_error: AtomicBool,
    danger_progress: AtomicU64,
    danger_active: AtomicBool,
    danger_mark: AtomicBool,
}

impl Channel {
    /// Create a virtual channel; give it an address to make it physical
    pub fn new(name: impl Into<String>, region: Region, data_type: DataType) -> Self {
        let state = ChannelState::default();
        state.enabled.store(true, Ordering::Relaxed);
        Self {
            name: name.into(),
            address: VIRTUAL_ADDRESS,
            diapason: NO_DIAPASON,
            region,
            data_type,
            update_interval: 1000.0,
            fraction_size: 0,
            read_formula: None,
            write_formula: None,
            danger_formula: None,
            danger_sound: None,
            check_danger_period: 0.0,
            journal_delta: 0.0,
            journal_timeout: 0.0,
            state,
        }
    }

    pub fn with_address(mut self, address: i16) -> Self {
        self.address = address;
        self
    }

    pub fn with_diapason(mut self, diapason: i16) -> Self {
        self.diapason = diapason;
        self
    }

    pub fn with_update_interval(mut self, interval_ms: f32) -> Self {
        self.update_interval = interval_ms;
        self
    }

    pub fn with_fraction_size(mut self, fraction_size: u32) -> Self {
        self.fraction_size = fraction_size;
        self
    }

    pub fn with_read_formula(mut self, formula: Formula) -> Self {
        self.read_formula = Some(formula);
        self
    }

    pub fn with_write_formula(mut self, formula: Formula) -> Self {
        self.write_formula = Some(formula);
        self
    }

    pub fn with_danger(mut self, formula: Formula, sound: impl Into<String>, period_ms: f64) -> Self {
        self.danger_formula = Some(formula);
        self.danger_sound = Some(sound.into());
        self.check_danger_period = period_ms;
        self
    }

    pub fn with_journal(mut self, delta: f64, timeout: f64) -> Self {
        self.journal_delta = delta;
        self.journal_timeout = timeout;
        self
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        self.set_enabled(enabled);
        self
    }

    // Derived properties

    pub fn start_address(&self) -> i32 {
        self.address as i32
    }

    pub fn has_diapason(&self) -> bool {
        self.diapason != NO_DIAPASON
    }

    /// Registers (or bits) covered by the channel
    pub fn register_count(&self) -> i32 {
        if self.has_diapason() {
            self.diapason as i32
        } else {
            self.data_type.size() as i32
        }
    }

    pub fn finish_address(&self) -> i32 {
        self.start_address() + self.register_count() - 1
    }

    pub fn is_virtual(&self) -> bool {
        self.address == VIRTUAL_ADDRESS
    }

    pub fn should_journal(&self) -> bool {
        self.journal_delta != 0.0 || self.journal_timeout != 0.0
    }

    pub fn has_danger_feature(&self) -> bool {
        self.danger_formula.is_some() && self.danger_sound.is_some()
    }

    // Runtime state

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Relaxed)
    }

    /// Disabled channels are skipped by the update loop
    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Advance the poll accumulator by `elapsed_ms`
    ///
    /// Returns the new `should_read` flag. When it trips, the accumulator
    /// keeps only the remainder past the interval.
    pub fn update_progress(&self, elapsed_ms: f32) -> bool {
        let mut progress = f32::from_bits(self.state.update_progress.load(Ordering::Relaxed)) + elapsed_ms;
        let should_read = progress >= self.update_interval;
        if should_read {
            progress = if self.update_interval > 0.0 {
                progress % self.update_interval
            } else {
                0.0
            };
        }
        self.state.update_progress.store(progress.to_bits(), Ordering::Relaxed);
        self.state.should_read.store(should_read, Ordering::Relaxed);
        should_read
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.state.update_progress.load(Ordering::Relaxed))
    }

    pub fn should_read(&self) -> bool {
        self.state.should_read.load(Ordering::Relaxed)
    }

    /// Current engineering value
    pub fn read_value(&self) -> f64 {
        f64::from_bits(self.state.read_value.load(Ordering::Acquire))
    }

    /// Whether the read value came from a completed read
    pub fn is_read_value_valid(&self) -> bool {
        self.state.read_value_valid.load(Ordering::Acquire)
    }

    pub fn last_read_at(&self) -> Option<DateTime<Utc>> {
        *self.state.last_read_at.lock()
    }

    pub(crate) fn set_read_value(&self, value: f64) {
        self.state.read_value.store(value.to_bits(), Ordering::Release);
        *self.state.last_read_at.lock() = Some(Utc::now());
    }

    pub(crate) fn mark_read_valid(&self, valid: bool) {
        self.state.read_value_valid.store(valid, Ordering::Release);
    }

    /// Raw registers of the last read of a diapason channel
    pub fn raw_registers(&self) -> Vec<u16> {
        self.state.raw_registers.lock().clone()
    }

    pub(crate) fn set_raw_registers(&self, registers: &[u16]) {
        let mut raw = self.state.raw_registers.lock();
        raw.clear();
        raw.extend_from_slice(registers);
    }

    /// Raw registers decoded as text, two bytes per register
    pub fn text(&self) -> String {
        let bytes: Vec<u8> = self
            .raw_registers()
            .iter()
            .flat_map(|register| register.to_be_bytes())
            .take_while(|byte| *byte != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Run a raw value through the read formula and store the result
    ///
    /// On a formula error the previous value is kept and the error flag is
    /// raised until the next successful evaluation.
    pub fn apply_read_value(&self, raw: f64) -> ModbusResult<f64> {
        match channel_formula::read_value(self.read_formula.as_ref(), raw, self.fraction_size) {
            Ok(value) => {
                self.state.read_formula_error.store(false, Ordering::Relaxed);
                self.set_read_value(value);
                Ok(value)
            }
            Err(error) => {
                self.state.read_formula_error.store(true, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    /// Convert an engineering value through the write formula
    pub fn apply_write_formula(&self, value: f64) -> ModbusResult<f64> {
        let result = channel_formula::write_value(self.write_formula.as_ref(), value);
        self.state
            .write_formula_error
            .store(result.is_err(), Ordering::Relaxed);
        result
    }

    pub fn has_read_formula_error(&self) -> bool {
        self.state.read_formula_error.load(Ordering::Relaxed)
    }

    pub fn has_write_formula_error(&self) -> bool {
        self.state.write_formula_error.load(Ordering::Relaxed)
    }

    pub fn write_value(&self) -> f64 {
        f64::from_bits(self.state.write_value.load(Ordering::Acquire))
    }

    /// Store a new write value and notify every write listener
    pub fn set_write_value(&self, value: f64) {
        self.state.write_value.store(value.to_bits(), Ordering::Release);
        let listeners: Vec<Arc<WriteListener>> = self.state.write_listeners.lock().clone();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn register_write_listener(&self, listener: WriteListener) {
        self.state.write_listeners.lock().push(Arc::new(listener));
    }

    /// Advance the danger timer and evaluate the danger formula when due
    ///
    /// Returns the sound to play when the condition fires. With a period of 0
    /// the formula runs every tick and only a change from safe to dangerous
    /// fires.
    pub fn check_danger(&self, elapsed_ms: f64) -> ModbusResult<Option<&str>> {
        let (formula, sound) = match (&self.danger_formula, &self.danger_sound) {
            (Some(formula), Some(sound)) => (formula, sound),
            _ => return Ok(None),
        };

        let period = self.check_danger_period;
        let mut progress = f64::from_bits(self.state.danger_progress.load(Ordering::Relaxed)) + elapsed_ms;
        let due = progress >= period;
        if due {
            progress = if period > 0.0 { progress % period } else { 0.0 };
        }
        self.state.danger_progress.store(progress.to_bits(), Ordering::Relaxed);
        if !due {
            return Ok(None);
        }

        let dangerous = channel_formula::is_dangerous(formula, self.read_value())?;
        let was_dangerous = self.state.danger_active.swap(dangerous, Ordering::Relaxed);
        if dangerous && (period != 0.0 || !was_dangerous) {
            self.state.danger_mark.store(true, Ordering::Relaxed);
            return Ok(Some(sound.as_str()));
        }
        Ok(None)
    }

    /// Take the pending danger mark, clearing it
    pub fn consume_danger_mark(&self) -> bool {
        self.state.danger_mark.swap(false, Ordering::Relaxed)
    }

    /// Forget runtime progress (after a reconnect)
    pub(crate) fn reset_runtime(&self) {
        self.state.update_progress.store(0f32.to_bits(), Ordering::Relaxed);
        self.state.should_read.store(false, Ordering::Relaxed);
        self.mark_read_valid(false);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("region", &self.region)
            .field("data_type", &self.data_type)
            .field("read_value", &self.read_value())
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel(name='{}', address='{}:{}')", self.name, self.address, self.data_type)
    }
}
