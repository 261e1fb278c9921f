//! Callback logging for the polling runtime
//!
//! `CallbackLogger` is the diagnostic surface handed to applications. It keeps
//! zero or more sinks (`LogCallback`) and an enable flag; clones share both, so
//! the connection managers, the scheduler and the client all write into the
//! same set of sinks that the application registered.
//!
//! Library internals additionally use the `log` facade; the logger here is for
//! the free-text lines an operator is expected to read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::protocol::ModbusFunction;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show interpreted request/response summaries only
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that fans messages out to registered sinks
#[derive(Clone)]
pub struct CallbackLogger {
    sources: Arc<RwLock<Vec<Arc<LogCallback>>>>,
    enabled: Arc<AtomicBool>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        let sources = callback.into_iter().map(Arc::new).collect();
        Self {
            sources: Arc::new(RwLock::new(sources)),
            enabled: Arc::new(AtomicBool::new(true)),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error => eprintln!("[{}] ERROR: {}", timestamp, message),
                LogLevel::Warn => eprintln!("[{}] WARN: {}", timestamp, message),
                LogLevel::Info => println!("[{}] INFO: {}", timestamp, message),
                LogLevel::Debug => println!("[{}] DEBUG: {}", timestamp, message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger without sinks
    ///
    /// Sinks registered later with [`add_source`](Self::add_source) still
    /// receive messages.
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Register another sink
    pub fn add_source(&self, callback: LogCallback) {
        self.sources.write().push(Arc::new(callback));
    }

    /// Remove every sink
    pub fn clear_sources(&self) {
        self.sources.write().clear();
    }

    /// Number of registered sinks
    pub fn source_count(&self) -> usize {
        self.sources.read().len()
    }

    /// Turn the whole logger on or off
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Change the most verbose level that still reaches the sinks
    pub fn set_min_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.should_log(level) {
            return;
        }
        // Clone the handles so a sink may register another sink without deadlocking.
        let sources: Vec<Arc<LogCallback>> = self.sources.read().clone();
        for source in sources {
            source(level, message);
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Check if a message at the given level should be logged
    fn should_log(&self, level: LogLevel) -> bool {
        self.is_enabled() && level <= self.min_level && !self.sources.read().is_empty()
    }

    /// Log packet data with hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }

        let message = format!("{} packet ({} bytes): {}", direction, data.len(), hex_dump(data));
        self.log(level, &message);
    }

    // Scheduler and connection lifecycle

    pub fn thread_started(&self, name: &str) {
        self.debug(&format!("Thread started: {}", name));
    }

    pub fn thread_stopped(&self, name: &str) {
        self.debug(&format!("Thread stopped: {}", name));
    }

    pub fn connect_success(&self, endpoint: &str) {
        self.info(&format!("Connected: {}", endpoint));
    }

    pub fn connect_failed(&self, endpoint: &str, attempt: u32, error: &str) {
        self.warn(&format!("Connect failed: {} (attempt {}): {}", endpoint, attempt, error));
    }

    pub fn reconnect_scheduled(&self, endpoint: &str, attempt: u32, delay: Duration) {
        self.info(&format!(
            "Reconnect scheduled: {} (attempt {}, in {} ms)",
            endpoint,
            attempt,
            delay.as_millis()
        ));
    }

    pub fn reconnect_failed(&self, endpoint: &str, attempts: u32) {
        self.error(&format!("Reconnect failed: {} after {} retries", endpoint, attempts));
    }

    pub fn disconnected(&self, endpoint: &str, reason: &str) {
        self.warn(&format!("Disconnected: {} ({})", endpoint, reason));
    }

    // Transactions

    /// Log an outgoing request with the configured mode
    pub fn log_request(&self, transaction_id: u16, function: ModbusFunction, address: u16, quantity: u16, frame: &[u8]) {
        if matches!(self.mode, LoggingMode::Interpreted | LoggingMode::Both) {
            self.debug(&format!(
                "Request #{} -> Function: {} (0x{:02X}), Address: {}, Quantity: {}",
                transaction_id,
                get_function_name(function.to_u8()),
                function.to_u8(),
                address,
                quantity
            ));
        }
        if matches!(self.mode, LoggingMode::Raw | LoggingMode::Both) {
            self.log_packet(LogLevel::Debug, "Send", frame);
        }
    }

    /// Log a raw response frame
    pub fn log_response(&self, frame: &[u8]) {
        if matches!(self.mode, LoggingMode::Raw | LoggingMode::Both) {
            self.log_packet(LogLevel::Debug, "Recv", frame);
        }
    }

    pub fn read_success(&self, channels: &[String], elapsed: Duration) {
        self.debug(&format!(
            "Read success: [{}] in {} ms",
            channels.join(", "),
            elapsed.as_millis()
        ));
    }

    pub fn read_failed(&self, function: u8, code: u8, message: &str) {
        self.warn(&format!(
            "Read failed: {} (0x{:02X}) exception 0x{:02X}: {}",
            get_function_name(function & 0x7F),
            function,
            code,
            message
        ));
    }

    pub fn write_success(&self, channel: &str, value: f64) {
        self.debug(&format!("Write success: {} = {}", channel, value));
    }

    pub fn read_formula_error(&self, channel: &str, error: &str) {
        self.error(&format!("Read formula error on {}: {}", channel, error));
    }

    pub fn write_formula_error(&self, channel: &str, error: &str) {
        self.error(&format!("Write formula error on {}: {}", channel, error));
    }

    pub fn response_timeout(&self, endpoint: &str, transaction_id: u16, timeout: Duration) {
        self.warn(&format!(
            "Response timeout: {} transaction #{} after {} ms",
            endpoint,
            transaction_id,
            timeout.as_millis()
        ));
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("sources", &self.source_count())
            .field("enabled", &self.is_enabled())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Space separated upper-case hex dump
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Get human-readable function name
pub fn get_function_name(function_code: u8) -> &'static str {
    match function_code {
        0x01 => "Read Coils",
        0x02 => "Read Discrete Inputs",
        0x03 => "Read Holding Registers",
        0x04 => "Read Input Registers",
        0x05 => "Write Single Coil",
        0x06 => "Write Single Register",
        0x0F => "Write Multiple Coils",
        0x10 => "Write Multiple Registers",
        _ => "Unknown Function",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn capture() -> (LogCallback, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().push(format!("{} {}", level.as_str(), message));
        });
        (callback, lines)
    }

    #[test]
    fn test_sources_share_messages() {
        let (first, first_lines) = capture();
        let (second, second_lines) = capture();
        let logger = CallbackLogger::new(Some(first), LogLevel::Debug);
        logger.clone().add_source(second);

        logger.info("hello");
        assert_eq!(first_lines.lock().as_slice(), ["INFO hello"]);
        assert_eq!(second_lines.lock().as_slice(), ["INFO hello"]);
        assert_eq!(logger.source_count(), 2);
    }

    #[test]
    fn test_level_filter_and_enable_flag() {
        let (callback, lines) = capture();
        let logger = CallbackLogger::new(Some(callback), LogLevel::Warn);
        logger.debug("dropped");
        logger.error("kept");
        logger.set_enabled(false);
        logger.error("muted");
        assert_eq!(lines.lock().as_slice(), ["ERROR kept"]);

        let mut logger = logger;
        logger.set_enabled(true);
        logger.set_min_level(LogLevel::Debug);
        logger.debug("now kept");
        logger.clear_sources();
        logger.error("nobody listens");
        assert_eq!(lines.lock().len(), 2);
    }

    #[test]
    fn test_mode_selects_request_format() {
        let (callback, lines) = capture();
        let mut logger = CallbackLogger::with_mode(Some(callback), LogLevel::Debug, LoggingMode::Interpreted);
        logger.log_request(7, ModbusFunction::ReadInputRegisters, 3, 2, &[0x00, 0x07]);
        assert_eq!(
            lines.lock()[0],
            "DEBUG Request #7 -> Function: Read Input Registers (0x04), Address: 3, Quantity: 2"
        );

        logger.set_mode(LoggingMode::Both);
        assert_eq!(logger.get_mode(), LoggingMode::Both);
        logger.log_request(8, ModbusFunction::ReadInputRegisters, 3, 2, &[0x00, 0x08]);
        assert_eq!(lines.lock().len(), 3);
        assert_eq!(lines.lock()[2], "DEBUG Send packet (2 bytes): 00 08");
    }

    #[test]
    fn test_packet_dump() {
        let (callback, lines) = capture();
        let logger = CallbackLogger::with_mode(Some(callback), LogLevel::Debug, LoggingMode::Raw);
        logger.log_response(&[0x00, 0x01, 0xAB]);
        assert_eq!(lines.lock()[0], "DEBUG Recv packet (3 bytes): 00 01 AB");
        assert_eq!(get_function_name(0x10), "Write Multiple Registers");
    }
}
