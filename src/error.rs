//! # Voltage Poll Error Handling
//!
//! This module provides the error type shared by every layer of the polling
//! runtime: the transport collaborator, the Modbus TCP codec, the formula
//! engine and the configuration tree.
//!
//! ## Error Categories
//!
//! ### Connection Errors
//! - **I/O Errors**: socket failures reported by the transport
//! - **Connection Errors**: connect refused, connection lost
//! - **Timeout Errors**: connect or response timeouts
//! - **Retries Exhausted**: the per-connection retry budget ran out
//!
//! Connection errors are retried by the connection manager up to the
//! connection's `retries_count`.
//!
//! ### Protocol Errors
//! - **Protocol / Frame Errors**: malformed or unexpected responses
//! - **Exception Responses**: standard Modbus exception codes from devices
//! - **Transaction Mismatch**: a response whose id is not the outstanding one
//!
//! Protocol errors are logged and the response is discarded. They never count
//! against the retry budget.
//!
//! ### Formula Errors
//! - **Formula**: the expression text could not be parsed
//! - **Type Mismatch**: an operator received operands of the wrong type
//! - **Unknown Variable**: an identifier had no binding at evaluation time
//!
//! ### Configuration Errors
//! Raised by `ModbusConfig::build` before any connection is attempted.
//!
//! ## Usage Example
//!
//! ```rust
//! use voltage_poll::{ModbusError, ModbusResult};
//!
//! fn classify(result: ModbusResult<f64>) {
//!     match result {
//!         Ok(value) => println!("value: {}", value),
//!         Err(error) if error.is_formula_error() => println!("skipping channel: {}", error),
//!         Err(error) if error.is_recoverable() => println!("will retry: {}", error),
//!         Err(error) => println!("fatal: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for every fallible operation in the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Comprehensive error type for the polling runtime
///
/// Each variant carries enough context to log a useful line through the
/// callback logger without further lookups.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors reported by the transport
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation exceeded its configured timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The retry budget of a connection has been used up
    #[error("Retries exhausted for {endpoint} after {attempts} attempts")]
    RetriesExhausted { endpoint: String, attempts: u32 },

    /// General Modbus protocol violation
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Unsupported function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Response frame could not be parsed
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Modbus exception response
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Response does not belong to the outstanding transaction
    #[error("Transaction mismatch: expected={expected}, actual={actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// Invalid address range
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: i32, count: i32 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Expression text could not be parsed
    #[error("Formula error in '{expression}': {message}")]
    Formula { expression: String, message: String },

    /// Operator applied to operands of the wrong type
    #[error("Type mismatch: {left} {operator} {right}")]
    TypeMismatch { operator: String, left: String, right: String },

    /// Identifier without a binding at evaluation time
    #[error("Unknown variable: {name}")]
    UnknownVariable { name: String },

    /// Inconsistent configuration tree
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a retries exhausted error
    pub fn retries_exhausted<S: Into<String>>(endpoint: S, attempts: u32) -> Self {
        Self::RetriesExhausted {
            endpoint: endpoint.into(),
            attempts,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to their human-readable names.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a transaction mismatch error
    pub fn transaction_mismatch(expected: u16, actual: u16) -> Self {
        Self::TransactionMismatch { expected, actual }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: i32, count: i32) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a formula parse error
    pub fn formula<E: Into<String>, M: Into<String>>(expression: E, message: M) -> Self {
        Self::Formula {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch<O, L, R>(operator: O, left: L, right: R) -> Self
    where
        O: Into<String>,
        L: Into<String>,
        R: Into<String>,
    {
        Self::TypeMismatch {
            operator: operator.into(),
            left: left.into(),
            right: right.into(),
        }
    }

    /// Create an unknown variable error
    pub fn unknown_variable<S: Into<String>>(name: S) -> Self {
        Self::UnknownVariable { name: name.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_poll::ModbusError;
    ///
    /// let timeout_error = ModbusError::timeout("read response", 5000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let exhausted = ModbusError::retries_exhausted("10.0.0.1:502", 3);
    /// assert!(!exhausted.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a connection-level failure
    ///
    /// These are the errors that feed the reconnect state machine.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::RetriesExhausted { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::TransactionMismatch { .. }
        )
    }

    /// Check if the error came out of the formula engine
    pub fn is_formula_error(&self) -> bool {
        matches!(
            self,
            Self::Formula { .. } | Self::TypeMismatch { .. } | Self::UnknownVariable { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The duration is unknown here; callers that know it build the error
/// with [`ModbusError::timeout`] instead.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
