//! # Voltage Poll - Modbus TCP Polling Runtime
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.3.0
//! **License:** MIT
//!
//! A Modbus TCP master runtime for supervisory applications: a tree of
//! connections and channels is polled continuously, raw registers are turned
//! into engineering values by small formulas, and lost connections are
//! recovered on their own.
//!
//! ## Features
//!
//! - **Channel polling**: every channel has its own update interval; due
//!   channels become read transactions, optionally batched per region
//! - **Formulas**: `${value} / 10`, `a > b` and friends for read, write and
//!   danger conditions
//! - **Data types**: Int16, UInt16, Int32, UInt32 and Float32 with register
//!   normalisation
//! - **Connection recovery**: bounded retries with a configurable policy once
//!   the budget is spent
//! - **Two-task scheduler**: one request loop and one update loop per client,
//!   whatever the number of connections
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Used for |
//! |------|----------|----------|
//! | 0x01 | Read Coils | Coils channels |
//! | 0x02 | Read Discrete Inputs | Discretes channels |
//! | 0x03 | Read Holding Registers | Holdings channels |
//! | 0x04 | Read Input Registers | Inputs channels |
//! | 0x05 | Write Single Coil | Coils writes |
//! | 0x06 | Write Single Register | 16-bit Holdings writes |
//! | 0x10 | Write Multiple Registers | 32-bit and text Holdings writes |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_poll::{Channel, ClientOptions, ConfigTree, Connection, DataType, Formula};
//! use voltage_poll::{ModbusClient, ModbusConfig, ModbusResult, Region};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut tree = ConfigTree::new("plant");
//!     let boiler = tree.add_connection(tree.root(), Connection::new("boiler", "192.168.1.10", 502))?;
//!     tree.add_channel(
//!         boiler,
//!         Channel::new("temperature", Region::Inputs, DataType::Int16)
//!             .with_address(0)
//!             .with_read_formula(Formula::parse("${value} / 10")?)
//!             .with_fraction_size(1),
//!     )?;
//!
//!     let config = ModbusConfig::build(tree)?;
//!     config.set_read_channels(Arc::new(|channels: &[Arc<Channel>]| {
//!         for channel in channels {
//!             println!("{} = {}", channel.name, channel.read_value());
//!         }
//!     }));
//!
//!     let mut client = ModbusClient::new(ClientOptions::default());
//!     client.init(config)?;
//!     client.create()?;
//!     client.connect(|| println!("connected")).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     client.destroy().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ModbusClient                  │
//! └──────────────────────────────────────────────┘
//!          │                          │
//! ┌─────────────────┐    ┌──────────────────────┐
//! │  Request loop   │    │     Update loop      │
//! │ (send one tx)   │    │ (progress, responses)│
//! └─────────────────┘    └──────────────────────┘
//!          │                          │
//! ┌──────────────────────────────────────────────┐
//! │     ConnectionManager (one per connection)    │
//! │  state machine · request queue · decoder      │
//! └──────────────────────────────────────────────┘
//!          │                          ▲
//! ┌─────────────────┐    ┌──────────────────────┐
//! │   Transport     │───►│   TransportEvent     │
//! │   (Async I/O)   │    │ (bytes, link closed) │
//! └─────────────────┘    └──────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Logging system for the library
pub mod logging;

/// Register data types and value normalisation
pub mod data_type;

/// Expression parsing and evaluation
pub mod formula;

/// Configuration tree: connections, channels, descriptors
pub mod config;

/// Modbus TCP frames
pub mod protocol;

/// Network transport layer
pub mod transport;

/// Transactions, channel grouping and the request queue
pub mod transaction;

/// Per-connection state machine
pub mod manager;

/// Request and update loops
pub mod scheduler;

/// Client facade
pub mod client;

/// Utility functions and response time metrics
pub mod utils;

// Re-export main types for convenience
pub use client::{ClientListener, ClientOptions, ClientState, ModbusClient, TransportFactory};
pub use config::{
    Channel, ConfigTree, Connection, ExhaustionPolicy, ModbusConfig, NodeId, Region, TreeDescriptor,
};
pub use data_type::DataType;
pub use error::{ModbusError, ModbusResult};
pub use formula::{Formula, Value};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use manager::{ConnectionCounters, ConnectionListener, ConnectionManager, ConnectionState};
pub use protocol::{FrameError, ModbusFunction, ModbusRequest, ModbusResponse};
pub use scheduler::{DangerCallback, PollingScheduler};
pub use transport::{TcpTransport, Transport, TransportEvent, TransportStats};
pub use utils::ResponseTimeMetrics;

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of coils that can be read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils in one Write Multiple Coils request
pub const MAX_WRITE_COILS_PER_REQUEST: u16 = 1968;

/// Maximum number of registers in one Write Multiple Registers request
pub const MAX_WRITE_REGISTERS_PER_REQUEST: u16 = 123;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Poll v{} - Modbus TCP polling runtime by Evan Liu", VERSION)
}
