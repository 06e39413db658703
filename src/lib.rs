//! Modbus TCP Server Engine
//!
//! A standalone Modbus TCP server: MBAP frame codec, typed register
//! datastore with four memory regions, request dispatch with standard
//! exception handling, and concurrent per-connection TCP handling.

pub mod config;
pub mod modbus;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, UnitMode};
pub use modbus::{ExceptionCode, FrameDecoder, FunctionCode, QuantityLimits, Request, Response};
pub use services::{ModbusTcpServer, RequestDispatcher};
pub use storage::{DataStore, MemoryStore, UnitRouter};
pub use utils::error::{FrameError, ServerError};

pub const VERSION: &str = "0.1.0";
