// src/core/mod.rs

//! The central module containing the monitor core of replgate.

pub mod errors;
pub mod metrics;
pub mod monitor;
pub mod protocol;

pub use errors::MonitorError;
pub use protocol::RespFrame;
