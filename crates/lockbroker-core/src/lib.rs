//! Lockbroker Core Library
//!
//! This crate provides the core functionality for Lockbroker, including:
//! - The lock broker (sessions, user and node locks, FIFO queues)
//! - The lock policy that keeps sessions from deadlocking
//! - The stale lock monitor and operator alerts
//! - The RPC server and a client for it
//! - Configuration loading

pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod rpc;
pub mod server;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{LockClient, get_status};
    pub use crate::config::Config;
    pub use crate::domain::locking::{BrokerStatus, LockBroker, LockDict, LockKind};
    pub use crate::error::{Error, Result};
    pub use crate::server::LockServer;
}
