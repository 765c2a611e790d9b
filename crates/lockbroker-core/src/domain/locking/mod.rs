//! Session-based user and node locks
//!
//! This module implements the lock broker: clients start a session, acquire
//! and release named locks under it, and end the session when done.
//!
//! # Architecture
//!
//! - **Types**: `LockKind`, `LockDict`, `LockSet`, `BrokerStatus`, `LockError`
//! - **Validation**: lockdict sanitizing and the acquisition policy
//! - **State**: `BrokerState`, the lock table, session registry and timeline
//! - **Broker**: `LockBroker`, the mutex, the blocking gates and fail-stop
//! - **Monitor**: `StaleLockMonitor`, alerts on locks held too long
//!
//! # Lock ordering
//!
//! A session that wants both kinds of lock must take its user locks first and
//! its node locks second, each in a single call. Requests that break this
//! order are rejected, which is what keeps sessions from deadlocking.
//!
//! # Example
//!
//! ```ignore
//! use lockbroker_core::domain::locking::{LockBroker, LockDict, LogAlertSink};
//!
//! let broker = LockBroker::new(Arc::new(LogAlertSink));
//! let session = broker.start_session().await?;
//!
//! broker.acquire_locks(&session, &LockDict::users(["bob"])).await?;
//! broker.acquire_locks(&session, &LockDict::nodes(["123", "456"])).await?;
//!
//! // Do work with the user and nodes...
//!
//! broker.release_locks(&session, &LockDict::nodes(["123", "456"])).await?;
//! broker.release_locks(&session, &LockDict::users(["bob"])).await?;
//! broker.end_session(&session).await?;
//! ```

pub mod alert;
pub mod manager;
pub mod monitor;
pub mod state;
pub mod types;
pub mod validation;

// Re-export main types
pub use alert::{
    ALERT_DELIVERY_TIMEOUT, AlertKind, AlertSink, LogAlertSink, MemoryAlertSink, OperatorAlert,
    WebhookAlertSink,
};
pub use manager::LockBroker;
pub use monitor::{StaleLock, StaleLockMonitor};
pub use state::{AcquireOutcome, BrokerState, HeldLock};
pub use types::{
    BrokerStatus, LockDict, LockError, LockKey, LockKind, LockRecordStatus, LockResult, LockSet,
    LockTimeEntry, SessionId, SessionStatus,
};
pub use validation::parse_session_id;
