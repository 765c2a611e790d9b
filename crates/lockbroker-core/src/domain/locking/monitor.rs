//! Stale lock monitor
//!
//! Periodically looks at the longest-held lock and alerts operators when it
//! has been held longer than expected. It never revokes a lock: a lock held
//! too long is a bug somewhere in a client, and taking it away could let two
//! clients touch the same user or node.

use super::alert::{AlertSink, OperatorAlert, deliver};
use super::manager::LockBroker;
use super::types::LockKey;
use crate::config::MonitorConfig;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A lock held past the configured threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleLock {
    pub key: LockKey,
    pub acquired_at: DateTime<Utc>,
    pub held_for: Duration,
}

/// Background watchdog for long-held locks
pub struct StaleLockMonitor {
    broker: LockBroker,
    alerts: Arc<dyn AlertSink>,
    check_interval: Duration,
    max_hold: Duration,
    alert_cooldown: Duration,
}

impl StaleLockMonitor {
    pub fn new(broker: LockBroker, alerts: Arc<dyn AlertSink>, config: &MonitorConfig) -> Self {
        Self {
            broker,
            alerts,
            check_interval: config.check_interval(),
            max_hold: config.max_hold(),
            alert_cooldown: config.alert_cooldown(),
        }
    }

    /// Inspect the longest-held lock once.
    pub async fn check_once(&self) -> Option<StaleLock> {
        let oldest = self.broker.oldest_held_lock().await?;
        let held_for = Instant::now().saturating_duration_since(oldest.held_since);

        if held_for > self.max_hold {
            Some(StaleLock {
                key: oldest.key,
                acquired_at: oldest.acquired_at,
                held_for,
            })
        } else {
            debug!(lock = %oldest.key, held_secs = held_for.as_secs(), "Oldest lock within hold limit");
            None
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.check_interval.as_secs(),
            max_hold_secs = self.max_hold.as_secs(),
            "Stale lock monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.check_interval) => {}
            }

            let Some(stale) = self.check_once().await else {
                continue;
            };

            warn!(
                lock = %stale.key,
                acquired_at = %stale.acquired_at,
                held_secs = stale.held_for.as_secs(),
                "Lock has been held too long"
            );
            let alert = OperatorAlert::stale_lock(
                &stale.key.to_string(),
                stale.acquired_at,
                stale.held_for.as_secs(),
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = deliver(self.alerts.as_ref(), &alert) => {}
            }

            // Hold off so a stuck lock does not flood operators.
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.alert_cooldown) => {}
            }
        }

        info!("Stale lock monitor stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
