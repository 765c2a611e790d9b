//! Lock broker coordinating sessions, locks and blocked acquirers
//!
//! The broker is the single entry point for the five client operations. It:
//! - keeps all broker state behind one mutex
//! - blocks unsatisfied acquire calls on the session's gate outside that mutex
//! - verifies the table after every mutation
//! - stops for good after an internal error (fail-stop)

use super::alert::{AlertSink, OperatorAlert, deliver};
use super::state::{AcquireOutcome, BrokerState, HeldLock};
use super::types::{BrokerStatus, LockDict, LockError, LockResult, SessionId};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lock broker shared by every request task
#[derive(Clone)]
pub struct LockBroker {
    /// All sessions, locks and the acquisition timeline
    state: Arc<Mutex<BrokerState>>,

    /// Where internal errors are reported
    alerts: Arc<dyn AlertSink>,

    /// Cancelled on shutdown or after an internal error
    shutdown: CancellationToken,

    /// Set once an internal error has been seen
    failed: Arc<AtomicBool>,
}

impl std::fmt::Debug for LockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockBroker")
            .field("failed", &self.has_failed())
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl LockBroker {
    /// Create a broker that reports internal errors to `alerts`
    pub fn new(alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
            alerts,
            shutdown: CancellationToken::new(),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token cancelled when the broker stops; cancel it to stop the broker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether the broker stopped because of an internal error
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// `StartSession`
    pub async fn start_session(&self) -> LockResult<SessionId> {
        self.ensure_running()?;

        let session_id = self.state.lock().await.start_session();
        info!(session_id = %session_id, "StartSession called");
        Ok(session_id)
    }

    /// `EndSession`
    pub async fn end_session(&self, session_id: &str) -> LockResult<()> {
        self.ensure_running()?;
        info!(session_id = %session_id, "EndSession called");

        let result = {
            let mut state = self.state.lock().await;
            state.end_session(session_id).and_then(|_| state.debug_verify())
        };
        self.finish("EndSession", session_id, result).await
    }

    /// `AcquireLocks`
    ///
    /// Returns once every requested lock is held by the session. There is no
    /// timeout: a queued request waits until it is promoted or the broker
    /// shuts down.
    pub async fn acquire_locks(&self, session_id: &str, request: &LockDict) -> LockResult<()> {
        self.ensure_running()?;
        info!(session_id = %session_id, locks = %request, "AcquireLocks called");

        let outcome = {
            let mut state = self.state.lock().await;
            state
                .acquire_locks(session_id, request)
                .and_then(|outcome| state.verify_request(session_id, request).map(|_| outcome))
        };

        let gate = match self.finish("AcquireLocks", session_id, outcome).await? {
            AcquireOutcome::Granted => None,
            AcquireOutcome::Queued(gate) => Some(gate),
        };

        if let Some(gate) = gate {
            info!(session_id = %session_id, "AcquireLocks waiting for queued locks");

            // The wait runs on its own task so a caller that goes away does
            // not leave the session marked as mid-acquire.
            let broker = self.clone();
            let owner = session_id.to_string();
            let waiter = tokio::spawn(async move { broker.wait_for_gate(&owner, gate).await });

            let result = match waiter.await {
                Ok(result) => result,
                Err(e) => Err(LockError::internal(format!("acquire waiter task failed: {}", e))),
            };
            self.finish("AcquireLocks", session_id, result).await?;
        }

        info!(session_id = %session_id, locks = %request, "AcquireLocks fulfilled request");
        Ok(())
    }

    async fn wait_for_gate(&self, session_id: &str, gate: oneshot::Receiver<()>) -> LockResult<()> {
        tokio::select! {
            opened = gate => {
                opened.map_err(|_| {
                    LockError::internal(format!(
                        "gate for session {} was dropped before it opened",
                        session_id
                    ))
                })?;
            }
            _ = self.shutdown.cancelled() => return Err(LockError::ShuttingDown),
        }

        self.state.lock().await.finish_acquire(session_id)
    }

    /// `ReleaseLocks`
    pub async fn release_locks(&self, session_id: &str, request: &LockDict) -> LockResult<()> {
        self.ensure_running()?;
        info!(session_id = %session_id, locks = %request, "ReleaseLocks called");

        let result = {
            let mut state = self.state.lock().await;
            state
                .release_locks(session_id, request)
                .and_then(|_| state.verify_request(session_id, request))
        };
        self.finish("ReleaseLocks", session_id, result).await
    }

    /// `GetStatus`
    ///
    /// Never mutates and never fails while the broker is serving. Once the
    /// broker has stopped, after shutdown or an internal error, it answers
    /// `ShuttingDown` like every other operation: a table that failed its
    /// checks is not worth reporting.
    pub async fn status(&self) -> LockResult<BrokerStatus> {
        self.ensure_running()?;
        info!("GetStatus called");
        Ok(self.state.lock().await.status())
    }

    /// The longest-held lock, read under the broker mutex.
    pub async fn oldest_held_lock(&self) -> Option<HeldLock> {
        self.state.lock().await.oldest_held_lock()
    }

    fn ensure_running(&self) -> LockResult<()> {
        if self.shutdown.is_cancelled() {
            Err(LockError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Log the outcome of an operation and escalate internal errors.
    async fn finish<T>(&self, operation: &str, session_id: &str, result: LockResult<T>) -> LockResult<T> {
        match &result {
            Err(LockError::InvalidRequest(message)) => {
                warn!(session_id = %session_id, operation, "The lock broker was used incorrectly: {}", message);
            }
            Err(LockError::Internal(message)) => {
                self.fail(operation, message).await;
            }
            _ => {}
        }
        result
    }

    /// Stop serving after an internal error.
    ///
    /// The lock table is the only record of who may touch which user or node;
    /// continuing after it is inconsistent could silently break mutual
    /// exclusion for every client.
    pub async fn fail(&self, operation: &str, message: &str) {
        let first = !self.failed.swap(true, Ordering::SeqCst);
        error!(operation, "The lock broker had an internal error and is exiting: {}", message);
        self.shutdown.cancel();

        if first {
            let alert = OperatorAlert::internal_error(&format!("{}: {}", operation, message));
            deliver(self.alerts.as_ref(), &alert).await;
        }
    }

    /// Run `task` on its own tokio task and treat a panic as an internal error.
    ///
    /// `tokio::sync::Mutex` does not poison, so a panic while the state guard
    /// was held would otherwise leave a half-updated table in service.
    pub async fn guarded<T, F>(&self, operation: &str, task: F) -> LockResult<T>
    where
        T: Send + 'static,
        F: Future<Output = LockResult<T>> + Send + 'static,
    {
        match tokio::spawn(task).await {
            Ok(result) => result,
            Err(e) => {
                let message = if e.is_panic() {
                    let payload = e.into_panic();
                    let detail = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    format!("panicked: {}", detail)
                } else {
                    format!("task was cancelled: {}", e)
                };
                self.fail(operation, &message).await;
                Err(LockError::Internal(message))
            }
        }
    }

    /// Mutate the state directly, bypassing every check.
    #[cfg(test)]
    pub(crate) async fn with_state_unchecked(&self, f: impl FnOnce(&mut BrokerState)) {
        f(&mut *self.state.lock().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::alert::{
        ALERT_DELIVERY_TIMEOUT, AlertKind, MemoryAlertSink, WebhookAlertSink,
    };
    use crate::domain::locking::types::{LockKey, LockKind};
    use async_trait::async_trait;
    use std::time::Duration;

    fn create_test_broker() -> (LockBroker, MemoryAlertSink) {
        let sink = MemoryAlertSink::new();
        (LockBroker::new(Arc::new(sink.clone())), sink)
    }

    async fn wait_until_blocked(broker: &LockBroker, session_id: &str) {
        for _ in 0..200 {
            let status = broker.status().await.unwrap();
            if status.session(session_id).map(|s| !s.gate_open).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {} never blocked", session_id);
    }

    #[tokio::test]
    async fn test_uncontended_acquire_returns_immediately() {
        let (broker, _) = create_test_broker();
        let sess = broker.start_session().await.unwrap();

        broker.acquire_locks(&sess, &LockDict::users(["bob"])).await.unwrap();
        broker.acquire_locks(&sess, &LockDict::nodes(["123"])).await.unwrap();

        let status = broker.status().await.unwrap();
        let session = status.session(&sess).unwrap();
        assert!(session.gate_open);
        assert!(session.held_locks.contains(LockKind::User, "bob"));
        assert!(session.held_locks.contains(LockKind::Node, "123"));
    }

    #[tokio::test]
    async fn test_blocked_acquire_resumes_in_fifo_order() {
        let (broker, _) = create_test_broker();
        let s1 = broker.start_session().await.unwrap();
        let s2 = broker.start_session().await.unwrap();
        let s3 = broker.start_session().await.unwrap();
        let bob = LockDict::users(["bob"]);

        broker.acquire_locks(&s1, &bob).await.unwrap();

        let t2 = {
            let (broker, s2, bob) = (broker.clone(), s2.clone(), bob.clone());
            tokio::spawn(async move { broker.acquire_locks(&s2, &bob).await })
        };
        wait_until_blocked(&broker, &s2).await;

        let t3 = {
            let (broker, s3, bob) = (broker.clone(), s3.clone(), bob.clone());
            tokio::spawn(async move { broker.acquire_locks(&s3, &bob).await })
        };
        wait_until_blocked(&broker, &s3).await;

        broker.release_locks(&s1, &bob).await.unwrap();
        t2.await.unwrap().unwrap();

        let status = broker.status().await.unwrap();
        let record = status.lock(LockKind::User, "bob").unwrap();
        assert_eq!(record.holder.as_deref(), Some(s2.as_str()));
        assert_eq!(record.queue, vec![s3.clone()]);
        assert!(!t3.is_finished());

        broker.release_locks(&s2, &bob).await.unwrap();
        t3.await.unwrap().unwrap();

        let status = broker.status().await.unwrap();
        assert_eq!(
            status.lock(LockKind::User, "bob").unwrap().holder.as_deref(),
            Some(s3.as_str())
        );
    }

    #[tokio::test]
    async fn test_second_acquire_while_blocked_is_rejected() {
        let (broker, _) = create_test_broker();
        let holder = broker.start_session().await.unwrap();
        let waiter = broker.start_session().await.unwrap();

        broker.acquire_locks(&holder, &LockDict::users(["bob"])).await.unwrap();
        let blocked = {
            let (broker, waiter) = (broker.clone(), waiter.clone());
            tokio::spawn(async move { broker.acquire_locks(&waiter, &LockDict::users(["bob"])).await })
        };
        wait_until_blocked(&broker, &waiter).await;

        let err = broker
            .acquire_locks(&waiter, &LockDict::nodes(["123"]))
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        broker.release_locks(&holder, &LockDict::users(["bob"])).await.unwrap();
        blocked.await.unwrap().unwrap();

        // Once the first call has returned the session may acquire again.
        broker.acquire_locks(&waiter, &LockDict::nodes(["123"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_caller_still_clears_in_progress_flag() {
        let (broker, _) = create_test_broker();
        let holder = broker.start_session().await.unwrap();
        let waiter = broker.start_session().await.unwrap();

        broker.acquire_locks(&holder, &LockDict::nodes(["1"])).await.unwrap();
        let blocked = {
            let (broker, waiter) = (broker.clone(), waiter.clone());
            tokio::spawn(async move { broker.acquire_locks(&waiter, &LockDict::nodes(["1"])).await })
        };
        wait_until_blocked(&broker, &waiter).await;
        blocked.abort();

        broker.release_locks(&holder, &LockDict::nodes(["1"])).await.unwrap();
        broker.release_locks(&waiter, &LockDict::nodes(["1"])).await.unwrap();

        // The waiter task clears the in-progress flag even without a caller.
        let mut acquired = false;
        for _ in 0..200 {
            if broker.acquire_locks(&waiter, &LockDict::nodes(["2"])).await.is_ok() {
                acquired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(acquired);
    }

    #[tokio::test]
    async fn test_client_errors_keep_broker_running() {
        let (broker, sink) = create_test_broker();
        let sess = broker.start_session().await.unwrap();

        assert!(broker.end_session("nope").await.unwrap_err().is_client_error());
        assert!(
            broker
                .release_locks(&sess, &LockDict::users(["bob"]))
                .await
                .unwrap_err()
                .is_client_error()
        );

        assert!(!broker.has_failed());
        assert!(broker.status().await.is_ok());
        assert!(sink.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_internal_error_stops_broker_and_alerts_once() {
        let (broker, sink) = create_test_broker();
        let sess = broker.start_session().await.unwrap();
        let token = broker.shutdown_token();

        broker.fail("ReleaseLocks", "lock table corrupted").await;
        broker.fail("ReleaseLocks", "still corrupted").await;

        assert!(broker.has_failed());
        assert!(token.is_cancelled());
        assert_eq!(broker.status().await.unwrap_err(), LockError::ShuttingDown);
        assert_eq!(
            broker.acquire_locks(&sess, &LockDict::users(["bob"])).await.unwrap_err(),
            LockError::ShuttingDown
        );

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::InternalError);
        assert!(alerts[0].message.contains("lock table corrupted"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_acquire() {
        let (broker, sink) = create_test_broker();
        let holder = broker.start_session().await.unwrap();
        let waiter = broker.start_session().await.unwrap();

        broker.acquire_locks(&holder, &LockDict::users(["bob"])).await.unwrap();
        let blocked = {
            let (broker, waiter) = (broker.clone(), waiter.clone());
            tokio::spawn(async move { broker.acquire_locks(&waiter, &LockDict::users(["bob"])).await })
        };
        wait_until_blocked(&broker, &waiter).await;

        broker.shutdown_token().cancel();
        assert_eq!(blocked.await.unwrap().unwrap_err(), LockError::ShuttingDown);
        assert!(!broker.has_failed());
        assert!(sink.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_panic_in_guarded_task_stops_broker() {
        let (broker, sink) = create_test_broker();
        let sess = broker.start_session().await.unwrap();

        let result: LockResult<()> = broker
            .guarded("ReleaseLocks", async { panic!("index out of bounds") })
            .await;

        match result {
            Err(LockError::Internal(message)) => assert!(message.contains("index out of bounds")),
            other => panic!("expected internal error, got {:?}", other),
        }
        assert!(broker.has_failed());
        assert_eq!(
            broker.acquire_locks(&sess, &LockDict::users(["bob"])).await.unwrap_err(),
            LockError::ShuttingDown
        );
        assert_eq!(sink.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_guarded_task_passes_results_through() {
        let (broker, _) = create_test_broker();

        let ok = broker.guarded("GetStatus", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: LockResult<()> = broker
            .guarded("EndSession", async { Err(LockError::InvalidRequest("nope".into())) })
            .await;
        assert!(err.unwrap_err().is_client_error());
        assert!(!broker.has_failed());
    }

    #[tokio::test]
    async fn test_corrupt_queue_is_internal_error() {
        let (broker, sink) = create_test_broker();
        let sess = broker.start_session().await.unwrap();
        broker.acquire_locks(&sess, &LockDict::users(["bob"])).await.unwrap();

        broker
            .with_state_unchecked(|state| {
                state.enqueue_unchecked(LockKey::new(LockKind::User, "bob"), "1")
            })
            .await;

        let err = broker
            .release_locks(&sess, &LockDict::users(["bob"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Internal(_)));
        assert!(broker.has_failed());
        assert_eq!(sink.alerts()[0].kind, AlertKind::InternalError);
    }

    /// Never finishes a delivery.
    struct StuckSink;

    #[async_trait]
    impl AlertSink for StuckSink {
        async fn notify(&self, _alert: &OperatorAlert) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_does_not_wait_forever_for_alerts() {
        let broker = LockBroker::new(Arc::new(StuckSink));

        let started = tokio::time::Instant::now();
        broker.fail("ReleaseLocks", "corrupt").await;

        assert!(started.elapsed() < ALERT_DELIVERY_TIMEOUT + Duration::from_secs(1));
        assert!(broker.has_failed());
        assert!(broker.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_fail_with_silent_webhook_returns() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let sink =
            WebhookAlertSink::with_timeout(format!("http://{addr}/alerts"), Duration::from_millis(200))
                .unwrap();
        let broker = LockBroker::new(Arc::new(sink));

        let finished =
            tokio::time::timeout(Duration::from_secs(5), broker.fail("ReleaseLocks", "corrupt")).await;
        assert!(finished.is_ok());
        assert!(broker.has_failed());
    }
}
