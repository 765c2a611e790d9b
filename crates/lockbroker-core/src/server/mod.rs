//! RPC server for the lock broker
//!
//! ## Routes
//!
//! - `POST /rpc` - call one of the broker operations (see [`crate::rpc`]).
//! - `GET /health` - returns `{ "ok": true }` while the broker is serving.
//!
//! Each request runs on its own task, so a blocked `AcquireLocks` only holds
//! up its own caller.

use crate::config::{Config, MonitorConfig};
use crate::domain::locking::alert::sink_from_config;
use crate::domain::locking::{
    AlertSink, LockBroker, LockDict, LockError, LockResult, StaleLockMonitor, parse_session_id,
};
use crate::rpc::{RPC_PATH, RpcFault, RpcMethod, RpcReply, RpcRequest};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Build an axum `Router` serving the broker.
pub fn router(broker: LockBroker) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(RPC_PATH, post(rpc_handler))
        .with_state(broker)
}

/// Serve `broker` on `listener` until its shutdown token is cancelled.
pub async fn serve(broker: LockBroker, listener: TcpListener) -> std::io::Result<()> {
    let shutdown = broker.shutdown_token();
    let app = router(broker);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// The broker together with its stale lock monitor
pub struct LockServer {
    broker: LockBroker,
    monitor: StaleLockMonitor,
}

impl LockServer {
    /// Build a server from configuration.
    pub fn new(config: &Config) -> crate::Result<Self> {
        Ok(Self::with_alerts(&config.monitor, sink_from_config(&config.alerts)?))
    }

    /// Build a server that sends every operator alert to `alerts`.
    pub fn with_alerts(monitor: &MonitorConfig, alerts: Arc<dyn AlertSink>) -> Self {
        let broker = LockBroker::new(alerts.clone());
        let monitor = StaleLockMonitor::new(broker.clone(), alerts, monitor);
        Self { broker, monitor }
    }

    pub fn broker(&self) -> &LockBroker {
        &self.broker
    }

    /// Serve until the broker shuts down, then stop the monitor.
    pub async fn run(self, listener: TcpListener) -> std::io::Result<()> {
        let shutdown = self.broker.shutdown_token();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Lockbroker listening");
        }

        let monitor = self.monitor.spawn(shutdown.clone());
        let result = serve(self.broker, listener).await;

        shutdown.cancel();
        if let Err(e) = monitor.await {
            error!(error = %e, "Stale lock monitor task failed");
        }
        info!("Lockbroker stopped");
        result
    }
}

/// `GET /health`
async fn health_handler(State(broker): State<LockBroker>) -> Response {
    if broker.shutdown_token().is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ok": false }))).into_response()
    } else {
        Json(json!({ "ok": true })).into_response()
    }
}

/// `POST /rpc`
async fn rpc_handler(
    State(broker): State<LockBroker>,
    payload: Result<Json<RpcRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "Rejected malformed RPC body");
            return fault_response(&LockError::InvalidRequest(format!(
                "Malformed request: {}",
                rejection.body_text()
            )));
        }
    };

    let operation = request.method.clone();
    let task = {
        let broker = broker.clone();
        async move { dispatch(&broker, &request).await }
    };

    match broker.guarded(&operation, task).await {
        Ok(result) => (StatusCode::OK, Json(RpcReply::success(result))).into_response(),
        Err(e) => fault_response(&e),
    }
}

/// Run one RPC call against the broker.
///
/// The HTTP handler runs this through [`LockBroker::guarded`], so a panic
/// stops the broker like any other internal error.
pub async fn dispatch(broker: &LockBroker, request: &RpcRequest) -> LockResult<Value> {
    let method = request.method()?;
    let params = &request.params;

    match method {
        RpcMethod::StartSession => Ok(Value::String(broker.start_session().await?)),
        RpcMethod::EndSession => {
            let session_id = parse_session_id(&params[0])?;
            broker.end_session(&session_id).await?;
            Ok(Value::Bool(true))
        }
        RpcMethod::AcquireLocks => {
            let session_id = parse_session_id(&params[0])?;
            let lockdict = LockDict::from_value(&params[1])?;
            broker.acquire_locks(&session_id, &lockdict).await?;
            Ok(Value::Bool(true))
        }
        RpcMethod::ReleaseLocks => {
            let session_id = parse_session_id(&params[0])?;
            let lockdict = LockDict::from_value(&params[1])?;
            broker.release_locks(&session_id, &lockdict).await?;
            Ok(Value::Bool(true))
        }
        RpcMethod::GetStatus => {
            let status = broker.status().await?;
            match serde_json::to_value(&status) {
                Ok(value) => Ok(value),
                Err(e) => {
                    let message = format!("failed to encode status: {}", e);
                    broker.fail("GetStatus", &message).await;
                    Err(LockError::Internal(message))
                }
            }
        }
    }
}

fn status_code(error: &LockError) -> StatusCode {
    match error {
        LockError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        LockError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        LockError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn fault_response(error: &LockError) -> Response {
    let reply = RpcReply::failure(RpcFault::from(error));
    (status_code(error), Json(reply)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LockClient;
    use crate::domain::locking::{AlertKind, LockKey, LockKind, MemoryAlertSink};
    use std::time::Duration;

    fn create_test_broker() -> LockBroker {
        LockBroker::new(Arc::new(MemoryAlertSink::new()))
    }

    fn call(method: RpcMethod, params: Vec<Value>) -> RpcRequest {
        RpcRequest::new(method, params)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_code(&LockError::InvalidRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_code(&LockError::Internal("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_code(&LockError::ShuttingDown), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_dispatch_session_lifecycle() {
        let broker = create_test_broker();

        let session = dispatch(&broker, &call(RpcMethod::StartSession, vec![])).await.unwrap();
        let session_id = session.as_str().unwrap().to_string();
        assert_eq!(session_id.len(), 7);

        let lockdict = json!({"node": ["123", "456"]});
        dispatch(&broker, &call(RpcMethod::AcquireLocks, vec![session.clone(), lockdict.clone()]))
            .await
            .unwrap();

        let status = broker.status().await.unwrap();
        assert_eq!(
            status.lock(LockKind::Node, "456").unwrap().holder.as_deref(),
            Some(session_id.as_str())
        );

        dispatch(&broker, &call(RpcMethod::ReleaseLocks, vec![session.clone(), lockdict]))
            .await
            .unwrap();
        dispatch(&broker, &call(RpcMethod::EndSession, vec![session])).await.unwrap();

        assert!(broker.status().await.unwrap().sessions.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_bad_arguments() {
        let broker = create_test_broker();

        let err = dispatch(&broker, &call(RpcMethod::EndSession, vec![json!(1234567)]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid session id"));

        let session = dispatch(&broker, &call(RpcMethod::StartSession, vec![])).await.unwrap();
        let err = dispatch(&broker, &call(RpcMethod::AcquireLocks, vec![session, json!({})]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least one lock kind"));
        assert!(!broker.has_failed());
    }

    #[tokio::test]
    async fn test_status_is_serializable() {
        let broker = create_test_broker();
        let session = dispatch(&broker, &call(RpcMethod::StartSession, vec![])).await.unwrap();
        dispatch(
            &broker,
            &call(RpcMethod::AcquireLocks, vec![session.clone(), json!({"user": ["bob"]})]),
        )
        .await
        .unwrap();

        let status = dispatch(&broker, &call(RpcMethod::GetStatus, vec![])).await.unwrap();
        assert_eq!(status["locks"]["user"]["bob"]["holder"], session);
        assert_eq!(status["sessions"][session.as_str().unwrap()]["gate_open"], true);
        assert!(status["locks"]["node"].as_object().unwrap().is_empty());
    }

    async fn post_rpc(base: &str, body: Value) -> (StatusCode, Value) {
        let resp = reqwest::Client::new()
            .post(format!("{base}/rpc"))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.json().await.unwrap())
    }

    /// Hold `bob` and plant a queued session that does not exist.
    async fn corrupt_bob(broker: &LockBroker, base: &str) -> String {
        let client = LockClient::connect(base).await.unwrap();
        client.lock_user("bob").await.unwrap();
        broker
            .with_state_unchecked(|state| {
                state.enqueue_unchecked(LockKey::new(LockKind::User, "bob"), "1")
            })
            .await;
        client.session_id().to_string()
    }

    #[tokio::test]
    async fn test_internal_error_answers_500_then_503() {
        let broker = create_test_broker();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = router(broker.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let session_id = corrupt_bob(&broker, &base).await;

        let (status, body) = post_rpc(
            &base,
            json!({"method": "ReleaseLocks", "params": [session_id, {"user": ["bob"]}]}),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["fault"]["code"], "E900");
        assert!(broker.has_failed());

        let (status, body) = post_rpc(&base, json!({"method": "StartSession", "params": []})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["fault"]["code"], "E901");

        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn test_server_stops_after_internal_error() {
        let sink = MemoryAlertSink::new();
        let server = LockServer::with_alerts(&MonitorConfig::default(), Arc::new(sink.clone()));
        let broker = server.broker().clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let running = tokio::spawn(server.run(listener));

        let session_id = corrupt_bob(&broker, &base).await;
        let (status, _) = post_rpc(
            &base,
            json!({"method": "ReleaseLocks", "params": [session_id, {"user": ["bob"]}]}),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let stopped = tokio::time::timeout(Duration::from_secs(5), running).await;
        assert!(stopped.unwrap().unwrap().is_ok());
        assert!(broker.has_failed());

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::InternalError);
        assert!(alerts[0].message.contains("ReleaseLocks"));
    }
}
