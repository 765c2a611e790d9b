//! Client for a running lockbroker
//!
//! A [`LockClient`] owns one broker session. Typical use:
//!
//! ```ignore
//! let client = LockClient::connect("http://127.0.0.1:8010").await?;
//! client.lock_user("bob").await?;
//! client.lock_nodes(["123", "456"]).await?;
//! // ...
//! client.unlock_nodes(["123", "456"]).await?;
//! client.unlock_user("bob").await?;
//! client.end_session().await?;
//! ```

use crate::domain::locking::{BrokerStatus, LockDict, SessionId};
use crate::error::{Error, Result};
use crate::rpc::{RPC_PATH, RpcMethod, RpcReply, RpcRequest};
use serde_json::Value;
use tracing::debug;

pub use crate::rpc::DEFAULT_URL;

/// Raw RPC access to a broker, without a session
#[derive(Debug, Clone)]
struct RpcConnection {
    http: reqwest::Client,
    endpoint: String,
}

impl RpcConnection {
    fn new(url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}{}", url.trim_end_matches('/'), RPC_PATH),
        }
    }

    async fn call(&self, method: RpcMethod, params: Vec<Value>) -> Result<Value> {
        debug!(%method, endpoint = %self.endpoint, "Calling lockbroker");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&RpcRequest::new(method, params))
            .send()
            .await?;

        let status = response.status();
        let reply: RpcReply = response.json().await.map_err(|e| {
            Error::Protocol(format!("{} returned HTTP {} without an RPC reply: {}", method, status, e))
        })?;

        match reply {
            RpcReply { fault: Some(fault), .. } => Err(Error::Rejected {
                code: fault.code,
                message: fault.message,
            }),
            RpcReply { result: Some(result), .. } => Ok(result),
            RpcReply { .. } => Err(Error::Protocol(format!("{} returned an empty reply", method))),
        }
    }
}

/// A session on a lockbroker
#[derive(Debug)]
pub struct LockClient {
    connection: RpcConnection,
    session_id: SessionId,
}

impl LockClient {
    /// Start a new session on the broker at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = RpcConnection::new(url);
        let result = connection.call(RpcMethod::StartSession, vec![]).await?;

        let session_id = match result {
            Value::String(session_id) => session_id,
            other => {
                return Err(Error::Protocol(format!(
                    "StartSession returned a non-string session id: {}",
                    other
                )));
            }
        };

        debug!(session_id = %session_id, "Lockbroker session started");
        Ok(Self {
            connection,
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Acquire every lock in `locks`, waiting as long as it takes.
    pub async fn acquire(&self, locks: &LockDict) -> Result<()> {
        self.session_call(RpcMethod::AcquireLocks, locks).await
    }

    /// Release every lock in `locks`.
    pub async fn release(&self, locks: &LockDict) -> Result<()> {
        self.session_call(RpcMethod::ReleaseLocks, locks).await
    }

    pub async fn lock_user(&self, user: &str) -> Result<()> {
        self.acquire(&LockDict::users([user])).await
    }

    pub async fn lock_users<I, S>(&self, users: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acquire(&LockDict::users(users)).await
    }

    pub async fn lock_node(&self, node: &str) -> Result<()> {
        self.acquire(&LockDict::nodes([node])).await
    }

    pub async fn lock_nodes<I, S>(&self, nodes: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acquire(&LockDict::nodes(nodes)).await
    }

    pub async fn unlock_user(&self, user: &str) -> Result<()> {
        self.release(&LockDict::users([user])).await
    }

    pub async fn unlock_users<I, S>(&self, users: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.release(&LockDict::users(users)).await
    }

    pub async fn unlock_node(&self, node: &str) -> Result<()> {
        self.release(&LockDict::nodes([node])).await
    }

    pub async fn unlock_nodes<I, S>(&self, nodes: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.release(&LockDict::nodes(nodes)).await
    }

    /// Snapshot of the broker this session lives on.
    pub async fn status(&self) -> Result<BrokerStatus> {
        fetch_status(&self.connection).await
    }

    /// End the session. It must not hold or wait for any lock.
    pub async fn end_session(self) -> Result<()> {
        self.connection
            .call(RpcMethod::EndSession, vec![Value::String(self.session_id.clone())])
            .await?;
        debug!(session_id = %self.session_id, "Lockbroker session ended");
        Ok(())
    }

    async fn session_call(&self, method: RpcMethod, locks: &LockDict) -> Result<()> {
        let lockdict = serde_json::to_value(locks)
            .map_err(|e| Error::Protocol(format!("Failed to encode lockdict: {}", e)))?;
        self.connection
            .call(method, vec![Value::String(self.session_id.clone()), lockdict])
            .await?;
        Ok(())
    }
}

/// Fetch a status snapshot without starting a session.
pub async fn get_status(url: &str) -> Result<BrokerStatus> {
    fetch_status(&RpcConnection::new(url)).await
}

async fn fetch_status(connection: &RpcConnection) -> Result<BrokerStatus> {
    let result = connection.call(RpcMethod::GetStatus, vec![]).await?;
    serde_json::from_value(result).map_err(|e| Error::Protocol(format!("Malformed status: {}", e)))
}
