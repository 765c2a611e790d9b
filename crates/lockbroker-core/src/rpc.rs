//! RPC wire format shared by the server and the client
//!
//! Every call is a `POST /rpc` with a JSON body
//! `{"method": "AcquireLocks", "params": ["1234567", {"user": ["bob"]}]}`.
//! Parameters are positional. A successful call answers
//! `{"result": ...}`; a failed one answers `{"fault": {"code": ..., "message": ...}}`.

use crate::domain::locking::LockError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Path of the RPC endpoint
pub const RPC_PATH: &str = "/rpc";

/// Default URL clients connect to
pub const DEFAULT_URL: &str = "http://127.0.0.1:8010";

/// Operations exposed by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    StartSession,
    EndSession,
    AcquireLocks,
    ReleaseLocks,
    GetStatus,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 5] = [
        RpcMethod::StartSession,
        RpcMethod::EndSession,
        RpcMethod::AcquireLocks,
        RpcMethod::ReleaseLocks,
        RpcMethod::GetStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartSession => "StartSession",
            Self::EndSession => "EndSession",
            Self::AcquireLocks => "AcquireLocks",
            Self::ReleaseLocks => "ReleaseLocks",
            Self::GetStatus => "GetStatus",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.as_str() == name)
    }

    /// Number of positional parameters the method takes
    pub fn arity(&self) -> usize {
        match self {
            Self::StartSession | Self::GetStatus => 0,
            Self::EndSession => 1,
            Self::AcquireLocks | Self::ReleaseLocks => 2,
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A call from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: RpcMethod, params: Vec<Value>) -> Self {
        Self {
            method: method.as_str().to_string(),
            params,
        }
    }

    /// Resolve the method and check the number of parameters.
    pub fn method(&self) -> Result<RpcMethod, LockError> {
        let method = RpcMethod::parse(&self.method).ok_or_else(|| {
            LockError::InvalidRequest(format!(
                "The requested method '{}' doesn't exist.",
                self.method
            ))
        })?;

        if self.params.len() != method.arity() {
            return Err(LockError::InvalidRequest(format!(
                "Invalid number of arguments to function {}. Expected {}, received {}.",
                method,
                method.arity(),
                self.params.len()
            )));
        }

        Ok(method)
    }
}

/// Error details returned to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub code: String,
    pub message: String,
}

impl From<&LockError> for RpcFault {
    fn from(error: &LockError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Response to a call: exactly one of `result` or `fault` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<RpcFault>,
}

impl RpcReply {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            fault: None,
        }
    }

    pub fn failure(fault: RpcFault) -> Self {
        Self {
            result: None,
            fault: Some(fault),
        }
    }
}
