//! Lock types and error definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Opaque session token handed out by `StartSession`.
pub type SessionId = String;

/// Lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The caller used the broker incorrectly (bad lockdict, policy violation,
    /// unknown session, ...). The broker keeps serving.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Broker state is no longer trustworthy. The broker stops serving.
    #[error("Internal lock broker error: {0}")]
    Internal(String),

    /// The broker is shutting down and no longer accepts requests.
    #[error("Lock broker is shutting down")]
    ShuttingDown,
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "E100",
            Self::Internal(_) => "E900",
            Self::ShuttingDown => "E901",
        }
    }

    /// Whether the error was caused by the caller rather than the broker.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Kind of lock. User locks must be acquired before node locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    User,
    Node,
}

impl LockKind {
    /// Every lock kind, in acquisition order.
    pub const ALL: [LockKind; 2] = [LockKind::User, LockKind::Node];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Node => "node",
        }
    }

    /// Parse a wire-format kind name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "node" => Some(Self::Node),
            _ => None,
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a single lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub kind: LockKind,
    pub name: String,
}

impl LockKey {
    pub fn new(kind: LockKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Names of locks grouped by kind, used for a session's held and needed locks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSet {
    #[serde(default)]
    pub user: BTreeSet<String>,
    #[serde(default)]
    pub node: BTreeSet<String>,
}

impl LockSet {
    pub fn of(&self, kind: LockKind) -> &BTreeSet<String> {
        match kind {
            LockKind::User => &self.user,
            LockKind::Node => &self.node,
        }
    }

    pub fn of_mut(&mut self, kind: LockKind) -> &mut BTreeSet<String> {
        match kind {
            LockKind::User => &mut self.user,
            LockKind::Node => &mut self.node,
        }
    }

    pub fn contains(&self, kind: LockKind, name: &str) -> bool {
        self.of(kind).contains(name)
    }

    /// True when no names of either kind are present.
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.node.is_empty()
    }

    pub fn len(&self) -> usize {
        self.user.len() + self.node.len()
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{user: {:?}, node: {:?}}}", self.user, self.node)
    }
}

/// A validated lock request: for each kind, a non-empty list of unique,
/// non-empty names.
///
/// On the wire this is a JSON object such as `{"user": ["bob"]}` or
/// `{"node": ["123", "456"]}`. Use [`LockDict::from_value`] to validate
/// untrusted input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockDict(BTreeMap<LockKind, Vec<String>>);

impl LockDict {
    /// Request for a list of user locks.
    pub fn users<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with(LockKind::User, names)
    }

    /// Request for a list of node locks.
    pub fn nodes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with(LockKind::Node, names)
    }

    /// Add names of another kind (valid for release requests only).
    pub fn with<I, S>(mut self, kind: LockKind, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .entry(kind)
            .or_default()
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Kinds named in the request.
    pub fn kinds(&self) -> impl Iterator<Item = LockKind> + '_ {
        self.0.keys().copied()
    }

    /// Every (kind, name) pair in request order.
    pub fn iter(&self) -> impl Iterator<Item = (LockKind, &str)> + '_ {
        self.0
            .iter()
            .flat_map(|(kind, names)| names.iter().map(move |name| (*kind, name.as_str())))
    }

    pub fn names(&self, kind: LockKind) -> &[String] {
        self.0.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub(crate) fn from_map(map: BTreeMap<LockKind, Vec<String>>) -> Self {
        Self(map)
    }
}

impl fmt::Display for LockDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(kind, names)| format!("{}: {:?}", kind, names))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Status of a single lock record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecordStatus {
    /// Session currently holding the lock
    pub holder: Option<SessionId>,
    /// Sessions waiting for the lock, in grant order
    pub queue: Vec<SessionId>,
}

/// Status of a single session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub held_locks: LockSet,
    pub needed_locks: LockSet,
    /// False while an `AcquireLocks` call for this session is blocked
    pub gate_open: bool,
}

/// When a currently held lock was acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTimeEntry {
    pub kind: LockKind,
    pub name: String,
    pub acquired_at: DateTime<Utc>,
}

/// Snapshot returned by `GetStatus`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatus {
    /// Every lock record ever referenced, per kind
    pub locks: BTreeMap<LockKind, BTreeMap<String, LockRecordStatus>>,
    /// Every active session
    pub sessions: BTreeMap<SessionId, SessionStatus>,
    /// Held locks, longest-held first
    pub lock_times: Vec<LockTimeEntry>,
}

impl BrokerStatus {
    /// Look up a lock record.
    pub fn lock(&self, kind: LockKind, name: &str) -> Option<&LockRecordStatus> {
        self.locks.get(&kind).and_then(|records| records.get(name))
    }

    /// Look up a session.
    pub fn session(&self, session_id: &str) -> Option<&SessionStatus> {
        self.sessions.get(session_id)
    }
}
