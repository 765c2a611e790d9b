//! Lock table, session registry and acquisition timeline
//!
//! `BrokerState` is plain data. It never blocks and never locks anything
//! itself; [`LockBroker`](super::manager::LockBroker) keeps it behind a single
//! mutex and every mutating method here takes `&mut self`, so holding the
//! guard is the only way to reach them.

use super::types::{
    BrokerStatus, LockDict, LockError, LockKey, LockKind, LockRecordStatus, LockResult,
    LockSet, LockTimeEntry, SessionId, SessionStatus,
};
use super::validation::{check_acquire, check_release};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

/// Smallest session id handed out.
pub const MIN_SESSION_ID: u32 = 1_000_000;

/// Largest session id handed out.
pub const MAX_SESSION_ID: u32 = 9_999_999;

/// Per-session bookkeeping.
#[derive(Debug)]
pub(crate) struct SessionRecord {
    pub(crate) held: LockSet,
    pub(crate) needed: LockSet,
    pub(crate) acquire_in_progress: bool,
    pub(crate) gate_open: bool,
    gate: Option<oneshot::Sender<()>>,
}

impl SessionRecord {
    pub(crate) fn new() -> Self {
        Self {
            held: LockSet::default(),
            needed: LockSet::default(),
            acquire_in_progress: false,
            gate_open: true,
            gate: None,
        }
    }

    fn open_gate(&mut self) {
        self.gate_open = true;
        if let Some(gate) = self.gate.take() {
            // The waiter may already be gone (unit tests drop it); the grant
            // itself is recorded in the table either way.
            if gate.send(()).is_err() {
                debug!("Gate opened with no waiter attached");
            }
        }
    }

    fn close_gate(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.gate_open = false;
        self.gate = Some(tx);
        rx
    }
}

#[derive(Debug, Default)]
struct LockRecord {
    holder: Option<SessionId>,
    queue: VecDeque<SessionId>,
}

#[derive(Debug, Clone)]
struct TimelineEntry {
    key: LockKey,
    acquired_at: DateTime<Utc>,
    held_since: Instant,
}

/// The longest-held lock, as seen by the stale lock monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub key: LockKey,
    pub acquired_at: DateTime<Utc>,
    pub held_since: Instant,
}

/// Result of registering an acquire request.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// Every requested lock was granted immediately.
    Granted,
    /// At least one lock is held elsewhere; the receiver fires once the
    /// session has been promoted for all of them.
    Queued(oneshot::Receiver<()>),
}

/// All shared broker state.
#[derive(Debug, Default)]
pub struct BrokerState {
    sessions: HashMap<SessionId, SessionRecord>,
    locks: BTreeMap<LockKey, LockRecord>,
    timeline: VecDeque<TimelineEntry>,
}

impl BrokerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Create a session with a fresh random id.
    pub fn start_session(&mut self) -> SessionId {
        let mut rng = rand::thread_rng();
        let session_id = loop {
            let candidate = rng.gen_range(MIN_SESSION_ID..=MAX_SESSION_ID).to_string();
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        self.sessions
            .insert(session_id.clone(), SessionRecord::new());
        session_id
    }

    /// Remove a session that holds and awaits nothing.
    pub fn end_session(&mut self, session_id: &str) -> LockResult<()> {
        let session = self.session(session_id)?;

        if !session.held.is_empty() {
            return Err(LockError::invalid(
                "Cannot end session: this session still holds locks.",
            ));
        }
        if !session.needed.is_empty() {
            return Err(LockError::invalid(
                "Cannot end session: this session has pending queued lock requests.",
            ));
        }

        self.sessions.remove(session_id);
        Ok(())
    }

    /// Grant or enqueue every lock in `request` for the session.
    ///
    /// The request is validated against the policy first; on rejection the
    /// state is left untouched.
    pub fn acquire_locks(
        &mut self,
        session_id: &str,
        request: &LockDict,
    ) -> LockResult<AcquireOutcome> {
        check_acquire(session_id, self.session(session_id)?, request)?;

        for (kind, name) in request.iter() {
            self.acquire_one(session_id, kind, name)?;
        }

        let session = self.session_mut(session_id)?;
        if session.needed.is_empty() {
            session.open_gate();
            Ok(AcquireOutcome::Granted)
        } else {
            session.acquire_in_progress = true;
            Ok(AcquireOutcome::Queued(session.close_gate()))
        }
    }

    fn acquire_one(&mut self, session_id: &str, kind: LockKind, name: &str) -> LockResult<()> {
        let key = LockKey::new(kind, name);
        let record = self.locks.entry(key.clone()).or_default();

        if record.holder.is_none() {
            record.holder = Some(session_id.to_string());
            self.session_mut(session_id)?
                .held
                .of_mut(kind)
                .insert(name.to_string());
            self.push_timeline(key);
        } else {
            record.queue.push_back(session_id.to_string());
            self.session_mut(session_id)?
                .needed
                .of_mut(kind)
                .insert(name.to_string());
        }

        Ok(())
    }

    /// Release every lock in `request` and hand each one to the next waiter.
    pub fn release_locks(&mut self, session_id: &str, request: &LockDict) -> LockResult<()> {
        check_release(session_id, self.session(session_id)?, request)?;

        for (kind, name) in request.iter() {
            self.release_one(session_id, kind, name)?;
        }

        Ok(())
    }

    fn release_one(&mut self, session_id: &str, kind: LockKind, name: &str) -> LockResult<()> {
        let key = LockKey::new(kind, name);

        self.session_mut(session_id)?.held.of_mut(kind).remove(name);
        self.pop_timeline(&key);

        let record = self
            .locks
            .get_mut(&key)
            .ok_or_else(|| LockError::internal(format!("no lock record for held lock {}", key)))?;

        if record.holder.as_deref() != Some(session_id) {
            return Err(LockError::internal(format!(
                "session {} released {} but the lock table names {:?} as holder",
                session_id, key, record.holder
            )));
        }

        match record.queue.pop_front() {
            Some(next) => {
                record.holder = Some(next.clone());

                let promoted = self.sessions.get_mut(&next).ok_or_else(|| {
                    LockError::internal(format!("queued session {} for {} does not exist", next, key))
                })?;
                if !promoted.needed.of_mut(kind).remove(name) {
                    return Err(LockError::internal(format!(
                        "promoted session {} was not waiting for {}",
                        next, key
                    )));
                }
                promoted.held.of_mut(kind).insert(name.to_string());
                if promoted.needed.is_empty() {
                    promoted.open_gate();
                }

                debug!(lock = %key, session_id = %next, "Lock handed to next queued session");
                self.push_timeline(key);
            }
            None => {
                record.holder = None;
            }
        }

        Ok(())
    }

    /// Clear the in-progress flag once a blocked acquire has been woken.
    pub fn finish_acquire(&mut self, session_id: &str) -> LockResult<()> {
        let session = self.sessions.get_mut(session_id).ok_or_else(|| {
            LockError::internal(format!(
                "session {} vanished while its acquire was in progress",
                session_id
            ))
        })?;
        session.acquire_in_progress = false;
        Ok(())
    }

    /// The longest-held lock, if any lock is held.
    pub fn oldest_held_lock(&self) -> Option<HeldLock> {
        self.timeline.front().map(|entry| HeldLock {
            key: entry.key.clone(),
            acquired_at: entry.acquired_at,
            held_since: entry.held_since,
        })
    }

    /// Read-only snapshot of every lock, session and held-lock time.
    pub fn status(&self) -> BrokerStatus {
        let mut locks: BTreeMap<LockKind, BTreeMap<String, LockRecordStatus>> = LockKind::ALL
            .iter()
            .map(|kind| (*kind, BTreeMap::new()))
            .collect();

        for (key, record) in &self.locks {
            locks.entry(key.kind).or_default().insert(
                key.name.clone(),
                LockRecordStatus {
                    holder: record.holder.clone(),
                    queue: record.queue.iter().cloned().collect(),
                },
            );
        }

        let sessions = self
            .sessions
            .iter()
            .map(|(id, session)| {
                (
                    id.clone(),
                    SessionStatus {
                        held_locks: session.held.clone(),
                        needed_locks: session.needed.clone(),
                        gate_open: session.gate_open,
                    },
                )
            })
            .collect();

        let lock_times = self
            .timeline
            .iter()
            .map(|entry| LockTimeEntry {
                kind: entry.key.kind,
                name: entry.key.name.clone(),
                acquired_at: entry.acquired_at,
            })
            .collect();

        BrokerStatus {
            locks,
            sessions,
            lock_times,
        }
    }

    /// Cross-check the whole lock table, the session registry and the timeline.
    ///
    /// Linear in the number of lock records ever referenced. Any mismatch
    /// means mutual exclusion can no longer be trusted.
    pub fn verify(&self) -> LockResult<()> {
        let mut timeline_counts: HashMap<&LockKey, usize> = HashMap::new();
        for entry in &self.timeline {
            *timeline_counts.entry(&entry.key).or_default() += 1;
        }

        let mut held_count = 0;
        let mut needed_count = 0;
        for (key, record) in &self.locks {
            self.verify_record(key, record, timeline_counts.get(key).copied().unwrap_or(0))?;
            held_count += usize::from(record.holder.is_some());
            needed_count += record.queue.len();
        }

        let session_held: usize = self.sessions.values().map(|s| s.held.len()).sum();
        let session_needed: usize = self.sessions.values().map(|s| s.needed.len()).sum();
        if session_held != held_count || session_needed != needed_count {
            return Err(LockError::internal(format!(
                "session registry tracks {} held / {} needed locks, lock table has {} / {}",
                session_held, session_needed, held_count, needed_count
            )));
        }
        if self.timeline.len() != held_count {
            return Err(LockError::internal(format!(
                "timeline has {} entries for {} held locks",
                self.timeline.len(),
                held_count
            )));
        }

        Ok(())
    }

    /// Check the locks named in `request` and the session that made it.
    ///
    /// Runs after every acquire and release, so it only looks at what the
    /// request could have changed. Debug builds also run [`verify`](Self::verify).
    pub fn verify_request(&self, session_id: &str, request: &LockDict) -> LockResult<()> {
        let touched: BTreeSet<LockKey> = request
            .iter()
            .map(|(kind, name)| LockKey::new(kind, name))
            .collect();

        let mut timeline_counts: HashMap<&LockKey, usize> = HashMap::new();
        for entry in self.timeline.iter().filter(|entry| touched.contains(&entry.key)) {
            *timeline_counts.entry(&entry.key).or_default() += 1;
        }

        for key in &touched {
            let record = self.locks.get(key).ok_or_else(|| {
                LockError::internal(format!("no lock record for requested lock {}", key))
            })?;
            self.verify_record(key, record, timeline_counts.get(key).copied().unwrap_or(0))?;
        }

        let session = self.sessions.get(session_id).ok_or_else(|| {
            LockError::internal(format!("session {} vanished during its own request", session_id))
        })?;
        self.verify_session(session_id, session)?;

        self.debug_verify()
    }

    /// Full [`verify`](Self::verify) in debug builds only.
    pub fn debug_verify(&self) -> LockResult<()> {
        if cfg!(debug_assertions) {
            self.verify()
        } else {
            Ok(())
        }
    }

    fn verify_record(&self, key: &LockKey, record: &LockRecord, timeline_count: usize) -> LockResult<()> {
        match &record.holder {
            Some(holder) => {
                let session = self.sessions.get(holder).ok_or_else(|| {
                    LockError::internal(format!("{} is held by unknown session {}", key, holder))
                })?;
                if !session.held.contains(key.kind, &key.name) {
                    return Err(LockError::internal(format!(
                        "{} is held by {} but missing from its held locks",
                        key, holder
                    )));
                }
                if timeline_count != 1 {
                    return Err(LockError::internal(format!(
                        "{} is held but tracked {} times in the timeline",
                        key, timeline_count
                    )));
                }
            }
            None => {
                if !record.queue.is_empty() {
                    return Err(LockError::internal(format!("{} has waiters but no holder", key)));
                }
                if timeline_count != 0 {
                    return Err(LockError::internal(format!(
                        "{} is not held but still in the timeline",
                        key
                    )));
                }
            }
        }

        let mut seen = HashSet::with_capacity(record.queue.len());
        for waiter in &record.queue {
            if record.holder.as_ref() == Some(waiter) || !seen.insert(waiter) {
                return Err(LockError::internal(format!(
                    "session {} appears more than once on {}",
                    waiter, key
                )));
            }
            let session = self.sessions.get(waiter).ok_or_else(|| {
                LockError::internal(format!("{} is awaited by unknown session {}", key, waiter))
            })?;
            if !session.needed.contains(key.kind, &key.name) {
                return Err(LockError::internal(format!(
                    "session {} is queued on {} but does not need it",
                    waiter, key
                )));
            }
        }

        Ok(())
    }

    fn verify_session(&self, session_id: &str, session: &SessionRecord) -> LockResult<()> {
        for kind in LockKind::ALL {
            for name in session.held.of(kind) {
                let key = LockKey::new(kind, name.as_str());
                let holder = self.locks.get(&key).and_then(|record| record.holder.as_deref());
                if holder != Some(session_id) {
                    return Err(LockError::internal(format!(
                        "session {} believes it holds {} but the lock table names {:?}",
                        session_id, key, holder
                    )));
                }
            }
            for name in session.needed.of(kind) {
                let key = LockKey::new(kind, name.as_str());
                let queued = self
                    .locks
                    .get(&key)
                    .map(|record| record.queue.iter().any(|waiter| waiter == session_id))
                    .unwrap_or(false);
                if !queued {
                    return Err(LockError::internal(format!(
                        "session {} needs {} but is not queued for it",
                        session_id, key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Append a session to a lock queue without any bookkeeping.
    #[cfg(test)]
    pub(crate) fn enqueue_unchecked(&mut self, key: LockKey, session_id: &str) {
        self.locks
            .entry(key)
            .or_default()
            .queue
            .push_back(session_id.to_string());
    }

    fn session(&self, session_id: &str) -> LockResult<&SessionRecord> {
        self.sessions.get(session_id).ok_or_else(|| {
            LockError::invalid("Invalid session id (the specified session id doesn't exist).")
        })
    }

    fn session_mut(&mut self, session_id: &str) -> LockResult<&mut SessionRecord> {
        self.sessions.get_mut(session_id).ok_or_else(|| {
            LockError::invalid("Invalid session id (the specified session id doesn't exist).")
        })
    }

    fn push_timeline(&mut self, key: LockKey) {
        self.timeline.push_back(TimelineEntry {
            key,
            acquired_at: Utc::now(),
            held_since: Instant::now(),
        });
    }

    fn pop_timeline(&mut self, key: &LockKey) {
        if let Some(position) = self.timeline.iter().position(|entry| &entry.key == key) {
            if let Some(entry) = self.timeline.remove(position) {
                info!(
                    lock = %key,
                    held_ms = entry.held_since.elapsed().as_millis() as u64,
                    "Lock released"
                );
            }
        }
    }
}
