//! Request sanitizing and lock policy enforcement
//!
//! Everything in here runs before the lock table is touched, so a rejected
//! request never leaves partial state behind.
//!
//! The policy exists to keep sessions from deadlocking each other:
//! - one lock kind per acquire call
//! - no additional locks of a kind the session already holds
//! - no user locks while holding node locks (user locks come first)
//! - one outstanding acquire call per session

use super::state::SessionRecord;
use super::types::{LockDict, LockError, LockKind, LockResult};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

impl LockDict {
    /// Validate an untrusted lockdict.
    ///
    /// The value must be a non-empty object whose keys are lock kinds and whose
    /// values are non-empty lists of unique, non-empty strings.
    pub fn from_value(value: &Value) -> LockResult<Self> {
        let Some(object) = value.as_object() else {
            return Err(LockError::invalid(
                "Invalid lockdict (lockdict must be an object).",
            ));
        };

        if object.is_empty() {
            return Err(LockError::invalid(
                "Invalid lockdict (must specify at least one lock kind).",
            ));
        }

        let mut map = BTreeMap::new();
        for (kind_name, names) in object {
            let Some(names) = names.as_array() else {
                return Err(LockError::invalid(
                    "Invalid lockdict (each key's value must be a list of lock names).",
                ));
            };

            let Some(kind) = LockKind::parse(kind_name) else {
                return Err(LockError::invalid(format!(
                    "Invalid lockdict (lock kind '{}' does not exist).",
                    kind_name
                )));
            };

            if names.is_empty() {
                return Err(LockError::invalid(format!(
                    "Invalid lockdict (no lock names specified for lock kind '{}').",
                    kind
                )));
            }

            let mut seen = HashSet::new();
            let mut parsed = Vec::with_capacity(names.len());
            for name in names {
                let Some(name) = name.as_str() else {
                    return Err(LockError::invalid(
                        "Invalid lockdict (all items in a list of lock names must be strings).",
                    ));
                };
                if name.is_empty() {
                    return Err(LockError::invalid(
                        "Invalid lockdict (lock names cannot be empty strings).",
                    ));
                }
                if !seen.insert(name) {
                    return Err(LockError::invalid(
                        "Invalid lockdict (all items in a list of lock names must be unique in that list).",
                    ));
                }
                parsed.push(name.to_string());
            }

            map.insert(kind, parsed);
        }

        Ok(LockDict::from_map(map))
    }
}

/// Validate an untrusted session id argument.
pub fn parse_session_id(value: &Value) -> LockResult<String> {
    match value.as_str() {
        Some(session_id) => Ok(session_id.to_string()),
        None => Err(LockError::invalid(format!(
            "Invalid session id (must be a string). You provided {}",
            value
        ))),
    }
}

/// Check an acquire request against the session's current state.
pub(crate) fn check_acquire(
    session_id: &str,
    session: &SessionRecord,
    request: &LockDict,
) -> LockResult<()> {
    if session.acquire_in_progress {
        return Err(policy_error(
            session_id,
            session,
            request,
            "AcquireLocks called while an earlier AcquireLocks call has not been completed.",
        ));
    }

    let kinds: Vec<LockKind> = request.kinds().collect();
    if kinds.len() != 1 {
        return Err(policy_error(
            session_id,
            session,
            request,
            "Requested acquisition of locks of multiple kinds (you can only request locks of a single kind at a time).",
        ));
    }
    let kind = kinds[0];

    if !session.held.of(kind).is_empty() {
        return Err(policy_error(
            session_id,
            session,
            request,
            &format!(
                "Requested acquisition of locks of same kind ('{}') as those already held by this session.",
                kind
            ),
        ));
    }

    if kind == LockKind::User && !session.held.node.is_empty() {
        return Err(policy_error(
            session_id,
            session,
            request,
            "Requested acquisition of user lock when node locks already held by this session.",
        ));
    }

    Ok(())
}

/// Check that every lock in a release request is held by the session.
pub(crate) fn check_release(
    session_id: &str,
    session: &SessionRecord,
    request: &LockDict,
) -> LockResult<()> {
    for (kind, name) in request.iter() {
        if !session.held.contains(kind, name) {
            return Err(policy_error(
                session_id,
                session,
                request,
                "Attempted to release locks not held by this session.",
            ));
        }
    }

    // Releasing user locks while still holding node locks is allowed; it does
    // not create a cycle.
    Ok(())
}

fn policy_error(
    session_id: &str,
    session: &SessionRecord,
    request: &LockDict,
    message: &str,
) -> LockError {
    LockError::invalid(format!(
        "Illegal request: {} [Session id: {}. Locks in request: {}. Held locks: {}. Pending locks: {}.]",
        message, session_id, request, session.held, session.needed
    ))
}
