// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recording and replaying external reads.
//!
//! A recorded session appends one event when a load is issued and one when
//! its result is written. Replaying the log against a fresh document
//! reproduces the same snapshots in the same order without calling any
//! loader.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use understory_converge::{LoadRequest, SourceSettlement, SourceStatus};

/// Whether a document records, replays or does neither.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Loaders run; nothing is logged.
    #[default]
    Live,
    /// Loaders run; every external read is logged.
    Record,
    /// The log stands in for every loader.
    Replay,
}

/// Event tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplayTag {
    /// A resource snapshot transition.
    ExternalRead,
}

/// Snapshot transition of an external read.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    /// The load was issued.
    Loading,
    /// The loader returned data.
    Success,
    /// The loader failed.
    Error,
}

/// One logged transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayLogEvent {
    /// Position in the log.
    pub seq: u64,
    /// Commit that produced the event.
    pub txn_seq: u64,
    /// Event tag.
    pub tag: ReplayTag,
    /// Resource id of the loader.
    pub resource_id: String,
    /// Declared path of the source field.
    pub field_path: String,
    /// Key hash of the request.
    pub key_hash: String,
    /// Transition.
    pub phase: ReplayPhase,
    /// Data or error of a settled phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ReplayLogEvent {
    fn describe(&self) -> String {
        format!(
            "{}@{} {:?} {}",
            self.resource_id, self.field_path, self.phase, self.key_hash
        )
    }

    fn settles(&self, request: &LoadRequest) -> bool {
        self.phase != ReplayPhase::Loading
            && self.resource_id == request.resource
            && self.field_path == request.field_path
            && self.key_hash == request.key_hash
    }
}

/// Replay drift.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// The log ended while a load still needed an event.
    #[error("replay log exhausted at event {cursor} while expecting {expected}")]
    Exhausted {
        /// Log position.
        cursor: usize,
        /// What was needed.
        expected: String,
    },
    /// The next event does not match what the program did.
    #[error("replay log mismatch at event {cursor}: expected {expected}, found {found}")]
    Mismatch {
        /// Log position.
        cursor: usize,
        /// What the program did.
        expected: String,
        /// What the log holds.
        found: String,
    },
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<ReplayLogEvent>,
    cursor: usize,
}

/// Shared, ordered log of external reads.
///
/// Clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct ReplayLog {
    inner: Arc<Mutex<LogState>>,
}

impl ReplayLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps recorded events for replay.
    #[must_use]
    pub fn from_events(events: Vec<ReplayLogEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogState { events, cursor: 0 })),
        }
    }

    /// Copies the events out.
    #[must_use]
    pub fn events(&self) -> Vec<ReplayLogEvent> {
        self.inner.lock().events.clone()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Returns `true` if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Replay position.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.inner.lock().cursor
    }

    /// Returns `true` once replay consumed every event.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        let state = self.inner.lock();
        state.cursor >= state.events.len()
    }

    pub(crate) fn rewind(&self, cursor: usize) {
        self.inner.lock().cursor = cursor;
    }

    /// Logs an issued load.
    pub fn record_loading(&self, txn_seq: u64, request: &LoadRequest) {
        self.push(
            txn_seq,
            &request.resource,
            &request.field_path,
            &request.key_hash,
            ReplayPhase::Loading,
            None,
        );
    }

    /// Logs a written load result for `request`.
    pub fn record_settled(&self, txn_seq: u64, request: &LoadRequest, settlement: &SourceSettlement) {
        let snapshot = &settlement.snapshot;
        let (phase, payload) = match snapshot.status {
            SourceStatus::Error => (ReplayPhase::Error, snapshot.error.clone()),
            _ => (ReplayPhase::Success, snapshot.data.clone()),
        };
        self.push(
            txn_seq,
            &request.resource,
            &request.field_path,
            &settlement.key_hash,
            phase,
            payload,
        );
    }

    fn push(
        &self,
        txn_seq: u64,
        resource_id: &str,
        field_path: &str,
        key_hash: &str,
        phase: ReplayPhase,
        payload: Option<Value>,
    ) {
        let mut state = self.inner.lock();
        let seq = state.events.len() as u64;
        tracing::trace!(seq, txn_seq, resource_id, field_path, ?phase, "external read recorded");
        state.events.push(ReplayLogEvent {
            seq,
            txn_seq,
            tag: ReplayTag::ExternalRead,
            resource_id: resource_id.to_owned(),
            field_path: field_path.to_owned(),
            key_hash: key_hash.to_owned(),
            phase,
            payload,
        });
    }

    /// Consumes the loading event of `request`.
    ///
    /// # Errors
    ///
    /// Fails if the log is exhausted or the next event is something else.
    pub fn consume_loading(&self, request: &LoadRequest) -> Result<(), ReplayError> {
        let mut state = self.inner.lock();
        let cursor = state.cursor;
        let expected = format!(
            "{}@{} Loading {}",
            request.resource, request.field_path, request.key_hash
        );
        let Some(event) = state.events.get(cursor) else {
            return Err(ReplayError::Exhausted { cursor, expected });
        };
        let matches = event.phase == ReplayPhase::Loading
            && event.resource_id == request.resource
            && event.field_path == request.field_path
            && event.key_hash == request.key_hash;
        if !matches {
            return Err(ReplayError::Mismatch {
                cursor,
                expected,
                found: event.describe(),
            });
        }
        state.cursor += 1;
        Ok(())
    }

    /// Consumes the settled events at the cursor, pairing each with the
    /// first matching outstanding request (which is removed).
    ///
    /// Stops at the next loading event or at the end of the log.
    ///
    /// # Errors
    ///
    /// Fails if a settled event matches no outstanding request.
    pub fn consume_settled(
        &self,
        outstanding: &mut Vec<LoadRequest>,
    ) -> Result<Vec<SourceSettlement>, ReplayError> {
        let mut state = self.inner.lock();
        let mut out = Vec::new();
        while let Some(event) = state.events.get(state.cursor) {
            if event.phase == ReplayPhase::Loading {
                break;
            }
            let Some(index) = outstanding.iter().position(|r| event.settles(r)) else {
                return Err(ReplayError::Mismatch {
                    cursor: state.cursor,
                    expected: "a settlement of an outstanding load".to_owned(),
                    found: event.describe(),
                });
            };
            let request = outstanding.remove(index);
            let payload = event.payload.clone().unwrap_or(Value::Null);
            let result = match event.phase {
                ReplayPhase::Error => Err(payload),
                _ => Ok(payload),
            };
            out.push(SourceSettlement::from_result(&request, result));
            state.cursor += 1;
        }
        Ok(out)
    }
}
