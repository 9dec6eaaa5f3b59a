//! Append-only event taxonomy and the serializable snapshot state.
//!
//! Exactly these events are persisted, in the order they occur:
//!
//! 1. `Started { id }` — at most one per orchestrator.
//! 2. `MessageSent { task }` — emitted when a task starts; replay re-runs
//!    the start against deterministic counters, so the event needs no ids.
//! 3. `MessageReceived { task, reply }` — emitted when a reply (or a
//!    handled timeout sentinel) is dispatched to a waiting task.
//! 4. `TaskTimedOut { task }` — the abort-on-timeout path, persisted when
//!    `Settings::persist_timeout_events` is on so recovery is independent
//!    of the clock.

use crate::delivery::DeliveryJournal;
use crate::ids::CorrelationMap;
use crate::{AbortCause, Outcome, Reply};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OrchestratorEvent {
    Started { id: u64 },
    MessageSent { task: u32 },
    MessageReceived { task: u32, reply: Reply },
    TaskTimedOut { task: u32 },
}

/// Per-task dynamic state as persisted in a snapshot. Waiting carries the
/// expected ids; everything else is carried by the state itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PersistedTaskState {
    Unstarted,
    Waiting { delivery_id: u64, correlation_id: u64 },
    Finished { value: Value },
    Aborted { cause: AbortCause },
    TimedOut,
}

/// The dynamic portion of orchestrator state `S`. Task definitions
/// (names, destinations, behaviors) are frozen at construction and not
/// part of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotState {
    pub start_id: Option<u64>,
    pub tasks: Vec<PersistedTaskState>,
    pub correlation: CorrelationMap,
    pub journal: DeliveryJournal,
    pub outcome: Option<Outcome>,
    /// A decision was made while tasks were still waiting and their
    /// cancellation had not finished persisting; recovery resumes it.
    pub pending_cancel: bool,
}

/// A snapshot plus the number of log events it covers. `EventStore::read`
/// returns only events appended after `covered_events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub covered_events: u64,
    pub state: SnapshotState,
}
