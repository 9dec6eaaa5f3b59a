//! Persistent task orchestrator.
//!
//! This crate executes a directed acyclic graph of dependent *tasks*. Each
//! task sends one request to a destination, waits for a correlated reply,
//! and either finishes with a typed result or aborts. Every decision is
//! appended to an event log so that after a crash the orchestrator replays
//! the log and resumes without re-sending confirmed requests, while the
//! at-least-once delivery journal re-issues anything still unconfirmed.
//!
//! It provides:
//!
//! - Public data model: [`Request`], [`Reply`], [`TaskAction`], [`AbortCause`]
//! - The orchestrator engine: [`OrchestratorBuilder`] / [`OrchestratorHandle`]
//! - The quorum composite task ([`MinimumVotes`]): N inner tasks against
//!   distinct destinations, decided by a vote threshold
//! - Pluggable persistence via [`providers::EventStore`] with in-memory and
//!   filesystem (JSONL) implementations

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub mod delivery;
pub mod events;
pub mod ids;
pub mod orchestrator;
pub mod providers;
pub mod quorum;
pub mod router;
pub mod status;
pub mod task;

pub use ids::CorrelationMode;
pub use orchestrator::hooks::{DefaultHooks, HookContext, OrchestratorHooks};
pub use orchestrator::{OrchestratorBuilder, OrchestratorHandle};
pub use quorum::MinimumVotes;
pub use router::{Envelope, Router};
pub use status::{Report, StatusResponse};
pub use task::{Task, TaskState};

/// Destination identity on the in-process message plane.
pub type Path = String;

/// Outbound request as it appears on the wire. The correlation id is the
/// only thing the orchestrator needs back to pair a reply with its task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub correlation_id: u64,
    pub body: Value,
}

/// Payload of a reply: either a destination's message or the synthetic
/// timeout sentinel delivered when a task's timer fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReplyPayload {
    Message(Value),
    Timeout,
}

/// Inbound reply correlated to a pending request. The sentinel has no
/// sender; replayed replies are matched without the sender check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub correlation_id: u64,
    pub sender: Option<Path>,
    pub payload: ReplyPayload,
}

impl Reply {
    pub fn message(correlation_id: u64, sender: impl Into<Path>, body: Value) -> Self {
        Self {
            correlation_id,
            sender: Some(sender.into()),
            payload: ReplyPayload::Message(body),
        }
    }

    pub(crate) fn timeout(correlation_id: u64) -> Self {
        Self {
            correlation_id,
            sender: None,
            payload: ReplyPayload::Timeout,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.payload, ReplyPayload::Timeout)
    }

    /// The message body, if this is not the timeout sentinel.
    pub fn body(&self) -> Option<&Value> {
        match &self.payload {
            ReplyPayload::Message(v) => Some(v),
            ReplyPayload::Timeout => None,
        }
    }
}

/// What a task behavior decided about an incoming reply. `Ignore` models
/// the partial-function miss: the reply did not match and is dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskAction {
    Finish(Value),
    Abort(AbortCause),
    Ignore,
}

/// Why a task (or a whole orchestrator) aborted. Causes are values carried
/// in events and reports, never panics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AbortCause {
    IllegalArgument(String),
    QuorumNotAchieved,
    QuorumImpossibleToAchieve,
    TimedOut,
    User(Value),
}

/// Commands understood over the wire (as request bodies). A composite task
/// starts its inner orchestrator by delivering one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WireCommand {
    StartOrchestrator { id: u64 },
}

/// Terminal result of an orchestrator. Also the wire body of the reply
/// sent to the parent, correlated by the start id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Outcome {
    Finished {
        value: Value,
    },
    Aborted {
        instigator: Report,
        cause: AbortCause,
        orchestrator_id: u64,
    },
}

impl Outcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted { .. })
    }
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Save a state snapshot roughly every this many persisted events.
    /// 0 disables automatic snapshots.
    pub save_snapshot_roughly_every_x_messages: u32,
    /// Persist a `TaskTimedOut` event on the abort-on-timeout path so that
    /// recovery does not depend on the clock. With this off, recovery
    /// re-arms full timeouts for tasks still waiting.
    pub persist_timeout_events: bool,
    /// How often unconfirmed deliveries are retransmitted.
    pub redeliver_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            save_snapshot_roughly_every_x_messages: 0,
            persist_timeout_events: true,
            redeliver_interval: Duration::from_millis(500),
        }
    }
}
