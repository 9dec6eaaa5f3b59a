//! One task's definition and lifecycle state.
//!
//! A task is one request/reply exchange: on start it computes its request
//! body from the assigned correlation id and hands it to the delivery
//! journal; a matched reply (or the timeout sentinel) runs the behavior,
//! which decides `Finish`, `Abort` or `Ignore`. There is no suspension:
//! the waiting task *is* the stored continuation, resumed by dispatch.

use crate::{AbortCause, Path, Reply, TaskAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Computes the outbound request body from the wire correlation id.
pub type MessageFactory = Box<dyn Fn(u64) -> Value + Send + Sync + 'static>;

/// User-supplied reply handler. Behaviors must be pure with respect to the
/// reply: replay re-runs them against journaled replies and expects the
/// same decision.
pub type Behavior = Box<dyn Fn(&Reply) -> TaskAction + Send + Sync + 'static>;

/// Lifecycle of a task. `Finished`, `Aborted` and `TimedOut` are terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskState {
    Unstarted,
    Waiting,
    Finished(Value),
    Aborted(AbortCause),
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished(_) | TaskState::Aborted(_) | TaskState::TimedOut
        )
    }
}

/// A unit of work in the graph. Index is the position in the orchestrator
/// builder's task vector; dependencies refer to those indices and must all
/// be `Finished` before this task starts.
pub struct Task {
    pub(crate) name: String,
    pub(crate) destination: Path,
    pub(crate) dependencies: BTreeSet<u32>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) message: MessageFactory,
    pub(crate) behavior: Behavior,
    /// Set when construction of a composite failed; the task aborts with
    /// this cause at start instead of sending anything.
    pub(crate) poison: Option<AbortCause>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        destination: impl Into<Path>,
        message: impl Fn(u64) -> Value + Send + Sync + 'static,
        behavior: impl Fn(&Reply) -> TaskAction + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            dependencies: BTreeSet::new(),
            timeout: None,
            message: Box::new(message),
            behavior: Box::new(behavior),
            poison: None,
        }
    }

    /// Require the given task indices to be finished before this task starts.
    pub fn after<I: IntoIterator<Item = u32>>(mut self, dependencies: I) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    /// Arm a one-shot timeout when the task starts waiting. Without this
    /// the task waits indefinitely.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn poisoned(name: impl Into<String>, destination: impl Into<Path>, cause: AbortCause) -> Self {
        let mut task = Task::new(name, destination, |_| Value::Null, |_| TaskAction::Ignore);
        task.poison = Some(cause);
        task
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn dependencies(&self) -> impl Iterator<Item = u32> + '_ {
        self.dependencies.iter().copied()
    }

    pub(crate) fn request_body(&self, correlation_id: u64) -> Value {
        (self.message)(correlation_id)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("destination", &self.destination)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("poison", &self.poison)
            .finish_non_exhaustive()
    }
}
