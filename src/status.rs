//! Status reports: value snapshots of task state for external observers.

use crate::{Path, TaskState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One task's state as seen from outside. Reports are plain values; they
/// never alias the orchestrator's mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub index: u32,
    pub name: String,
    pub dependencies: Vec<u32>,
    pub state: TaskState,
    pub destination: Option<Path>,
    pub result: Option<Value>,
}

/// Answer to a `status()` request: one report per task, in index order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub reports: Vec<Report>,
}

impl StatusResponse {
    pub fn report(&self, index: u32) -> Option<&Report> {
        self.reports.get(index as usize)
    }

    pub fn finished_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.state, TaskState::Finished(_)))
            .count()
    }

    pub fn aborted_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.state, TaskState::Aborted(_) | TaskState::TimedOut))
            .count()
    }
}
