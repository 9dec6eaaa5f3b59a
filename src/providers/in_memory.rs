//! In-memory event store for tests and single-process runs.

use super::EventStore;
use crate::events::{OrchestratorEvent, SnapshotRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct StoredLog {
    events: Vec<OrchestratorEvent>,
    snapshot: Option<SnapshotRecord>,
}

#[derive(Default)]
pub struct InMemoryEventStore {
    inner: Mutex<HashMap<String, StoredLog>>,
}

impl InMemoryEventStore {
    /// Total number of events in an orchestrator's log, snapshot-covered
    /// ones included. Test helper.
    pub fn event_count(&self, orchestrator: &str) -> usize {
        self.inner
            .lock()
            .expect("store lock")
            .get(orchestrator)
            .map(|log| log.events.len())
            .unwrap_or(0)
    }

    /// All events of an orchestrator's log, oldest first. Test helper.
    pub fn events(&self, orchestrator: &str) -> Vec<OrchestratorEvent> {
        self.inner
            .lock()
            .expect("store lock")
            .get(orchestrator)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn read(&self, orchestrator: &str) -> (Option<SnapshotRecord>, Vec<OrchestratorEvent>) {
        let inner = self.inner.lock().expect("store lock");
        match inner.get(orchestrator) {
            None => (None, Vec::new()),
            Some(log) => {
                let covered = log.snapshot.as_ref().map(|s| s.covered_events as usize).unwrap_or(0);
                let tail = log.events.get(covered..).map(|s| s.to_vec()).unwrap_or_default();
                (log.snapshot.clone(), tail)
            }
        }
    }

    async fn append(&self, orchestrator: &str, events: Vec<OrchestratorEvent>) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .entry(orchestrator.to_string())
            .or_default()
            .events
            .extend(events);
        Ok(())
    }

    async fn save_snapshot(&self, orchestrator: &str, record: SnapshotRecord) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("store lock");
        let log = inner.entry(orchestrator.to_string()).or_default();
        if record.covered_events as usize > log.events.len() {
            return Err(format!(
                "snapshot covers {} events but log has {}",
                record.covered_events,
                log.events.len()
            ));
        }
        log.snapshot = Some(record);
        Ok(())
    }

    async fn list(&self) -> Vec<String> {
        self.inner.lock().expect("store lock").keys().cloned().collect()
    }

    async fn reset(&self) {
        self.inner.lock().expect("store lock").clear();
    }
}
