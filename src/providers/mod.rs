//! Persistence layer interface and built-in implementations.
//!
//! The engine consumes this interface for event append and snapshot
//! save/load; it never interprets storage details. `read` yields the most
//! recent snapshot (if any) plus only the events appended after it, which
//! together are the orchestrator's recovery stream.

use crate::events::{OrchestratorEvent, SnapshotRecord};
use async_trait::async_trait;

pub mod fs;
pub mod in_memory;

pub use self::fs::FsEventStore;
pub use self::in_memory::InMemoryEventStore;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Load the recovery stream for an orchestrator: the latest snapshot
    /// offer, then the events persisted after it, oldest first.
    async fn read(&self, orchestrator: &str) -> (Option<SnapshotRecord>, Vec<OrchestratorEvent>);

    /// Append events to the orchestrator's log.
    async fn append(&self, orchestrator: &str, events: Vec<OrchestratorEvent>) -> Result<(), String>;

    /// Persist a snapshot covering a prefix of the log. A later `read`
    /// returns this snapshot and only the events past its covered count.
    async fn save_snapshot(&self, orchestrator: &str, record: SnapshotRecord) -> Result<(), String>;

    /// Names of all orchestrators with persisted state.
    async fn list(&self) -> Vec<String>;

    /// Drop all persisted state.
    async fn reset(&self);
}
