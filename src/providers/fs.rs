//! Filesystem-backed event store writing JSONL per orchestrator.
//!
//! Layout under the root directory:
//! - `<name>.jsonl` — the event log, one serialized event per line
//! - `<name>.snapshot.json` — the latest snapshot record, replaced atomically

use super::EventStore;
use crate::events::{OrchestratorEvent, SnapshotRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

#[derive(Clone)]
pub struct FsEventStore {
    root: PathBuf,
}

impl FsEventStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let _ = std::fs::create_dir_all(&path);
        Self { root: path }
    }

    fn log_path(&self, orchestrator: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", Self::file_stem(orchestrator)))
    }

    fn snapshot_path(&self, orchestrator: &str) -> PathBuf {
        self.root.join(format!("{}.snapshot.json", Self::file_stem(orchestrator)))
    }

    // Orchestrator names contain "::" for nested children; keep file names flat.
    fn file_stem(orchestrator: &str) -> String {
        orchestrator.replace("::", "__")
    }

    async fn read_log(&self, orchestrator: &str) -> Vec<OrchestratorEvent> {
        let data = fs::read_to_string(self.log_path(orchestrator)).await.unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(ev) = serde_json::from_str::<OrchestratorEvent>(line) {
                out.push(ev);
            }
        }
        out
    }
}

#[async_trait]
impl EventStore for FsEventStore {
    async fn read(&self, orchestrator: &str) -> (Option<SnapshotRecord>, Vec<OrchestratorEvent>) {
        let snapshot = match fs::read_to_string(self.snapshot_path(orchestrator)).await {
            Ok(data) => serde_json::from_str::<SnapshotRecord>(&data).ok(),
            Err(_) => None,
        };
        let events = self.read_log(orchestrator).await;
        let covered = snapshot.as_ref().map(|s| s.covered_events as usize).unwrap_or(0);
        let tail = events.get(covered..).map(|s| s.to_vec()).unwrap_or_default();
        (snapshot, tail)
    }

    async fn append(&self, orchestrator: &str, events: Vec<OrchestratorEvent>) -> Result<(), String> {
        fs::create_dir_all(&self.root).await.map_err(|e| e.to_string())?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(orchestrator))
            .await
            .map_err(|e| e.to_string())?;
        for ev in events {
            let line = serde_json::to_string(&ev).map_err(|e| e.to_string())?;
            file.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
            file.write_all(b"\n").await.map_err(|e| e.to_string())?;
        }
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn save_snapshot(&self, orchestrator: &str, record: SnapshotRecord) -> Result<(), String> {
        let log_len = self.read_log(orchestrator).await.len();
        if record.covered_events as usize > log_len {
            return Err(format!(
                "snapshot covers {} events but log has {}",
                record.covered_events, log_len
            ));
        }
        let data = serde_json::to_string(&record).map_err(|e| e.to_string())?;
        let path = self.snapshot_path(orchestrator);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).await.map_err(|e| e.to_string())?;
        fs::rename(&tmp, &path).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn list(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".jsonl") {
                        out.push(stem.replace("__", "::"));
                    }
                }
            }
        }
        out
    }

    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }
}
