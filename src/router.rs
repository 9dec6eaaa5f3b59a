//! In-process message plane.
//!
//! Every participant (orchestrators and destination actors alike) owns an
//! inbox registered under its path. The router forwards envelopes to the
//! inbox or drops them with a warning when nothing is registered, which is
//! exactly what at-least-once delivery tolerates: the sender's journal
//! retransmits until the receiver confirms.

use crate::{Path, Reply, Request};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Wire traffic between participants.
#[derive(Debug, Clone)]
pub enum Envelope {
    Request { from: Path, request: Request },
    Reply(Reply),
}

pub struct Router {
    inboxes: Mutex<HashMap<Path, UnboundedSender<Envelope>>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Claim a path and return its inbox receiver.
    pub async fn register(&self, path: &str) -> Result<UnboundedReceiver<Envelope>, String> {
        let mut inboxes = self.inboxes.lock().await;
        if inboxes.contains_key(path) {
            return Err(format!("path already registered: {path}"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(path.to_string(), tx);
        Ok(rx)
    }

    pub async fn unregister(&self, path: &str) {
        self.inboxes.lock().await.remove(path);
    }

    /// Forward an envelope; returns false when the path is unknown or its
    /// inbox is gone (the envelope is dropped).
    pub async fn send(&self, to: &str, envelope: Envelope) -> bool {
        let inboxes = self.inboxes.lock().await;
        match inboxes.get(to) {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    debug!(to, "inbox closed; dropping envelope");
                    false
                } else {
                    true
                }
            }
            None => {
                warn!(to, "no inbox registered; dropping envelope");
                false
            }
        }
    }
}
