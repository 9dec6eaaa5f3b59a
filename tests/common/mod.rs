//! Shared test helpers: in-process destination actors standing in for the
//! services an orchestrator talks to.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskforge::providers::{EventStore, InMemoryEventStore};
use taskforge::{Envelope, Reply, Router};

/// A concrete in-memory store plus the trait object the engine consumes.
#[allow(dead_code)]
pub fn stores() -> (Arc<InMemoryEventStore>, Arc<dyn EventStore>) {
    let store = Arc::new(InMemoryEventStore::default());
    let dyn_store: Arc<dyn EventStore> = store.clone();
    (store, dyn_store)
}

/// Destination actor: replies through `f`, or stays silent on `None`.
#[allow(dead_code)]
pub async fn spawn_responder(
    router: &Arc<Router>,
    path: &str,
    f: impl Fn(Value) -> Option<Value> + Send + 'static,
) {
    let mut rx = router.register(path).await.expect("register responder");
    let router = router.clone();
    let path = path.to_string();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Envelope::Request { from, request } = envelope {
                if let Some(body) = f(request.body) {
                    router
                        .send(
                            &from,
                            Envelope::Reply(Reply::message(request.correlation_id, path.clone(), body)),
                        )
                        .await;
                }
            }
        }
    });
}

/// Destination that always replies with the same body.
#[allow(dead_code)]
pub async fn spawn_fixed_responder(router: &Arc<Router>, path: &str, body: Value) {
    spawn_responder(router, path, move |_| Some(body.clone())).await;
}

/// Destination that receives but never replies.
#[allow(dead_code)]
pub async fn spawn_silent(router: &Arc<Router>, path: &str) {
    spawn_responder(router, path, |_| None).await;
}

/// Destination that waits before replying, to force arrival order.
#[allow(dead_code)]
pub async fn spawn_delayed_responder(router: &Arc<Router>, path: &str, delay: Duration, body: Value) {
    let mut rx = router.register(path).await.expect("register responder");
    let router = router.clone();
    let path = path.to_string();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Envelope::Request { from, request } = envelope {
                tokio::time::sleep(delay).await;
                router
                    .send(
                        &from,
                        Envelope::Reply(Reply::message(
                            request.correlation_id,
                            path.clone(),
                            body.clone(),
                        )),
                    )
                    .await;
            }
        }
    });
}

/// Destination that records every request body (in arrival order) before
/// replying through `f`.
#[allow(dead_code)]
pub async fn spawn_recording_responder(
    router: &Arc<Router>,
    path: &str,
    log: Arc<Mutex<Vec<Value>>>,
    f: impl Fn(Value) -> Option<Value> + Send + 'static,
) {
    spawn_responder(router, path, move |body| {
        log.lock().expect("log lock").push(body.clone());
        f(body)
    })
    .await;
}
