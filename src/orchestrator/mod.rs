//! The orchestrator core: a single-threaded cooperative actor owning a
//! frozen task vector, its scheduling state, and the event log.
//!
//! All state transitions of one orchestrator happen on one spawned task.
//! Commands from the owner arrive on a dedicated channel that the receive
//! loop polls first, so base commands (start, status, snapshot, shutdown,
//! cancellation) can never collide with user reply behaviors. Wire traffic
//! (requests and replies) arrives through the router inbox.
//!
//! On spawn the orchestrator first replays its persisted snapshot and
//! events, then re-arms timers, re-issues unconfirmed deliveries, and only
//! then processes external input.

pub mod hooks;
mod recovery;

use crate::delivery::{DeliveryJournal, PendingDelivery};
use crate::ids::{CorrelationMap, CorrelationMode};
use crate::providers::EventStore;
use crate::router::{Envelope, Router};
use crate::status::{Report, StatusResponse};
use crate::task::{Task, TaskState};
use crate::events::{OrchestratorEvent, PersistedTaskState, SnapshotRecord, SnapshotState};
use crate::{AbortCause, Outcome, Path, Reply, Request, Settings, TaskAction, WireCommand};
use self::hooks::{DefaultHooks, Directive, HookContext, OrchestratorHooks};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Commands on the owner channel. Start/status/snapshot/shutdown are the
/// public surface; the rest are internal (timer firings, redelivery ticks,
/// composite cancellation).
pub(crate) enum Command {
    Start { id: u64 },
    Status { reply: oneshot::Sender<StatusResponse> },
    SaveSnapshot,
    Shutdown,
    TimeoutTasks,
    TaskTimedOut { task: u32, correlation_id: u64 },
    Redeliver,
}

enum Flow {
    Continue,
    Stop,
}

/// Builds an orchestrator definition: the task vector (frozen once
/// spawned), correlation mode, settings, hooks, and any inner
/// orchestrators created for composite tasks.
pub struct OrchestratorBuilder {
    name: String,
    mode: CorrelationMode,
    settings: Settings,
    tasks: Vec<Task>,
    children: Vec<OrchestratorBuilder>,
    hooks: Box<dyn OrchestratorHooks>,
    parent: Option<Path>,
    inner_counter: u32,
}

impl OrchestratorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: CorrelationMode::Shared,
            settings: Settings::default(),
            tasks: Vec::new(),
            children: Vec::new(),
            hooks: Box::new(DefaultHooks),
            parent: None,
            inner_counter: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Choose how wire correlation ids relate to delivery ids.
    pub fn correlation(mut self, mode: CorrelationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the default hooks. The receive loop itself is not
    /// replaceable; hooks only observe terminal events and issue
    /// directives.
    pub fn hooks(mut self, hooks: impl OrchestratorHooks) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub(crate) fn parent(mut self, parent: Path) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Append a task; its index is the number of tasks added before it.
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Index the next added task will get.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn settings_ref(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn add_child(&mut self, child: OrchestratorBuilder) {
        self.children.push(child);
    }

    pub(crate) fn push_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Unique name for the next nested child orchestrator.
    pub(crate) fn next_inner_name(&mut self) -> String {
        let name = format!("{}::q{}", self.name, self.inner_counter);
        self.inner_counter += 1;
        name
    }

    /// Spawn the orchestrator (children first) and return its handle.
    /// Recovery runs before any command is processed.
    pub async fn spawn(
        self,
        router: &Arc<Router>,
        store: &Arc<dyn EventStore>,
    ) -> Result<OrchestratorHandle, String> {
        self.spawn_inner(router.clone(), store.clone()).await
    }

    fn spawn_inner(
        self,
        router: Arc<Router>,
        store: Arc<dyn EventStore>,
    ) -> Pin<Box<dyn Future<Output = Result<OrchestratorHandle, String>> + Send>> {
        Box::pin(async move {
            let OrchestratorBuilder {
                name,
                mode,
                settings,
                tasks,
                children,
                hooks,
                parent,
                ..
            } = self;

            let mut child_handles = Vec::with_capacity(children.len());
            for child in children {
                child_handles.push(child.spawn_inner(router.clone(), store.clone()).await?);
            }

            let wire_rx = router.register(&name).await?;
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (outcome_tx, outcome_rx) = watch::channel(None);
            let states = vec![TaskState::Unstarted; tasks.len()];

            let core = Core {
                name: name.clone(),
                tasks,
                states,
                waiting: BTreeMap::new(),
                start_id: None,
                ids: CorrelationMap::new(mode),
                journal: DeliveryJournal::new(),
                router,
                store,
                settings,
                parent,
                outcome: None,
                pending_cancel: false,
                outcome_tx,
                cmd_tx: cmd_tx.clone(),
                event_count: 0,
                events_since_snapshot: 0,
                replaying: false,
            };
            tokio::spawn(run(core, hooks, cmd_rx, wire_rx));

            Ok(OrchestratorHandle {
                path: name,
                cmd_tx,
                outcome_rx,
                children: child_handles,
            })
        })
    }
}

/// Owner-side handle to a spawned orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    path: Path,
    cmd_tx: UnboundedSender<Command>,
    outcome_rx: watch::Receiver<Option<Outcome>>,
    children: Vec<OrchestratorHandle>,
}

impl OrchestratorHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Start execution. Tasks without dependencies are started in index
    /// order; an empty task vector concludes immediately.
    pub fn start(&self, id: u64) -> Result<(), String> {
        self.cmd_tx
            .send(Command::Start { id })
            .map_err(|_| "orchestrator stopped".to_string())
    }

    /// Snapshot of every task's state.
    pub async fn status(&self) -> Result<StatusResponse, String> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { reply: tx })
            .map_err(|_| "orchestrator stopped".to_string())?;
        rx.await.map_err(|_| "orchestrator stopped".to_string())
    }

    /// Persist a state snapshot now.
    pub fn save_snapshot(&self) -> Result<(), String> {
        self.cmd_tx
            .send(Command::SaveSnapshot)
            .map_err(|_| "orchestrator stopped".to_string())
    }

    /// Fire the timeout path on every waiting task.
    pub fn timeout_tasks(&self) -> Result<(), String> {
        self.cmd_tx
            .send(Command::TimeoutTasks)
            .map_err(|_| "orchestrator stopped".to_string())
    }

    /// Graceful stop, cascading to nested child orchestrators.
    pub fn shutdown(&self) {
        for child in &self.children {
            child.shutdown();
        }
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// The terminal outcome, if one has been reached.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome_rx.borrow().clone()
    }

    /// Wait until the orchestrator reaches a terminal outcome.
    pub async fn wait(&self) -> Result<Outcome, String> {
        let mut rx = self.outcome_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return Ok(outcome);
            }
            rx.changed()
                .await
                .map_err(|_| "orchestrator stopped before reaching an outcome".to_string())?;
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Outcome, String> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| "timed out waiting for outcome".to_string())?
    }
}

#[derive(Debug, Clone, Copy)]
struct WaitingIds {
    delivery_id: u64,
    correlation_id: u64,
}

pub(crate) struct Core {
    name: Path,
    tasks: Vec<Task>,
    states: Vec<TaskState>,
    waiting: BTreeMap<u32, WaitingIds>,
    start_id: Option<u64>,
    ids: CorrelationMap,
    journal: DeliveryJournal,
    router: Arc<Router>,
    store: Arc<dyn EventStore>,
    settings: Settings,
    parent: Option<Path>,
    outcome: Option<Outcome>,
    pending_cancel: bool,
    outcome_tx: watch::Sender<Option<Outcome>>,
    cmd_tx: UnboundedSender<Command>,
    event_count: u64,
    events_since_snapshot: u32,
    replaying: bool,
}

async fn run(
    mut core: Core,
    mut hooks: Box<dyn OrchestratorHooks>,
    mut cmd_rx: UnboundedReceiver<Command>,
    mut wire_rx: UnboundedReceiver<Envelope>,
) {
    if let Err(e) = core.recover(hooks.as_mut()).await {
        error!(orchestrator = %core.name, error = %e, "recovery failed; stopping");
        core.router.unregister(&core.name).await;
        return;
    }

    let redeliver = {
        let tx = core.cmd_tx.clone();
        let every = core.settings.redeliver_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if tx.send(Command::Redeliver).is_err() {
                    break;
                }
            }
        })
    };

    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                None => break,
                Some(cmd) => {
                    if let Flow::Stop = core.handle_command(hooks.as_mut(), cmd).await {
                        break;
                    }
                }
            },
            env = wire_rx.recv() => match env {
                None => break,
                Some(env) => core.handle_envelope(hooks.as_mut(), env).await,
            },
        }
    }

    redeliver.abort();
    core.router.unregister(&core.name).await;
}

impl Core {
    pub(crate) fn reports(&self) -> Vec<Report> {
        self.tasks
            .iter()
            .zip(self.states.iter())
            .enumerate()
            .map(|(i, (task, state))| Report {
                index: i as u32,
                name: task.name().to_string(),
                dependencies: task.dependencies().collect(),
                state: state.clone(),
                destination: Some(task.destination().to_string()),
                result: match state {
                    TaskState::Finished(v) => Some(v.clone()),
                    _ => None,
                },
            })
            .collect()
    }

    fn collect<F>(&self, hooks: &mut dyn OrchestratorHooks, f: F) -> Vec<Directive>
    where
        F: FnOnce(&mut dyn OrchestratorHooks, &mut HookContext<'_>),
    {
        let reports = self.reports();
        let mut cx = HookContext {
            reports: &reports,
            decided: self.outcome.is_some(),
            directives: Vec::new(),
        };
        f(hooks, &mut cx);
        cx.directives
    }

    async fn handle_command(&mut self, hooks: &mut dyn OrchestratorHooks, cmd: Command) -> Flow {
        match cmd {
            Command::Start { id } => self.handle_start(hooks, id, None).await,
            Command::Status { reply } => {
                let _ = reply.send(StatusResponse { reports: self.reports() });
            }
            Command::SaveSnapshot => self.save_snapshot().await,
            Command::Shutdown => return Flow::Stop,
            Command::TimeoutTasks => {
                if self.outcome.is_none() {
                    self.apply_directives(hooks, vec![Directive::CancelWaiting]).await;
                }
            }
            Command::TaskTimedOut { task, correlation_id } => {
                if self.outcome.is_none() {
                    let dirs = self.fire_timeout(hooks, task, Some(correlation_id)).await;
                    self.apply_directives(hooks, dirs).await;
                }
            }
            Command::Redeliver => {
                if self.outcome.is_none() {
                    self.redeliver().await;
                }
            }
        }
        Flow::Continue
    }

    async fn handle_envelope(&mut self, hooks: &mut dyn OrchestratorHooks, envelope: Envelope) {
        match envelope {
            Envelope::Request { from, request } => {
                match serde_json::from_value::<WireCommand>(request.body.clone()) {
                    Ok(WireCommand::StartOrchestrator { id }) => {
                        self.handle_start(hooks, id, Some(from)).await;
                    }
                    Err(_) => {
                        warn!(orchestrator = %self.name, from = %from, "unrecognized wire request; dropping");
                    }
                }
            }
            Envelope::Reply(reply) => self.handle_reply(hooks, reply).await,
        }
    }

    async fn handle_start(
        &mut self,
        hooks: &mut dyn OrchestratorHooks,
        id: u64,
        wire_from: Option<Path>,
    ) {
        if self.start_id.is_some() {
            // At-least-once start delivery: duplicates are expected. A
            // terminal orchestrator answers with its outcome again so a
            // parent that crashed before persisting the reply converges.
            if self.outcome.is_some() {
                if let Some(from) = wire_from.or_else(|| self.parent.clone()) {
                    self.send_terminal_reply(&from).await;
                }
            } else {
                warn!(orchestrator = %self.name, id, "duplicate start ignored");
            }
            return;
        }
        info!(orchestrator = %self.name, id, "starting");
        self.persist(OrchestratorEvent::Started { id }).await;
        self.start_id = Some(id);
        let mut dirs = self.start_satisfied(hooks).await;
        dirs.extend(self.check_all_finished(hooks));
        self.apply_directives(hooks, dirs).await;
    }

    async fn handle_reply(&mut self, hooks: &mut dyn OrchestratorHooks, reply: Reply) {
        if self.outcome.is_some() {
            debug!(orchestrator = %self.name, correlation_id = reply.correlation_id, "terminal; reply no longer matched");
            return;
        }
        let matched = self
            .waiting
            .iter()
            .find_map(|(idx, ids)| self.matches(*idx, ids, &reply).then_some(*idx));
        let Some(index) = matched else {
            let dirs = self.collect(hooks, |h, cx| h.unmatched_reply(cx, &reply));
            if dirs.is_empty() {
                warn!(orchestrator = %self.name, correlation_id = reply.correlation_id, "reply matched no waiting task; dropping");
            }
            self.apply_directives(hooks, dirs).await;
            return;
        };
        let action = (self.tasks[index as usize].behavior)(&reply);
        match action {
            TaskAction::Ignore => {
                debug!(orchestrator = %self.name, task = index, "behavior ignored reply; dropping");
            }
            TaskAction::Finish(value) => {
                self.persist(OrchestratorEvent::MessageReceived { task: index, reply }).await;
                let dirs = self.complete(hooks, index, value).await;
                self.apply_directives(hooks, dirs).await;
            }
            TaskAction::Abort(cause) => {
                self.persist(OrchestratorEvent::MessageReceived { task: index, reply }).await;
                let dirs = self.abort_task(hooks, index, cause, false);
                self.apply_directives(hooks, dirs).await;
            }
        }
    }

    /// Does an incoming reply belong to this waiting task?
    fn matches(&self, index: u32, ids: &WaitingIds, reply: &Reply) -> bool {
        match self.ids.mode() {
            CorrelationMode::Shared => ids.delivery_id == reply.correlation_id,
            CorrelationMode::Distinct => {
                let destination = self.tasks[index as usize].destination();
                match self.ids.correlation_to_delivery(destination, reply.correlation_id) {
                    Some(delivery_id) if delivery_id == ids.delivery_id => {
                        // Replayed replies have no live sender to check.
                        self.replaying || reply.sender.as_deref() == Some(destination)
                    }
                    _ => false,
                }
            }
        }
    }

    /// Start every unstarted task whose dependencies are all finished, in
    /// task-index order. Deterministic across replays.
    pub(crate) async fn start_satisfied(&mut self, hooks: &mut dyn OrchestratorHooks) -> Vec<Directive> {
        let ready: Vec<u32> = self
            .states
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                matches!(s, TaskState::Unstarted)
                    && self.tasks[*i]
                        .dependencies()
                        .all(|d| matches!(self.states.get(d as usize), Some(TaskState::Finished(_))))
            })
            .map(|(i, _)| i as u32)
            .collect();
        let mut dirs = Vec::new();
        for index in ready {
            dirs.extend(self.start_task(hooks, index).await);
        }
        dirs
    }

    /// Transition one task Unstarted -> Waiting: allocate ids, journal the
    /// delivery, persist `MessageSent`, send the request and arm the
    /// timeout (the latter two suppressed during replay).
    pub(crate) async fn start_task(&mut self, hooks: &mut dyn OrchestratorHooks, index: u32) -> Vec<Directive> {
        if let Some(cause) = self.tasks[index as usize].poison.clone() {
            self.states[index as usize] = TaskState::Aborted(cause.clone());
            return self.collect(hooks, |h, cx| h.task_aborted(cx, index, &cause));
        }
        let destination = self.tasks[index as usize].destination().to_string();
        let delivery_id = self.journal.allocate();
        let correlation_id = self.ids.delivery_to_correlation(&destination, delivery_id);
        self.journal.record(
            delivery_id,
            PendingDelivery {
                destination: destination.clone(),
                task: index,
                correlation_id,
            },
        );
        self.states[index as usize] = TaskState::Waiting;
        self.waiting.insert(
            index,
            WaitingIds {
                delivery_id,
                correlation_id,
            },
        );
        self.persist(OrchestratorEvent::MessageSent { task: index }).await;
        if !self.replaying {
            let body = self.tasks[index as usize].request_body(correlation_id);
            self.router
                .send(
                    &destination,
                    Envelope::Request {
                        from: self.name.clone(),
                        request: Request { correlation_id, body },
                    },
                )
                .await;
            self.arm_timeout(index, correlation_id);
        }
        Vec::new()
    }

    pub(crate) fn arm_timeout(&self, index: u32, correlation_id: u64) {
        if let Some(timeout) = self.tasks[index as usize].timeout {
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(Command::TaskTimedOut {
                    task: index,
                    correlation_id,
                });
            });
        }
    }

    /// Transition Waiting -> Finished and run the finish protocol: hook,
    /// newly-enabled dependents, all-finished check.
    pub(crate) async fn complete(
        &mut self,
        hooks: &mut dyn OrchestratorHooks,
        index: u32,
        value: Value,
    ) -> Vec<Directive> {
        if let Some(w) = self.waiting.remove(&index) {
            self.journal.confirm(w.delivery_id);
        }
        self.states[index as usize] = TaskState::Finished(value.clone());
        let mut dirs = self.collect(hooks, |h, cx| h.task_finished(cx, index, &value));
        if !self.replaying && self.outcome.is_none() {
            dirs.extend(self.start_satisfied(hooks).await);
        }
        dirs.extend(self.check_all_finished(hooks));
        dirs
    }

    /// Transition Waiting -> Aborted/TimedOut. Confirms the delivery so a
    /// terminal task never retransmits.
    pub(crate) fn abort_task(
        &mut self,
        hooks: &mut dyn OrchestratorHooks,
        index: u32,
        cause: AbortCause,
        timed_out: bool,
    ) -> Vec<Directive> {
        if let Some(w) = self.waiting.remove(&index) {
            self.journal.confirm(w.delivery_id);
        }
        self.states[index as usize] = if timed_out {
            TaskState::TimedOut
        } else {
            TaskState::Aborted(cause.clone())
        };
        self.collect(hooks, |h, cx| h.task_aborted(cx, index, &cause))
    }

    pub(crate) fn check_all_finished(&self, hooks: &mut dyn OrchestratorHooks) -> Vec<Directive> {
        if self
            .states
            .iter()
            .all(|s| matches!(s, TaskState::Finished(_)))
        {
            self.collect(hooks, |h, cx| h.all_finished(cx))
        } else {
            Vec::new()
        }
    }

    /// Deliver the timeout sentinel to a waiting task's behavior. A
    /// behavior that handles it decides the transition and the sentinel is
    /// journaled as a received message; otherwise the task aborts with
    /// `TimedOut` (journaled as `TaskTimedOut` when the setting is on).
    pub(crate) async fn fire_timeout(
        &mut self,
        hooks: &mut dyn OrchestratorHooks,
        index: u32,
        expected_correlation: Option<u64>,
    ) -> Vec<Directive> {
        let Some(w) = self.waiting.get(&index).copied() else {
            return Vec::new();
        };
        if let Some(c) = expected_correlation {
            if c != w.correlation_id {
                return Vec::new();
            }
        }
        let sentinel = Reply::timeout(w.correlation_id);
        let action = (self.tasks[index as usize].behavior)(&sentinel);
        match action {
            TaskAction::Finish(value) => {
                self.persist(OrchestratorEvent::MessageReceived {
                    task: index,
                    reply: sentinel,
                })
                .await;
                self.complete(hooks, index, value).await
            }
            TaskAction::Abort(cause) => {
                self.persist(OrchestratorEvent::MessageReceived {
                    task: index,
                    reply: sentinel,
                })
                .await;
                self.abort_task(hooks, index, cause, false)
            }
            TaskAction::Ignore => {
                if self.settings.persist_timeout_events {
                    self.persist(OrchestratorEvent::TaskTimedOut { task: index }).await;
                }
                self.abort_task(hooks, index, AbortCause::TimedOut, true)
            }
        }
    }

    /// Apply hook directives. The first finish/abort decides the outcome;
    /// cancellation drives remaining waiting tasks through the timeout
    /// path, which may yield further directives.
    pub(crate) async fn apply_directives(&mut self, hooks: &mut dyn OrchestratorHooks, dirs: Vec<Directive>) {
        let mut queue: VecDeque<Directive> = dirs.into();
        while let Some(d) = queue.pop_front() {
            match d {
                Directive::Finish(value) => {
                    if self.outcome.is_none() {
                        self.outcome = Some(Outcome::Finished { value });
                        self.publish_outcome().await;
                    }
                }
                Directive::Abort { instigator, cause } => {
                    if self.outcome.is_none() {
                        let index = instigator
                            .or_else(|| {
                                self.states.iter().position(|s| {
                                    matches!(s, TaskState::Aborted(_) | TaskState::TimedOut)
                                })
                                .map(|i| i as u32)
                            })
                            .unwrap_or(0);
                        let report = self
                            .reports()
                            .into_iter()
                            .nth(index as usize)
                            .unwrap_or(Report {
                                index,
                                name: self.name.clone(),
                                dependencies: Vec::new(),
                                state: TaskState::Unstarted,
                                destination: None,
                                result: None,
                            });
                        self.outcome = Some(Outcome::Aborted {
                            instigator: report,
                            cause,
                            orchestrator_id: self.start_id.unwrap_or(0),
                        });
                        self.publish_outcome().await;
                    }
                }
                Directive::CancelWaiting => {
                    if self.replaying {
                        // The cancellations replay as their own events; if
                        // they never got persisted, recovery resumes this.
                        self.pending_cancel = true;
                        continue;
                    }
                    self.pending_cancel = !self.waiting.is_empty();
                    let indexes: Vec<u32> = self.waiting.keys().copied().collect();
                    for index in indexes {
                        let more = self.fire_timeout(hooks, index, None).await;
                        queue.extend(more);
                    }
                    self.pending_cancel = false;
                }
            }
        }
    }

    async fn publish_outcome(&mut self) {
        let Some(outcome) = self.outcome.clone() else { return };
        match &outcome {
            Outcome::Finished { .. } => info!(orchestrator = %self.name, "finished"),
            Outcome::Aborted { cause, .. } => {
                info!(orchestrator = %self.name, cause = ?cause, "aborted")
            }
        }
        let _ = self.outcome_tx.send(Some(outcome));
        if !self.replaying {
            if let Some(parent) = self.parent.clone() {
                self.send_terminal_reply(&parent).await;
            }
        }
    }

    /// Send (or re-send) the terminal outcome to the parent, correlated by
    /// the start id.
    pub(crate) async fn send_terminal_reply(&self, to: &str) {
        let (Some(outcome), Some(start_id)) = (self.outcome.as_ref(), self.start_id) else {
            return;
        };
        match serde_json::to_value(outcome) {
            Ok(body) => {
                self.router
                    .send(to, Envelope::Reply(Reply::message(start_id, self.name.clone(), body)))
                    .await;
            }
            Err(e) => error!(orchestrator = %self.name, error = %e, "failed to encode terminal reply"),
        }
    }

    /// Retransmit every unconfirmed delivery.
    pub(crate) async fn redeliver(&self) {
        let sends: Vec<(Path, Request)> = self
            .journal
            .unconfirmed()
            .map(|(_, p)| {
                let body = self.tasks[p.task as usize].request_body(p.correlation_id);
                (
                    p.destination.clone(),
                    Request {
                        correlation_id: p.correlation_id,
                        body,
                    },
                )
            })
            .collect();
        for (destination, request) in sends {
            self.router
                .send(
                    &destination,
                    Envelope::Request {
                        from: self.name.clone(),
                        request,
                    },
                )
                .await;
        }
    }

    async fn persist(&mut self, event: OrchestratorEvent) {
        if self.replaying {
            // The event came from the log; it is already persisted.
            return;
        }
        if let Err(e) = self.store.append(&self.name, vec![event]).await {
            error!(orchestrator = %self.name, error = %e, "event append failed; state corruption");
            panic!("event append failed: {e}");
        }
        self.event_count += 1;
        self.maybe_autosnapshot().await;
    }

    async fn maybe_autosnapshot(&mut self) {
        let every = self.settings.save_snapshot_roughly_every_x_messages;
        if every == 0 {
            return;
        }
        self.events_since_snapshot += 1;
        if self.events_since_snapshot >= every {
            self.save_snapshot().await;
            self.events_since_snapshot = 0;
        }
    }

    pub(crate) async fn save_snapshot(&mut self) {
        let record = SnapshotRecord {
            covered_events: self.event_count,
            state: self.snapshot_state(),
        };
        if let Err(e) = self.store.save_snapshot(&self.name, record).await {
            warn!(orchestrator = %self.name, error = %e, "snapshot save failed");
        }
    }

    fn snapshot_state(&self) -> SnapshotState {
        let tasks = self
            .states
            .iter()
            .enumerate()
            .map(|(i, s)| match s {
                TaskState::Unstarted => PersistedTaskState::Unstarted,
                TaskState::Waiting => {
                    let w = self.waiting.get(&(i as u32)).copied().unwrap_or(WaitingIds {
                        delivery_id: 0,
                        correlation_id: 0,
                    });
                    PersistedTaskState::Waiting {
                        delivery_id: w.delivery_id,
                        correlation_id: w.correlation_id,
                    }
                }
                TaskState::Finished(v) => PersistedTaskState::Finished { value: v.clone() },
                TaskState::Aborted(cause) => PersistedTaskState::Aborted { cause: cause.clone() },
                TaskState::TimedOut => PersistedTaskState::TimedOut,
            })
            .collect();
        SnapshotState {
            start_id: self.start_id,
            tasks,
            correlation: self.ids.clone(),
            journal: self.journal.clone(),
            outcome: self.outcome.clone(),
            pending_cancel: self.pending_cancel,
        }
    }

    pub(crate) fn apply_snapshot(&mut self, record: SnapshotRecord) -> Result<(), String> {
        let state = record.state;
        if state.tasks.len() != self.tasks.len() {
            return Err(format!(
                "snapshot carries {} tasks but the definition has {}",
                state.tasks.len(),
                self.tasks.len()
            ));
        }
        self.start_id = state.start_id;
        for (i, persisted) in state.tasks.into_iter().enumerate() {
            self.states[i] = match persisted {
                PersistedTaskState::Unstarted => TaskState::Unstarted,
                PersistedTaskState::Waiting {
                    delivery_id,
                    correlation_id,
                } => {
                    self.waiting.insert(
                        i as u32,
                        WaitingIds {
                            delivery_id,
                            correlation_id,
                        },
                    );
                    TaskState::Waiting
                }
                PersistedTaskState::Finished { value } => TaskState::Finished(value),
                PersistedTaskState::Aborted { cause } => TaskState::Aborted(cause),
                PersistedTaskState::TimedOut => TaskState::TimedOut,
            };
        }
        self.ids = state.correlation;
        self.journal = state.journal;
        self.pending_cancel = state.pending_cancel;
        if let Some(outcome) = state.outcome {
            self.outcome = Some(outcome.clone());
            let _ = self.outcome_tx.send(Some(outcome));
        }
        self.event_count = record.covered_events;
        Ok(())
    }
}
