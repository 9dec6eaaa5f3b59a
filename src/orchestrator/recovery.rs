//! Replay of the persisted snapshot and event log.
//!
//! Replay applies events with side effects suppressed: nothing is sent on
//! the wire and no timers are armed. Deterministic counters re-derive the
//! same delivery and correlation ids that the original run allocated.
//! After the log is exhausted, the live side effects the replay withheld
//! are performed once: timers re-armed, unconfirmed deliveries re-issued,
//! a restored terminal outcome re-announced to the parent, and any task
//! whose dependencies are now satisfied but whose start never got
//! journaled is started.

use super::hooks::{Directive, OrchestratorHooks};
use super::Core;
use crate::events::OrchestratorEvent;
use crate::task::TaskState;
use crate::{AbortCause, TaskAction};
use tracing::{debug, info};

impl Core {
    pub(crate) async fn recover(&mut self, hooks: &mut dyn OrchestratorHooks) -> Result<(), String> {
        let (snapshot, events) = self.store.read(&self.name).await;
        let had_snapshot = snapshot.is_some();
        let replayed = events.len();
        if let Some(record) = snapshot {
            self.apply_snapshot(record)?;
        }

        self.replaying = true;
        for event in events {
            let dirs = self.apply_event(hooks, event).await?;
            self.apply_directives(hooks, dirs).await;
            self.event_count += 1;
        }
        self.replaying = false;

        if had_snapshot || replayed > 0 {
            info!(
                orchestrator = %self.name,
                replayed,
                from_snapshot = had_snapshot,
                "recovery completed"
            );
        }

        // Live side effects the replay suppressed.
        if self.outcome.is_some() {
            if let Some(parent) = self.parent.clone() {
                self.send_terminal_reply(&parent).await;
            }
            if self.pending_cancel {
                self.apply_directives(hooks, vec![Directive::CancelWaiting]).await;
            }
        } else {
            for (index, w) in self.waiting.clone() {
                self.arm_timeout(index, w.correlation_id);
            }
            self.redeliver().await;
            if self.start_id.is_some() {
                let mut dirs = self.start_satisfied(hooks).await;
                dirs.extend(self.check_all_finished(hooks));
                self.apply_directives(hooks, dirs).await;
            }
        }
        Ok(())
    }

    /// Apply one journaled event. Duplicate completion-like events (as can
    /// occur around a crash) are ignored because the task has already left
    /// `Waiting`; applying them twice therefore yields the same state as
    /// applying them once.
    pub(crate) async fn apply_event(
        &mut self,
        hooks: &mut dyn OrchestratorHooks,
        event: OrchestratorEvent,
    ) -> Result<Vec<Directive>, String> {
        match event {
            OrchestratorEvent::Started { id } => {
                self.start_id = Some(id);
                Ok(Vec::new())
            }
            OrchestratorEvent::MessageSent { task } => {
                if !matches!(self.states.get(task as usize), Some(TaskState::Unstarted)) {
                    debug!(orchestrator = %self.name, task, "replayed MessageSent for a task no longer unstarted; ignoring");
                    return Ok(Vec::new());
                }
                Ok(self.start_task(hooks, task).await)
            }
            OrchestratorEvent::MessageReceived { task, reply } => {
                if !matches!(self.states.get(task as usize), Some(TaskState::Waiting)) {
                    debug!(orchestrator = %self.name, task, "replayed reply for a task no longer waiting; ignoring");
                    return Ok(Vec::new());
                }
                let is_sentinel = reply.is_timeout();
                let action = (self.tasks[task as usize].behavior)(&reply);
                match action {
                    TaskAction::Finish(value) => Ok(self.complete(hooks, task, value).await),
                    TaskAction::Abort(cause) => Ok(self.abort_task(hooks, task, cause, false)),
                    // A journaled sentinel takes the timeout path whether or
                    // not the behavior handles it, so replay cannot fail on
                    // a match miss.
                    TaskAction::Ignore if is_sentinel => {
                        Ok(self.abort_task(hooks, task, AbortCause::TimedOut, true))
                    }
                    TaskAction::Ignore => Err(format!(
                        "replay mismatch: behavior for task {task} ignored a journaled reply"
                    )),
                }
            }
            OrchestratorEvent::TaskTimedOut { task } => {
                if !matches!(self.states.get(task as usize), Some(TaskState::Waiting)) {
                    return Ok(Vec::new());
                }
                Ok(self.abort_task(hooks, task, AbortCause::TimedOut, true))
            }
        }
    }
}
