//! Extension seam for orchestrator-level decisions.
//!
//! Hooks observe terminal task events and issue *directives* (finish the
//! orchestrator, abort it, cancel waiting tasks) through a narrow
//! [`HookContext`]. The receive loop and base commands are owned by the
//! core and cannot be replaced, so a hook that keeps the orchestrator
//! running after an abort still runs the default dispatch and matching.
//!
//! Hooks run during replay as well; keep them a pure function of the
//! reports they are given, so recovery rebuilds the same decisions.

use crate::status::Report;
use crate::{AbortCause, Reply, TaskState};
use serde_json::Value;

/// A decision a hook handed back to the core. Applied in order; the first
/// finish/abort wins and later ones are ignored.
#[derive(Debug, Clone)]
pub(crate) enum Directive {
    Finish(Value),
    Abort { instigator: Option<u32>, cause: AbortCause },
    CancelWaiting,
}

/// Read-only view of the task vector plus directive collection.
pub struct HookContext<'a> {
    pub(crate) reports: &'a [Report],
    pub(crate) decided: bool,
    pub(crate) directives: Vec<Directive>,
}

impl<'a> HookContext<'a> {
    pub fn reports(&self) -> &[Report] {
        self.reports
    }

    pub fn report(&self, index: u32) -> Option<&Report> {
        self.reports.get(index as usize)
    }

    /// True once a terminal outcome for the orchestrator exists. Later
    /// finish/abort directives are ignored.
    pub fn decided(&self) -> bool {
        self.decided
    }

    pub fn waiting_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.state, TaskState::Waiting))
            .count()
    }

    pub fn unstarted_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.state, TaskState::Unstarted))
            .count()
    }

    /// Conclude the orchestrator successfully with the given value.
    pub fn finish(&mut self, value: Value) {
        self.directives.push(Directive::Finish(value));
    }

    /// Abort the orchestrator, naming the instigating task.
    pub fn abort(&mut self, instigator: u32, cause: AbortCause) {
        self.directives.push(Directive::Abort {
            instigator: Some(instigator),
            cause,
        });
    }

    /// Abort the orchestrator without a specific instigating task; the
    /// core picks the first aborted task, or task 0, for the report.
    pub fn fail(&mut self, cause: AbortCause) {
        self.directives.push(Directive::Abort {
            instigator: None,
            cause,
        });
    }

    /// Fire the timeout path on every task still waiting, driving them to
    /// a terminal state. The only cancellation primitive there is.
    pub fn cancel_waiting(&mut self) {
        self.directives.push(Directive::CancelWaiting);
    }
}

/// Orchestrator-level callbacks. Defaults implement the stock protocol:
/// abort-and-stop on the first task abort, finish with the collected
/// results once every task finished.
pub trait OrchestratorHooks: Send + 'static {
    /// A task reached `Finished`. Runs before newly-enabled dependents are
    /// started.
    fn task_finished(&mut self, cx: &mut HookContext<'_>, index: u32, value: &Value) {
        let _ = (cx, index, value);
    }

    /// A task reached `Aborted` or `TimedOut`. The default makes it the
    /// instigator and aborts the orchestrator; waiting tasks are left
    /// untouched and their replies are no longer matched.
    fn task_aborted(&mut self, cx: &mut HookContext<'_>, index: u32, cause: &AbortCause) {
        if !cx.decided() {
            cx.abort(index, cause.clone());
        }
    }

    /// Every task finished. The default concludes with the results in
    /// task-index order.
    fn all_finished(&mut self, cx: &mut HookContext<'_>) {
        if cx.decided() {
            return;
        }
        let results: Vec<Value> = cx
            .reports()
            .iter()
            .map(|r| r.result.clone().unwrap_or(Value::Null))
            .collect();
        cx.finish(Value::Array(results));
    }

    /// A reply matched no waiting task. The default drops it (the core
    /// logs the drop). Extra, user-defined commands hook in here.
    fn unmatched_reply(&mut self, cx: &mut HookContext<'_>, reply: &Reply) {
        let _ = (cx, reply);
    }
}

/// The stock protocol with no overrides.
pub struct DefaultHooks;

impl OrchestratorHooks for DefaultHooks {}
