//! The quorum composite task.
//!
//! From the outer orchestrator's view a quorum is a single task. Its
//! implementation spawns an inner orchestrator holding N inner tasks, one
//! per voter destination; the composite's request is the inner
//! orchestrator's start command, and its reply is the inner orchestrator's
//! terminal outcome. Vote counting and the decision rules live in the
//! inner orchestrator's hooks, so they replay deterministically from the
//! inner event log.
//!
//! The inner orchestrator always runs distinct correlation ids: every
//! voter destination gets correlation id 0 for its first request, which is
//! what makes "all inner tasks carry the same message" hold on the wire.

use crate::orchestrator::hooks::{HookContext, OrchestratorHooks};
use crate::orchestrator::OrchestratorBuilder;
use crate::task::{Task, TaskState};
use crate::{AbortCause, CorrelationMode, Outcome, Reply, TaskAction, WireCommand};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// How many matching votes conclude the quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimumVotes {
    Majority,
    All,
    /// At least k votes, k >= 1. Clamped to the number of voters.
    AtLeast(u32),
}

impl MinimumVotes {
    pub fn threshold(&self, voters: usize) -> usize {
        match self {
            MinimumVotes::Majority => voters / 2 + 1,
            MinimumVotes::All => voters,
            MinimumVotes::AtLeast(k) => (*k as usize).max(1).min(voters),
        }
    }

    /// How many voters may abort or stay silent before the quorum becomes
    /// unreachable.
    pub fn tolerance(&self, voters: usize) -> usize {
        voters.saturating_sub(self.threshold(voters))
    }
}

impl OrchestratorBuilder {
    /// Add a quorum composite task with no dependencies.
    pub fn quorum_task<F>(self, name: impl Into<String>, minimum_votes: MinimumVotes, inner_tasks: F) -> Self
    where
        F: FnOnce(&str) -> Vec<Task>,
    {
        self.quorum_task_after(name, minimum_votes, std::iter::empty(), inner_tasks)
    }

    /// Add a quorum composite task that starts once the given tasks have
    /// finished. `inner_tasks` receives the inner orchestrator's path and
    /// produces one task per voter destination.
    ///
    /// Well-formedness is checked eagerly: inner tasks must have distinct
    /// destinations and produce the same outbound message. A failing check
    /// yields a composite that aborts at start with `IllegalArgument`.
    pub fn quorum_task_after<F, I>(
        mut self,
        name: impl Into<String>,
        minimum_votes: MinimumVotes,
        dependencies: I,
        inner_tasks: F,
    ) -> Self
    where
        F: FnOnce(&str) -> Vec<Task>,
        I: IntoIterator<Item = u32>,
    {
        let name = name.into();
        let child_name = self.next_inner_name();
        let inner = inner_tasks(&child_name);
        match well_formed(&inner) {
            Err(cause) => {
                self.push_task(Task::poisoned(name, child_name, cause).after(dependencies));
            }
            Ok(()) => {
                let threshold = minimum_votes.threshold(inner.len());
                let mut child = OrchestratorBuilder::new(child_name.clone())
                    .correlation(CorrelationMode::Distinct)
                    .settings(self.settings_ref().clone())
                    .hooks(QuorumHooks { threshold })
                    .parent(self.name().to_string());
                for task in inner {
                    child = child.task(task);
                }
                self.add_child(child);
                self.push_task(composite_task(name, child_name).after(dependencies));
            }
        }
        self
    }
}

/// The outer-facing task: delivers the start command to the inner
/// orchestrator and decodes its terminal reply.
fn composite_task(name: String, child: String) -> Task {
    Task::new(
        name,
        child,
        |id| serde_json::to_value(WireCommand::StartOrchestrator { id }).expect("encode"),
        |reply: &Reply| match reply.body() {
            Some(body) => match serde_json::from_value::<Outcome>(body.clone()) {
                Ok(Outcome::Finished { value }) => TaskAction::Finish(value),
                Ok(Outcome::Aborted { cause, .. }) => TaskAction::Abort(cause),
                Err(_) => TaskAction::Ignore,
            },
            None => TaskAction::Ignore,
        },
    )
}

fn well_formed(tasks: &[Task]) -> Result<(), AbortCause> {
    let mut destinations = HashSet::new();
    for task in tasks {
        if !destinations.insert(task.destination().to_string()) {
            return Err(AbortCause::IllegalArgument(
                "tasks with distinct destinations".into(),
            ));
        }
    }
    // Probe every factory at correlation id 0, the id each first request
    // will actually carry under distinct-mode sequences.
    let mut first: Option<Value> = None;
    for task in tasks {
        let body = task.request_body(0);
        match &first {
            None => first = Some(body),
            Some(expected) if *expected != body => {
                return Err(AbortCause::IllegalArgument("tasks with the same message".into()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Vote counting for the inner orchestrator. State is recomputed from the
/// reports on every terminal event, so snapshot restore and event replay
/// rebuild the same decisions.
pub(crate) struct QuorumHooks {
    threshold: usize,
}

impl OrchestratorHooks for QuorumHooks {
    fn task_finished(&mut self, cx: &mut HookContext<'_>, _index: u32, _value: &Value) {
        self.decide(cx);
    }

    fn task_aborted(&mut self, cx: &mut HookContext<'_>, _index: u32, _cause: &AbortCause) {
        self.decide(cx);
    }

    fn all_finished(&mut self, cx: &mut HookContext<'_>) {
        self.decide(cx);
    }
}

impl QuorumHooks {
    fn decide(&mut self, cx: &mut HookContext<'_>) {
        // First outcome wins; votes arriving after the decision are noise.
        if cx.decided() {
            return;
        }
        let mut buckets: BTreeMap<String, (Value, usize)> = BTreeMap::new();
        let mut aborted = 0usize;
        let mut open = 0usize;
        for report in cx.reports() {
            match &report.state {
                TaskState::Finished(value) => {
                    let entry = buckets
                        .entry(value.to_string())
                        .or_insert_with(|| (value.clone(), 0));
                    entry.1 += 1;
                }
                TaskState::Aborted(_) | TaskState::TimedOut => aborted += 1,
                TaskState::Unstarted | TaskState::Waiting => open += 1,
            }
        }
        let voters = cx.reports().len();
        let (leader, leader_count) = buckets
            .values()
            .max_by_key(|(_, count)| *count)
            .map(|(value, count)| (value.clone(), *count))
            .unwrap_or((Value::Null, 0));

        if leader_count >= self.threshold {
            cx.finish(leader);
            cx.cancel_waiting();
            return;
        }
        let tolerance = voters.saturating_sub(self.threshold);
        if aborted > tolerance {
            cx.fail(AbortCause::QuorumImpossibleToAchieve);
            cx.cancel_waiting();
            return;
        }
        // Even if every open voter joined the current leader the threshold
        // is out of reach.
        if aborted + open + leader_count < self.threshold {
            cx.fail(AbortCause::QuorumNotAchieved);
            cx.cancel_waiting();
        }
    }
}
