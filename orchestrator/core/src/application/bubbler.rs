// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Completion Bubbler
//!
//! Propagates a terminal task status backward along its delegation chain.
//! Every ACCEPTED link is moved to COMPLETED and the parent side's scope
//! behavior is notified. Links already COMPLETED are skipped, so running
//! `bubble` again on a finished chain performs no writes.
//!
//! Decomposed work is handled with an explicit worklist: when the last
//! sibling of a decomposition completes, the parent task is marked DONE and
//! queued for its own walk. Until then propagation halts at the
//! decomposition point.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::repository_factory::Repositories;
use crate::application::retry::ReadRetry;
use crate::domain::delegation::{DecompositionId, Delegation, DelegationId};
use crate::domain::error::CoordinationError;
use crate::domain::events::DelegationEvent;
use crate::domain::repository::{DelegationRepository, InstanceRepository, TaskLocks, TaskRepository};
use crate::domain::scope_behavior::{ChildCompletion, ScopeBehavior, ScopePolicy};
use crate::domain::task::{Task, TaskId, TaskStatus};
use crate::infrastructure::event_bus::EventBus;

/// Completion state of one decomposition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationStatus {
    pub decomposition_id: DecompositionId,
    pub complete: bool,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BubbleReport {
    /// Delegations moved to COMPLETED, in walk order.
    pub completed: Vec<DelegationId>,
    /// Tasks whose chains were walked, starting with the bubbled task.
    pub tasks_visited: Vec<TaskId>,
    /// Decomposition that stopped propagation because siblings are still open.
    pub halted_at: Option<DecompositionId>,
}

impl BubbleReport {
    pub fn is_noop(&self) -> bool {
        self.completed.is_empty()
    }
}

pub struct CompletionBubbler {
    instances: Arc<dyn InstanceRepository>,
    tasks: Arc<dyn TaskRepository>,
    delegations: Arc<dyn DelegationRepository>,
    locks: Arc<dyn TaskLocks>,
    event_bus: Arc<EventBus>,
    retry: ReadRetry,
}

impl CompletionBubbler {
    pub fn new(repos: &Repositories, event_bus: Arc<EventBus>) -> Self {
        Self {
            instances: repos.instances.clone(),
            tasks: repos.tasks.clone(),
            delegations: repos.delegations.clone(),
            locks: repos.locks.clone(),
            event_bus,
            retry: ReadRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ReadRetry) -> Self {
        self.retry = retry;
        self
    }

    async fn load_task(&self, task_id: TaskId) -> Result<Task, CoordinationError> {
        self.retry
            .run("task by id", || self.tasks.find_by_id(task_id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("task", task_id))
    }

    /// Ask the parent side of `delegation` to acknowledge the child's result.
    pub(crate) async fn notify_parent(
        &self,
        task: &Task,
        delegation: &Delegation,
    ) -> Result<ChildCompletion, CoordinationError> {
        let parent_id = delegation.parent_instance_id();
        let parent = self
            .retry
            .run("instance by id", || self.instances.find_by_id(parent_id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("instance", parent_id))?;
        Ok(ScopePolicy::for_instance(&parent).on_child_completed(task, &parent, delegation))
    }

    /// Events for a link that has just been committed as COMPLETED.
    pub(crate) fn publish_completion(&self, delegation: &Delegation, completion: &ChildCompletion) {
        metrics::counter!("canopy_delegation_transitions_total", "to" => "COMPLETED").increment(1);
        self.event_bus
            .publish_delegation_event(DelegationEvent::DelegationCompleted {
                delegation: delegation.clone(),
            });
        self.event_bus.publish_delegation_event(DelegationEvent::ChildCompleted {
            delegation_id: delegation.id,
            task_id: delegation.task_id,
            parent_instance_id: delegation.parent_instance_id(),
            parent_scope: completion.scope,
            summary: completion.summary.clone(),
            notified_at: Utc::now(),
        });
    }

    /// Walk the task's chain and every parent chain unblocked by it.
    pub async fn bubble(&self, task_id: TaskId) -> Result<BubbleReport, CoordinationError> {
        let mut report = BubbleReport::default();
        let mut worklist = VecDeque::from([task_id]);

        while let Some(current) = worklist.pop_front() {
            let task = {
                let _guard = self.locks.lock(current).await?;
                let task = self.load_task(current).await?;
                if !task.status.is_terminal() {
                    return Err(CoordinationError::InvalidTransition {
                        entity: "task",
                        id: task.id.to_string(),
                        action: "bubble completion of",
                        current: task.status.to_string(),
                    });
                }
                report.tasks_visited.push(task.id);
                self.complete_chain(&task, &mut report).await?;
                task
            };

            let (Some(parent_task_id), Some(decomposition_id)) = (task.parent_task(), task.decomposition()) else {
                continue;
            };

            let aggregation = self.aggregate(decomposition_id).await?;
            if !aggregation.complete {
                debug!(
                    "Decomposition {} has {}/{} siblings complete, halting at task {}",
                    decomposition_id, aggregation.completed, aggregation.total, task.id
                );
                report.halted_at = Some(decomposition_id);
                continue;
            }

            let _guard = self.locks.lock(parent_task_id).await?;
            let mut parent = self.load_task(parent_task_id).await?;
            if parent.decomposition() != Some(decomposition_id) {
                warn!(
                    "Decomposition {} is not the current split of task {}, not completing it",
                    decomposition_id, parent.id
                );
                continue;
            }
            if !parent.status.is_terminal() {
                parent.set_status(TaskStatus::Done)?;
                self.tasks.save(&parent).await?;
                info!(
                    "All {} subtasks of decomposition {} complete, task {} is DONE",
                    aggregation.total, decomposition_id, parent.id
                );
            }
            worklist.push_back(parent_task_id);
        }

        Ok(report)
    }

    /// Complete every ACCEPTED link of one task's chain, newest first.
    async fn complete_chain(&self, task: &Task, report: &mut BubbleReport) -> Result<(), CoordinationError> {
        let chain = self
            .retry
            .run("delegation chain", || self.delegations.find_by_task(task.id))
            .await?;

        for mut delegation in chain.into_iter().rev().filter(Delegation::is_accepted) {
            let completion = self.notify_parent(task, &delegation).await?;
            delegation.complete(link_result(task, &delegation, &completion))?;
            delegation.notes.push(completion.summary.clone());
            self.delegations.save(&delegation).await?;

            info!(
                "Bubbled completion of task {} across delegation {} ({} -> {})",
                task.id, delegation.id, delegation.source_instance_id, delegation.target_instance_id
            );
            metrics::counter!("canopy_bubbled_delegations_total").increment(1);
            self.publish_completion(&delegation, &completion);
            report.completed.push(delegation.id);
        }
        Ok(())
    }

    /// Whether every sibling of the decomposition `parent_task_id` produced
    /// has completed.
    pub async fn aggregate_child_completions(
        &self,
        parent_task_id: TaskId,
    ) -> Result<AggregationStatus, CoordinationError> {
        let parent = self.load_task(parent_task_id).await?;
        if parent.parent_task().is_some() && parent.decomposition().is_some() {
            // a subtask carries its siblings' decomposition, not its own
            return Err(CoordinationError::InvalidInput(format!(
                "task {} is a subtask; aggregate its parent instead",
                parent.id
            )));
        }
        let decomposition_id = parent.decomposition().ok_or_else(|| {
            CoordinationError::InvalidInput(format!("task {} has not been decomposed", parent.id))
        })?;
        self.aggregate(decomposition_id).await
    }

    /// A sibling is complete when its decomposition link is COMPLETED, or when
    /// that link was rejected and the subtask finished over another route.
    async fn aggregate(&self, decomposition_id: DecompositionId) -> Result<AggregationStatus, CoordinationError> {
        let links = self
            .retry
            .run("decomposition", || self.delegations.find_by_decomposition(decomposition_id))
            .await?;
        let siblings: BTreeSet<TaskId> = links.iter().map(|d| d.task_id).collect();

        let mut completed = 0;
        for sibling in &siblings {
            let own: Vec<&Delegation> = links.iter().filter(|d| d.task_id == *sibling).collect();
            if own.iter().any(|d| d.is_completed()) {
                completed += 1;
                continue;
            }
            if own.iter().all(|d| d.status.is_final()) {
                let subtask = self.load_task(*sibling).await?;
                if subtask.status.is_terminal() {
                    completed += 1;
                }
            }
        }

        Ok(AggregationStatus {
            decomposition_id,
            complete: !siblings.is_empty() && completed == siblings.len(),
            completed,
            total: siblings.len(),
        })
    }
}

/// Result stored on a link completed by bubbling.
fn link_result(task: &Task, delegation: &Delegation, completion: &ChildCompletion) -> Map<String, Value> {
    let mut result = Map::new();
    result.insert("task_status".into(), json!(task.status.as_str()));
    result.insert("task_id".into(), json!(task.id.to_string()));
    result.insert("completed_by".into(), json!(delegation.child_instance_id().to_string()));
    result.insert("summary".into(), json!(completion.summary));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delegation::DelegationType;
    use crate::domain::instance::{Instance, InstanceConfig, InstanceId, Scope};
    use crate::domain::task::{TaskPriority, DECOMPOSITION_KEY, PARENT_TASK_KEY};
    use crate::infrastructure::repositories::InMemoryStore;

    struct Fixture {
        store: InMemoryStore,
        bubbler: CompletionBubbler,
        g: Instance,
        p: Instance,
        o: Instance,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let repos = Repositories::in_memory(&store);
        let g = Instance::new("g", Scope::Global, None, InstanceConfig::new()).unwrap();
        let p = Instance::new("p", Scope::Project, Some(g.id), InstanceConfig::new()).unwrap();
        let o = Instance::new("o", Scope::Orchestration, Some(p.id), InstanceConfig::new()).unwrap();
        for i in [&g, &p, &o] {
            repos.instances.save(i).await.unwrap();
        }
        let bubbler = CompletionBubbler::new(&repos, Arc::new(EventBus::new(64)));
        Fixture { store, bubbler, g, p, o }
    }

    async fn accepted(store: &InMemoryStore, task: &Task, from: InstanceId, to: InstanceId) -> Delegation {
        let mut d = Delegation::new(task.id, from, to, DelegationType::Route);
        d.accept().unwrap();
        store.delegations().save(&d).await.unwrap();
        d
    }

    #[tokio::test]
    async fn test_bubble_completes_chain_and_is_idempotent() {
        let f = fixture().await;
        let mut t = Task::new(f.o.id, "t", "", Vec::new(), TaskPriority::Medium, Map::new()).unwrap();
        let d1 = accepted(&f.store, &t, f.g.id, f.p.id).await;
        let d2 = accepted(&f.store, &t, f.p.id, f.o.id).await;
        t.set_status(TaskStatus::Done).unwrap();
        f.store.tasks().save(&t).await.unwrap();

        let report = f.bubbler.bubble(t.id).await.unwrap();
        assert_eq!(report.completed, vec![d2.id, d1.id]);
        assert_eq!(report.tasks_visited, vec![t.id]);

        let chain = f.store.delegations().find_by_task(t.id).await.unwrap();
        assert!(chain.iter().all(Delegation::is_completed));
        assert_eq!(chain[0].result.get("task_status"), Some(&json!("DONE")));
        assert!(chain[1].notes.iter().any(|n| n.contains("reported task 't' DONE to p")));

        let writes = f.store.write_count();
        let again = f.bubbler.bubble(t.id).await.unwrap();
        assert!(again.is_noop());
        assert_eq!(f.store.write_count(), writes);
        assert_eq!(f.store.delegations().find_by_task(t.id).await.unwrap(), chain);
    }

    #[tokio::test]
    async fn test_bubble_requires_terminal_task() {
        let f = fixture().await;
        let t = Task::new(f.p.id, "t", "", Vec::new(), TaskPriority::Medium, Map::new()).unwrap();
        f.store.tasks().save(&t).await.unwrap();
        let err = f.bubbler.bubble(t.id).await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_transition");
        assert_eq!(f.bubbler.bubble(TaskId::new()).await.unwrap_err().error_kind(), "not_found");
    }

    #[tokio::test]
    async fn test_decomposition_halts_until_all_siblings_complete() {
        let f = fixture().await;
        let decomposition = DecompositionId::new();
        let mut parent = Task::new(f.p.id, "epic", "", Vec::new(), TaskPriority::High, Map::new()).unwrap();
        parent
            .metadata
            .insert(DECOMPOSITION_KEY.into(), json!(decomposition.to_string()));
        parent.set_status(TaskStatus::Blocked).unwrap();
        f.store.tasks().save(&parent).await.unwrap();
        let up = accepted(&f.store, &parent, f.g.id, f.p.id).await;

        let mut subtasks = Vec::new();
        for name in ["a", "b"] {
            let mut meta = Map::new();
            meta.insert(PARENT_TASK_KEY.into(), json!(parent.id.to_string()));
            meta.insert(DECOMPOSITION_KEY.into(), json!(decomposition.to_string()));
            let mut sub = Task::new(f.o.id, name, "", Vec::new(), TaskPriority::Medium, meta).unwrap();
            let mut d = Delegation::new(sub.id, f.p.id, f.o.id, DelegationType::Decompose)
                .with_decomposition(decomposition);
            d.accept().unwrap();
            sub.set_status(TaskStatus::Done).unwrap();
            f.store.delegations().save_with_task(&d, &sub).await.unwrap();
            subtasks.push((sub, d));
        }

        let first = f.bubbler.bubble(subtasks[0].0.id).await.unwrap();
        assert_eq!(first.completed, vec![subtasks[0].1.id]);
        assert_eq!(first.halted_at, Some(decomposition));
        let status = f.bubbler.aggregate_child_completions(parent.id).await.unwrap();
        assert_eq!((status.complete, status.completed, status.total), (false, 1, 2));
        // the link above the decomposition point is untouched
        let up_now = f.store.delegations().find_by_id(up.id).await.unwrap().unwrap();
        assert!(up_now.is_accepted());
        assert_eq!(
            f.store.tasks().find_by_id(parent.id).await.unwrap().unwrap().status,
            TaskStatus::Blocked
        );

        let second = f.bubbler.bubble(subtasks[1].0.id).await.unwrap();
        assert_eq!(second.completed, vec![subtasks[1].1.id, up.id]);
        assert_eq!(second.tasks_visited, vec![subtasks[1].0.id, parent.id]);
        assert_eq!(second.halted_at, None);
        assert_eq!(
            f.store.tasks().find_by_id(parent.id).await.unwrap().unwrap().status,
            TaskStatus::Done
        );
        assert!(f.bubbler.aggregate_child_completions(parent.id).await.unwrap().complete);

        let writes = f.store.write_count();
        assert!(f.bubbler.bubble(subtasks[0].0.id).await.unwrap().is_noop());
        assert_eq!(f.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_stale_decomposition_does_not_complete_parent() {
        let f = fixture().await;
        let current = DecompositionId::new();
        let stale = DecompositionId::new();
        let mut parent = Task::new(f.p.id, "epic", "", Vec::new(), TaskPriority::High, Map::new()).unwrap();
        parent.metadata.insert(DECOMPOSITION_KEY.into(), json!(current.to_string()));
        parent.set_status(TaskStatus::Blocked).unwrap();
        f.store.tasks().save(&parent).await.unwrap();

        let mut meta = Map::new();
        meta.insert(PARENT_TASK_KEY.into(), json!(parent.id.to_string()));
        meta.insert(DECOMPOSITION_KEY.into(), json!(stale.to_string()));
        let mut leftover = Task::new(f.o.id, "leftover", "", Vec::new(), TaskPriority::Medium, meta).unwrap();
        let mut d = Delegation::new(leftover.id, f.p.id, f.o.id, DelegationType::Decompose).with_decomposition(stale);
        d.accept().unwrap();
        leftover.set_status(TaskStatus::Done).unwrap();
        f.store.delegations().save_with_task(&d, &leftover).await.unwrap();

        let report = f.bubbler.bubble(leftover.id).await.unwrap();
        assert_eq!(report.completed, vec![d.id]);
        assert_eq!(report.tasks_visited, vec![leftover.id]);
        assert_eq!(
            f.store.tasks().find_by_id(parent.id).await.unwrap().unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[tokio::test]
    async fn test_aggregate_requires_decomposed_task() {
        let f = fixture().await;
        let t = Task::new(f.p.id, "t", "", Vec::new(), TaskPriority::Medium, Map::new()).unwrap();
        f.store.tasks().save(&t).await.unwrap();
        let err = f.bubbler.aggregate_child_completions(t.id).await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_input");
    }
}
