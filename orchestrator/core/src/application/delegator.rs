// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Delegator
//!
//! Drives the delegation state machine for one task at a time:
//!
//! ```text
//! delegate ──▶ PENDING ──accept──▶ ACCEPTED ──complete / bubble──▶ COMPLETED
//!                 │
//!                 └──reject / expire──▶ REJECTED
//! ```
//!
//! Every operation runs under the task's lock from [`TaskLocks`]. Ownership
//! (`task.instance_id`) only moves together with a delegation write, through
//! `save_with_task`.
//!
//! The chain head is the newest PENDING or ACCEPTED delegation. Earlier
//! ACCEPTED links stay ACCEPTED until bubbling completes them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::bubbler::{BubbleReport, CompletionBubbler};
use crate::application::decision::DecisionInputs;
use crate::application::repository_factory::Repositories;
use crate::application::retry::ReadRetry;
use crate::domain::config::DelegationConfig;
use crate::domain::delegation::{
    DecompositionId, Delegation, DelegationId, DelegationType, TIMEOUT_REASON,
};
use crate::domain::error::CoordinationError;
use crate::domain::events::DelegationEvent;
use crate::domain::instance::{Instance, InstanceId};
use crate::domain::repository::{DelegationRepository, InstanceRepository, TaskLocks, TaskRepository};
use crate::domain::router::{CapabilityRouter, RoutingStrategy};
use crate::domain::scope_behavior::{ScopeAction, ScopeBehavior, ScopePolicy};
use crate::domain::task::{Task, TaskId, TaskPriority, TaskStatus, DECOMPOSITION_KEY, PARENT_TASK_KEY};
use crate::infrastructure::event_bus::EventBus;

/// Outcome of a rejection: the rejected record plus what the source's scope
/// behavior wants to do next with the task.
#[derive(Debug, Clone, Serialize)]
pub struct RejectOutcome {
    pub delegation: Delegation,
    pub fallback: ScopeAction,
}

/// One unit of work split off by `decompose`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Explicit child instance; routed when absent.
    #[serde(default)]
    pub target_instance_id: Option<InstanceId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decomposition {
    pub decomposition_id: DecompositionId,
    pub parent: Task,
    pub subtasks: Vec<Task>,
    pub delegations: Vec<Delegation>,
}

pub struct Delegator {
    instances: Arc<dyn InstanceRepository>,
    tasks: Arc<dyn TaskRepository>,
    delegations: Arc<dyn DelegationRepository>,
    locks: Arc<dyn TaskLocks>,
    decisions: DecisionInputs,
    router: Arc<dyn RoutingStrategy>,
    bubbler: Arc<CompletionBubbler>,
    event_bus: Arc<EventBus>,
    config: DelegationConfig,
    retry: ReadRetry,
}

impl Delegator {
    pub fn new(
        repos: &Repositories,
        bubbler: Arc<CompletionBubbler>,
        event_bus: Arc<EventBus>,
        config: DelegationConfig,
    ) -> Self {
        let retry = ReadRetry::default();
        Self {
            instances: repos.instances.clone(),
            tasks: repos.tasks.clone(),
            delegations: repos.delegations.clone(),
            locks: repos.locks.clone(),
            decisions: DecisionInputs::new(
                repos.instances.clone(),
                repos.tasks.clone(),
                repos.delegations.clone(),
                retry,
            ),
            router: Arc::new(CapabilityRouter::new()),
            bubbler,
            event_bus,
            config,
            retry,
        }
    }

    pub fn with_router(mut self, router: Arc<dyn RoutingStrategy>) -> Self {
        self.router = router;
        self
    }

    pub fn with_retry(mut self, retry: ReadRetry) -> Self {
        self.retry = retry;
        self.decisions = DecisionInputs::new(
            self.instances.clone(),
            self.tasks.clone(),
            self.delegations.clone(),
            retry,
        );
        self
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub async fn get(&self, id: DelegationId) -> Result<Delegation, CoordinationError> {
        self.retry
            .run("delegation by id", || self.delegations.find_by_id(id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("delegation", id))
    }

    /// All delegations of a task, oldest first.
    pub async fn find_chain(&self, task_id: TaskId) -> Result<Vec<Delegation>, CoordinationError> {
        self.load_task(task_id).await?;
        self.retry
            .run("delegation chain", || self.delegations.find_by_task(task_id))
            .await
    }

    /// Full delegation history, oldest first. Read-only.
    pub async fn export_history(&self) -> Result<Vec<Delegation>, CoordinationError> {
        let history = self
            .retry
            .run("delegation history", || self.delegations.list_all())
            .await?;
        debug!("Exporting {} delegation records", history.len());
        Ok(history)
    }

    async fn load_task(&self, id: TaskId) -> Result<Task, CoordinationError> {
        self.retry
            .run("task by id", || self.tasks.find_by_id(id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("task", id))
    }

    async fn load_instance(&self, id: InstanceId) -> Result<Instance, CoordinationError> {
        self.retry
            .run("instance by id", || self.instances.find_by_id(id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("instance", id))
    }

    async fn chain_head(&self, task_id: TaskId) -> Result<Option<Delegation>, CoordinationError> {
        self.retry
            .run("open delegation", || self.delegations.find_open_for_task(task_id))
            .await
    }

    fn ensure_open_task(task: &Task, action: &'static str) -> Result<(), CoordinationError> {
        if task.status.is_terminal() {
            return Err(CoordinationError::InvalidTransition {
                entity: "task",
                id: task.id.to_string(),
                action,
                current: task.status.to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_no_pending(&self, task: &Task) -> Result<(), CoordinationError> {
        if let Some(head) = self.chain_head(task.id).await? {
            if head.is_pending() {
                return Err(CoordinationError::InvalidDelegation(format!(
                    "task {} already has pending delegation {} to {}",
                    task.id, head.id, head.target_instance_id
                )));
            }
        }
        Ok(())
    }

    /// Downward handoff checks shared by ROUTE and DECOMPOSE.
    async fn check_downward(&self, source: &Instance, target: &Instance) -> Result<(), CoordinationError> {
        if !source.scope.is_direct_parent_of(target.scope) || target.parent_id != Some(source.id) {
            return Err(CoordinationError::InvalidDelegation(format!(
                "{} {} cannot delegate to {} {}: target must be a direct child",
                source.scope, source.name, target.scope, target.name
            )));
        }
        if !target.is_running() {
            return Err(CoordinationError::InvalidDelegation(format!(
                "target instance {} is {}",
                target.id, target.status
            )));
        }
        let load = self.decisions.load_of(target.id).await?;
        if !ScopePolicy::for_instance(target).capacity_available(target, load) {
            return Err(CoordinationError::CapacityExceeded(format!(
                "instance {} is at capacity with {} open tasks",
                target.id, load
            )));
        }
        Ok(())
    }

    /// Persist a new delegation, accepting it on the spot when the target
    /// scope is configured to auto-accept.
    async fn commit_new(
        &self,
        mut delegation: Delegation,
        task: &mut Task,
        target: &Instance,
    ) -> Result<Delegation, CoordinationError> {
        let auto_accepted = self.prepare_new(&mut delegation, task, target)?;
        self.delegations.save_with_task(&delegation, task).await?;
        self.announce_new(&delegation, auto_accepted);
        Ok(delegation)
    }

    /// Apply auto-accept for the target's scope. Returns whether it applied.
    fn prepare_new(
        &self,
        delegation: &mut Delegation,
        task: &mut Task,
        target: &Instance,
    ) -> Result<bool, CoordinationError> {
        if !self.config.auto_accepts(target.scope) {
            return Ok(false);
        }
        delegation.accept()?;
        task.transfer_to(delegation.target_instance_id);
        Ok(true)
    }

    fn announce_new(&self, delegation: &Delegation, auto_accepted: bool) {
        info!(
            "Delegated task {} from {} to {} ({}, {})",
            delegation.task_id,
            delegation.source_instance_id,
            delegation.target_instance_id,
            delegation.delegation_type,
            delegation.status
        );
        metrics::counter!("canopy_delegations_total", "type" => delegation.delegation_type.as_str()).increment(1);

        self.event_bus
            .publish_delegation_event(DelegationEvent::DelegationCreated {
                delegation: delegation.clone(),
            });
        if auto_accepted {
            metrics::counter!("canopy_delegation_transitions_total", "to" => "ACCEPTED").increment(1);
            self.event_bus
                .publish_delegation_event(DelegationEvent::DelegationAccepted {
                    delegation: delegation.clone(),
                });
        }
    }

    /// Create a ROUTE delegation from the task's current owner to `target_id`.
    /// Ownership does not move until the delegation is accepted.
    pub async fn delegate(&self, task_id: TaskId, target_id: InstanceId) -> Result<Delegation, CoordinationError> {
        let _guard = self.locks.lock(task_id).await?;
        let mut task = self.load_task(task_id).await?;
        Self::ensure_open_task(&task, "delegate")?;
        self.ensure_no_pending(&task).await?;

        let source = self.load_instance(task.instance_id).await?;
        let target = self.load_instance(target_id).await?;
        self.check_downward(&source, &target).await?;

        let delegation = Delegation::new(task.id, source.id, target.id, DelegationType::Route);
        self.commit_new(delegation, &mut task, &target).await
    }

    /// PENDING → ACCEPTED; the task moves to the target in the same write.
    pub async fn accept(&self, delegation_id: DelegationId) -> Result<Delegation, CoordinationError> {
        let task_id = self.get(delegation_id).await?.task_id;
        let _guard = self.locks.lock(task_id).await?;

        let mut delegation = self.get(delegation_id).await?;
        let mut task = self.load_task(task_id).await?;
        delegation.accept()?;
        Self::ensure_open_task(&task, "accept delegation of")?;
        let target = self.load_instance(delegation.target_instance_id).await?;
        if target.status.is_terminated() {
            return Err(CoordinationError::InvalidDelegation(format!(
                "target instance {} is terminated",
                target.id
            )));
        }

        task.transfer_to(delegation.target_instance_id);
        self.delegations.save_with_task(&delegation, &task).await?;

        info!(
            "Delegation {} accepted, task {} now owned by {}",
            delegation.id, task.id, task.instance_id
        );
        metrics::counter!("canopy_delegation_transitions_total", "to" => "ACCEPTED").increment(1);
        self.event_bus
            .publish_delegation_event(DelegationEvent::DelegationAccepted {
                delegation: delegation.clone(),
            });
        Ok(delegation)
    }

    async fn reject_locked(
        &self,
        delegation_id: DelegationId,
        reason: &str,
    ) -> Result<RejectOutcome, CoordinationError> {
        let mut delegation = self.get(delegation_id).await?;
        delegation.reject(reason)?;
        self.delegations.save(&delegation).await?;

        info!(
            "Delegation {} rejected by {}: {}",
            delegation.id, delegation.target_instance_id, reason
        );
        metrics::counter!("canopy_delegation_transitions_total", "to" => "REJECTED").increment(1);
        self.event_bus
            .publish_delegation_event(DelegationEvent::DelegationRejected {
                delegation: delegation.clone(),
                reason: reason.to_string(),
            });

        // the rejection is committed; a failed re-decision only loses the hint
        let fallback = match self.fallback_for(&delegation).await {
            Ok(action) => action,
            Err(e) => {
                warn!(
                    "Fallback decision for rejected delegation {} failed: {}",
                    delegation.id, e
                );
                ScopeAction::Reject {
                    reason: format!("routing failure: {}", e),
                }
            }
        };
        Ok(RejectOutcome { delegation, fallback })
    }

    /// Ownership never moved, so the source decides again without the target.
    async fn fallback_for(&self, delegation: &Delegation) -> Result<ScopeAction, CoordinationError> {
        let task = self.load_task(delegation.task_id).await?;
        let source = self.load_instance(delegation.source_instance_id).await?;
        let (fallback, _) = self
            .decisions
            .decide(&task, &source, &[delegation.target_instance_id])
            .await?;
        Ok(fallback)
    }

    /// PENDING → REJECTED. The task stays with the source.
    pub async fn reject(&self, delegation_id: DelegationId, reason: &str) -> Result<RejectOutcome, CoordinationError> {
        let task_id = self.get(delegation_id).await?.task_id;
        let _guard = self.locks.lock(task_id).await?;
        self.reject_locked(delegation_id, reason).await
    }

    /// Auto-reject a delegation that outlived the acceptance window. Returns
    /// `None` when it was accepted or rejected in the meantime.
    pub async fn expire(&self, delegation_id: DelegationId) -> Result<Option<RejectOutcome>, CoordinationError> {
        let delegation = self.get(delegation_id).await?;
        let _guard = self.locks.lock(delegation.task_id).await?;
        let current = self.get(delegation_id).await?;
        if !current.is_pending() {
            debug!("Delegation {} is {} and no longer expires", current.id, current.status);
            return Ok(None);
        }

        let expired = CoordinationError::TimeoutExpired(format!(
            "delegation {} to {} pending for {}s",
            current.id,
            current.target_instance_id,
            current.pending_for(chrono::Utc::now())
        ));
        warn!("{}", expired);
        metrics::counter!("canopy_delegation_timeouts_total").increment(1);
        self.reject_locked(delegation_id, TIMEOUT_REASON).await.map(Some)
    }

    /// Reject every PENDING delegation aimed at `instance_id`.
    pub async fn reject_pending_targeting(
        &self,
        instance_id: InstanceId,
        reason: &str,
    ) -> Result<Vec<RejectOutcome>, CoordinationError> {
        let pending = self
            .retry
            .run("pending delegations", || self.delegations.find_pending_by_target(instance_id))
            .await?;

        let mut outcomes = Vec::with_capacity(pending.len());
        for delegation in pending {
            let _guard = self.locks.lock(delegation.task_id).await?;
            if !self.get(delegation.id).await?.is_pending() {
                continue;
            }
            outcomes.push(self.reject_locked(delegation.id, reason).await?);
        }
        if !outcomes.is_empty() {
            warn!(
                "Rejected {} pending delegations targeting {}: {}",
                outcomes.len(),
                instance_id,
                reason
            );
        }
        Ok(outcomes)
    }

    /// ACCEPTED chain head → COMPLETED. Marks the task DONE (or CANCELLED
    /// when `result.status` says so), then bubbles.
    pub async fn complete(
        &self,
        delegation_id: DelegationId,
        result: Map<String, Value>,
    ) -> Result<(Delegation, BubbleReport), CoordinationError> {
        let task_id = self.get(delegation_id).await?.task_id;
        let delegation = {
            let _guard = self.locks.lock(task_id).await?;
            let mut delegation = self.get(delegation_id).await?;
            if !delegation.is_accepted() {
                return Err(CoordinationError::InvalidTransition {
                    entity: "delegation",
                    id: delegation.id.to_string(),
                    action: "complete",
                    current: delegation.status.to_string(),
                });
            }
            if let Some(head) = self.chain_head(task_id).await? {
                if head.id != delegation.id {
                    return Err(CoordinationError::InvalidDelegation(format!(
                        "delegation {} is not the current location of task {}; complete {} instead",
                        delegation.id, task_id, head.id
                    )));
                }
            }

            let mut task = self.load_task(task_id).await?;
            if !task.status.is_terminal() {
                task.set_status(terminal_status_from(&result))?;
            }
            delegation.complete(result)?;
            let completion = self.bubbler.notify_parent(&task, &delegation).await?;
            delegation.notes.push(completion.summary.clone());
            self.delegations.save_with_task(&delegation, &task).await?;

            info!(
                "Delegation {} completed, task {} is {}",
                delegation.id, task.id, task.status
            );
            self.bubbler.publish_completion(&delegation, &completion);
            delegation
        };

        let report = self.bubbler.bubble(task_id).await?;
        Ok((delegation, report))
    }

    /// Hand the task back up to its owner's parent as a new ESCALATE record,
    /// accepted immediately.
    pub async fn escalate(&self, task_id: TaskId, reason: &str) -> Result<Delegation, CoordinationError> {
        let _guard = self.locks.lock(task_id).await?;
        let mut task = self.load_task(task_id).await?;
        Self::ensure_open_task(&task, "escalate")?;
        self.ensure_no_pending(&task).await?;

        let owner = self.load_instance(task.instance_id).await?;
        let parent_id = owner.parent_id.ok_or_else(|| {
            CoordinationError::InvalidDelegation(format!(
                "{} instance {} has no parent to escalate to",
                owner.scope, owner.id
            ))
        })?;
        let parent = self.load_instance(parent_id).await?;
        if parent.status.is_terminated() {
            return Err(CoordinationError::InvalidDelegation(format!(
                "parent instance {} is terminated",
                parent.id
            )));
        }

        let mut delegation = Delegation::new(task.id, owner.id, parent.id, DelegationType::Escalate)
            .with_note(format!("escalated: {}", reason));
        delegation.accept()?;
        task.transfer_to(parent.id);
        task.set_status(TaskStatus::Pending)?;
        self.delegations.save_with_task(&delegation, &task).await?;

        info!(
            "Task {} escalated from {} to {}: {}",
            task.id, owner.id, parent.id, reason
        );
        metrics::counter!("canopy_delegations_total", "type" => "ESCALATE").increment(1);
        self.event_bus
            .publish_delegation_event(DelegationEvent::TaskEscalated {
                delegation: delegation.clone(),
                reason: reason.to_string(),
            });
        Ok(delegation)
    }

    /// Split a task into subtasks, one DECOMPOSE delegation each, sharing a
    /// decomposition id. The parent task is BLOCKED until they all complete.
    pub async fn decompose(
        &self,
        task_id: TaskId,
        specs: Vec<SubtaskSpec>,
    ) -> Result<Decomposition, CoordinationError> {
        if specs.is_empty() {
            return Err(CoordinationError::InvalidInput(
                "decomposition needs at least one subtask".to_string(),
            ));
        }
        let _guard = self.locks.lock(task_id).await?;
        let mut parent = self.load_task(task_id).await?;
        Self::ensure_open_task(&parent, "decompose")?;
        self.ensure_no_pending(&parent).await?;
        if parent.decomposition().is_some() {
            return Err(CoordinationError::InvalidDelegation(format!(
                "task {} is already decomposed or is itself a subtask",
                parent.id
            )));
        }

        let owner = self.load_instance(parent.instance_id).await?;
        if owner.scope.child().is_none() {
            return Err(CoordinationError::InvalidDelegation(format!(
                "{} instance {} has no child scope to decompose into",
                owner.scope, owner.id
            )));
        }
        let children: Vec<Instance> = self
            .decisions
            .live_children(&owner)
            .await?
            .into_iter()
            .filter(Instance::is_running)
            .collect();
        let mut load = self.decisions.load_snapshot(&children).await?;

        let decomposition_id = DecompositionId::new();
        let mut planned = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut metadata = Map::new();
            metadata.insert(PARENT_TASK_KEY.into(), json!(parent.id.to_string()));
            metadata.insert(DECOMPOSITION_KEY.into(), json!(decomposition_id.to_string()));
            let subtask = Task::new(owner.id, spec.title, spec.description, spec.tags, spec.priority, metadata)?;

            let target = match spec.target_instance_id {
                Some(id) => {
                    let target = self.load_instance(id).await?;
                    self.check_downward(&owner, &target).await?;
                    target
                }
                None => {
                    let ranked = self.router.rank(&subtask, &children, &load);
                    let mut chosen = None;
                    for candidate in ranked {
                        let queued = load.get(&candidate.id).copied().unwrap_or(0);
                        if ScopePolicy::for_instance(&candidate).capacity_available(&candidate, queued) {
                            chosen = Some(candidate);
                            break;
                        }
                    }
                    chosen.ok_or_else(|| {
                        CoordinationError::RoutingFailure(format!(
                            "no running {} child of {} can take subtask '{}'",
                            owner.scope.child().map(|s| s.as_str()).unwrap_or("child"),
                            owner.name,
                            subtask.title
                        ))
                    })?
                }
            };
            *load.entry(target.id).or_insert(0) += 1;
            planned.push((subtask, target));
        }

        let mut subtasks = Vec::with_capacity(planned.len());
        let mut delegations = Vec::with_capacity(planned.len());
        let mut auto_accepted = Vec::with_capacity(planned.len());
        for (mut subtask, target) in planned {
            let mut delegation = Delegation::new(subtask.id, owner.id, target.id, DelegationType::Decompose)
                .with_decomposition(decomposition_id);
            auto_accepted.push(self.prepare_new(&mut delegation, &mut subtask, &target)?);
            subtasks.push(subtask);
            delegations.push(delegation);
        }

        parent
            .metadata
            .insert(DECOMPOSITION_KEY.into(), json!(decomposition_id.to_string()));
        parent.set_status(TaskStatus::Blocked)?;
        self.delegations
            .save_decomposition(&parent, &subtasks, &delegations)
            .await?;

        for (delegation, accepted) in delegations.iter().zip(auto_accepted) {
            self.announce_new(delegation, accepted);
        }

        info!(
            "Task {} decomposed into {} subtasks ({})",
            parent.id,
            subtasks.len(),
            decomposition_id
        );
        self.event_bus.publish_delegation_event(DelegationEvent::TaskDecomposed {
            task_id: parent.id,
            decomposition_id,
            subtasks: subtasks.iter().map(|t| t.id).collect(),
            decomposed_at: chrono::Utc::now(),
        });

        Ok(Decomposition {
            decomposition_id,
            parent,
            subtasks,
            delegations,
        })
    }
}

fn terminal_status_from(result: &Map<String, Value>) -> TaskStatus {
    match result.get("status").and_then(Value::as_str) {
        Some(s) if s.eq_ignore_ascii_case("cancelled") => TaskStatus::Cancelled,
        _ => TaskStatus::Done,
    }
}
