// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Dispatch
//!
//! Runs a task through the hierarchy: the owner's scope behavior decides,
//! the router ranks children, the delegator hands off. The walk continues
//! while delegations are accepted immediately and stops at EXECUTE, QUEUE,
//! or a delegation waiting for its target.

use serde::Serialize;
use serde_json::Map;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::decision::DecisionInputs;
use crate::application::delegator::Delegator;
use crate::application::lifecycle::{CreateInstanceRequest, InstanceLifecycleManager};
use crate::application::repository_factory::Repositories;
use crate::application::retry::ReadRetry;
use crate::domain::delegation::Delegation;
use crate::domain::error::CoordinationError;
use crate::domain::instance::{Instance, InstanceId};
use crate::domain::repository::{DelegationRepository, InstanceRepository, TaskLocks, TaskRepository};
use crate::domain::router::{CapabilityRouter, RoutingStrategy};
use crate::domain::scope_behavior::ScopeAction;
use crate::domain::task::{Task, TaskId, TaskStatus};

/// Scope levels below GLOBAL; a dispatch never takes more handoffs than this.
const MAX_HOPS: usize = 2;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The owner runs the task itself; the task is IN_PROGRESS.
    Executed { instance: Instance },
    /// The task sits in an ORCHESTRATION queue.
    Queued { instance: Instance },
    /// Waiting for the target to accept.
    Pending { delegation: Delegation },
}

pub struct DispatchService {
    instances: Arc<dyn InstanceRepository>,
    tasks: Arc<dyn TaskRepository>,
    delegations: Arc<dyn DelegationRepository>,
    locks: Arc<dyn TaskLocks>,
    decisions: DecisionInputs,
    router: Arc<dyn RoutingStrategy>,
    delegator: Arc<Delegator>,
    lifecycle: Arc<InstanceLifecycleManager>,
    max_capacity_attempts: usize,
    retry: ReadRetry,
}

impl DispatchService {
    pub fn new(
        repos: &Repositories,
        delegator: Arc<Delegator>,
        lifecycle: Arc<InstanceLifecycleManager>,
    ) -> Self {
        let retry = ReadRetry::default();
        let max_capacity_attempts = delegator.config().max_capacity_attempts.max(1) as usize;
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
            delegator,
            lifecycle,
            max_capacity_attempts,
            retry,
        }
    }

    pub fn with_router(mut self, router: Arc<dyn RoutingStrategy>) -> Self {
        self.router = router;
        self
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

    pub async fn dispatch(&self, task_id: TaskId) -> Result<DispatchOutcome, CoordinationError> {
        self.redispatch(task_id, Vec::new()).await
    }

    /// Dispatch again after a rejection, never choosing `exclude` at the
    /// first hop.
    pub async fn redispatch(
        &self,
        task_id: TaskId,
        exclude: Vec<InstanceId>,
    ) -> Result<DispatchOutcome, CoordinationError> {
        let mut excluded = exclude;
        for _ in 0..=MAX_HOPS {
            let task = self.load_task(task_id).await?;
            if task.status.is_terminal() {
                return Err(CoordinationError::InvalidTransition {
                    entity: "task",
                    id: task.id.to_string(),
                    action: "dispatch",
                    current: task.status.to_string(),
                });
            }
            if let Some(head) = self
                .retry
                .run("open delegation", || self.delegations.find_open_for_task(task_id))
                .await?
            {
                if head.is_pending() {
                    return Ok(DispatchOutcome::Pending { delegation: head });
                }
            }

            let owner = self.load_instance(task.instance_id).await?;
            let (action, ctx) = self.decisions.decide(&task, &owner, &excluded).await?;
            match action {
                ScopeAction::Execute => return self.execute(task_id, owner).await,
                ScopeAction::Queue => {
                    info!("Task {} queued at {} ({})", task.id, owner.name, owner.id);
                    return Ok(DispatchOutcome::Queued { instance: owner });
                }
                ScopeAction::Reject { reason } => {
                    metrics::counter!("canopy_routing_failures_total").increment(1);
                    return Err(CoordinationError::RoutingFailure(reason));
                }
                ScopeAction::Delegate {
                    target_hint,
                    provision_child,
                } => {
                    let mut candidates: Vec<Instance> = ctx
                        .children
                        .into_iter()
                        .filter(|c| !excluded.contains(&c.id))
                        .collect();
                    if provision_child && !candidates.iter().any(Instance::is_running) {
                        candidates.push(self.provision_child(&owner, candidates.len()).await?);
                    }
                    let delegation = self.hand_off(&task, &owner, candidates, target_hint).await?;
                    if delegation.is_pending() {
                        return Ok(DispatchOutcome::Pending { delegation });
                    }
                    // accepted on the spot; the new owner decides next
                    excluded.clear();
                }
            }
        }
        Err(CoordinationError::RoutingFailure(format!(
            "task {} did not settle within {} handoffs",
            task_id,
            MAX_HOPS + 1
        )))
    }

    async fn execute(&self, task_id: TaskId, owner: Instance) -> Result<DispatchOutcome, CoordinationError> {
        let _guard = self.locks.lock(task_id).await?;
        let mut task = self.load_task(task_id).await?;
        if task.instance_id != owner.id {
            return Err(CoordinationError::InvalidDelegation(format!(
                "task {} moved to {} while dispatching",
                task.id, task.instance_id
            )));
        }
        task.set_status(TaskStatus::InProgress)?;
        self.tasks.save(&task).await?;
        info!("Task {} executing at {} ({})", task.id, owner.name, owner.id);
        Ok(DispatchOutcome::Executed { instance: owner })
    }

    /// Create and start a child one scope below `owner`.
    async fn provision_child(&self, owner: &Instance, existing: usize) -> Result<Instance, CoordinationError> {
        let scope = owner.scope.child().ok_or_else(|| {
            CoordinationError::RoutingFailure(format!("{} instance {} cannot have children", owner.scope, owner.id))
        })?;
        let name = format!("{}-{}-{}", owner.name, scope.as_str().to_ascii_lowercase(), existing + 1);
        info!("Provisioning {} child '{}' under {}", scope, name, owner.id);
        let created = self
            .lifecycle
            .create(CreateInstanceRequest {
                name,
                scope,
                parent_id: Some(owner.id),
                config: Map::new(),
            })
            .await?;
        self.lifecycle.start(created.id).await
    }

    /// Try ranked candidates until one takes the task. Capacity refusals
    /// fall through to the next candidate, up to the configured attempts.
    async fn hand_off(
        &self,
        task: &Task,
        owner: &Instance,
        candidates: Vec<Instance>,
        target_hint: Option<InstanceId>,
    ) -> Result<Delegation, CoordinationError> {
        let load = self.decisions.load_snapshot(&candidates).await?;
        let mut ranked = self.router.rank(task, &candidates, &load);
        if let Some(hint) = target_hint {
            if let Some(pos) = ranked.iter().position(|c| c.id == hint) {
                let pinned = ranked.remove(pos);
                ranked.insert(0, pinned);
            }
        }
        if ranked.is_empty() {
            metrics::counter!("canopy_routing_failures_total").increment(1);
            return Err(CoordinationError::RoutingFailure(format!(
                "{} {} has no running child for task {}",
                owner.scope, owner.name, task.id
            )));
        }
        debug!(
            "Router '{}' ranked {} candidates for task {}",
            self.router.name(),
            ranked.len(),
            task.id
        );

        let mut refused = 0;
        for candidate in ranked.into_iter().take(self.max_capacity_attempts) {
            match self.delegator.delegate(task.id, candidate.id).await {
                Ok(delegation) => return Ok(delegation),
                Err(CoordinationError::CapacityExceeded(reason)) => {
                    warn!("Candidate {} refused task {}: {}", candidate.id, task.id, reason);
                    refused += 1;
                }
                Err(other) => return Err(other),
            }
        }

        metrics::counter!("canopy_routing_failures_total").increment(1);
        Err(CoordinationError::RoutingFailure(format!(
            "{} candidate(s) under {} are at capacity for task {}",
            refused, owner.name, task.id
        )))
    }
}
