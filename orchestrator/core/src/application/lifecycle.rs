// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Instance Lifecycle Manager
//!
//! Owns the instance state machine and the hierarchy invariants:
//!
//! - at most one non-terminated GLOBAL instance
//! - a parent is exactly one scope above its child
//! - ORCHESTRATION instances always have a PROJECT parent; PROJECT instances
//!   may start unparented and be attached later with `assign_parent`
//!
//! Transition hooks run inside the same operation as the status write. A
//! failing hook leaves the instance in `Error`, never half-transitioned.
//! Transitions on one instance are serialized: each re-reads the instance
//! under a per-instance lock and holds it across its hooks.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::application::retry::ReadRetry;
use crate::domain::error::CoordinationError;
use crate::domain::events::InstanceLifecycleEvent;
use crate::domain::instance::{Instance, InstanceConfig, InstanceId, InstanceStatus, Scope};
use crate::domain::repository::InstanceRepository;
use crate::domain::scope_behavior::ScopeSettings;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::task_locks::KeyedLocks;

/// Resource allocation and cleanup around lifecycle transitions.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_start(&self, _instance: &Instance) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _instance: &Instance) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_terminate(&self, _instance: &Instance) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycleHooks;

impl LifecycleHooks for NoopLifecycleHooks {}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub scope: Scope,
    #[serde(default)]
    pub parent_id: Option<InstanceId>,
    #[serde(default)]
    pub config: InstanceConfig,
}

pub struct InstanceLifecycleManager {
    instances: Arc<dyn InstanceRepository>,
    hooks: Arc<dyn LifecycleHooks>,
    event_bus: Arc<EventBus>,
    retry: ReadRetry,
    // serializes GLOBAL creation in this process
    global_creation: Mutex<()>,
    transitions: KeyedLocks<InstanceId>,
}

impl InstanceLifecycleManager {
    pub fn new(instances: Arc<dyn InstanceRepository>, event_bus: Arc<EventBus>) -> Self {
        Self {
            instances,
            hooks: Arc::new(NoopLifecycleHooks),
            event_bus,
            retry: ReadRetry::default(),
            global_creation: Mutex::new(()),
            transitions: KeyedLocks::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_retry(mut self, retry: ReadRetry) -> Self {
        self.retry = retry;
        self
    }

    pub async fn get(&self, id: InstanceId) -> Result<Instance, CoordinationError> {
        self.retry
            .run("instance by id", || self.instances.find_by_id(id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("instance", id))
    }

    pub async fn list(
        &self,
        scope: Option<Scope>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>, CoordinationError> {
        match scope {
            Some(scope) => {
                self.retry
                    .run("instances by scope", || self.instances.find_by_scope(scope, status))
                    .await
            }
            None => {
                let all = self.retry.run("all instances", || self.instances.list_all()).await?;
                Ok(all
                    .into_iter()
                    .filter(|i| status.map_or(true, |s| i.status == s))
                    .collect())
            }
        }
    }

    /// Validate and persist a new instance in `Created`.
    pub async fn create(&self, request: CreateInstanceRequest) -> Result<Instance, CoordinationError> {
        ScopeSettings::parse(&request.config)?;
        let instance = Instance::new(request.name, request.scope, request.parent_id, request.config)?;

        if let Some(parent_id) = instance.parent_id {
            self.validate_parent(&instance, parent_id).await?;
        }

        if instance.scope == Scope::Global {
            let _guard = self.global_creation.lock().await;
            let live = self
                .retry
                .run("global instances", || self.instances.find_by_scope(Scope::Global, None))
                .await?
                .into_iter()
                .find(Instance::is_live);
            if let Some(existing) = live {
                return Err(CoordinationError::InvalidHierarchy(format!(
                    "GLOBAL instance {} ({}) is already live",
                    existing.name, existing.id
                )));
            }
            self.instances.save(&instance).await?;
        } else {
            self.instances.save(&instance).await?;
        }

        info!(
            "Created {} instance '{}' ({}) parent={:?}",
            instance.scope, instance.name, instance.id, instance.parent_id
        );
        metrics::counter!("canopy_instances_created_total", "scope" => instance.scope.as_str()).increment(1);
        self.event_bus
            .publish_instance_event(InstanceLifecycleEvent::InstanceCreated {
                instance: instance.clone(),
                created_at: instance.created_at,
            });
        Ok(instance)
    }

    async fn validate_parent(&self, instance: &Instance, parent_id: InstanceId) -> Result<Instance, CoordinationError> {
        if parent_id == instance.id {
            return Err(CoordinationError::InvalidHierarchy(
                "an instance cannot be its own parent".to_string(),
            ));
        }
        let parent = self
            .retry
            .run("parent instance", || self.instances.find_by_id(parent_id))
            .await?
            .ok_or_else(|| {
                CoordinationError::InvalidHierarchy(format!("parent instance {} does not exist", parent_id))
            })?;

        if !parent.scope.is_direct_parent_of(instance.scope) {
            return Err(CoordinationError::InvalidHierarchy(format!(
                "a {} instance cannot be the parent of a {} instance",
                parent.scope, instance.scope
            )));
        }
        if parent.status.is_terminated() {
            return Err(CoordinationError::InvalidHierarchy(format!(
                "parent instance {} is terminated",
                parent.id
            )));
        }
        Ok(parent)
    }

    /// Attach an unparented PROJECT to the GLOBAL instance.
    pub async fn assign_parent(
        &self,
        id: InstanceId,
        parent_id: InstanceId,
    ) -> Result<Instance, CoordinationError> {
        let _transition = self.transitions.lock(id).await;
        let mut instance = self.get(id).await?;
        if instance.status.is_terminated() {
            return Err(CoordinationError::InvalidTransition {
                entity: "instance",
                id: instance.id.to_string(),
                action: "assign parent to",
                current: instance.status.to_string(),
            });
        }
        if let Some(existing) = instance.parent_id {
            if existing == parent_id {
                return Ok(instance);
            }
            return Err(CoordinationError::InvalidHierarchy(format!(
                "instance {} already has parent {}",
                instance.id, existing
            )));
        }
        self.validate_parent(&instance, parent_id).await?;

        instance.parent_id = Some(parent_id);
        instance.updated_at = Utc::now();
        self.instances.save(&instance).await?;

        info!("Assigned parent {} to instance {}", parent_id, instance.id);
        self.event_bus
            .publish_instance_event(InstanceLifecycleEvent::ParentAssigned {
                instance: instance.clone(),
                parent_id,
                assigned_at: instance.updated_at,
            });
        Ok(instance)
    }

    async fn commit(&self, instance: &Instance, from: InstanceStatus) -> Result<(), CoordinationError> {
        self.instances.save(instance).await?;
        info!(
            "Instance '{}' ({}) {} -> {}",
            instance.name, instance.id, from, instance.status
        );
        metrics::counter!("canopy_instance_transitions_total", "to" => instance.status.as_str()).increment(1);
        self.event_bus
            .publish_instance_event(InstanceLifecycleEvent::InstanceStatusChanged {
                instance: instance.clone(),
                from,
                changed_at: instance.updated_at,
            });
        Ok(())
    }

    async fn fail_hook(
        &self,
        mut instance: Instance,
        hook: &str,
        err: anyhow::Error,
    ) -> Result<Instance, CoordinationError> {
        error!("{} hook failed for instance {}: {:#}", hook, instance.id, err);
        let from = instance.status;
        instance.mark_error(format!("{} hook failed: {}", hook, err));
        self.commit(&instance, from).await?;
        Ok(instance)
    }

    /// Created | Stopped → Starting → Running. A failed start hook leaves the
    /// instance in `Error` and returns it.
    pub async fn start(&self, id: InstanceId) -> Result<Instance, CoordinationError> {
        let _transition = self.transitions.lock(id).await;
        let mut instance = self.get(id).await?;
        let from = instance.status;
        instance.begin_start()?;
        self.commit(&instance, from).await?;

        if let Err(err) = self.hooks.on_start(&instance).await {
            return self.fail_hook(instance, "start", err).await;
        }

        instance.mark_running()?;
        self.commit(&instance, InstanceStatus::Starting).await?;
        Ok(instance)
    }

    /// Running | Paused → Stopping → Stopped.
    pub async fn stop(&self, id: InstanceId) -> Result<Instance, CoordinationError> {
        let _transition = self.transitions.lock(id).await;
        let mut instance = self.get(id).await?;
        let from = instance.status;
        instance.begin_stop()?;
        self.commit(&instance, from).await?;

        if let Err(err) = self.hooks.on_stop(&instance).await {
            return self.fail_hook(instance, "stop", err).await;
        }

        instance.mark_stopped()?;
        self.commit(&instance, InstanceStatus::Stopping).await?;
        Ok(instance)
    }

    pub async fn pause(&self, id: InstanceId) -> Result<Instance, CoordinationError> {
        let _transition = self.transitions.lock(id).await;
        let mut instance = self.get(id).await?;
        let from = instance.status;
        instance.pause()?;
        self.commit(&instance, from).await?;
        Ok(instance)
    }

    pub async fn resume(&self, id: InstanceId) -> Result<Instance, CoordinationError> {
        let _transition = self.transitions.lock(id).await;
        let mut instance = self.get(id).await?;
        let from = instance.status;
        instance.resume()?;
        self.commit(&instance, from).await?;
        Ok(instance)
    }

    /// Stopped | Error → Terminated. Irreversible.
    pub async fn terminate(&self, id: InstanceId) -> Result<Instance, CoordinationError> {
        let _transition = self.transitions.lock(id).await;
        let mut instance = self.get(id).await?;
        if !instance.status.can_terminate() {
            // surfaces the InvalidTransition with the current state
            instance.terminate()?;
        }

        if let Err(err) = self.hooks.on_terminate(&instance).await {
            if instance.status != InstanceStatus::Error {
                return self.fail_hook(instance, "terminate", err).await;
            }
            // already in Error: cleanup failure does not block termination
            error!("terminate hook failed for instance {}: {:#}", instance.id, err);
        }

        let from = instance.status;
        instance.terminate()?;
        self.commit(&instance, from).await?;
        debug!("Instance {} is now terminal", instance.id);
        Ok(instance)
    }
}
