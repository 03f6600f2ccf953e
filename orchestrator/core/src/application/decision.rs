// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Assembles the repository-backed inputs of a scope decision.
//!
//! Scope behaviors and the router are pure; this is where their reads happen.

use std::sync::Arc;
use tracing::debug;

use crate::application::retry::ReadRetry;
use crate::domain::error::CoordinationError;
use crate::domain::instance::{Instance, InstanceId};
use crate::domain::repository::{DelegationRepository, InstanceRepository, TaskRepository};
use crate::domain::router::LoadSnapshot;
use crate::domain::scope_behavior::{DecisionContext, ScopeAction, ScopeBehavior, ScopePolicy};
use crate::domain::task::Task;

#[derive(Clone)]
pub struct DecisionInputs {
    instances: Arc<dyn InstanceRepository>,
    tasks: Arc<dyn TaskRepository>,
    delegations: Arc<dyn DelegationRepository>,
    retry: ReadRetry,
}

impl DecisionInputs {
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        tasks: Arc<dyn TaskRepository>,
        delegations: Arc<dyn DelegationRepository>,
        retry: ReadRetry,
    ) -> Self {
        Self {
            instances,
            tasks,
            delegations,
            retry,
        }
    }

    /// Work committed to an instance: open tasks it owns plus delegations
    /// still waiting for it to accept.
    pub async fn load_of(&self, instance_id: InstanceId) -> Result<usize, CoordinationError> {
        let open = self
            .retry
            .run("open tasks", || self.tasks.count_open_by_instance(instance_id))
            .await?;
        let pending = self
            .retry
            .run("pending delegations", || self.delegations.find_pending_by_target(instance_id))
            .await?;
        Ok(open + pending.len())
    }

    pub async fn load_snapshot(&self, candidates: &[Instance]) -> Result<LoadSnapshot, CoordinationError> {
        let mut snapshot = LoadSnapshot::with_capacity(candidates.len());
        for candidate in candidates {
            snapshot.insert(candidate.id, self.load_of(candidate.id).await?);
        }
        Ok(snapshot)
    }

    /// Non-terminated direct children of `instance`.
    pub async fn live_children(&self, instance: &Instance) -> Result<Vec<Instance>, CoordinationError> {
        let children = self
            .retry
            .run("instance children", || self.instances.find_by_parent(instance.id))
            .await?;
        Ok(children.into_iter().filter(Instance::is_live).collect())
    }

    pub async fn context_for(
        &self,
        task: &Task,
        instance: &Instance,
        excluded: &[InstanceId],
    ) -> Result<DecisionContext, CoordinationError> {
        let children = self.live_children(instance).await?;
        let mut own_load = self
            .retry
            .run("open tasks", || self.tasks.count_open_by_instance(instance.id))
            .await?;
        if task.instance_id == instance.id && task.status.is_open() {
            own_load = own_load.saturating_sub(1);
        }
        Ok(DecisionContext {
            children,
            own_load,
            excluded: excluded.to_vec(),
        })
    }

    /// Ask the instance's scope behavior what to do with the task.
    pub async fn decide(
        &self,
        task: &Task,
        instance: &Instance,
        excluded: &[InstanceId],
    ) -> Result<(ScopeAction, DecisionContext), CoordinationError> {
        let ctx = self.context_for(task, instance, excluded).await?;
        let action = ScopePolicy::for_instance(instance).decide(task, instance, &ctx);
        debug!(
            "{} instance {} decided {} for task {}",
            instance.scope,
            instance.id,
            action.name(),
            task.id
        );
        Ok((action, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delegation::{Delegation, DelegationType};
    use crate::domain::instance::{InstanceConfig, Scope};
    use crate::domain::task::TaskPriority;
    use crate::infrastructure::repositories::InMemoryStore;
    use serde_json::Map;

    fn inputs(store: &InMemoryStore) -> DecisionInputs {
        DecisionInputs::new(
            Arc::new(store.instances()),
            Arc::new(store.tasks()),
            Arc::new(store.delegations()),
            ReadRetry::none(),
        )
    }

    #[tokio::test]
    async fn test_context_excludes_task_under_decision_and_terminated_children() {
        let store = InMemoryStore::new();
        let p = Instance::new("p", Scope::Project, None, InstanceConfig::new()).unwrap();
        let o = Instance::new("o", Scope::Orchestration, Some(p.id), InstanceConfig::new()).unwrap();
        let mut gone = Instance::new("gone", Scope::Orchestration, Some(p.id), InstanceConfig::new()).unwrap();
        gone.mark_error("x");
        gone.terminate().unwrap();
        for i in [&p, &o, &gone] {
            store.instances().save(i).await.unwrap();
        }
        let t1 = Task::new(p.id, "a", "", Vec::new(), TaskPriority::Low, Map::new()).unwrap();
        let t2 = Task::new(p.id, "b", "", Vec::new(), TaskPriority::Low, Map::new()).unwrap();
        store.tasks().save(&t1).await.unwrap();
        store.tasks().save(&t2).await.unwrap();

        let ctx = inputs(&store).context_for(&t1, &p, &[o.id]).await.unwrap();
        assert_eq!(ctx.own_load, 1);
        assert_eq!(ctx.children.len(), 1);
        assert_eq!(ctx.excluded, vec![o.id]);
    }

    #[tokio::test]
    async fn test_load_counts_pending_delegations() {
        let store = InMemoryStore::new();
        let p = Instance::new("p", Scope::Project, None, InstanceConfig::new()).unwrap();
        let o = Instance::new("o", Scope::Orchestration, Some(p.id), InstanceConfig::new()).unwrap();
        store.instances().save(&p).await.unwrap();
        store.instances().save(&o).await.unwrap();
        let t = Task::new(p.id, "a", "", Vec::new(), TaskPriority::Low, Map::new()).unwrap();
        store.tasks().save(&t).await.unwrap();
        let d = Delegation::new(t.id, p.id, o.id, DelegationType::Route);
        store.delegations().save(&d).await.unwrap();

        let inputs = inputs(&store);
        assert_eq!(inputs.load_of(o.id).await.unwrap(), 1);
        let snapshot = inputs.load_snapshot(&[p.clone(), o.clone()]).await.unwrap();
        assert_eq!(snapshot.get(&p.id), Some(&1));
        assert_eq!(snapshot.get(&o.id), Some(&1));
    }
}
