// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Instance Registry
//!
//! Read-mostly cache and discovery layer over the instance repository.
//! The cache is refreshed from lifecycle events ([`InstanceRegistry::apply_event`])
//! or rebuilt wholesale ([`InstanceRegistry::rebuild`]); any miss falls
//! through to the repository, which stays the source of truth.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::application::retry::ReadRetry;
use crate::domain::error::CoordinationError;
use crate::domain::events::InstanceLifecycleEvent;
use crate::domain::instance::{Instance, InstanceId, InstanceStatus, Scope};
use crate::domain::repository::InstanceRepository;

/// One node of the instance tree with its descendants.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyNode {
    pub instance: Instance,
    pub children: Vec<HierarchyNode>,
}

impl HierarchyNode {
    /// Number of nodes in this subtree, including the root.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(HierarchyNode::size).sum::<usize>()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub total: usize,
    pub by_scope: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub global_instance: Option<InstanceId>,
    /// Instances currently in `Error`.
    pub errored: Vec<InstanceId>,
    /// Whether the cache holds the full instance set.
    pub cache_complete: bool,
}

#[derive(Default)]
struct RegistryCache {
    instances: HashMap<InstanceId, Instance>,
    children: HashMap<InstanceId, Vec<InstanceId>>,
    /// Set by `rebuild`; until then only point lookups are served from cache.
    complete: bool,
}

impl RegistryCache {
    fn upsert(&mut self, instance: Instance) {
        if let Some(previous) = self.instances.get(&instance.id) {
            if previous.parent_id != instance.parent_id {
                if let Some(old_parent) = previous.parent_id {
                    if let Some(siblings) = self.children.get_mut(&old_parent) {
                        siblings.retain(|id| *id != instance.id);
                    }
                }
            }
        }
        if let Some(parent_id) = instance.parent_id {
            let siblings = self.children.entry(parent_id).or_default();
            if !siblings.contains(&instance.id) {
                siblings.push(instance.id);
            }
        }
        self.instances.insert(instance.id, instance);
    }

    fn children_of(&self, id: InstanceId) -> Vec<Instance> {
        let mut children: Vec<Instance> = self
            .children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|child| self.instances.get(child).cloned())
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        children
    }
}

pub struct InstanceRegistry {
    instances: Arc<dyn InstanceRepository>,
    cache: RwLock<RegistryCache>,
    retry: ReadRetry,
}

impl InstanceRegistry {
    pub fn new(instances: Arc<dyn InstanceRepository>) -> Self {
        Self {
            instances,
            cache: RwLock::new(RegistryCache::default()),
            retry: ReadRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ReadRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Reload every instance from the repository.
    pub async fn rebuild(&self) -> Result<usize, CoordinationError> {
        let all = self.retry.run("all instances", || self.instances.list_all()).await?;
        let mut fresh = RegistryCache::default();
        for instance in all {
            fresh.upsert(instance);
        }
        fresh.complete = true;
        let count = fresh.instances.len();
        *self.cache.write() = fresh;
        debug!("Registry rebuilt with {} instances", count);
        Ok(count)
    }

    /// Refresh the cached copy of the instance carried by a lifecycle event.
    pub fn apply_event(&self, event: &InstanceLifecycleEvent) {
        let incoming = event.instance();
        let mut cache = self.cache.write();
        // events can arrive out of order across tasks; keep the newest write
        if let Some(cached) = cache.instances.get(&incoming.id) {
            if cached.updated_at > incoming.updated_at {
                return;
            }
        }
        cache.upsert(incoming.clone());
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().instances.len()
    }

    pub async fn get(&self, id: InstanceId) -> Result<Instance, CoordinationError> {
        if let Some(hit) = self.cache.read().instances.get(&id).cloned() {
            return Ok(hit);
        }
        let instance = self
            .retry
            .run("instance by id", || self.instances.find_by_id(id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("instance", id))?;
        self.cache.write().upsert(instance.clone());
        Ok(instance)
    }

    /// Direct children, oldest first.
    pub async fn children(&self, id: InstanceId) -> Result<Vec<Instance>, CoordinationError> {
        {
            let cache = self.cache.read();
            if cache.complete {
                return Ok(cache.children_of(id));
            }
        }
        let children = self
            .retry
            .run("instance children", || self.instances.find_by_parent(id))
            .await?;
        let mut cache = self.cache.write();
        for child in &children {
            cache.upsert(child.clone());
        }
        Ok(children)
    }

    /// Parent chain from the direct parent up to the root.
    pub async fn ancestors(&self, id: InstanceId) -> Result<Vec<Instance>, CoordinationError> {
        let mut current = self.get(id).await?;
        let mut ancestors = Vec::new();
        while let Some(parent_id) = current.parent_id {
            // the tree is at most three levels deep; anything longer is a cycle
            if ancestors.len() > 2 || parent_id == id {
                return Err(CoordinationError::InvalidHierarchy(format!(
                    "parent chain of {} does not terminate",
                    id
                )));
            }
            current = self.get(parent_id).await?;
            ancestors.push(current.clone());
        }
        Ok(ancestors)
    }

    /// The subtree rooted at `id`, built level by level.
    pub async fn hierarchy(&self, id: InstanceId) -> Result<HierarchyNode, CoordinationError> {
        let root = self.get(id).await?;
        let mut levels: HashMap<InstanceId, Vec<Instance>> = HashMap::new();
        let mut frontier = vec![root.id];
        while let Some(next) = frontier.pop() {
            let children = self.children(next).await?;
            frontier.extend(children.iter().map(|c| c.id));
            levels.insert(next, children);
        }
        Ok(assemble(root, &mut levels))
    }

    pub async fn find_by_scope(
        &self,
        scope: Scope,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>, CoordinationError> {
        {
            let cache = self.cache.read();
            if cache.complete {
                let mut found: Vec<Instance> = cache
                    .instances
                    .values()
                    .filter(|i| i.scope == scope && status.map_or(true, |s| i.status == s))
                    .cloned()
                    .collect();
                found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                return Ok(found);
            }
        }
        self.retry
            .run("instances by scope", || self.instances.find_by_scope(scope, status))
            .await
    }

    /// Aggregate view over all instances. Always reads the repository.
    pub async fn health(&self) -> Result<RegistryHealth, CoordinationError> {
        let all = self.retry.run("all instances", || self.instances.list_all()).await?;
        let mut by_scope = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        let mut errored = Vec::new();
        let mut global_instance = None;
        for instance in &all {
            *by_scope.entry(instance.scope.as_str().to_string()).or_insert(0) += 1;
            *by_status.entry(instance.status.as_str().to_string()).or_insert(0) += 1;
            if instance.status == InstanceStatus::Error {
                errored.push(instance.id);
            }
            if instance.scope == Scope::Global && instance.is_live() {
                global_instance = Some(instance.id);
            }
        }
        Ok(RegistryHealth {
            total: all.len(),
            by_scope,
            by_status,
            global_instance,
            errored,
            cache_complete: self.cache.read().complete,
        })
    }
}

fn assemble(instance: Instance, levels: &mut HashMap<InstanceId, Vec<Instance>>) -> HierarchyNode {
    let children = levels
        .remove(&instance.id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| assemble(child, levels))
        .collect();
    HierarchyNode { instance, children }
}
