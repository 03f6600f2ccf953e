// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresInstanceRepository** - instance records and parent edges
//! - **PostgresTaskRepository** - tasks and their owning instance
//! - **PostgresDelegationRepository** - delegation chains, transactional
//!   `save_with_task`
//!
//! ## In-Memory Store
//!
//! [`InMemoryStore`] keeps all three tables behind one lock so that
//! `save_with_task` is atomic. Its views ([`InMemoryStore::instances`],
//! [`InMemoryStore::tasks`], [`InMemoryStore::delegations`]) implement the
//! repository traits. It also counts writes, which tests use to check that
//! re-running an idempotent operation touches nothing.

pub mod postgres_delegation;
pub mod postgres_instance;
pub mod postgres_task;

pub use postgres_delegation::PostgresDelegationRepository;
pub use postgres_instance::PostgresInstanceRepository;
pub use postgres_task::PostgresTaskRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::delegation::{DecompositionId, Delegation, DelegationId, DelegationStatus};
use crate::domain::instance::{Instance, InstanceId, InstanceStatus, Scope};
use crate::domain::repository::{
    DelegationRepository, InstanceRepository, RepositoryError, TaskRepository,
};
use crate::domain::task::{Task, TaskId};

#[derive(Default)]
struct Tables {
    instances: HashMap<InstanceId, Instance>,
    instances_by_parent: HashMap<InstanceId, HashSet<InstanceId>>,
    instances_by_scope_status: HashMap<(Scope, InstanceStatus), HashSet<InstanceId>>,

    tasks: HashMap<TaskId, Task>,
    tasks_by_instance: HashMap<InstanceId, HashSet<TaskId>>,

    delegations: HashMap<DelegationId, Delegation>,
    chains: HashMap<TaskId, Vec<DelegationId>>,
    decompositions: HashMap<DecompositionId, Vec<DelegationId>>,
}

impl Tables {
    fn put_instance(&mut self, instance: &Instance) {
        if let Some(old) = self.instances.get(&instance.id) {
            if let Some(parent) = old.parent_id {
                if let Some(set) = self.instances_by_parent.get_mut(&parent) {
                    set.remove(&old.id);
                }
            }
            if let Some(set) = self.instances_by_scope_status.get_mut(&(old.scope, old.status)) {
                set.remove(&old.id);
            }
        }
        if let Some(parent) = instance.parent_id {
            self.instances_by_parent.entry(parent).or_default().insert(instance.id);
        }
        self.instances_by_scope_status
            .entry((instance.scope, instance.status))
            .or_default()
            .insert(instance.id);
        self.instances.insert(instance.id, instance.clone());
    }

    fn put_task(&mut self, task: &Task) {
        if let Some(old) = self.tasks.get(&task.id) {
            if let Some(set) = self.tasks_by_instance.get_mut(&old.instance_id) {
                set.remove(&old.id);
            }
        }
        self.tasks_by_instance.entry(task.instance_id).or_default().insert(task.id);
        self.tasks.insert(task.id, task.clone());
    }

    fn put_delegation(&mut self, delegation: &Delegation) {
        if !self.delegations.contains_key(&delegation.id) {
            self.chains.entry(delegation.task_id).or_default().push(delegation.id);
            if let Some(decomposition) = delegation.decomposition_id {
                self.decompositions.entry(decomposition).or_default().push(delegation.id);
            }
        }
        self.delegations.insert(delegation.id, delegation.clone());
    }

    fn chain(&self, task_id: TaskId) -> Vec<Delegation> {
        let mut chain: Vec<Delegation> = self
            .chains
            .get(&task_id)
            .map(|ids| ids.iter().filter_map(|id| self.delegations.get(id).cloned()).collect())
            .unwrap_or_default();
        // stable: insertion order breaks delegated_at ties
        chain.sort_by_key(|d| d.delegated_at);
        chain
    }

    fn sorted_instances(&self, ids: impl Iterator<Item = InstanceId>) -> Vec<Instance> {
        let mut out: Vec<Instance> = ids.filter_map(|id| self.instances.get(&id).cloned()).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

/// Shared in-memory backing store for all three repositories.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    writes: Arc<AtomicU64>,
    failing_reads: Arc<AtomicU32>,
    reads_before_fault: Arc<AtomicU32>,
    failing_writes: Arc<AtomicU32>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instances(&self) -> InMemoryInstanceRepository {
        InMemoryInstanceRepository { store: self.clone() }
    }

    pub fn tasks(&self) -> InMemoryTaskRepository {
        InMemoryTaskRepository { store: self.clone() }
    }

    pub fn delegations(&self) -> InMemoryDelegationRepository {
        InMemoryDelegationRepository { store: self.clone() }
    }

    /// Number of write calls served since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` reads fail with a database error (fault injection).
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads_after(0, n);
    }

    /// Let `skip` reads through, then fail the `n` after them.
    pub fn fail_reads_after(&self, skip: u32, n: u32) {
        self.reads_before_fault.store(skip, Ordering::SeqCst);
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` task or delegation writes fail with a database error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), RepositoryError> {
        if self.failing_reads.load(Ordering::SeqCst) > 0
            && self
                .reads_before_fault
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Ok(());
        }
        Self::take_fault(&self.failing_reads, "injected read failure")
    }

    fn check_write(&self) -> Result<(), RepositoryError> {
        Self::take_fault(&self.failing_writes, "injected write failure")
    }

    fn take_fault(counter: &AtomicU32, message: &str) -> Result<(), RepositoryError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(RepositoryError::Database(message.to_string())),
            Err(_) => Ok(()),
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct InMemoryInstanceRepository {
    store: InMemoryStore,
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn save(&self, instance: &Instance) -> Result<(), RepositoryError> {
        let mut tables = self.store.tables.write();
        if instance.scope == Scope::Global && instance.is_live() {
            let other_live = tables
                .instances_by_scope_status
                .iter()
                .filter(|((scope, status), _)| *scope == Scope::Global && !status.is_terminated())
                .flat_map(|(_, ids)| ids.iter())
                .any(|id| *id != instance.id);
            if other_live {
                return Err(RepositoryError::Conflict {
                    constraint: "instances_single_live_global".to_string(),
                    message: "a live GLOBAL instance already exists".to_string(),
                });
            }
        }
        tables.put_instance(instance);
        self.store.record_write();
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>, RepositoryError> {
        self.store.check_read()?;
        Ok(self.store.tables.read().instances.get(&id).cloned())
    }

    async fn find_by_parent(&self, parent_id: InstanceId) -> Result<Vec<Instance>, RepositoryError> {
        self.store.check_read()?;
        let tables = self.store.tables.read();
        let ids = tables
            .instances_by_parent
            .get(&parent_id)
            .map(|set| set.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(tables.sorted_instances(ids.into_iter()))
    }

    async fn find_by_scope(
        &self,
        scope: Scope,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>, RepositoryError> {
        self.store.check_read()?;
        let tables = self.store.tables.read();
        let ids: Vec<InstanceId> = tables
            .instances_by_scope_status
            .iter()
            .filter(|((s, st), _)| *s == scope && status.map_or(true, |wanted| wanted == *st))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        Ok(tables.sorted_instances(ids.into_iter()))
    }

    async fn list_all(&self) -> Result<Vec<Instance>, RepositoryError> {
        self.store.check_read()?;
        let tables = self.store.tables.read();
        Ok(tables.sorted_instances(tables.instances.keys().copied()))
    }
}

#[derive(Clone)]
pub struct InMemoryTaskRepository {
    store: InMemoryStore,
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &Task) -> Result<(), RepositoryError> {
        self.store.check_write()?;
        self.store.tables.write().put_task(task);
        self.store.record_write();
        Ok(())
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, RepositoryError> {
        self.store.check_read()?;
        Ok(self.store.tables.read().tasks.get(&id).cloned())
    }

    async fn find_by_instance(&self, instance_id: InstanceId) -> Result<Vec<Task>, RepositoryError> {
        self.store.check_read()?;
        let tables = self.store.tables.read();
        let mut tasks: Vec<Task> = tables
            .tasks_by_instance
            .get(&instance_id)
            .map(|ids| ids.iter().filter_map(|id| tables.tasks.get(id).cloned()).collect())
            .unwrap_or_default();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn count_open_by_instance(&self, instance_id: InstanceId) -> Result<usize, RepositoryError> {
        self.store.check_read()?;
        let tables = self.store.tables.read();
        Ok(tables
            .tasks_by_instance
            .get(&instance_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.tasks.get(id))
                    .filter(|t| t.status.is_open())
                    .count()
            })
            .unwrap_or(0))
    }

    async fn list_all(&self) -> Result<Vec<Task>, RepositoryError> {
        self.store.check_read()?;
        let mut tasks: Vec<Task> = self.store.tables.read().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[derive(Clone)]
pub struct InMemoryDelegationRepository {
    store: InMemoryStore,
}

impl InMemoryDelegationRepository {
    fn check_single_pending(tables: &Tables, delegation: &Delegation) -> Result<(), RepositoryError> {
        if delegation.status != DelegationStatus::Pending {
            return Ok(());
        }
        let clash = tables
            .chain(delegation.task_id)
            .iter()
            .any(|d| d.id != delegation.id && d.status == DelegationStatus::Pending);
        if clash {
            return Err(RepositoryError::Conflict {
                constraint: "delegations_one_pending_per_task".to_string(),
                message: format!("task {} already has a pending delegation", delegation.task_id),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DelegationRepository for InMemoryDelegationRepository {
    async fn save(&self, delegation: &Delegation) -> Result<(), RepositoryError> {
        self.store.check_write()?;
        let mut tables = self.store.tables.write();
        Self::check_single_pending(&tables, delegation)?;
        tables.put_delegation(delegation);
        self.store.record_write();
        Ok(())
    }

    async fn save_with_task(&self, delegation: &Delegation, task: &Task) -> Result<(), RepositoryError> {
        self.store.check_write()?;
        let mut tables = self.store.tables.write();
        Self::check_single_pending(&tables, delegation)?;
        tables.put_delegation(delegation);
        tables.put_task(task);
        self.store.record_write();
        Ok(())
    }

    async fn save_decomposition(
        &self,
        parent: &Task,
        subtasks: &[Task],
        delegations: &[Delegation],
    ) -> Result<(), RepositoryError> {
        self.store.check_write()?;
        let mut tables = self.store.tables.write();
        for delegation in delegations {
            Self::check_single_pending(&tables, delegation)?;
        }
        for subtask in subtasks {
            tables.put_task(subtask);
        }
        for delegation in delegations {
            tables.put_delegation(delegation);
        }
        tables.put_task(parent);
        self.store.record_write();
        Ok(())
    }

    async fn find_by_id(&self, id: DelegationId) -> Result<Option<Delegation>, RepositoryError> {
        self.store.check_read()?;
        Ok(self.store.tables.read().delegations.get(&id).cloned())
    }

    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<Delegation>, RepositoryError> {
        self.store.check_read()?;
        Ok(self.store.tables.read().chain(task_id))
    }

    async fn find_open_for_task(&self, task_id: TaskId) -> Result<Option<Delegation>, RepositoryError> {
        self.store.check_read()?;
        Ok(self
            .store
            .tables
            .read()
            .chain(task_id)
            .into_iter()
            .rev()
            .find(|d| d.status.is_open()))
    }

    async fn find_pending_by_target(
        &self,
        target_instance_id: InstanceId,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        self.store.check_read()?;
        let mut out: Vec<Delegation> = self
            .store
            .tables
            .read()
            .delegations
            .values()
            .filter(|d| d.is_pending() && d.target_instance_id == target_instance_id)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.delegated_at);
        Ok(out)
    }

    async fn find_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        self.store.check_read()?;
        let mut out: Vec<Delegation> = self
            .store
            .tables
            .read()
            .delegations
            .values()
            .filter(|d| d.is_pending() && d.delegated_at < cutoff)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.delegated_at);
        Ok(out)
    }

    async fn find_by_decomposition(
        &self,
        decomposition_id: DecompositionId,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        self.store.check_read()?;
        let tables = self.store.tables.read();
        let mut out: Vec<Delegation> = tables
            .decompositions
            .get(&decomposition_id)
            .map(|ids| ids.iter().filter_map(|id| tables.delegations.get(id).cloned()).collect())
            .unwrap_or_default();
        out.sort_by_key(|d| d.delegated_at);
        Ok(out)
    }

    async fn list_all(&self) -> Result<Vec<Delegation>, RepositoryError> {
        self.store.check_read()?;
        let mut out: Vec<Delegation> = self.store.tables.read().delegations.values().cloned().collect();
        out.sort_by_key(|d| d.delegated_at);
        Ok(out)
    }
}
