// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the three aggregates. Interfaces live here,
//! implementations in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `InstanceRepository` | `Instance` | `InMemoryStore`, `PostgresInstanceRepository` |
//! | `TaskRepository` | `Task` | `InMemoryStore`, `PostgresTaskRepository` |
//! | `DelegationRepository` | `Delegation` | `InMemoryStore`, `PostgresDelegationRepository` |
//!
//! Every implementation must serve these lookups from an index: instance by
//! id, instances by parent, instances by scope + status, and the open head
//! delegation of a task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;

use crate::domain::delegation::{DecompositionId, Delegation, DelegationId};
use crate::domain::instance::{Instance, InstanceId, InstanceStatus, Scope};
use crate::domain::task::{Task, TaskId};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Save instance (create or update)
    async fn save(&self, instance: &Instance) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>, RepositoryError>;

    /// Direct children, oldest first.
    async fn find_by_parent(&self, parent_id: InstanceId) -> Result<Vec<Instance>, RepositoryError>;

    /// Instances of a scope, optionally narrowed to one status.
    async fn find_by_scope(
        &self,
        scope: Scope,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Instance>, RepositoryError>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Save task (create or update)
    async fn save(&self, task: &Task) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, RepositoryError>;

    /// Tasks currently owned by an instance.
    async fn find_by_instance(&self, instance_id: InstanceId) -> Result<Vec<Task>, RepositoryError>;

    /// Non-terminal tasks currently owned by an instance (its load).
    async fn count_open_by_instance(&self, instance_id: InstanceId) -> Result<usize, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Task>, RepositoryError>;
}

#[async_trait]
pub trait DelegationRepository: Send + Sync {
    /// Save delegation (create or update)
    async fn save(&self, delegation: &Delegation) -> Result<(), RepositoryError>;

    /// Save a delegation and the task it moves as one atomic unit.
    async fn save_with_task(&self, delegation: &Delegation, task: &Task) -> Result<(), RepositoryError>;

    /// Save a decomposed parent with all of its subtasks and their delegations as one atomic unit.
    async fn save_decomposition(
        &self,
        parent: &Task,
        subtasks: &[Task],
        delegations: &[Delegation],
    ) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: DelegationId) -> Result<Option<Delegation>, RepositoryError>;

    /// The task's chain, ordered by `delegated_at` ascending.
    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<Delegation>, RepositoryError>;

    /// Latest PENDING or ACCEPTED delegation of the task (the chain head).
    async fn find_open_for_task(&self, task_id: TaskId) -> Result<Option<Delegation>, RepositoryError>;

    async fn find_pending_by_target(
        &self,
        target_instance_id: InstanceId,
    ) -> Result<Vec<Delegation>, RepositoryError>;

    /// PENDING delegations created strictly before `cutoff`.
    async fn find_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Delegation>, RepositoryError>;

    async fn find_by_decomposition(
        &self,
        decomposition_id: DecompositionId,
    ) -> Result<Vec<Delegation>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Delegation>, RepositoryError>;
}

/// Held for the duration of one per-task operation. Dropping it releases
/// the underlying lock.
pub struct TaskLockGuard {
    _inner: Box<dyn Any + Send>,
}

impl TaskLockGuard {
    pub fn new<T: Send + 'static>(inner: T) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for TaskLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskLockGuard")
    }
}

/// Per-task mutual exclusion. `delegate`, `accept`, `reject` and `complete`
/// on the same task run under one of these guards.
#[async_trait]
pub trait TaskLocks: Send + Sync {
    async fn lock(&self, task_id: TaskId) -> Result<TaskLockGuard, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Constraint {constraint} violated: {message}")]
    Conflict { constraint: String, message: String },
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => RepositoryError::Conflict {
                constraint: db_err.constraint().unwrap_or("unique").to_string(),
                message: db_err.message().to_string(),
            },
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
