// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations based on storage backend
//! configuration, keeping the domain layer free of infrastructure types.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Wire repositories and task locks for a storage backend

use anyhow::Result;
use std::sync::Arc;

use crate::domain::repository::{
    DelegationRepository, InstanceRepository, StorageBackend, TaskLocks, TaskRepository,
};
use crate::infrastructure::db::Database;
use crate::infrastructure::repositories::{
    InMemoryStore, PostgresDelegationRepository, PostgresInstanceRepository,
    PostgresTaskRepository,
};
use crate::infrastructure::task_locks::{InMemoryTaskLocks, PostgresTaskLocks};

/// Everything the application services need from storage.
#[derive(Clone)]
pub struct Repositories {
    pub instances: Arc<dyn InstanceRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub delegations: Arc<dyn DelegationRepository>,
    pub locks: Arc<dyn TaskLocks>,
}

impl Repositories {
    /// Repositories over one shared in-memory store.
    pub fn in_memory(store: &InMemoryStore) -> Self {
        Self {
            instances: Arc::new(store.instances()),
            tasks: Arc::new(store.tasks()),
            delegations: Arc::new(store.delegations()),
            locks: Arc::new(InMemoryTaskLocks::new()),
        }
    }

    pub fn postgres(database: &Database) -> Self {
        let pool = database.get_pool().clone();
        Self {
            instances: Arc::new(PostgresInstanceRepository::new(pool.clone())),
            tasks: Arc::new(PostgresTaskRepository::new(pool.clone())),
            delegations: Arc::new(PostgresDelegationRepository::new(pool.clone())),
            locks: Arc::new(PostgresTaskLocks::new(pool)),
        }
    }
}

/// Creates the repository set for the configured backend. PostgreSQL
/// requires a connected `Database`.
pub fn create_repositories(backend: &StorageBackend, database: Option<&Database>) -> Result<Repositories> {
    match (backend, database) {
        (StorageBackend::InMemory, _) => Ok(Repositories::in_memory(&InMemoryStore::new())),
        (StorageBackend::PostgreSQL(_), Some(database)) => Ok(Repositories::postgres(database)),
        (StorageBackend::PostgreSQL(_), None) => {
            anyhow::bail!("PostgreSQL backend selected but no database connection was provided")
        }
    }
}
