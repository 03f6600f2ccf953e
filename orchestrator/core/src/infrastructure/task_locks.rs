// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Per-task mutual exclusion.
//!
//! - [`KeyedLocks`]: one `tokio::sync::Mutex` per key, held as an owned guard
//!   for the length of the operation and dropped from the map on release.
//!   Also serializes instance lifecycle transitions.
//! - [`InMemoryTaskLocks`]: [`KeyedLocks`] over task ids.
//! - [`PostgresTaskLocks`]: session-level `pg_advisory_lock` keyed by the task
//!   id, so several coordinator processes sharing one database serialize too.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::domain::repository::{RepositoryError, TaskLockGuard, TaskLocks};
use crate::domain::task::TaskId;

/// Async mutexes keyed by id. An entry lives only while someone holds or
/// waits on it.
pub struct KeyedLocks<K: Eq + Hash> {
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            key,
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}

pub struct KeyedGuard<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // waiters hold their own clone, so a count of one means nobody is queued
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[derive(Default)]
pub struct InMemoryTaskLocks {
    locks: KeyedLocks<TaskId>,
}

impl InMemoryTaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task ids currently locked or waited on.
    pub fn tracked(&self) -> usize {
        self.locks.tracked()
    }
}

#[async_trait]
impl TaskLocks for InMemoryTaskLocks {
    async fn lock(&self, task_id: TaskId) -> Result<TaskLockGuard, RepositoryError> {
        Ok(TaskLockGuard::new(self.locks.lock(task_id).await))
    }
}

/// Advisory lock key derived from the first eight bytes of the task id.
pub fn advisory_key(task_id: TaskId) -> i64 {
    let bytes = task_id.0.as_bytes();
    let mut key = [0u8; 8];
    key.copy_from_slice(&bytes[..8]);
    i64::from_be_bytes(key)
}

pub struct PostgresTaskLocks {
    pool: PgPool,
}

impl PostgresTaskLocks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let key = self.key;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
                        .bind(key)
                        .execute(&mut *conn)
                        .await;
                    if let Err(e) = unlocked {
                        // closing the session releases the lock as well
                        warn!("Failed to release advisory lock {}: {}", key, e);
                        let _ = conn.close().await;
                    }
                });
            }
            Err(_) => {
                // no runtime to unlock on; dropping the session frees the lock
                drop(conn.detach());
            }
        }
    }
}

#[async_trait]
impl TaskLocks for PostgresTaskLocks {
    async fn lock(&self, task_id: TaskId) -> Result<TaskLockGuard, RepositoryError> {
        let key = advisory_key(task_id);
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        debug!(task_id = %task_id, key, "Acquired advisory lock");
        Ok(TaskLockGuard::new(AdvisoryLock {
            conn: Some(conn),
            key,
        }))
    }
}
