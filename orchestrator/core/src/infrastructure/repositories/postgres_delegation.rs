// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Delegation Repository
//!
//! `DelegationRepository` backed by the `delegations` table.
//! `save_with_task` writes the delegation and the task inside one
//! transaction so ownership moves atomically with the status change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Executor, Postgres, Row};

use crate::domain::delegation::{
    DecompositionId, Delegation, DelegationId, DelegationStatus, DelegationType,
};
use crate::domain::instance::InstanceId;
use crate::domain::repository::{DelegationRepository, RepositoryError};
use crate::domain::task::{Task, TaskId};
use crate::infrastructure::repositories::postgres_task::upsert_task;

const SELECT_COLUMNS: &str = r#"
    SELECT id, task_id, source_instance_id, target_instance_id, delegation_type,
           status, decomposition_id, delegated_at, accepted_at, completed_at,
           result, notes, rejection_reason
    FROM delegations
"#;

pub struct PostgresDelegationRepository {
    pool: PgPool,
}

impl PostgresDelegationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_many(&self, sql: &str, bind: Option<uuid::Uuid>) -> Result<Vec<Delegation>, RepositoryError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(delegation_from_row).collect()
    }
}

fn delegation_from_row(row: &PgRow) -> Result<Delegation, RepositoryError> {
    let delegation_type: String = row.try_get("delegation_type")?;
    let status: String = row.try_get("status")?;
    let decomposition_id: Option<uuid::Uuid> = row.try_get("decomposition_id")?;
    let result: serde_json::Value = row.try_get("result")?;
    let notes: serde_json::Value = row.try_get("notes")?;

    Ok(Delegation {
        id: DelegationId(row.try_get("id")?),
        task_id: TaskId(row.try_get("task_id")?),
        source_instance_id: InstanceId(row.try_get("source_instance_id")?),
        target_instance_id: InstanceId(row.try_get("target_instance_id")?),
        delegation_type: delegation_type
            .parse::<DelegationType>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        status: status
            .parse::<DelegationStatus>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        decomposition_id: decomposition_id.map(DecompositionId),
        delegated_at: row.try_get("delegated_at")?,
        accepted_at: row.try_get("accepted_at")?,
        completed_at: row.try_get("completed_at")?,
        result: serde_json::from_value(result)?,
        notes: serde_json::from_value(notes)?,
        rejection_reason: row.try_get("rejection_reason")?,
    })
}

async fn upsert_delegation<'e, E>(executor: E, delegation: &Delegation) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = serde_json::to_value(&delegation.result)?;
    let notes = serde_json::to_value(&delegation.notes)?;

    // Completed and rejected rows are immutable; the WHERE clause keeps a
    // stale writer from reopening them.
    sqlx::query(
        r#"
        INSERT INTO delegations (
            id, task_id, source_instance_id, target_instance_id, delegation_type,
            status, decomposition_id, delegated_at, accepted_at, completed_at,
            result, notes, rejection_reason
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            accepted_at = EXCLUDED.accepted_at,
            completed_at = EXCLUDED.completed_at,
            result = EXCLUDED.result,
            notes = EXCLUDED.notes,
            rejection_reason = EXCLUDED.rejection_reason
        WHERE delegations.status IN ('PENDING', 'ACCEPTED')
        "#,
    )
    .bind(delegation.id.0)
    .bind(delegation.task_id.0)
    .bind(delegation.source_instance_id.0)
    .bind(delegation.target_instance_id.0)
    .bind(delegation.delegation_type.as_str())
    .bind(delegation.status.as_str())
    .bind(delegation.decomposition_id.map(|d| d.0))
    .bind(delegation.delegated_at)
    .bind(delegation.accepted_at)
    .bind(delegation.completed_at)
    .bind(result)
    .bind(notes)
    .bind(&delegation.rejection_reason)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl DelegationRepository for PostgresDelegationRepository {
    async fn save(&self, delegation: &Delegation) -> Result<(), RepositoryError> {
        upsert_delegation(&self.pool, delegation).await
    }

    async fn save_with_task(&self, delegation: &Delegation, task: &Task) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        upsert_delegation(&mut *tx, delegation).await?;
        upsert_task(&mut *tx, task).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_decomposition(
        &self,
        parent: &Task,
        subtasks: &[Task],
        delegations: &[Delegation],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for subtask in subtasks {
            upsert_task(&mut *tx, subtask).await?;
        }
        for delegation in delegations {
            upsert_delegation(&mut *tx, delegation).await?;
        }
        upsert_task(&mut *tx, parent).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: DelegationId) -> Result<Option<Delegation>, RepositoryError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(delegation_from_row).transpose()
    }

    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<Delegation>, RepositoryError> {
        let sql = format!("{} WHERE task_id = $1 ORDER BY delegated_at ASC, id ASC", SELECT_COLUMNS);
        self.fetch_many(&sql, Some(task_id.0)).await
    }

    async fn find_open_for_task(&self, task_id: TaskId) -> Result<Option<Delegation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{} WHERE task_id = $1 AND status IN ('PENDING', 'ACCEPTED') \
             ORDER BY delegated_at DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(delegation_from_row).transpose()
    }

    async fn find_pending_by_target(
        &self,
        target_instance_id: InstanceId,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        let sql = format!(
            "{} WHERE target_instance_id = $1 AND status = 'PENDING' ORDER BY delegated_at ASC",
            SELECT_COLUMNS
        );
        self.fetch_many(&sql, Some(target_instance_id.0)).await
    }

    async fn find_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = 'PENDING' AND delegated_at < $1 ORDER BY delegated_at ASC",
            SELECT_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delegation_from_row).collect()
    }

    async fn find_by_decomposition(
        &self,
        decomposition_id: DecompositionId,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        let sql = format!(
            "{} WHERE decomposition_id = $1 ORDER BY delegated_at ASC",
            SELECT_COLUMNS
        );
        self.fetch_many(&sql, Some(decomposition_id.0)).await
    }

    async fn list_all(&self) -> Result<Vec<Delegation>, RepositoryError> {
        let sql = format!("{} ORDER BY delegated_at ASC", SELECT_COLUMNS);
        self.fetch_many(&sql, None).await
    }
}
