// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Task Repository
//!
//! `TaskRepository` backed by the `tasks` table. Tags and metadata are
//! stored as JSONB.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Executor, Postgres, Row};
use std::collections::BTreeSet;

use crate::domain::instance::InstanceId;
use crate::domain::repository::{RepositoryError, TaskRepository};
use crate::domain::task::{Task, TaskId, TaskPriority, TaskStatus};

const SELECT_COLUMNS: &str = r#"
    SELECT id, title, description, tags, priority, status, instance_id,
           metadata, created_at, updated_at
    FROM tasks
"#;

pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn task_from_row(row: &PgRow) -> Result<Task, RepositoryError> {
    let tags: serde_json::Value = row.try_get("tags")?;
    let metadata: serde_json::Value = row.try_get("metadata")?;
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;

    Ok(Task {
        id: TaskId(row.try_get("id")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        tags: serde_json::from_value::<BTreeSet<String>>(tags)?,
        priority: priority
            .parse::<TaskPriority>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        instance_id: InstanceId(row.try_get("instance_id")?),
        metadata: serde_json::from_value(metadata)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Upsert shared with the delegation repository's transactional path.
pub(crate) async fn upsert_task<'e, E>(executor: E, task: &Task) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Postgres>,
{
    let tags = serde_json::to_value(&task.tags)?;
    let metadata = serde_json::to_value(&task.metadata)?;

    sqlx::query(
        r#"
        INSERT INTO tasks (
            id, title, description, tags, priority, status, instance_id,
            metadata, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            title = EXCLUDED.title,
            description = EXCLUDED.description,
            tags = EXCLUDED.tags,
            priority = EXCLUDED.priority,
            status = EXCLUDED.status,
            instance_id = EXCLUDED.instance_id,
            metadata = EXCLUDED.metadata,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(task.id.0)
    .bind(&task.title)
    .bind(&task.description)
    .bind(tags)
    .bind(task.priority.as_str())
    .bind(task.status.as_str())
    .bind(task.instance_id.0)
    .bind(metadata)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn save(&self, task: &Task) -> Result<(), RepositoryError> {
        upsert_task(&self.pool, task).await
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn find_by_instance(&self, instance_id: InstanceId) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{} WHERE instance_id = $1 ORDER BY created_at ASC",
            SELECT_COLUMNS
        ))
        .bind(instance_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn count_open_by_instance(&self, instance_id: InstanceId) -> Result<usize, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE instance_id = $1 AND status NOT IN ('DONE', 'CANCELLED')",
        )
        .bind(instance_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn list_all(&self) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at ASC", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }
}
