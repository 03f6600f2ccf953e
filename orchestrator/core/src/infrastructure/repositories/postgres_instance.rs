// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Instance Repository
//!
//! `InstanceRepository` backed by the `instances` table. The partial unique
//! index `instances_single_live_global` turns a second live GLOBAL into a
//! `RepositoryError::Conflict`.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::instance::{Instance, InstanceId, InstanceStatus, Scope};
use crate::domain::repository::{InstanceRepository, RepositoryError};

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, scope, status, parent_id, config, last_error,
           created_at, updated_at, started_at, stopped_at
    FROM instances
"#;

pub struct PostgresInstanceRepository {
    pool: PgPool,
}

impl PostgresInstanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn instance_from_row(row: &PgRow) -> Result<Instance, RepositoryError> {
    let scope: String = row.try_get("scope")?;
    let status: String = row.try_get("status")?;
    let config: serde_json::Value = row.try_get("config")?;
    let parent_id: Option<uuid::Uuid> = row.try_get("parent_id")?;

    Ok(Instance {
        id: InstanceId(row.try_get("id")?),
        name: row.try_get("name")?,
        scope: scope
            .parse::<Scope>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        status: status
            .parse::<InstanceStatus>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        parent_id: parent_id.map(InstanceId),
        config: serde_json::from_value(config)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        stopped_at: row.try_get("stopped_at")?,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl InstanceRepository for PostgresInstanceRepository {
    async fn save(&self, instance: &Instance) -> Result<(), RepositoryError> {
        let config = serde_json::to_value(&instance.config)?;

        sqlx::query(
            r#"
            INSERT INTO instances (
                id, name, scope, status, parent_id, config, last_error,
                created_at, updated_at, started_at, stopped_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                parent_id = EXCLUDED.parent_id,
                config = EXCLUDED.config,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at,
                started_at = EXCLUDED.started_at,
                stopped_at = EXCLUDED.stopped_at
            "#,
        )
        .bind(instance.id.0)
        .bind(&instance.name)
        .bind(instance.scope.as_str())
        .bind(instance.status.as_str())
        .bind(instance.parent_id.map(|p| p.0))
        .bind(config)
        .bind(&instance.last_error)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.started_at)
        .bind(instance.stopped_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>, RepositoryError> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn find_by_parent(&self, parent_id: InstanceId) -> Result<Vec<Instance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{} WHERE parent_id = $1 ORDER BY created_at ASC, id ASC",
            SELECT_COLUMNS
        ))
        .bind(parent_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn find_by_scope(
        &self,
        scope: Scope,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "{} WHERE scope = $1 AND status = $2 ORDER BY created_at ASC, id ASC",
                    SELECT_COLUMNS
                ))
                .bind(scope.as_str())
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "{} WHERE scope = $1 ORDER BY created_at ASC, id ASC",
                    SELECT_COLUMNS
                ))
                .bind(scope.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(instance_from_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<Instance>, RepositoryError> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at ASC, id ASC", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(instance_from_row).collect()
    }
}
