// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task service: creation, lookup and status updates.
//!
//! Ownership is not writable here; `instance_id` only moves through the
//! delegator.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::application::retry::ReadRetry;
use crate::domain::error::CoordinationError;
use crate::domain::instance::InstanceId;
use crate::domain::repository::{InstanceRepository, TaskLocks, TaskRepository};
use crate::domain::task::{Task, TaskId, TaskPriority, TaskStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub instance_id: InstanceId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub struct TaskService {
    instances: Arc<dyn InstanceRepository>,
    tasks: Arc<dyn TaskRepository>,
    locks: Arc<dyn TaskLocks>,
    retry: ReadRetry,
}

impl TaskService {
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        tasks: Arc<dyn TaskRepository>,
        locks: Arc<dyn TaskLocks>,
    ) -> Self {
        Self {
            instances,
            tasks,
            locks,
            retry: ReadRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ReadRetry) -> Self {
        self.retry = retry;
        self
    }

    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, CoordinationError> {
        let owner = self
            .retry
            .run("instance by id", || self.instances.find_by_id(request.instance_id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("instance", request.instance_id))?;
        if owner.status.is_terminated() {
            return Err(CoordinationError::InvalidInput(format!(
                "instance {} is terminated and cannot own new tasks",
                owner.id
            )));
        }

        let task = Task::new(
            owner.id,
            request.title,
            request.description,
            request.tags,
            request.priority,
            request.metadata,
        )?;
        self.tasks.save(&task).await?;
        info!("Created task {} '{}' at {} {}", task.id, task.title, owner.scope, owner.name);
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, CoordinationError> {
        self.retry
            .run("task by id", || self.tasks.find_by_id(id))
            .await?
            .ok_or_else(|| CoordinationError::not_found("task", id))
    }

    /// Terminal statuses are final; setting the current status is a no-op.
    pub async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<Task, CoordinationError> {
        let _guard = self.locks.lock(id).await?;
        let mut task = self.get_task(id).await?;
        if task.status == status {
            return Ok(task);
        }
        let from = task.status;
        task.set_status(status)?;
        self.tasks.save(&task).await?;
        info!("Task {} {} -> {}", task.id, from, task.status);
        Ok(task)
    }

    pub async fn list_by_instance(&self, instance_id: InstanceId) -> Result<Vec<Task>, CoordinationError> {
        self.retry
            .run("tasks by instance", || self.tasks.find_by_instance(instance_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::repository_factory::Repositories;
    use crate::domain::instance::{Instance, InstanceConfig, Scope};
    use crate::infrastructure::repositories::InMemoryStore;

    fn request(instance_id: InstanceId, title: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            instance_id,
            title: title.into(),
            description: String::new(),
            tags: vec!["Backend".into()],
            priority: TaskPriority::High,
            metadata: Map::new(),
        }
    }

    fn service(store: &InMemoryStore) -> TaskService {
        let repos = Repositories::in_memory(store);
        TaskService::new(repos.instances, repos.tasks, repos.locks)
    }

    #[tokio::test]
    async fn test_create_and_update() {
        let store = InMemoryStore::new();
        let p = Instance::new("p", Scope::Project, None, InstanceConfig::new()).unwrap();
        store.instances().save(&p).await.unwrap();
        let tasks = service(&store);

        let t = tasks.create_task(request(p.id, "build")).await.unwrap();
        assert!(t.tags.contains("backend"));
        assert_eq!(tasks.list_by_instance(p.id).await.unwrap().len(), 1);

        let t = tasks.update_status(t.id, TaskStatus::InProgress).await.unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        tasks.update_status(t.id, TaskStatus::Done).await.unwrap();
        let err = tasks.update_status(t.id, TaskStatus::Pending).await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_transition");
        assert_eq!(tasks.get_task(t.id).await.unwrap().instance_id, p.id);
    }

    #[tokio::test]
    async fn test_owner_must_exist_and_be_live() {
        let store = InMemoryStore::new();
        let tasks = service(&store);
        assert_eq!(
            tasks.create_task(request(InstanceId::new(), "x")).await.unwrap_err().error_kind(),
            "not_found"
        );

        let mut p = Instance::new("p", Scope::Project, None, InstanceConfig::new()).unwrap();
        p.mark_error("x");
        p.terminate().unwrap();
        store.instances().save(&p).await.unwrap();
        assert_eq!(
            tasks.create_task(request(p.id, "x")).await.unwrap_err().error_kind(),
            "invalid_input"
        );
        assert_eq!(
            tasks.create_task(request(InstanceId::new(), " ")).await.unwrap_err().error_kind(),
            "not_found"
        );
    }
}
