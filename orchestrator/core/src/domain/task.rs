// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Aggregate
//!
//! A unit of work owned by exactly one [`Instance`](crate::domain::instance::Instance)
//! at a time. `instance_id` is only ever moved by the delegator as part of a
//! delegation transition; [`Task::transfer_to`] is `pub(crate)` for that reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::delegation::DecompositionId;
use crate::domain::error::CoordinationError;
use crate::domain::instance::InstanceId;

/// Metadata key carrying an explicit routing target.
pub const ASSIGNED_INSTANCE_KEY: &str = "assigned_instance_id";
/// Metadata key linking a subtask to the task it was decomposed from.
pub const PARENT_TASK_KEY: &str = "parent_task_id";
/// Metadata key grouping the subtasks of one decomposition.
pub const DECOMPOSITION_KEY: &str = "decomposition_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "URGENT" => Ok(Self::Urgent),
            other => Err(CoordinationError::InvalidInput(format!("unknown priority '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Blocked => "BLOCKED",
            Self::Done => "DONE",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Open tasks count against an instance's load.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "BLOCKED" => Ok(Self::Blocked),
            "DONE" => Ok(Self::Done),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(CoordinationError::InvalidInput(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub instance_id: InstanceId,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        instance_id: InstanceId,
        title: impl Into<String>,
        description: impl Into<String>,
        tags: impl IntoIterator<Item = String>,
        priority: TaskPriority,
        metadata: Map<String, Value>,
    ) -> Result<Self, CoordinationError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(CoordinationError::InvalidInput(
                "task title cannot be empty".to_string(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: TaskId::new(),
            title,
            description: description.into(),
            tags: tags
                .into_iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            priority,
            status: TaskStatus::Pending,
            instance_id,
            metadata,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move the task to a new status. Terminal statuses are final.
    pub fn set_status(&mut self, status: TaskStatus) -> Result<(), CoordinationError> {
        if self.status == status {
            return Ok(());
        }
        if self.status.is_terminal() {
            return Err(CoordinationError::InvalidTransition {
                entity: "task",
                id: self.id.to_string(),
                action: "change status",
                current: self.status.to_string(),
            });
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Reassign ownership. Only called from delegation transitions.
    pub(crate) fn transfer_to(&mut self, instance_id: InstanceId) {
        self.instance_id = instance_id;
        self.updated_at = Utc::now();
    }

    /// Explicit routing target from metadata, if it parses.
    pub fn assigned_instance(&self) -> Option<InstanceId> {
        self.metadata
            .get(ASSIGNED_INSTANCE_KEY)
            .and_then(Value::as_str)
            .and_then(|s| InstanceId::from_string(s).ok())
    }

    pub fn parent_task(&self) -> Option<TaskId> {
        self.metadata
            .get(PARENT_TASK_KEY)
            .and_then(Value::as_str)
            .and_then(|s| TaskId::from_string(s).ok())
    }

    /// The decomposition this task belongs to (subtask) or produced (parent).
    pub fn decomposition(&self) -> Option<DecompositionId> {
        self.metadata
            .get(DECOMPOSITION_KEY)
            .and_then(Value::as_str)
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(DecompositionId)
    }
}
