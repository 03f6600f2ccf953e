// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Delegation Aggregate
//!
//! One ownership handoff attempt of a task between two instances. The
//! delegations of a task, ordered by `delegated_at`, form its chain.
//!
//! ```text
//! Pending ──accept──▶ Accepted ──complete──▶ Completed
//!    │
//!    └──reject──▶ Rejected
//! ```
//!
//! `Completed` and `Rejected` are immutable. Status is only written by the
//! delegator and the completion bubbler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::error::CoordinationError;
use crate::domain::instance::InstanceId;
use crate::domain::task::TaskId;

/// Rejection reason recorded by the timeout reaper.
pub const TIMEOUT_REASON: &str = "timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelegationId(pub Uuid);

impl DelegationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for DelegationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DelegationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Groups the sibling delegations created by one decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecompositionId(pub Uuid);

impl DecompositionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DecompositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DecompositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegationType {
    Route,
    Decompose,
    Escalate,
}

impl DelegationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "ROUTE",
            Self::Decompose => "DECOMPOSE",
            Self::Escalate => "ESCALATE",
        }
    }
}

impl fmt::Display for DelegationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DelegationType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ROUTE" => Ok(Self::Route),
            "DECOMPOSE" => Ok(Self::Decompose),
            "ESCALATE" => Ok(Self::Escalate),
            other => Err(CoordinationError::InvalidInput(format!(
                "unknown delegation type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegationStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
}

impl DelegationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Completed => "COMPLETED",
        }
    }

    /// PENDING or ACCEPTED.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Accepted)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed)
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DelegationStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "ACCEPTED" => Ok(Self::Accepted),
            "REJECTED" => Ok(Self::Rejected),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(CoordinationError::InvalidInput(format!(
                "unknown delegation status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub task_id: TaskId,
    pub source_instance_id: InstanceId,
    pub target_instance_id: InstanceId,
    #[serde(rename = "type")]
    pub delegation_type: DelegationType,
    pub status: DelegationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition_id: Option<DecompositionId>,
    pub delegated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Delegation {
    pub fn new(
        task_id: TaskId,
        source_instance_id: InstanceId,
        target_instance_id: InstanceId,
        delegation_type: DelegationType,
    ) -> Self {
        Self {
            id: DelegationId::new(),
            task_id,
            source_instance_id,
            target_instance_id,
            delegation_type,
            status: DelegationStatus::Pending,
            decomposition_id: None,
            delegated_at: Utc::now(),
            accepted_at: None,
            completed_at: None,
            result: Map::new(),
            notes: Vec::new(),
            rejection_reason: None,
        }
    }

    pub fn with_decomposition(mut self, decomposition_id: DecompositionId) -> Self {
        self.decomposition_id = Some(decomposition_id);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    fn invalid(&self, action: &'static str) -> CoordinationError {
        CoordinationError::InvalidTransition {
            entity: "delegation",
            id: self.id.to_string(),
            action,
            current: self.status.to_string(),
        }
    }

    /// Pending → Accepted
    pub fn accept(&mut self) -> Result<(), CoordinationError> {
        if self.status != DelegationStatus::Pending {
            return Err(self.invalid("accept"));
        }
        self.status = DelegationStatus::Accepted;
        self.accepted_at = Some(Utc::now());
        Ok(())
    }

    /// Pending → Rejected
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), CoordinationError> {
        if self.status != DelegationStatus::Pending {
            return Err(self.invalid("reject"));
        }
        let reason = reason.into();
        self.status = DelegationStatus::Rejected;
        self.completed_at = Some(Utc::now());
        self.notes.push(format!("rejected: {}", reason));
        self.rejection_reason = Some(reason);
        Ok(())
    }

    /// Accepted → Completed
    pub fn complete(&mut self, result: Map<String, Value>) -> Result<(), CoordinationError> {
        if self.status != DelegationStatus::Accepted {
            return Err(self.invalid("complete"));
        }
        self.status = DelegationStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = result;
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.status == DelegationStatus::Pending
    }

    pub fn is_accepted(&self) -> bool {
        self.status == DelegationStatus::Accepted
    }

    pub fn is_completed(&self) -> bool {
        self.status == DelegationStatus::Completed
    }

    /// The higher-scoped side of the handoff: the source for ROUTE and
    /// DECOMPOSE, the target for ESCALATE.
    pub fn parent_instance_id(&self) -> InstanceId {
        match self.delegation_type {
            DelegationType::Escalate => self.target_instance_id,
            DelegationType::Route | DelegationType::Decompose => self.source_instance_id,
        }
    }

    pub fn child_instance_id(&self) -> InstanceId {
        match self.delegation_type {
            DelegationType::Escalate => self.source_instance_id,
            DelegationType::Route | DelegationType::Decompose => self.target_instance_id,
        }
    }

    /// How long the delegation has been waiting, in whole seconds.
    pub fn pending_for(&self, now: DateTime<Utc>) -> i64 {
        (now - self.delegated_at).num_seconds()
    }
}
