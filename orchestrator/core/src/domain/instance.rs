// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Instance Aggregate
//!
//! An [`Instance`] is one node of the GLOBAL → PROJECT → ORCHESTRATION tree.
//! Instances own tasks and make routing decisions through the
//! [`ScopePolicy`](crate::domain::scope_behavior::ScopePolicy) that matches
//! their [`Scope`].
//!
//! ## State Machine
//!
//! ```text
//! Created ──start──▶ Starting ──▶ Running ──pause──▶ Paused ──resume──▶ Running
//!                       ▲            │                  │
//!                       │          stop               stop
//!                       │            ▼                  ▼
//!     Stopped ◀──────── Stopping ◀───┴──────────────────┘
//!       │ start (restart)
//!       ▼
//!   Starting          any state ──hook failure──▶ Error
//!
//!   Stopped | Error ──terminate──▶ Terminated (terminal)
//! ```
//!
//! Instances are never physically deleted; `Terminated` keeps delegation
//! chain history resolvable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::error::CoordinationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tier of an instance in the hierarchy.
///
/// The ordering is GLOBAL > PROJECT > ORCHESTRATION; a child is always exactly
/// one level below its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Global,
    Project,
    Orchestration,
}

impl Scope {
    /// Depth in the tree, GLOBAL being the root.
    pub fn level(&self) -> u8 {
        match self {
            Self::Global => 0,
            Self::Project => 1,
            Self::Orchestration => 2,
        }
    }

    /// The scope one level below, if any.
    pub fn child(&self) -> Option<Scope> {
        match self {
            Self::Global => Some(Self::Project),
            Self::Project => Some(Self::Orchestration),
            Self::Orchestration => None,
        }
    }

    /// The scope one level above, if any.
    pub fn parent(&self) -> Option<Scope> {
        match self {
            Self::Global => None,
            Self::Project => Some(Self::Global),
            Self::Orchestration => Some(Self::Project),
        }
    }

    /// True when `other` is exactly one level below `self`.
    pub fn is_direct_parent_of(&self, other: Scope) -> bool {
        self.child() == Some(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "GLOBAL",
            Self::Project => "PROJECT",
            Self::Orchestration => "ORCHESTRATION",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GLOBAL" => Ok(Self::Global),
            "PROJECT" => Ok(Self::Project),
            "ORCHESTRATION" => Ok(Self::Orchestration),
            other => Err(CoordinationError::InvalidInput(format!("unknown scope '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
            Self::Terminated => "TERMINATED",
        }
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn can_terminate(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            "ERROR" => Ok(Self::Error),
            "TERMINATED" => Ok(Self::Terminated),
            other => Err(CoordinationError::InvalidInput(format!(
                "unknown instance status '{}'",
                other
            ))),
        }
    }
}

/// Opaque per-instance configuration, interpreted by the scope behavior.
pub type InstanceConfig = Map<String, Value>;

/// Aggregate root for a hierarchy node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub scope: Scope,
    pub status: InstanceStatus,
    pub parent_id: Option<InstanceId>,
    #[serde(default)]
    pub config: InstanceConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last hook failure, set when the instance entered `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Instance {
    /// Build a new instance in `Created`.
    ///
    /// Only local invariants are checked here (name, GLOBAL without parent);
    /// hierarchy checks that need the repository live in the lifecycle manager.
    pub fn new(
        name: impl Into<String>,
        scope: Scope,
        parent_id: Option<InstanceId>,
        config: InstanceConfig,
    ) -> Result<Self, CoordinationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoordinationError::InvalidInput(
                "instance name cannot be empty".to_string(),
            ));
        }
        if scope == Scope::Global && parent_id.is_some() {
            return Err(CoordinationError::InvalidHierarchy(
                "a GLOBAL instance cannot have a parent".to_string(),
            ));
        }
        if scope == Scope::Orchestration && parent_id.is_none() {
            return Err(CoordinationError::InvalidHierarchy(
                "an ORCHESTRATION instance requires a PROJECT parent".to_string(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: InstanceId::new(),
            name,
            scope,
            status: InstanceStatus::Created,
            parent_id,
            config,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
            last_error: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminated()
    }

    fn invalid(&self, action: &'static str) -> CoordinationError {
        CoordinationError::InvalidTransition {
            entity: "instance",
            id: self.id.to_string(),
            action,
            current: self.status.to_string(),
        }
    }

    fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Created | Stopped → Starting
    pub fn begin_start(&mut self) -> Result<(), CoordinationError> {
        if !self.status.can_start() {
            return Err(self.invalid("start"));
        }
        self.last_error = None;
        self.set_status(InstanceStatus::Starting);
        Ok(())
    }

    /// Starting → Running
    pub fn mark_running(&mut self) -> Result<(), CoordinationError> {
        if self.status != InstanceStatus::Starting {
            return Err(self.invalid("run"));
        }
        self.set_status(InstanceStatus::Running);
        self.started_at = Some(self.updated_at);
        self.stopped_at = None;
        Ok(())
    }

    /// Running → Paused
    pub fn pause(&mut self) -> Result<(), CoordinationError> {
        if !self.status.can_pause() {
            return Err(self.invalid("pause"));
        }
        self.set_status(InstanceStatus::Paused);
        Ok(())
    }

    /// Paused → Running
    pub fn resume(&mut self) -> Result<(), CoordinationError> {
        if !self.status.can_resume() {
            return Err(self.invalid("resume"));
        }
        self.set_status(InstanceStatus::Running);
        Ok(())
    }

    /// Running | Paused → Stopping
    pub fn begin_stop(&mut self) -> Result<(), CoordinationError> {
        if !self.status.can_stop() {
            return Err(self.invalid("stop"));
        }
        self.set_status(InstanceStatus::Stopping);
        Ok(())
    }

    /// Stopping → Stopped
    pub fn mark_stopped(&mut self) -> Result<(), CoordinationError> {
        if self.status != InstanceStatus::Stopping {
            return Err(self.invalid("finish stopping"));
        }
        self.set_status(InstanceStatus::Stopped);
        self.stopped_at = Some(self.updated_at);
        Ok(())
    }

    /// Stopped | Error → Terminated
    pub fn terminate(&mut self) -> Result<(), CoordinationError> {
        if !self.status.can_terminate() {
            return Err(self.invalid("terminate"));
        }
        self.set_status(InstanceStatus::Terminated);
        if self.stopped_at.is_none() {
            self.stopped_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Any non-terminal state → Error. Used when a transition hook fails.
    pub fn mark_error(&mut self, reason: impl Into<String>) {
        if self.status.is_terminated() {
            return;
        }
        self.last_error = Some(reason.into());
        self.set_status(InstanceStatus::Error);
    }

    /// Capability tags declared in config (`capabilities: [..]`).
    pub fn capabilities(&self) -> Vec<String> {
        self.config
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Boolean config flag, `false` when absent or not a bool.
    pub fn config_flag(&self, key: &str) -> bool {
        self.config.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> InstanceConfig {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_scope_adjacency() {
        assert!(Scope::Global.is_direct_parent_of(Scope::Project));
        assert!(Scope::Project.is_direct_parent_of(Scope::Orchestration));
        assert!(!Scope::Global.is_direct_parent_of(Scope::Orchestration));
        assert!(!Scope::Orchestration.is_direct_parent_of(Scope::Project));
        assert_eq!(Scope::Orchestration.child(), None);
        assert_eq!(Scope::Global.parent(), None);
    }

    #[test]
    fn test_scope_parse_roundtrip() {
        for scope in [Scope::Global, Scope::Project, Scope::Orchestration] {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
        }
        assert!("galaxy".parse::<Scope>().is_err());
        assert_eq!("project".parse::<Scope>().unwrap(), Scope::Project);
    }

    #[test]
    fn test_new_instance_rejects_bad_hierarchy() {
        let parent = InstanceId::new();
        assert!(matches!(
            Instance::new("g", Scope::Global, Some(parent), InstanceConfig::new()),
            Err(CoordinationError::InvalidHierarchy(_))
        ));
        assert!(matches!(
            Instance::new("o", Scope::Orchestration, None, InstanceConfig::new()),
            Err(CoordinationError::InvalidHierarchy(_))
        ));
        assert!(Instance::new("p", Scope::Project, None, InstanceConfig::new()).is_ok());
        assert!(matches!(
            Instance::new("  ", Scope::Project, None, InstanceConfig::new()),
            Err(CoordinationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_full_lifecycle() {
        let mut instance = Instance::new("p", Scope::Project, None, InstanceConfig::new()).unwrap();
        assert_eq!(instance.status, InstanceStatus::Created);

        instance.begin_start().unwrap();
        assert_eq!(instance.status, InstanceStatus::Starting);
        instance.mark_running().unwrap();
        assert!(instance.is_running());
        assert!(instance.started_at.is_some());

        instance.pause().unwrap();
        assert_eq!(instance.status, InstanceStatus::Paused);
        instance.resume().unwrap();
        assert!(instance.is_running());

        instance.begin_stop().unwrap();
        instance.mark_stopped().unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert!(instance.stopped_at.is_some());

        // restart
        instance.begin_start().unwrap();
        instance.mark_running().unwrap();
        assert!(instance.stopped_at.is_none());

        instance.begin_stop().unwrap();
        instance.mark_stopped().unwrap();
        instance.terminate().unwrap();
        assert!(instance.status.is_terminated());
    }

    #[test]
    fn test_invalid_transitions_carry_current_state() {
        let mut instance = Instance::new("p", Scope::Project, None, InstanceConfig::new()).unwrap();
        let err = instance.pause().unwrap_err();
        match err {
            CoordinationError::InvalidTransition { current, action, .. } => {
                assert_eq!(current, "CREATED");
                assert_eq!(action, "pause");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(instance.terminate().is_err());

        instance.begin_start().unwrap();
        instance.mark_running().unwrap();
        assert!(instance.begin_start().is_err());
        assert!(instance.terminate().is_err());
    }

    #[test]
    fn test_error_is_terminable_but_terminated_is_final() {
        let mut instance = Instance::new("p", Scope::Project, None, InstanceConfig::new()).unwrap();
        instance.begin_start().unwrap();
        instance.mark_error("hook exploded");
        assert_eq!(instance.status, InstanceStatus::Error);
        assert_eq!(instance.last_error.as_deref(), Some("hook exploded"));

        instance.terminate().unwrap();
        instance.mark_error("late");
        assert_eq!(instance.status, InstanceStatus::Terminated);
        assert!(instance.begin_start().is_err());
    }

    #[test]
    fn test_capabilities_are_lowercased() {
        let instance = Instance::new(
            "p",
            Scope::Project,
            None,
            config(json!({"capabilities": ["Rust", "backend", 3], "auto_create_children": true})),
        )
        .unwrap();
        assert_eq!(instance.capabilities(), vec!["rust".to_string(), "backend".to_string()]);
        assert!(instance.config_flag("auto_create_children"));
        assert!(!instance.config_flag("missing"));
    }
}
