// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Scope Behaviors
//!
//! Per-scope routing policy. [`ScopePolicy`] is a closed set of exactly three
//! variants, one per [`Scope`], dispatched through the [`ScopeBehavior`]
//! trait. Decisions are pure: everything a behavior needs is passed in via
//! [`DecisionContext`], assembled by the application layer.
//!
//! | Scope | `decide` | Capacity gate |
//! |-------|----------|---------------|
//! | GLOBAL | always DELEGATE (REJECT with no children and no auto-create) | none |
//! | PROJECT | EXECUTE when simple and under capacity, else DELEGATE | optional `max_concurrent_tasks` |
//! | ORCHESTRATION | always QUEUE | `max_concurrent_tasks` (default 10) |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::delegation::Delegation;
use crate::domain::error::CoordinationError;
use crate::domain::instance::{Instance, InstanceConfig, InstanceId, Scope};
use crate::domain::task::Task;

pub const DEFAULT_COMPLEXITY_THRESHOLD: f64 = 3.0;
pub const DEFAULT_ORCHESTRATION_CAPACITY: usize = 10;

fn default_decompose_tags() -> Vec<String> {
    vec!["decompose".into(), "epic".into(), "multi-step".into()]
}

fn default_threshold() -> f64 {
    DEFAULT_COMPLEXITY_THRESHOLD
}

/// Typed view over the opaque instance config map. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSettings {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub auto_create_children: bool,
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
    #[serde(default = "default_threshold")]
    pub complexity_threshold: f64,
    #[serde(default = "default_decompose_tags")]
    pub decompose_tags: Vec<String>,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            auto_create_children: false,
            max_concurrent_tasks: None,
            complexity_threshold: DEFAULT_COMPLEXITY_THRESHOLD,
            decompose_tags: default_decompose_tags(),
        }
    }
}

impl ScopeSettings {
    /// Strict parse, used when an instance is created.
    pub fn parse(config: &InstanceConfig) -> Result<Self, CoordinationError> {
        serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| CoordinationError::InvalidInput(format!("invalid instance config: {}", e)))
    }

    /// Lenient view for decisions; a config that no longer parses falls back
    /// to defaults.
    pub fn of(instance: &Instance) -> Self {
        Self::parse(&instance.config).unwrap_or_default()
    }

    /// Effective concurrency limit for a scope, `None` meaning unlimited.
    pub fn capacity_for(&self, scope: Scope) -> Option<usize> {
        match scope {
            Scope::Global => None,
            Scope::Project => self.max_concurrent_tasks,
            Scope::Orchestration => Some(
                self.max_concurrent_tasks
                    .unwrap_or(DEFAULT_ORCHESTRATION_CAPACITY),
            ),
        }
    }
}

/// Outcome of [`ScopeBehavior::decide`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeAction {
    Execute,
    Delegate {
        target_hint: Option<InstanceId>,
        /// No eligible child exists and the instance may create one.
        provision_child: bool,
    },
    Queue,
    Reject {
        reason: String,
    },
}

impl ScopeAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Execute => "EXECUTE",
            Self::Delegate { .. } => "DELEGATE",
            Self::Queue => "QUEUE",
            Self::Reject { .. } => "REJECT",
        }
    }
}

/// Inputs to a decision that require repository reads.
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    /// Non-terminated direct children of the deciding instance.
    pub children: Vec<Instance>,
    /// Open tasks owned by the deciding instance, excluding the task under
    /// decision.
    pub own_load: usize,
    /// Children that must not be chosen (e.g. the target that just rejected).
    pub excluded: Vec<InstanceId>,
}

impl DecisionContext {
    fn eligible_children(&self) -> impl Iterator<Item = &Instance> {
        self.children
            .iter()
            .filter(move |c| c.is_running() && !self.excluded.contains(&c.id))
    }
}

/// Note produced when a child completes a task delegated by this instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildCompletion {
    pub scope: Scope,
    pub summary: String,
}

pub trait ScopeBehavior {
    fn scope(&self) -> Scope;

    fn decide(&self, task: &Task, instance: &Instance, ctx: &DecisionContext) -> ScopeAction;

    fn on_child_completed(&self, task: &Task, instance: &Instance, delegation: &Delegation) -> ChildCompletion;

    fn capacity_available(&self, instance: &Instance, open_tasks: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePolicy {
    Global,
    Project,
    Orchestration,
}

impl ScopePolicy {
    pub fn for_scope(scope: Scope) -> Self {
        match scope {
            Scope::Global => Self::Global,
            Scope::Project => Self::Project,
            Scope::Orchestration => Self::Orchestration,
        }
    }

    pub fn for_instance(instance: &Instance) -> Self {
        Self::for_scope(instance.scope)
    }
}

/// Complexity used by PROJECT instances to choose between executing and
/// delegating.
pub fn complexity_score(task: &Task, settings: &ScopeSettings) -> f64 {
    let length = (task.description.chars().count() as f64 / 200.0).min(5.0);
    let tags = 0.5 * task.tags.len() as f64;
    let decompose = if task
        .tags
        .iter()
        .any(|t| settings.decompose_tags.iter().any(|d| d.eq_ignore_ascii_case(t)))
    {
        3.0
    } else {
        0.0
    };
    length + tags + decompose
}

fn hinted_child(task: &Task, ctx: &DecisionContext) -> Option<InstanceId> {
    let assigned = task.assigned_instance()?;
    ctx.eligible_children()
        .any(|c| c.id == assigned)
        .then_some(assigned)
}

fn delegate_down(task: &Task, instance: &Instance, ctx: &DecisionContext, settings: &ScopeSettings) -> ScopeAction {
    if ctx.eligible_children().next().is_some() {
        return ScopeAction::Delegate {
            target_hint: hinted_child(task, ctx),
            provision_child: false,
        };
    }
    if settings.auto_create_children {
        return ScopeAction::Delegate {
            target_hint: None,
            provision_child: true,
        };
    }
    let child_scope = instance.scope.child().map(|s| s.as_str()).unwrap_or("child");
    let reason = if ctx.children.is_empty() {
        format!("{} has no {} children and auto-create is disabled", instance.name, child_scope)
    } else {
        format!("{} has no running {} children", instance.name, child_scope)
    };
    ScopeAction::Reject { reason }
}

impl ScopeBehavior for ScopePolicy {
    fn scope(&self) -> Scope {
        match self {
            Self::Global => Scope::Global,
            Self::Project => Scope::Project,
            Self::Orchestration => Scope::Orchestration,
        }
    }

    fn decide(&self, task: &Task, instance: &Instance, ctx: &DecisionContext) -> ScopeAction {
        let settings = ScopeSettings::of(instance);
        match self {
            Self::Global => {
                // GLOBAL never executes. With children that are all down the
                // router reports the failure rather than rejecting here.
                if ctx.children.is_empty() && !settings.auto_create_children {
                    return delegate_down(task, instance, ctx, &settings);
                }
                match delegate_down(task, instance, ctx, &settings) {
                    ScopeAction::Reject { .. } => ScopeAction::Delegate {
                        target_hint: None,
                        provision_child: false,
                    },
                    action => action,
                }
            }
            Self::Project => {
                let score = complexity_score(task, &settings);
                if score <= settings.complexity_threshold && self.capacity_available(instance, ctx.own_load) {
                    return ScopeAction::Execute;
                }
                delegate_down(task, instance, ctx, &settings)
            }
            Self::Orchestration => ScopeAction::Queue,
        }
    }

    fn on_child_completed(&self, task: &Task, instance: &Instance, delegation: &Delegation) -> ChildCompletion {
        let child = match self {
            Self::Global => "project",
            Self::Project => "orchestration",
            Self::Orchestration => "escalation",
        };
        let mut summary = format!(
            "{} {} reported task '{}' {} to {}",
            child,
            delegation.child_instance_id(),
            task.title,
            task.status,
            instance.name
        );
        if let Some(decomposition) = delegation.decomposition_id {
            summary.push_str(&format!(" (decomposition {})", decomposition));
        }
        ChildCompletion {
            scope: instance.scope,
            summary,
        }
    }

    fn capacity_available(&self, instance: &Instance, open_tasks: usize) -> bool {
        match ScopeSettings::of(instance).capacity_for(self.scope()) {
            Some(limit) => open_tasks < limit,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delegation::DelegationType;
    use crate::domain::instance::InstanceStatus;
    use crate::domain::task::{TaskPriority, ASSIGNED_INSTANCE_KEY};
    use serde_json::{json, Map};

    fn instance(scope: Scope, config: Value) -> Instance {
        let parent = match scope {
            Scope::Global => None,
            _ => Some(InstanceId::new()),
        };
        let mut i = Instance::new(
            format!("{}-node", scope.as_str().to_lowercase()),
            scope,
            parent,
            config.as_object().cloned().unwrap_or_default(),
        )
        .unwrap();
        i.status = InstanceStatus::Running;
        i
    }

    fn task(description: &str, tags: &[&str]) -> Task {
        Task::new(
            InstanceId::new(),
            "t",
            description,
            tags.iter().map(|s| s.to_string()),
            TaskPriority::Medium,
            Map::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_global_rejects_without_children_or_auto_create() {
        let g = instance(Scope::Global, json!({}));
        let action = ScopePolicy::Global.decide(&task("", &[]), &g, &DecisionContext::default());
        assert!(matches!(action, ScopeAction::Reject { .. }));

        let g = instance(Scope::Global, json!({"auto_create_children": true}));
        let action = ScopePolicy::Global.decide(&task("", &[]), &g, &DecisionContext::default());
        assert_eq!(
            action,
            ScopeAction::Delegate {
                target_hint: None,
                provision_child: true
            }
        );
    }

    #[test]
    fn test_global_always_delegates_with_children() {
        let g = instance(Scope::Global, json!({}));
        let mut p = instance(Scope::Project, json!({}));
        p.status = InstanceStatus::Paused;
        let ctx = DecisionContext {
            children: vec![p],
            ..Default::default()
        };
        let action = ScopePolicy::Global.decide(&task("", &[]), &g, &ctx);
        assert_eq!(action.name(), "DELEGATE");
    }

    #[test]
    fn test_global_passes_metadata_hint() {
        let g = instance(Scope::Global, json!({}));
        let p1 = instance(Scope::Project, json!({}));
        let p2 = instance(Scope::Project, json!({}));
        let mut t = task("", &[]);
        t.metadata.insert(ASSIGNED_INSTANCE_KEY.into(), json!(p2.id.to_string()));
        let ctx = DecisionContext {
            children: vec![p1, p2.clone()],
            ..Default::default()
        };
        assert_eq!(
            ScopePolicy::Global.decide(&t, &g, &ctx),
            ScopeAction::Delegate {
                target_hint: Some(p2.id),
                provision_child: false
            }
        );
    }

    #[test]
    fn test_complexity_score() {
        let settings = ScopeSettings::default();
        assert_eq!(complexity_score(&task("", &[]), &settings), 0.0);
        assert_eq!(complexity_score(&task(&"x".repeat(400), &["a"]), &settings), 2.5);
        // description contribution is capped at 5
        assert_eq!(complexity_score(&task(&"x".repeat(5000), &[]), &settings), 5.0);
        assert_eq!(complexity_score(&task("", &["epic"]), &settings), 3.5);
    }

    #[test]
    fn test_project_executes_simple_tasks() {
        let p = instance(Scope::Project, json!({}));
        let action = ScopePolicy::Project.decide(&task("small fix", &["bug"]), &p, &DecisionContext::default());
        assert_eq!(action, ScopeAction::Execute);
    }

    #[test]
    fn test_project_delegates_complex_tasks() {
        let p = instance(Scope::Project, json!({}));
        let o = instance(Scope::Orchestration, json!({}));
        let ctx = DecisionContext {
            children: vec![o],
            ..Default::default()
        };
        let action = ScopePolicy::Project.decide(&task("", &["decompose", "api"]), &p, &ctx);
        assert_eq!(action.name(), "DELEGATE");

        // no child, no auto-create
        let action = ScopePolicy::Project.decide(&task("", &["decompose"]), &p, &DecisionContext::default());
        assert!(matches!(action, ScopeAction::Reject { .. }));

        let p = instance(Scope::Project, json!({"auto_create_children": true}));
        let action = ScopePolicy::Project.decide(&task("", &["decompose"]), &p, &DecisionContext::default());
        assert_eq!(
            action,
            ScopeAction::Delegate {
                target_hint: None,
                provision_child: true
            }
        );
    }

    #[test]
    fn test_project_delegates_when_at_capacity() {
        let p = instance(Scope::Project, json!({"max_concurrent_tasks": 1}));
        let o = instance(Scope::Orchestration, json!({}));
        let ctx = DecisionContext {
            children: vec![o],
            own_load: 1,
            excluded: vec![],
        };
        let action = ScopePolicy::Project.decide(&task("tiny", &[]), &p, &ctx);
        assert_eq!(action.name(), "DELEGATE");
    }

    #[test]
    fn test_excluded_children_are_not_eligible() {
        let p = instance(Scope::Project, json!({}));
        let o = instance(Scope::Orchestration, json!({}));
        let ctx = DecisionContext {
            children: vec![o.clone()],
            own_load: 0,
            excluded: vec![o.id],
        };
        let action = ScopePolicy::Project.decide(&task("", &["epic"]), &p, &ctx);
        assert!(matches!(action, ScopeAction::Reject { .. }));
    }

    #[test]
    fn test_orchestration_always_queues_and_gates_capacity() {
        let o = instance(Scope::Orchestration, json!({"max_concurrent_tasks": 0}));
        let action = ScopePolicy::Orchestration.decide(&task("", &["epic"]), &o, &DecisionContext::default());
        assert_eq!(action, ScopeAction::Queue);
        assert!(!ScopePolicy::Orchestration.capacity_available(&o, 0));

        let o = instance(Scope::Orchestration, json!({}));
        assert!(ScopePolicy::Orchestration.capacity_available(&o, 9));
        assert!(!ScopePolicy::Orchestration.capacity_available(&o, 10));

        let g = instance(Scope::Global, json!({"max_concurrent_tasks": 0}));
        assert!(ScopePolicy::Global.capacity_available(&g, 1_000));
    }

    #[test]
    fn test_settings_parse_is_strict() {
        let bad = json!({"max_concurrent_tasks": "lots"});
        assert!(ScopeSettings::parse(bad.as_object().unwrap()).is_err());
        let ok = json!({"max_concurrent_tasks": 2, "other": true});
        assert_eq!(
            ScopeSettings::parse(ok.as_object().unwrap()).unwrap().max_concurrent_tasks,
            Some(2)
        );
    }

    #[test]
    fn test_child_completion_summary() {
        let g = instance(Scope::Global, json!({}));
        let mut t = task("", &[]);
        t.status = crate::domain::task::TaskStatus::Done;
        let d = Delegation::new(t.id, g.id, InstanceId::new(), DelegationType::Route);
        let note = ScopePolicy::Global.on_child_completed(&t, &g, &d);
        assert_eq!(note.scope, Scope::Global);
        assert!(note.summary.contains("DONE"));
        assert!(note.summary.starts_with("project"));
    }
}
