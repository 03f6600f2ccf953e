// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Router
//!
//! Picks a delegation target among candidate instances. Only `Running`
//! candidates are eligible. Precedence, first non-empty wins:
//!
//! 1. the instance named by the task's `assigned_instance_id` metadata
//! 2. candidates whose capabilities intersect the task tags, least loaded first
//! 3. the least loaded candidate
//!
//! [`RoutingStrategy::rank`] returns the whole ordering so callers can fall
//! through to the next-best candidate on `CapacityExceeded`. Alternative
//! backends plug in by implementing the same trait.

use std::collections::HashMap;

use crate::domain::error::CoordinationError;
use crate::domain::instance::{Instance, InstanceId};
use crate::domain::task::Task;

/// Open-task count per instance at decision time.
pub type LoadSnapshot = HashMap<InstanceId, usize>;

pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Eligible candidates, best first. Empty when nothing is eligible.
    fn rank(&self, task: &Task, candidates: &[Instance], load: &LoadSnapshot) -> Vec<Instance>;

    fn select_target(
        &self,
        task: &Task,
        candidates: &[Instance],
        load: &LoadSnapshot,
    ) -> Result<Instance, CoordinationError> {
        self.rank(task, candidates, load).into_iter().next().ok_or_else(|| {
            CoordinationError::RoutingFailure(format!(
                "no running candidate among {} for task {}",
                candidates.len(),
                task.id
            ))
        })
    }
}

/// Capability, then load based routing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityRouter;

impl CapabilityRouter {
    pub fn new() -> Self {
        Self
    }
}

fn tag_overlap(task: &Task, instance: &Instance) -> usize {
    instance
        .capabilities()
        .iter()
        .filter(|c| task.tags.contains(c.as_str()))
        .count()
}

impl RoutingStrategy for CapabilityRouter {
    fn name(&self) -> &'static str {
        "capability"
    }

    fn rank(&self, task: &Task, candidates: &[Instance], load: &LoadSnapshot) -> Vec<Instance> {
        let load_of = |i: &Instance| load.get(&i.id).copied().unwrap_or(0);

        let mut eligible: Vec<&Instance> = candidates.iter().filter(|c| c.is_running()).collect();
        // created_at keeps equal scores deterministic
        eligible.sort_by(|a, b| {
            let a_match = tag_overlap(task, a) > 0;
            let b_match = tag_overlap(task, b) > 0;
            b_match
                .cmp(&a_match)
                .then_with(|| load_of(a).cmp(&load_of(b)))
                .then_with(|| tag_overlap(task, b).cmp(&tag_overlap(task, a)))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        if let Some(assigned) = task.assigned_instance() {
            if let Some(pos) = eligible.iter().position(|c| c.id == assigned) {
                let pinned = eligible.remove(pos);
                eligible.insert(0, pinned);
            }
        }

        eligible.into_iter().cloned().collect()
    }
}

/// Route with the default strategy.
pub fn select_target(
    task: &Task,
    candidates: &[Instance],
    load: &LoadSnapshot,
) -> Result<Instance, CoordinationError> {
    CapabilityRouter.select_target(task, candidates, load)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::{InstanceStatus, Scope};
    use crate::domain::task::{TaskPriority, ASSIGNED_INSTANCE_KEY};
    use serde_json::{json, Map};

    fn project(name: &str, caps: &[&str], status: InstanceStatus) -> Instance {
        let mut i = Instance::new(
            name,
            Scope::Project,
            None,
            json!({ "capabilities": caps }).as_object().cloned().unwrap(),
        )
        .unwrap();
        i.status = status;
        i
    }

    fn task(tags: &[&str]) -> Task {
        Task::new(
            InstanceId::new(),
            "t",
            "",
            tags.iter().map(|s| s.to_string()),
            TaskPriority::Medium,
            Map::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_metadata_assignment_wins() {
        let a = project("a", &["rust"], InstanceStatus::Running);
        let b = project("b", &[], InstanceStatus::Running);
        let mut t = task(&["rust"]);
        t.metadata.insert(ASSIGNED_INSTANCE_KEY.into(), json!(b.id.to_string()));
        let picked = select_target(&t, &[a, b.clone()], &LoadSnapshot::new()).unwrap();
        assert_eq!(picked.id, b.id);
    }

    #[test]
    fn test_assignment_to_non_running_is_ignored() {
        let a = project("a", &[], InstanceStatus::Running);
        let b = project("b", &[], InstanceStatus::Paused);
        let mut t = task(&[]);
        t.metadata.insert(ASSIGNED_INSTANCE_KEY.into(), json!(b.id.to_string()));
        let picked = select_target(&t, &[a.clone(), b], &LoadSnapshot::new()).unwrap();
        assert_eq!(picked.id, a.id);
    }

    #[test]
    fn test_tag_match_beats_load() {
        let busy_match = project("busy", &["frontend"], InstanceStatus::Running);
        let idle = project("idle", &["backend"], InstanceStatus::Running);
        let load = LoadSnapshot::from([(busy_match.id, 7), (idle.id, 0)]);
        let picked = select_target(&task(&["frontend"]), &[idle, busy_match.clone()], &load).unwrap();
        assert_eq!(picked.id, busy_match.id);
    }

    #[test]
    fn test_tag_ties_broken_by_load() {
        let a = project("a", &["api"], InstanceStatus::Running);
        let b = project("b", &["api"], InstanceStatus::Running);
        let load = LoadSnapshot::from([(a.id, 3), (b.id, 1)]);
        let ranked = CapabilityRouter.rank(&task(&["api"]), &[a.clone(), b.clone()], &load);
        assert_eq!(ranked.iter().map(|i| i.id).collect::<Vec<_>>(), vec![b.id, a.id]);
    }

    #[test]
    fn test_pure_load_balance_without_tag_match() {
        let a = project("a", &["x"], InstanceStatus::Running);
        let b = project("b", &["y"], InstanceStatus::Running);
        let load = LoadSnapshot::from([(a.id, 2)]);
        let picked = select_target(&task(&["z"]), &[a, b.clone()], &load).unwrap();
        assert_eq!(picked.id, b.id);
    }

    #[test]
    fn test_only_running_candidates_are_eligible() {
        let statuses = [
            InstanceStatus::Paused,
            InstanceStatus::Stopping,
            InstanceStatus::Error,
            InstanceStatus::Terminated,
        ];
        let candidates: Vec<Instance> = statuses.iter().map(|s| project("x", &[], *s)).collect();
        let err = select_target(&task(&[]), &candidates, &LoadSnapshot::new()).unwrap_err();
        assert_eq!(err.error_kind(), "routing_failure");

        let err = select_target(&task(&[]), &[], &LoadSnapshot::new()).unwrap_err();
        assert_eq!(err.error_kind(), "routing_failure");
    }
}
