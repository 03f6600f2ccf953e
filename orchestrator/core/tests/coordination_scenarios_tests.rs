// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for hierarchical delegation
//!
//! Drives the wired services over the in-memory store: delegation down the
//! GLOBAL → PROJECT → ORCHESTRATION tree, completion bubbling back up,
//! capacity refusals, timeouts and the hierarchy invariants.

use canopy_core::application::delegator::SubtaskSpec;
use canopy_core::application::dispatch::DispatchOutcome;
use canopy_core::application::lifecycle::CreateInstanceRequest;
use canopy_core::application::repository_factory::Repositories;
use canopy_core::application::tasks::CreateTaskRequest;
use canopy_core::domain::config::CoordinatorConfigSpec;
use canopy_core::domain::delegation::DelegationStatus;
use canopy_core::domain::instance::{Instance, InstanceConfig, InstanceId, InstanceStatus, Scope};
use canopy_core::domain::scope_behavior::{ScopeAction, ScopePolicy, ScopeBehavior};
use canopy_core::domain::task::{Task, TaskStatus};
use canopy_core::infrastructure::event_bus::EventBus;
use canopy_core::infrastructure::repositories::InMemoryStore;
use canopy_core::presentation::api::AppState;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: InMemoryStore,
    state: AppState,
}

fn harness_with(spec: CoordinatorConfigSpec) -> Harness {
    let store = InMemoryStore::new();
    let repos = Repositories::in_memory(&store);
    let state = AppState::build(repos, &spec, Arc::new(EventBus::new(1024)));
    Harness { store, state }
}

fn harness() -> Harness {
    harness_with(CoordinatorConfigSpec::default())
}

impl Harness {
    async fn running(&self, name: &str, scope: Scope, parent: Option<InstanceId>, config: serde_json::Value) -> Instance {
        let created = self
            .state
            .lifecycle
            .create(CreateInstanceRequest {
                name: name.to_string(),
                scope,
                parent_id: parent,
                config: config.as_object().cloned().unwrap_or_default(),
            })
            .await
            .unwrap();
        self.state.lifecycle.start(created.id).await.unwrap()
    }

    /// g → p → o, all running.
    async fn tree(&self) -> (Instance, Instance, Instance) {
        let g = self.running("g", Scope::Global, None, json!({})).await;
        let p = self.running("p", Scope::Project, Some(g.id), json!({})).await;
        let o = self.running("o", Scope::Orchestration, Some(p.id), json!({})).await;
        (g, p, o)
    }

    async fn task(&self, owner: InstanceId, title: &str, tags: &[&str]) -> Task {
        self.state
            .tasks
            .create_task(CreateTaskRequest {
                instance_id: owner,
                title: title.to_string(),
                description: String::new(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                priority: Default::default(),
                metadata: Map::new(),
            })
            .await
            .unwrap()
    }

    async fn owner_of(&self, task: &Task) -> InstanceId {
        self.state.tasks.get_task(task.id).await.unwrap().instance_id
    }
}

/// Scenario A: delegate g → p → o, finish, bubble the whole chain.
#[tokio::test]
async fn test_scenario_a_delegate_down_and_bubble_up() {
    let h = harness();
    let (g, p, o) = h.tree().await;
    let t = h.task(g.id, "ship release", &[]).await;
    let delegator = &h.state.delegator;

    let d1 = delegator.delegate(t.id, p.id).await.unwrap();
    assert_eq!(d1.status, DelegationStatus::Pending);
    // ownership only moves on accept
    assert_eq!(h.owner_of(&t).await, g.id);
    delegator.accept(d1.id).await.unwrap();
    assert_eq!(h.owner_of(&t).await, p.id);

    let d2 = delegator.delegate(t.id, o.id).await.unwrap();
    delegator.accept(d2.id).await.unwrap();
    assert_eq!(h.owner_of(&t).await, o.id);

    h.state.tasks.update_status(t.id, TaskStatus::Done).await.unwrap();
    let report = h.state.bubbler.bubble(t.id).await.unwrap();
    assert_eq!(report.completed.len(), 2);

    let chain = delegator.find_chain(t.id).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!((chain[0].source_instance_id, chain[0].target_instance_id), (g.id, p.id));
    assert_eq!((chain[1].source_instance_id, chain[1].target_instance_id), (p.id, o.id));
    assert!(chain.iter().all(|d| d.status == DelegationStatus::Completed));
    assert!(chain.iter().all(|d| d.completed_at.is_some()));
}

/// Scenario B: GLOBAL cannot skip the PROJECT level.
#[tokio::test]
async fn test_scenario_b_skip_level_is_invalid_delegation() {
    let h = harness();
    let (g, _p, o) = h.tree().await;
    let t = h.task(g.id, "skip", &[]).await;

    let err = h.state.delegator.delegate(t.id, o.id).await.unwrap_err();
    assert_eq!(err.error_kind(), "invalid_delegation");
    assert!(h.state.delegator.find_chain(t.id).await.unwrap().is_empty());
    assert_eq!(h.owner_of(&t).await, g.id);
}

/// Scenario C: an ORCHESTRATION instance with zero capacity queues in its
/// own decision but refuses delegations; with no other candidate routing
/// fails.
#[tokio::test]
async fn test_scenario_c_capacity_exceeded_surfaces_routing_failure() {
    let h = harness();
    let g = h.running("g", Scope::Global, None, json!({})).await;
    let p = h.running("p", Scope::Project, Some(g.id), json!({})).await;
    let o = h
        .running("o", Scope::Orchestration, Some(p.id), json!({"max_concurrent_tasks": 0}))
        .await;

    // complex enough that the PROJECT will not execute it itself
    let t = h.task(p.id, "epic work", &["epic"]).await;
    let action = ScopePolicy::Orchestration.decide(&t, &o, &Default::default());
    assert_eq!(action, ScopeAction::Queue);

    let err = h.state.delegator.delegate(t.id, o.id).await.unwrap_err();
    assert_eq!(err.error_kind(), "capacity_exceeded");

    let err = h.state.dispatch.dispatch(t.id).await.unwrap_err();
    assert_eq!(err.error_kind(), "routing_failure");
    assert!(h.state.delegator.find_chain(t.id).await.unwrap().is_empty());
    assert_eq!(h.owner_of(&t).await, p.id);
}

/// Scenario D: a PENDING delegation past its acceptance window is rejected,
/// ownership is unchanged and the source decides again.
#[tokio::test]
async fn test_scenario_d_timeout_auto_rejects() {
    let h = harness();
    let (g, p, _o) = h.tree().await;
    let t = h.task(g.id, "slow", &[]).await;
    let d = h.state.delegator.delegate(t.id, p.id).await.unwrap();

    let outcome = h.state.delegator.expire(d.id).await.unwrap().unwrap();
    assert_eq!(outcome.delegation.status, DelegationStatus::Rejected);
    assert_eq!(outcome.delegation.rejection_reason.as_deref(), Some("timeout"));
    assert_eq!(h.owner_of(&t).await, g.id);
    // the only PROJECT is excluded, so GLOBAL's fallback still names DELEGATE
    assert_eq!(outcome.fallback.name(), "DELEGATE");

    // expiring twice is a no-op
    assert!(h.state.delegator.expire(d.id).await.unwrap().is_none());
}

/// Scenario D through the background reaper, without re-dispatch.
#[tokio::test]
async fn test_scenario_d_reaper_sweep() {
    let mut spec = CoordinatorConfigSpec::default();
    spec.delegation.redispatch_on_timeout = false;
    let h = harness_with(spec);
    let (g, p, _o) = h.tree().await;
    let t = h.task(g.id, "slow", &[]).await;
    let d = h.state.delegator.delegate(t.id, p.id).await.unwrap();

    let reaper = h.state.timeout_reaper().with_acceptance_timeout(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = reaper.sweep_once().await.unwrap();
    assert_eq!(report.expired, vec![d.id]);
    assert_eq!(report.redispatched, 0);
    assert_eq!(h.owner_of(&t).await, g.id);
    assert_eq!(
        h.state.delegator.get(d.id).await.unwrap().status,
        DelegationStatus::Rejected
    );
}

/// Single-GLOBAL invariant across a sequence of creates and a termination.
#[tokio::test]
async fn test_single_global_invariant() {
    let h = harness();
    let g = h.running("g", Scope::Global, None, json!({})).await;
    for _ in 0..3 {
        let err = h
            .state
            .lifecycle
            .create(CreateInstanceRequest {
                name: "g2".into(),
                scope: Scope::Global,
                parent_id: None,
                config: InstanceConfig::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "invalid_hierarchy");
    }
    h.state.lifecycle.stop(g.id).await.unwrap();
    h.state.lifecycle.terminate(g.id).await.unwrap();
    h.running("g2", Scope::Global, None, json!({})).await;

    let live: Vec<_> = h
        .state
        .lifecycle
        .list(Some(Scope::Global), None)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.status != InstanceStatus::Terminated)
        .collect();
    assert_eq!(live.len(), 1);
}

/// Scope adjacency holds for every parented instance.
#[tokio::test]
async fn test_scope_adjacency_invariant() {
    let h = harness();
    let (g, p, _o) = h.tree().await;
    let bad = h
        .state
        .lifecycle
        .create(CreateInstanceRequest {
            name: "bad".into(),
            scope: Scope::Orchestration,
            parent_id: Some(g.id),
            config: InstanceConfig::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(bad.error_kind(), "invalid_hierarchy");
    h.running("o2", Scope::Orchestration, Some(p.id), json!({})).await;

    let all = h.state.lifecycle.list(None, None).await.unwrap();
    for child in all.iter().filter(|i| i.parent_id.is_some()) {
        let parent = all.iter().find(|i| Some(i.id) == child.parent_id).unwrap();
        assert!(parent.scope.is_direct_parent_of(child.scope));
    }
}

/// Concurrent delegations of one task: exactly one opens.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_open_delegation_under_contention() {
    let h = harness();
    let g = h.running("g", Scope::Global, None, json!({})).await;
    let mut projects = Vec::new();
    for i in 0..6 {
        projects.push(h.running(&format!("p{}", i), Scope::Project, Some(g.id), json!({})).await);
    }
    let t = h.task(g.id, "contended", &[]).await;

    let mut handles = Vec::new();
    for p in &projects {
        let delegator = h.state.delegator.clone();
        let (task_id, target) = (t.id, p.id);
        handles.push(tokio::spawn(async move { delegator.delegate(task_id, target).await }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.error_kind(), "invalid_delegation"),
        }
    }
    assert_eq!(ok, 1);
    let open = h
        .state
        .delegator
        .find_chain(t.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.status.is_open())
        .count();
    assert_eq!(open, 1);
}

/// Reject leaves ownership where it was before `delegate`.
#[tokio::test]
async fn test_reject_keeps_ownership() {
    let h = harness();
    let (g, p, _o) = h.tree().await;
    let t = h.task(g.id, "t", &[]).await;
    let d = h.state.delegator.delegate(t.id, p.id).await.unwrap();
    let outcome = h.state.delegator.reject(d.id, "busy").await.unwrap();
    assert_eq!(outcome.delegation.rejection_reason.as_deref(), Some("busy"));
    assert_eq!(h.owner_of(&t).await, g.id);

    // the task can be delegated again once the head is final
    let again = h.state.delegator.delegate(t.id, p.id).await.unwrap();
    assert_eq!(again.status, DelegationStatus::Pending);
}

/// A second bubble of a completed chain writes nothing.
#[tokio::test]
async fn test_bubbling_idempotence() {
    let h = harness();
    let (g, p, o) = h.tree().await;
    let t = h.task(g.id, "t", &[]).await;
    let d1 = h.state.delegator.delegate(t.id, p.id).await.unwrap();
    h.state.delegator.accept(d1.id).await.unwrap();
    let d2 = h.state.delegator.delegate(t.id, o.id).await.unwrap();
    h.state.delegator.accept(d2.id).await.unwrap();
    h.state.tasks.update_status(t.id, TaskStatus::Done).await.unwrap();

    h.state.bubbler.bubble(t.id).await.unwrap();
    let chain_before = h.state.delegator.find_chain(t.id).await.unwrap();
    let writes_before = h.store.write_count();

    let second = h.state.bubbler.bubble(t.id).await.unwrap();
    assert!(second.is_noop());
    assert_eq!(h.store.write_count(), writes_before);
    assert_eq!(h.state.delegator.find_chain(t.id).await.unwrap(), chain_before);
}

/// Completion stops at a decomposition until every sibling is done, then
/// carries on up the parent task's chain.
#[tokio::test]
async fn test_decompose_aggregation_gates_propagation() {
    let h = harness();
    let g = h.running("g", Scope::Global, None, json!({})).await;
    let p = h.running("p", Scope::Project, Some(g.id), json!({})).await;
    let o1 = h.running("o1", Scope::Orchestration, Some(p.id), json!({})).await;
    let o2 = h.running("o2", Scope::Orchestration, Some(p.id), json!({})).await;

    let t = h.task(g.id, "feature", &[]).await;
    let top = h.state.delegator.delegate(t.id, p.id).await.unwrap();
    h.state.delegator.accept(top.id).await.unwrap();

    let decomposition = h
        .state
        .delegator
        .decompose(
            t.id,
            vec![
                SubtaskSpec {
                    title: "api".into(),
                    target_instance_id: Some(o1.id),
                    ..Default::default()
                },
                SubtaskSpec {
                    title: "ui".into(),
                    target_instance_id: Some(o2.id),
                    ..Default::default()
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(decomposition.parent.status, TaskStatus::Blocked);
    assert_eq!(decomposition.delegations.len(), 2);
    for d in &decomposition.delegations {
        h.state.delegator.accept(d.id).await.unwrap();
    }

    let (_, first) = h
        .state
        .delegator
        .complete(decomposition.delegations[0].id, Map::new())
        .await
        .unwrap();
    assert_eq!(first.halted_at, Some(decomposition.decomposition_id));
    let status = h.state.bubbler.aggregate_child_completions(t.id).await.unwrap();
    assert_eq!((status.completed, status.total, status.complete), (1, 2, false));
    assert_eq!(h.state.tasks.get_task(t.id).await.unwrap().status, TaskStatus::Blocked);
    assert_eq!(h.state.delegator.get(top.id).await.unwrap().status, DelegationStatus::Accepted);

    let (_, second) = h
        .state
        .delegator
        .complete(decomposition.delegations[1].id, Map::new())
        .await
        .unwrap();
    assert!(second.halted_at.is_none());
    assert!(second.completed.contains(&top.id));
    assert_eq!(h.state.tasks.get_task(t.id).await.unwrap().status, TaskStatus::Done);
    assert_eq!(h.state.delegator.get(top.id).await.unwrap().status, DelegationStatus::Completed);
}

/// Dispatch walks the tree with auto-accept until an ORCHESTRATION queues.
#[tokio::test]
async fn test_dispatch_with_auto_accept_reaches_orchestration() {
    let mut spec = CoordinatorConfigSpec::default();
    spec.delegation.auto_accept_scopes = vec![Scope::Project, Scope::Orchestration];
    let h = harness_with(spec);
    let (g, p, o) = h.tree().await;
    let t = h.task(g.id, "big", &["epic"]).await;

    match h.state.dispatch.dispatch(t.id).await.unwrap() {
        DispatchOutcome::Queued { instance } => assert_eq!(instance.id, o.id),
        other => panic!("expected Queued, got {:?}", other),
    }
    let chain = h.state.delegator.find_chain(t.id).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].target_instance_id, p.id);
    assert_eq!(h.owner_of(&t).await, o.id);
}

/// Terminating an instance rejects the delegations waiting on it.
#[tokio::test]
async fn test_termination_rejects_pending_delegations() {
    let h = harness();
    let (g, p, _o) = h.tree().await;
    let handler = Arc::new(h.state.lifecycle_event_handler());
    let token = handler.shutdown_token();
    let handle = handler.start();

    let t = h.task(g.id, "t", &[]).await;
    let d = h.state.delegator.delegate(t.id, p.id).await.unwrap();
    h.state.lifecycle.stop(p.id).await.unwrap();
    h.state.lifecycle.terminate(p.id).await.unwrap();

    let mut status = DelegationStatus::Pending;
    for _ in 0..100 {
        status = h.state.delegator.get(d.id).await.unwrap().status;
        if status != DelegationStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, DelegationStatus::Rejected);
    assert_eq!(h.owner_of(&t).await, g.id);

    token.cancel();
    handle.await.unwrap();
}
