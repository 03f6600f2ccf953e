// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Timeout Reaper - Background task
//!
//! Periodically expires PENDING delegations that outlived the acceptance
//! window. An expired delegation is rejected with reason `timeout`, which
//! hands the task back to the source's scope behavior; when configured the
//! task is then dispatched again without the unresponsive target.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::application::delegator::Delegator;
use crate::application::dispatch::DispatchService;
use crate::domain::config::DelegationConfig;
use crate::domain::delegation::DelegationId;
use crate::domain::error::CoordinationError;
use crate::domain::repository::DelegationRepository;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub expired: Vec<DelegationId>,
    pub redispatched: usize,
    pub redispatch_failures: usize,
    /// Delegations whose expiry failed; the next sweep picks them up again.
    pub expire_failures: usize,
}

pub struct TimeoutReaper {
    delegations: Arc<dyn DelegationRepository>,
    delegator: Arc<Delegator>,
    dispatch: Option<Arc<DispatchService>>,
    acceptance_timeout: Duration,
    sweep_interval: Duration,
    shutdown_token: tokio_util::sync::CancellationToken,
}

impl TimeoutReaper {
    pub fn new(
        delegations: Arc<dyn DelegationRepository>,
        delegator: Arc<Delegator>,
        config: &DelegationConfig,
    ) -> Self {
        Self {
            delegations,
            delegator,
            dispatch: None,
            acceptance_timeout: config.acceptance_timeout(),
            sweep_interval: config.sweep_interval(),
            shutdown_token: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Re-dispatch expired tasks through `dispatch`.
    pub fn with_redispatch(mut self, dispatch: Arc<DispatchService>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_acceptance_timeout(mut self, timeout: Duration) -> Self {
        self.acceptance_timeout = timeout;
        self
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            acceptance_timeout_secs = self.acceptance_timeout.as_secs(),
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "Starting delegation timeout reaper"
        );

        let mut tick = interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if !report.expired.is_empty() => {
                            info!(
                                expired = report.expired.len(),
                                redispatched = report.redispatched,
                                "Timeout sweep expired delegations"
                            );
                        }
                        Ok(_) => debug!("Timeout sweep found nothing to expire"),
                        Err(e) => warn!("Timeout sweep failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping timeout reaper");
                    break;
                }
            }
        }
    }

    /// Expire everything currently past the acceptance window.
    pub async fn sweep_once(&self) -> Result<SweepReport, CoordinationError> {
        let window = chrono::Duration::from_std(self.acceptance_timeout)
            .map_err(|e| CoordinationError::InvalidInput(format!("acceptance timeout out of range: {}", e)))?;
        let cutoff = Utc::now() - window;
        let stale = self.delegations.find_pending_older_than(cutoff).await?;

        let mut report = SweepReport::default();
        for delegation in stale {
            let outcome = match self.delegator.expire(delegation.id).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Delegation {} could not be expired: {}", delegation.id, e);
                    report.expire_failures += 1;
                    continue;
                }
            };
            report.expired.push(outcome.delegation.id);

            let Some(dispatch) = &self.dispatch else {
                continue;
            };
            match dispatch
                .redispatch(outcome.delegation.task_id, vec![outcome.delegation.target_instance_id])
                .await
            {
                Ok(_) => report.redispatched += 1,
                Err(e) => {
                    warn!(
                        "Task {} could not be re-dispatched after timeout: {}",
                        outcome.delegation.task_id, e
                    );
                    report.redispatch_failures += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::bubbler::CompletionBubbler;
    use crate::application::lifecycle::InstanceLifecycleManager;
    use crate::application::repository_factory::Repositories;
    use crate::application::retry::ReadRetry;
    use crate::domain::instance::{Instance, InstanceConfig, Scope};
    use crate::domain::task::{Task, TaskPriority};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::InMemoryStore;
    use serde_json::Map;

    fn running(name: &str, scope: Scope, parent: Option<crate::domain::instance::InstanceId>) -> Instance {
        let mut i = Instance::new(name, scope, parent, InstanceConfig::new()).unwrap();
        i.begin_start().unwrap();
        i.mark_running().unwrap();
        i
    }

    #[tokio::test]
    async fn test_sweep_expires_and_redispatches() {
        let store = InMemoryStore::new();
        let repos = Repositories::in_memory(&store);
        let bus = Arc::new(EventBus::new(256));
        let config = DelegationConfig::default();

        let g = running("g", Scope::Global, None);
        let p1 = running("p1", Scope::Project, Some(g.id));
        let p2 = running("p2", Scope::Project, Some(g.id));
        for i in [&g, &p1, &p2] {
            repos.instances.save(i).await.unwrap();
        }
        let t = Task::new(g.id, "t", "", Vec::new(), TaskPriority::Low, Map::new()).unwrap();
        repos.tasks.save(&t).await.unwrap();

        let bubbler = Arc::new(CompletionBubbler::new(&repos, bus.clone()));
        let delegator = Arc::new(Delegator::new(&repos, bubbler, bus.clone(), config.clone()));
        let lifecycle = Arc::new(InstanceLifecycleManager::new(repos.instances.clone(), bus));
        let dispatch = Arc::new(DispatchService::new(&repos, delegator.clone(), lifecycle));
        let first = delegator.delegate(t.id, p1.id).await.unwrap();

        let reaper = TimeoutReaper::new(repos.delegations.clone(), delegator.clone(), &config)
            .with_redispatch(dispatch);
        // nothing is old enough under the default window
        assert!(reaper.sweep_once().await.unwrap().expired.is_empty());

        let reaper = reaper.with_acceptance_timeout(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = reaper.sweep_once().await.unwrap();
        assert_eq!(report.expired, vec![first.id]);
        assert_eq!(report.redispatched, 1);

        let chain = delegator.find_chain(t.id).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].rejection_reason.as_deref(), Some("timeout"));
        assert_eq!(chain[1].target_instance_id, p2.id);
        assert!(chain[1].is_pending());
    }

    #[tokio::test]
    async fn test_sweep_continues_past_a_failed_expiry() {
        let store = InMemoryStore::new();
        let repos = Repositories::in_memory(&store);
        let bus = Arc::new(EventBus::new(256));
        let config = DelegationConfig::default();

        let g = running("g", Scope::Global, None);
        let p = running("p", Scope::Project, Some(g.id));
        for i in [&g, &p] {
            repos.instances.save(i).await.unwrap();
        }
        let bubbler = Arc::new(CompletionBubbler::new(&repos, bus.clone()).with_retry(ReadRetry::none()));
        let delegator =
            Arc::new(Delegator::new(&repos, bubbler, bus, config.clone()).with_retry(ReadRetry::none()));
        let mut delegations = Vec::new();
        for _ in 0..2 {
            let t = Task::new(g.id, "t", "", Vec::new(), TaskPriority::Low, Map::new()).unwrap();
            repos.tasks.save(&t).await.unwrap();
            delegations.push(delegator.delegate(t.id, p.id).await.unwrap());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let reaper = TimeoutReaper::new(repos.delegations.clone(), delegator.clone(), &config)
            .with_acceptance_timeout(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // the listing succeeds, the first expiry's read fails
        store.fail_reads_after(1, 1);
        let report = reaper.sweep_once().await.unwrap();
        assert_eq!(report.expire_failures, 1);
        assert_eq!(report.expired, vec![delegations[1].id]);

        let report = reaper.sweep_once().await.unwrap();
        assert_eq!(report.expired, vec![delegations[0].id]);
        assert_eq!(report.expire_failures, 0);
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_loop() {
        let store = InMemoryStore::new();
        let repos = Repositories::in_memory(&store);
        let bus = Arc::new(EventBus::new(16));
        let bubbler = Arc::new(CompletionBubbler::new(&repos, bus.clone()));
        let delegator = Arc::new(Delegator::new(&repos, bubbler, bus, DelegationConfig::default()));
        let reaper = Arc::new(TimeoutReaper::new(
            repos.delegations.clone(),
            delegator,
            &DelegationConfig {
                sweep_interval_seconds: 1,
                ..DelegationConfig::default()
            },
        ));
        let token = reaper.shutdown_token();
        let handle = reaper.start();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
