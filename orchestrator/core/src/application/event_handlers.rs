// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle Event Handler
//!
//! Subscribes to instance lifecycle events from the event bus and keeps the
//! rest of the engine consistent with them:
//! - refreshes the [`InstanceRegistry`] cache on every lifecycle event
//! - rejects all PENDING delegations aimed at an instance that was terminated
//!
//! Runs as a background task. Errors are logged, never propagated.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::delegator::Delegator;
use crate::application::registry::InstanceRegistry;
use crate::domain::events::InstanceLifecycleEvent;
use crate::infrastructure::event_bus::{DomainEvent, EventBus, EventBusError};

pub const TERMINATED_REASON: &str = "target instance terminated";

pub struct LifecycleEventHandler {
    registry: Arc<InstanceRegistry>,
    delegator: Arc<Delegator>,
    event_bus: Arc<EventBus>,
    shutdown_token: tokio_util::sync::CancellationToken,
}

impl LifecycleEventHandler {
    pub fn new(registry: Arc<InstanceRegistry>, delegator: Arc<Delegator>, event_bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            delegator,
            event_bus,
            shutdown_token: tokio_util::sync::CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.shutdown_token.clone()
    }

    /// Apply one lifecycle event.
    pub async fn handle(&self, event: &InstanceLifecycleEvent) {
        self.registry.apply_event(event);
        if !event.is_termination() {
            return;
        }
        let instance = event.instance();
        match self
            .delegator
            .reject_pending_targeting(instance.id, TERMINATED_REASON)
            .await
        {
            Ok(rejected) if !rejected.is_empty() => info!(
                "Rejected {} pending delegations after {} was terminated",
                rejected.len(),
                instance.id
            ),
            Ok(_) => {}
            Err(e) => error!(
                instance_id = %instance.id,
                error = %e,
                "Failed to reject pending delegations for terminated instance"
            ),
        }
    }

    /// Subscribes immediately, so events published after this call returns
    /// are not missed.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!("Starting lifecycle event handler background task");
        let mut receiver = self.event_bus.subscribe();

        tokio::spawn(async move {
            let mut handled = 0u64;
            loop {
                let next = tokio::select! {
                    next = receiver.recv() => next,
                    _ = self.shutdown_token.cancelled() => {
                        info!("Shutdown signal received, stopping lifecycle event handler ({} events)", handled);
                        break;
                    }
                };
                match next {
                    Ok(DomainEvent::InstanceLifecycle(event)) => {
                        handled += 1;
                        self.handle(&event).await;
                    }
                    Ok(DomainEvent::Delegation(_)) => continue,
                    Err(EventBusError::Closed) => {
                        info!("Event bus closed, stopping lifecycle event handler ({} events)", handled);
                        break;
                    }
                    Err(EventBusError::Lagged(n)) => {
                        warn!("Lifecycle event handler lagged by {} events, rebuilding registry", n);
                        if let Err(e) = self.registry.rebuild().await {
                            error!(error = %e, "Registry rebuild after lag failed");
                        }
                    }
                    Err(EventBusError::Empty) => debug!("Lifecycle event handler woke with no event"),
                }
            }
        })
    }
}
