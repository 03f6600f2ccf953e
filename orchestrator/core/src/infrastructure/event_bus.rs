// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming over a tokio broadcast channel. The instance
// registry and the lifecycle event handler are its main subscribers.
// Events are not persisted; a lagging receiver loses the oldest ones.

use crate::domain::events::{DelegationEvent, InstanceLifecycleEvent};
use crate::domain::task::TaskId;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    InstanceLifecycle(InstanceLifecycleEvent),
    Delegation(DelegationEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_instance_event(&self, event: InstanceLifecycleEvent) {
        self.publish(DomainEvent::InstanceLifecycle(event));
    }

    pub fn publish_delegation_event(&self, event: DelegationEvent) {
        self.publish(DomainEvent::Delegation(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to delegation events of a single task.
    pub fn subscribe_task(&self, task_id: TaskId) -> TaskEventReceiver {
        TaskEventReceiver {
            receiver: self.sender.subscribe(),
            task_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for delegation events of one task (filtered)
pub struct TaskEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    task_id: TaskId,
}

impl TaskEventReceiver {
    pub async fn recv(&mut self) -> Result<DelegationEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let DomainEvent::Delegation(delegation_event) = event {
                if self.matches_task(&delegation_event) {
                    return Ok(delegation_event);
                }
            }
        }
    }

    fn matches_task(&self, event: &DelegationEvent) -> bool {
        match event {
            DelegationEvent::DelegationCreated { delegation }
            | DelegationEvent::DelegationAccepted { delegation }
            | DelegationEvent::DelegationRejected { delegation, .. }
            | DelegationEvent::DelegationCompleted { delegation }
            | DelegationEvent::TaskEscalated { delegation, .. } => delegation.task_id == self.task_id,
            DelegationEvent::ChildCompleted { task_id, .. }
            | DelegationEvent::TaskDecomposed { task_id, .. } => *task_id == self.task_id,
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delegation::{Delegation, DelegationType};
    use crate::domain::instance::{Instance, InstanceConfig, InstanceId, Scope};
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let instance = Instance::new("g", Scope::Global, None, InstanceConfig::new()).unwrap();
        event_bus.publish_instance_event(InstanceLifecycleEvent::InstanceCreated {
            instance: instance.clone(),
            created_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::InstanceLifecycle(event) => assert_eq!(event.instance().id, instance.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_task_filtered_receiver() {
        let event_bus = EventBus::new(10);
        let wanted = TaskId::new();
        let mut receiver = event_bus.subscribe_task(wanted);

        let other = Delegation::new(TaskId::new(), InstanceId::new(), InstanceId::new(), DelegationType::Route);
        let mine = Delegation::new(wanted, InstanceId::new(), InstanceId::new(), DelegationType::Route);
        event_bus.publish_delegation_event(DelegationEvent::DelegationCreated { delegation: other });
        event_bus.publish_delegation_event(DelegationEvent::DelegationCreated {
            delegation: mine.clone(),
        });

        match receiver.recv().await.unwrap() {
            DelegationEvent::DelegationCreated { delegation } => assert_eq!(delegation.id, mine.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let event_bus = EventBus::default();
        assert_eq!(event_bus.subscriber_count(), 0);
        let mut receiver = event_bus.subscribe();
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }
}
