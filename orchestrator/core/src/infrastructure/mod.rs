// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod event_bus;
pub mod repositories;
pub mod task_locks;

pub use event_bus::{DomainEvent, EventBus, EventBusError, EventReceiver};
pub use repositories::InMemoryStore;
pub use task_locks::{InMemoryTaskLocks, KeyedLocks, PostgresTaskLocks};
