// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Application Layer (`canopy-core`)
//!
//! Use-case services over the repository traits. Services hold
//! `Arc<dyn …Repository>` handles and no mutable state of their own beyond
//! caches and per-process serialization.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`lifecycle`] | Instance create / start / stop / pause / resume / terminate |
//! | [`registry`] | Cached hierarchy queries |
//! | [`decision`] | Load and context inputs for scope behaviors |
//! | [`delegator`] | Delegation state machine, escalation, decomposition |
//! | [`bubbler`] | Completion propagation up the chain |
//! | [`dispatch`] | Routes a task down the tree until it executes or waits |
//! | [`timeout`] | Background expiry of stale PENDING delegations |
//! | [`tasks`] | Task creation and status updates |
//! | [`event_handlers`] | Reacts to lifecycle events |

pub mod bubbler;
pub mod decision;
pub mod delegator;
pub mod dispatch;
pub mod event_handlers;
pub mod lifecycle;
pub mod registry;
pub mod repository_factory;
pub mod retry;
pub mod tasks;
pub mod timeout;

pub use bubbler::{AggregationStatus, BubbleReport, CompletionBubbler};
pub use delegator::{Decomposition, Delegator, RejectOutcome, SubtaskSpec};
pub use dispatch::{DispatchOutcome, DispatchService};
pub use event_handlers::LifecycleEventHandler;
pub use lifecycle::{CreateInstanceRequest, InstanceLifecycleManager, LifecycleHooks, NoopLifecycleHooks};
pub use registry::{HierarchyNode, InstanceRegistry, RegistryHealth};
pub use repository_factory::Repositories;
pub use retry::ReadRetry;
pub use tasks::{CreateTaskRequest, TaskService};
pub use timeout::{SweepReport, TimeoutReaper};
