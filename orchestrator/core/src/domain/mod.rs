// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Aggregates, state machines, routing policy and repository contracts for
//! the instance hierarchy. Nothing in here performs I/O.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and invariants consumed by `application`

pub mod config;
pub mod delegation;
pub mod error;
pub mod events;
pub mod instance;
pub mod repository;
pub mod router;
pub mod scope_behavior;
pub mod task;
