// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Canopy Core
//!
//! Coordination engine for a GLOBAL → PROJECT → ORCHESTRATION tree of
//! instances that delegate tasks downward and bubble completion upward.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, application services, storage adapters and
//!   the HTTP surface consumed by the `canopy` binary

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
