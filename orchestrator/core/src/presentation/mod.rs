// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`canopy-core`)
//!
//! HTTP surface that translates external requests into application service
//! calls. No coordination logic lives here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | Instance, task and delegation endpoints |

pub mod api;

pub use api::{app, ApiError, AppState};
