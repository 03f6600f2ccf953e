// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Canopy CLI

pub mod config;
pub mod instance;
pub mod task;

pub use self::config::ConfigCommand;
pub use self::instance::InstanceCommand;
pub use self::task::TaskCommand;
