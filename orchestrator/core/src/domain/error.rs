// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordination error taxonomy.
//!
//! Every caller-facing failure carries a stable [`CoordinationError::error_kind`]
//! string. `TimeoutExpired` exists for completeness of the taxonomy but is
//! handled internally by the timeout reaper and never returned from the API.

use thiserror::Error;

use crate::domain::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("invalid hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("cannot {action} {entity} {id} in state {current}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        action: &'static str,
        current: String,
    },

    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),

    #[error("routing failure: {0}")]
    RoutingFailure(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("delegation {0} exceeded its acceptance window")]
    TimeoutExpired(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoordinationError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidHierarchy(_) => "invalid_hierarchy",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidDelegation(_) => "invalid_delegation",
            Self::RoutingFailure(_) => "routing_failure",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::TimeoutExpired(_) => "timeout_expired",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::NotFound { .. } => "not_found",
            Self::InvalidInput(_) => "invalid_input",
        }
    }

    /// Whether the call site may retry. Only storage failures qualify, and
    /// only for reads; capacity retries happen against a different target.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<RepositoryError> for CoordinationError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => Self::NotFound {
                entity: "record",
                id: what,
            },
            RepositoryError::Database(msg) => Self::StorageUnavailable(msg),
            RepositoryError::Serialization(msg) => {
                Self::StorageUnavailable(format!("corrupt record: {}", msg))
            }
            RepositoryError::Conflict { constraint, message } => {
                if constraint.contains("global") || constraint.contains("instance") {
                    Self::InvalidHierarchy(message)
                } else {
                    Self::InvalidDelegation(message)
                }
            }
        }
    }
}
