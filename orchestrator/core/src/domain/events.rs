// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::delegation::{DecompositionId, Delegation, DelegationId};
use crate::domain::instance::{Instance, InstanceId, InstanceStatus, Scope};
use crate::domain::task::TaskId;

/// Emitted by the lifecycle manager after every committed instance write.
/// Carries the full instance so the registry can refresh without a read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstanceLifecycleEvent {
    InstanceCreated {
        instance: Instance,
        created_at: DateTime<Utc>,
    },
    InstanceStatusChanged {
        instance: Instance,
        from: InstanceStatus,
        changed_at: DateTime<Utc>,
    },
    ParentAssigned {
        instance: Instance,
        parent_id: InstanceId,
        assigned_at: DateTime<Utc>,
    },
}

impl InstanceLifecycleEvent {
    pub fn instance(&self) -> &Instance {
        match self {
            Self::InstanceCreated { instance, .. }
            | Self::InstanceStatusChanged { instance, .. }
            | Self::ParentAssigned { instance, .. } => instance,
        }
    }

    /// True when this event moved an instance into `Terminated`.
    pub fn is_termination(&self) -> bool {
        matches!(
            self,
            Self::InstanceStatusChanged { instance, .. } if instance.status == InstanceStatus::Terminated
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DelegationEvent {
    DelegationCreated {
        delegation: Delegation,
    },
    DelegationAccepted {
        delegation: Delegation,
    },
    DelegationRejected {
        delegation: Delegation,
        reason: String,
    },
    DelegationCompleted {
        delegation: Delegation,
    },
    /// A parent instance's scope behavior was notified during bubbling.
    ChildCompleted {
        delegation_id: DelegationId,
        task_id: TaskId,
        parent_instance_id: InstanceId,
        parent_scope: Scope,
        summary: String,
        notified_at: DateTime<Utc>,
    },
    TaskDecomposed {
        task_id: TaskId,
        decomposition_id: DecompositionId,
        subtasks: Vec<TaskId>,
        decomposed_at: DateTime<Utc>,
    },
    TaskEscalated {
        delegation: Delegation,
        reason: String,
    },
}
