// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP API
//!
//! Thin axum handlers over the application services. Every failure is
//! returned as `{error_kind, message}` with the status code of its kind;
//! creation endpoints answer 201.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};
use uuid::Uuid;

use crate::application::bubbler::CompletionBubbler;
use crate::application::delegator::{Delegator, SubtaskSpec};
use crate::application::dispatch::DispatchService;
use crate::application::event_handlers::LifecycleEventHandler;
use crate::application::lifecycle::{CreateInstanceRequest, InstanceLifecycleManager};
use crate::application::registry::InstanceRegistry;
use crate::application::repository_factory::Repositories;
use crate::application::retry::ReadRetry;
use crate::application::tasks::{CreateTaskRequest, TaskService};
use crate::application::timeout::TimeoutReaper;
use crate::domain::config::CoordinatorConfigSpec;
use crate::domain::delegation::DelegationId;
use crate::domain::error::CoordinationError;
use crate::domain::instance::{InstanceId, InstanceStatus, Scope};
use crate::domain::task::{TaskId, TaskStatus};
use crate::infrastructure::event_bus::EventBus;

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<InstanceLifecycleManager>,
    pub registry: Arc<InstanceRegistry>,
    pub tasks: Arc<TaskService>,
    pub delegator: Arc<Delegator>,
    pub bubbler: Arc<CompletionBubbler>,
    pub dispatch: Arc<DispatchService>,
    pub event_bus: Arc<EventBus>,
    pub repositories: Repositories,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every service over one repository set.
    pub fn build(repos: Repositories, spec: &CoordinatorConfigSpec, event_bus: Arc<EventBus>) -> Self {
        let retry = ReadRetry::from_config(&spec.retry);
        let lifecycle = Arc::new(
            InstanceLifecycleManager::new(repos.instances.clone(), event_bus.clone()).with_retry(retry),
        );
        let registry = Arc::new(InstanceRegistry::new(repos.instances.clone()).with_retry(retry));
        let bubbler = Arc::new(CompletionBubbler::new(&repos, event_bus.clone()).with_retry(retry));
        let delegator = Arc::new(
            Delegator::new(&repos, bubbler.clone(), event_bus.clone(), spec.delegation.clone())
                .with_retry(retry),
        );
        let dispatch = Arc::new(DispatchService::new(&repos, delegator.clone(), lifecycle.clone()));
        let tasks = Arc::new(
            TaskService::new(repos.instances.clone(), repos.tasks.clone(), repos.locks.clone())
                .with_retry(retry),
        );

        Self {
            lifecycle,
            registry,
            tasks,
            delegator,
            bubbler,
            dispatch,
            event_bus,
            repositories: repos,
            started_at: Instant::now(),
        }
    }

    /// Background expiry of stale PENDING delegations.
    pub fn timeout_reaper(&self) -> TimeoutReaper {
        let config = self.delegator.config();
        let reaper = TimeoutReaper::new(
            self.repositories.delegations.clone(),
            self.delegator.clone(),
            config,
        );
        if config.redispatch_on_timeout {
            reaper.with_redispatch(self.dispatch.clone())
        } else {
            reaper
        }
    }

    pub fn lifecycle_event_handler(&self) -> LifecycleEventHandler {
        LifecycleEventHandler::new(
            self.registry.clone(),
            self.delegator.clone(),
            self.event_bus.clone(),
        )
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instances", post(create_instance).get(list_instances))
        .route("/instances/{id}", get(get_instance))
        .route("/instances/{id}/start", post(start_instance))
        .route("/instances/{id}/stop", post(stop_instance))
        .route("/instances/{id}/pause", post(pause_instance))
        .route("/instances/{id}/resume", post(resume_instance))
        .route("/instances/{id}/terminate", post(terminate_instance))
        .route("/instances/{id}/parent", post(assign_parent))
        .route("/instances/{id}/children", get(instance_children))
        .route("/instances/{id}/ancestors", get(instance_ancestors))
        .route("/instances/{id}/hierarchy", get(instance_hierarchy))
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/status", post(update_task_status))
        .route("/tasks/{id}/delegate", post(delegate_task))
        .route("/tasks/{id}/dispatch", post(dispatch_task))
        .route("/tasks/{id}/escalate", post(escalate_task))
        .route("/tasks/{id}/decompose", post(decompose_task))
        .route("/tasks/{id}/bubble", post(bubble_task))
        .route("/tasks/{id}/delegation-chain", get(delegation_chain))
        .route("/delegations/export", get(export_delegations))
        .route("/delegations/{id}", get(get_delegation))
        .route("/delegations/{id}/accept", post(accept_delegation))
        .route("/delegations/{id}/reject", post(reject_delegation))
        .route("/delegations/{id}/complete", post(complete_delegation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error_kind: &'static str,
    pub message: String,
}

impl ApiError {
    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            error_kind: "invalid_input",
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.error_kind {
            "not_found" => StatusCode::NOT_FOUND,
            "invalid_input" => StatusCode::BAD_REQUEST,
            "invalid_hierarchy" | "routing_failure" => StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_transition" | "invalid_delegation" | "capacity_exceeded" => StatusCode::CONFLICT,
            "timeout_expired" => StatusCode::REQUEST_TIMEOUT,
            "storage_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoordinationError> for ApiError {
    fn from(err: CoordinationError) -> Self {
        Self {
            error_kind: err.error_kind(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_input(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(kind = self.error_kind, "Request failed: {}", self.message);
        } else {
            debug!(kind = self.error_kind, "Request rejected: {}", self.message);
        }
        (status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;
type IdPath = Result<Path<Uuid>, PathRejection>;

fn created<T: Serialize>(body: T) -> Response {
    (StatusCode::CREATED, Json(body)).into_response()
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct InstanceFilter {
    pub scope: Option<Scope>,
    pub status: Option<InstanceStatus>,
}

#[derive(Debug, Deserialize)]
pub struct AssignParentRequest {
    pub parent_id: InstanceId,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    pub target_instance_id: InstanceId,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecomposeRequest {
    pub subtasks: Vec<SubtaskSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub result: Map<String, Value>,
}

// ============================================================================
// Health
// ============================================================================

async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let registry = state.registry.health().await?;
    Ok(Json(json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "registry": registry,
    })))
}

// ============================================================================
// Instances
// ============================================================================

async fn create_instance(
    State(state): State<AppState>,
    payload: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let instance = state.lifecycle.create(request).await?;
    Ok(created(instance))
}

async fn list_instances(
    State(state): State<AppState>,
    filter: Result<Query<InstanceFilter>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(filter) = filter?;
    let instances = state.lifecycle.list(filter.scope, filter.status).await?;
    Ok(Json(instances).into_response())
}

async fn get_instance(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.lifecycle.get(InstanceId(id)).await?).into_response())
}

async fn start_instance(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.lifecycle.start(InstanceId(id)).await?).into_response())
}

async fn stop_instance(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.lifecycle.stop(InstanceId(id)).await?).into_response())
}

async fn pause_instance(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.lifecycle.pause(InstanceId(id)).await?).into_response())
}

async fn resume_instance(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.lifecycle.resume(InstanceId(id)).await?).into_response())
}

async fn terminate_instance(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.lifecycle.terminate(InstanceId(id)).await?).into_response())
}

async fn assign_parent(
    State(state): State<AppState>,
    id: IdPath,
    payload: Result<Json<AssignParentRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Path(id) = id?;
    let Json(body) = payload?;
    let instance = state.lifecycle.assign_parent(InstanceId(id), body.parent_id).await?;
    Ok(Json(instance).into_response())
}

async fn instance_children(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    let id = InstanceId(id);
    // unknown ids are a 404, not an empty list
    state.registry.get(id).await?;
    Ok(Json(state.registry.children(id).await?).into_response())
}

async fn instance_ancestors(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.registry.ancestors(InstanceId(id)).await?).into_response())
}

async fn instance_hierarchy(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.registry.hierarchy(InstanceId(id)).await?).into_response())
}

// ============================================================================
// Tasks
// ============================================================================

async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    Ok(created(state.tasks.create_task(request).await?))
}

async fn get_task(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.tasks.get_task(TaskId(id)).await?).into_response())
}

async fn update_task_status(
    State(state): State<AppState>,
    id: IdPath,
    payload: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Path(id) = id?;
    let Json(body) = payload?;
    Ok(Json(state.tasks.update_status(TaskId(id), body.status).await?).into_response())
}

async fn delegate_task(
    State(state): State<AppState>,
    id: IdPath,
    payload: Result<Json<DelegateRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Path(id) = id?;
    let Json(body) = payload?;
    let delegation = state.delegator.delegate(TaskId(id), body.target_instance_id).await?;
    Ok(created(delegation))
}

async fn dispatch_task(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.dispatch.dispatch(TaskId(id)).await?).into_response())
}

/// Body of a POST whose payload may be omitted entirely.
fn optional_body<T: Default>(payload: Result<Option<Json<T>>, JsonRejection>) -> ApiResult<T> {
    Ok(payload?.map(|Json(body)| body).unwrap_or_default())
}

async fn escalate_task(
    State(state): State<AppState>,
    id: IdPath,
    payload: Result<Option<Json<ReasonRequest>>, JsonRejection>,
) -> ApiResult<Response> {
    let Path(id) = id?;
    let body = optional_body(payload)?;
    let reason = body.reason.unwrap_or_else(|| "escalated".to_string());
    Ok(created(state.delegator.escalate(TaskId(id), &reason).await?))
}

async fn decompose_task(
    State(state): State<AppState>,
    id: IdPath,
    payload: Result<Json<DecomposeRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Path(id) = id?;
    let Json(body) = payload?;
    Ok(created(state.delegator.decompose(TaskId(id), body.subtasks).await?))
}

async fn bubble_task(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.bubbler.bubble(TaskId(id)).await?).into_response())
}

async fn delegation_chain(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.delegator.find_chain(TaskId(id)).await?).into_response())
}

// ============================================================================
// Delegations
// ============================================================================

async fn export_delegations(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.delegator.export_history().await?).into_response())
}

async fn get_delegation(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.delegator.get(DelegationId(id)).await?).into_response())
}

async fn accept_delegation(State(state): State<AppState>, id: IdPath) -> ApiResult<Response> {
    let Path(id) = id?;
    Ok(Json(state.delegator.accept(DelegationId(id)).await?).into_response())
}

async fn reject_delegation(
    State(state): State<AppState>,
    id: IdPath,
    payload: Result<Option<Json<ReasonRequest>>, JsonRejection>,
) -> ApiResult<Response> {
    let Path(id) = id?;
    let body = optional_body(payload)?;
    let reason = body.reason.unwrap_or_else(|| "rejected".to_string());
    Ok(Json(state.delegator.reject(DelegationId(id), &reason).await?).into_response())
}

async fn complete_delegation(
    State(state): State<AppState>,
    id: IdPath,
    payload: Result<Option<Json<CompleteRequest>>, JsonRejection>,
) -> ApiResult<Response> {
    let Path(id) = id?;
    let body = optional_body(payload)?;
    let (delegation, bubble) = state.delegator.complete(DelegationId(id), body.result).await?;
    Ok(Json(json!({ "delegation": delegation, "bubble": bubble })).into_response())
}
