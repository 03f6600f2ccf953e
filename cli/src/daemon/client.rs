// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for the coordinator API

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use canopy_core::domain::delegation::Delegation;
use canopy_core::domain::instance::{Instance, InstanceStatus, Scope};
use canopy_core::domain::task::{Task, TaskPriority};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error_kind: String,
    message: String,
}

#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    client: Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_base_url(super::base_url(host, port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send and decode; API errors surface as `Failed to <what> (<error_kind>): <message>`.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to {}", what))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => anyhow::bail!("Failed to {} ({}): {}", what, body.error_kind, body.message),
                Err(_) => anyhow::bail!("Failed to {}: HTTP {} {}", what, status, text),
            }
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response to {}", what))
    }

    pub async fn health(&self) -> Result<Value> {
        self.send(self.client.get(self.url("/health")), "check health").await
    }

    // ---- instances ----

    pub async fn create_instance(
        &self,
        name: &str,
        scope: Scope,
        parent_id: Option<Uuid>,
        config: Map<String, Value>,
    ) -> Result<Instance> {
        let body = json!({
            "name": name,
            "scope": scope,
            "parent_id": parent_id,
            "config": config,
        });
        self.send(
            self.client.post(self.url("/instances")).json(&body),
            "create instance",
        )
        .await
    }

    pub async fn list_instances(
        &self,
        scope: Option<Scope>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>> {
        let mut filters = Vec::new();
        if let Some(scope) = scope {
            filters.push(format!("scope={}", scope.as_str()));
        }
        if let Some(status) = status {
            filters.push(format!("status={}", status.as_str()));
        }
        let mut path = "/instances".to_string();
        if !filters.is_empty() {
            path.push('?');
            path.push_str(&filters.join("&"));
        }
        self.send(self.client.get(self.url(&path)), "list instances")
            .await
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<Instance> {
        self.send(
            self.client.get(self.url(&format!("/instances/{}", id))),
            "get instance",
        )
        .await
    }

    /// `start`, `stop`, `pause`, `resume` or `terminate`.
    pub async fn instance_action(&self, id: Uuid, action: &str) -> Result<Instance> {
        self.send(
            self.client.post(self.url(&format!("/instances/{}/{}", id, action))),
            &format!("{} instance", action),
        )
        .await
    }

    pub async fn hierarchy(&self, id: Uuid) -> Result<Value> {
        self.send(
            self.client.get(self.url(&format!("/instances/{}/hierarchy", id))),
            "get hierarchy",
        )
        .await
    }

    // ---- tasks ----

    pub async fn create_task(
        &self,
        instance_id: Uuid,
        title: &str,
        description: &str,
        tags: &[String],
        priority: TaskPriority,
        metadata: Map<String, Value>,
    ) -> Result<Task> {
        let body = json!({
            "instance_id": instance_id,
            "title": title,
            "description": description,
            "tags": tags,
            "priority": priority,
            "metadata": metadata,
        });
        self.send(self.client.post(self.url("/tasks")).json(&body), "create task")
            .await
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.send(self.client.get(self.url(&format!("/tasks/{}", id))), "get task")
            .await
    }

    pub async fn dispatch_task(&self, id: Uuid) -> Result<Value> {
        self.send(
            self.client.post(self.url(&format!("/tasks/{}/dispatch", id))),
            "dispatch task",
        )
        .await
    }

    pub async fn delegate_task(&self, id: Uuid, target: Uuid) -> Result<Delegation> {
        self.send(
            self.client
                .post(self.url(&format!("/tasks/{}/delegate", id)))
                .json(&json!({ "target_instance_id": target })),
            "delegate task",
        )
        .await
    }

    pub async fn delegation_chain(&self, id: Uuid) -> Result<Vec<Delegation>> {
        self.send(
            self.client.get(self.url(&format!("/tasks/{}/delegation-chain", id))),
            "get delegation chain",
        )
        .await
    }

    // ---- delegations ----

    pub async fn accept_delegation(&self, id: Uuid) -> Result<Delegation> {
        self.send(
            self.client.post(self.url(&format!("/delegations/{}/accept", id))),
            "accept delegation",
        )
        .await
    }

    pub async fn complete_delegation(&self, id: Uuid, result: Map<String, Value>) -> Result<Value> {
        self.send(
            self.client
                .post(self.url(&format!("/delegations/{}/complete", id)))
                .json(&json!({ "result": result })),
            "complete delegation",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_api_error_body_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let task_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        let mock = server
            .mock("POST", format!("/tasks/{}/delegate", task_id).as_str())
            .with_status(409)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error_kind":"invalid_delegation","message":"target must be a direct child"}"#)
            .create_async()
            .await;

        let client = CoordinatorClient::with_base_url(server.url()).unwrap();
        let err = client.delegate_task(task_id, target).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("invalid_delegation"), "{}", text);
        assert!(text.contains("direct child"), "{}", text);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_decodes_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"healthy","uptime_seconds":12}"#)
            .create_async()
            .await;

        let client = CoordinatorClient::with_base_url(server.url()).unwrap();
        let health = client.health().await.unwrap();
        assert_eq!(health["uptime_seconds"], 12);
    }
}
