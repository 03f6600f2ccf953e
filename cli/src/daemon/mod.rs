// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordinator process and its HTTP client
//!
//! Handles:
//! - Serving the coordinator API (`canopy serve`)
//! - HTTP health checks against a running coordinator
//! - Graceful shutdown

use std::time::Duration;

pub mod client;
pub mod server;

pub use client::CoordinatorClient;
pub use server::serve;

#[derive(Debug, Clone)]
pub enum CoordinatorStatus {
    Running { uptime: Option<u64> },
    Unreachable { error: String },
}

/// `http://host:port`, keeping an explicit scheme when one is given.
pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

/// Probe `/health` with a short timeout.
pub async fn check_coordinator_running(host: &str, port: u16) -> CoordinatorStatus {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            return CoordinatorStatus::Unreachable {
                error: e.to_string(),
            }
        }
    };

    let health_url = format!("{}/health", base_url(host, port));
    match client.get(&health_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let uptime = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["uptime_seconds"].as_u64());
            CoordinatorStatus::Running { uptime }
        }
        Ok(resp) => CoordinatorStatus::Unreachable {
            error: format!("health check returned {}", resp.status()),
        },
        Err(e) => CoordinatorStatus::Unreachable {
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_scheme() {
        assert_eq!(base_url("127.0.0.1", 8700), "http://127.0.0.1:8700");
        assert_eq!(base_url("https://coord.internal", 443), "https://coord.internal:443");
    }
}
