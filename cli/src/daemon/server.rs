// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordinator HTTP server
//!
//! Wires storage, services and background tasks from a loaded configuration
//! and serves the API until Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use canopy_core::{
    application::repository_factory::{create_repositories, Repositories},
    domain::{config::CoordinatorConfigManifest, repository::StorageBackend},
    infrastructure::{db::Database, event_bus::EventBus},
    presentation::api::{app, AppState},
};

pub async fn serve(config: CoordinatorConfigManifest) -> Result<()> {
    config
        .validate()
        .context("Configuration validation failed")?;

    info!(
        "Canopy coordinator starting: {} (pid {})",
        config.metadata.name,
        std::process::id()
    );

    if let Some(port) = config.spec.observability.metrics_port {
        install_metrics_exporter(port)?;
    }

    let repositories = connect_storage(&config).await?;
    let event_bus = Arc::new(EventBus::new(config.spec.event_bus.capacity));
    let state = AppState::build(repositories, &config.spec, event_bus);

    let known = state
        .registry
        .rebuild()
        .await
        .context("Failed to load the instance registry")?;
    info!("Instance registry loaded with {} instances", known);

    // Background tasks
    let handler = Arc::new(state.lifecycle_event_handler());
    let handler_token = handler.shutdown_token();
    let handler_task = handler.start();

    let reaper = Arc::new(state.timeout_reaper());
    let reaper_token = reaper.shutdown_token();
    let reaper_task = reaper.start();

    let server = &config.spec.server;
    let addr = format!("{}:{}", server.bind_address, server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Coordinator listening on {}", addr);

    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    reaper_token.cancel();
    handler_token.cancel();
    for (name, task) in [("timeout reaper", reaper_task), ("event handler", handler_task)] {
        if let Err(e) = task.await {
            warn!("{} did not stop cleanly: {}", name, e);
        }
    }

    info!("Coordinator shutting down");
    served
}

async fn connect_storage(config: &CoordinatorConfigManifest) -> Result<Repositories> {
    let backend = config.storage_backend();
    let database = match &backend {
        StorageBackend::InMemory => {
            warn!("Using in-memory storage; state is lost on exit");
            None
        }
        StorageBackend::PostgreSQL(pg) => {
            let database = Database::new(&pg.connection_string, pg.max_connections).await?;
            database.migrate().await?;
            info!("Connected to PostgreSQL ({} max connections)", pg.max_connections);
            Some(database)
        }
    };
    create_repositories(&backend, database.as_ref())
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
