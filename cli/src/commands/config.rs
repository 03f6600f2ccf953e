// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use canopy_core::domain::config::CoordinatorConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./canopy-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = CoordinatorConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. CANOPY_CONFIG_PATH: {}",
            std::env::var("CANOPY_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./canopy-config.yaml");
        println!("  4. ~/.canopy/config.yaml");
        println!("  5. /etc/canopy/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{} {}", "Coordinator:".bold(), config.metadata.name);
    println!();

    println!("{}", "Server:".bold());
    println!("  Listen: {}:{}", spec.server.bind_address, spec.server.port);
    println!();

    println!("{}", "Storage:".bold());
    println!("  Backend: {:?}", spec.storage.backend);
    if spec.storage.connection_string.is_some() {
        println!("  Connection: {}", "(set)".dimmed());
    }
    println!("  Max connections: {}", spec.storage.max_connections);
    println!();

    println!("{}", "Delegation:".bold());
    println!("  Acceptance timeout: {}s", spec.delegation.acceptance_timeout_seconds);
    println!("  Sweep interval: {}s", spec.delegation.sweep_interval_seconds);
    println!("  Capacity attempts: {}", spec.delegation.max_capacity_attempts);
    let auto_accept: Vec<&str> = spec.delegation.auto_accept_scopes.iter().map(|s| s.as_str()).collect();
    println!(
        "  Auto-accept scopes: {}",
        if auto_accept.is_empty() {
            "(none)".to_string()
        } else {
            auto_accept.join(", ")
        }
    );
    println!("  Re-dispatch on timeout: {}", spec.delegation.redispatch_on_timeout);
    println!();

    println!("{}", "Observability:".bold());
    println!(
        "  Logging: {} ({})",
        spec.observability.log_level, spec.observability.log_format
    );
    match spec.observability.metrics_port {
        Some(port) => println!("  Metrics: :{}", port),
        None => println!("  Metrics: {}", "(disabled)".dimmed()),
    }
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = CoordinatorConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    let yaml = CoordinatorConfigManifest::default().to_yaml_string()?;
    std::fs::write(&output, yaml)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canopy-config.yaml");
        generate(path.clone()).unwrap();

        let loaded = CoordinatorConfigManifest::from_yaml_file(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.spec.server.port, 8700);
        validate(Some(path)).unwrap();
    }

    #[test]
    fn test_validate_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate(Some(dir.path().join("absent.yaml"))).is_err());
    }
}
