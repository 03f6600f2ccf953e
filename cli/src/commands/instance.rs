// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Instance commands
//!
//! Commands: create, list, get, start, stop, pause, resume, terminate, hierarchy

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{Map, Value};
use uuid::Uuid;

use canopy_core::domain::instance::{Instance, InstanceStatus, Scope};

use crate::daemon::CoordinatorClient;

#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Create an instance
    Create {
        #[arg(value_name = "NAME")]
        name: String,

        /// GLOBAL, PROJECT or ORCHESTRATION
        #[arg(short, long)]
        scope: Scope,

        /// Parent instance (required for ORCHESTRATION)
        #[arg(short, long)]
        parent: Option<Uuid>,

        /// Instance config as a JSON object, e.g. '{"capabilities": ["rust"]}'
        #[arg(long, value_name = "JSON")]
        settings: Option<String>,

        /// Start the instance after creating it
        #[arg(long)]
        start: bool,
    },

    /// List instances
    List {
        #[arg(long)]
        scope: Option<Scope>,

        #[arg(long)]
        status: Option<InstanceStatus>,
    },

    /// Show one instance
    Get {
        #[arg(value_name = "INSTANCE_ID")]
        id: Uuid,
    },

    Start {
        #[arg(value_name = "INSTANCE_ID")]
        id: Uuid,
    },

    Stop {
        #[arg(value_name = "INSTANCE_ID")]
        id: Uuid,
    },

    Pause {
        #[arg(value_name = "INSTANCE_ID")]
        id: Uuid,
    },

    Resume {
        #[arg(value_name = "INSTANCE_ID")]
        id: Uuid,
    },

    Terminate {
        #[arg(value_name = "INSTANCE_ID")]
        id: Uuid,
    },

    /// Print the subtree rooted at an instance
    Hierarchy {
        #[arg(value_name = "INSTANCE_ID")]
        id: Uuid,
    },
}

pub async fn handle_command(command: InstanceCommand, client: CoordinatorClient) -> Result<()> {
    match command {
        InstanceCommand::Create {
            name,
            scope,
            parent,
            settings,
            start,
        } => {
            let config = parse_object(settings.as_deref())?;
            let mut instance = client.create_instance(&name, scope, parent, config).await?;
            println!("{}", format!("✓ Created {} instance {}", instance.scope, instance.id).green());
            if start {
                instance = client.instance_action(instance.id.0, "start").await?;
            }
            print_instance(&instance);
            Ok(())
        }
        InstanceCommand::List { scope, status } => {
            let instances = client.list_instances(scope, status).await?;
            if instances.is_empty() {
                println!("{}", "No instances".dimmed());
            }
            for instance in &instances {
                println!(
                    "{}  {:<14} {:<10} {}",
                    instance.id,
                    instance.scope.as_str(),
                    colored_status(instance.status),
                    instance.name
                );
            }
            Ok(())
        }
        InstanceCommand::Get { id } => {
            print_instance(&client.get_instance(id).await?);
            Ok(())
        }
        InstanceCommand::Start { id } => transition(&client, id, "start").await,
        InstanceCommand::Stop { id } => transition(&client, id, "stop").await,
        InstanceCommand::Pause { id } => transition(&client, id, "pause").await,
        InstanceCommand::Resume { id } => transition(&client, id, "resume").await,
        InstanceCommand::Terminate { id } => transition(&client, id, "terminate").await,
        InstanceCommand::Hierarchy { id } => {
            let tree = client.hierarchy(id).await?;
            print_tree(&tree, 0);
            Ok(())
        }
    }
}

async fn transition(client: &CoordinatorClient, id: Uuid, action: &str) -> Result<()> {
    let instance = client.instance_action(id, action).await?;
    println!(
        "{} {} is {}",
        "✓".green(),
        instance.name,
        colored_status(instance.status)
    );
    Ok(())
}

/// Parse an optional JSON object argument.
pub(crate) fn parse_object(raw: Option<&str>) -> Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).context("Expected a JSON object")?;
            match value {
                Value::Object(map) => Ok(map),
                other => anyhow::bail!("Expected a JSON object, got {}", other),
            }
        }
    }
}

fn colored_status(status: InstanceStatus) -> colored::ColoredString {
    let text = status.as_str();
    match status {
        InstanceStatus::Running => text.green(),
        InstanceStatus::Paused | InstanceStatus::Starting | InstanceStatus::Stopping => text.yellow(),
        InstanceStatus::Error => text.red(),
        InstanceStatus::Terminated | InstanceStatus::Stopped => text.dimmed(),
        InstanceStatus::Created => text.normal(),
    }
}

fn print_instance(instance: &Instance) {
    println!("{}", instance.name.bold());
    println!("  ID: {}", instance.id);
    println!("  Scope: {}", instance.scope);
    println!("  Status: {}", colored_status(instance.status));
    match instance.parent_id {
        Some(parent) => println!("  Parent: {}", parent),
        None => println!("  Parent: {}", "(none)".dimmed()),
    }
    if !instance.config.is_empty() {
        println!("  Config: {}", Value::Object(instance.config.clone()));
    }
    if let Some(error) = &instance.last_error {
        println!("  Last error: {}", error.red());
    }
}

fn print_tree(node: &Value, depth: usize) {
    let instance = &node["instance"];
    println!(
        "{}{} {} [{}] {}",
        "  ".repeat(depth),
        if depth == 0 { "●" } else { "└─" },
        instance["name"].as_str().unwrap_or("?").bold(),
        instance["scope"].as_str().unwrap_or("?"),
        instance["status"].as_str().unwrap_or("?").dimmed()
    );
    if let Some(children) = node["children"].as_array() {
        for child in children {
            print_tree(child, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        assert!(parse_object(None).unwrap().is_empty());
        let map = parse_object(Some(r#"{"max_concurrent_tasks": 2}"#)).unwrap();
        assert_eq!(map["max_concurrent_tasks"], 2);
        assert!(parse_object(Some("[1,2]")).is_err());
        assert!(parse_object(Some("nope")).is_err());
    }
}
