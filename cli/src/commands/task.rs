// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Task commands
//!
//! Commands: create, get, dispatch, delegate, accept, chain, complete

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde_json::Value;
use uuid::Uuid;

use canopy_core::domain::delegation::{Delegation, DelegationStatus};
use canopy_core::domain::task::{Task, TaskPriority};

use super::instance::parse_object;
use crate::daemon::CoordinatorClient;

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Create a task owned by an instance
    Create {
        /// Owning instance
        #[arg(short, long, value_name = "INSTANCE_ID")]
        instance: Uuid,

        #[arg(value_name = "TITLE")]
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Tag, may be repeated
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        #[arg(short, long, default_value = "MEDIUM")]
        priority: TaskPriority,

        /// Metadata as a JSON object
        #[arg(long, value_name = "JSON")]
        metadata: Option<String>,

        /// Route the task right after creating it
        #[arg(long)]
        dispatch: bool,
    },

    /// Show one task
    Get {
        #[arg(value_name = "TASK_ID")]
        id: Uuid,
    },

    /// Route a task down the hierarchy from its current owner
    Dispatch {
        #[arg(value_name = "TASK_ID")]
        id: Uuid,
    },

    /// Delegate a task to a direct child of its owner
    Delegate {
        #[arg(value_name = "TASK_ID")]
        id: Uuid,

        #[arg(short, long, value_name = "INSTANCE_ID")]
        to: Uuid,
    },

    /// Accept a pending delegation
    Accept {
        #[arg(value_name = "DELEGATION_ID")]
        delegation: Uuid,
    },

    /// Show the delegation chain of a task
    Chain {
        #[arg(value_name = "TASK_ID")]
        id: Uuid,
    },

    /// Complete an accepted delegation and bubble the result
    Complete {
        #[arg(value_name = "DELEGATION_ID")]
        delegation: Uuid,

        /// Result payload as a JSON object
        #[arg(long, value_name = "JSON")]
        result: Option<String>,
    },
}

pub async fn handle_command(command: TaskCommand, client: CoordinatorClient) -> Result<()> {
    match command {
        TaskCommand::Create {
            instance,
            title,
            description,
            tags,
            priority,
            metadata,
            dispatch,
        } => {
            let metadata = parse_object(metadata.as_deref())?;
            let task = client
                .create_task(instance, &title, &description, &tags, priority, metadata)
                .await?;
            println!("{}", format!("✓ Created task {}", task.id).green());
            if dispatch {
                print_outcome(&client.dispatch_task(task.id.0).await?);
            } else {
                print_task(&task);
            }
            Ok(())
        }
        TaskCommand::Get { id } => {
            print_task(&client.get_task(id).await?);
            Ok(())
        }
        TaskCommand::Dispatch { id } => {
            print_outcome(&client.dispatch_task(id).await?);
            Ok(())
        }
        TaskCommand::Delegate { id, to } => {
            let delegation = client.delegate_task(id, to).await?;
            println!("{}", format!("✓ Delegation {} created", delegation.id).green());
            print_link(0, &delegation);
            Ok(())
        }
        TaskCommand::Accept { delegation } => {
            let delegation = client.accept_delegation(delegation).await?;
            println!(
                "{}",
                format!(
                    "✓ Task {} now owned by {}",
                    delegation.task_id, delegation.target_instance_id
                )
                .green()
            );
            Ok(())
        }
        TaskCommand::Chain { id } => {
            let chain = client.delegation_chain(id).await?;
            if chain.is_empty() {
                println!("{}", "Task has not been delegated".dimmed());
            }
            for (i, link) in chain.iter().enumerate() {
                print_link(i, link);
            }
            Ok(())
        }
        TaskCommand::Complete { delegation, result } => {
            let result = parse_object(result.as_deref())?;
            let body = client.complete_delegation(delegation, result).await?;
            let bubbled = body["bubble"]["completed"].as_array().map_or(0, Vec::len);
            println!(
                "{}",
                format!("✓ Delegation completed, {} ancestor link(s) bubbled", bubbled).green()
            );
            if let Some(decomposition) = body["bubble"]["halted_at"].as_str() {
                println!(
                    "  {} waiting on sibling subtasks of decomposition {}",
                    "…".yellow(),
                    decomposition
                );
            }
            Ok(())
        }
    }
}

fn print_task(task: &Task) {
    println!("{}", task.title.bold());
    println!("  ID: {}", task.id);
    println!("  Status: {}", task.status);
    println!("  Owner: {}", task.instance_id);
    println!("  Priority: {}", task.priority);
    if !task.tags.is_empty() {
        let tags: Vec<&str> = task.tags.iter().map(String::as_str).collect();
        println!("  Tags: {}", tags.join(", "));
    }
    if !task.description.is_empty() {
        println!("  Description: {}", task.description);
    }
}

fn print_link(index: usize, link: &Delegation) {
    let status = match link.status {
        DelegationStatus::Completed => link.status.as_str().green(),
        DelegationStatus::Rejected => link.status.as_str().red(),
        DelegationStatus::Pending => link.status.as_str().yellow(),
        DelegationStatus::Accepted => link.status.as_str().cyan(),
    };
    println!(
        "{:>3}. {} {} → {} [{}] {}",
        index + 1,
        link.delegation_type,
        link.source_instance_id,
        link.target_instance_id,
        status,
        link.id.to_string().dimmed()
    );
    if let Some(reason) = &link.rejection_reason {
        println!("       rejected: {}", reason);
    }
}

fn print_outcome(outcome: &Value) {
    match outcome["outcome"].as_str() {
        Some("executed") => println!(
            "{} executing at {}",
            "✓".green(),
            outcome["instance"]["name"].as_str().unwrap_or("?")
        ),
        Some("queued") => println!(
            "{} queued at {}",
            "✓".green(),
            outcome["instance"]["name"].as_str().unwrap_or("?")
        ),
        Some("pending") => println!(
            "{} waiting for {} to accept delegation {}",
            "…".yellow(),
            outcome["delegation"]["target_instance_id"].as_str().unwrap_or("?"),
            outcome["delegation"]["id"].as_str().unwrap_or("?")
        ),
        _ => println!("{}", outcome),
    }
}
