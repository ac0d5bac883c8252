use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::application::{Application, InitBuilder};
use crate::stats::TimeRange;
use crate::types::{
    Execution, ExecutionFilters, ExecutionStatus, PageCursor, Scope, SortDirection,
};

#[derive(Parser)]
#[command(name = "sopline")]
#[command(about = "sopline - SOP execution engine administration", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Project the command operates in
    #[arg(long, global = true, default_value = "default")]
    pub project: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,

    /// Show one execution
    Status {
        /// Execution ID to query
        execution_id: String,
    },

    /// List executions, newest first
    List {
        /// Filter by process definition
        #[arg(short = 'p', long = "process")]
        process_id: Option<String>,

        /// Filter by status (repeatable)
        #[arg(short = 's', long = "status")]
        statuses: Vec<ExecutionStatus>,

        /// Filter by initiating actor
        #[arg(short = 'a', long = "actor")]
        actor_id: Option<String>,

        /// Resume from the `next` cursor of a previous page
        #[arg(long)]
        cursor: Option<PageCursor>,

        /// Number of results
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: u32,

        /// Oldest first
        #[arg(long)]
        asc: bool,
    },

    /// Cancel a pending or running execution
    Cancel {
        /// Execution ID to cancel
        execution_id: String,

        /// Actor recorded in the audit log
        #[arg(long, default_value = "cli")]
        actor: String,

        /// Skip confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },

    /// Start a new run from a failed or cancelled execution
    Retry {
        /// Execution ID to retry
        execution_id: String,

        /// Actor recorded in the audit log
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Show the merged log of an execution
    Logs {
        /// Execution ID
        execution_id: String,

        #[arg(short = 'l', long = "limit", default_value = "100")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Execution statistics for a time window
    Stats {
        /// Restrict to one process definition
        #[arg(short = 'p', long = "process")]
        process_id: Option<String>,

        /// Window: 1h, 24h, 7d or 30d
        #[arg(short = 'r', long = "range", default_value = "24h")]
        range: TimeRange,

        /// Print the raw JSON object
        #[arg(long)]
        json: bool,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn connect(cli: &Cli, auto_migrate: bool) -> Result<Application> {
    let mut builder = InitBuilder::new().auto_migrate(auto_migrate);
    if let Some(path) = &cli.config {
        builder = builder.config_path(path.clone());
    }
    if let Some(url) = &cli.database_url {
        builder = builder.database_url(url.clone());
    }
    builder.init().await
}

fn print_execution(execution: &Execution) {
    println!("Execution: {}", execution.id);
    println!("Process: {} (version {})", execution.process_id, execution.process_version);
    println!("Status: {}", execution.status);
    println!("Actor: {}", execution.actor_id);
    println!("Created: {}", execution.created_at);

    if let Some(started_at) = execution.started_at {
        println!("Started: {}", started_at);
    }
    if let Some(completed_at) = execution.completed_at {
        println!("Completed: {}", completed_at);
    }
    if let Some(duration) = execution.duration_ms() {
        println!("Duration: {} ms", duration);
    }
    if let Some(original) = &execution.retry_of {
        println!("Retry of: {} (attempt {})", original, execution.retry_attempt());
    }

    if let Some(output) = &execution.output_data {
        println!("\nOutput:");
        println!("  {}", output);
    }
    if let Some(error) = &execution.error_message {
        println!("\nError:");
        println!("  {}", error);
    }
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    let scope = Scope::project(cli.project.clone());

    match &cli.command {
        Commands::Migrate => {
            println!("Running migrations...");
            connect(&cli, true).await?;
            println!("Migrations complete!");
        }

        Commands::Status { execution_id } => {
            let app = connect(&cli, false).await?;
            let execution = app.executions.get_one_or_throw(&scope, execution_id).await?;
            print_execution(&execution);
        }

        Commands::List {
            process_id,
            statuses,
            actor_id,
            cursor,
            limit,
            asc,
        } => {
            let app = connect(&cli, false).await?;
            let filters = ExecutionFilters {
                process_id: process_id.clone(),
                statuses: statuses.clone(),
                actor_id: actor_id.clone(),
                cursor: cursor.clone(),
                limit: Some(*limit),
            };
            let direction = if *asc {
                SortDirection::Asc
            } else {
                SortDirection::Desc
            };

            let page = app.executions.list(&scope, &filters, direction).await?;
            if page.items.is_empty() {
                println!("No executions found");
                return Ok(());
            }

            println!("Found {} execution(s):\n", page.items.len());
            for execution in &page.items {
                println!(
                    "  {} | {} | {} | {} | {}",
                    execution.id,
                    execution.status,
                    execution.process_id,
                    execution.actor_id,
                    execution.created_at.to_rfc3339()
                );
            }
            if let Some(next) = page.next {
                println!("\nNext page: --cursor {}", next);
            }
        }

        Commands::Cancel {
            execution_id,
            actor,
            yes,
        } => {
            if !yes {
                eprintln!("Error: Confirmation required. Use --yes flag to confirm cancellation.");
                std::process::exit(1);
            }

            let app = connect(&cli, false).await?;
            app.executions.cancel(&scope, execution_id, actor).await?;
            println!("✓ Execution {} cancelled", execution_id);
        }

        Commands::Retry {
            execution_id,
            actor,
        } => {
            let app = connect(&cli, false).await?;
            let retry = app.executions.retry(&scope, execution_id, actor).await?;
            println!(
                "✓ Execution {} retried as {} (attempt {})",
                execution_id,
                retry.id,
                retry.retry_attempt()
            );
        }

        Commands::Logs {
            execution_id,
            limit,
            offset,
        } => {
            let app = connect(&cli, false).await?;
            let logs = app
                .executions
                .get_logs(&scope, execution_id, Some(*limit), *offset)
                .await?;

            println!("{} log entries (showing {}):\n", logs.total, logs.logs.len());
            for entry in &logs.logs {
                println!(
                    "  {} [{:?}] {} - {}",
                    entry.timestamp.to_rfc3339(),
                    entry.level,
                    entry.action,
                    entry.message
                );
            }
        }

        Commands::Stats {
            process_id,
            range,
            json,
        } => {
            let app = connect(&cli, false).await?;
            let stats = app
                .stats
                .get_stats(&scope, process_id.as_deref(), *range)
                .await?;

            if *json {
                let rendered =
                    serde_json::to_string_pretty(&stats).context("Failed to render statistics")?;
                println!("{}", rendered);
                return Ok(());
            }

            println!("Window: last {} (since {})", stats.time_range, stats.window_start);
            println!("Total: {}", stats.total_executions);
            println!(
                "Successful: {} ({:.1}%)",
                stats.successful_executions,
                stats.success_rate * 100.0
            );
            println!(
                "Failed: {} ({:.1}%)",
                stats.failed_executions,
                stats.failure_rate * 100.0
            );
            println!("Average run time: {:.0} ms", stats.average_execution_time_ms);
            println!("\nBy status:");
            for (status, count) in &stats.status_counts {
                println!("  {:<10} {}", status, count);
            }
        }
    }

    Ok(())
}
