//! cohort CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};

mod cli;

use cli::{Cli, Command};
use cohort::adapter::{CommandAdapter, ScriptedProvider, StubAdapter, TeammateAdapter};
use cohort::config::RunConfig;
use cohort::orchestrator::{Orchestrator, RunResult};
use cohort::store::TaskStore;

fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Command::Run {
            merge,
            human_approval,
        } => run(cli.config, cli.dir, merge, human_approval).await,
        Command::Status => status(cli.dir),
        Command::Tasks => tasks(cli.dir),
        Command::Inbox { receiver, since } => inbox(cli.dir, &receiver, since),
        Command::Requeue => requeue(cli.dir),
    }
}

async fn run(
    config_path: Option<PathBuf>,
    dir: PathBuf,
    merge: bool,
    human_approval: bool,
) -> Result<()> {
    let mut config = RunConfig::load(config_path.as_ref()).context("Failed to load configuration")?;
    if human_approval {
        config.human_approval = true;
    }

    let store =
        TaskStore::open(&dir)?.with_progress_log_limit(config.limits.progress_log_limit);
    if !config.tasks.is_empty() {
        let added = store.bootstrap(config.tasks.clone(), merge)?;
        println!("{} bootstrapped {} task(s) into {}", "·".blue(), added, dir.display());
    }

    let adapter: Arc<dyn TeammateAdapter> = if config.commands.is_empty() {
        println!("{} no commands configured, using the templated stub adapter", "!".yellow());
        Arc::new(StubAdapter::new())
    } else {
        Arc::new(CommandAdapter::new(
            config.commands.clone(),
            Duration::from_secs(config.limits.adapter_timeout_secs),
        ))
    };
    let provider = Arc::new(ScriptedProvider::quiet());

    let mut orchestrator =
        Orchestrator::new(config.to_orchestrator_config(), store, adapter, provider)
            .context("Failed to construct orchestrator")?;
    let result = orchestrator.run().await.context("Run failed")?;
    print_result(&result);
    Ok(())
}

fn print_result(result: &RunResult) {
    let reason = if result.stop_reason == "all_tasks_completed" {
        result.stop_reason.green()
    } else if result.stop_reason == "human_approval_required" {
        result.stop_reason.yellow()
    } else {
        result.stop_reason.red()
    };
    println!("stop reason: {}", reason);
    println!(
        "tasks: {} completed / {} total ({} pending, {} in progress, {} blocked, {} awaiting approval)",
        result.summary.completed,
        result.tasks_total,
        result.summary.pending,
        result.summary.in_progress,
        result.summary.blocked,
        result.summary.needs_approval,
    );
    println!(
        "rounds took {:.1}s, {} provider call(s) via {}",
        result.elapsed_seconds, result.provider_calls, result.provider
    );
    if result.persona_metrics.persona_blocker_triggered {
        println!("{} a persona blocker halted the run", "!".red());
    }
    for (severity, count) in &result.persona_metrics.severity_counts {
        println!("  {} persona comment(s) at {}", count, severity);
    }
}

fn status(dir: PathBuf) -> Result<()> {
    let store = TaskStore::open(&dir)?;
    let summary = store.status_summary()?;
    println!(
        "{} pending, {} in progress, {} blocked, {} awaiting approval, {} completed",
        summary.pending,
        summary.in_progress.to_string().blue(),
        summary.blocked.to_string().red(),
        summary.needs_approval.to_string().yellow(),
        summary.completed.to_string().green(),
    );
    Ok(())
}

fn tasks(dir: PathBuf) -> Result<()> {
    let store = TaskStore::open(&dir)?;
    for task in store.list_tasks()? {
        let status = match task.status {
            cohort::TaskStatus::Completed => task.status.as_str().green(),
            cohort::TaskStatus::Blocked => task.status.as_str().red(),
            cohort::TaskStatus::NeedsApproval => task.status.as_str().yellow(),
            _ => task.status.as_str().normal(),
        };
        let owner = task.owner.as_deref().unwrap_or("-");
        let phase = task
            .current_phase_index
            .map(|i| format!("phase {}", i))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<16} plan={:<20} owner={:<10} {}  {}",
            task.id,
            status,
            task.plan_status.as_str(),
            owner,
            phase,
            task.title,
        );
        if let Some(reason) = &task.block_reason {
            println!("                 {} {}", "blocked:".red(), reason);
        }
    }
    Ok(())
}

fn inbox(dir: PathBuf, receiver: &str, since: u64) -> Result<()> {
    let store = TaskStore::open(&dir)?;
    let messages = store.get_inbox(receiver, since)?;
    if messages.is_empty() {
        println!("no messages for {}", receiver);
        return Ok(());
    }
    for message in messages {
        println!(
            "[{}] {} {} {}",
            message.seq,
            message.sender.blue(),
            "→".dimmed(),
            message.content
        );
    }
    Ok(())
}

fn requeue(dir: PathBuf) -> Result<()> {
    let store = TaskStore::open(&dir)?;
    let requeued = store.requeue_in_progress_tasks()?;
    if requeued.is_empty() {
        println!("nothing to requeue");
    } else {
        for id in &requeued {
            println!("{} requeued {}", "·".blue(), id);
        }
    }
    Ok(())
}
