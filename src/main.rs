use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use reviewtask::cli::{Cli, Command};
use reviewtask::config::Config;
use reviewtask::generator::{GeneratorSettings, TaskGenerator};
use reviewtask::llm::CommandLlmClient;
use reviewtask::orchestrator::Orchestrator;
use reviewtask::platform::GhPlatformClient;
use reviewtask::prompts::PromptEngine;
use reviewtask::store::Store;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// First interrupt cancels cooperatively; the second forces an exit.
fn install_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received, checkpointing and shutting down (press again to force quit)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());

    let store = Arc::new(Store::new(&config.store_dir));
    let llm = Arc::new(CommandLlmClient::new(
        config.llm_binary.clone(),
        config.llm_model.clone(),
        Some(Duration::from_secs(config.llm_timeout_seconds)),
    ));
    let prompts = Arc::new(PromptEngine::new(
        config.prompt_dir.clone(),
        config.user_language.clone(),
    ));
    let generator = TaskGenerator::new(llm, prompts, GeneratorSettings::from(&config));
    let orchestrator = Orchestrator::new(store, generator, GhPlatformClient::new(), config);

    let result = run(&orchestrator, &cancel, cli.command).await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(
    orchestrator: &Orchestrator<CommandLlmClient, GhPlatformClient>,
    cancel: &CancellationToken,
    command: Command,
) -> reviewtask::error::Result<()> {
    match command {
        Command::Fetch { pr } => {
            let summary = orchestrator.fetch(cancel, pr).await?;
            println!(
                "PR #{}: {} task(s) generated, {} comment(s) reused, {} failed, {} total",
                summary.pr,
                summary.generated_tasks,
                summary.reused_comments,
                summary.failed_comments,
                summary.total_tasks
            );
            if !summary.reconcile.resolved_threads.is_empty() {
                println!(
                    "resolved {} upstream thread(s)",
                    summary.reconcile.resolved_threads.len()
                );
            }
            for warning in &summary.reconcile.warnings {
                println!("warning: {warning}");
            }
        }
        Command::Status { pr } => {
            let report = orchestrator.status(pr)?;
            println!("{} task(s)", report.total);
            for (status, count) in &report.counts {
                println!("  {status}: {count}");
            }
            if report.failed.total_failures > 0 {
                println!(
                    "failed comments: {} pending, {} resolved",
                    report.failed.pending_count, report.failed.resolved_count
                );
                for (kind, count) in &report.failed.by_error_type {
                    println!("  {kind}: {count}");
                }
                if let Some(next) = report.failed.next_scheduled_retry {
                    println!("next retry: {next}");
                }
            }
        }
        Command::Retry { pr } => {
            let (recovered, still_failing) = orchestrator.retry(cancel, pr).await?;
            println!("retry: {recovered} recovered, {still_failing} still failing");
        }
        Command::Update { task_id, status } => {
            orchestrator.update_task_status(task_id, status)?;
            println!("task {task_id} set to {status}");
        }
        Command::ClearCache { pr } => {
            orchestrator.clear_cache(pr)?;
            println!("cache cleared for PR #{pr}");
        }
        Command::Cleanup => {
            let removed = orchestrator.cleanup(cancel).await?;
            if removed.is_empty() {
                println!("no closed PRs to clean up");
            } else {
                for pr in removed {
                    println!("removed PR #{pr}");
                }
            }
        }
    }
    Ok(())
}
