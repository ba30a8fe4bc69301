use clap::{Parser, Subcommand};

/// reviewtask: turn PR review comments into durable, trackable tasks
#[derive(Parser, Debug)]
#[command(name = "reviewtask", version, about)]
pub struct Cli {
    /// Store root directory
    #[arg(long)]
    pub store_dir: Option<String>,

    /// Model CLI binary (located via PATH or absolute path)
    #[arg(long)]
    pub llm_binary: Option<String>,

    /// Model name passed to the model CLI
    #[arg(long)]
    pub llm_model: Option<String>,

    /// Per-invocation model timeout in seconds
    #[arg(long)]
    pub llm_timeout: Option<u64>,

    /// Concurrent generation jobs (default: logical CPUs)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Validation retry attempts per comment
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Also generate tasks from the PR author's own review comments
    #[arg(long)]
    pub process_self_reviews: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch reviews for a PR, generate tasks, and reconcile thread state
    Fetch {
        /// PR number
        pr: u64,
    },
    /// Show task counts by status, and failed-comment statistics
    Status {
        /// Restrict to one PR
        #[arg(long)]
        pr: Option<u64>,
    },
    /// Re-run generation for retryable failed comments of a PR
    Retry {
        /// PR number
        pr: u64,
    },
    /// Set a task's status (todo, doing, done, pending, cancel)
    Update {
        /// Task id (UUID)
        task_id: uuid::Uuid,
        /// New status
        status: crate::models::TaskStatus,
    },
    /// Empty the review cache for a PR (the file stays)
    ClearCache {
        /// PR number
        pr: u64,
    },
    /// Remove store directories of PRs that are closed upstream
    Cleanup,
}
