use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::models::TaskStatus;

/// When the upstream thread is resolved relative to local task completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoResolveMode {
    /// Resolve as soon as any task for the comment completes.
    Immediate,
    /// Resolve only when every task for the comment is complete.
    #[default]
    Complete,
    /// Never resolve automatically.
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DoneWorkflowFile {
    pub enable_auto_resolve: Option<AutoResolveMode>,
}

/// `config.json` at the store root. Every field is optional; defaults
/// apply for whatever is absent. Unknown fields are rejected so typos
/// surface instead of silently falling back.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub user_language: Option<String>,
    pub output_format: Option<String>,
    pub process_self_reviews: Option<bool>,
    pub validation_enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub low_priority_patterns: Option<Vec<String>>,
    pub low_priority_status: Option<TaskStatus>,
    pub default_status: Option<TaskStatus>,
    pub deduplication_enabled: Option<bool>,
    pub max_tasks_per_comment: Option<u32>,
    pub prompt_size_threshold: Option<usize>,
    pub done_workflow: Option<DoneWorkflowFile>,
    pub llm_binary: Option<String>,
    pub llm_model: Option<String>,
    pub llm_timeout_seconds: Option<u64>,
    pub worker_count: Option<usize>,
    pub checkpoint_interval: Option<u32>,
    pub prompt_dir: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub store_dir: String,
    pub user_language: Option<String>,
    pub output_format: String,
    pub process_self_reviews: bool,
    pub validation_enabled: bool,
    pub max_retries: u32,
    pub low_priority_patterns: Vec<String>,
    pub low_priority_status: TaskStatus,
    pub default_status: TaskStatus,
    pub deduplication_enabled: bool,
    pub max_tasks_per_comment: u32,
    pub prompt_size_threshold: usize,
    pub auto_resolve: AutoResolveMode,
    pub llm_binary: String,
    pub llm_model: Option<String>,
    pub llm_timeout_seconds: u64,
    pub worker_count: usize,
    pub checkpoint_interval: u32,
    pub prompt_dir: Option<String>,
}

pub const DEFAULT_PROMPT_SIZE_THRESHOLD: usize = 30 * 1024;

fn default_low_priority_patterns() -> Vec<String> {
    ["nit:", "nits:", "minor:", "suggestion:", "consider:", "optional:", "style:"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    /// Load `config.json` from under the store root chosen by the CLI and
    /// merge CLI overrides on top. A missing file yields pure defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let store_dir = cli
            .store_dir
            .clone()
            .unwrap_or_else(|| crate::store::DEFAULT_ROOT.to_string());
        let path = Path::new(&store_dir).join("config.json");
        let file_config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
            parse_config(&content).map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
                other => other,
            })?
        } else {
            ConfigFile::default()
        };

        merge(store_dir, file_config, cli)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    serde_json::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

pub fn merge(store_dir: String, file: ConfigFile, cli: &Cli) -> Result<Config> {
    let config = Config {
        store_dir,
        user_language: file.user_language,
        output_format: file.output_format.unwrap_or_else(|| "json".to_string()),
        process_self_reviews: cli.process_self_reviews
            || file.process_self_reviews.unwrap_or(false),
        validation_enabled: file.validation_enabled.unwrap_or(true),
        max_retries: cli.max_retries.or(file.max_retries).unwrap_or(5),
        low_priority_patterns: file
            .low_priority_patterns
            .unwrap_or_else(default_low_priority_patterns),
        low_priority_status: file.low_priority_status.unwrap_or(TaskStatus::Pending),
        default_status: file.default_status.unwrap_or(TaskStatus::Todo),
        deduplication_enabled: file.deduplication_enabled.unwrap_or(true),
        max_tasks_per_comment: file.max_tasks_per_comment.unwrap_or(0),
        prompt_size_threshold: file
            .prompt_size_threshold
            .unwrap_or(DEFAULT_PROMPT_SIZE_THRESHOLD),
        auto_resolve: file
            .done_workflow
            .and_then(|dw| dw.enable_auto_resolve)
            .unwrap_or_default(),
        llm_binary: cli
            .llm_binary
            .clone()
            .or(file.llm_binary)
            .unwrap_or_else(|| "claude".to_string()),
        llm_model: cli.llm_model.clone().or(file.llm_model),
        llm_timeout_seconds: cli
            .llm_timeout
            .or(file.llm_timeout_seconds)
            .unwrap_or(600),
        worker_count: cli
            .workers
            .or(file.worker_count)
            .unwrap_or_else(num_cpus::get),
        checkpoint_interval: file.checkpoint_interval.unwrap_or(10),
        prompt_dir: file.prompt_dir,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.output_format.as_str() {
        "json" | "text" => {}
        other => {
            return Err(Error::Config(format!(
                "unknown output_format: {other} (expected: json, text)"
            )));
        }
    }
    if config.max_retries == 0 {
        return Err(Error::Config("max_retries must be > 0".to_string()));
    }
    if config.worker_count == 0 {
        return Err(Error::Config("worker_count must be > 0".to_string()));
    }
    if config.prompt_size_threshold == 0 {
        return Err(Error::Config(
            "prompt_size_threshold must be > 0".to_string(),
        ));
    }
    if config.checkpoint_interval == 0 {
        return Err(Error::Config(
            "checkpoint_interval must be > 0".to_string(),
        ));
    }
    Ok(())
}
