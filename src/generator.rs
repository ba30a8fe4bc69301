use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{ReviewCache, content_hash};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::failed::FailureRecord;
use crate::history::{ChangeKind, HistoryMap, analyze_comment_changes};
use crate::llm::{LlmClient, OutputFormat};
use crate::models::{Comment, Review, Task, TaskPriority, TaskStatus};
use crate::prompts::PromptEngine;

/// Generator policy, lifted from the resolved [`Config`].
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub process_self_reviews: bool,
    pub validation_enabled: bool,
    pub max_retries: u32,
    pub low_priority_patterns: Vec<String>,
    pub low_priority_status: TaskStatus,
    pub default_status: TaskStatus,
    pub deduplication_enabled: bool,
    pub max_tasks_per_comment: u32,
    pub prompt_size_threshold: usize,
    pub worker_count: usize,
}

impl From<&Config> for GeneratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            process_self_reviews: config.process_self_reviews,
            validation_enabled: config.validation_enabled,
            max_retries: config.max_retries,
            low_priority_patterns: config.low_priority_patterns.clone(),
            low_priority_status: config.low_priority_status,
            default_status: config.default_status,
            deduplication_enabled: config.deduplication_enabled,
            max_tasks_per_comment: config.max_tasks_per_comment,
            prompt_size_threshold: config.prompt_size_threshold,
            worker_count: config.worker_count,
        }
    }
}

/// One processed comment and the tasks generated for it.
#[derive(Debug, Clone)]
pub struct CommentGeneration {
    pub review_id: i64,
    pub comment: Comment,
    pub tasks: Vec<Task>,
}

/// A comment skipped because its content hash matched the cache.
#[derive(Debug, Clone)]
pub struct CommentReuse {
    pub comment_id: i64,
    pub task_ids: Vec<Uuid>,
}

/// Result of one generation run over a review set.
#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub generated: Vec<CommentGeneration>,
    pub reused: Vec<CommentReuse>,
    pub failures: Vec<FailureRecord>,
}

impl GenerationOutcome {
    /// All newly generated tasks, flattened.
    pub fn tasks(&self) -> Vec<Task> {
        self.generated
            .iter()
            .flat_map(|g| g.tasks.iter().cloned())
            .collect()
    }
}

/// Model output schema: a JSON array of these.
#[derive(Debug, Deserialize)]
struct TaskDraft {
    description: String,
    priority: TaskPriority,
}

/// Converts review comments into tasks via per-comment LLM jobs running
/// under a bounded worker pool. One comment is always one prompt; comments
/// are never batched together.
pub struct TaskGenerator<L> {
    llm: Arc<L>,
    prompts: Arc<PromptEngine>,
    settings: GeneratorSettings,
}

impl<L: LlmClient + Send + Sync + 'static> TaskGenerator<L> {
    pub fn new(llm: Arc<L>, prompts: Arc<PromptEngine>, settings: GeneratorSettings) -> Self {
        Self {
            llm,
            prompts,
            settings,
        }
    }

    /// Run generation for a PR's current reviews. Unchanged comments (per
    /// the cache) are skipped and their cached task ids reused; new and
    /// modified comments are dispatched concurrently; failures are routed
    /// into the outcome instead of aborting the batch.
    pub async fn generate_tasks(
        &self,
        cancel: &CancellationToken,
        pr: u64,
        reviews: &[Review],
        cache: &ReviewCache,
        history: &HistoryMap,
    ) -> Result<GenerationOutcome> {
        let comments = collect_comments(reviews, self.settings.process_self_reviews);
        self.generate_for_comments(cancel, pr, comments, cache, history)
            .await
    }

    /// Lower-level entry point over an explicit comment set, used by the
    /// orchestrator to process in checkpointable batches.
    pub async fn generate_for_comments(
        &self,
        cancel: &CancellationToken,
        pr: u64,
        comments: Vec<(i64, Comment)>,
        cache: &ReviewCache,
        history: &HistoryMap,
    ) -> Result<GenerationOutcome> {
        let changes = analyze_comment_changes(
            &comments.iter().map(|(_, c)| c.clone()).collect::<Vec<_>>(),
            history,
        );

        let mut outcome = GenerationOutcome::default();
        let mut to_process: Vec<(i64, Comment)> = Vec::new();

        for (review_id, comment) in comments {
            let cached = cache
                .entries
                .get(&comment.id)
                .is_some_and(|e| e.content_hash == content_hash(&comment));
            let kind = changes
                .iter()
                .find(|c| c.comment_id == comment.id)
                .map(|c| c.kind)
                .unwrap_or(ChangeKind::New);

            if cached && kind == ChangeKind::Unchanged {
                debug!(comment_id = comment.id, "unchanged comment, reusing cached tasks");
                outcome.reused.push(CommentReuse {
                    comment_id: comment.id,
                    task_ids: cache.cached_task_ids(comment.id),
                });
            } else {
                to_process.push((review_id, comment));
            }
        }

        if to_process.is_empty() {
            info!(pr, reused = outcome.reused.len(), "no comments need generation");
            return Ok(outcome);
        }

        info!(
            pr,
            dispatch = to_process.len(),
            reused = outcome.reused.len(),
            workers = self.settings.worker_count,
            "dispatching generation jobs"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.worker_count));
        let mut jobs = JoinSet::new();
        for (review_id, comment) in to_process {
            let llm = Arc::clone(&self.llm);
            let prompts = Arc::clone(&self.prompts);
            let settings = self.settings.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            jobs.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                let result =
                    generate_for_comment(&*llm, &prompts, &settings, &cancel, pr, review_id, &comment)
                        .await;
                (review_id, comment, result)
            });
        }

        while let Some(joined) = jobs.join_next().await {
            let (review_id, comment, result) = joined
                .map_err(|e| Error::Process(format!("generation job panicked: {e}")))?;
            match result {
                Ok(tasks) => {
                    debug!(
                        comment_id = comment.id,
                        count = tasks.len(),
                        "comment generated tasks"
                    );
                    outcome.generated.push(CommentGeneration {
                        review_id,
                        comment,
                        tasks,
                    });
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(comment_id = comment.id, error = %e, "comment failed");
                    outcome.failures.push(FailureRecord {
                        comment_id: comment.id,
                        review_id,
                        pr,
                        file: comment.file.clone(),
                        line: comment.line,
                        author: comment.author.clone(),
                        body: comment.body.clone(),
                        url: comment.url.clone(),
                        error: e.to_string(),
                        error_type: e.failure_kind(),
                    });
                }
            }
        }

        // Deterministic output order; jobs complete in arbitrary order.
        outcome
            .generated
            .sort_by_key(|g| (g.review_id, g.comment.id));
        Ok(outcome)
    }
}

/// Flatten reviews into (review id, comment) pairs, honoring the
/// self-review policy.
pub fn collect_comments(reviews: &[Review], process_self_reviews: bool) -> Vec<(i64, Comment)> {
    reviews
        .iter()
        .filter(|r| process_self_reviews || !r.is_self_review())
        .flat_map(|r| r.comments.iter().map(move |c| (r.id, c.clone())))
        .collect()
}

/// One comment's full generation job: render, size-check, execute with
/// validation retries, then assemble tasks.
async fn generate_for_comment<L: LlmClient>(
    llm: &L,
    prompts: &PromptEngine,
    settings: &GeneratorSettings,
    cancel: &CancellationToken,
    pr: u64,
    review_id: i64,
    comment: &Comment,
) -> Result<Vec<Task>> {
    let prompt = prompts.render_task_generation(comment)?;

    // Oversized prompts fail fast: no invocation, no retries.
    if prompt.len() > settings.prompt_size_threshold {
        return Err(Error::SizeLimit {
            size: prompt.len(),
            limit: settings.prompt_size_threshold,
        });
    }

    let mut last_err = Error::Validation("no attempts made".to_string());
    for attempt in 1..=settings.max_retries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match llm.execute(cancel, &prompt, OutputFormat::Json).await {
            Ok(raw) => match parse_and_validate(&raw) {
                Ok(drafts) => {
                    return Ok(assemble_tasks(settings, pr, review_id, comment, drafts));
                }
                Err(e) => {
                    debug!(
                        comment_id = comment.id,
                        attempt,
                        error = %e,
                        "validation failed"
                    );
                    last_err = e;
                }
            },
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) if e.is_size_limit() => return Err(e),
            Err(e) => {
                debug!(comment_id = comment.id, attempt, error = %e, "llm call failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Parse the model reply as a JSON array of task drafts and validate each
/// element. An empty array is valid and means "no action needed".
fn parse_and_validate(raw: &str) -> Result<Vec<TaskDraft>> {
    let stripped = crate::llm::strip_markdown_fences(raw);
    let drafts: Vec<TaskDraft> = serde_json::from_str(stripped)
        .map_err(|e| Error::Validation(format!("expected a JSON task array: {e}")))?;
    for draft in &drafts {
        if draft.description.trim().is_empty() {
            return Err(Error::Validation("task with empty description".to_string()));
        }
    }
    Ok(drafts)
}

/// Turn validated drafts into stored tasks: fresh ids, provenance fields,
/// status policy, dedup.
fn assemble_tasks(
    settings: &GeneratorSettings,
    pr: u64,
    review_id: i64,
    comment: &Comment,
    drafts: Vec<TaskDraft>,
) -> Vec<Task> {
    let status = if is_low_priority(&comment.body, &settings.low_priority_patterns) {
        settings.low_priority_status
    } else {
        settings.default_status
    };

    let mut drafts = drafts;
    if settings.validation_enabled {
        if settings.deduplication_enabled {
            let mut seen = std::collections::HashSet::new();
            drafts.retain(|d| seen.insert(d.description.clone()));
        }
        // max_tasks_per_comment is ignored here: the model decides count.
    } else if settings.max_tasks_per_comment > 0 {
        drafts.truncate(settings.max_tasks_per_comment as usize);
    }

    let hash = content_hash(comment);
    let now = Utc::now();
    drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| Task {
            id: Uuid::new_v4(),
            description: draft.description,
            origin_text: comment.body.clone(),
            priority: draft.priority,
            status,
            source_review_id: review_id,
            source_comment_id: comment.id,
            task_index: index as u32,
            file: comment.file.clone(),
            line: comment.line,
            pr,
            comment_hash: hash.clone(),
            url: comment.url.clone(),
            cancel_comment_posted: false,
            implementation_status: Default::default(),
            verification_status: Default::default(),
            verification_results: Vec::new(),
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        })
        .collect()
}

/// Low-priority detection: any configured pattern appears in the body
/// outside fenced code blocks (case-insensitive), or the body sits in a
/// `Nitpick` section of a structured bot review.
pub fn is_low_priority(body: &str, patterns: &[String]) -> bool {
    let visible = strip_fenced_blocks(body);
    let lower = visible.to_lowercase();
    if patterns.iter().any(|p| lower.contains(&p.to_lowercase())) {
        return true;
    }
    has_nitpick_section(&visible)
}

/// Remove fenced code blocks so patterns inside examples don't match.
fn strip_fenced_blocks(body: &str) -> String {
    let mut out = Vec::new();
    let mut in_fence = false;
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            out.push(line);
        }
    }
    out.join("\n")
}

/// Structured bot reviews mark nitpick groups with a heading or bold label.
fn has_nitpick_section(visible: &str) -> bool {
    visible.lines().any(|line| {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();
        lower.contains("nitpick") && (trimmed.starts_with('#') || trimmed.contains("**"))
    })
}
