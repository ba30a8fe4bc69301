use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{ReviewCache, content_hash};
use crate::checkpoint::{
    Checkpoint, delete_checkpoint, is_checkpoint_stale, load_checkpoint, save_checkpoint,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::failed::FailedComments;
use crate::generator::{TaskGenerator, collect_comments};
use crate::history::{self, analyze_comment_changes, update_history};
use crate::llm::LlmClient;
use crate::models::{Comment, Task, TaskStatus};
use crate::platform::PlatformClient;
use crate::reconcile::{ReconcileEngine, ReconcileOutcome};
use crate::store::{Store, merge_task_sets};
use crate::writer::WriteWorker;

/// Checkpoints older than this are discarded rather than resumed.
const CHECKPOINT_MAX_AGE_HOURS: i64 = 24;

/// Summary of one `fetch` run for a PR.
#[derive(Debug)]
pub struct FetchSummary {
    pub pr: u64,
    pub generated_tasks: usize,
    pub reused_comments: usize,
    pub failed_comments: usize,
    pub total_tasks: usize,
    pub reconcile: ReconcileOutcome,
}

/// Aggregate task counts for `status`.
#[derive(Debug, Default)]
pub struct StatusReport {
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
    pub failed: crate::failed::FailedStats,
}

/// Wires store, generator, write worker, failed queue, checkpointing, and
/// reconciliation into the public per-PR operations.
pub struct Orchestrator<L, P> {
    store: Arc<Store>,
    generator: TaskGenerator<L>,
    platform: P,
    config: Config,
}

impl<L, P> Orchestrator<L, P>
where
    L: LlmClient + Send + Sync + 'static,
    P: PlatformClient,
{
    pub fn new(
        store: Arc<Store>,
        generator: TaskGenerator<L>,
        platform: P,
        config: Config,
    ) -> Self {
        Self {
            store,
            generator,
            platform,
            config,
        }
    }

    /// The platform collaborator, exposed for callers that drive it
    /// directly (tests, reply posting).
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Full pipeline for one PR: pull reviews, generate tasks for new and
    /// modified comments, merge against the stored task set, and reconcile
    /// with upstream thread state. Per-comment failures land in the failed
    /// queue; the run itself fails only on store-level errors or
    /// cancellation, and always leaves a checkpoint behind when it does.
    pub async fn fetch(&self, cancel: &CancellationToken, pr: u64) -> Result<FetchSummary> {
        info!(pr, "fetching reviews");
        let pr_info = self.platform.fetch_pr_info(cancel, pr).await?;
        self.store.save_pr_info(&pr_info)?;

        let reviews = self.platform.fetch_reviews(cancel, pr).await?;
        self.store.save_reviews(pr, reviews.clone())?;

        let mut cache = ReviewCache::load(&self.store, pr)?;
        let mut history_map = history::load(&self.store, pr)?;
        let mut failed_queue = FailedComments::load(&self.store)?;

        let comments = collect_comments(&reviews, self.config.process_self_reviews);
        let all_comments: Vec<Comment> = comments.iter().map(|(_, c)| c.clone()).collect();
        // Classified against pre-run history; applied once generation is done.
        let full_changes = analyze_comment_changes(&all_comments, &history_map);

        // Resume from a live checkpoint, start fresh otherwise.
        let mut checkpoint = match load_checkpoint(&self.store, pr)? {
            Some(cp)
                if !is_checkpoint_stale(Some(&cp), Duration::hours(CHECKPOINT_MAX_AGE_HOURS)) =>
            {
                info!(pr, processed = cp.processed_count, "resuming from checkpoint");
                cp
            }
            _ => Checkpoint::new(pr, comments.len() as u32, self.config.checkpoint_interval),
        };

        let pending: Vec<(i64, Comment)> = comments
            .iter()
            .filter(|(_, c)| {
                checkpoint.processed_comments.get(&c.id) != Some(&content_hash(c))
            })
            .cloned()
            .collect();

        let mut new_tasks: Vec<Task> = checkpoint.partial_tasks.clone();
        // Comments whose freshly generated task set (possibly empty) is
        // authoritative for the merge. Resumed partial tasks count; reused
        // and failed comments keep their stored tasks instead.
        let mut authoritative_ids: BTreeSet<i64> =
            new_tasks.iter().map(|t| t.source_comment_id).collect();
        let mut failed_count = 0usize;
        let mut reused_count = 0usize;

        for batch in pending.chunks(self.config.checkpoint_interval.max(1) as usize) {
            if cancel.is_cancelled() {
                save_checkpoint(&self.store, &mut checkpoint)?;
                return Err(Error::Cancelled);
            }

            let outcome = match self
                .generator
                .generate_for_comments(cancel, pr, batch.to_vec(), &cache, &history_map)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    save_checkpoint(&self.store, &mut checkpoint)?;
                    return Err(e);
                }
            };

            for generation in &outcome.generated {
                let task_ids = generation.tasks.iter().map(|t| t.id).collect::<Vec<_>>();
                cache.update_comment_cache(
                    std::slice::from_ref(&generation.comment),
                    &[task_ids],
                );
                checkpoint.record(generation.comment.id, content_hash(&generation.comment));
                authoritative_ids.insert(generation.comment.id);
                new_tasks.extend(generation.tasks.iter().cloned());
            }
            for reuse in &outcome.reused {
                checkpoint.record(reuse.comment_id, cache_hash(&cache, reuse.comment_id));
                reused_count += 1;
            }
            for failure in outcome.failures {
                if let Some((_, comment)) =
                    batch.iter().find(|(_, c)| c.id == failure.comment_id)
                {
                    checkpoint.record(comment.id, content_hash(comment));
                }
                failed_queue.save_failed_comment(failure);
                failed_count += 1;
            }

            checkpoint.partial_tasks = new_tasks.clone();
            save_checkpoint(&self.store, &mut checkpoint)?;
            cache.save(&self.store, pr)?;
            failed_queue.save(&self.store)?;
        }

        update_history(&full_changes, &mut history_map);
        history::save(&self.store, pr, &history_map)?;

        // Merge against the stored set. Comments that are present upstream
        // but were not generated this run (reused, failed, filtered) carry
        // their existing tasks into the new set so the merge preserves
        // them; absent comments fall out as deletions.
        let current_ids: BTreeSet<i64> = reviews
            .iter()
            .flat_map(|r| r.comments.iter().map(|c| c.id))
            .collect();

        let existing = self.store.tasks_by_pr(pr)?;
        let preserved: Vec<Task> = existing
            .iter()
            .filter(|t| {
                current_ids.contains(&t.source_comment_id)
                    && !authoritative_ids.contains(&t.source_comment_id)
            })
            .cloned()
            .collect();

        let mut merge_input = new_tasks;
        merge_input.extend(preserved);
        let merged = merge_task_sets(existing, merge_input);
        let total_tasks = merged.len();
        let generated_tasks = checkpoint.partial_tasks.len();
        let with_tasks: Vec<i64> = merged
            .iter()
            .map(|t| t.source_comment_id)
            .filter(|id| current_ids.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        // All persistence flows through the single write worker.
        let writer = WriteWorker::start(Arc::clone(&self.store));
        writer.queue_tasks(merged)?;
        writer.wait_for_completion().await?;
        let write_errors = writer.stop().await;
        if !write_errors.is_empty() {
            save_checkpoint(&self.store, &mut checkpoint)?;
            return Err(Error::Store(format!(
                "{} task write(s) failed: {}",
                write_errors.len(),
                write_errors.join("; ")
            )));
        }

        self.store.update_comments_tasks_generated(pr, &with_tasks)?;

        delete_checkpoint(&self.store, pr)?;

        let reconcile = ReconcileEngine::new(&self.store, &self.platform, self.config.auto_resolve)
            .reconcile(cancel, pr)
            .await?;
        for warning in &reconcile.warnings {
            warn!(pr, "reconcile warning: {warning}");
        }

        info!(
            pr,
            generated = generated_tasks,
            reused = reused_count,
            failed = failed_count,
            total = total_tasks,
            "fetch complete"
        );

        Ok(FetchSummary {
            pr,
            generated_tasks,
            reused_comments: reused_count,
            failed_comments: failed_count,
            total_tasks,
            reconcile,
        })
    }

    /// Re-run generation for this PR's retryable failed comments, marking
    /// queue entries resolved on success and backing them off on repeat
    /// failure.
    pub async fn retry(&self, cancel: &CancellationToken, pr: u64) -> Result<(usize, usize)> {
        let mut failed_queue = FailedComments::load(&self.store)?;
        let due: Vec<i64> = failed_queue
            .retryable_comments()
            .into_iter()
            .filter(|c| c.pr == pr)
            .map(|c| c.comment_id)
            .collect();
        if due.is_empty() {
            info!(pr, "no retryable failed comments");
            return Ok((0, 0));
        }

        let reviews = self.store.load_reviews(pr)?;
        let items: Vec<(i64, Comment)> = collect_comments(&reviews, true)
            .into_iter()
            .filter(|(_, c)| due.contains(&c.id))
            .collect();

        let mut cache = ReviewCache::load(&self.store, pr)?;
        let history_map = history::load(&self.store, pr)?;
        let outcome = self
            .generator
            .generate_for_comments(cancel, pr, items, &cache, &history_map)
            .await?;

        let mut recovered = 0usize;
        let mut merge_input = Vec::new();
        for generation in &outcome.generated {
            let task_ids = generation.tasks.iter().map(|t| t.id).collect::<Vec<_>>();
            cache.update_comment_cache(std::slice::from_ref(&generation.comment), &[task_ids]);
            failed_queue.mark_comment_resolved(generation.comment.id);
            merge_input.extend(generation.tasks.iter().cloned());
            recovered += 1;
        }
        let still_failing = outcome.failures.len();
        for failure in outcome.failures {
            failed_queue.save_failed_comment(failure);
        }

        if !merge_input.is_empty() {
            // Preserve everything the retry did not touch.
            let touched: BTreeSet<i64> =
                outcome.generated.iter().map(|g| g.comment.id).collect();
            let existing = self.store.tasks_by_pr(pr)?;
            let preserved: Vec<Task> = existing
                .iter()
                .filter(|t| !touched.contains(&t.source_comment_id))
                .cloned()
                .collect();
            merge_input.extend(preserved);
            self.store.merge_tasks(pr, merge_input)?;
        }

        cache.save(&self.store, pr)?;
        failed_queue.save(&self.store)?;
        info!(pr, recovered, still_failing, "retry complete");
        Ok((recovered, still_failing))
    }

    /// Delete PR directories whose PR the platform reports closed.
    pub async fn cleanup(&self, cancel: &CancellationToken) -> Result<Vec<u64>> {
        let mut open_states: HashMap<u64, Result<bool>> = HashMap::new();
        for pr in self.store.pr_numbers()? {
            let state = self.platform.is_pr_open(cancel, pr).await;
            open_states.insert(pr, state);
        }
        self.store
            .cleanup_closed_prs(|pr| open_states.remove(&pr).unwrap_or(Ok(true)))
    }

    /// Empty the review cache for a PR; the next fetch regenerates
    /// everything.
    pub fn clear_cache(&self, pr: u64) -> Result<()> {
        ReviewCache::clear(&self.store, pr)
    }

    /// Set one task's status by id, searching every PR.
    pub fn update_task_status(&self, task_id: uuid::Uuid, status: TaskStatus) -> Result<()> {
        self.store.update_task_status(task_id, status)
    }

    /// Aggregate task counts, per PR or store-wide, plus failed-comment
    /// statistics.
    pub fn status(&self, pr: Option<u64>) -> Result<StatusReport> {
        let tasks = match pr {
            Some(pr) => self.store.tasks_by_pr(pr)?,
            None => self.store.all_tasks()?,
        };
        let mut report = StatusReport {
            total: tasks.len(),
            ..Default::default()
        };
        for status in [
            TaskStatus::Todo,
            TaskStatus::Doing,
            TaskStatus::Done,
            TaskStatus::Pending,
            TaskStatus::Cancel,
        ] {
            let count = tasks.iter().filter(|t| t.status == status).count();
            if count > 0 {
                report.counts.insert(status.to_string(), count);
            }
        }
        report.failed = FailedComments::load(&self.store)?.statistics;
        Ok(report)
    }
}

fn cache_hash(cache: &ReviewCache, comment_id: i64) -> String {
    cache
        .entries
        .get(&comment_id)
        .map(|e| e.content_hash.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratorSettings;
    use crate::llm::ScriptedLlm;
    use crate::models::{Review, ReviewState};
    use crate::platform::MockPlatform;
    use crate::prompts::PromptEngine;
    use crate::store::DEFAULT_ROOT;
    use chrono::Utc;
    use tempfile::TempDir;

    fn make_comment(id: i64, body: &str) -> Comment {
        Comment {
            id,
            author: "reviewer".to_string(),
            body: body.to_string(),
            file: "src/lib.rs".to_string(),
            line: 3,
            created_at: Utc::now(),
            url: String::new(),
            replies: Vec::new(),
            tasks_generated: false,
            all_tasks_completed: false,
            github_thread_resolved: false,
            last_checked_at: None,
        }
    }

    fn make_review(id: i64, comments: Vec<Comment>) -> Review {
        Review {
            id,
            reviewer: "reviewer".to_string(),
            state: ReviewState::ChangesRequested,
            body: String::new(),
            submitted_at: Utc::now(),
            comments,
        }
    }

    fn test_config(store_dir: &str) -> Config {
        let cli = <crate::cli::Cli as clap::Parser>::parse_from([
            "reviewtask",
            "--store-dir",
            store_dir,
            "status",
        ]);
        Config::load(&cli).unwrap()
    }

    fn orchestrator(
        dir: &TempDir,
        responses: Vec<Result<String>>,
        platform: MockPlatform,
    ) -> Orchestrator<ScriptedLlm, MockPlatform> {
        let root = dir.path().join(DEFAULT_ROOT);
        let store = Arc::new(Store::new(&root));
        let mut config = test_config(root.to_str().unwrap());
        config.worker_count = 1;
        let generator = TaskGenerator::new(
            Arc::new(ScriptedLlm::new(responses)),
            Arc::new(PromptEngine::new(None, None)),
            GeneratorSettings::from(&config),
        );
        Orchestrator::new(store, generator, platform, config)
    }

    fn drafts_json(items: &[(&str, &str)]) -> String {
        serde_json::to_string(
            &items
                .iter()
                .map(|(d, p)| serde_json::json!({"description": d, "priority": p}))
                .collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_generates_and_persists_tasks() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_reviews(vec![make_review(7, vec![make_comment(100, "fix the loop")])]);
        platform.set_thread_state(100, false);
        let orch = orchestrator(&dir, vec![Ok(drafts_json(&[("Fix the loop", "high")]))], platform);
        let cancel = CancellationToken::new();

        let summary = orch.fetch(&cancel, 42).await.unwrap();
        assert_eq!(summary.generated_tasks, 1);
        assert_eq!(summary.failed_comments, 0);
        assert_eq!(summary.total_tasks, 1);

        let tasks = orch.store.tasks_by_pr(42).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].pr, 42);
        assert_eq!(tasks[0].source_comment_id, 100);

        // Checkpoint removed on success; info and reviews stored
        assert!(load_checkpoint(&orch.store, 42).unwrap().is_none());
        assert!(orch.store.load_pr_info(42).unwrap().is_some());
        let reviews = orch.store.load_reviews(42).unwrap();
        assert!(reviews[0].comments[0].tasks_generated);
    }

    #[tokio::test]
    async fn second_fetch_uses_cache_and_keeps_tasks() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_reviews(vec![make_review(7, vec![make_comment(100, "fix the loop")])]);
        platform.set_thread_state(100, false);
        // Only one scripted response: the second fetch must not call the LLM
        let orch = orchestrator(&dir, vec![Ok(drafts_json(&[("Fix the loop", "high")]))], platform);
        let cancel = CancellationToken::new();

        orch.fetch(&cancel, 42).await.unwrap();
        let first = orch.store.tasks_by_pr(42).unwrap();

        let summary = orch.fetch(&cancel, 42).await.unwrap();
        assert_eq!(summary.generated_tasks, 0);
        assert_eq!(summary.reused_comments, 1);

        let second = orch.store.tasks_by_pr(42).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn deleted_comment_cancels_open_tasks_on_refetch() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_reviews(vec![make_review(7, vec![make_comment(100, "fix the loop")])]);
        platform.set_thread_state(100, false);
        let orch = orchestrator(&dir, vec![Ok(drafts_json(&[("Fix the loop", "high")]))], platform);
        let cancel = CancellationToken::new();
        orch.fetch(&cancel, 42).await.unwrap();

        // The comment disappears upstream
        orch.platform.set_reviews(vec![make_review(7, vec![])]);
        let summary = orch.fetch(&cancel, 42).await.unwrap();
        assert_eq!(summary.generated_tasks, 0);

        let tasks = orch.store.tasks_by_pr(42).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Cancel);
    }

    #[tokio::test]
    async fn failed_comment_lands_in_queue_and_tasks_survive() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_reviews(vec![make_review(7, vec![make_comment(100, "fix the loop")])]);
        platform.set_thread_state(100, false);
        // All attempts return garbage: validation failure after retries
        let responses = (0..5).map(|_| Ok("garbage".to_string())).collect();
        let orch = orchestrator(&dir, responses, platform);
        let cancel = CancellationToken::new();

        let summary = orch.fetch(&cancel, 42).await.unwrap();
        assert_eq!(summary.failed_comments, 1);
        assert_eq!(summary.generated_tasks, 0);

        let queue = FailedComments::load(&orch.store).unwrap();
        assert_eq!(queue.comments.len(), 1);
        assert_eq!(queue.comments[0].comment_id, 100);
        assert_eq!(queue.statistics.pending_count, 1);
    }

    #[tokio::test]
    async fn failed_comment_does_not_cancel_existing_tasks() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_reviews(vec![make_review(7, vec![make_comment(100, "fix the loop")])]);
        platform.set_thread_state(100, false);
        let responses = vec![
            Ok(drafts_json(&[("Fix the loop", "high")])),
            // Second fetch: comment modified, all attempts fail
            Ok("bad".to_string()),
            Ok("bad".to_string()),
            Ok("bad".to_string()),
            Ok("bad".to_string()),
            Ok("bad".to_string()),
        ];
        let orch = orchestrator(&dir, responses, platform);
        let cancel = CancellationToken::new();
        orch.fetch(&cancel, 42).await.unwrap();

        orch.platform
            .set_reviews(vec![make_review(7, vec![make_comment(100, "fix the loop properly")])]);
        let summary = orch.fetch(&cancel, 42).await.unwrap();
        assert_eq!(summary.failed_comments, 1);

        // The original task is still there, untouched by the failed rerun
        let tasks = orch.store.tasks_by_pr(42).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn retry_recovers_failed_comment() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_reviews(vec![make_review(7, vec![make_comment(100, "fix the loop")])]);
        platform.set_thread_state(100, false);
        let mut responses: Vec<Result<String>> =
            (0..5).map(|_| Ok("garbage".to_string())).collect();
        responses.push(Ok(drafts_json(&[("Fix the loop", "high")])));
        let orch = orchestrator(&dir, responses, platform);
        let cancel = CancellationToken::new();

        orch.fetch(&cancel, 42).await.unwrap();

        // Make the queue entry due now
        let mut queue = FailedComments::load(&orch.store).unwrap();
        queue.comments[0].next_retry = Utc::now() - Duration::minutes(1);
        queue.save(&orch.store).unwrap();

        let (recovered, still_failing) = orch.retry(&cancel, 42).await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(still_failing, 0);

        let tasks = orch.store.tasks_by_pr(42).unwrap();
        assert_eq!(tasks.len(), 1);
        let queue = FailedComments::load(&orch.store).unwrap();
        assert!(queue.comments[0].is_resolved);
    }

    #[tokio::test]
    async fn cancellation_leaves_checkpoint() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_reviews(vec![make_review(7, vec![make_comment(100, "fix")])]);
        let orch = orchestrator(&dir, vec![Ok("[]".to_string())], platform);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.fetch(&cancel, 42).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(load_checkpoint(&orch.store, 42).unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_closed_prs() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_pr_open(1, true);
        platform.set_pr_open(2, false);
        let orch = orchestrator(&dir, vec![], platform);
        orch.store.save_tasks(1, vec![]).unwrap();
        orch.store.save_tasks(2, vec![]).unwrap();
        let cancel = CancellationToken::new();

        let removed = orch.cleanup(&cancel).await.unwrap();
        assert_eq!(removed, vec![2]);
        assert_eq!(orch.store.pr_numbers().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn status_counts_by_status() {
        let dir = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        platform.set_reviews(vec![make_review(
            7,
            vec![make_comment(100, "fix"), make_comment(101, "nit: also fix")],
        )]);
        platform.set_thread_state(100, false);
        platform.set_thread_state(101, false);
        let orch = orchestrator(
            &dir,
            vec![
                Ok(drafts_json(&[("Fix", "high")])),
                Ok(drafts_json(&[("Also fix", "low")])),
            ],
            platform,
        );
        let cancel = CancellationToken::new();
        orch.fetch(&cancel, 42).await.unwrap();

        let report = orch.status(Some(42)).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.counts["todo"], 1);
        assert_eq!(report.counts["pending"], 1);

        let all = orch.status(None).unwrap();
        assert_eq!(all.total, 2);
    }
}
