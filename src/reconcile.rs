use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AutoResolveMode;
use crate::error::Result;
use crate::models::{Task, TaskStatus};
use crate::platform::PlatformClient;
use crate::store::Store;

/// Result of one reconciliation pass. Warnings never fail the operation;
/// they accumulate here.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub total_comments: usize,
    pub resolved_on_github: usize,
    /// Comment ids whose threads this pass resolved upstream.
    pub resolved_threads: Vec<i64>,
    /// Cancelled tasks still owing an upstream reply, per comment.
    pub pending_cancel_replies: Vec<(i64, Uuid)>,
    pub warnings: Vec<String>,
}

/// Bidirectional sync between the local task lifecycle and upstream
/// thread-resolution state.
pub struct ReconcileEngine<'a, P> {
    store: &'a Store,
    platform: &'a P,
    mode: AutoResolveMode,
}

/// A task counts as complete for resolution purposes when it is `done`,
/// or cancelled with its cancel reply already posted.
fn is_complete(task: &Task) -> bool {
    match task.status {
        TaskStatus::Done => true,
        TaskStatus::Cancel => task.cancel_comment_posted,
        _ => false,
    }
}

impl<'a, P: PlatformClient> ReconcileEngine<'a, P> {
    pub fn new(store: &'a Store, platform: &'a P, mode: AutoResolveMode) -> Self {
        Self {
            store,
            platform,
            mode,
        }
    }

    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        pr: u64,
    ) -> Result<ReconcileOutcome> {
        let mut states = self.platform.thread_states(cancel, pr).await?;

        let mut outcome = ReconcileOutcome {
            total_comments: states.len(),
            resolved_on_github: states.values().filter(|&&r| r).count(),
            ..Default::default()
        };

        // Group local tasks by source comment
        let mut by_comment: HashMap<i64, Vec<Task>> = HashMap::new();
        for task in self.store.tasks_by_pr(pr)? {
            by_comment.entry(task.source_comment_id).or_default().push(task);
        }

        let mut completion: HashMap<i64, bool> = HashMap::new();
        let mut comment_ids: Vec<i64> = by_comment.keys().copied().collect();
        comment_ids.sort_unstable();

        for comment_id in comment_ids {
            let tasks = &by_comment[&comment_id];
            let Some(&resolved_upstream) = states.get(&comment_id) else {
                debug!(comment_id, "no upstream thread, skipping");
                continue;
            };

            let all_complete = tasks.iter().all(is_complete);
            completion.insert(comment_id, all_complete);

            let pending_replies: Vec<Uuid> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Cancel && !t.cancel_comment_posted)
                .map(|t| t.id)
                .collect();
            if !pending_replies.is_empty() {
                outcome.warnings.push(format!(
                    "comment {comment_id}: {} cancelled task(s) without a posted cancel reply, not auto-resolving",
                    pending_replies.len()
                ));
                outcome
                    .pending_cancel_replies
                    .extend(pending_replies.into_iter().map(|id| (comment_id, id)));
                continue;
            }

            let should_resolve = match self.mode {
                AutoResolveMode::Disabled => false,
                AutoResolveMode::Complete => all_complete,
                AutoResolveMode::Immediate => tasks.iter().any(is_complete),
            };

            if should_resolve && !resolved_upstream {
                match self.platform.resolve_thread(cancel, pr, comment_id).await {
                    Ok(()) => {
                        info!(pr, comment_id, "resolved upstream thread");
                        outcome.resolved_threads.push(comment_id);
                        states.insert(comment_id, true);
                        outcome.resolved_on_github += 1;
                    }
                    Err(e) => {
                        warn!(pr, comment_id, error = %e, "thread resolution failed");
                        outcome
                            .warnings
                            .push(format!("comment {comment_id}: resolve failed: {e}"));
                    }
                }
            }
        }

        // Push the (possibly updated) batch state back onto every stored
        // comment, then the completion flags.
        self.store.update_thread_states(pr, &states)?;
        self.store.update_comments_completion(pr, &completion)?;

        Ok(outcome)
    }
}
