use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FailureKind, Result};
use crate::store::Store;

/// Retry delays in minutes, indexed by retry count. Counts past the end of
/// the table stay at 24h.
const BACKOFF_MINUTES: &[i64] = &[1, 5, 15, 30, 60, 120, 240, 480, 1440];

/// Delay before the next retry attempt for a given retry count.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let minutes = BACKOFF_MINUTES
        .get(retry_count as usize)
        .copied()
        .unwrap_or(*BACKOFF_MINUTES.last().expect("table is non-empty"));
    Duration::minutes(minutes)
}

/// A comment the LLM could not process, queued for retry in
/// `failed_comments.json` at the store root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedComment {
    pub comment_id: i64,
    pub review_id: i64,
    pub pr: u64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub url: String,
    pub error: String,
    pub error_type: FailureKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry: Option<DateTime<Utc>>,
    pub next_retry: DateTime<Utc>,
    #[serde(default)]
    pub is_resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Statistics recomputed on every mutation of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedStats {
    pub total_failures: u32,
    pub resolved_count: u32,
    pub pending_count: u32,
    #[serde(default)]
    pub by_error_type: BTreeMap<String, u32>,
    #[serde(default)]
    pub next_scheduled_retry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedComments {
    #[serde(default)]
    pub comments: Vec<FailedComment>,
    #[serde(default)]
    pub statistics: FailedStats,
}

/// Fields describing a fresh failure, before queue bookkeeping is applied.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub comment_id: i64,
    pub review_id: i64,
    pub pr: u64,
    pub file: String,
    pub line: u32,
    pub author: String,
    pub body: String,
    pub url: String,
    pub error: String,
    pub error_type: FailureKind,
}

impl FailedComments {
    pub fn load(store: &Store) -> Result<Self> {
        Ok(store
            .read_json(&store.failed_comments_path())?
            .unwrap_or_default())
    }

    pub fn save(&self, store: &Store) -> Result<()> {
        store.write_json(&store.failed_comments_path(), self)
    }

    /// Upsert a failure by comment id. A repeat failure bumps the retry
    /// count and pushes `next_retry` out along the backoff table; a first
    /// failure schedules the shortest delay.
    pub fn save_failed_comment(&mut self, record: FailureRecord) {
        let now = Utc::now();
        match self
            .comments
            .iter_mut()
            .find(|c| c.comment_id == record.comment_id)
        {
            Some(existing) => {
                existing.retry_count += 1;
                existing.last_retry = Some(now);
                existing.next_retry = now + backoff_delay(existing.retry_count);
                existing.error = record.error;
                existing.error_type = record.error_type;
                existing.is_resolved = false;
                existing.resolved_at = None;
                debug!(
                    comment_id = record.comment_id,
                    retry_count = existing.retry_count,
                    "failed comment retried and re-queued"
                );
            }
            None => {
                self.comments.push(FailedComment {
                    comment_id: record.comment_id,
                    review_id: record.review_id,
                    pr: record.pr,
                    file: record.file,
                    line: record.line,
                    author: record.author,
                    body: record.body,
                    url: record.url,
                    error: record.error,
                    error_type: record.error_type,
                    timestamp: now,
                    retry_count: 0,
                    last_retry: None,
                    next_retry: now + backoff_delay(0),
                    is_resolved: false,
                    resolved_at: None,
                });
                debug!(comment_id = record.comment_id, "failed comment queued");
            }
        }
        self.recompute_stats();
    }

    /// Unresolved entries whose retry window has opened.
    pub fn retryable_comments(&self) -> Vec<&FailedComment> {
        let now = Utc::now();
        self.comments
            .iter()
            .filter(|c| !c.is_resolved && now >= c.next_retry)
            .collect()
    }

    /// Flip an entry to resolved. Returns false when the id is unknown.
    pub fn mark_comment_resolved(&mut self, comment_id: i64) -> bool {
        let found = match self
            .comments
            .iter_mut()
            .find(|c| c.comment_id == comment_id)
        {
            Some(entry) => {
                entry.is_resolved = true;
                entry.resolved_at = Some(Utc::now());
                true
            }
            None => false,
        };
        self.recompute_stats();
        found
    }

    /// Drop resolved entries. Returns how many were removed.
    pub fn clear_resolved_comments(&mut self) -> usize {
        let before = self.comments.len();
        self.comments.retain(|c| !c.is_resolved);
        self.recompute_stats();
        before - self.comments.len()
    }

    fn recompute_stats(&mut self) {
        let mut by_error_type = BTreeMap::new();
        let mut resolved = 0u32;
        let mut next: Option<DateTime<Utc>> = None;
        for c in &self.comments {
            if c.is_resolved {
                resolved += 1;
            } else {
                *by_error_type.entry(c.error_type.to_string()).or_insert(0) += 1;
                next = Some(match next {
                    Some(n) => n.min(c.next_retry),
                    None => c.next_retry,
                });
            }
        }
        self.statistics = FailedStats {
            total_failures: self.comments.len() as u32,
            resolved_count: resolved,
            pending_count: self.comments.len() as u32 - resolved,
            by_error_type,
            next_scheduled_retry: next,
        };
    }
}
