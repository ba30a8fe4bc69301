use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Task;
use crate::store::Store;

/// Crash-safe progress record for a long PR run, stored as
/// `PR-<n>/checkpoint.json`. Its presence means processing is in-progress
/// or died mid-run; successful completion deletes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pr: u64,
    /// Comment id → content hash at the time it was processed.
    #[serde(default)]
    pub processed_comments: BTreeMap<i64, String>,
    pub total_comments: u32,
    pub processed_count: u32,
    pub batch_size: u32,
    pub started_at: DateTime<Utc>,
    pub last_processed_at: DateTime<Utc>,
    #[serde(default)]
    pub partial_tasks: Vec<Task>,
    #[serde(default)]
    pub last_processed_review_id: i64,
    #[serde(default)]
    pub last_processed_index: u32,
}

impl Checkpoint {
    pub fn new(pr: u64, total_comments: u32, batch_size: u32) -> Self {
        let now = Utc::now();
        Self {
            pr,
            processed_comments: BTreeMap::new(),
            total_comments,
            processed_count: 0,
            batch_size,
            started_at: now,
            last_processed_at: now,
            partial_tasks: Vec::new(),
            last_processed_review_id: 0,
            last_processed_index: 0,
        }
    }

    /// Record one processed comment.
    pub fn record(&mut self, comment_id: i64, content_hash: String) {
        if self.processed_comments.insert(comment_id, content_hash).is_none() {
            self.processed_count += 1;
        }
    }
}

pub fn load_checkpoint(store: &Store, pr: u64) -> Result<Option<Checkpoint>> {
    store.read_json(&store.checkpoint_path(pr))
}

/// Persist the checkpoint, touching `last_processed_at`.
pub fn save_checkpoint(store: &Store, checkpoint: &mut Checkpoint) -> Result<()> {
    checkpoint.last_processed_at = Utc::now();
    store.write_json(&store.checkpoint_path(checkpoint.pr), checkpoint)
}

/// Remove the checkpoint after a successful run. Missing file is fine.
pub fn delete_checkpoint(store: &Store, pr: u64) -> Result<()> {
    store.remove_file(&store.checkpoint_path(pr))
}

/// A checkpoint is stale when absent or when `max_age` has fully elapsed
/// since its last write. The boundary counts as stale.
pub fn is_checkpoint_stale(checkpoint: Option<&Checkpoint>, max_age: Duration) -> bool {
    match checkpoint {
        None => true,
        Some(cp) => Utc::now() - cp.last_processed_at >= max_age,
    }
}
