use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    PrInfo, Review, ReviewsFile, Task, TaskStatus, TasksFile, VerificationResult,
    VerificationStatus,
};

pub const DEFAULT_ROOT: &str = ".pr-review";

/// On-disk store rooted at `.pr-review/`. One subdirectory per PR
/// (`PR-<n>/`), JSON files throughout, every write an atomic replace.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pr_dir(&self, pr: u64) -> PathBuf {
        self.root.join(format!("PR-{pr}"))
    }

    pub fn info_path(&self, pr: u64) -> PathBuf {
        self.pr_dir(pr).join("info.json")
    }

    pub fn reviews_path(&self, pr: u64) -> PathBuf {
        self.pr_dir(pr).join("reviews.json")
    }

    pub fn tasks_path(&self, pr: u64) -> PathBuf {
        self.pr_dir(pr).join("tasks.json")
    }

    pub fn checkpoint_path(&self, pr: u64) -> PathBuf {
        self.pr_dir(pr).join("checkpoint.json")
    }

    pub fn cache_path(&self, pr: u64) -> PathBuf {
        self.pr_dir(pr).join("review_cache.json")
    }

    pub fn history_path(&self, pr: u64) -> PathBuf {
        self.pr_dir(pr).join("comment_history.json")
    }

    pub fn failed_comments_path(&self) -> PathBuf {
        self.root.join("failed_comments.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Serialize `value` as 2-space-indented JSON and replace `path`
    /// atomically (write temp + fsync + rename).
    pub fn write_json(&self, path: &Path, value: &impl Serialize) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Store(format!("no parent dir for {}", path.display())))?;
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

        let mut content = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Store(format!("failed to serialize {}: {e}", path.display())))?;
        content.push(b'\n');

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Store(format!("bad file name: {}", path.display())))?;
        let tmp = dir.join(format!(".{file_name}.tmp"));

        let mut file = std::fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        file.write_all(&content).map_err(|e| Error::io(&tmp, e))?;
        file.sync_all().map_err(|e| Error::io(&tmp, e))?;

        std::fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    /// Read and parse a JSON file. Missing file is `None`; a parse failure
    /// surfaces as a corrupt-file error naming the path.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, e)),
        };
        let value = serde_json::from_str(&content).map_err(|e| Error::corrupt(path, e))?;
        Ok(Some(value))
    }

    /// Delete a file; a missing file is not an error.
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    // --- PR info ---

    pub fn save_pr_info(&self, info: &PrInfo) -> Result<()> {
        self.write_json(&self.info_path(info.number), info)
    }

    pub fn load_pr_info(&self, pr: u64) -> Result<Option<PrInfo>> {
        self.read_json(&self.info_path(pr))
    }

    // --- Reviews ---

    /// Persist the current review set, bumping `sync_version`.
    pub fn save_reviews(&self, pr: u64, reviews: Vec<Review>) -> Result<()> {
        let prior: Option<ReviewsFile> = self.read_json(&self.reviews_path(pr))?;
        let now = Utc::now();
        let file = ReviewsFile {
            generated_at: now,
            reviews,
            last_sync_at: Some(now),
            sync_version: prior.map(|f| f.sync_version + 1).unwrap_or(1),
        };
        self.write_json(&self.reviews_path(pr), &file)
    }

    /// Load the review set for a PR. A missing file yields an empty list.
    pub fn load_reviews(&self, pr: u64) -> Result<Vec<Review>> {
        Ok(self
            .read_json::<ReviewsFile>(&self.reviews_path(pr))?
            .map(|f| f.reviews)
            .unwrap_or_default())
    }

    // --- Tasks ---

    pub fn save_tasks(&self, pr: u64, tasks: Vec<Task>) -> Result<()> {
        let file = TasksFile {
            generated_at: Utc::now(),
            tasks,
        };
        self.write_json(&self.tasks_path(pr), &file)
    }

    pub fn tasks_by_pr(&self, pr: u64) -> Result<Vec<Task>> {
        Ok(self
            .read_json::<TasksFile>(&self.tasks_path(pr))?
            .map(|f| f.tasks)
            .unwrap_or_default())
    }

    pub fn tasks_by_comment(&self, pr: u64, comment_id: i64) -> Result<Vec<Task>> {
        Ok(self
            .tasks_by_pr(pr)?
            .into_iter()
            .filter(|t| t.source_comment_id == comment_id)
            .collect())
    }

    /// Enumerate PR numbers with a `PR-<n>` directory in the store root.
    pub fn pr_numbers(&self) -> Result<Vec<u64>> {
        let pattern = Regex::new(r"^PR-(\d+)$").expect("valid regex");
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.root, e)),
        };

        let mut numbers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(caps) = pattern.captures(name)
                && let Ok(n) = caps[1].parse::<u64>()
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Aggregate tasks from every PR directory. PRs without a tasks file are
    /// skipped; a malformed tasks file fails with its path.
    pub fn all_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for pr in self.pr_numbers()? {
            tasks.extend(self.tasks_by_pr(pr)?);
        }
        Ok(tasks)
    }

    /// Set a task's status, searching every PR. Unknown ids surface the
    /// not-found sentinel.
    pub fn update_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<()> {
        for pr in self.pr_numbers()? {
            let mut tasks = self.tasks_by_pr(pr)?;
            if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
                task.status = status;
                task.updated_at = Utc::now();
                debug!(%task_id, %status, pr, "task status updated");
                return self.save_tasks(pr, tasks);
            }
        }
        Err(Error::TaskNotFound(task_id.to_string()))
    }

    /// Append a verification result to a task. A successful verification
    /// also marks the task implemented.
    pub fn update_task_verification_status(
        &self,
        task_id: Uuid,
        result: VerificationResult,
    ) -> Result<()> {
        for pr in self.pr_numbers()? {
            let mut tasks = self.tasks_by_pr(pr)?;
            if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
                task.verification_status = if result.success {
                    VerificationStatus::Verified
                } else {
                    VerificationStatus::Failed
                };
                if result.success {
                    task.implementation_status = crate::models::ImplementationStatus::Implemented;
                }
                task.verification_results.push(result);
                task.updated_at = Utc::now();
                return self.save_tasks(pr, tasks);
            }
        }
        Err(Error::TaskNotFound(task_id.to_string()))
    }

    pub fn task_verification_history(&self, task_id: Uuid) -> Result<Vec<VerificationResult>> {
        for pr in self.pr_numbers()? {
            if let Some(task) = self
                .tasks_by_pr(pr)?
                .into_iter()
                .find(|t| t.id == task_id)
            {
                return Ok(task.verification_results);
            }
        }
        Err(Error::TaskNotFound(task_id.to_string()))
    }

    // --- Merge semantics ---

    /// Merge freshly generated tasks with what is already on disk, never
    /// regressing a status the user set by hand. Tasks are grouped by source
    /// comment; per group:
    ///
    /// 1. nothing existing: the new tasks are appended as-is;
    /// 2. nothing new (comment deleted): non-terminal existing tasks become
    ///    `cancel`, terminal ones are untouched;
    /// 3. the comment text changed significantly: non-terminal existing
    ///    tasks become `cancel` and all new tasks are appended;
    /// 4. otherwise: existing tasks are preserved and new tasks beyond the
    ///    existing count are appended by index.
    pub fn merge_tasks(&self, pr: u64, new_tasks: Vec<Task>) -> Result<Vec<Task>> {
        let existing = self.tasks_by_pr(pr)?;
        let merged = merge_task_sets(existing, new_tasks);
        self.save_tasks(pr, merged.clone())?;
        Ok(merged)
    }

    // --- Thread resolution bookkeeping ---

    /// Mark one comment's upstream thread resolved in the stored reviews.
    /// Idempotent; only timestamps advance on repeat calls.
    pub fn mark_comment_thread_resolved(&self, pr: u64, comment_id: i64) -> Result<()> {
        let path = self.reviews_path(pr);
        let Some(mut file) = self.read_json::<ReviewsFile>(&path)? else {
            return Err(Error::Store(format!(
                "no reviews stored for PR {pr}, cannot resolve comment {comment_id}"
            )));
        };

        let mut found = false;
        for review in &mut file.reviews {
            for comment in &mut review.comments {
                if comment.id == comment_id {
                    comment.github_thread_resolved = true;
                    comment.last_checked_at = Some(Utc::now());
                    found = true;
                }
            }
        }
        if !found {
            return Err(Error::Store(format!(
                "comment {comment_id} not found in reviews for PR {pr}"
            )));
        }
        self.write_json(&path, &file)
    }

    /// Bulk-update `github_thread_resolved` and `last_checked_at` on every
    /// stored comment from a batch of upstream thread states. Comments the
    /// batch does not cover are left alone.
    pub fn update_thread_states(
        &self,
        pr: u64,
        states: &std::collections::HashMap<i64, bool>,
    ) -> Result<()> {
        let path = self.reviews_path(pr);
        let Some(mut file) = self.read_json::<ReviewsFile>(&path)? else {
            return Ok(());
        };
        let now = Utc::now();
        for review in &mut file.reviews {
            for comment in &mut review.comments {
                if let Some(&resolved) = states.get(&comment.id) {
                    comment.github_thread_resolved = resolved;
                    comment.last_checked_at = Some(now);
                }
            }
        }
        self.write_json(&path, &file)
    }

    /// Flag stored comments as having gone through task generation.
    pub fn update_comments_tasks_generated(&self, pr: u64, comment_ids: &[i64]) -> Result<()> {
        let path = self.reviews_path(pr);
        let Some(mut file) = self.read_json::<ReviewsFile>(&path)? else {
            return Ok(());
        };
        for review in &mut file.reviews {
            for comment in &mut review.comments {
                if comment_ids.contains(&comment.id) {
                    comment.tasks_generated = true;
                }
            }
        }
        self.write_json(&path, &file)
    }

    /// Bulk-update `all_tasks_completed` on stored comments.
    pub fn update_comments_completion(
        &self,
        pr: u64,
        completion: &std::collections::HashMap<i64, bool>,
    ) -> Result<()> {
        let path = self.reviews_path(pr);
        let Some(mut file) = self.read_json::<ReviewsFile>(&path)? else {
            return Ok(());
        };
        for review in &mut file.reviews {
            for comment in &mut review.comments {
                if let Some(&complete) = completion.get(&comment.id) {
                    comment.all_tasks_completed = complete;
                }
            }
        }
        self.write_json(&path, &file)
    }

    // --- Cleanup ---

    /// Remove whole PR directories for PRs the platform reports closed.
    /// Returns the removed PR numbers.
    pub fn cleanup_closed_prs(
        &self,
        mut is_open: impl FnMut(u64) -> Result<bool>,
    ) -> Result<Vec<u64>> {
        let mut removed = Vec::new();
        for pr in self.pr_numbers()? {
            match is_open(pr) {
                Ok(true) => {}
                Ok(false) => {
                    let dir = self.pr_dir(pr);
                    std::fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
                    debug!(pr, "removed closed PR directory");
                    removed.push(pr);
                }
                Err(e) => {
                    warn!(pr, error = %e, "could not determine PR state, keeping directory");
                }
            }
        }
        Ok(removed)
    }
}

/// Pure merge of an existing task set with a freshly generated one, per
/// the rules on [`Store::merge_tasks`].
pub fn merge_task_sets(existing: Vec<Task>, new_tasks: Vec<Task>) -> Vec<Task> {
    let mut existing_groups: BTreeMap<i64, Vec<Task>> = BTreeMap::new();
    for task in existing {
        existing_groups
            .entry(task.source_comment_id)
            .or_default()
            .push(task);
    }
    let mut new_groups: BTreeMap<i64, Vec<Task>> = BTreeMap::new();
    for task in new_tasks {
        new_groups
            .entry(task.source_comment_id)
            .or_default()
            .push(task);
    }

    let comment_ids: Vec<i64> = existing_groups
        .keys()
        .chain(new_groups.keys())
        .copied()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut merged = Vec::new();
    for comment_id in comment_ids {
        let old = existing_groups.remove(&comment_id).unwrap_or_default();
        let mut new = new_groups.remove(&comment_id).unwrap_or_default();
        new.sort_by_key(|t| t.task_index);
        merged.extend(merge_comment_group(comment_id, old, new));
    }
    merged
}

/// Merge one comment's task group per the rules on [`Store::merge_tasks`].
fn merge_comment_group(comment_id: i64, old: Vec<Task>, new: Vec<Task>) -> Vec<Task> {
    if old.is_empty() {
        return new;
    }

    if new.is_empty() {
        debug!(comment_id, "comment gone, cancelling non-terminal tasks");
        return cancel_non_terminal(old);
    }

    let old_text = &old[0].origin_text;
    let new_text = &new[0].origin_text;
    if text_changed_significantly(old_text, new_text) {
        debug!(comment_id, "comment text changed, replacing task set");
        let mut merged = cancel_non_terminal(old);
        merged.extend(new);
        return merged;
    }

    // Same comment text: keep what exists, append only the surplus new
    // tasks by index. New tasks below the existing count are duplicates of
    // tasks already tracked (possibly user-edited) and are dropped.
    let existing_count = old.len() as u32;
    let mut merged = old;
    merged.extend(new.into_iter().filter(|t| t.task_index >= existing_count));
    merged
}

fn cancel_non_terminal(tasks: Vec<Task>) -> Vec<Task> {
    let now = Utc::now();
    tasks
        .into_iter()
        .map(|mut t| {
            if !t.status.is_terminal() {
                t.status = TaskStatus::Cancel;
                t.updated_at = now;
            }
            t
        })
        .collect()
}

/// Markdown/whitespace normalization for origin-text comparison: markdown
/// punctuation stripped, whitespace collapsed, case folded.
fn normalize_text(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`' | '#' | '~' | '>'))
        .collect();
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A change is significant when the normalized texts differ or the raw
/// length ratio falls outside [0.5, 2.0].
fn text_changed_significantly(old: &str, new: &str) -> bool {
    if normalize_text(old) != normalize_text(new) {
        return true;
    }
    let (old_len, new_len) = (old.len().max(1) as f64, new.len().max(1) as f64);
    let ratio = new_len / old_len;
    !(0.5..=2.0).contains(&ratio)
}
