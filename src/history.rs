use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::Comment;
use crate::store::Store;

/// Modification log for one comment, keyed by comment id in
/// `PR-<n>/comment_history.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentHistory {
    pub comment_id: i64,
    pub original_text: String,
    pub current_text: String,
    pub first_seen: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    pub text_hash: String,
    #[serde(default)]
    pub modification_count: u32,
}

pub type HistoryMap = BTreeMap<i64, CommentHistory>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Modified,
    Deleted,
    Unchanged,
}

/// One comment's classification against the stored history.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentChange {
    pub comment_id: i64,
    pub kind: ChangeKind,
    /// Current comment text; empty for deletions.
    pub text: String,
}

/// SHA-256 of the UTF-8 bytes, lowercase hex.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn load(store: &Store, pr: u64) -> Result<HistoryMap> {
    Ok(store
        .read_json(&store.history_path(pr))?
        .unwrap_or_default())
}

pub fn save(store: &Store, pr: u64, entries: &HistoryMap) -> Result<()> {
    store.write_json(&store.history_path(pr), entries)
}

/// Classify the current comment set against the history: unseen ids and
/// restored deletions are `New`, hash mismatches are `Modified`, hash
/// matches are `Unchanged`, and history entries absent from the current set
/// are `Deleted`.
pub fn analyze_comment_changes(current: &[Comment], history: &HistoryMap) -> Vec<CommentChange> {
    let mut changes = Vec::new();
    let mut seen = std::collections::BTreeSet::new();

    for comment in current {
        seen.insert(comment.id);
        let kind = match history.get(&comment.id) {
            None => ChangeKind::New,
            Some(entry) if entry.is_deleted => ChangeKind::New,
            Some(entry) if entry.text_hash != text_hash(&comment.body) => ChangeKind::Modified,
            Some(_) => ChangeKind::Unchanged,
        };
        changes.push(CommentChange {
            comment_id: comment.id,
            kind,
            text: comment.body.clone(),
        });
    }

    for (&comment_id, entry) in history {
        if !seen.contains(&comment_id) && !entry.is_deleted {
            changes.push(CommentChange {
                comment_id,
                kind: ChangeKind::Deleted,
                text: String::new(),
            });
        }
    }

    changes
}

/// Apply a batch of changes to the history map. `modification_count` only
/// ever grows; deletions are tombstoned, never removed.
pub fn update_history(changes: &[CommentChange], history: &mut HistoryMap) {
    let now = Utc::now();
    for change in changes {
        match change.kind {
            ChangeKind::New => {
                match history.get_mut(&change.comment_id) {
                    // Restored after a deletion: keep provenance, refresh text
                    Some(entry) => {
                        entry.is_deleted = false;
                        entry.current_text = change.text.clone();
                        entry.text_hash = text_hash(&change.text);
                        entry.last_modified = now;
                    }
                    None => {
                        history.insert(
                            change.comment_id,
                            CommentHistory {
                                comment_id: change.comment_id,
                                original_text: change.text.clone(),
                                current_text: change.text.clone(),
                                first_seen: now,
                                last_modified: now,
                                is_deleted: false,
                                text_hash: text_hash(&change.text),
                                modification_count: 0,
                            },
                        );
                    }
                }
            }
            ChangeKind::Modified => {
                if let Some(entry) = history.get_mut(&change.comment_id) {
                    entry.current_text = change.text.clone();
                    entry.text_hash = text_hash(&change.text);
                    entry.last_modified = now;
                    entry.modification_count += 1;
                }
            }
            ChangeKind::Deleted => {
                if let Some(entry) = history.get_mut(&change.comment_id) {
                    entry.is_deleted = true;
                    entry.last_modified = now;
                }
            }
            ChangeKind::Unchanged => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_ROOT;
    use tempfile::TempDir;

    fn make_comment(id: i64, body: &str) -> Comment {
        Comment {
            id,
            author: "reviewer".to_string(),
            body: body.to_string(),
            file: String::new(),
            line: 0,
            created_at: Utc::now(),
            url: String::new(),
            replies: Vec::new(),
            tasks_generated: false,
            all_tasks_completed: false,
            github_thread_resolved: false,
            last_checked_at: None,
        }
    }

    fn kinds(changes: &[CommentChange]) -> BTreeMap<i64, ChangeKind> {
        changes.iter().map(|c| (c.comment_id, c.kind)).collect()
    }

    #[test]
    fn text_hash_is_sha256_hex_lower() {
        // printf 'hello' | sha256sum
        assert_eq!(
            text_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(text_hash(""), text_hash(""));
        assert_ne!(text_hash("a"), text_hash("b"));
    }

    #[test]
    fn first_sight_is_new() {
        let history = HistoryMap::new();
        let changes = analyze_comment_changes(&[make_comment(1, "hi")], &history);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::New);
    }

    #[test]
    fn unchanged_and_modified_split_by_hash() {
        let mut history = HistoryMap::new();
        let initial = analyze_comment_changes(
            &[make_comment(1, "stable"), make_comment(2, "will change")],
            &history,
        );
        update_history(&initial, &mut history);

        let changes = analyze_comment_changes(
            &[make_comment(1, "stable"), make_comment(2, "changed now")],
            &history,
        );
        let kinds = kinds(&changes);
        assert_eq!(kinds[&1], ChangeKind::Unchanged);
        assert_eq!(kinds[&2], ChangeKind::Modified);
    }

    #[test]
    fn missing_comment_is_deleted() {
        let mut history = HistoryMap::new();
        let initial = analyze_comment_changes(&[make_comment(1, "here")], &history);
        update_history(&initial, &mut history);

        let changes = analyze_comment_changes(&[], &history);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Deleted);
        assert!(changes[0].text.is_empty());
    }

    #[test]
    fn deleted_then_seen_again_is_new() {
        let mut history = HistoryMap::new();
        update_history(
            &analyze_comment_changes(&[make_comment(1, "text")], &history),
            &mut history,
        );
        update_history(&analyze_comment_changes(&[], &history), &mut history);
        assert!(history[&1].is_deleted);

        let changes = analyze_comment_changes(&[make_comment(1, "text")], &history);
        assert_eq!(changes[0].kind, ChangeKind::New);

        update_history(&changes, &mut history);
        assert!(!history[&1].is_deleted);
        // Already-tombstoned entries are not re-reported as deleted
        let changes = analyze_comment_changes(&[make_comment(1, "text")], &history);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn modification_count_monotonically_increases() {
        let mut history = HistoryMap::new();
        update_history(
            &analyze_comment_changes(&[make_comment(1, "v1")], &history),
            &mut history,
        );
        assert_eq!(history[&1].modification_count, 0);

        for (i, body) in ["v2", "v3", "v4"].iter().enumerate() {
            update_history(
                &analyze_comment_changes(&[make_comment(1, body)], &history),
                &mut history,
            );
            assert_eq!(history[&1].modification_count, i as u32 + 1);
        }
        assert_eq!(history[&1].original_text, "v1");
        assert_eq!(history[&1].current_text, "v4");
    }

    #[test]
    fn restore_preserves_original_text_and_count() {
        let mut history = HistoryMap::new();
        update_history(
            &analyze_comment_changes(&[make_comment(1, "v1")], &history),
            &mut history,
        );
        update_history(
            &analyze_comment_changes(&[make_comment(1, "v2")], &history),
            &mut history,
        );
        update_history(&analyze_comment_changes(&[], &history), &mut history);

        update_history(
            &analyze_comment_changes(&[make_comment(1, "v3")], &history),
            &mut history,
        );
        let entry = &history[&1];
        assert_eq!(entry.original_text, "v1");
        assert_eq!(entry.current_text, "v3");
        assert_eq!(entry.modification_count, 1);
    }

    #[test]
    fn history_round_trips_through_store() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join(DEFAULT_ROOT));

        let mut history = HistoryMap::new();
        update_history(
            &analyze_comment_changes(
                &[make_comment(1, "alpha"), make_comment(2, "beta")],
                &history,
            ),
            &mut history,
        );
        save(&store, 7, &history).unwrap();

        let loaded = load(&store, 7).unwrap();
        assert_eq!(loaded, history);
    }

    #[test]
    fn load_missing_history_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join(DEFAULT_ROOT));
        assert!(load(&store, 1).unwrap().is_empty());
    }
}
