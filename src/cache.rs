use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;
use crate::models::Comment;
use crate::store::Store;

/// Cache record for one processed comment in `PR-<n>/review_cache.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentCacheEntry {
    pub comment_id: i64,
    pub content_hash: String,
    #[serde(default)]
    pub thread_depth: u32,
    pub last_processed: DateTime<Utc>,
    #[serde(default)]
    pub tasks_generated: Vec<Uuid>,
}

/// Per-PR cache mapping comment id to the content hash it was last
/// processed under, plus the task ids that processing produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewCache {
    #[serde(default)]
    pub entries: BTreeMap<i64, CommentCacheEntry>,
}

/// Content hash over a comment and its full reply thread. Every hashed
/// field is length-prefixed so identical bodies under different ids (or
/// shifted field boundaries) produce different digests.
pub fn content_hash(comment: &Comment) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |field: &str| {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    };

    feed(&comment.id.to_string());
    feed(&comment.body);
    feed(&comment.author);
    feed(&comment.file);
    feed(&comment.line.to_string());
    for reply in &comment.replies {
        feed(&reply.id.to_string());
        feed(&reply.body);
        feed(&reply.author);
        feed(&reply.created_at.to_rfc3339());
    }
    format!("{:x}", hasher.finalize())
}

impl ReviewCache {
    pub fn load(store: &Store, pr: u64) -> Result<Self> {
        Ok(store.read_json(&store.cache_path(pr))?.unwrap_or_default())
    }

    pub fn save(&self, store: &Store, pr: u64) -> Result<()> {
        store.write_json(&store.cache_path(pr), self)
    }

    /// Split the current comments into (new, modified) against the cache.
    /// A comment whose hash matches its cache entry appears in neither.
    pub fn detect_comment_changes<'a>(
        &self,
        current: &'a [Comment],
    ) -> (Vec<&'a Comment>, Vec<&'a Comment>) {
        let mut new = Vec::new();
        let mut modified = Vec::new();
        for comment in current {
            match self.entries.get(&comment.id) {
                None => new.push(comment),
                Some(entry) if entry.content_hash != content_hash(comment) => {
                    modified.push(comment)
                }
                Some(_) => {}
            }
        }
        (new, modified)
    }

    /// Comments whose content hash matches the cache: skip candidates whose
    /// previously generated tasks can be reused.
    pub fn cached_comments<'a>(&self, current: &'a [Comment]) -> Vec<&'a Comment> {
        current
            .iter()
            .filter(|c| {
                self.entries
                    .get(&c.id)
                    .is_some_and(|e| e.content_hash == content_hash(c))
            })
            .collect()
    }

    /// Task ids generated the last time this comment was processed.
    pub fn cached_task_ids(&self, comment_id: i64) -> Vec<Uuid> {
        self.entries
            .get(&comment_id)
            .map(|e| e.tasks_generated.clone())
            .unwrap_or_default()
    }

    /// Record each comment with the task ids its processing produced.
    /// `task_id_groups` pairs with `comments` by index.
    pub fn update_comment_cache(&mut self, comments: &[Comment], task_id_groups: &[Vec<Uuid>]) {
        let now = Utc::now();
        for (i, comment) in comments.iter().enumerate() {
            let tasks = task_id_groups.get(i).cloned().unwrap_or_default();
            self.entries.insert(
                comment.id,
                CommentCacheEntry {
                    comment_id: comment.id,
                    content_hash: content_hash(comment),
                    thread_depth: comment.replies.len() as u32,
                    last_processed: now,
                    tasks_generated: tasks,
                },
            );
        }
    }

    /// Empty the cache without removing the file.
    pub fn clear(store: &Store, pr: u64) -> Result<()> {
        ReviewCache::default().save(store, pr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reply;
    use crate::store::DEFAULT_ROOT;
    use tempfile::TempDir;

    fn make_comment(id: i64, body: &str) -> Comment {
        Comment {
            id,
            author: "reviewer".to_string(),
            body: body.to_string(),
            file: "src/main.rs".to_string(),
            line: 12,
            created_at: "2024-05-01T10:00:00Z".parse().unwrap(),
            url: String::new(),
            replies: Vec::new(),
            tasks_generated: false,
            all_tasks_completed: false,
            github_thread_resolved: false,
            last_checked_at: None,
        }
    }

    #[test]
    fn content_hash_is_deterministic() {
        let a = make_comment(1, "fix this");
        let b = make_comment(1, "fix this");
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_differs_per_field() {
        let base = make_comment(1, "fix this");

        let mut other_id = base.clone();
        other_id.id = 2;
        assert_ne!(content_hash(&base), content_hash(&other_id));

        let mut other_body = base.clone();
        other_body.body = "fix that".to_string();
        assert_ne!(content_hash(&base), content_hash(&other_body));

        let mut other_author = base.clone();
        other_author.author = "someone".to_string();
        assert_ne!(content_hash(&base), content_hash(&other_author));

        let mut other_file = base.clone();
        other_file.file = "src/lib.rs".to_string();
        assert_ne!(content_hash(&base), content_hash(&other_file));

        let mut other_line = base.clone();
        other_line.line = 13;
        assert_ne!(content_hash(&base), content_hash(&other_line));
    }

    #[test]
    fn content_hash_covers_replies() {
        let base = make_comment(1, "fix this");
        let mut with_reply = base.clone();
        with_reply.replies.push(Reply {
            id: 9,
            author: "dev".to_string(),
            body: "done".to_string(),
            created_at: "2024-05-02T10:00:00Z".parse().unwrap(),
        });
        assert_ne!(content_hash(&base), content_hash(&with_reply));

        let mut edited_reply = with_reply.clone();
        edited_reply.replies[0].body = "not yet".to_string();
        assert_ne!(content_hash(&with_reply), content_hash(&edited_reply));
    }

    #[test]
    fn content_hash_resists_field_boundary_shifts() {
        let mut a = make_comment(1, "ab");
        a.author = "c".to_string();
        let mut b = make_comment(1, "a");
        b.author = "bc".to_string();
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn ignores_thread_resolution_fields() {
        let base = make_comment(1, "fix this");
        let mut resolved = base.clone();
        resolved.github_thread_resolved = true;
        resolved.last_checked_at = Some(Utc::now());
        assert_eq!(content_hash(&base), content_hash(&resolved));
    }

    #[test]
    fn detect_changes_splits_new_and_modified() {
        let mut cache = ReviewCache::default();
        let known = make_comment(1, "original");
        cache.update_comment_cache(std::slice::from_ref(&known), &[vec![]]);

        let mut edited = known.clone();
        edited.body = "edited".to_string();
        let fresh = make_comment(2, "brand new");

        let current = vec![edited, fresh];
        let (new, modified) = cache.detect_comment_changes(&current);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].id, 2);
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].id, 1);
    }

    #[test]
    fn unchanged_comments_are_cached() {
        let mut cache = ReviewCache::default();
        let comment = make_comment(1, "stable");
        cache.update_comment_cache(std::slice::from_ref(&comment), &[vec![]]);

        let (new, modified) = cache.detect_comment_changes(std::slice::from_ref(&comment));
        assert!(new.is_empty());
        assert!(modified.is_empty());

        let cached = cache.cached_comments(std::slice::from_ref(&comment));
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn update_cache_associates_task_ids_by_index() {
        let mut cache = ReviewCache::default();
        let comments = vec![make_comment(1, "a"), make_comment(2, "b")];
        let ids_a = vec![Uuid::new_v4(), Uuid::new_v4()];
        let ids_b = vec![Uuid::new_v4()];
        cache.update_comment_cache(&comments, &[ids_a.clone(), ids_b.clone()]);

        assert_eq!(cache.cached_task_ids(1), ids_a);
        assert_eq!(cache.cached_task_ids(2), ids_b);
        assert!(cache.cached_task_ids(3).is_empty());
    }

    #[test]
    fn thread_depth_recorded() {
        let mut cache = ReviewCache::default();
        let mut comment = make_comment(1, "a");
        comment.replies.push(Reply {
            id: 2,
            author: "dev".to_string(),
            body: "r".to_string(),
            created_at: Utc::now(),
        });
        cache.update_comment_cache(std::slice::from_ref(&comment), &[vec![]]);
        assert_eq!(cache.entries[&1].thread_depth, 1);
    }

    #[test]
    fn clear_empties_but_keeps_file() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join(DEFAULT_ROOT));

        let mut cache = ReviewCache::default();
        cache.update_comment_cache(&[make_comment(1, "a")], &[vec![Uuid::new_v4()]]);
        cache.save(&store, 1).unwrap();

        ReviewCache::clear(&store, 1).unwrap();
        assert!(store.cache_path(1).exists());
        let loaded = ReviewCache::load(&store, 1).unwrap();
        assert!(loaded.entries.is_empty());
    }

    #[test]
    fn cache_round_trips_through_store() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join(DEFAULT_ROOT));

        let mut cache = ReviewCache::default();
        cache.update_comment_cache(&[make_comment(1, "a")], &[vec![Uuid::new_v4()]]);
        cache.save(&store, 3).unwrap();

        let loaded = ReviewCache::load(&store, 3).unwrap();
        assert_eq!(loaded, cache);
    }

    #[test]
    fn load_missing_cache_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join(DEFAULT_ROOT));
        assert!(ReviewCache::load(&store, 1).unwrap().entries.is_empty());
    }
}
