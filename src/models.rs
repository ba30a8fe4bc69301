use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Deserialize a JSON `null` array as an empty vec.
/// Historical files wrote `null` where newer writers emit `[]`.
fn null_as_empty<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(de)?;
    Ok(opt.unwrap_or_default())
}

/// Pull-request metadata stored in `PR-<n>/info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub branch: String,
    pub state: PrState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
}

/// A review with its comments. Self-reviews use `id = -1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    pub reviewer: String,
    pub state: ReviewState,
    #[serde(default)]
    pub body: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub comments: Vec<Comment>,
}

pub const SELF_REVIEW_ID: i64 = -1;

impl Review {
    pub fn is_self_review(&self) -> bool {
        self.id == SELF_REVIEW_ID
    }
}

/// Review states as the platform reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Pending,
}

/// A review comment. `file = "" && line = 0` denotes an issue-level comment
/// with no position in the diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub replies: Vec<Reply>,
    #[serde(default)]
    pub tasks_generated: bool,
    #[serde(default)]
    pub all_tasks_completed: bool,
    #[serde(default)]
    pub github_thread_resolved: bool,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn is_issue_level(&self) -> bool {
        self.file.is_empty() && self.line == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: i64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Task lifecycle status. `"cancelled"` appears in historical files and is
/// accepted on read; every write emits `"cancel"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Pending,
    #[serde(alias = "cancelled")]
    Cancel,
}

impl TaskStatus {
    /// Terminal statuses survive merges untouched.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancel)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
            TaskStatus::Pending => "pending",
            TaskStatus::Cancel => "cancel",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "doing" => Ok(TaskStatus::Doing),
            "done" => Ok(TaskStatus::Done),
            "pending" => Ok(TaskStatus::Pending),
            "cancel" | "cancelled" => Ok(TaskStatus::Cancel),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationStatus {
    #[default]
    NotImplemented,
    Implemented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    NotVerified,
    Verified,
    Failed,
}

/// One verification attempt recorded against a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// An actionable unit of work derived from a review comment.
///
/// Identity is `id`; logical identity within a comment is
/// `(source_comment_id, task_index)`. Unknown fields found on disk are
/// carried through `extra` so newer files survive a round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    #[serde(default)]
    pub origin_text: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub source_review_id: i64,
    pub source_comment_id: i64,
    pub task_index: u32,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    pub pr: u64,
    #[serde(default)]
    pub comment_hash: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub cancel_comment_posted: bool,
    #[serde(default)]
    pub implementation_status: ImplementationStatus,
    #[serde(default)]
    pub verification_status: VerificationStatus,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub verification_results: Vec<VerificationResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Envelope for `PR-<n>/reviews.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewsFile {
    pub generated_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_version: u32,
}

/// Envelope for `PR-<n>/tasks.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasksFile {
    pub generated_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tasks: Vec<Task>,
}
