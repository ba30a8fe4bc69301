use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{Comment, Reply, Review, ReviewState};
use crate::process::{ProcessConfig, spawn_and_capture};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Upstream operations the pipeline consumes. Only the contract matters to
/// the pipeline; the shipped implementation shells out to `gh`.
pub trait PlatformClient {
    /// Fetch PR metadata.
    fn fetch_pr_info(
        &self,
        cancel: &CancellationToken,
        pr: u64,
    ) -> impl std::future::Future<Output = Result<crate::models::PrInfo>> + Send;

    /// Fetch the current review set (with comments and replies) for a PR.
    fn fetch_reviews(
        &self,
        cancel: &CancellationToken,
        pr: u64,
    ) -> impl std::future::Future<Output = Result<Vec<Review>>> + Send;

    /// One batch of thread-resolution states: comment id → resolved.
    fn thread_states(
        &self,
        cancel: &CancellationToken,
        pr: u64,
    ) -> impl std::future::Future<Output = Result<HashMap<i64, bool>>> + Send;

    /// Resolve the review thread containing a comment.
    fn resolve_thread(
        &self,
        cancel: &CancellationToken,
        pr: u64,
        comment_id: i64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Post a reply on a review comment thread.
    fn post_reply(
        &self,
        cancel: &CancellationToken,
        pr: u64,
        comment_id: i64,
        body: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Whether the PR is still open upstream.
    fn is_pr_open(
        &self,
        cancel: &CancellationToken,
        pr: u64,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}

/// Abstraction over `gh` CLI execution for testability.
pub trait GhExec: Send + Sync {
    fn run(
        &self,
        cancel: &CancellationToken,
        args: &[String],
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// Real `gh` CLI executor with retry and exponential backoff on transient
/// failures.
pub struct DefaultGhExec;

impl GhExec for DefaultGhExec {
    async fn run(&self, cancel: &CancellationToken, args: &[String]) -> Result<String> {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        for attempt in 1..=MAX_RETRIES {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let config = ProcessConfig {
                command: "gh".to_string(),
                args: args.to_vec(),
                working_dir: None,
                timeout: Some(Duration::from_secs(60)),
                log_prefix: "gh".to_string(),
                env: vec![],
                stdin_data: None,
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                output = spawn_and_capture(config) => output,
            };
            match result {
                Ok(output) if output.success() => return Ok(output.stdout),
                Ok(output) => {
                    let err = Error::Platform(format!("gh failed: {}", output.stderr));
                    if attempt == MAX_RETRIES {
                        return Err(err);
                    }
                    warn!(attempt, error = %err, backoff_ms, "retrying gh call");
                }
                Err(e) => {
                    if attempt == MAX_RETRIES {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, backoff_ms, "retrying gh call");
                }
            }
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2;
        }
        unreachable!()
    }
}

/// `gh`-CLI-backed platform client.
pub struct GhPlatformClient<E = DefaultGhExec> {
    exec: E,
}

impl GhPlatformClient<DefaultGhExec> {
    pub fn new() -> Self {
        Self {
            exec: DefaultGhExec,
        }
    }
}

impl Default for GhPlatformClient<DefaultGhExec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: GhExec> GhPlatformClient<E> {
    pub fn with_exec(exec: E) -> Self {
        Self { exec }
    }

    async fn repo_nwo(&self, cancel: &CancellationToken) -> Result<String> {
        let json = self
            .exec
            .run(
                cancel,
                &args(&["repo", "view", "--json", "owner,name"]),
            )
            .await?;
        let info: RepoInfo = serde_json::from_str(&json)
            .map_err(|e| Error::Platform(format!("failed to parse repo info: {e}")))?;
        Ok(format!("{}/{}", info.owner.login, info.name))
    }

    async fn review_threads(
        &self,
        cancel: &CancellationToken,
        pr: u64,
    ) -> Result<Vec<GqlThread>> {
        let nwo = self.repo_nwo(cancel).await?;
        let (owner, name) = nwo
            .split_once('/')
            .ok_or_else(|| Error::Platform(format!("bad repo nwo: {nwo}")))?;

        let query = r#"
            query($owner: String!, $name: String!, $pr: Int!) {
              repository(owner: $owner, name: $name) {
                pullRequest(number: $pr) {
                  reviewThreads(first: 100) {
                    nodes {
                      id isResolved
                      comments(first: 100) { nodes { databaseId } }
                    }
                  }
                }
              }
            }
        "#;
        let response = self
            .exec
            .run(
                cancel,
                &args(&[
                    "api",
                    "graphql",
                    "-f",
                    &format!("query={query}"),
                    "-f",
                    &format!("owner={owner}"),
                    "-f",
                    &format!("name={name}"),
                    "-F",
                    &format!("pr={pr}"),
                ]),
            )
            .await?;

        let parsed: GqlThreadsResponse = serde_json::from_str(&response)
            .map_err(|e| Error::Platform(format!("failed to parse review threads: {e}")))?;
        Ok(parsed.data.repository.pull_request.review_threads.nodes)
    }
}

impl<E: GhExec> PlatformClient for GhPlatformClient<E> {
    async fn fetch_pr_info(
        &self,
        cancel: &CancellationToken,
        pr: u64,
    ) -> Result<crate::models::PrInfo> {
        let json = self
            .exec
            .run(
                cancel,
                &args(&[
                    "pr",
                    "view",
                    &pr.to_string(),
                    "--json",
                    "number,title,author,headRefName,state,createdAt,updatedAt",
                ]),
            )
            .await?;
        let raw: GhPrView = serde_json::from_str(&json)
            .map_err(|e| Error::Platform(format!("failed to parse PR info: {e}")))?;
        Ok(crate::models::PrInfo {
            number: raw.number,
            title: raw.title,
            author: raw.author.login,
            branch: raw.head_ref_name,
            state: if raw.state == "OPEN" {
                crate::models::PrState::Open
            } else {
                crate::models::PrState::Closed
            },
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }

    async fn fetch_reviews(&self, cancel: &CancellationToken, pr: u64) -> Result<Vec<Review>> {
        let nwo = self.repo_nwo(cancel).await?;

        let reviews_json = self
            .exec
            .run(
                cancel,
                &args(&[
                    "api",
                    &format!("repos/{nwo}/pulls/{pr}/reviews"),
                    "--paginate",
                ]),
            )
            .await?;
        let raw_reviews: Vec<RestReview> = serde_json::from_str(&reviews_json)
            .map_err(|e| Error::Platform(format!("failed to parse reviews: {e}")))?;

        let comments_json = self
            .exec
            .run(
                cancel,
                &args(&[
                    "api",
                    &format!("repos/{nwo}/pulls/{pr}/comments"),
                    "--paginate",
                ]),
            )
            .await?;
        let raw_comments: Vec<RestComment> = serde_json::from_str(&comments_json)
            .map_err(|e| Error::Platform(format!("failed to parse review comments: {e}")))?;

        Ok(assemble_reviews(raw_reviews, raw_comments))
    }

    async fn thread_states(
        &self,
        cancel: &CancellationToken,
        pr: u64,
    ) -> Result<HashMap<i64, bool>> {
        let threads = self.review_threads(cancel, pr).await?;
        let mut states = HashMap::new();
        for thread in threads {
            for comment in &thread.comments.nodes {
                if let Some(id) = comment.database_id {
                    states.insert(id, thread.is_resolved);
                }
            }
        }
        debug!(pr, count = states.len(), "fetched thread states");
        Ok(states)
    }

    async fn resolve_thread(
        &self,
        cancel: &CancellationToken,
        pr: u64,
        comment_id: i64,
    ) -> Result<()> {
        let threads = self.review_threads(cancel, pr).await?;
        let thread = threads
            .iter()
            .find(|t| {
                t.comments
                    .nodes
                    .iter()
                    .any(|c| c.database_id == Some(comment_id))
            })
            .ok_or_else(|| {
                Error::Platform(format!("no review thread contains comment {comment_id}"))
            })?;

        let mutation = r#"
            mutation($thread: ID!) {
              resolveReviewThread(input: {threadId: $thread}) {
                thread { isResolved }
              }
            }
        "#;
        self.exec
            .run(
                cancel,
                &args(&[
                    "api",
                    "graphql",
                    "-f",
                    &format!("query={mutation}"),
                    "-f",
                    &format!("thread={}", thread.id),
                ]),
            )
            .await?;
        debug!(pr, comment_id, "resolved review thread");
        Ok(())
    }

    async fn post_reply(
        &self,
        cancel: &CancellationToken,
        pr: u64,
        comment_id: i64,
        body: &str,
    ) -> Result<()> {
        let nwo = self.repo_nwo(cancel).await?;
        self.exec
            .run(
                cancel,
                &args(&[
                    "api",
                    &format!("repos/{nwo}/pulls/{pr}/comments/{comment_id}/replies"),
                    "-f",
                    &format!("body={body}"),
                ]),
            )
            .await?;
        Ok(())
    }

    async fn is_pr_open(&self, cancel: &CancellationToken, pr: u64) -> Result<bool> {
        let json = self
            .exec
            .run(
                cancel,
                &args(&["pr", "view", &pr.to_string(), "--json", "state"]),
            )
            .await?;
        let state: PrStateJson = serde_json::from_str(&json)
            .map_err(|e| Error::Platform(format!("failed to parse PR state: {e}")))?;
        Ok(state.state == "OPEN")
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Group flat REST review comments under their reviews, threading replies
/// (comments with `in_reply_to_id`) beneath their root comment.
fn assemble_reviews(raw_reviews: Vec<RestReview>, raw_comments: Vec<RestComment>) -> Vec<Review> {
    let mut roots: Vec<RestComment> = Vec::new();
    let mut replies: Vec<RestComment> = Vec::new();
    for comment in raw_comments {
        if comment.in_reply_to_id.is_some() {
            replies.push(comment);
        } else {
            roots.push(comment);
        }
    }

    let mut comments_by_review: HashMap<i64, Vec<Comment>> = HashMap::new();
    for root in roots {
        let review_id = root.pull_request_review_id.unwrap_or(crate::models::SELF_REVIEW_ID);
        let mut comment = Comment {
            id: root.id,
            author: root.user.login.clone(),
            body: root.body.clone(),
            file: root.path.clone().unwrap_or_default(),
            line: root.line.unwrap_or(0),
            created_at: root.created_at,
            url: root.html_url.clone().unwrap_or_default(),
            replies: Vec::new(),
            tasks_generated: false,
            all_tasks_completed: false,
            github_thread_resolved: false,
            last_checked_at: None,
        };
        for reply in replies.iter().filter(|r| r.in_reply_to_id == Some(root.id)) {
            comment.replies.push(Reply {
                id: reply.id,
                author: reply.user.login.clone(),
                body: reply.body.clone(),
                created_at: reply.created_at,
            });
        }
        comments_by_review.entry(review_id).or_default().push(comment);
    }

    let mut reviews: Vec<Review> = Vec::new();
    for raw in raw_reviews {
        let comments = comments_by_review.remove(&raw.id).unwrap_or_default();
        reviews.push(Review {
            id: raw.id,
            reviewer: raw.user.login,
            state: parse_review_state(&raw.state),
            body: raw.body.unwrap_or_default(),
            submitted_at: raw.submitted_at,
            comments,
        });
    }

    // Comments whose review was not returned (e.g. standalone threads)
    // surface under a synthetic self-review.
    let orphans: Vec<Comment> = comments_by_review.into_values().flatten().collect();
    if !orphans.is_empty() {
        let submitted_at = orphans.iter().map(|c| c.created_at).min().expect("non-empty");
        reviews.push(Review {
            id: crate::models::SELF_REVIEW_ID,
            reviewer: orphans[0].author.clone(),
            state: ReviewState::Commented,
            body: String::new(),
            submitted_at,
            comments: orphans,
        });
    }

    reviews
}

fn parse_review_state(raw: &str) -> ReviewState {
    match raw {
        "APPROVED" => ReviewState::Approved,
        "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
        "PENDING" => ReviewState::Pending,
        _ => ReviewState::Commented,
    }
}

// --- REST / GraphQL response types ---

#[derive(Debug, Deserialize)]
struct RepoInfo {
    name: String,
    owner: RepoOwner,
}

#[derive(Debug, Deserialize)]
struct RepoOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RestUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RestReview {
    id: i64,
    user: RestUser,
    state: String,
    body: Option<String>,
    submitted_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct RestComment {
    id: i64,
    user: RestUser,
    body: String,
    path: Option<String>,
    line: Option<u32>,
    created_at: chrono::DateTime<chrono::Utc>,
    html_url: Option<String>,
    pull_request_review_id: Option<i64>,
    in_reply_to_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PrStateJson {
    state: String,
}

#[derive(Debug, Deserialize)]
struct GhPrView {
    number: u64,
    title: String,
    author: RestUser,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
    state: String,
    #[serde(rename = "createdAt")]
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "updatedAt")]
    updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct GqlThreadsResponse {
    data: GqlData,
}

#[derive(Debug, Deserialize)]
struct GqlData {
    repository: GqlRepository,
}

#[derive(Debug, Deserialize)]
struct GqlRepository {
    #[serde(rename = "pullRequest")]
    pull_request: GqlPullRequest,
}

#[derive(Debug, Deserialize)]
struct GqlPullRequest {
    #[serde(rename = "reviewThreads")]
    review_threads: GqlThreadConnection,
}

#[derive(Debug, Deserialize)]
struct GqlThreadConnection {
    #[serde(default)]
    nodes: Vec<GqlThread>,
}

#[derive(Debug, Deserialize)]
struct GqlThread {
    id: String,
    #[serde(rename = "isResolved")]
    is_resolved: bool,
    comments: GqlThreadComments,
}

#[derive(Debug, Deserialize)]
struct GqlThreadComments {
    #[serde(default)]
    nodes: Vec<GqlThreadComment>,
}

#[derive(Debug, Deserialize)]
struct GqlThreadComment {
    #[serde(rename = "databaseId")]
    database_id: Option<i64>,
}

/// In-process platform double: canned reviews and thread states, with every
/// mutation recorded for assertions.
#[derive(Default)]
pub struct MockPlatform {
    pub pr_info: Mutex<Option<crate::models::PrInfo>>,
    pub reviews: Mutex<Vec<Review>>,
    pub states: Mutex<HashMap<i64, bool>>,
    pub open_prs: Mutex<std::collections::HashSet<u64>>,
    pub resolved: Mutex<Vec<(u64, i64)>>,
    pub replies: Mutex<Vec<(u64, i64, String)>>,
    /// When set, `resolve_thread` fails with this message.
    pub fail_resolve: Mutex<Option<String>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reviews(&self, reviews: Vec<Review>) {
        *self.reviews.lock().expect("lock") = reviews;
    }

    pub fn set_thread_state(&self, comment_id: i64, resolved: bool) {
        self.states.lock().expect("lock").insert(comment_id, resolved);
    }

    pub fn set_pr_open(&self, pr: u64, open: bool) {
        let mut set = self.open_prs.lock().expect("lock");
        if open {
            set.insert(pr);
        } else {
            set.remove(&pr);
        }
    }

    pub fn resolved_calls(&self) -> Vec<(u64, i64)> {
        self.resolved.lock().expect("lock").clone()
    }

    pub fn reply_calls(&self) -> Vec<(u64, i64, String)> {
        self.replies.lock().expect("lock").clone()
    }
}

impl PlatformClient for MockPlatform {
    async fn fetch_pr_info(
        &self,
        _cancel: &CancellationToken,
        pr: u64,
    ) -> Result<crate::models::PrInfo> {
        Ok(self.pr_info.lock().expect("lock").clone().unwrap_or(
            crate::models::PrInfo {
                number: pr,
                title: format!("PR {pr}"),
                author: "author".to_string(),
                branch: "feature".to_string(),
                state: crate::models::PrState::Open,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
        ))
    }

    async fn fetch_reviews(&self, _cancel: &CancellationToken, _pr: u64) -> Result<Vec<Review>> {
        Ok(self.reviews.lock().expect("lock").clone())
    }

    async fn thread_states(
        &self,
        _cancel: &CancellationToken,
        _pr: u64,
    ) -> Result<HashMap<i64, bool>> {
        Ok(self.states.lock().expect("lock").clone())
    }

    async fn resolve_thread(
        &self,
        _cancel: &CancellationToken,
        pr: u64,
        comment_id: i64,
    ) -> Result<()> {
        if let Some(msg) = self.fail_resolve.lock().expect("lock").clone() {
            return Err(Error::Platform(msg));
        }
        self.resolved.lock().expect("lock").push((pr, comment_id));
        self.states.lock().expect("lock").insert(comment_id, true);
        Ok(())
    }

    async fn post_reply(
        &self,
        _cancel: &CancellationToken,
        pr: u64,
        comment_id: i64,
        body: &str,
    ) -> Result<()> {
        self.replies
            .lock()
            .expect("lock")
            .push((pr, comment_id, body.to_string()));
        Ok(())
    }

    async fn is_pr_open(&self, _cancel: &CancellationToken, pr: u64) -> Result<bool> {
        Ok(self.open_prs.lock().expect("lock").contains(&pr))
    }
}
