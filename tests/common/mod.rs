#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use reviewtask::cli::Cli;
use reviewtask::config::Config;
use reviewtask::error::Result;
use reviewtask::generator::{GeneratorSettings, TaskGenerator};
use reviewtask::llm::ScriptedLlm;
use reviewtask::models::{Comment, Review, ReviewState};
use reviewtask::orchestrator::Orchestrator;
use reviewtask::platform::MockPlatform;
use reviewtask::prompts::PromptEngine;
use reviewtask::store::{DEFAULT_ROOT, Store};

/// A fully wired orchestrator over a temp store, a scripted model, and a
/// mock platform, plus handles to poke at each.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<Store>,
    pub llm: Arc<ScriptedLlm>,
    pub orchestrator: Orchestrator<ScriptedLlm, MockPlatform>,
}

/// Build a harness. `configure` may adjust the resolved config before the
/// orchestrator is constructed.
pub fn harness_with(
    responses: Vec<Result<String>>,
    platform: MockPlatform,
    configure: impl FnOnce(&mut Config),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join(DEFAULT_ROOT);
    let store = Arc::new(Store::new(&root));

    let cli = <Cli as clap::Parser>::parse_from([
        "reviewtask",
        "--store-dir",
        root.to_str().unwrap(),
        "status",
    ]);
    let mut config = Config::load(&cli).unwrap();
    config.worker_count = 1;
    configure(&mut config);

    let llm = Arc::new(ScriptedLlm::new(responses));
    let generator = TaskGenerator::new(
        Arc::clone(&llm),
        Arc::new(PromptEngine::new(None, config.user_language.clone())),
        GeneratorSettings::from(&config),
    );
    let orchestrator = Orchestrator::new(Arc::clone(&store), generator, platform, config);

    Harness {
        dir,
        store,
        llm,
        orchestrator,
    }
}

pub fn harness(responses: Vec<Result<String>>, platform: MockPlatform) -> Harness {
    harness_with(responses, platform, |_| {})
}

pub fn make_comment(id: i64, body: &str) -> Comment {
    Comment {
        id,
        author: "reviewer".to_string(),
        body: body.to_string(),
        file: "src/lib.rs".to_string(),
        line: 12,
        created_at: Utc::now(),
        url: format!("https://example.com/pull/1#discussion_r{id}"),
        replies: Vec::new(),
        tasks_generated: false,
        all_tasks_completed: false,
        github_thread_resolved: false,
        last_checked_at: None,
    }
}

pub fn make_review(id: i64, comments: Vec<Comment>) -> Review {
    Review {
        id,
        reviewer: "reviewer".to_string(),
        state: ReviewState::ChangesRequested,
        body: String::new(),
        submitted_at: Utc::now(),
        comments,
    }
}

/// JSON array of `{description, priority}` drafts, as the model returns.
pub fn drafts_json(items: &[(&str, &str)]) -> String {
    serde_json::to_string(
        &items
            .iter()
            .map(|(d, p)| serde_json::json!({"description": d, "priority": p}))
            .collect::<Vec<_>>(),
    )
    .unwrap()
}
