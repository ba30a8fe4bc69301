use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::Comment;

const DEFAULT_TASK_GENERATION: &str = include_str!("default_prompts/task-generation.md");

fn default_template(name: &str) -> Option<&'static str> {
    match name {
        "task-generation" => Some(DEFAULT_TASK_GENERATION),
        _ => None,
    }
}

/// Prompt template engine with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<String>,
    user_language: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>, user_language: Option<String>) -> Self {
        Self {
            override_dir,
            user_language,
        }
    }

    /// Load a prompt template by name. A user override in `override_dir`
    /// takes precedence over the embedded default.
    pub fn load_template(&self, name: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(format!("{name}.md"));
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                })?;
                // No pre-render validation: upon's render errors include
                // line/column and the offending snippet.
                return Ok(content);
            }
        }

        default_template(name)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Prompt(format!("unknown prompt template: {name}")))
    }

    /// Render the task-generation prompt for one review comment.
    pub fn render_task_generation(&self, comment: &Comment) -> Result<String> {
        let mut vars = HashMap::new();
        vars.insert(
            "language_instruction".to_string(),
            self.language_instruction(),
        );
        vars.insert("file".to_string(), comment.file.clone());
        vars.insert("line".to_string(), comment.line.to_string());
        vars.insert("author".to_string(), comment.author.clone());
        vars.insert("comment".to_string(), comment_with_replies(comment));

        let template = self.load_template("task-generation")?;
        render_template(&template, &vars)
    }

    fn language_instruction(&self) -> String {
        match self.user_language.as_deref() {
            Some(lang) if !lang.is_empty() && !lang.eq_ignore_ascii_case("english") => {
                format!("Write every task description in {lang}.")
            }
            _ => String::new(),
        }
    }
}

/// Flatten a comment and its reply thread into the prompt body.
fn comment_with_replies(comment: &Comment) -> String {
    let mut out = comment.body.clone();
    for reply in &comment.replies {
        out.push_str(&format!("\n\n[reply by {}]\n{}", reply.author, reply.body));
    }
    out
}

/// Render a template string using the `upon` template engine.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}
