use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_capture};

/// Output format requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

impl OutputFormat {
    fn as_arg(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Text => "text",
        }
    }
}

/// Uniform contract over LLM backends. Real and mock implementations
/// coexist; the pipeline only interprets size-limit errors specially.
pub trait LlmClient {
    fn execute(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        format: OutputFormat,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// Optional result envelope emitted by model CLIs.
#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    #[serde(rename = "type")]
    _type: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
}

/// Unwrap the `{type, subtype, is_error, result}` envelope when present.
/// Raw output that is not an envelope passes through unchanged.
pub fn unwrap_envelope(raw: &str) -> Result<String> {
    let stripped = strip_markdown_fences(raw);
    match serde_json::from_str::<ResultEnvelope>(stripped) {
        Ok(envelope) => {
            if envelope.is_error {
                let detail = envelope
                    .result
                    .or(envelope.subtype)
                    .unwrap_or_else(|| "unspecified model error".to_string());
                return Err(Error::Llm(detail));
            }
            match envelope.result {
                Some(result) => Ok(result),
                None => Ok(stripped.to_string()),
            }
        }
        Err(_) => Ok(stripped.to_string()),
    }
}

/// Strip a single surrounding markdown code fence, if any.
pub fn strip_markdown_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "text", ...) on the opening fence line
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => return trimmed,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}

/// LLM backend that shells out to a model CLI located via `PATH` or an
/// absolute path. The prompt travels on stdin; stdout carries the reply.
pub struct CommandLlmClient {
    binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl CommandLlmClient {
    pub fn new(binary: String, model: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary,
            model,
            timeout,
        }
    }

    /// Build the command and arguments for one invocation.
    pub fn build_command(&self, format: OutputFormat) -> (String, Vec<String>) {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            format.as_arg().to_string(),
        ];
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        (self.binary.clone(), args)
    }
}

impl LlmClient for CommandLlmClient {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        format: OutputFormat,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (command, args) = self.build_command(format);
        let config = ProcessConfig {
            command,
            args,
            working_dir: None,
            timeout: self.timeout,
            log_prefix: "llm".to_string(),
            env: vec![],
            stdin_data: Some(prompt.to_string()),
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = spawn_and_capture(config) => result?,
        };

        if let Some(sig) = output.signal {
            return Err(Error::Llm(format!("model killed by signal {sig}")));
        }
        if output.exit_code != 0 {
            let detail = if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            return Err(Error::Llm(format!(
                "model exited with code {}: {detail}",
                output.exit_code
            )));
        }

        unwrap_envelope(&output.stdout)
    }
}

/// Scripted in-process backend used by tests and dry runs: pops canned
/// responses in order and records every prompt it sees.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<Vec<Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// All prompts executed so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }
}

impl LlmClient for ScriptedLlm {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        _format: OutputFormat,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            Err(Error::Llm("no scripted response left".to_string()))
        } else {
            responses.remove(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_defaults() {
        let client = CommandLlmClient::new("claude".to_string(), None, None);
        let (cmd, args) = client.build_command(OutputFormat::Json);
        assert_eq!(cmd, "claude");
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"json".to_string()));
        assert!(!args.contains(&"--model".to_string()));
    }

    #[test]
    fn build_command_with_model() {
        let client =
            CommandLlmClient::new("claude".to_string(), Some("sonnet".to_string()), None);
        let (_cmd, args) = client.build_command(OutputFormat::Text);
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"sonnet".to_string()));
        assert!(args.contains(&"text".to_string()));
    }

    #[test]
    fn build_command_custom_binary_path() {
        let client = CommandLlmClient::new("/opt/bin/model".to_string(), None, None);
        let (cmd, _args) = client.build_command(OutputFormat::Json);
        assert_eq!(cmd, "/opt/bin/model");
    }

    #[test]
    fn envelope_unwrapped() {
        let raw = r#"{"type":"result","subtype":"success","is_error":false,"result":"[{\"description\":\"d\",\"priority\":\"low\"}]"}"#;
        let out = unwrap_envelope(raw).unwrap();
        assert_eq!(out, r#"[{"description":"d","priority":"low"}]"#);
    }

    #[test]
    fn envelope_error_surfaces() {
        let raw = r#"{"type":"result","subtype":"error","is_error":true,"result":"Prompt size 40000 exceeds maximum limit 30000"}"#;
        let err = unwrap_envelope(raw).unwrap_err();
        assert!(err.is_size_limit());
    }

    #[test]
    fn non_envelope_passes_through() {
        let raw = r#"[{"description":"d","priority":"low"}]"#;
        assert_eq!(unwrap_envelope(raw).unwrap(), raw);
        assert_eq!(unwrap_envelope("plain text").unwrap(), "plain text");
    }

    #[test]
    fn fences_stripped() {
        let fenced = "```json\n[1, 2]\n```";
        assert_eq!(strip_markdown_fences(fenced), "[1, 2]");
        let plain = "[1, 2]";
        assert_eq!(strip_markdown_fences(plain), "[1, 2]");
        let unterminated = "```json\n[1, 2]";
        assert_eq!(strip_markdown_fences(unterminated), unterminated.trim());
    }

    #[test]
    fn fenced_envelope_unwrapped() {
        let raw = "```json\n{\"type\":\"result\",\"is_error\":false,\"result\":\"[]\"}\n```";
        assert_eq!(unwrap_envelope(raw).unwrap(), "[]");
    }

    #[tokio::test]
    async fn scripted_llm_pops_in_order() {
        let llm = ScriptedLlm::new(vec![Ok("first".to_string()), Ok("second".to_string())]);
        let cancel = CancellationToken::new();
        assert_eq!(
            llm.execute(&cancel, "p1", OutputFormat::Json).await.unwrap(),
            "first"
        );
        assert_eq!(
            llm.execute(&cancel, "p2", OutputFormat::Json).await.unwrap(),
            "second"
        );
        assert_eq!(llm.prompts(), vec!["p1", "p2"]);
        assert!(llm.execute(&cancel, "p3", OutputFormat::Json).await.is_err());
    }

    #[tokio::test]
    async fn scripted_llm_respects_cancellation() {
        let llm = ScriptedLlm::new(vec![Ok("never".to_string())]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = llm.execute(&cancel, "p", OutputFormat::Json).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn command_client_cancelled_before_start() {
        let client = CommandLlmClient::new("sleep".to_string(), None, None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .execute(&cancel, "10", OutputFormat::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
