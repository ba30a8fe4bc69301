use std::path::PathBuf;

/// Error kinds recorded for entries in the failed-comment queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    SizeLimit,
    Validation,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::SizeLimit => write!(f, "size-limit"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("prompt size {size} bytes exceeds maximum limit {limit} bytes")]
    SizeLimit { size: usize, limit: usize },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("corrupt file {path}: {message}")]
    CorruptFile { path: PathBuf, message: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Message fragments that identify a size-limit rejection from the LLM.
/// Kept in one place so classification stays portable across model CLIs.
const SIZE_LIMIT_PATTERNS: &[&str] = &[
    "exceeds maximum limit",
    "prompt is too long",
    "context length exceeded",
    "maximum context length",
];

impl Error {
    /// True when this error means the prompt was too large and retrying
    /// with the same prompt cannot succeed.
    pub fn is_size_limit(&self) -> bool {
        match self {
            Error::SizeLimit { .. } => true,
            Error::Llm(msg) | Error::Process(msg) => {
                let lower = msg.to_lowercase();
                SIZE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
            }
            _ => false,
        }
    }

    /// Classify an error for the failed-comment queue.
    pub fn failure_kind(&self) -> FailureKind {
        if self.is_size_limit() {
            FailureKind::SizeLimit
        } else if matches!(self, Error::Validation(_)) {
            FailureKind::Validation
        } else {
            FailureKind::Other
        }
    }

    /// Build an io error carrying the offending path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a corrupt-file error from a JSON parse failure.
    pub fn corrupt(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Error::CorruptFile {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_limit_variant_classified() {
        let err = Error::SizeLimit {
            size: 40_000,
            limit: 30_000,
        };
        assert!(err.is_size_limit());
        assert_eq!(err.failure_kind(), FailureKind::SizeLimit);
    }

    #[test]
    fn size_limit_detected_in_llm_message() {
        let err = Error::Llm("Prompt size 40000 exceeds maximum limit 30000".to_string());
        assert!(err.is_size_limit());
        let err = Error::Llm("prompt is too long: 210000 tokens".to_string());
        assert!(err.is_size_limit());
    }

    #[test]
    fn unrelated_llm_error_is_other() {
        let err = Error::Llm("connection reset by peer".to_string());
        assert!(!err.is_size_limit());
        assert_eq!(err.failure_kind(), FailureKind::Other);
    }

    #[test]
    fn validation_classified() {
        let err = Error::Validation("expected a JSON array".to_string());
        assert_eq!(err.failure_kind(), FailureKind::Validation);
    }

    #[test]
    fn transient_is_other() {
        let err = Error::Transient("timeout".to_string());
        assert_eq!(err.failure_kind(), FailureKind::Other);
    }

    #[test]
    fn failure_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&FailureKind::SizeLimit).unwrap(),
            "\"size-limit\""
        );
        assert_eq!(
            serde_json::to_string(&FailureKind::Validation).unwrap(),
            "\"validation\""
        );
    }

    #[test]
    fn corrupt_file_includes_path() {
        let err = Error::corrupt("/tmp/store/PR-1/tasks.json", "unexpected EOF");
        assert!(err.to_string().contains("PR-1/tasks.json"));
        assert!(err.to_string().contains("unexpected EOF"));
    }
}
