use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::model::BugId;

/// Result alias used across the retrieval core.
pub type Result<T, E = RetrievalError> = std::result::Result<T, E>;

/// Inference stage that was running when a bug lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    TrainInference,
    TestInference,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrainInference => "train-inference",
            Self::TestInference => "test-inference",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a duplicate chain could not be resolved to a root bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainBreak {
    /// The chain revisited `at`.
    Cycle { at: BugId },
    /// `parent` is referenced but has no row in the bucket table.
    Dangling { parent: BugId },
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle { at } => write!(f, "cycle through bug {at}"),
            Self::Dangling { parent } => write!(f, "parent bug {parent} has no row"),
        }
    }
}

/// Errors raised by loaders, inference and indexing.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Malformed pair file line, bucket row, or data file.
    #[error("parse error at {}: {message}", location(.source_name, .line.as_ref()))]
    Parse {
        source_name: String,
        line: Option<usize>,
        message: String,
    },

    /// A bug referenced by a pair or bucket edge is not in the store.
    #[error("bug {bug_id} not found in bug store (stage: {stage})")]
    BugNotFound { bug_id: BugId, stage: Stage },

    /// A duplicate chain never reached a root.
    #[error("cannot resolve bucket for bug {bug_id}: {reason} (chain: {})", format_chain(.chain))]
    UnresolvedBucketChain {
        bug_id: BugId,
        chain: Vec<BugId>,
        reason: ChainBreak,
    },

    /// No model file exists at the resolved path.
    #[error("embedding model not found at {}", .0.display())]
    ModelNotFound(PathBuf),

    /// The embedding model could not be loaded or produced bad output.
    #[error("embedding model error: {0}")]
    Model(String),

    /// The nearest-neighbor index rejected its input.
    #[error("nearest-neighbor index error: {0}")]
    Index(String),

    /// Configuration could not be read or failed validation.
    #[error("config error: {0}")]
    Config(String),

    /// I/O failure on a named path.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RetrievalError {
    #[must_use]
    pub fn parse(
        source_name: impl Into<String>,
        line: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Parse { .. } => ErrorCode::ParseFailed,
            Self::BugNotFound { .. } => ErrorCode::BugNotFound,
            Self::UnresolvedBucketChain { .. } => ErrorCode::UnresolvedBucketChain,
            Self::ModelNotFound(_) => ErrorCode::ModelNotFound,
            Self::Model(_) => ErrorCode::ModelLoadFailed,
            Self::Index(_) => ErrorCode::IndexRejected,
            Self::Config(_) => ErrorCode::ConfigParseError,
            Self::Io { .. } => ErrorCode::IoFailed,
        }
    }
}

fn location(source_name: &str, line: Option<&usize>) -> String {
    match line {
        Some(line) => format!("{source_name}:{line}"),
        None => source_name.to_string(),
    }
}

fn format_chain(chain: &[BugId]) -> String {
    chain
        .iter()
        .map(BugId::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Machine-readable error codes for scripted runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ModelNotFound,
    ModelLoadFailed,
    BugNotFound,
    UnresolvedBucketChain,
    ParseFailed,
    IndexRejected,
    IoFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1002",
            Self::ModelNotFound => "E1003",
            Self::ModelLoadFailed => "E1004",
            Self::BugNotFound => "E2001",
            Self::UnresolvedBucketChain => "E2003",
            Self::ParseFailed => "E2005",
            Self::IndexRejected => "E6001",
            Self::IoFailed => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::ModelNotFound => "Embedding model not found",
            Self::ModelLoadFailed => "Embedding model load failed",
            Self::BugNotFound => "Bug not found",
            Self::UnresolvedBucketChain => "Duplicate chain does not reach a root",
            Self::ParseFailed => "Malformed input file",
            Self::IndexRejected => "Nearest-neighbor index rejected input",
            Self::IoFailed => "File read or write failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in dupfind.toml and retry."),
            Self::ModelNotFound => {
                Some("Place <name>.safetensors under the models directory or set [model].name.")
            }
            Self::ModelLoadFailed => Some("Verify the model file and its tensor names."),
            Self::BugNotFound => Some("Regenerate bugs.jsonl so it covers every paired bug."),
            Self::UnresolvedBucketChain => {
                Some("Fix the dup_id column so every chain ends at a `[]` row.")
            }
            Self::ParseFailed => None,
            Self::IndexRejected => Some("Check that every vector has the model's dimension."),
            Self::IoFailed => Some("Check paths and file permissions."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
