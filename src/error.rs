//! Error types for the imsg-gateway library.
//!
//! Every failure that reaches a caller is a [`GatewayError`]. Failures that
//! come from an external CLI carry enough context to build a stable,
//! length-bounded [`ErrorBody`] for whatever transport sits in front of the
//! core.

use serde::Serialize;
use thiserror::Error;

/// Maximum number of characters of CLI diagnostic output kept in an error.
pub const MAX_DIAGNOSTIC_CHARS: usize = 500;

/// Errors that can occur in the imsg-gateway core.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The external binary could not be found on the configured path
    #[error("{tool} not found. {hint}")]
    ToolNotFound {
        /// Tool name (`imsg`, `remindctl`)
        tool: String,
        /// Install guidance
        hint: String,
    },

    /// The external binary did not finish within its allotted time
    #[error("{tool} timed out after {seconds} seconds")]
    Timeout {
        /// Tool name
        tool: String,
        /// The timeout that was exceeded
        seconds: f64,
    },

    /// The external binary exited with a non-zero status
    #[error("{tool} failed with exit code {code}")]
    ToolFailed {
        /// Tool name
        tool: String,
        /// Process exit code, `-1` when killed by a signal
        code: i32,
        /// Truncated stderr, or stdout when stderr was empty
        stderr: String,
    },

    /// A single output record could not be parsed and was skipped
    #[error("{tool} output line {line} skipped: {reason}")]
    ParseSkipped {
        /// Tool name
        tool: String,
        /// 1-based line number in the output
        line: usize,
        /// Parser message
        reason: String,
    },

    /// Caller-supplied input was rejected before any subprocess call
    #[error("Validation error: {0}")]
    Validation(String),

    /// A single-document CLI response had an unexpected shape
    #[error("Unexpected {tool} output: {detail}")]
    UnexpectedOutput {
        /// Tool name
        tool: String,
        /// What was wrong with the output
        detail: String,
    },

    /// A recipient name matched more than one cached contact
    #[error("Recipient '{recipient}' is ambiguous: {}", .candidates.join(", "))]
    AmbiguousRecipient {
        /// The name that was looked up
        recipient: String,
        /// Display names of the matching contacts
        candidates: Vec<String>,
    },

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// General error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Result with GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Stable classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Binary missing
    ToolNotFound,
    /// Deadline exceeded
    Timeout,
    /// Non-zero exit
    ToolFailed,
    /// One malformed record
    ParseSkipped,
    /// Bad caller input
    Validation,
    /// Wrong output shape
    UnexpectedOutput,
    /// Name matched several contacts
    AmbiguousRecipient,
    /// Anything local to this process
    Internal,
}

/// The user-visible error shape handed to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Human readable message
    pub error: String,
    /// Error classification
    pub kind: ErrorKind,
    /// CLI exit code, `-1` when not applicable
    pub code: i32,
    /// Length-bounded diagnostic excerpt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Remediation hint for well-known failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl GatewayError {
    /// Build a `ToolFailed` error, bounding the diagnostic text.
    pub fn tool_failed(tool: &str, code: i32, stderr: &str, stdout: &str) -> Self {
        let diagnostic = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
        Self::ToolFailed {
            tool: tool.to_string(),
            code,
            stderr: truncate_chars(diagnostic, MAX_DIAGNOSTIC_CHARS),
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ToolFailed { .. } => ErrorKind::ToolFailed,
            Self::ParseSkipped { .. } => ErrorKind::ParseSkipped,
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnexpectedOutput { .. } => ErrorKind::UnexpectedOutput,
            Self::AmbiguousRecipient { .. } => ErrorKind::AmbiguousRecipient,
            Self::Io(_) | Self::Serialization(_) | Self::Config(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ToolFailed { .. })
    }

    /// Convert to the stable error shape.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let (code, stderr) = match self {
            Self::ToolFailed { code, stderr, .. } => {
                (*code, (!stderr.is_empty()).then(|| truncate_chars(stderr, MAX_DIAGNOSTIC_CHARS)))
            },
            _ => (-1, None),
        };
        let hint = stderr.as_deref().and_then(permission_hint);

        ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            code,
            stderr,
            hint,
        }
    }
}

fn permission_hint(diagnostic: &str) -> Option<String> {
    let lower = diagnostic.to_lowercase();
    if lower.contains("full disk access") || lower.contains("permission") {
        Some(
            "imsg requires Full Disk Access. Go to System Settings > Privacy & Security > \
             Full Disk Access and enable your terminal."
                .to_string(),
        )
    } else if lower.contains("automation") {
        Some(
            "imsg requires Automation permission to control Messages.app. \
             Grant permission when prompted or check System Settings."
                .to_string(),
        )
    } else {
        None
    }
}

/// Truncate to at most `max` characters without splitting a code point.
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
