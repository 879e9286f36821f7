//! Canonical job status and the single normalization point for the
//! status codes found on the wire.
//!
//! The scheduler writes single-letter codes (`r`, `s`, `f`, ...) while
//! some feeds send full words (`Running`, `failed`, ...). Everything is
//! funnelled through [`JobStatus::normalize`] on ingestion.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a scheduler job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    Disabled,
    InternalError,
    Aborted,
    /// A job this one depends on did not succeed.
    DependencyFailure,
    /// Any code not recognised above, kept verbatim.
    Unknown(String),
}

impl JobStatus {
    /// Map a raw status code or word to the canonical enum.
    ///
    /// Matching is case-insensitive and ignores surrounding whitespace.
    pub fn normalize(code: &str) -> Self {
        let trimmed = code.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "r" | "running" => Self::Running,
            "s" | "success" | "succeeded" => Self::Success,
            "f" | "failed" | "failure" => Self::Failed,
            "d" | "disabled" => Self::Disabled,
            "i" | "internal error" => Self::InternalError,
            "a" | "aborted" => Self::Aborted,
            "x" | "dependency failure" => Self::DependencyFailure,
            _ => Self::Unknown(trimmed.to_string()),
        }
    }

    /// Single-letter code used by the scheduler tables.
    pub fn code(&self) -> &str {
        match self {
            Self::Running => "r",
            Self::Success => "s",
            Self::Failed => "f",
            Self::Disabled => "d",
            Self::InternalError => "i",
            Self::Aborted => "a",
            Self::DependencyFailure => "x",
            Self::Unknown(raw) => raw,
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &str {
        match self {
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Disabled => "Disabled",
            Self::InternalError => "Internal error",
            Self::Aborted => "Aborted",
            Self::DependencyFailure => "Dependency failure",
            Self::Unknown(raw) => raw,
        }
    }

    /// Terminal states that count as a failed run.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::InternalError | Self::Aborted | Self::DependencyFailure
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<String> for JobStatus {
    fn from(value: String) -> Self {
        Self::normalize(&value)
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        value.code().to_string()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
