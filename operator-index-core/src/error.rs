//! Release pipeline error types with clear, actionable messages

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Load,
    Resolve,
    Diff,
    Build,
    Record,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::Load => "load",
            Stage::Resolve => "resolve",
            Stage::Diff => "diff",
            Stage::Build => "build",
            Stage::Record => "record",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single bundle reference could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFailureKind {
    Network,
    Auth,
    NotFound,
    Timeout,
    DigestMismatch,
    InvalidReference,
    InvalidDigest,
}

impl LookupFailureKind {
    /// Auth failures poison every remaining lookup against the registry
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, LookupFailureKind::Auth)
    }
}

impl fmt::Display for LookupFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LookupFailureKind::Network => "network",
            LookupFailureKind::Auth => "auth",
            LookupFailureKind::NotFound => "not-found",
            LookupFailureKind::Timeout => "timeout",
            LookupFailureKind::DigestMismatch => "digest-mismatch",
            LookupFailureKind::InvalidReference => "invalid-reference",
            LookupFailureKind::InvalidDigest => "invalid-digest",
        };
        f.write_str(label)
    }
}

/// A bundle reference the registry could not answer for
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{image}:{tag} ({kind}): {reason}")]
pub struct UnresolvableReference {
    pub image: String,
    pub tag: String,
    pub kind: LookupFailureKind,
    pub reason: String,
}

/// Errors raised by the release pipeline
#[derive(Error, Debug)]
pub enum IndexError {
    /// Index file could not be read or is not valid YAML
    #[error("Failed to parse index file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// A required field is missing or invalid
    #[error("Invalid index file {path}: field '{field}' {message}")]
    Schema {
        path: PathBuf,
        field: String,
        message: String,
    },

    /// Two entries share the same (image, tag) identity
    #[error("Duplicate bundle {image}:{tag} in {path} (entries {first} and {second})")]
    DuplicateEntry {
        path: PathBuf,
        image: String,
        tag: String,
        first: usize,
        second: usize,
    },

    /// One or more bundle references could not be resolved
    #[error("{}", format_resolution_failures(.failures, .aborted))]
    Resolution {
        failures: Vec<UnresolvableReference>,
        aborted: bool,
    },

    /// Nothing changed since the previous release
    #[error("No changes since release {previous}; refusing to publish a redundant release")]
    NoOpRelease { previous: semver::Version },

    /// The computed version does not move forward
    #[error("Version {next} is not greater than previously released {previous}")]
    VersionRegression {
        previous: semver::Version,
        next: semver::Version,
    },

    /// The external build tool or container runtime failed
    #[error("{}", format_build_failure(.step, .status, .timed_out, .stdout, .stderr))]
    BuildTool {
        step: String,
        status: Option<i32>,
        timed_out: bool,
        stdout: String,
        stderr: String,
    },

    /// Another release holds the lock
    #[error("Another release is in progress (lock held at {path}).\n\nIf no release is running, remove the stale lock file and retry.")]
    ReleaseLocked { path: PathBuf },

    /// Release log is unreadable or malformed
    #[error("Release log {path}: {message}")]
    ReleaseLog { path: PathBuf, message: String },

    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem failure outside the index file itself
    #[error("I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IndexError {
    /// The pipeline stage this error surfaced in
    pub fn stage(&self) -> Stage {
        match self {
            IndexError::Parse { .. }
            | IndexError::Schema { .. }
            | IndexError::DuplicateEntry { .. } => Stage::Load,
            IndexError::Resolution { .. } => Stage::Resolve,
            IndexError::NoOpRelease { .. } | IndexError::VersionRegression { .. } => Stage::Diff,
            IndexError::BuildTool { .. } => Stage::Build,
            IndexError::ReleaseLocked { .. }
            | IndexError::ReleaseLog { .. }
            | IndexError::Io { .. } => Stage::Record,
            IndexError::Config(_) => Stage::Config,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }
}

fn format_resolution_failures(failures: &[UnresolvableReference], aborted: &bool) -> String {
    let mut message = format!(
        "{} bundle reference(s) could not be resolved:",
        failures.len()
    );
    for failure in failures {
        message.push_str("\n  - ");
        message.push_str(&failure.to_string());
    }
    if *aborted {
        message.push_str("\nRemaining lookups were cancelled after an authentication failure.");
    }
    message
}

fn format_build_failure(
    step: &str,
    status: &Option<i32>,
    timed_out: &bool,
    stdout: &str,
    stderr: &str,
) -> String {
    let mut message = if *timed_out {
        format!("'{step}' timed out")
    } else {
        match status {
            Some(code) => format!("'{step}' exited with status {code}"),
            None => format!("'{step}' failed"),
        }
    };
    if !stdout.trim().is_empty() {
        message.push_str("\nstdout:\n");
        message.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        message.push_str("\nstderr:\n");
        message.push_str(stderr.trim_end());
    }
    message
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_lists_every_failure() {
        let err = IndexError::Resolution {
            failures: vec![
                UnresolvableReference {
                    image: "quay.io/acme/a-bundle".to_string(),
                    tag: "latest".to_string(),
                    kind: LookupFailureKind::NotFound,
                    reason: "manifest unknown".to_string(),
                },
                UnresolvableReference {
                    image: "quay.io/acme/b-bundle".to_string(),
                    tag: "v1".to_string(),
                    kind: LookupFailureKind::Timeout,
                    reason: "no answer within 30s".to_string(),
                },
            ],
            aborted: false,
        };

        let text = err.to_string();
        assert!(text.starts_with("2 bundle reference(s)"));
        assert!(text.contains("quay.io/acme/a-bundle:latest (not-found)"));
        assert!(text.contains("quay.io/acme/b-bundle:v1 (timeout)"));
        assert!(!text.contains("cancelled"));
        assert_eq!(err.stage(), Stage::Resolve);
    }

    #[test]
    fn test_build_error_captures_output() {
        let err = IndexError::BuildTool {
            step: "opm index add".to_string(),
            status: Some(2),
            timed_out: false,
            stdout: "building...\n".to_string(),
            stderr: "error: bundle not found\n".to_string(),
        };

        let text = err.to_string();
        assert!(text.contains("'opm index add' exited with status 2"));
        assert!(text.contains("stderr:\nerror: bundle not found"));
        assert_eq!(err.stage().as_str(), "build");
    }

    #[test]
    fn test_only_auth_is_unrecoverable() {
        assert!(LookupFailureKind::Auth.is_unrecoverable());
        assert!(!LookupFailureKind::Network.is_unrecoverable());
        assert!(!LookupFailureKind::NotFound.is_unrecoverable());
        assert!(!LookupFailureKind::Timeout.is_unrecoverable());
    }
}
