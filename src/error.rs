//! Custom error types for mend.
//!
//! This module provides structured error types that let the orchestrator
//! decide whether a failure ends a run, is recorded and skipped, or is
//! retried.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mend operations
#[derive(Error, Debug)]
pub enum HealError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Run-fatal Errors
    // =========================================================================
    /// The repository reference could not be acquired into a workspace
    #[error("Failed to acquire workspace for '{repo_ref}': {message}")]
    CloneFailure { repo_ref: String, message: String },

    /// The diagnostic suite could not be executed
    #[error("Diagnostic run failed: {message}")]
    DiagnosticRunFailure { message: String },

    /// The run was cancelled by an external request
    #[error("Run cancelled")]
    Cancelled,

    // =========================================================================
    // Recorded (non-fatal) Errors
    // =========================================================================
    /// A single fix could not be applied or verified
    #[error("Failed to apply fix to {file}: {reason}")]
    FixApply { file: PathBuf, reason: String },

    /// Every generation credential has been exhausted for this run
    #[error("Generative service exhausted after {credentials} credential(s)")]
    GenerativeServiceExhausted { credentials: usize },

    /// Publishing the revision branch failed
    #[error("Push of branch '{branch}' failed: {message}")]
    Push { branch: String, message: String },

    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    // =========================================================================
    // Run lifecycle Errors
    // =========================================================================
    /// A run is already active on this orchestrator
    #[error("A run is already active: {run_id}")]
    RunActive { run_id: String },

    /// Attempted a second terminal transition
    #[error("Run {run_id} already reached terminal status {status}")]
    AlreadyTerminal { run_id: String, status: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HealError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a workspace acquisition error
    pub fn clone_failure(repo_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CloneFailure {
            repo_ref: repo_ref.into(),
            message: message.into(),
        }
    }

    /// Create a diagnostic run error
    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self::DiagnosticRunFailure {
            message: message.into(),
        }
    }

    /// Create a fix application error
    pub fn fix_apply(file: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FixApply {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a push error
    pub fn push(branch: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Push {
            branch: branch.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error ends the run with status ERROR.
    ///
    /// Per-fix, per-push and generative exhaustion errors are recorded on
    /// events and never end the run.
    pub fn is_fatal_to_run(&self) -> bool {
        !matches!(
            self,
            Self::FixApply { .. }
                | Self::GenerativeServiceExhausted { .. }
                | Self::Push { .. }
                | Self::Git { .. }
        )
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Push { .. } | Self::GenerativeServiceExhausted { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this error is rejected at submission time
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RunActive { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RunActive { .. } => 3,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 2,
        }
    }
}

/// Type alias for mend results
pub type Result<T> = std::result::Result<T, HealError>;

/// Extension trait for converting foreign errors to [`HealError`]
pub trait IntoHealError<T> {
    fn into_heal_diagnostic(self) -> Result<T>;
    fn into_heal_git(self, operation: &str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoHealError<T> for std::result::Result<T, E> {
    fn into_heal_diagnostic(self) -> Result<T> {
        self.map_err(|e| HealError::diagnostic(format!("{:#}", e.into())))
    }

    fn into_heal_git(self, operation: &str) -> Result<T> {
        self.map_err(|e| HealError::git(operation, e.into().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HealError::clone_failure("https://example.invalid/repo", "not found");
        assert!(err.to_string().contains("example.invalid"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(HealError::clone_failure("x", "y").is_fatal_to_run());
        assert!(HealError::diagnostic("pytest missing").is_fatal_to_run());
        assert!(HealError::Cancelled.is_fatal_to_run());
        assert!(!HealError::fix_apply("a.py", "anchor mismatch").is_fatal_to_run());
        assert!(!HealError::push("TEAM_LEAD_AI_Fix", "denied").is_fatal_to_run());
        assert!(!HealError::GenerativeServiceExhausted { credentials: 3 }.is_fatal_to_run());
    }

    #[test]
    fn test_transient_classification() {
        assert!(HealError::push("B", "remote hung up").is_transient());
        assert!(HealError::GenerativeServiceExhausted { credentials: 2 }.is_transient());
        assert!(HealError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient());
        assert!(!HealError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_transient());
        assert!(!HealError::clone_failure("x", "y").is_transient());
    }

    #[test]
    fn test_conflict() {
        let err = HealError::RunActive {
            run_id: "abc".into(),
        };
        assert!(err.is_conflict());
        assert_eq!(err.exit_code(), 3);
        assert!(!HealError::Cancelled.is_conflict());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(HealError::config("bad").exit_code(), 7);
        assert_eq!(HealError::invalid_config("run.maxIterations", "zero").exit_code(), 7);
        assert_eq!(HealError::diagnostic("x").exit_code(), 2);
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/etc/mend/settings.json");
        let err = HealError::config_with_path("failed to parse", path.clone());
        if let HealError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_into_heal_error_trait() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "pytest: not found",
        ));

        match result.into_heal_diagnostic() {
            Err(HealError::DiagnosticRunFailure { message }) => {
                assert!(message.contains("pytest"));
            }
            other => panic!("Wrong error variant after conversion: {other:?}"),
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: HealError = io_err.into();
        assert!(matches!(err, HealError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
