//! Configuration for mend.
//!
//! Settings are read from the first source that exists:
//!
//! 1. An explicit `--config <path>` (JSON, or TOML when the extension is `.toml`)
//! 2. `.mend/settings.json` in the current project
//! 3. `{config_dir}/mend/settings.json` for the user
//! 4. Built-in defaults
//!
//! Every field is optional in the file; missing fields take their defaults.
//!
//! ```json
//! {
//!   "run": { "maxIterations": 5, "timeBudgetSecs": 600 },
//!   "diagnostics": { "checkCommand": "pytest -v" },
//!   "generative": { "model": "openai/gpt-4o-mini" },
//!   "publish": { "commitPrefix": "[AI-AGENT]" }
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diagnostics::classify::{DEFAULT_ASSERTION_VOCABULARY, DEFAULT_TYPE_VOCABULARY};
use crate::diagnostics::{BugCategory, DEFAULT_TEST_PATTERNS};
use crate::error::{HealError, Result};

/// Project-level settings file, relative to the project directory.
pub const PROJECT_SETTINGS: &str = ".mend/settings.json";

// ============================================================================
// Sections
// ============================================================================

/// Iteration limits and workspace placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    pub max_iterations: u32,
    pub time_budget_secs: u64,
    /// Base directory for acquired workspaces. Defaults to a temp directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            time_budget_secs: 600,
            workspace_dir: None,
        }
    }
}

impl RunConfig {
    #[must_use]
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    /// Configured workspace base directory, or `<tmp>/mend-workspaces`.
    #[must_use]
    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("mend-workspaces"))
    }
}

/// Check command and static analysis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagnosticsConfig {
    pub check_command: String,
    pub install_dependencies: bool,
    pub python: String,
    pub enable_lint: bool,
    pub enable_import_check: bool,
    pub test_file_patterns: Vec<String>,
    pub type_error_vocabulary: Vec<String>,
    pub assertion_vocabulary: Vec<String>,
    pub ambiguous_category: BugCategory,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            check_command: "pytest -v".to_string(),
            install_dependencies: true,
            python: "python3".to_string(),
            enable_lint: true,
            enable_import_check: true,
            test_file_patterns: owned(DEFAULT_TEST_PATTERNS),
            type_error_vocabulary: owned(DEFAULT_TYPE_VOCABULARY),
            assertion_vocabulary: owned(DEFAULT_ASSERTION_VOCABULARY),
            ambiguous_category: BugCategory::Logic,
        }
    }
}

/// Generation service endpoint and resilience settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerativeConfig {
    pub api_base: String,
    pub model: String,
    /// Environment variables holding credentials, in rotation order.
    pub credential_envs: Vec<String>,
    pub max_attempts_per_credential: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_secs: u64,
    pub max_prompt_chars: usize,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://openrouter.ai/api/v1".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            credential_envs: vec![
                "OPENROUTER_API_KEY".to_string(),
                "OPENROUTER_API_KEY_2".to_string(),
                "OPENROUTER_API_KEY_3".to_string(),
            ],
            max_attempts_per_credential: 3,
            backoff_base_ms: 2000,
            backoff_max_ms: 30_000,
            request_timeout_secs: 120,
            max_prompt_chars: 24_000,
        }
    }
}

/// Branch and push settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishConfig {
    pub commit_prefix: String,
    pub branch_suffix: String,
    pub remote: String,
    pub push: bool,
    /// Environment variable holding a token for https pushes.
    pub token_env: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            commit_prefix: "[AI-AGENT]".to_string(),
            branch_suffix: "AI_Fix".to_string(),
            remote: "origin".to_string(),
            push: true,
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

// ============================================================================
// Root Config
// ============================================================================

/// Complete mend configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealConfig {
    pub run: RunConfig,
    pub diagnostics: DiagnosticsConfig,
    pub generative: GenerativeConfig,
    pub publish: PublishConfig,
}

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    Explicit(PathBuf),
    Project(PathBuf),
    User(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(p) => write!(f, "explicit ({})", p.display()),
            Self::Project(p) => write!(f, "project ({})", p.display()),
            Self::User(p) => write!(f, "user ({})", p.display()),
            Self::Defaults => write!(f, "built-in defaults"),
        }
    }
}

impl HealConfig {
    /// User-level settings path.
    #[must_use]
    pub fn user_settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mend").join("settings.json"))
    }

    /// Load configuration using the standard search order.
    ///
    /// # Errors
    ///
    /// Returns [`HealError::Config`] if the chosen file cannot be read or
    /// parsed, or an explicit path does not exist.
    pub fn load(explicit: Option<&Path>, project_dir: &Path) -> Result<(Self, ConfigOrigin)> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(HealError::config_with_path(
                    "configuration file not found",
                    path.to_path_buf(),
                ));
            }
            return Ok((Self::from_file(path)?, ConfigOrigin::Explicit(path.to_path_buf())));
        }

        let project = project_dir.join(PROJECT_SETTINGS);
        if project.is_file() {
            return Ok((Self::from_file(&project)?, ConfigOrigin::Project(project)));
        }

        if let Some(user) = Self::user_settings_path().filter(|p| p.is_file()) {
            return Ok((Self::from_file(&user)?, ConfigOrigin::User(user)));
        }

        debug!("No settings file found, using defaults");
        Ok((Self::default(), ConfigOrigin::Defaults))
    }

    /// Parse one settings file (TOML by extension, JSON otherwise).
    ///
    /// # Errors
    ///
    /// Returns [`HealError::Config`] on read or parse failure.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HealError::config_with_path(e.to_string(), path.to_path_buf()))?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

        let parsed = if is_toml {
            toml::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|msg| HealError::config_with_path(msg, path.to_path_buf()))
    }

    /// All validation problems, as `(field, reason)` pairs.
    #[must_use]
    pub fn problems(&self) -> Vec<(&'static str, String)> {
        let mut problems = Vec::new();
        if self.run.max_iterations == 0 {
            problems.push(("run.maxIterations", "must be at least 1".to_string()));
        }
        if self.run.time_budget_secs == 0 {
            problems.push(("run.timeBudgetSecs", "must be greater than zero".to_string()));
        }
        if self.diagnostics.check_command.trim().is_empty() {
            problems.push(("diagnostics.checkCommand", "must not be empty".to_string()));
        }
        if self.generative.max_attempts_per_credential == 0 {
            problems.push((
                "generative.maxAttemptsPerCredential",
                "must be at least 1".to_string(),
            ));
        }
        if self.generative.backoff_base_ms > self.generative.backoff_max_ms {
            problems.push((
                "generative.backoffBaseMs",
                format!(
                    "{} exceeds backoffMaxMs ({})",
                    self.generative.backoff_base_ms, self.generative.backoff_max_ms
                ),
            ));
        }
        problems
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HealError::InvalidConfig`] for the first problem found.
    pub fn validate(&self) -> Result<()> {
        match self.problems().into_iter().next() {
            Some((field, reason)) => Err(HealError::invalid_config(field, reason)),
            None => Ok(()),
        }
    }
}
