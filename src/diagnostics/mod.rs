//! Diagnostic collection and classification.
//!
//! The [`DiagnosticRunner`] executes a set of independent [`DiagnosticPass`]es
//! against a workspace. Each pass reports [`RawFinding`]s; the
//! [`Classifier`] turns findings into categorised [`Diagnostic`]s, which are
//! then deduplicated by `(file, line, category)` and sorted so that scanning
//! an unmodified workspace twice yields the identical list.
//!
//! # Passes
//!
//! - [`parse::ParsePass`] - full-source parse check
//! - [`imports::ImportPass`] - unresolved module detection
//! - [`lint::LintPass`] - unused import and whitespace lint rules
//! - [`check::CheckPass`] - the project's own check command

pub mod check;
pub mod classify;
pub mod imports;
pub mod lint;
pub mod parse;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DiagnosticsConfig;
use crate::error::{HealError, IntoHealError, Result};
use crate::workspace::Workspace;

pub use check::{CheckOutput, CheckPass, CheckSuite, ProcessCheckSuite};
pub use classify::{ClassificationPolicy, Classifier};
pub use imports::{ImportPass, ModuleResolver, PythonModuleResolver};
pub use lint::{LintPass, LintRules};
pub use parse::ParsePass;

// ============================================================================
// Bug Categories
// ============================================================================

/// The closed set of bug categories a diagnostic can fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BugCategory {
    Syntax,
    Import,
    Linting,
    Indentation,
    Logic,
    TypeError,
}

impl BugCategory {
    /// All categories in classification priority order.
    pub const ALL: [BugCategory; 6] = [
        Self::Syntax,
        Self::Import,
        Self::Linting,
        Self::Indentation,
        Self::Logic,
        Self::TypeError,
    ];

    /// Categories handled by the deterministic repair engine.
    #[must_use]
    pub fn is_deterministic(self) -> bool {
        matches!(
            self,
            Self::Syntax | Self::Import | Self::Linting | Self::Indentation
        )
    }

    /// Categories routed to the generative repair client.
    #[must_use]
    pub fn is_generative(self) -> bool {
        matches!(self, Self::Logic | Self::TypeError)
    }

    /// Upper-case wire name, e.g. `TYPE_ERROR`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "SYNTAX",
            Self::Import => "IMPORT",
            Self::Linting => "LINTING",
            Self::Indentation => "INDENTATION",
            Self::Logic => "LOGIC",
            Self::TypeError => "TYPE_ERROR",
        }
    }
}

impl fmt::Display for BugCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BugCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown bug category: {s}"))
    }
}

// ============================================================================
// Findings and Diagnostics
// ============================================================================

/// What kind of pass produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// The file does not parse.
    ParseFailure,
    /// An import names a module that cannot be resolved.
    UnresolvedModule,
    /// A lint rule flagged an unused import.
    UnusedImport,
    /// A lint rule flagged whitespace or indentation.
    Whitespace,
    /// The project's check command reported a failure.
    CheckFailure,
}

/// Unclassified output of a single diagnostic pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFinding {
    pub kind: FindingKind,
    /// Workspace-relative path. Empty for workspace-level failures.
    pub file: PathBuf,
    pub line: Option<u32>,
    pub message: String,
    /// Tool-provided context (e.g. a traceback). Filled from source if empty.
    pub context: String,
    /// Rule or error code, when the tool reports one.
    pub code: Option<String>,
}

impl RawFinding {
    /// Create a new finding.
    pub fn new(kind: FindingKind, file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            file: file.into(),
            line: None,
            message: message.into(),
            context: String::new(),
            code: None,
        }
    }

    /// Add a line number.
    #[must_use]
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Add raw context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Add a rule code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A single detected failing check, classified into a bug category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: PathBuf,
    pub line: Option<u32>,
    pub category: BugCategory,
    pub message: String,
    /// Raw source context around the reported location.
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Diagnostic {
    /// Dedup key.
    #[must_use]
    pub fn key(&self) -> (PathBuf, Option<u32>, BugCategory) {
        (self.file.clone(), self.line, self.category)
    }

    /// `file:line` for log output.
    #[must_use]
    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.file.display(), line),
            None => self.file.display().to_string(),
        }
    }
}

/// Count diagnostics per category, in category order.
#[must_use]
pub fn counts_by_category(diagnostics: &[Diagnostic]) -> BTreeMap<BugCategory, usize> {
    let mut counts = BTreeMap::new();
    for d in diagnostics {
        *counts.entry(d.category).or_insert(0) += 1;
    }
    counts
}

// ============================================================================
// Pass Trait
// ============================================================================

/// One independent analysis over a workspace.
///
/// Passes return `Err` only when they cannot run at all; the runner treats
/// that as a [`HealError::DiagnosticRunFailure`]. A missing optional tool
/// should be logged and reported as an empty result instead.
pub trait DiagnosticPass: Send + Sync {
    /// Display name of this pass.
    fn name(&self) -> &str;

    /// Run the pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass fails to execute.
    fn run(&self, workspace: &Workspace) -> anyhow::Result<Vec<RawFinding>>;

    /// External tool this pass depends on, if any.
    fn required_tool(&self) -> Option<&str> {
        None
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Runs all configured passes and produces the classified diagnostic list.
pub struct DiagnosticRunner {
    passes: Vec<Box<dyn DiagnosticPass>>,
    classifier: Classifier,
}

impl DiagnosticRunner {
    /// Create a runner with explicit passes.
    #[must_use]
    pub fn new(passes: Vec<Box<dyn DiagnosticPass>>, classifier: Classifier) -> Self {
        Self { passes, classifier }
    }

    /// Build the standard Python runner from configuration.
    #[must_use]
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        let tests = TestFileFilter::new(&config.test_file_patterns);
        let mut passes: Vec<Box<dyn DiagnosticPass>> = vec![Box::new(ParsePass::new())];
        if config.enable_import_check {
            passes.push(Box::new(ImportPass::new(
                Box::new(PythonModuleResolver::new(&config.python)),
                tests.clone(),
            )));
        }
        if config.enable_lint {
            passes.push(Box::new(LintPass::new(LintRules::UnusedImports, tests.clone())));
            passes.push(Box::new(LintPass::new(LintRules::Indentation, tests)));
        }
        passes.push(Box::new(CheckPass::new(Box::new(
            ProcessCheckSuite::new(&config.check_command)
                .with_dependency_install(config.install_dependencies, &config.python),
        ))));

        Self::new(passes, Classifier::new(ClassificationPolicy::from_config(config)))
    }

    /// Names of the configured passes, in execution order.
    #[must_use]
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// The classifier in use.
    #[must_use]
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Execute every pass and return the raw findings, in pass order.
    ///
    /// # Errors
    ///
    /// Returns [`HealError::DiagnosticRunFailure`] if any pass cannot run.
    pub fn collect(&self, workspace: &Workspace) -> Result<Vec<RawFinding>> {
        if !workspace.root().is_dir() {
            return Err(HealError::diagnostic(format!(
                "workspace missing: {}",
                workspace.root().display()
            )));
        }

        let mut findings = Vec::new();
        for pass in &self.passes {
            let found = pass
                .run(workspace)
                .with_context(|| format!("{} pass failed", pass.name()))
                .into_heal_diagnostic()?;
            debug!(pass = pass.name(), findings = found.len(), "Pass complete");
            findings.extend(found);
        }
        Ok(findings)
    }

    /// Collect, classify, deduplicate and order diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`HealError::DiagnosticRunFailure`] if any pass cannot run.
    pub fn scan(&self, workspace: &Workspace) -> Result<Vec<Diagnostic>> {
        let findings = self.collect(workspace)?;
        let mut diagnostics = self.classifier.classify(&findings);

        for d in &mut diagnostics {
            if d.context.is_empty() {
                d.context = source_context(workspace, &d.file, d.line);
            }
        }

        let diagnostics = dedup_and_sort(diagnostics);
        info!(count = diagnostics.len(), "Scan complete");
        Ok(diagnostics)
    }
}

// ============================================================================
// Test File Filter
// ============================================================================

/// Glob patterns that identify Python test files.
pub const DEFAULT_TEST_PATTERNS: &[&str] = &[
    "test_*.py",
    "*_test.py",
    "conftest.py",
    "tests/**",
    "test/**",
];

/// Matches test files, which are excluded from the lint and import passes.
#[derive(Debug, Clone)]
pub struct TestFileFilter {
    set: GlobSet,
}

impl Default for TestFileFilter {
    fn default() -> Self {
        let patterns: Vec<String> = DEFAULT_TEST_PATTERNS.iter().map(|p| p.to_string()).collect();
        Self::new(&patterns)
    }
}

impl TestFileFilter {
    /// Build a filter from glob patterns. Invalid patterns are skipped with a
    /// warning.
    #[must_use]
    pub fn new(patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => warn!("Ignoring invalid test file pattern '{}': {}", pattern, e),
            }
        }
        let set = builder.build().unwrap_or_else(|_| GlobSet::empty());
        Self { set }
    }

    /// True if the workspace-relative path (or its file name) matches.
    #[must_use]
    pub fn is_test_file(&self, relative: &Path) -> bool {
        self.set.is_match(relative)
            || relative
                .file_name()
                .is_some_and(|name| self.set.is_match(Path::new(name)))
    }
}

/// Keep the first diagnostic per `(file, line, category)`, ordered by
/// file, line, category priority and message.
#[must_use]
pub fn dedup_and_sort(mut diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    diagnostics.sort_by(|a, b| {
        a.file
            .cmp(&b.file)
            .then(a.line.cmp(&b.line))
            .then(a.category.cmp(&b.category))
            .then(a.message.cmp(&b.message))
    });
    let mut seen = HashSet::new();
    diagnostics.retain(|d| seen.insert(d.key()));
    diagnostics
}

/// A few lines of numbered source around `line`.
fn source_context(workspace: &Workspace, file: &Path, line: Option<u32>) -> String {
    let Some(line) = line else {
        return String::new();
    };
    let Ok(source) = workspace.read_file(file) else {
        return String::new();
    };
    let line = line as usize;
    let start = line.saturating_sub(3);
    source
        .lines()
        .enumerate()
        .skip(start)
        .take(5)
        .map(|(i, text)| {
            let marker = if i + 1 == line { ">" } else { " " };
            format!("{marker}{:>4} | {text}", i + 1)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::ScriptedCheckSuite;
    use std::fs;
    use tempfile::TempDir;

    struct StaticPass(Vec<RawFinding>);

    impl DiagnosticPass for StaticPass {
        fn name(&self) -> &str {
            "static"
        }
        fn run(&self, _workspace: &Workspace) -> anyhow::Result<Vec<RawFinding>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenPass;

    impl DiagnosticPass for BrokenPass {
        fn name(&self) -> &str {
            "broken"
        }
        fn run(&self, _workspace: &Workspace) -> anyhow::Result<Vec<RawFinding>> {
            anyhow::bail!("tool could not start")
        }
    }

    fn workspace_with(file: &str, content: &str) -> (TempDir, Workspace) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(file), content).unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        (temp, ws)
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!("type_error".parse::<BugCategory>(), Ok(BugCategory::TypeError));
        assert_eq!("SYNTAX".parse::<BugCategory>(), Ok(BugCategory::Syntax));
        assert!("nope".parse::<BugCategory>().is_err());
        assert_eq!(
            serde_json::to_string(&BugCategory::TypeError).unwrap(),
            "\"TYPE_ERROR\""
        );
    }

    #[test]
    fn test_category_routing_is_partitioned() {
        for c in BugCategory::ALL {
            assert_ne!(c.is_deterministic(), c.is_generative(), "{c}");
        }
    }

    #[test]
    fn test_scan_dedups_by_file_line_category() {
        let (_temp, ws) = workspace_with("a.py", "def f(:\n    pass\n");
        let findings = vec![
            RawFinding::new(FindingKind::ParseFailure, "a.py", "first").with_line(1),
            RawFinding::new(FindingKind::ParseFailure, "a.py", "second").with_line(1),
            RawFinding::new(FindingKind::Whitespace, "a.py", "indent").with_line(2),
        ];
        let runner = DiagnosticRunner::new(
            vec![Box::new(StaticPass(findings))],
            Classifier::default(),
        );
        let diags = runner.scan(&ws).unwrap();
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].category, BugCategory::Syntax);
        assert_eq!(diags[0].message, "first");
        assert!(diags[0].context.contains(">   1 | def f(:"));
        assert_eq!(diags[1].category, BugCategory::Indentation);
    }

    #[test]
    fn test_scan_is_idempotent() {
        let (_temp, ws) = workspace_with("a.py", "x = (\n");
        let runner = DiagnosticRunner::new(
            vec![
                Box::new(ParsePass::new()),
                Box::new(CheckPass::new(Box::new(ScriptedCheckSuite::passing()))),
            ],
            Classifier::default(),
        );
        let first = runner.scan(&ws).unwrap();
        let second = runner.scan(&ws).unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_pass_failure_is_diagnostic_run_failure() {
        let (_temp, ws) = workspace_with("a.py", "x = 1\n");
        let runner = DiagnosticRunner::new(vec![Box::new(BrokenPass)], Classifier::default());
        let err = runner.scan(&ws).unwrap_err();
        assert!(matches!(err, HealError::DiagnosticRunFailure { .. }));
        assert!(err.to_string().contains("tool could not start"));
    }

    #[test]
    fn test_test_file_filter() {
        let filter = TestFileFilter::new(&[
            "test_*.py".to_string(),
            "*_test.py".to_string(),
            "tests/**".to_string(),
            "[".to_string(),
        ]);
        assert!(filter.is_test_file(Path::new("pkg/test_calc.py")));
        assert!(filter.is_test_file(Path::new("calc_test.py")));
        assert!(filter.is_test_file(Path::new("tests/helpers.py")));
        assert!(!filter.is_test_file(Path::new("src/calc.py")));
    }

    #[test]
    fn test_counts_by_category() {
        let d = |category| Diagnostic {
            file: PathBuf::from("a.py"),
            line: None,
            category,
            message: String::new(),
            context: String::new(),
            code: None,
        };
        let counts = counts_by_category(&[
            d(BugCategory::Logic),
            d(BugCategory::Logic),
            d(BugCategory::Syntax),
        ]);
        assert_eq!(counts.get(&BugCategory::Logic), Some(&2));
        assert_eq!(counts.get(&BugCategory::Syntax), Some(&1));
        assert_eq!(counts.get(&BugCategory::Import), None);
    }
}
