//! Lint rule subsets for unused imports and for whitespace/indentation.
//!
//! `ruff` is preferred; `flake8` is the fallback. When neither is installed
//! the pass logs a warning and contributes nothing.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, warn};

use super::{DiagnosticPass, FindingKind, RawFinding, TestFileFilter};
use crate::workspace::Workspace;

const FLAKE8_FORMAT: &str = "--format=%(path)s:%(row)d:%(col)d:%(code)s:%(text)s";

/// Which rule subset a [`LintPass`] checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintRules {
    /// F401.
    UnusedImports,
    /// E111-E117 and W191.
    Indentation,
}

impl LintRules {
    /// Rule codes selected for this subset.
    #[must_use]
    pub fn codes(self) -> &'static [&'static str] {
        match self {
            Self::UnusedImports => &["F401"],
            Self::Indentation => &[
                "E111", "E112", "E113", "E114", "E115", "E116", "E117", "W191",
            ],
        }
    }

    fn kind(self) -> FindingKind {
        match self {
            Self::UnusedImports => FindingKind::UnusedImport,
            Self::Indentation => FindingKind::Whitespace,
        }
    }

    fn select_arg(self) -> String {
        format!("--select={}", self.codes().join(","))
    }
}

/// An available linter binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Linter {
    Ruff,
    Flake8,
}

fn detect_linter() -> Option<Linter> {
    if which::which("ruff").is_ok() {
        Some(Linter::Ruff)
    } else if which::which("flake8").is_ok() {
        Some(Linter::Flake8)
    } else {
        None
    }
}

/// Runs one lint rule subset.
pub struct LintPass {
    rules: LintRules,
    tests: TestFileFilter,
}

impl LintPass {
    #[must_use]
    pub fn new(rules: LintRules, tests: TestFileFilter) -> Self {
        Self { rules, tests }
    }

    fn run_ruff(&self, root: &Path) -> Option<String> {
        let output = Command::new("ruff")
            .args(["check", ".", "--output-format=json", "--no-cache", "--exit-zero"])
            .arg("--preview")
            .arg(self.rules.select_arg())
            .current_dir(root)
            .output();
        match output {
            Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into()),
            Ok(out) => {
                warn!(
                    "ruff exited with {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                None
            }
            Err(e) => {
                warn!("Failed to run ruff: {}", e);
                None
            }
        }
    }

    fn run_flake8(&self, root: &Path) -> Option<String> {
        let output = Command::new("flake8")
            .arg(".")
            .arg(self.rules.select_arg())
            .arg(FLAKE8_FORMAT)
            .current_dir(root)
            .output();
        match output {
            // flake8 exits 1 when it reports anything; only stdout matters
            Ok(out) => Some(String::from_utf8_lossy(&out.stdout).into()),
            Err(e) => {
                warn!("Failed to run flake8: {}", e);
                None
            }
        }
    }

    fn keep(&self, workspace: &Workspace, finding: RawFinding) -> Option<RawFinding> {
        let code = finding.code.as_deref()?;
        if !self.rules.codes().contains(&code) {
            return None;
        }
        let file = workspace.relativize(&finding.file.to_string_lossy())?;
        if self.tests.is_test_file(&file) {
            return None;
        }
        Some(RawFinding { file, ..finding })
    }
}

impl DiagnosticPass for LintPass {
    fn name(&self) -> &str {
        match self.rules {
            LintRules::UnusedImports => "lint-unused-imports",
            LintRules::Indentation => "lint-indentation",
        }
    }

    fn required_tool(&self) -> Option<&str> {
        Some("ruff")
    }

    fn run(&self, workspace: &Workspace) -> anyhow::Result<Vec<RawFinding>> {
        let Some(linter) = detect_linter() else {
            warn!("No Python linter available (install ruff or flake8); skipping {}", self.name());
            return Ok(Vec::new());
        };
        debug!(?linter, rules = ?self.rules, "Running linter");

        let parsed = match linter {
            Linter::Ruff => self
                .run_ruff(workspace.root())
                .map(|out| parse_ruff_json(&out, self.rules.kind())),
            Linter::Flake8 => self
                .run_flake8(workspace.root())
                .map(|out| parse_flake8_output(&out, self.rules.kind())),
        };

        Ok(parsed
            .unwrap_or_default()
            .into_iter()
            .filter_map(|f| self.keep(workspace, f))
            .collect())
    }
}

// ============================================================================
// Output Parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct RuffDiagnostic {
    code: Option<String>,
    message: String,
    filename: String,
    location: Option<RuffLocation>,
}

#[derive(Debug, Deserialize)]
struct RuffLocation {
    row: u32,
}

/// Parse `ruff --output-format=json` output.
pub(crate) fn parse_ruff_json(stdout: &str, kind: FindingKind) -> Vec<RawFinding> {
    let Ok(parsed) = serde_json::from_str::<Vec<RuffDiagnostic>>(stdout) else {
        if !stdout.trim().is_empty() {
            warn!("Unparsable ruff output ignored");
        }
        return Vec::new();
    };

    parsed
        .into_iter()
        .filter_map(|d| {
            let code = d.code?;
            let mut finding = RawFinding::new(kind, PathBuf::from(d.filename), d.message)
                .with_code(code);
            if let Some(loc) = d.location {
                finding = finding.with_line(loc.row);
            }
            Some(finding)
        })
        .collect()
}

/// Parse flake8 output in the `path:row:col:code:text` format.
pub(crate) fn parse_flake8_output(stdout: &str, kind: FindingKind) -> Vec<RawFinding> {
    stdout
        .lines()
        .filter_map(|line| parse_flake8_line(line, kind))
        .collect()
}

fn parse_flake8_line(line: &str, kind: FindingKind) -> Option<RawFinding> {
    let parts: Vec<&str> = line.splitn(5, ':').collect();
    if parts.len() < 5 {
        return None;
    }
    let row: u32 = parts[1].trim().parse().ok()?;
    parts[2].trim().parse::<u32>().ok()?;
    let code = parts[3].trim();
    if code.is_empty() {
        return None;
    }
    Some(
        RawFinding::new(kind, parts[0], parts[4].trim())
            .with_line(row)
            .with_code(code),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ruff_json() {
        let json = r#"[
            {"code": "F401", "message": "`os` imported but unused", "filename": "/w/app.py",
             "location": {"row": 1, "column": 8}, "fix": null},
            {"code": null, "message": "SyntaxError", "filename": "/w/bad.py",
             "location": {"row": 2, "column": 1}}
        ]"#;
        let findings = parse_ruff_json(json, FindingKind::UnusedImport);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code.as_deref(), Some("F401"));
        assert_eq!(findings[0].line, Some(1));
        assert_eq!(findings[0].file, PathBuf::from("/w/app.py"));
    }

    #[test]
    fn test_parse_ruff_garbage() {
        assert!(parse_ruff_json("not json", FindingKind::Whitespace).is_empty());
    }

    #[test]
    fn test_parse_flake8_lines() {
        let out = "./pkg/app.py:3:5:E111:indentation is not a multiple of 4\n\
                   ./pkg/app.py:x:5:E111:broken\n\
                   garbage\n";
        let findings = parse_flake8_output(out, FindingKind::Whitespace);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, Some(3));
        assert_eq!(findings[0].code.as_deref(), Some("E111"));
        assert_eq!(findings[0].message, "indentation is not a multiple of 4");
    }

    #[test]
    fn test_keep_filters_codes_tests_and_outside_paths() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        let pass = LintPass::new(
            LintRules::UnusedImports,
            TestFileFilter::new(&["test_*.py".to_string()]),
        );
        let abs = temp.path().join("app.py").display().to_string();

        let kept = pass
            .keep(&ws, RawFinding::new(FindingKind::UnusedImport, &abs, "m").with_code("F401"))
            .unwrap();
        assert_eq!(kept.file, PathBuf::from("app.py"));

        assert!(pass
            .keep(&ws, RawFinding::new(FindingKind::UnusedImport, &abs, "m").with_code("E501"))
            .is_none());
        assert!(pass
            .keep(
                &ws,
                RawFinding::new(FindingKind::UnusedImport, "./test_app.py", "m").with_code("F401")
            )
            .is_none());
        assert!(pass
            .keep(
                &ws,
                RawFinding::new(FindingKind::UnusedImport, "/other/app.py", "m").with_code("F401")
            )
            .is_none());
    }

    #[test]
    fn test_rule_codes() {
        assert_eq!(LintRules::UnusedImports.select_arg(), "--select=F401");
        assert!(LintRules::Indentation.codes().contains(&"W191"));
    }
}
