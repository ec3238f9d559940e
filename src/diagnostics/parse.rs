//! Full-source parse check.

use tracing::warn;

use super::{DiagnosticPass, FindingKind, RawFinding};
use crate::python;
use crate::workspace::Workspace;

/// Parses every Python file in the workspace and reports the first syntax
/// problem of each file that does not parse.
#[derive(Debug, Default)]
pub struct ParsePass;

impl ParsePass {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DiagnosticPass for ParsePass {
    fn name(&self) -> &str {
        "parse"
    }

    fn run(&self, workspace: &Workspace) -> anyhow::Result<Vec<RawFinding>> {
        let mut findings = Vec::new();
        for file in workspace.python_files() {
            let source = match workspace.read_file(&file) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping unreadable file {}: {}", file.display(), e);
                    continue;
                }
            };
            if let Some(problem) = python::syntax_problem(&source)? {
                findings.push(
                    RawFinding::new(FindingKind::ParseFailure, &file, problem.message)
                        .with_line(problem.line)
                        .with_code("syntax-error"),
                );
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_reports_only_broken_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("ok.py"), "def f():\n    return 1\n").unwrap();
        fs::write(temp.path().join("bad.py"), "def f()\n    return 1\n").unwrap();
        let ws = Workspace::open(temp.path()).unwrap();

        let findings = ParsePass::new().run(&ws).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file, std::path::PathBuf::from("bad.py"));
        assert_eq!(findings[0].kind, FindingKind::ParseFailure);
        assert!(findings[0].line.is_some());
    }

    #[test]
    fn test_clean_workspace_has_no_findings() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("ok.py"), "import os\nprint(os.sep)\n").unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        assert!(ParsePass::new().run(&ws).unwrap().is_empty());
    }
}
