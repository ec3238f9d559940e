//! The project's own check command, and pytest output parsing.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::{bail, Context};
use regex::Regex;
use tracing::{debug, info, warn};

use super::{DiagnosticPass, FindingKind, RawFinding, TestFileFilter};
use crate::workspace::Workspace;

/// pytest exit code for "no tests were collected".
const PYTEST_NO_TESTS: i32 = 5;

/// Context lines kept per failure block.
const MAX_CONTEXT_LINES: usize = 60;

/// Captured result of one check run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CheckOutput {
    /// A successful run with the given stdout.
    #[must_use]
    pub fn passed(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given stdout.
    #[must_use]
    pub fn failed(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes the project's check suite.
pub trait CheckSuite: Send + Sync {
    /// Run the suite in `project_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the suite process cannot be started.
    fn run(&self, project_dir: &Path) -> anyhow::Result<CheckOutput>;
}

/// Runs a configured command line, e.g. `pytest -v`.
#[derive(Debug)]
pub struct ProcessCheckSuite {
    program: String,
    args: Vec<String>,
    install: Option<String>,
    installed: AtomicBool,
}

impl ProcessCheckSuite {
    /// Create a suite from a whitespace-separated command line.
    #[must_use]
    pub fn new(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
            install: None,
            installed: AtomicBool::new(false),
        }
    }

    /// Install `requirements.txt` with `<python> -m pip` before the first run.
    #[must_use]
    pub fn with_dependency_install(mut self, enabled: bool, python: &str) -> Self {
        self.install = enabled.then(|| python.to_string());
        self
    }

    fn install_dependencies(&self, project_dir: &Path) {
        let Some(python) = &self.install else {
            return;
        };
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !project_dir.join("requirements.txt").is_file() {
            return;
        }

        info!("Installing dependencies from requirements.txt");
        match Command::new(python)
            .args(["-m", "pip", "install", "-q", "-r", "requirements.txt"])
            .current_dir(project_dir)
            .output()
        {
            Ok(out) if out.status.success() => debug!("Dependencies installed"),
            Ok(out) => warn!(
                "Dependency install failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => warn!("Could not run pip: {}", e),
        }
    }
}

impl CheckSuite for ProcessCheckSuite {
    fn run(&self, project_dir: &Path) -> anyhow::Result<CheckOutput> {
        if self.program.is_empty() {
            bail!("check command is empty");
        }
        self.install_dependencies(project_dir);

        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(project_dir)
            .output()
            .with_context(|| format!("failed to start check command '{}'", self.program))?;

        Ok(CheckOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Reports failures surfaced by the check suite.
pub struct CheckPass {
    suite: Box<dyn CheckSuite>,
    tests: TestFileFilter,
}

impl CheckPass {
    #[must_use]
    pub fn new(suite: Box<dyn CheckSuite>) -> Self {
        Self {
            suite,
            tests: TestFileFilter::default(),
        }
    }

    /// Use a custom filter to tell test frames from code frames.
    #[must_use]
    pub fn with_test_filter(mut self, tests: TestFileFilter) -> Self {
        self.tests = tests;
        self
    }
}

impl DiagnosticPass for CheckPass {
    fn name(&self) -> &str {
        "check"
    }

    fn required_tool(&self) -> Option<&str> {
        Some("pytest")
    }

    fn run(&self, workspace: &Workspace) -> anyhow::Result<Vec<RawFinding>> {
        let output = self.suite.run(workspace.root())?;
        if output.success || output.exit_code == Some(PYTEST_NO_TESTS) {
            return Ok(Vec::new());
        }

        let text = output.combined();
        let findings = parse_pytest_output(
            &text,
            |reported| {
                workspace
                    .relativize(reported)
                    .filter(|p| workspace.contains_file(p))
            },
            |path| self.tests.is_test_file(path),
        );

        if !findings.is_empty() {
            return Ok(findings);
        }

        // Failed, but nothing recognisable: report the run itself.
        let tail: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let message = tail.last().map_or_else(
            || format!("check command exited with status {:?}", output.exit_code),
            |l| l.trim().to_string(),
        );
        let context = tail[tail.len().saturating_sub(MAX_CONTEXT_LINES)..].join("\n");
        Ok(vec![RawFinding::new(FindingKind::CheckFailure, PathBuf::new(), message)
            .with_context(context)])
    }
}

// ============================================================================
// pytest Output Parsing
// ============================================================================

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn banner_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"^_{3,} (.+?) _{3,}$")
}

fn frame_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"^([^\s:][^:]*\.py):(\d+):\s?(.*)$")
}

fn file_line_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#"File "([^"]+\.py)", line (\d+)"#)
}

fn summary_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"^(FAILED|ERROR) (\S+?)(?:::(\S+))?(?: - (.*))?$")
}

#[derive(Debug, Default)]
struct FailureBlock {
    title: String,
    lines: Vec<String>,
}

/// A `path:line` location within a traceback.
#[derive(Debug, Clone)]
struct Frame {
    file: PathBuf,
    line: u32,
    tail: String,
}

/// Parse pytest output into raw check failures.
///
/// `resolve` maps a reported path to a workspace-relative file (or `None`
/// if the path is outside the workspace); `is_test` tells test files from
/// code under test.
pub fn parse_pytest_output(
    output: &str,
    resolve: impl Fn(&str) -> Option<PathBuf>,
    is_test: impl Fn(&Path) -> bool,
) -> Vec<RawFinding> {
    let blocks = split_blocks(output);
    let mut findings = Vec::new();
    let mut seen_tests = Vec::new();

    for block in &blocks {
        seen_tests.push(block.title.clone());
        seen_tests.push(test_leaf(&block.title).to_string());
        if let Some(finding) = block_finding(block, &resolve, &is_test) {
            findings.push(finding);
        }
    }

    // Summary lines cover failures whose tracebacks were not printed.
    for line in output.lines() {
        let Some(caps) = summary_re().and_then(|re| re.captures(line.trim_end())) else {
            continue;
        };
        let path = caps.get(2).map_or("", |m| m.as_str());
        let test = caps.get(3).map(|m| m.as_str().replace("::", "."));
        let leaf = test.as_deref().map(test_leaf).unwrap_or(path);
        if seen_tests.iter().any(|t| t == leaf || t.ends_with(path)) {
            continue;
        }
        let Some(file) = resolve(path) else {
            continue;
        };
        let message = caps
            .get(4)
            .map_or_else(|| format!("{} {}", &caps[1], line.trim()), |m| m.as_str().to_string());
        seen_tests.push(leaf.to_string());
        findings.push(
            RawFinding::new(FindingKind::CheckFailure, file, message).with_context(line.trim()),
        );
    }

    findings
}

fn test_leaf(title: &str) -> &str {
    title.rsplit(['.', ' ']).next().unwrap_or(title)
}

fn split_blocks(output: &str) -> Vec<FailureBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<FailureBlock> = None;

    for line in output.lines() {
        if let Some(caps) = banner_re().and_then(|re| re.captures(line.trim_end())) {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            current = Some(FailureBlock {
                title: caps[1].trim().to_string(),
                lines: Vec::new(),
            });
            continue;
        }
        if line.starts_with("===") {
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            block.lines.push(line.to_string());
        }
    }
    if let Some(done) = current {
        blocks.push(done);
    }
    blocks
}

fn block_finding(
    block: &FailureBlock,
    resolve: &impl Fn(&str) -> Option<PathBuf>,
    is_test: &impl Fn(&Path) -> bool,
) -> Option<RawFinding> {
    let mut frames = Vec::new();
    for line in &block.lines {
        if let Some(caps) = frame_re().and_then(|re| re.captures(line.trim_end())) {
            if let (Some(file), Ok(n)) = (resolve(&caps[1]), caps[2].parse::<u32>()) {
                frames.push(Frame {
                    file,
                    line: n,
                    tail: caps[3].trim().to_string(),
                });
            }
        } else if let Some(caps) = file_line_re().and_then(|re| re.captures(line)) {
            if let (Some(file), Ok(n)) = (resolve(&caps[1]), caps[2].parse::<u32>()) {
                frames.push(Frame {
                    file,
                    line: n,
                    tail: String::new(),
                });
            }
        }
    }

    let collected = block
        .title
        .strip_prefix("ERROR collecting ")
        .and_then(|p| resolve(p.trim()));

    let chosen = frames
        .iter()
        .rev()
        .find(|f| !is_test(&f.file))
        .or_else(|| frames.first())
        .cloned();

    let (file, line) = match (chosen, collected) {
        (Some(frame), _) => (frame.file, Some(frame.line)),
        (None, Some(path)) => (path, None),
        (None, None) => return None,
    };

    let message = failure_message(block, &frames);
    let start = block.lines.len().saturating_sub(MAX_CONTEXT_LINES);
    let context = block.lines[start..].join("\n");

    let mut finding = RawFinding::new(FindingKind::CheckFailure, file, message)
        .with_context(context.trim_matches('\n'));
    if let Some(line) = line {
        finding = finding.with_line(line);
    }
    Some(finding)
}

/// The last `E   ...` line, prefixed with the exception type when the line
/// itself does not name it.
fn failure_message(block: &FailureBlock, frames: &[Frame]) -> String {
    let last_e = block
        .lines
        .iter()
        .rev()
        .filter_map(|l| l.strip_prefix("E "))
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.chars().all(|c| c == '^' || c == '~'));

    let exception = frames
        .last()
        .map(|f| f.tail.as_str())
        .filter(|t| !t.is_empty() && !t.starts_with("in "));

    match (last_e, exception) {
        (Some(e), Some(exc)) if !e.starts_with(exc) => format!("{exc}: {e}"),
        (Some(e), _) => e.to_string(),
        (None, Some(exc)) => exc.to_string(),
        (None, None) => block
            .lines
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .unwrap_or(block.title.as_str())
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::ScriptedCheckSuite;
    use std::fs;
    use tempfile::TempDir;

    const ASSERTION_OUTPUT: &str = "\
============================= test session starts ==============================
collected 2 items

tests/test_calc.py::test_add FAILED                                      [ 50%]
tests/test_calc.py::test_sub PASSED                                      [100%]

=================================== FAILURES ===================================
___________________________________ test_add ___________________________________

    def test_add():
>       assert add(2, 3) == 5

tests/test_calc.py:4:
_ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ _

    def add(a, b):
>       return a - b + helper()
E       TypeError: unsupported operand type(s) for +: 'int' and 'str'

src/calc.py:2: TypeError
=========================== short test summary info ============================
FAILED tests/test_calc.py::test_add - TypeError: unsupported operand type(s)
========================= 1 failed, 1 passed in 0.03s ==========================
";

    fn resolve_any(path: &str) -> Option<PathBuf> {
        Some(PathBuf::from(path.trim_start_matches("./")))
    }

    fn is_test(path: &Path) -> bool {
        TestFileFilter::default().is_test_file(path)
    }

    #[test]
    fn test_deepest_non_test_frame_is_chosen() {
        let findings = parse_pytest_output(ASSERTION_OUTPUT, resolve_any, is_test);
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.file, PathBuf::from("src/calc.py"));
        assert_eq!(f.line, Some(2));
        assert_eq!(
            f.message,
            "TypeError: unsupported operand type(s) for +: 'int' and 'str'"
        );
        assert!(f.context.contains("return a - b"));
    }

    #[test]
    fn test_assertion_in_test_file_falls_back_to_first_frame() {
        let output = "\
___________________________________ test_add ___________________________________

    def test_add():
>       assert add(2, 3) == 5
E       assert -1 == 5

tests/test_calc.py:4: AssertionError
";
        let findings = parse_pytest_output(output, resolve_any, is_test);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file, PathBuf::from("tests/test_calc.py"));
        assert_eq!(findings[0].message, "AssertionError: assert -1 == 5");
    }

    #[test]
    fn test_collection_error() {
        let output = "\
==================================== ERRORS ====================================
_____________________ ERROR collecting tests/test_calc.py ______________________
ImportError while importing test module 'tests/test_calc.py'.
E   ModuleNotFoundError: No module named 'numpyy'
=========================== short test summary info ============================
ERROR tests/test_calc.py
";
        let findings = parse_pytest_output(output, resolve_any, is_test);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file, PathBuf::from("tests/test_calc.py"));
        assert_eq!(findings[0].line, None);
        assert_eq!(findings[0].message, "ModuleNotFoundError: No module named 'numpyy'");
    }

    #[test]
    fn test_summary_only_failures() {
        let output = "FAILED tests/test_calc.py::test_div - ZeroDivisionError: division by zero\n";
        let findings = parse_pytest_output(output, resolve_any, is_test);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].message, "ZeroDivisionError: division by zero");
        assert_eq!(findings[0].line, None);
    }

    #[test]
    fn test_outside_frames_ignored() {
        let output = "\
___________________________________ test_x ___________________________________
/usr/lib/python3/site.py:10: in helper
E   ValueError: bad
";
        let findings = parse_pytest_output(output, |_| None, is_test);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_check_pass_no_tests_collected_is_clean() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        let pass = CheckPass::new(Box::new(ScriptedCheckSuite::new(vec![CheckOutput::failed(
            5,
            "no tests ran",
        )])));
        assert!(pass.run(&ws).unwrap().is_empty());
    }

    #[test]
    fn test_check_pass_unrecognised_failure() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        let pass = CheckPass::new(Box::new(ScriptedCheckSuite::new(vec![CheckOutput::failed(
            2,
            "something odd happened\n",
        )])));
        let findings = pass.run(&ws).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file, PathBuf::new());
        assert_eq!(findings[0].message, "something odd happened");
    }

    #[test]
    fn test_check_pass_resolves_workspace_files() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::create_dir_all(temp.path().join("tests")).unwrap();
        fs::write(temp.path().join("src/calc.py"), "def add(a, b):\n    return a - b\n").unwrap();
        fs::write(temp.path().join("tests/test_calc.py"), "").unwrap();
        let ws = Workspace::open(temp.path()).unwrap();

        let pass = CheckPass::new(Box::new(ScriptedCheckSuite::new(vec![CheckOutput::failed(
            1,
            ASSERTION_OUTPUT,
        )])));
        let findings = pass.run(&ws).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file, PathBuf::from("src/calc.py"));
    }

    #[test]
    fn test_process_suite_missing_binary_errors() {
        let temp = TempDir::new().unwrap();
        let suite = ProcessCheckSuite::new("definitely-not-a-check-binary -v");
        assert!(suite.run(temp.path()).is_err());
        assert!(ProcessCheckSuite::new("   ").run(temp.path()).is_err());
    }
}
