//! Bounded prompt construction for unresolved diagnostics.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::diagnostics::Diagnostic;
use crate::workspace::Workspace;

/// Lines shown either side of a diagnostic when a file is too large to send whole.
const EXCERPT_RADIUS: usize = 20;

const INSTRUCTIONS: &str = r#"The Python project below fails its automated checks.
Fix the failures listed under "Failures". Change as little as possible.

Respond with a single JSON object and nothing else:
{"fixes": [{"file": "<path>", "line": <number>, "old_code": "<exact current lines>", "new_code": "<replacement lines>"}], "commit_title": "<short summary>"}
A fix may replace a whole file instead: {"file": "<path>", "content": "<new file content>"}.
An empty "new_code" deletes "old_code". Only edit the files shown below.
The line numbers in the listings are not part of the code."#;

/// A prompt plus the diagnostics and files it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub diagnostics: Vec<Diagnostic>,
    pub files: BTreeSet<PathBuf>,
}

/// Build a prompt of at most `max_chars` characters.
///
/// Files are added in order of their first diagnostic. A file that does not
/// fit whole is sent as excerpts around its diagnostics; one that does not
/// fit even then is left out together with its diagnostics. Returns `None`
/// when nothing fits.
#[must_use]
pub fn build(diagnostics: &[Diagnostic], workspace: &Workspace, max_chars: usize) -> Option<Prompt> {
    let mut files: Vec<PathBuf> = Vec::new();
    for d in diagnostics {
        if !d.file.as_os_str().is_empty() && !files.contains(&d.file) {
            files.push(d.file.clone());
        }
    }

    let mut text = String::from(INSTRUCTIONS);
    text.push_str("\n\n## Failures\n");
    let mut listing = String::from("\n## Files\n");
    let mut included = Vec::new();
    let mut sent = BTreeSet::new();

    for file in files {
        let Ok(source) = workspace.read_file(&file) else {
            debug!(file = %file.display(), "Unreadable file left out of prompt");
            continue;
        };
        let ours: Vec<&Diagnostic> = diagnostics.iter().filter(|d| d.file == file).collect();
        let failures: String = ours
            .iter()
            .enumerate()
            .map(|(i, d)| describe(included.len() + i + 1, d))
            .collect();

        let lines: Vec<&str> = source.lines().collect();
        let whole = render_file(&file, &lines, None);
        let budget = max_chars.saturating_sub(text.len() + listing.len() + failures.len());
        let section = if whole.len() <= budget {
            whole
        } else {
            let wanted: Vec<u32> = ours.iter().filter_map(|d| d.line).collect();
            let excerpt = render_file(&file, &lines, Some(&wanted));
            if wanted.is_empty() || excerpt.len() > budget {
                warn!(file = %file.display(), "File does not fit in prompt budget");
                continue;
            }
            excerpt
        };

        text.push_str(&failures);
        listing.push_str(&section);
        included.extend(ours.into_iter().cloned());
        sent.insert(file);
    }

    if included.is_empty() {
        return None;
    }
    text.push_str(&listing);
    Some(Prompt {
        text,
        diagnostics: included,
        files: sent,
    })
}

fn describe(n: usize, d: &Diagnostic) -> String {
    let mut out = format!("{n}. {} [{}] {}\n", d.location(), d.category, d.message);
    for line in d.context.lines() {
        let _ = writeln!(out, "   {line}");
    }
    out
}

/// Numbered listing of a file, or of windows around `around` lines.
fn render_file(file: &std::path::Path, lines: &[&str], around: Option<&[u32]>) -> String {
    let keep = |i: usize| match around {
        None => true,
        Some(targets) => targets.iter().any(|&t| {
            let t = t as usize;
            i + 1 + EXCERPT_RADIUS >= t && i + 1 <= t + EXCERPT_RADIUS
        }),
    };

    let mut out = format!("\n### {}\n```python\n", file.display());
    let mut gap = false;
    for (i, line) in lines.iter().enumerate() {
        if keep(i) {
            let _ = writeln!(out, "{:>4} | {}", i + 1, line);
            gap = false;
        } else if !gap {
            out.push_str("     | ...\n");
            gap = true;
        }
    }
    out.push_str("```\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::BugCategory;
    use std::fs;
    use tempfile::TempDir;

    fn diag(file: &str, line: u32) -> Diagnostic {
        Diagnostic {
            file: PathBuf::from(file),
            line: Some(line),
            category: BugCategory::Logic,
            message: "AssertionError: assert 3 == -1".into(),
            context: "> 2 | return a + b".into(),
            code: None,
        }
    }

    #[test]
    fn test_prompt_lists_failures_and_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("calc.py"), "def sub(a, b):\n    return a + b\n").unwrap();
        let ws = Workspace::open(temp.path()).unwrap();

        let prompt = build(&[diag("calc.py", 2)], &ws, 10_000).unwrap();
        assert!(prompt.text.contains("1. calc.py:2 [LOGIC] AssertionError"));
        assert!(prompt.text.contains("### calc.py"));
        assert!(prompt.text.contains("   2 |     return a + b"));
        assert!(prompt.files.contains(&PathBuf::from("calc.py")));
    }

    #[test]
    fn test_large_file_sent_as_excerpt() {
        let temp = TempDir::new().unwrap();
        let body: String = (0..400).map(|i| format!("x{i} = {i}\n")).collect();
        fs::write(temp.path().join("big.py"), &body).unwrap();
        let ws = Workspace::open(temp.path()).unwrap();

        let prompt = build(&[diag("big.py", 200)], &ws, 4_000).unwrap();
        assert!(prompt.text.len() <= 4_000);
        assert!(prompt.text.contains(" 200 | x199 = 199"));
        assert!(!prompt.text.contains("x5 = 5\n"));
    }

    #[test]
    fn test_nothing_fits() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("calc.py"), "x = 1\n").unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        assert!(build(&[diag("calc.py", 1)], &ws, 10).is_none());
        assert!(build(&[diag("missing.py", 1)], &ws, 10_000).is_none());
    }
}
