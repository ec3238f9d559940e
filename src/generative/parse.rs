//! Turning free-form service output into fix records.
//!
//! The service is asked for JSON but may wrap it in prose or a fenced block.
//! Each instruction is parsed on its own; anything malformed, outside the
//! workspace, or aimed at a file that was not part of the prompt is dropped.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::diagnostics::Diagnostic;
use crate::repair::{conflicts, FixOrigin, FixRecord, Patch};
use crate::workspace::Workspace;

use super::prompt::Prompt;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    fixes: Vec<Value>,
    #[serde(default)]
    commit_title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Instruction {
    Lines {
        file: String,
        line: u32,
        #[serde(default)]
        old_code: String,
        #[serde(default)]
        new_code: String,
    },
    WholeFile {
        file: String,
        content: String,
    },
}

impl Instruction {
    fn file(&self) -> &str {
        match self {
            Self::Lines { file, .. } | Self::WholeFile { file, .. } => file,
        }
    }
}

/// Parsed records plus the number of instructions thrown away.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub records: Vec<FixRecord>,
    pub discarded: usize,
}

/// Parse a service response against the prompt it answers.
#[must_use]
pub fn parse_response(response: &str, prompt: &Prompt, workspace: &Workspace) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();
    let Some(envelope) = extract_json(response)
        .and_then(|json| serde_json::from_str::<Envelope>(json).ok())
    else {
        debug!("Response carried no usable JSON object");
        return parsed;
    };

    let title = envelope
        .commit_title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    for value in envelope.fixes {
        match serde_json::from_value::<Instruction>(value)
            .ok()
            .and_then(|i| to_record(i, prompt, workspace, title.as_deref()))
        {
            Some(record)
                if !parsed
                    .records
                    .iter()
                    .any(|r| r.file == record.file && conflicts(&r.patch, &record.patch)) =>
            {
                parsed.records.push(record);
            }
            _ => parsed.discarded += 1,
        }
    }

    if parsed.discarded > 0 {
        debug!(discarded = parsed.discarded, "Discarded generated instructions");
    }
    parsed
}

fn to_record(
    instruction: Instruction,
    prompt: &Prompt,
    workspace: &Workspace,
    title: Option<&str>,
) -> Option<FixRecord> {
    let file: PathBuf = workspace.relativize(instruction.file())?;
    if !prompt.files.contains(&file) || !workspace.contains_file(&file) {
        return None;
    }
    let original = workspace.read_file(&file).ok()?;

    let (patch, line) = match instruction {
        Instruction::Lines {
            line,
            old_code,
            new_code,
            ..
        } => {
            if line == 0 {
                return None;
            }
            // No old code means the stated line itself is replaced.
            let old: Vec<String> = if old_code.is_empty() {
                vec![original.lines().nth(line as usize - 1)?.to_string()]
            } else {
                old_code.lines().map(str::to_string).collect()
            };
            let new: Vec<String> = new_code.lines().map(str::to_string).collect();
            if old == new {
                return None;
            }
            let patch = Patch::ReplaceLines {
                start: line,
                old,
                new,
            };
            (patch, Some(line))
        }
        Instruction::WholeFile { content, .. } => {
            if content == original {
                return None;
            }
            (Patch::ReplaceFile { content }, None)
        }
    };

    let diagnostic = nearest_diagnostic(&prompt.diagnostics, &file, line)?;
    let description = title.map_or_else(
        || format!("generated fix for {}", diagnostic.location()),
        str::to_string,
    );
    Some(
        FixRecord::proposed(diagnostic, patch, FixOrigin::Generative, description)
            .with_diff_against(&original),
    )
}

/// The diagnostic in `file` closest to `line`; the first one when no line.
fn nearest_diagnostic<'a>(
    diagnostics: &'a [Diagnostic],
    file: &Path,
    line: Option<u32>,
) -> Option<&'a Diagnostic> {
    let mut in_file = diagnostics.iter().filter(|d| d.file == file);
    match line {
        Some(line) => in_file.min_by_key(|d| d.line.map_or(u32::MAX, |l| l.abs_diff(line))),
        None => in_file.next(),
    }
}

/// Locate the JSON object in a response: raw, fenced, or embedded in prose.
fn extract_json(response: &str) -> Option<&str> {
    let trimmed = response.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map_or(0, |n| n + 1);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let fenced = body[..end].trim();
            if fenced.starts_with('{') {
                return Some(fenced);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (start < end).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::BugCategory;
    use crate::repair::FixStatus;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Workspace, Prompt) {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("calc.py"),
            "def add(a, b):\n    return a + b\n\n\ndef sub(a, b):\n    return a + b\n",
        )
        .unwrap();
        fs::write(temp.path().join("other.py"), "x = 1\n").unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        let diag = Diagnostic {
            file: PathBuf::from("calc.py"),
            line: Some(6),
            category: BugCategory::Logic,
            message: "AssertionError".into(),
            context: String::new(),
            code: None,
        };
        let prompt = Prompt {
            text: String::new(),
            diagnostics: vec![diag],
            files: BTreeSet::from([PathBuf::from("calc.py")]),
        };
        (temp, ws, prompt)
    }

    #[test]
    fn test_fenced_line_instruction() {
        let (_t, ws, prompt) = setup();
        let response = "Here you go:\n```json\n{\"fixes\": [{\"file\": \"calc.py\", \"line\": 6, \
            \"old_code\": \"    return a + b\", \"new_code\": \"    return a - b\"}], \
            \"commit_title\": \"Fix subtraction\"}\n```\n";
        let parsed = parse_response(response, &prompt, &ws);
        assert_eq!(parsed.records.len(), 1);
        let record = &parsed.records[0];
        assert_eq!(record.origin, FixOrigin::Generative);
        assert_eq!(record.status, FixStatus::Proposed);
        assert_eq!(record.file, record.diagnostic.file);
        assert_eq!(record.description, "Fix subtraction");
        assert!(record.diff.contains("+    return a - b"));
    }

    #[test]
    fn test_whole_file_instruction() {
        let (_t, ws, prompt) = setup();
        let response = r#"{"fixes": [{"file": "./calc.py", "content": "def sub(a, b):\n    return a - b\n"}]}"#;
        let parsed = parse_response(response, &prompt, &ws);
        assert_eq!(parsed.records.len(), 1);
        assert!(matches!(parsed.records[0].patch, Patch::ReplaceFile { .. }));
    }

    #[test]
    fn test_discards_foreign_and_malformed() {
        let (_t, ws, prompt) = setup();
        let response = r#"{"fixes": [
            {"file": "other.py", "line": 1, "old_code": "x = 1", "new_code": "x = 2"},
            {"file": "../escape.py", "content": "boom"},
            {"file": "calc.py"},
            {"line": "six"},
            {"file": "calc.py", "line": 6, "old_code": "    return a + b", "new_code": "    return a - b"}
        ]}"#;
        let parsed = parse_response(response, &prompt, &ws);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.discarded, 4);
    }

    #[test]
    fn test_line_without_old_code_replaces_that_line() {
        let (_t, ws, prompt) = setup();
        let response = r#"{"fixes": [{"file": "calc.py", "line": 6, "new_code": "    return a - b"}]}"#;
        let parsed = parse_response(response, &prompt, &ws);
        assert_eq!(parsed.records.len(), 1);

        let original = ws.read_file(Path::new("calc.py")).unwrap();
        let applied = parsed.records[0].patch.apply_to(&original).unwrap();
        assert_eq!(
            applied.content,
            "def add(a, b):\n    return a + b\n\n\ndef sub(a, b):\n    return a - b\n"
        );
    }

    #[test]
    fn test_line_without_old_code_out_of_range_is_discarded() {
        let (_t, ws, prompt) = setup();
        let response = r#"{"fixes": [
            {"file": "calc.py", "line": 40, "new_code": "    return a - b"},
            {"file": "calc.py", "line": 6, "new_code": "    return a + b"}
        ]}"#;
        let parsed = parse_response(response, &prompt, &ws);
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.discarded, 2);
    }

    #[test]
    fn test_garbage_yields_nothing() {
        let (_t, ws, prompt) = setup();
        let parsed = parse_response("I cannot help with that.", &prompt, &ws);
        assert!(parsed.records.is_empty());
    }

    #[test]
    fn test_extract_json_forms() {
        assert_eq!(extract_json(" {\"a\":1} "), Some("{\"a\":1}"));
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("sure: {\"a\":1} done"), Some("{\"a\":1}"));
        assert_eq!(extract_json("nothing"), None);
    }
}
