//! Patch representation, application and unified-diff rendering.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A proposed change to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Patch {
    /// Replace `old` (starting at 1-based line `start`) with `new`.
    ///
    /// An empty `old` inserts `new` before `start`; an empty `new` deletes.
    ReplaceLines {
        start: u32,
        old: Vec<String>,
        new: Vec<String>,
    },
    /// Replace the whole file.
    ReplaceFile { content: String },
}

/// Why a patch could not be applied to a source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// The anchor text was found neither at the stated line nor elsewhere.
    AnchorNotFound { line: u32 },
    /// The start line lies beyond the end of the file.
    OutOfRange { line: u32, len: usize },
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnchorNotFound { line } => {
                write!(f, "expected text not found at line {line} or elsewhere")
            }
            Self::OutOfRange { line, len } => {
                write!(f, "line {line} is outside the file ({len} lines)")
            }
        }
    }
}

/// Result of applying a patch: new text and the line it landed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub content: String,
    /// 1-based line where a line patch was applied (after relocation).
    pub line: Option<u32>,
}

impl Patch {
    /// Single-line replacement.
    #[must_use]
    pub fn replace_line(line: u32, old: impl Into<String>, new: impl Into<String>) -> Self {
        Self::ReplaceLines {
            start: line,
            old: vec![old.into()],
            new: vec![new.into()],
        }
    }

    /// Delete one line.
    #[must_use]
    pub fn delete_line(line: u32, old: impl Into<String>) -> Self {
        Self::ReplaceLines {
            start: line,
            old: vec![old.into()],
            new: Vec::new(),
        }
    }

    /// Insert lines before 1-based line `before`.
    #[must_use]
    pub fn insert(before: u32, new: Vec<String>) -> Self {
        Self::ReplaceLines {
            start: before,
            old: Vec::new(),
            new,
        }
    }

    /// Inclusive 1-based line range touched in the original text.
    #[must_use]
    pub fn line_range(&self) -> Option<(u32, u32)> {
        match self {
            Self::ReplaceLines { start, old, .. } => {
                let end = start + (old.len() as u32).saturating_sub(1);
                Some((*start, end))
            }
            Self::ReplaceFile { .. } => None,
        }
    }

    /// Apply to `source`.
    ///
    /// When the anchor text is not at the stated line, the first place where
    /// every anchor line matches after trimming whitespace is used instead.
    ///
    /// # Errors
    ///
    /// Returns a [`PatchError`] if the anchor cannot be located.
    pub fn apply_to(&self, source: &str) -> Result<Applied, PatchError> {
        let (start, old, new) = match self {
            Self::ReplaceFile { content } => {
                return Ok(Applied {
                    content: content.clone(),
                    line: None,
                })
            }
            Self::ReplaceLines { start, old, new } => (*start, old, new),
        };

        let newline = line_terminator(source);
        let trailing_newline = source.ends_with('\n') || source.is_empty();
        let mut lines: Vec<String> = source.lines().map(str::to_string).collect();
        let stated = (start.max(1) - 1) as usize;

        let at = if old.is_empty() {
            if stated > lines.len() {
                return Err(PatchError::OutOfRange {
                    line: start,
                    len: lines.len(),
                });
            }
            stated
        } else if matches_at(&lines, stated, old, false) {
            stated
        } else {
            (0..lines.len())
                .find(|&i| matches_at(&lines, i, old, true))
                .ok_or(PatchError::AnchorNotFound { line: start })?
        };

        lines.splice(at..at + old.len(), new.iter().cloned());

        let mut content = lines.join(newline);
        if trailing_newline && !lines.is_empty() {
            content.push_str(newline);
        }
        Ok(Applied {
            content,
            line: Some(at as u32 + 1),
        })
    }

    /// Render as a unified diff against `original`.
    #[must_use]
    pub fn unified_diff(&self, file: &Path, original: &str) -> String {
        let name = file.display();
        let mut out = format!("--- a/{name}\n+++ b/{name}\n");
        match self {
            Self::ReplaceLines { start, old, new } => {
                let _ = writeln!(
                    out,
                    "@@ -{},{} +{},{} @@",
                    start,
                    old.len(),
                    start,
                    new.len()
                );
                for line in old {
                    let _ = writeln!(out, "-{line}");
                }
                for line in new {
                    let _ = writeln!(out, "+{line}");
                }
            }
            Self::ReplaceFile { content } => {
                let before: Vec<&str> = original.lines().collect();
                let after: Vec<&str> = content.lines().collect();
                let _ = writeln!(out, "@@ -1,{} +1,{} @@", before.len(), after.len());
                for line in before {
                    let _ = writeln!(out, "-{line}");
                }
                for line in after {
                    let _ = writeln!(out, "+{line}");
                }
            }
        }
        out
    }
}

/// The terminator the file's first line ends with.
fn line_terminator(source: &str) -> &'static str {
    match source.find('\n') {
        Some(i) if i > 0 && source.as_bytes()[i - 1] == b'\r' => "\r\n",
        _ => "\n",
    }
}

fn matches_at(lines: &[String], at: usize, old: &[String], trimmed: bool) -> bool {
    if at + old.len() > lines.len() {
        return false;
    }
    lines[at..at + old.len()].iter().zip(old).all(|(have, want)| {
        if trimmed {
            have.trim() == want.trim()
        } else {
            have.trim_end() == want.trim_end()
        }
    })
}
