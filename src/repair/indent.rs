//! INDENTATION: normalise the offending block to the file's indent unit.

use super::{Fix, FixContext, Patch};
use crate::diagnostics::Diagnostic;
use crate::python;

pub(crate) fn fix(diagnostic: &Diagnostic, source: &str, _ctx: &FixContext) -> Option<Fix> {
    let line = diagnostic.line?;
    let lines: Vec<&str> = source.lines().collect();
    let idx = (line as usize).checked_sub(1)?;
    let text = *lines.get(idx)?;
    if text.trim().is_empty() {
        return None;
    }

    let unit = python::indent_unit(source);
    let width = unit_width(&unit);
    let current = columns(python::leading_whitespace(text), width);
    let expected = expected_columns(&lines, idx, current, width);

    // The block: this line plus following lines indented at least as deep.
    let end = lines[idx + 1..]
        .iter()
        .position(|l| {
            !l.trim().is_empty() && columns(python::leading_whitespace(l), width) < current
        })
        .map_or(lines.len(), |p| idx + 1 + p);

    let delta = expected as isize - current as isize;
    let old: Vec<String> = lines[idx..end].iter().map(|l| l.to_string()).collect();
    let new: Vec<String> = old
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                return l.trim_end().to_string();
            }
            let cols = columns(python::leading_whitespace(l), width) as isize;
            let shifted = (cols + delta).max(0) as usize;
            format!("{}{}", render(shifted, &unit, width), l.trim_start())
        })
        .collect();

    if new == old {
        return None;
    }

    let patch = Patch::ReplaceLines {
        start: line,
        old,
        new,
    };
    let was_clean = python::parses_cleanly(source);
    let applied = patch.apply_to(source).ok()?;
    if !python::parses_cleanly(&applied.content) && (was_clean || applied.content == source) {
        return None;
    }

    Some(Fix {
        patch,
        description: format!(
            "re-indent lines {}-{} to {} column(s)",
            line,
            end,
            expected
        ),
    })
}

fn unit_width(unit: &str) -> usize {
    if unit == "\t" {
        4
    } else {
        unit.len().max(1)
    }
}

/// Visual width of leading whitespace, counting a tab as one indent unit.
fn columns(ws: &str, width: usize) -> usize {
    ws.chars().map(|c| if c == '\t' { width } else { 1 }).sum()
}

fn render(cols: usize, unit: &str, width: usize) -> String {
    if unit == "\t" {
        format!("{}{}", "\t".repeat(cols / width), " ".repeat(cols % width))
    } else {
        " ".repeat(cols)
    }
}

/// Indent the line at `idx` should have.
///
/// After a block opener: opener + one unit. Otherwise: one unit inside the
/// nearest enclosing opener, or the previous code line's indent when there is
/// none, rounded down to a multiple of the unit.
fn expected_columns(lines: &[&str], idx: usize, current: usize, width: usize) -> usize {
    let is_code = |l: &&str| !l.trim().is_empty() && !l.trim_start().starts_with('#');
    let Some(previous) = lines[..idx].iter().copied().rev().find(is_code) else {
        return 0;
    };
    let prev_cols = columns(python::leading_whitespace(previous), width);
    if previous.trim_end().ends_with(':') {
        return prev_cols + width;
    }

    let opener = lines[..idx]
        .iter()
        .copied()
        .rev()
        .filter(is_code)
        .find(|l| {
            l.trim_end().ends_with(':') && columns(python::leading_whitespace(l), width) < current
        });

    match opener {
        Some(o) if current > prev_cols || current % width != 0 => {
            columns(python::leading_whitespace(o), width) + width
        }
        _ if current > prev_cols => prev_cols,
        _ => current / width * width,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::BugCategory;
    use std::path::PathBuf;

    fn apply(line: u32, source: &str) -> Option<String> {
        let diag = Diagnostic {
            file: PathBuf::from("app.py"),
            line: Some(line),
            category: BugCategory::Indentation,
            message: "indentation is not a multiple of 4".into(),
            context: String::new(),
            code: Some("E111".into()),
        };
        let fix = fix(&diag, source, &FixContext::default())?;
        Some(fix.patch.apply_to(source).ok()?.content)
    }

    #[test]
    fn test_body_under_opener() {
        let src = "def f():\n  x = 1\n  return x\n\n\ndef g(y):\n    if y:\n        return 2\n";
        let out = apply(2, src).unwrap();
        assert_eq!(
            out,
            "def f():\n    x = 1\n    return x\n\n\ndef g(y):\n    if y:\n        return 2\n"
        );
    }

    #[test]
    fn test_tabs_converted_to_spaces() {
        let src = "def f():\n    a = 1\n\tb = 2\n    return a + b\n";
        let out = apply(3, src).unwrap();
        assert_eq!(out, "def f():\n    a = 1\n    b = 2\n    return a + b\n");
    }

    #[test]
    fn test_over_indented_continuation() {
        let src = "def f():\n    a = 1\n      b = 2\n    return a\n\n\ndef g():\n    return 1\n";
        let out = apply(3, src).unwrap();
        assert_eq!(
            out,
            "def f():\n    a = 1\n    b = 2\n    return a\n\n\ndef g():\n    return 1\n"
        );
    }

    #[test]
    fn test_correct_line_is_left_alone() {
        assert!(apply(2, "def f():\n    return 1\n").is_none());
    }
}
