//! SYNTAX: minimal structural corrections that make a file re-parse.
//!
//! Candidate edits are tried around the parser's first error and the
//! reported line: a missing block colon, unbalanced brackets, and a stray
//! indent. The first candidate whose whole file parses cleanly wins.

use super::{Fix, FixContext, Patch};
use crate::diagnostics::Diagnostic;
use crate::python;

const BLOCK_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
    "async", "match", "case", "lambda",
];

pub(crate) fn fix(diagnostic: &Diagnostic, source: &str, _ctx: &FixContext) -> Option<Fix> {
    let problem = python::syntax_problem(source).ok()??;
    let lines: Vec<&str> = source.lines().collect();

    let mut candidates = Vec::new();
    for anchor in [Some(problem.line), diagnostic.line].into_iter().flatten() {
        for line in [anchor, anchor.saturating_sub(1), anchor + 1] {
            if line >= 1 && line as usize <= lines.len() && !candidates.contains(&line) {
                candidates.push(line);
            }
        }
    }

    let strategies: [(&str, fn(&str, &[&str], usize) -> Option<String>); 3] = [
        ("add missing ':'", add_colon),
        ("balance brackets", balance_brackets),
        ("remove unexpected indent", realign_indent),
    ];

    for (label, strategy) in strategies {
        for &line in &candidates {
            let idx = line as usize - 1;
            let Some(replacement) = strategy(lines[idx], &lines, idx) else {
                continue;
            };
            let patch = Patch::replace_line(line, lines[idx], replacement);
            let Ok(applied) = patch.apply_to(source) else {
                continue;
            };
            if python::parses_cleanly(&applied.content) {
                return Some(Fix {
                    patch,
                    description: format!("{label} on line {line}"),
                });
            }
        }
    }
    None
}

/// Split a line into code and trailing comment, ignoring `#` inside strings.
fn split_comment(line: &str) -> (&str, &str) {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            (None, '#') => return (&line[..i], &line[i..]),
            _ => {}
        }
    }
    (line, "")
}

fn add_colon(line: &str, _lines: &[&str], _idx: usize) -> Option<String> {
    let (code, comment) = split_comment(line);
    let trimmed = code.trim_end();
    let first_word = trimmed
        .trim_start()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()?;
    if !BLOCK_KEYWORDS.contains(&first_word) || trimmed.ends_with(':') {
        return None;
    }
    let mut out = format!("{trimmed}:");
    if !comment.is_empty() {
        out.push_str("  ");
        out.push_str(comment);
    }
    Some(out)
}

fn balance_brackets(line: &str, _lines: &[&str], _idx: usize) -> Option<String> {
    let (code, comment) = split_comment(line);
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    let mut stray = None;
    for (i, c) in code.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let opener = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.last() == Some(&opener) {
                    stack.pop();
                } else if stray.is_none() {
                    stray = Some(i);
                }
            }
            _ => {}
        }
    }

    let trimmed = code.trim_end();
    let body = if let Some(i) = stray {
        format!("{}{}", &code[..i], &code[i + 1..]).trim_end().to_string()
    } else if !stack.is_empty() {
        let (head, colon) = match trimmed.strip_suffix(':') {
            Some(head) => (head, ":"),
            None => (trimmed, ""),
        };
        let closers: String = stack
            .iter()
            .rev()
            .map(|c| match c {
                '(' => ')',
                '[' => ']',
                _ => '}',
            })
            .collect();
        format!("{head}{closers}{colon}")
    } else {
        return None;
    };

    if comment.is_empty() {
        Some(body)
    } else {
        Some(format!("{body}  {comment}"))
    }
}

fn realign_indent(line: &str, lines: &[&str], idx: usize) -> Option<String> {
    let current = python::leading_whitespace(line);
    let previous = lines[..idx]
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))?;
    let prev_ws = python::leading_whitespace(previous);
    if previous.trim_end().ends_with(':') {
        let unit = python::indent_unit(&lines.join("\n"));
        let target = format!("{prev_ws}{unit}");
        (target != current).then(|| format!("{target}{}", line.trim_start()))
    } else {
        (prev_ws != current).then(|| format!("{prev_ws}{}", line.trim_start()))
    }
}
