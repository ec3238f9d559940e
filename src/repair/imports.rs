//! IMPORT: insert a missing import or correct a broken one.

use super::{Fix, FixContext, Patch};
use crate::diagnostics::Diagnostic;
use crate::python::{self, ImportLine};

/// Minimum Jaro-Winkler similarity for renaming a misspelled module.
const RENAME_SIMILARITY: f64 = 0.88;

pub(crate) fn fix(diagnostic: &Diagnostic, source: &str, ctx: &FixContext) -> Option<Fix> {
    if let Some(name) = python::undefined_name(&diagnostic.message) {
        return insert_import(name, source);
    }
    let module = python::missing_module(&diagnostic.message)?;
    correct_import(module, diagnostic.line, source, ctx)
}

fn insert_import(name: &str, source: &str) -> Option<Fix> {
    let statement = python::import_for_symbol(name)?;
    let lines: Vec<&str> = source.lines().collect();
    if lines.iter().any(|l| l.trim() == statement) {
        return None;
    }
    let at = python::import_insertion_index(&lines);
    Some(Fix {
        patch: Patch::insert(at as u32 + 1, vec![statement.clone()]),
        description: format!("insert `{statement}`"),
    })
}

fn correct_import(module: &str, line: Option<u32>, source: &str, ctx: &FixContext) -> Option<Fix> {
    let top = module.split('.').next().unwrap_or(module);
    let lines: Vec<&str> = source.lines().collect();

    let references = |idx: usize| {
        ImportLine::parse(lines[idx]).is_some_and(|i| i.top_level_modules().iter().any(|m| m == top))
    };
    let idx = line
        .map(|l| l as usize)
        .filter(|&l| l >= 1 && l <= lines.len() && references(l - 1))
        .map(|l| l - 1)
        .or_else(|| (0..lines.len()).find(|&i| references(i)))?;

    let text = lines[idx];
    let line_no = idx as u32 + 1;

    if let Some(replacement) = closest_module(top, ctx) {
        let rewritten = rename_module(text, top, &replacement)?;
        return Some(Fix {
            patch: Patch::replace_line(line_no, text, rewritten),
            description: format!("rename module `{top}` to `{replacement}`"),
        });
    }

    let remaining = without_module(text, top);
    let patch = match remaining {
        Some(rest) => Patch::replace_line(line_no, text, rest),
        None if needs_placeholder(&lines, idx) => {
            Patch::replace_line(line_no, text, format!("{}pass", python::leading_whitespace(text)))
        }
        None => Patch::delete_line(line_no, text),
    };
    Some(Fix {
        patch,
        description: format!("remove import of unavailable module `{top}`"),
    })
}

/// A known or local module whose name is very close to `name`.
fn closest_module(name: &str, ctx: &FixContext) -> Option<String> {
    python::KNOWN_MODULES
        .iter()
        .map(|m| m.to_string())
        .chain(ctx.local_modules.iter().cloned())
        .filter(|m| m != name)
        .map(|m| (strsim::jaro_winkler(name, &m), m))
        .filter(|(score, _)| *score >= RENAME_SIMILARITY)
        .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .map(|(_, m)| m)
}

/// Replace the top-level module name `from` with `to` in an import line.
fn rename_module(line: &str, from: &str, to: &str) -> Option<String> {
    let indent = python::leading_whitespace(line);
    match ImportLine::parse(line)? {
        ImportLine::Import { modules } => {
            let renamed: Vec<String> = modules
                .iter()
                .map(|entry| rename_entry(entry, from, to))
                .collect();
            Some(format!("{indent}import {}", renamed.join(", ")))
        }
        ImportLine::From { module, names } => Some(format!(
            "{indent}from {} import {}",
            rename_entry(&module, from, to),
            names.join(", ")
        )),
    }
}

fn rename_entry(entry: &str, from: &str, to: &str) -> String {
    let source = python::binding_source(entry);
    let rest = &source[source.find('.').unwrap_or(source.len())..];
    let head = source.split('.').next().unwrap_or(source);
    if head != from {
        return entry.to_string();
    }
    match entry.split_once(" as ") {
        Some((_, alias)) => format!("{to}{rest} as {}", alias.trim()),
        None => format!("{to}{rest}"),
    }
}

/// The line with every entry of module `top` removed, or `None` when
/// nothing would be left.
fn without_module(line: &str, top: &str) -> Option<String> {
    let indent = python::leading_whitespace(line);
    match ImportLine::parse(line)? {
        ImportLine::Import { modules } => {
            let kept: Vec<&String> = modules
                .iter()
                .filter(|m| python::binding_source(m).split('.').next() != Some(top))
                .collect();
            if kept.is_empty() {
                None
            } else {
                let kept: Vec<&str> = kept.iter().map(|s| s.as_str()).collect();
                Some(format!("{indent}import {}", kept.join(", ")))
            }
        }
        ImportLine::From { .. } => None,
    }
}

/// True when removing line `idx` would leave an empty indented block.
pub(crate) fn needs_placeholder(lines: &[&str], idx: usize) -> bool {
    let indent = python::leading_whitespace(lines[idx]).len();
    if indent == 0 {
        return false;
    }
    let is_code = |l: &&str| !l.trim().is_empty() && !l.trim_start().starts_with('#');
    let opens_block = lines[..idx]
        .iter()
        .copied()
        .rev()
        .find(is_code)
        .is_some_and(|p| p.trim_end().ends_with(':'));
    let next_in_block = lines[idx + 1..]
        .iter()
        .copied()
        .find(is_code)
        .is_some_and(|n| python::leading_whitespace(n).len() >= indent);
    opens_block && !next_in_block
}
