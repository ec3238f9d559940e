//! LINTING: remove an unused import.

use super::imports::needs_placeholder;
use super::{Fix, FixContext, Patch};
use crate::diagnostics::Diagnostic;
use crate::python::{self, ImportLine};

pub(crate) fn fix(diagnostic: &Diagnostic, source: &str, _ctx: &FixContext) -> Option<Fix> {
    let name = unused_name(&diagnostic.message)?;
    let line = diagnostic.line?;
    let lines: Vec<&str> = source.lines().collect();
    let idx = (line as usize).checked_sub(1)?;
    let text = *lines.get(idx)?;
    let indent = python::leading_whitespace(text);

    let patch = match ImportLine::parse(text)? {
        ImportLine::Import { modules } => {
            let kept: Vec<&str> = modules
                .iter()
                .map(String::as_str)
                .filter(|entry| !entry_matches(entry, name, None))
                .collect();
            if kept.len() == modules.len() {
                return None;
            }
            rebuild(line, text, &lines, idx, kept, |kept| {
                format!("{indent}import {}", kept.join(", "))
            })
        }
        ImportLine::From { module, names } => {
            let kept: Vec<&str> = names
                .iter()
                .map(String::as_str)
                .filter(|entry| !entry_matches(entry, name, Some(module.as_str())))
                .collect();
            if kept.len() == names.len() {
                return None;
            }
            rebuild(line, text, &lines, idx, kept, |kept| {
                format!("{indent}from {module} import {}", kept.join(", "))
            })
        }
    };

    Some(Fix {
        patch,
        description: format!("remove unused import `{name}`"),
    })
}

fn rebuild(
    line: u32,
    text: &str,
    lines: &[&str],
    idx: usize,
    kept: Vec<&str>,
    render: impl FnOnce(&[&str]) -> String,
) -> Patch {
    if !kept.is_empty() {
        return Patch::replace_line(line, text, render(&kept));
    }
    if needs_placeholder(lines, idx) {
        Patch::replace_line(line, text, format!("{}pass", python::leading_whitespace(text)))
    } else {
        Patch::delete_line(line, text)
    }
}

/// The name quoted in `'os' imported but unused` (flake8) or
/// `` `os` imported but unused `` (ruff).
fn unused_name(message: &str) -> Option<&str> {
    let start = message.find(['\'', '`'])?;
    let quote = message[start..].chars().next()?;
    let rest = &message[start + 1..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}

/// Whether an import entry is the one the linter named.
///
/// Names may be reported as `typing.List`, `numpy as np` or just `os`.
fn entry_matches(entry: &str, reported: &str, from_module: Option<&str>) -> bool {
    let reported_source = python::binding_source(reported);
    let qualified = match from_module {
        Some(module) => format!("{module}.{}", python::binding_source(entry)),
        None => python::binding_source(entry).to_string(),
    };
    entry.trim() == reported.trim()
        || qualified == reported_source
        || python::bound_name(entry) == reported_source
        || python::binding_source(entry) == reported_source
}
