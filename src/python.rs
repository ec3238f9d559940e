//! Python source knowledge shared by the diagnostic passes and the fixers.
//!
//! Parsing uses the tree-sitter Python grammar. A file "re-parses" when its
//! syntax tree contains no ERROR or MISSING node.

use std::cell::RefCell;
use std::path::Path;

use tree_sitter::{Node, Parser};

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER
// ═══════════════════════════════════════════════════════════════════════════

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - a failed language load surfaces at parse time
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

/// Location and description of the first syntax problem in a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxProblem {
    /// 1-based line number.
    pub line: u32,
    /// Human readable description.
    pub message: String,
}

/// Returns true when `path` names a Python source file.
pub fn is_python_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("py"))
}

/// Parse `source` and return the first syntax problem, if any.
pub fn syntax_problem(source: &str) -> anyhow::Result<Option<SyntaxProblem>> {
    let tree = PYTHON_PARSER
        .with(|p| p.borrow_mut().parse(source, None))
        .ok_or_else(|| anyhow::anyhow!("Failed to parse Python source"))?;

    let root = tree.root_node();
    if !root.has_error() {
        return Ok(None);
    }

    let node = first_error_node(root).unwrap_or(root);
    let line = node.start_position().row as u32 + 1;
    let message = if node.is_missing() {
        format!("invalid syntax: missing '{}'", node.kind())
    } else {
        let snippet: String = source
            .lines()
            .nth(line as usize - 1)
            .unwrap_or("")
            .trim()
            .chars()
            .take(60)
            .collect();
        format!("invalid syntax near '{}'", snippet)
    };

    Ok(Some(SyntaxProblem { line, message }))
}

/// Returns true if the source parses without error nodes.
pub fn parses_cleanly(source: &str) -> bool {
    matches!(syntax_problem(source), Ok(None))
}

fn first_error_node(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() || child.is_missing() {
            if let Some(found) = first_error_node(child) {
                return Some(found);
            }
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  IMPORT STATEMENTS
// ═══════════════════════════════════════════════════════════════════════════

/// A single-line import statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportLine {
    /// `import a, b.c as d`
    Import { modules: Vec<String> },
    /// `from m import a, b as c`
    From { module: String, names: Vec<String> },
}

impl ImportLine {
    /// Parse a trimmed source line. Multi-line parenthesised imports are not
    /// recognised.
    pub fn parse(line: &str) -> Option<Self> {
        let stripped = line.split('#').next().unwrap_or("").trim();
        if let Some(rest) = stripped.strip_prefix("import ") {
            let modules = split_names(rest);
            if modules.is_empty() {
                return None;
            }
            return Some(Self::Import { modules });
        }
        if let Some(rest) = stripped.strip_prefix("from ") {
            let (module, names) = rest.split_once(" import ")?;
            let names = names.trim();
            if names.starts_with('(') && !names.ends_with(')') {
                return None;
            }
            let names = split_names(names.trim_start_matches('(').trim_end_matches(')'));
            if names.is_empty() {
                return None;
            }
            return Some(Self::From {
                module: module.trim().to_string(),
                names,
            });
        }
        None
    }

    /// Top-level module names referenced by the statement.
    pub fn top_level_modules(&self) -> Vec<String> {
        match self {
            Self::Import { modules } => modules
                .iter()
                .map(|m| binding_source(m))
                .map(|m| m.split('.').next().unwrap_or(m).to_string())
                .collect(),
            Self::From { module, .. } if module.starts_with('.') => Vec::new(),
            Self::From { module, .. } => {
                vec![module.split('.').next().unwrap_or(module).to_string()]
            }
        }
    }
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// For `a.b as c` returns `a.b`.
pub fn binding_source(entry: &str) -> &str {
    entry.split(" as ").next().unwrap_or(entry).trim()
}

/// The name an import entry binds: `a.b as c` binds `c`, `a.b` binds `a.b`.
pub fn bound_name(entry: &str) -> &str {
    match entry.split_once(" as ") {
        Some((_, alias)) => alias.trim(),
        None => entry.trim(),
    }
}

/// Index (0-based) after the module's leading docstring, comments,
/// `__future__` imports and top-level import block.
pub fn import_insertion_index(lines: &[&str]) -> usize {
    let mut idx = 0;
    let mut insert_at = 0;
    let mut in_docstring: Option<&str> = None;

    while idx < lines.len() {
        let trimmed = lines[idx].trim();
        if let Some(quote) = in_docstring {
            if trimmed.contains(quote) {
                in_docstring = None;
                insert_at = idx + 1;
            }
            idx += 1;
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            idx += 1;
            continue;
        }
        if idx == insert_at && (trimmed.starts_with("\"\"\"") || trimmed.starts_with("'''")) {
            let quote = &trimmed[..3];
            let closes_inline = trimmed.len() > 3 && trimmed[3..].contains(quote);
            if !closes_inline {
                in_docstring = Some(quote);
            } else {
                insert_at = idx + 1;
            }
            idx += 1;
            continue;
        }
        if !lines[idx].starts_with(char::is_whitespace) && ImportLine::parse(trimmed).is_some() {
            insert_at = idx + 1;
            idx += 1;
            continue;
        }
        break;
    }

    insert_at
}

// ═══════════════════════════════════════════════════════════════════════════
//  KNOWN SYMBOLS
// ═══════════════════════════════════════════════════════════════════════════

/// Standard-library modules commonly referenced without being imported.
pub const KNOWN_MODULES: &[&str] = &[
    "abc", "argparse", "asyncio", "base64", "collections", "copy", "csv", "dataclasses",
    "datetime", "decimal", "enum", "fractions", "functools", "glob", "hashlib", "heapq", "io",
    "itertools", "json", "logging", "math", "operator", "os", "pathlib", "pickle", "random", "re",
    "shutil", "statistics", "string", "subprocess", "sys", "tempfile", "textwrap", "threading",
    "time", "typing", "unittest", "uuid",
];

/// Well-known exported names and the module that provides them.
pub const KNOWN_SYMBOLS: &[(&str, &str)] = &[
    ("Any", "typing"),
    ("Callable", "typing"),
    ("Dict", "typing"),
    ("Iterable", "typing"),
    ("List", "typing"),
    ("Optional", "typing"),
    ("Set", "typing"),
    ("Tuple", "typing"),
    ("Union", "typing"),
    ("Counter", "collections"),
    ("OrderedDict", "collections"),
    ("defaultdict", "collections"),
    ("deque", "collections"),
    ("namedtuple", "collections"),
    ("Path", "pathlib"),
    ("dataclass", "dataclasses"),
    ("field", "dataclasses"),
    ("Decimal", "decimal"),
    ("Enum", "enum"),
    ("reduce", "functools"),
    ("partial", "functools"),
    ("wraps", "functools"),
    ("sqrt", "math"),
    ("floor", "math"),
    ("ceil", "math"),
];

/// The import statement that would bind `name`, if it is a known symbol.
pub fn import_for_symbol(name: &str) -> Option<String> {
    if KNOWN_MODULES.contains(&name) {
        return Some(format!("import {name}"));
    }
    KNOWN_SYMBOLS
        .iter()
        .find(|(symbol, _)| *symbol == name)
        .map(|(symbol, module)| format!("from {module} import {symbol}"))
}

/// Extract `X` from `NameError: name 'X' is not defined`.
pub fn undefined_name(message: &str) -> Option<&str> {
    let start = message.find("name '")? + "name '".len();
    let rest = &message[start..];
    let end = rest.find('\'')?;
    let tail = &rest[end..];
    if tail.contains("is not defined") {
        Some(&rest[..end])
    } else {
        None
    }
}

/// Extract the module name from `No module named 'x.y'`.
pub fn missing_module(message: &str) -> Option<&str> {
    let start = message.find("No module named '")? + "No module named '".len();
    let rest = &message[start..];
    rest.find('\'').map(|end| &rest[..end])
}

// ═══════════════════════════════════════════════════════════════════════════
//  INDENTATION
// ═══════════════════════════════════════════════════════════════════════════

/// Leading whitespace of a line.
pub fn leading_whitespace(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - trimmed.len()]
}

/// The file's prevailing indentation unit.
///
/// Tabs win when most indented lines start with a tab; otherwise the most
/// common positive increase in leading spaces between consecutive code
/// lines, defaulting to four spaces.
pub fn indent_unit(source: &str) -> String {
    let mut tab_lines = 0usize;
    let mut space_lines = 0usize;
    let mut deltas = std::collections::BTreeMap::<usize, usize>::new();
    let mut previous = 0usize;

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let ws = leading_whitespace(line);
        if ws.starts_with('\t') {
            tab_lines += 1;
            continue;
        }
        let width = ws.len();
        if width > 0 {
            space_lines += 1;
        }
        if width > previous {
            *deltas.entry(width - previous).or_default() += 1;
        }
        previous = width;
    }

    if tab_lines > space_lines {
        return "\t".to_string();
    }

    let unit = deltas
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(width, _)| *width)
        .filter(|w| (2..=8).contains(w))
        .unwrap_or(4);
    " ".repeat(unit)
}
