//! Mapping raw findings to bug categories.
//!
//! Static pass findings map directly: parse failure → SYNTAX, unresolved
//! module → IMPORT, unused import → LINTING, whitespace → INDENTATION.
//! Check-command failures are classified from their message. LOGIC versus
//! TYPE_ERROR is heuristic; the vocabularies and the category used when a
//! message matches both are a [`ClassificationPolicy`] knob.

use super::{BugCategory, Diagnostic, FindingKind, RawFinding};
use crate::config::DiagnosticsConfig;
use crate::python;

/// Phrases that mark a type mismatch.
pub const DEFAULT_TYPE_VOCABULARY: &[&str] = &[
    "TypeError",
    "unsupported operand type",
    "can only concatenate",
    "can't multiply sequence",
    "not subscriptable",
    "is not callable",
    "is not iterable",
    "object of type",
    "must be str",
    "must be int",
    "positional argument",
    "unexpected keyword argument",
];

/// Phrases that mark a plain assertion/value failure.
pub const DEFAULT_ASSERTION_VOCABULARY: &[&str] = &["AssertionError", "assert "];

/// Policy for the LOGIC/TYPE_ERROR heuristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationPolicy {
    pub type_vocabulary: Vec<String>,
    pub assertion_vocabulary: Vec<String>,
    /// Category used when a message matches both vocabularies.
    pub ambiguous: BugCategory,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            type_vocabulary: DEFAULT_TYPE_VOCABULARY.iter().map(|s| s.to_string()).collect(),
            assertion_vocabulary: DEFAULT_ASSERTION_VOCABULARY
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ambiguous: BugCategory::Logic,
        }
    }
}

impl ClassificationPolicy {
    #[must_use]
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self {
            type_vocabulary: config.type_error_vocabulary.clone(),
            assertion_vocabulary: config.assertion_vocabulary.clone(),
            ambiguous: config.ambiguous_category,
        }
    }

    /// Use `category` for messages matching both vocabularies.
    #[must_use]
    pub fn with_ambiguous(mut self, category: BugCategory) -> Self {
        self.ambiguous = category;
        self
    }
}

/// Maps each finding to a [`BugCategory`].
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    policy: ClassificationPolicy,
}

impl Classifier {
    #[must_use]
    pub fn new(policy: ClassificationPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &ClassificationPolicy {
        &self.policy
    }

    /// Classify every finding.
    #[must_use]
    pub fn classify(&self, findings: &[RawFinding]) -> Vec<Diagnostic> {
        findings
            .iter()
            .map(|f| Diagnostic {
                file: f.file.clone(),
                line: f.line,
                category: self.category_of(f),
                message: f.message.clone(),
                context: f.context.clone(),
                code: f.code.clone(),
            })
            .collect()
    }

    /// Category for one finding.
    #[must_use]
    pub fn category_of(&self, finding: &RawFinding) -> BugCategory {
        match finding.kind {
            FindingKind::ParseFailure => BugCategory::Syntax,
            FindingKind::UnresolvedModule => BugCategory::Import,
            FindingKind::UnusedImport => BugCategory::Linting,
            FindingKind::Whitespace => BugCategory::Indentation,
            FindingKind::CheckFailure => self.check_failure_category(&finding.message),
        }
    }

    fn check_failure_category(&self, message: &str) -> BugCategory {
        if ["SyntaxError", "IndentationError", "TabError"]
            .iter()
            .any(|k| message.contains(k))
        {
            return BugCategory::Syntax;
        }
        if python::missing_module(message).is_some()
            || message.contains("ImportError")
            || message.contains("ModuleNotFoundError")
        {
            return BugCategory::Import;
        }
        if python::undefined_name(message).is_some_and(|n| python::import_for_symbol(n).is_some()) {
            return BugCategory::Import;
        }

        let typed = matches_any(message, &self.policy.type_vocabulary);
        let asserted = matches_any(message, &self.policy.assertion_vocabulary);
        match (typed, asserted) {
            (true, true) => self.policy.ambiguous,
            (true, false) => BugCategory::TypeError,
            _ => BugCategory::Logic,
        }
    }
}

fn matches_any(message: &str, vocabulary: &[String]) -> bool {
    vocabulary
        .iter()
        .any(|v| !v.is_empty() && message.contains(v.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(message: &str) -> RawFinding {
        RawFinding::new(FindingKind::CheckFailure, "src/calc.py", message)
    }

    #[test]
    fn test_static_kinds_map_directly() {
        let c = Classifier::default();
        let cases = [
            (FindingKind::ParseFailure, BugCategory::Syntax),
            (FindingKind::UnresolvedModule, BugCategory::Import),
            (FindingKind::UnusedImport, BugCategory::Linting),
            (FindingKind::Whitespace, BugCategory::Indentation),
        ];
        for (kind, expected) in cases {
            assert_eq!(c.category_of(&RawFinding::new(kind, "a.py", "x")), expected);
        }
    }

    #[test]
    fn test_check_failures() {
        let c = Classifier::default();
        assert_eq!(
            c.category_of(&check("SyntaxError: expected ':'")),
            BugCategory::Syntax
        );
        assert_eq!(
            c.category_of(&check("ModuleNotFoundError: No module named 'numpyy'")),
            BugCategory::Import
        );
        assert_eq!(
            c.category_of(&check("NameError: name 'math' is not defined")),
            BugCategory::Import
        );
        assert_eq!(
            c.category_of(&check("NameError: name 'totl' is not defined")),
            BugCategory::Logic
        );
        assert_eq!(
            c.category_of(&check(
                "TypeError: unsupported operand type(s) for +: 'int' and 'str'"
            )),
            BugCategory::TypeError
        );
        assert_eq!(
            c.category_of(&check("AssertionError: assert -1 == 5")),
            BugCategory::Logic
        );
        assert_eq!(
            c.category_of(&check("ZeroDivisionError: division by zero")),
            BugCategory::Logic
        );
    }

    #[test]
    fn test_ambiguous_defaults_to_logic() {
        let msg = "AssertionError: assert TypeError('x') is None";
        assert_eq!(Classifier::default().category_of(&check(msg)), BugCategory::Logic);
    }

    #[test]
    fn test_ambiguous_policy_knob() {
        let msg = "AssertionError: assert TypeError('x') is None";
        let c = Classifier::new(
            ClassificationPolicy::default().with_ambiguous(BugCategory::TypeError),
        );
        assert_eq!(c.category_of(&check(msg)), BugCategory::TypeError);
    }

    #[test]
    fn test_empty_vocabulary_entries_ignored() {
        let policy = ClassificationPolicy {
            type_vocabulary: vec![String::new()],
            assertion_vocabulary: vec![],
            ambiguous: BugCategory::Logic,
        };
        assert_eq!(
            Classifier::new(policy).category_of(&check("anything")),
            BugCategory::Logic
        );
    }

    #[test]
    fn test_classify_preserves_location() {
        let finding = check("TypeError: bad").with_line(7).with_code("E1");
        let diags = Classifier::default().classify(&[finding]);
        assert_eq!(diags[0].line, Some(7));
        assert_eq!(diags[0].code.as_deref(), Some("E1"));
        assert_eq!(diags[0].category, BugCategory::TypeError);
    }
}
