//! Repair records and the deterministic repair engine.
//!
//! Every deterministic category is bound to one pure fixer function:
//! given the same diagnostic, file content and [`FixContext`], a fixer
//! always returns the same patch and never touches the network or the
//! filesystem. Application is left to the [`crate::apply::PatchApplier`].

mod imports;
mod indent;
mod lint;
pub mod patch;
mod syntax;

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use patch::{Applied, Patch, PatchError};

use crate::diagnostics::imports::local_modules;
use crate::diagnostics::{BugCategory, Diagnostic};
use crate::workspace::Workspace;

// ============================================================================
// Fix Records
// ============================================================================

/// Which repair path produced a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixOrigin {
    Deterministic,
    Generative,
}

/// Lifecycle of a fix record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixStatus {
    Proposed,
    Applied,
    Rejected,
}

/// A proposed or applied correction addressing one diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRecord {
    pub diagnostic: Diagnostic,
    /// Always equal to `diagnostic.file`.
    pub file: PathBuf,
    pub patch: Patch,
    pub origin: FixOrigin,
    pub status: FixStatus,
    pub description: String,
    /// Unified-diff rendering of the patch against the original content.
    #[serde(default)]
    pub diff: String,
    /// Rejection reason, or the line a relocated patch landed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl FixRecord {
    /// Create a PROPOSED record targeting the diagnostic's file.
    #[must_use]
    pub fn proposed(
        diagnostic: &Diagnostic,
        patch: Patch,
        origin: FixOrigin,
        description: impl Into<String>,
    ) -> Self {
        Self {
            file: diagnostic.file.clone(),
            diagnostic: diagnostic.clone(),
            patch,
            origin,
            status: FixStatus::Proposed,
            description: description.into(),
            diff: String::new(),
            note: None,
        }
    }

    /// Render the diff against the file's current content.
    #[must_use]
    pub fn with_diff_against(mut self, original: &str) -> Self {
        self.diff = self.patch.unified_diff(&self.file, original);
        self
    }

    #[must_use]
    pub fn category(&self) -> BugCategory {
        self.diagnostic.category
    }

    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.status == FixStatus::Applied
    }

    /// Mark APPLIED. Only valid from PROPOSED.
    pub fn mark_applied(&mut self, note: Option<String>) {
        if self.status == FixStatus::Proposed {
            self.status = FixStatus::Applied;
            self.note = note;
        }
    }

    /// Mark REJECTED. Only valid from PROPOSED.
    pub fn mark_rejected(&mut self, reason: impl Into<String>) {
        if self.status == FixStatus::Proposed {
            self.status = FixStatus::Rejected;
            self.note = Some(reason.into());
        }
    }
}

// ============================================================================
// Deterministic Engine
// ============================================================================

/// Output of a fixer: the patch and a short human description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fix {
    pub patch: Patch,
    pub description: String,
}

/// Read-only facts about the workspace that fixers may consult.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixContext {
    /// Importable names provided by the workspace itself.
    pub local_modules: BTreeSet<String>,
}

impl FixContext {
    /// Gather context from a workspace.
    #[must_use]
    pub fn from_workspace(workspace: &Workspace) -> Self {
        let local_modules = local_modules(workspace.root()).unwrap_or_else(|e| {
            warn!("Could not list local modules: {}", e);
            BTreeSet::new()
        });
        Self { local_modules }
    }
}

/// A pure fixer: diagnostic + file content → patch, or "cannot resolve".
pub type Fixer = fn(&Diagnostic, &str, &FixContext) -> Option<Fix>;

/// The fixer bound to a category, if the category is deterministic.
#[must_use]
pub fn fixer_for(category: BugCategory) -> Option<Fixer> {
    match category {
        BugCategory::Syntax => Some(syntax::fix),
        BugCategory::Import => Some(imports::fix),
        BugCategory::Linting => Some(lint::fix),
        BugCategory::Indentation => Some(indent::fix),
        BugCategory::Logic | BugCategory::TypeError => None,
    }
}

/// Runs the per-category fixers over a diagnostic list.
#[derive(Debug, Default)]
pub struct DeterministicEngine;

impl DeterministicEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Propose fixes for every deterministic diagnostic that can be
    /// confidently resolved.
    ///
    /// Records are ordered by category priority (SYNTAX first), then file
    /// and line. Within one file, a fix whose line range overlaps an earlier
    /// fix is dropped; its diagnostic stays outstanding for the next pass.
    #[must_use]
    pub fn attempt(&self, diagnostics: &[Diagnostic], workspace: &Workspace) -> Vec<FixRecord> {
        let ctx = FixContext::from_workspace(workspace);
        let mut ordered: Vec<&Diagnostic> = diagnostics
            .iter()
            .filter(|d| d.category.is_deterministic())
            .collect();
        ordered.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then(a.file.cmp(&b.file))
                .then(a.line.cmp(&b.line))
        });

        let mut records: Vec<FixRecord> = Vec::new();
        for diagnostic in ordered {
            let Some(fixer) = fixer_for(diagnostic.category) else {
                continue;
            };
            let Ok(source) = workspace.read_file(&diagnostic.file) else {
                debug!(file = %diagnostic.file.display(), "Unreadable file, skipping");
                continue;
            };
            let Some(fix) = fixer(diagnostic, &source, &ctx) else {
                debug!(
                    location = %diagnostic.location(),
                    category = %diagnostic.category,
                    "No confident deterministic fix"
                );
                continue;
            };
            if records
                .iter()
                .any(|r| r.file == diagnostic.file && conflicts(&r.patch, &fix.patch))
            {
                continue;
            }
            records.push(
                FixRecord::proposed(diagnostic, fix.patch, FixOrigin::Deterministic, fix.description)
                    .with_diff_against(&source),
            );
        }
        records
    }
}

/// Two patches to the same file conflict when identical or overlapping.
pub(crate) fn conflicts(a: &Patch, b: &Patch) -> bool {
    if a == b {
        return true;
    }
    match (a.line_range(), b.line_range()) {
        (Some((a0, a1)), Some((b0, b1))) => a0 <= b1 && b0 <= a1,
        _ => true,
    }
}
