//! Patch application with verification and revert.
//!
//! Each record is applied against the current file content, the result is
//! re-parsed, and the file is either kept (APPLIED) or restored byte for
//! byte (REJECTED). A failure on one record never aborts the batch.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::python;
use crate::repair::{FixRecord, FixStatus};
use crate::workspace::Workspace;

/// Post-apply verification tally for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub applied: usize,
    pub rejected: usize,
    /// Files changed by APPLIED records.
    pub files_changed: Vec<PathBuf>,
    /// Of the changed files, those that parse cleanly afterwards.
    pub files_verified: usize,
}

/// Applies fix records to a workspace.
#[derive(Debug, Default)]
pub struct PatchApplier;

impl PatchApplier {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Apply every PROPOSED record in order, updating statuses in place.
    pub fn apply(&self, workspace: &mut Workspace, records: &mut [FixRecord]) -> ApplyOutcome {
        let mut changed = BTreeSet::new();
        for record in records.iter_mut() {
            if record.status != FixStatus::Proposed {
                continue;
            }
            match apply_one(workspace, record) {
                Ok(note) => {
                    debug!(file = %record.file.display(), "Fix applied");
                    record.mark_applied(note);
                    changed.insert(record.file.clone());
                }
                Err(reason) => {
                    warn!(file = %record.file.display(), %reason, "Fix rejected");
                    record.mark_rejected(reason);
                }
            }
        }

        let files_verified = changed
            .iter()
            .filter(|f| {
                !python::is_python_file(f)
                    || workspace
                        .read_file(f)
                        .map(|s| python::parses_cleanly(&s))
                        .unwrap_or(false)
            })
            .count();

        let outcome = ApplyOutcome {
            applied: records.iter().filter(|r| r.is_applied()).count(),
            rejected: records
                .iter()
                .filter(|r| r.status == FixStatus::Rejected)
                .count(),
            files_changed: changed.into_iter().collect(),
            files_verified,
        };
        info!(
            applied = outcome.applied,
            rejected = outcome.rejected,
            "Patch batch complete"
        );
        outcome
    }
}

fn digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Apply one record. `Ok` carries an optional note; `Err` the rejection reason.
fn apply_one(workspace: &mut Workspace, record: &FixRecord) -> Result<Option<String>, String> {
    if record.file != record.diagnostic.file {
        return Err("target file differs from the diagnostic's file".to_string());
    }
    if !workspace.contains_file(&record.file) {
        return Err(format!("{} is not a file in the workspace", record.file.display()));
    }

    let original = workspace
        .read_file(&record.file)
        .map_err(|e| format!("read failed: {e}"))?;
    let applied = record
        .patch
        .apply_to(&original)
        .map_err(|e| e.to_string())?;
    if digest(&applied.content) == digest(&original) {
        return Err("patch makes no change".to_string());
    }

    workspace
        .write_file(&record.file, &applied.content)
        .map_err(|e| format!("write failed: {e}"))?;

    if python::is_python_file(&record.file) {
        if let Ok(Some(problem)) = python::syntax_problem(&applied.content) {
            restore(workspace, record, &original)?;
            return Err(format!(
                "result does not parse (line {}: {})",
                problem.line, problem.message
            ));
        }
    }

    let stated = record.patch.line_range().map(|(start, _)| start);
    Ok(match (stated, applied.line) {
        (Some(s), Some(actual)) if s != actual => Some(format!("relocated to line {actual}")),
        _ => None,
    })
}

fn restore(workspace: &mut Workspace, record: &FixRecord, original: &str) -> Result<(), String> {
    workspace.write_file(&record.file, original).map_err(|e| {
        format!("revert of {} failed: {e}", record.file.display())
    })?;
    let current = workspace.read_file(&record.file).map_err(|e| e.to_string())?;
    if digest(&current) != digest(original) {
        return Err(format!("{} could not be restored", record.file.display()));
    }
    Ok(())
}
