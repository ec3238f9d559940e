//! The Run record and its iterations.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::apply::ApplyOutcome;
use crate::diagnostics::Diagnostic;
use crate::error::{HealError, Result};
use crate::publish::PushOutcome;
use crate::repair::FixRecord;
use crate::score::ScoreResult;

/// Unique Run identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Error)
    }

    /// Process exit code for a terminal status.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed => 1,
            Self::Pending | Self::Running | Self::Error => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a Run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ChecksPass,
    IterationLimit,
    TimeBudget,
    NoProgress,
    Cancelled,
    WorkspaceFailure,
    DiagnosticFailure,
    Unexpected,
}

impl TerminationReason {
    /// The terminal status this reason leads to.
    #[must_use]
    pub fn status(self) -> RunStatus {
        match self {
            Self::ChecksPass => RunStatus::Passed,
            Self::IterationLimit | Self::TimeBudget | Self::NoProgress => RunStatus::Failed,
            Self::Cancelled | Self::WorkspaceFailure | Self::DiagnosticFailure | Self::Unexpected => {
                RunStatus::Error
            }
        }
    }
}

/// Team and leader labels of a Run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels {
    pub team: String,
    pub leader: String,
}

/// A request to heal one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub repo_ref: String,
    pub labels: Labels,
    /// Overrides `run.maxIterations` when set.
    pub max_iterations: Option<u32>,
    /// Overrides `run.timeBudgetSecs` when set.
    pub time_budget: Option<Duration>,
}

impl RunRequest {
    #[must_use]
    pub fn new(repo_ref: impl Into<String>, team: impl Into<String>, leader: impl Into<String>) -> Self {
        Self {
            repo_ref: repo_ref.into(),
            labels: Labels {
                team: team.into(),
                leader: leader.into(),
            },
            max_iterations: None,
            time_budget: None,
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    #[must_use]
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }
}

/// One diagnose/repair/verify pass. Not changed once pushed onto a Run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    /// 1-based.
    pub index: u32,
    pub diagnostics: Vec<Diagnostic>,
    pub fixes: Vec<FixRecord>,
    pub outcome: ApplyOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushOutcome>,
    #[serde(default)]
    pub generative_exhausted: bool,
}

impl Iteration {
    #[must_use]
    pub fn applied(&self) -> usize {
        self.fixes.iter().filter(|f| f.is_applied()).count()
    }
}

/// One end-to-end healing attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub repo_ref: String,
    pub labels: Labels,
    pub branch: String,
    pub status: RunStatus,
    pub max_iterations: u32,
    pub time_budget_ms: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub iterations: Vec<Iteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminationReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreResult>,
}

impl Run {
    /// A PENDING Run.
    #[must_use]
    pub fn new(
        id: RunId,
        request: &RunRequest,
        branch: impl Into<String>,
        max_iterations: u32,
        time_budget: Duration,
    ) -> Self {
        Self {
            id,
            repo_ref: request.repo_ref.clone(),
            labels: request.labels.clone(),
            branch: branch.into(),
            status: RunStatus::Pending,
            max_iterations,
            time_budget_ms: u64::try_from(time_budget.as_millis()).unwrap_or(u64::MAX),
            started_at: Utc::now(),
            finished_at: None,
            iterations: Vec::new(),
            reason: None,
            error: None,
            score: None,
        }
    }

    #[must_use]
    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    #[must_use]
    pub fn iteration_count(&self) -> u32 {
        self.iterations.len() as u32
    }

    /// PENDING → RUNNING.
    pub fn start(&mut self) {
        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
        }
    }

    /// Record a completed iteration.
    ///
    /// # Errors
    ///
    /// Fails when the Run is terminal or already at its iteration limit.
    pub fn push_iteration(&mut self, iteration: Iteration) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.already_terminal());
        }
        if self.iteration_count() >= self.max_iterations {
            return Err(HealError::invalid_config(
                "maxIterations",
                format!("run {} already has {} iterations", self.id, self.max_iterations),
            ));
        }
        self.iterations.push(iteration);
        Ok(())
    }

    /// Move to a terminal status. Happens exactly once.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyTerminal` on a second call.
    pub fn finish(
        &mut self,
        reason: TerminationReason,
        error: Option<String>,
        score: ScoreResult,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.already_terminal());
        }
        self.status = reason.status();
        self.reason = Some(reason);
        self.error = error;
        self.finished_at = Some(Utc::now());
        self.score = Some(score);
        Ok(())
    }

    fn already_terminal(&self) -> HealError {
        HealError::AlreadyTerminal {
            run_id: self.id.to_string(),
            status: self.status.to_string(),
        }
    }

    /// Wall time from start to finish (or to now while running).
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    #[must_use]
    pub fn total_commits(&self) -> u32 {
        self.iterations
            .iter()
            .filter_map(|i| i.push.as_ref())
            .map(|p| p.commits.len() as u32)
            .sum()
    }

    #[must_use]
    pub fn total_fixes_applied(&self) -> usize {
        self.iterations.iter().map(Iteration::applied).sum()
    }

    /// Distinct failures seen across all iterations.
    #[must_use]
    pub fn total_failures(&self) -> usize {
        self.iterations
            .iter()
            .flat_map(|i| i.diagnostics.iter().map(Diagnostic::key))
            .collect::<BTreeSet<_>>()
            .len()
    }

    #[must_use]
    pub fn commit_hashes(&self) -> Vec<String> {
        self.iterations
            .iter()
            .filter_map(|i| i.push.as_ref())
            .flat_map(|p| p.commits.iter().map(|c| c.hash.clone()))
            .collect()
    }

    #[must_use]
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            repo_ref: self.repo_ref.clone(),
            branch: self.branch.clone(),
            status: self.status,
            reason: self.reason,
            iterations: self.iteration_count(),
            total_failures: self.total_failures(),
            total_fixes_applied: self.total_fixes_applied(),
            total_commits: self.total_commits(),
            commit_hashes: self.commit_hashes(),
            time_taken_secs: self.elapsed().as_secs_f64(),
            score: self.score,
            error: self.error.clone(),
        }
    }
}

/// Aggregate view of a Run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub repo_ref: String,
    pub branch: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminationReason>,
    pub iterations: u32,
    pub total_failures: usize,
    pub total_fixes_applied: usize,
    pub total_commits: u32,
    pub commit_hashes: Vec<String>,
    pub time_taken_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A point-in-time copy of a Run with its summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub summary: RunSummary,
    pub run: Run,
}

impl From<&Run> for RunSnapshot {
    fn from(run: &Run) -> Self {
        Self {
            summary: run.summary(),
            run: run.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::score;

    fn run(max: u32) -> Run {
        let request = RunRequest::new("https://example.test/r.git", "T", "L");
        Run::new(RunId::new(), &request, "T_L_AI_Fix", max, Duration::from_secs(60))
    }

    fn iteration(index: u32) -> Iteration {
        Iteration {
            index,
            diagnostics: Vec::new(),
            fixes: Vec::new(),
            outcome: ApplyOutcome::default(),
            push: None,
            generative_exhausted: false,
        }
    }

    #[test]
    fn test_finish_happens_once() {
        let mut run = run(3);
        run.start();
        assert_eq!(run.status, RunStatus::Running);
        run.finish(TerminationReason::ChecksPass, None, score(Duration::ZERO, 0))
            .unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        let err = run
            .finish(TerminationReason::Unexpected, None, score(Duration::ZERO, 0))
            .unwrap_err();
        assert!(matches!(err, HealError::AlreadyTerminal { .. }));
        assert_eq!(run.status, RunStatus::Passed);
    }

    #[test]
    fn test_iterations_capped() {
        let mut run = run(1);
        run.start();
        run.push_iteration(iteration(1)).unwrap();
        assert!(run.push_iteration(iteration(2)).is_err());
        assert_eq!(run.iteration_count(), 1);
    }

    #[test]
    fn test_reason_maps_to_status() {
        assert_eq!(TerminationReason::NoProgress.status(), RunStatus::Failed);
        assert_eq!(TerminationReason::TimeBudget.status(), RunStatus::Failed);
        assert_eq!(TerminationReason::Cancelled.status(), RunStatus::Error);
        assert_eq!(TerminationReason::WorkspaceFailure.status(), RunStatus::Error);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Passed.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::Error.exit_code(), 2);
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let run = run(2);
        let json = serde_json::to_value(run.summary()).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert!(json.get("totalFixesApplied").is_some());
    }
}
