//! The iterative healing loop.
//!
//! One Run acquires a workspace, then repeats scan → deterministic repair →
//! generative repair → apply → publish until the checks pass or a limit is
//! hit:
//!
//! ```text
//! cancelled?            → ERROR
//! iterations used up?   → FAILED
//! time budget spent?    → FAILED
//! no diagnostics?       → PASSED
//! nothing applied?      → FAILED
//! ```
//!
//! Stages of one Run never overlap. Cancellation and the time budget are
//! checked at the top of each iteration only, so an in-flight generative
//! request always completes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{error, info, info_span, warn, Instrument};

use crate::apply::PatchApplier;
use crate::config::HealConfig;
use crate::diagnostics::{counts_by_category, Diagnostic, DiagnosticRunner};
use crate::error::{HealError, Result};
use crate::events::{EventBus, EventKind};
use crate::generative::{credentials, Credential, GenerationService, GenerativeClient, OpenAiCompatibleService};
use crate::publish::{self, git_cli_factory, RevisionPublisher, VcsFactory};
use crate::repair::{DeterministicEngine, FixRecord};
use crate::run::{Iteration, Run, RunId, RunRequest, TerminationReason};
use crate::score::score;
use crate::workspace::{Workspace, WorkspaceManager};

/// Builds a fresh [`DiagnosticRunner`] for each Run.
pub type RunnerFactory = Arc<dyn Fn() -> DiagnosticRunner + Send + Sync>;

/// Shared cancellation flag for a Run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// External collaborators of the orchestrator.
pub struct Collaborators {
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub runner: RunnerFactory,
    /// `None` disables generative repair.
    pub generation: Option<Arc<dyn GenerationService>>,
    pub credentials: Vec<Credential>,
    pub vcs: VcsFactory,
    pub push_token: Option<String>,
}

impl Collaborators {
    /// Production wiring: configured runner, HTTP service, environment
    /// credentials, `git` executable.
    #[must_use]
    pub fn from_config(config: &HealConfig, workspaces: Arc<dyn WorkspaceManager>) -> Self {
        let diagnostics = config.diagnostics.clone();
        let generation = match OpenAiCompatibleService::from_config(&config.generative) {
            Ok(service) => Some(Arc::new(service) as Arc<dyn GenerationService>),
            Err(e) => {
                warn!("Generative repair disabled: {e:#}");
                None
            }
        };
        let env = |name: &str| std::env::var(name).ok();
        Self {
            workspaces,
            runner: Arc::new(move || DiagnosticRunner::from_config(&diagnostics)),
            generation,
            credentials: credentials::from_env(&config.generative, env),
            vcs: git_cli_factory(),
            push_token: env(&config.publish.token_env).filter(|t| !t.is_empty()),
        }
    }
}

/// Drives Runs to a terminal status.
pub struct Orchestrator {
    config: HealConfig,
    collaborators: Collaborators,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: HealConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HealConfig {
        &self.config
    }

    /// Validate a request and create its PENDING Run.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unusable labels or limits.
    pub fn prepare(&self, request: &RunRequest) -> Result<Run> {
        if request.repo_ref.trim().is_empty() {
            return Err(HealError::invalid_config("repo", "must not be empty"));
        }
        let branch = publish::branch_name(
            &request.labels.team,
            &request.labels.leader,
            &self.config.publish.branch_suffix,
        )?;
        let max_iterations = request.max_iterations.unwrap_or(self.config.run.max_iterations);
        if max_iterations == 0 {
            return Err(HealError::invalid_config("maxIterations", "must be at least 1"));
        }
        let budget = request
            .time_budget
            .unwrap_or_else(|| self.config.run.time_budget());
        if budget.is_zero() {
            return Err(HealError::invalid_config("timeBudget", "must be positive"));
        }
        Ok(Run::new(RunId::new(), request, branch, max_iterations, budget))
    }

    /// Prepare and execute a Run to completion.
    ///
    /// # Errors
    ///
    /// Only request validation errors; everything after that is recorded
    /// on the returned Run.
    pub async fn run(&self, request: RunRequest) -> Result<Run> {
        let run = self.prepare(&request)?;
        let bus = Arc::new(EventBus::new(run.id.clone()));
        let shared = Arc::new(RwLock::new(run));
        self.execute(Arc::clone(&shared), bus, CancelFlag::new()).await;
        let run = read(&shared).clone();
        Ok(run)
    }

    /// Execute a prepared Run, publishing its events on `bus`.
    ///
    /// The bus is closed when the Run is terminal.
    pub async fn execute(&self, run: Arc<RwLock<Run>>, bus: Arc<EventBus>, cancel: CancelFlag) {
        let run_id = read(&run).id.clone();
        let span = info_span!("run", run_id = %run_id);
        let started = Instant::now();
        let (reason, message) = self
            .drive(&run, &bus, &cancel, started)
            .instrument(span)
            .await;
        self.terminate(&run, &bus, started, reason, message);
    }

    async fn drive(
        &self,
        run: &Arc<RwLock<Run>>,
        bus: &EventBus,
        cancel: &CancelFlag,
        started: Instant,
    ) -> (TerminationReason, Option<String>) {
        let (repo_ref, branch, max_iterations, budget) = {
            let r = read(run);
            (
                r.repo_ref.clone(),
                r.branch.clone(),
                r.max_iterations,
                r.time_budget(),
            )
        };
        bus.emit(
            EventKind::RunStarted,
            json!({
                "repoRef": repo_ref,
                "branch": branch,
                "maxIterations": max_iterations,
                "timeBudgetSecs": budget.as_secs(),
            }),
        );

        let workspaces = Arc::clone(&self.collaborators.workspaces);
        let acquired = blocking("acquire", move || workspaces.acquire(&repo_ref)).await;
        let mut workspace = match acquired.and_then(|ws| ws) {
            Ok(ws) => ws,
            Err(e) => {
                error!(error = %e, "Workspace acquisition failed");
                return (TerminationReason::WorkspaceFailure, Some(e.to_string()));
            }
        };
        write(run).start();
        bus.emit(
            EventKind::WorkspaceAcquired,
            json!({ "path": workspace.root().display().to_string() }),
        );
        info!(path = %workspace.root().display(), "Workspace acquired");

        let runner = Arc::new((self.collaborators.runner)());
        let engine = DeterministicEngine::new();
        let mut generative = self.collaborators.generation.as_ref().map(|service| {
            GenerativeClient::new(
                Arc::clone(service),
                self.collaborators.credentials.clone(),
                &self.config.generative,
            )
        });
        let mut publisher = RevisionPublisher::new(
            (self.collaborators.vcs)(workspace.root()),
            branch,
            self.config.publish.clone(),
            self.collaborators.push_token.clone(),
        );

        loop {
            let iteration = read(run).iteration_count();
            if cancel.is_cancelled() {
                return (TerminationReason::Cancelled, Some(HealError::Cancelled.to_string()));
            }
            if iteration >= max_iterations {
                return (TerminationReason::IterationLimit, None);
            }
            if started.elapsed() >= budget {
                return (TerminationReason::TimeBudget, None);
            }
            let index = iteration + 1;

            let scan_runner = Arc::clone(&runner);
            let scanned = blocking("scan", move || {
                let result = scan_runner.scan(&workspace);
                (workspace, result)
            })
            .await;
            let (returned, scanned) = match scanned {
                Ok(pair) => pair,
                Err(e) => return (TerminationReason::Unexpected, Some(e.to_string())),
            };
            workspace = returned;
            let diagnostics = match scanned {
                Ok(d) => d,
                Err(e) => {
                    error!(iteration = index, error = %e, "Diagnostic run failed");
                    return (TerminationReason::DiagnosticFailure, Some(e.to_string()));
                }
            };
            let by_category: serde_json::Map<String, Value> = counts_by_category(&diagnostics)
                .into_iter()
                .map(|(c, n)| (c.to_string(), json!(n)))
                .collect();
            bus.emit(
                EventKind::DiagnosticsFound,
                json!({
                    "iteration": index,
                    "total": diagnostics.len(),
                    "byCategory": by_category,
                }),
            );
            if diagnostics.is_empty() {
                info!(iterations = iteration, "All checks pass");
                return (TerminationReason::ChecksPass, None);
            }
            info!(iteration = index, diagnostics = diagnostics.len(), "Iteration started");

            let deterministic = engine.attempt(&diagnostics, &workspace);
            bus.emit(
                EventKind::DeterministicFixesProposed,
                json!({ "iteration": index, "count": deterministic.len(), "fixes": fix_views(&deterministic) }),
            );

            let (generated, exhausted) = self
                .generate(generative.as_mut(), &diagnostics, &deterministic, &workspace, bus, index)
                .await;

            let mut fixes = deterministic;
            fixes.extend(generated);
            let apply_result = blocking("apply", move || {
                let outcome = PatchApplier::new().apply(&mut workspace, &mut fixes);
                (workspace, fixes, outcome)
            })
            .await;
            let (returned, mut fixes, outcome) = match apply_result {
                Ok(triple) => triple,
                Err(e) => return (TerminationReason::Unexpected, Some(e.to_string())),
            };
            workspace = returned;
            bus.emit(
                EventKind::FixesApplied,
                json!({
                    "iteration": index,
                    "applied": outcome.applied,
                    "rejected": outcome.rejected,
                    "filesVerified": outcome.files_verified,
                    "fixes": fix_views(&fixes),
                }),
            );

            let push = if outcome.applied > 0 {
                let published = blocking("publish", move || {
                    let push = publisher.commit_and_push(&fixes);
                    (publisher, fixes, push)
                })
                .await;
                let (returned_publisher, returned_fixes, push) = match published {
                    Ok(triple) => triple,
                    Err(e) => return (TerminationReason::Unexpected, Some(e.to_string())),
                };
                publisher = returned_publisher;
                fixes = returned_fixes;
                bus.emit(
                    EventKind::CommitOutcome,
                    json!({ "iteration": index, "push": push }),
                );
                Some(push)
            } else {
                None
            };

            let applied = outcome.applied;
            let record = Iteration {
                index,
                diagnostics,
                fixes,
                outcome,
                push,
                generative_exhausted: exhausted,
            };
            let recorded = write(run).push_iteration(record);
            if let Err(e) = recorded {
                return (TerminationReason::Unexpected, Some(e.to_string()));
            }
            bus.emit(
                EventKind::IterationComplete,
                json!({ "iteration": index, "applied": applied }),
            );

            if applied == 0 {
                warn!(iteration = index, "No fix could be applied");
                return (TerminationReason::NoProgress, None);
            }
        }
    }

    /// Run the generative path for diagnostics the deterministic engine did
    /// not address. Returns the records and whether credentials ran out.
    async fn generate(
        &self,
        client: Option<&mut GenerativeClient>,
        diagnostics: &[Diagnostic],
        deterministic: &[FixRecord],
        workspace: &Workspace,
        bus: &EventBus,
        index: u32,
    ) -> (Vec<FixRecord>, bool) {
        let addressed: HashSet<_> = deterministic.iter().map(|r| r.diagnostic.key()).collect();
        let unresolved: Vec<Diagnostic> = diagnostics
            .iter()
            .filter(|d| d.category.is_generative() && !addressed.contains(&d.key()))
            .cloned()
            .collect();
        if unresolved.is_empty() {
            return (Vec::new(), false);
        }

        let Some(client) = client else {
            bus.emit(
                EventKind::GenerativeExhausted,
                json!({ "iteration": index, "credentials": 0, "reason": "generative repair unavailable" }),
            );
            return (Vec::new(), true);
        };

        let outcome = client.attempt(&unresolved, workspace).await;
        let report = client.report(&outcome);
        if outcome.exhausted {
            bus.emit(
                EventKind::GenerativeExhausted,
                json!({ "iteration": index, "credentials": client.pool().len(), "calls": report.calls }),
            );
        } else {
            bus.emit(
                EventKind::GenerativeFixesProposed,
                json!({ "iteration": index, "report": report, "fixes": fix_views(&outcome.records) }),
            );
        }
        (outcome.records, outcome.exhausted)
    }

    fn terminate(
        &self,
        run: &Arc<RwLock<Run>>,
        bus: &EventBus,
        started: Instant,
        reason: TerminationReason,
        message: Option<String>,
    ) {
        let mut guard = write(run);
        let result = score(started.elapsed(), guard.total_commits());
        if let Err(e) = guard.finish(reason, message, result) {
            warn!(error = %e, "Run already terminal");
            return;
        }
        let summary = guard.summary();
        drop(guard);

        info!(
            status = %summary.status,
            iterations = summary.iterations,
            fixes = summary.total_fixes_applied,
            score = result.total,
            "Run finished"
        );
        bus.emit(
            EventKind::Terminal,
            json!({
                "status": summary.status,
                "reason": summary.reason,
                "error": summary.error,
                "summary": summary,
            }),
        );
        bus.close();
    }
}

/// Run a blocking stage on the blocking pool so the event and signal tasks
/// keep running while subprocesses and file I/O are in flight.
async fn blocking<T, F>(stage: &'static str, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| HealError::Other(anyhow::anyhow!("{stage} stage did not complete: {e}")))
}

fn fix_views(fixes: &[FixRecord]) -> Vec<Value> {
    fixes
        .iter()
        .map(|f| {
            json!({
                "file": f.file.display().to_string(),
                "line": f.diagnostic.line,
                "category": f.category(),
                "origin": f.origin,
                "status": f.status,
                "description": f.description,
                "diff": f.diff,
                "note": f.note,
            })
        })
        .collect()
}

pub(crate) fn read(run: &RwLock<Run>) -> std::sync::RwLockReadGuard<'_, Run> {
    run.read().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn write(run: &RwLock<Run>) -> std::sync::RwLockWriteGuard<'_, Run> {
    run.write().unwrap_or_else(|p| p.into_inner())
}
