//! Single-flight Run submission, status and event subscription.
//!
//! A [`HealingService`] owns one slot. Submitting while the Run in the slot
//! is not yet terminal is rejected with [`HealError::RunActive`]; once it is
//! terminal the slot keeps it for status queries until the next submission.

use std::sync::{Arc, Mutex, RwLock};

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{HealError, Result};
use crate::events::{Event, EventBus, EventKind, EventStream};
use crate::orchestrator::{read, write, CancelFlag, Orchestrator};
use crate::run::{Run, RunId, RunRequest, RunSnapshot, TerminationReason};
use crate::score::score;

struct RunSlot {
    run: Arc<RwLock<Run>>,
    bus: Arc<EventBus>,
    cancel: CancelFlag,
    handle: Option<JoinHandle<()>>,
}

impl RunSlot {
    fn is_active(&self) -> bool {
        !read(&self.run).status.is_terminal()
    }
}

/// Accepts Runs one at a time and exposes their progress.
pub struct HealingService {
    orchestrator: Arc<Orchestrator>,
    slot: Mutex<Option<RunSlot>>,
}

impl HealingService {
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            slot: Mutex::new(None),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<RunSlot>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a Run in the background.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `RunActive` while another Run is in progress, or a validation error
    /// for the request.
    pub fn submit(&self, request: RunRequest) -> Result<RunId> {
        let mut slot = self.slot();
        if let Some(active) = slot.as_ref().filter(|s| s.is_active()) {
            return Err(HealError::RunActive {
                run_id: read(&active.run).id.to_string(),
            });
        }

        let run = self.orchestrator.prepare(&request)?;
        let run_id = run.id.clone();
        let shared = Arc::new(RwLock::new(run));
        let bus = Arc::new(EventBus::new(run_id.clone()));
        let cancel = CancelFlag::new();

        let orchestrator = Arc::clone(&self.orchestrator);
        let (task_run, task_bus, task_cancel) = (Arc::clone(&shared), Arc::clone(&bus), cancel.clone());
        let handle = tokio::spawn(async move {
            let inner = tokio::spawn({
                let (run, bus) = (Arc::clone(&task_run), Arc::clone(&task_bus));
                async move { orchestrator.execute(run, bus, task_cancel).await }
            });
            if let Err(e) = inner.await {
                error!(error = %e, "Run task aborted");
                abort_run(&task_run, &task_bus, &e.to_string());
            }
        });

        info!(run_id = %run_id, repo = %request.repo_ref, "Run submitted");
        *slot = Some(RunSlot {
            run: shared,
            bus,
            cancel,
            handle: Some(handle),
        });
        Ok(run_id)
    }

    /// The active or most recent Run.
    #[must_use]
    pub fn status(&self) -> Option<RunSnapshot> {
        self.slot()
            .as_ref()
            .map(|s| RunSnapshot::from(&*read(&s.run)))
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.slot().as_ref().is_some_and(RunSlot::is_active)
    }

    /// Observe events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> Option<EventStream> {
        self.slot().as_ref().map(|s| s.bus.subscribe())
    }

    /// Every event of the active or most recent Run so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.slot()
            .as_ref()
            .map(|s| s.bus.history())
            .unwrap_or_default()
    }

    /// Ask the active Run to stop at the top of its next iteration.
    /// Returns false when no Run is active.
    pub fn cancel(&self) -> bool {
        match self.slot().as_ref().filter(|s| s.is_active()) {
            Some(active) => {
                info!(run_id = %read(&active.run).id, "Cancellation requested");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for the Run in the slot to finish and return its final state.
    pub async fn wait(&self) -> Option<RunSnapshot> {
        let handle = self.slot().as_mut().and_then(|s| s.handle.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Run supervisor failed");
            }
        }
        self.status()
    }
}

/// Terminate a Run whose task died without reaching a terminal status.
fn abort_run(run: &RwLock<Run>, bus: &EventBus, message: &str) {
    let mut guard = write(run);
    let result = score(guard.elapsed(), guard.total_commits());
    if guard
        .finish(TerminationReason::Unexpected, Some(message.to_string()), result)
        .is_ok()
    {
        let summary = guard.summary();
        drop(guard);
        bus.emit(
            EventKind::Terminal,
            json!({ "status": summary.status, "reason": summary.reason, "error": message, "summary": summary }),
        );
    }
    bus.close();
}
