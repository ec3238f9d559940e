//! mend - Iterative healing for Python repositories
//!
//! Acquires a repository, finds what is broken, repairs it and publishes the
//! repairs on a dedicated branch, repeating until the checks pass or a limit
//! is reached.
//!
//! # Architecture
//!
//! - [`orchestrator`] - The Run loop: diagnose, repair, apply, publish
//! - [`service`] - Single-flight Run submission and observation
//! - [`diagnostics`] - Diagnostic passes and bug classification
//! - [`repair`] - Deterministic per-category fixers
//! - [`generative`] - Model-backed repair with credential rotation
//! - [`apply`] - Patch application and re-parse verification
//! - [`publish`] - Branch, commit and push
//! - [`events`] - Ordered lifecycle events
//! - [`score`] - Run scoring
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types
//! - [`testing`] - Mocks and fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mend::{Collaborators, HealConfig, Orchestrator, RunRequest};
//! use mend::workspace::LocalCopyWorkspaceManager;
//!
//! let config = HealConfig::default();
//! let workspaces = Arc::new(LocalCopyWorkspaceManager::new(config.run.workspace_dir()));
//! let orchestrator = Orchestrator::new(config.clone(), Collaborators::from_config(&config, workspaces));
//!
//! let run = orchestrator.run(RunRequest::new("./broken-project", "Rift Raiders", "Ada")).await?;
//! println!("{} after {} iterations", run.status, run.iteration_count());
//! ```

pub mod apply;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod generative;
pub mod orchestrator;
pub mod publish;
pub mod python;
pub mod repair;
pub mod run;
pub mod score;
pub mod service;
pub mod testing;
pub mod workspace;

// Re-export commonly used types
pub use error::{HealError, IntoHealError, Result};

pub use config::{ConfigOrigin, HealConfig};

pub use diagnostics::{BugCategory, Diagnostic, DiagnosticRunner};

pub use repair::{DeterministicEngine, FixRecord, FixStatus};

pub use generative::{Credential, GenerationService, GenerativeClient, ServiceError};

pub use events::{Delivery, Event, EventBus, EventKind, EventStream};

pub use orchestrator::{CancelFlag, Collaborators, Orchestrator};

pub use run::{Run, RunId, RunRequest, RunSnapshot, RunStatus, RunSummary, TerminationReason};

pub use score::{score, ScoreResult};

pub use service::HealingService;

pub use workspace::{Workspace, WorkspaceManager};
