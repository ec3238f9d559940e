//! Mock implementations of the production seams.
//!
//! These provide controllable test doubles for the external collaborators
//! (check suite, module resolution, generation service, version control,
//! workspace acquisition), enabling deterministic tests of the full loop.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::diagnostics::{CheckOutput, CheckSuite, ModuleResolver};
use crate::error::HealError;
use crate::generative::{Credential, GenerationService, ServiceError};
use crate::publish::{VcsFactory, VersionControl};
use crate::workspace::{Workspace, WorkspaceManager};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ============================================================================
// Check Suite
// ============================================================================

/// Check suite that replays scripted outputs; the last one repeats.
#[derive(Debug)]
pub struct ScriptedCheckSuite {
    outputs: Mutex<VecDeque<CheckOutput>>,
    runs: Mutex<u32>,
}

impl ScriptedCheckSuite {
    #[must_use]
    pub fn new(outputs: Vec<CheckOutput>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into()),
            runs: Mutex::new(0),
        }
    }

    /// A suite that always passes.
    #[must_use]
    pub fn passing() -> Self {
        Self::new(vec![CheckOutput::passed("1 passed")])
    }

    #[must_use]
    pub fn runs(&self) -> u32 {
        *lock(&self.runs)
    }
}

impl CheckSuite for ScriptedCheckSuite {
    fn run(&self, _project_dir: &Path) -> Result<CheckOutput> {
        *lock(&self.runs) += 1;
        let mut outputs = lock(&self.outputs);
        let output = if outputs.len() > 1 {
            outputs.pop_front()
        } else {
            outputs.front().cloned()
        };
        Ok(output.unwrap_or_else(|| CheckOutput::passed("")))
    }
}

// ============================================================================
// Module Resolution
// ============================================================================

/// Resolver with a fixed set of importable modules.
#[derive(Debug, Clone)]
pub struct StaticModuleResolver {
    known: BTreeSet<String>,
    available: bool,
}

impl StaticModuleResolver {
    /// Only `known` modules (and local ones) resolve.
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: known.into_iter().map(Into::into).collect(),
            available: true,
        }
    }

    /// A resolver whose interpreter cannot be started.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            known: BTreeSet::new(),
            available: false,
        }
    }
}

impl ModuleResolver for StaticModuleResolver {
    fn unresolved(
        &self,
        _project_dir: &Path,
        modules: &BTreeSet<String>,
    ) -> Result<Option<BTreeSet<String>>> {
        if !self.available {
            return Ok(None);
        }
        Ok(Some(
            modules
                .iter()
                .filter(|m| !self.known.contains(*m))
                .cloned()
                .collect(),
        ))
    }
}

// ============================================================================
// Generation Service
// ============================================================================

/// Generation service that replays scripted results and records which
/// credential each call used.
#[derive(Debug, Default)]
pub struct MockGenerationService {
    responses: Mutex<VecDeque<Result<String, ServiceError>>>,
    fallback: Option<Result<String, ServiceError>>,
    calls: Mutex<Vec<String>>,
}

impl MockGenerationService {
    /// Replay `responses` in order; afterwards every call is an invalid response.
    #[must_use]
    pub fn new(responses: Vec<Result<String, ServiceError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Answer every call with `response`.
    #[must_use]
    pub fn always(response: Result<String, ServiceError>) -> Self {
        Self {
            fallback: Some(response),
            ..Self::default()
        }
    }

    /// Labels of the credentials used, one per call.
    #[must_use]
    pub fn credentials_used(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl GenerationService for MockGenerationService {
    async fn generate(
        &self,
        _prompt: &str,
        credential: &Credential,
    ) -> Result<String, ServiceError> {
        lock(&self.calls).push(credential.label().to_string());
        let scripted = lock(&self.responses).pop_front();
        scripted
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| {
                Err(ServiceError::InvalidResponse {
                    message: "no scripted response".to_string(),
                })
            })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ============================================================================
// Version Control
// ============================================================================

/// A commit recorded by [`MockVersionControl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCommit {
    pub hash: String,
    pub branch: String,
    pub files: Vec<PathBuf>,
    pub message: String,
}

#[derive(Debug)]
struct VcsState {
    current: String,
    branches: Vec<String>,
    created: Vec<String>,
    commits: Vec<MockCommit>,
    pushes: Vec<(String, String)>,
}

/// In-memory version control. Clones share state, so a test can keep a
/// handle while the code under test owns another.
#[derive(Debug, Clone)]
pub struct MockVersionControl {
    state: Arc<Mutex<VcsState>>,
    push_error: Option<String>,
    remote_url: Option<String>,
}

impl Default for MockVersionControl {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(VcsState {
                current: "main".to_string(),
                branches: vec!["main".to_string()],
                created: Vec::new(),
                commits: Vec::new(),
                pushes: Vec::new(),
            })),
            push_error: None,
            remote_url: None,
        }
    }
}

impl MockVersionControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every push fail with `error`.
    #[must_use]
    pub fn with_push_error(mut self, error: &str) -> Self {
        self.push_error = Some(error.to_string());
        self
    }

    /// URL reported for any remote.
    #[must_use]
    pub fn with_remote_url(mut self, url: &str) -> Self {
        self.remote_url = Some(url.to_string());
        self
    }

    /// A factory handing out clones of this mock.
    #[must_use]
    pub fn factory(&self) -> VcsFactory {
        let vcs = self.clone();
        Arc::new(move |_dir: &Path| Arc::new(vcs.clone()) as Arc<dyn VersionControl>)
    }

    #[must_use]
    pub fn branches_created(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    #[must_use]
    pub fn commits(&self) -> Vec<MockCommit> {
        lock(&self.state).commits.clone()
    }

    /// `(target, refspec)` of every successful push.
    #[must_use]
    pub fn pushes(&self) -> Vec<(String, String)> {
        lock(&self.state).pushes.clone()
    }

    #[must_use]
    pub fn current(&self) -> String {
        lock(&self.state).current.clone()
    }
}

impl VersionControl for MockVersionControl {
    fn current_branch(&self) -> crate::error::Result<String> {
        Ok(self.current())
    }

    fn branch_exists(&self, branch: &str) -> crate::error::Result<bool> {
        Ok(lock(&self.state).branches.iter().any(|b| b == branch))
    }

    fn create_branch(&self, branch: &str) -> crate::error::Result<()> {
        let mut state = lock(&self.state);
        if state.branches.iter().any(|b| b == branch) {
            return Err(HealError::git("checkout -b", format!("{branch} already exists")));
        }
        state.branches.push(branch.to_string());
        state.created.push(branch.to_string());
        state.current = branch.to_string();
        Ok(())
    }

    fn checkout(&self, branch: &str) -> crate::error::Result<()> {
        let mut state = lock(&self.state);
        if !state.branches.iter().any(|b| b == branch) {
            return Err(HealError::git("checkout", format!("unknown branch {branch}")));
        }
        state.current = branch.to_string();
        Ok(())
    }

    fn commit(&self, files: &[PathBuf], message: &str) -> crate::error::Result<String> {
        let mut state = lock(&self.state);
        let hash = format!("{:040x}", state.commits.len() + 1);
        let commit = MockCommit {
            hash: hash.clone(),
            branch: state.current.clone(),
            files: files.to_vec(),
            message: message.to_string(),
        };
        state.commits.push(commit);
        Ok(hash)
    }

    fn remote_url(&self, _remote: &str) -> crate::error::Result<Option<String>> {
        Ok(self.remote_url.clone())
    }

    fn push(&self, target: &str, refspec: &str) -> crate::error::Result<()> {
        if let Some(error) = &self.push_error {
            return Err(HealError::git("push", error.clone()));
        }
        lock(&self.state)
            .pushes
            .push((target.to_string(), refspec.to_string()));
        Ok(())
    }
}

// ============================================================================
// Workspace Acquisition
// ============================================================================

/// Workspace manager whose acquisition always fails.
#[derive(Debug, Clone)]
pub struct FailingWorkspaceManager {
    message: String,
}

impl FailingWorkspaceManager {
    #[must_use]
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl WorkspaceManager for FailingWorkspaceManager {
    fn acquire(&self, repo_ref: &str) -> crate::error::Result<Workspace> {
        Err(HealError::clone_failure(repo_ref, self.message.clone()))
    }
}
