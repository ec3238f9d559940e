//! Testing infrastructure for mend.
//!
//! - **Mocks**: controllable doubles for the check suite, module resolution,
//!   the generation service, version control and workspace acquisition
//! - **Fixtures**: temporary Python projects (test-only)
//!
//! # Example
//!
//! ```rust,ignore
//! use mend::testing::mocks::{MockGenerationService, MockVersionControl};
//!
//! let vcs = MockVersionControl::new().with_push_error("remote rejected");
//! let service = MockGenerationService::always(Ok(r#"{"fixes": []}"#.to_string()));
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;

#[cfg(test)]
pub use fixtures::PythonFixture;
pub use mocks::{
    FailingWorkspaceManager, MockCommit, MockGenerationService, MockVersionControl,
    ScriptedCheckSuite, StaticModuleResolver,
};
