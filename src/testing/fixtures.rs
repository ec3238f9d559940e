//! Temporary Python projects for tests.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::workspace::Workspace;

/// A temporary project directory. Cleaned up when dropped.
///
/// ```rust,ignore
/// let fixture = PythonFixture::new()
///     .with_file("pkg/calc.py", "def add(a, b)\n    return a + b\n");
/// let workspace = fixture.workspace();
/// ```
pub struct PythonFixture {
    temp_dir: TempDir,
}

impl PythonFixture {
    /// An empty project.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Add a file, creating parent directories.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    #[must_use]
    pub fn with_file(self, relative: &str, content: &str) -> Self {
        let path = self.temp_dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create directories");
        }
        std::fs::write(&path, content).expect("Failed to write fixture file");
        self
    }

    /// A project with one valid module and one module missing a colon.
    #[must_use]
    pub fn with_syntax_error() -> Self {
        Self::new()
            .with_file("pkg/__init__.py", "")
            .with_file("pkg/calc.py", "def add(a, b)\n    return a + b\n")
            .with_file("main.py", "from pkg.calc import add\n\nprint(add(1, 2))\n")
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The path as a repository reference.
    #[must_use]
    pub fn repo_ref(&self) -> String {
        self.path().display().to_string()
    }

    #[must_use]
    pub fn file(&self, relative: &str) -> PathBuf {
        self.path().join(relative)
    }

    /// # Panics
    ///
    /// Panics if the file cannot be read.
    #[must_use]
    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.file(relative)).expect("Failed to read fixture file")
    }

    /// Open the fixture directory in place as a workspace.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be opened.
    #[must_use]
    pub fn workspace(&self) -> Workspace {
        Workspace::open(self.path()).expect("Failed to open workspace")
    }
}

impl Default for PythonFixture {
    fn default() -> Self {
        Self::new()
    }
}
