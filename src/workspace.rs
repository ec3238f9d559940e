//! Workspace acquisition and confined file access.
//!
//! A [`Workspace`] is an isolated local copy of the target repository. It is
//! owned by exactly one run: the handle is not `Clone`, writes need
//! `&mut Workspace`, and an exclusive advisory lock file in the workspace
//! base directory is held for as long as the handle lives.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use fs2::FileExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{HealError, Result};

/// Directories never descended into when walking a workspace.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    "node_modules",
    ".venv",
    "venv",
    "env",
    ".tox",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".eggs",
];

/// Lock file suffix for exclusive workspace ownership.
const LOCK_SUFFIX: &str = ".lock";

/// Handle to an isolated repository copy.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    repo_ref: String,
    // Held for the lifetime of the handle; released on drop.
    _lock: Option<File>,
}

impl Workspace {
    /// Open an existing directory as an unlocked workspace.
    ///
    /// Used for read-only scans of a local checkout.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(HealError::diagnostic(format!(
                "Workspace directory does not exist: {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            repo_ref: root.display().to_string(),
            _lock: None,
        })
    }

    fn locked(root: PathBuf, repo_ref: &str, lock: File) -> Self {
        Self {
            root,
            repo_ref: repo_ref.to_string(),
            _lock: Some(lock),
        }
    }

    /// Root directory of the workspace.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The repository reference this workspace was acquired from.
    #[must_use]
    pub fn repo_ref(&self) -> &str {
        &self.repo_ref
    }

    /// Resolve a workspace-relative path, rejecting anything that would
    /// escape the workspace root.
    #[must_use]
    pub fn resolve(&self, relative: &Path) -> Option<PathBuf> {
        let relative = normalize_relative(relative)?;
        Some(self.root.join(relative))
    }

    /// Returns true if `relative` names an existing file inside the workspace.
    #[must_use]
    pub fn contains_file(&self, relative: &Path) -> bool {
        self.resolve(relative).is_some_and(|p| p.is_file())
    }

    /// Convert an absolute or `./`-prefixed path reported by a tool into a
    /// clean workspace-relative path.
    #[must_use]
    pub fn relativize(&self, reported: &str) -> Option<PathBuf> {
        let reported = reported.replace('\\', "/");
        let path = Path::new(&reported);
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?.to_path_buf()
        } else {
            path.to_path_buf()
        };
        normalize_relative(&relative)
    }

    /// Read a workspace file as UTF-8 text.
    pub fn read_file(&self, relative: &Path) -> Result<String> {
        let path = self
            .resolve(relative)
            .ok_or_else(|| outside_workspace(relative))?;
        Ok(fs::read_to_string(path)?)
    }

    /// Overwrite a workspace file.
    pub fn write_file(&mut self, relative: &Path, content: &str) -> Result<()> {
        let path = self
            .resolve(relative)
            .ok_or_else(|| outside_workspace(relative))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// All Python files in the workspace, relative and sorted.
    #[must_use]
    pub fn python_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && e.file_name().to_str().is_some_and(|n| SKIP_DIRS.contains(&n)))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| crate::python::is_python_file(e.path()))
            .filter_map(|e| e.path().strip_prefix(&self.root).ok().map(Path::to_path_buf))
            .collect();
        files.sort();
        files
    }
}

fn outside_workspace(relative: &Path) -> HealError {
    HealError::fix_apply(relative, "path escapes the workspace")
}

/// Lexically normalise a relative path; `None` if it is absolute or climbs
/// above its starting point.
fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Acquires an isolated copy of a repository.
pub trait WorkspaceManager: Send + Sync {
    /// Acquire a fresh workspace for `repo_ref`.
    ///
    /// # Errors
    ///
    /// Returns [`HealError::CloneFailure`] if the reference is unreachable or
    /// invalid, or the workspace is already owned by another run.
    fn acquire(&self, repo_ref: &str) -> Result<Workspace>;
}

/// Derive the directory name for a repository reference.
///
/// `https://github.com/org/calc.git` → `calc`.
pub fn repo_dir_name(repo_ref: &str) -> Option<String> {
    let trimmed = repo_ref.trim().trim_end_matches('/');
    let last = trimmed.rsplit(['/', '\\', ':']).next()?;
    let name: String = last
        .trim_end_matches(".git")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        None
    } else {
        Some(name)
    }
}

/// Take the exclusive lock for `<base>/<name>` and clear any stale copy.
fn prepare_target(base_dir: &Path, repo_ref: &str) -> Result<(PathBuf, File)> {
    let name = repo_dir_name(repo_ref)
        .ok_or_else(|| HealError::clone_failure(repo_ref, "cannot derive a directory name"))?;

    fs::create_dir_all(base_dir)
        .map_err(|e| HealError::clone_failure(repo_ref, format!("workspace dir: {e}")))?;

    let lock_path = base_dir.join(format!(".{name}{LOCK_SUFFIX}"));
    let lock = File::create(&lock_path)
        .map_err(|e| HealError::clone_failure(repo_ref, format!("lock file: {e}")))?;
    FileExt::try_lock_exclusive(&lock).map_err(|_| {
        HealError::clone_failure(repo_ref, "workspace is owned by another active run")
    })?;

    let target = base_dir.join(&name);
    if target.exists() {
        debug!("Removing stale workspace {}", target.display());
        fs::remove_dir_all(&target)
            .map_err(|e| HealError::clone_failure(repo_ref, format!("stale workspace: {e}")))?;
    }

    Ok((target, lock))
}

/// Acquires workspaces with `git clone`.
#[derive(Debug, Clone)]
pub struct GitCloneWorkspaceManager {
    base_dir: PathBuf,
}

impl GitCloneWorkspaceManager {
    /// Create a manager that clones into `base_dir/<repo-name>`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl WorkspaceManager for GitCloneWorkspaceManager {
    fn acquire(&self, repo_ref: &str) -> Result<Workspace> {
        if repo_ref.trim().is_empty() {
            return Err(HealError::clone_failure(repo_ref, "empty repository reference"));
        }
        let (target, lock) = prepare_target(&self.base_dir, repo_ref)?;

        info!("Cloning {} into {}", repo_ref, target.display());
        let output = Command::new("git")
            .arg("clone")
            .arg(repo_ref.trim())
            .arg(&target)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| HealError::clone_failure(repo_ref, format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HealError::clone_failure(repo_ref, stderr.trim()));
        }

        Ok(Workspace::locked(target, repo_ref, lock))
    }
}

/// Acquires workspaces by copying a local directory tree.
///
/// `.git` is copied so the revision publisher can operate on the copy;
/// caches and virtual environments are skipped.
#[derive(Debug, Clone)]
pub struct LocalCopyWorkspaceManager {
    base_dir: PathBuf,
}

impl LocalCopyWorkspaceManager {
    /// Create a manager that copies into `base_dir/<dir-name>`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl WorkspaceManager for LocalCopyWorkspaceManager {
    fn acquire(&self, repo_ref: &str) -> Result<Workspace> {
        let source = Path::new(repo_ref.trim());
        if !source.is_dir() {
            return Err(HealError::clone_failure(repo_ref, "not a local directory"));
        }
        let (target, lock) = prepare_target(&self.base_dir, repo_ref)?;

        info!("Copying {} into {}", source.display(), target.display());
        copy_tree(source, &target)
            .map_err(|e| HealError::clone_failure(repo_ref, format!("{e:#}")))?;

        Ok(Workspace::locked(target, repo_ref, lock))
    }
}

fn copy_tree(source: &Path, target: &Path) -> anyhow::Result<()> {
    for entry in WalkDir::new(source).into_iter().filter_entry(|e| {
        e.depth() == 0
            || e.file_name()
                .to_str()
                .map_or(true, |n| n == ".git" || !SKIP_DIRS.contains(&n))
    }) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        } else {
            warn!("Skipping non-regular file {}", entry.path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_repo_dir_name() {
        assert_eq!(
            repo_dir_name("https://github.com/org/calc.git").as_deref(),
            Some("calc")
        );
        assert_eq!(repo_dir_name("git@github.com:org/calc").as_deref(), Some("calc"));
        assert_eq!(repo_dir_name("/tmp/projects/demo/").as_deref(), Some("demo"));
        assert_eq!(repo_dir_name(""), None);
        assert_eq!(repo_dir_name("https://host/.."), None);
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        assert!(ws.resolve(Path::new("src/app.py")).is_some());
        assert!(ws.resolve(Path::new("./src/../app.py")).is_some());
        assert!(ws.resolve(Path::new("../outside.py")).is_none());
        assert!(ws.resolve(Path::new("/etc/passwd")).is_none());
    }

    #[test]
    fn test_relativize_absolute_paths() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        let abs = temp.path().join("src/app.py");
        assert_eq!(
            ws.relativize(&abs.display().to_string()),
            Some(PathBuf::from("src/app.py"))
        );
        assert_eq!(ws.relativize("./src/app.py"), Some(PathBuf::from("src/app.py")));
        assert_eq!(ws.relativize("/elsewhere/app.py"), None);
    }

    #[test]
    fn test_python_files_skip_caches() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("src/__pycache__")).unwrap();
        fs::write(temp.path().join("src/app.py"), "x = 1\n").unwrap();
        fs::write(temp.path().join("src/__pycache__/app.py"), "").unwrap();
        fs::write(temp.path().join("README.md"), "# demo").unwrap();

        let ws = Workspace::open(temp.path()).unwrap();
        assert_eq!(ws.python_files(), vec![PathBuf::from("src/app.py")]);
    }

    #[test]
    fn test_open_missing_dir_fails() {
        let err = Workspace::open("/definitely/not/here").unwrap_err();
        assert!(matches!(err, HealError::DiagnosticRunFailure { .. }));
    }

    #[test]
    fn test_local_copy_and_exclusive_lock() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("pkg")).unwrap();
        fs::create_dir_all(source.path().join(".venv")).unwrap();
        fs::write(source.path().join("pkg/mod.py"), "y = 2\n").unwrap();
        fs::write(source.path().join(".venv/junk.py"), "").unwrap();

        let base = TempDir::new().unwrap();
        let manager = LocalCopyWorkspaceManager::new(base.path());
        let repo_ref = source.path().display().to_string();

        let ws = manager.acquire(&repo_ref).unwrap();
        assert!(ws.contains_file(Path::new("pkg/mod.py")));
        assert!(!ws.root().join(".venv").exists());

        let second = manager.acquire(&repo_ref);
        assert!(matches!(second, Err(HealError::CloneFailure { .. })));

        drop(ws);
        assert!(manager.acquire(&repo_ref).is_ok());
    }

    #[test]
    fn test_local_copy_rejects_missing_source() {
        let base = TempDir::new().unwrap();
        let manager = LocalCopyWorkspaceManager::new(base.path());
        let err = manager.acquire("/no/such/repo").unwrap_err();
        assert!(matches!(err, HealError::CloneFailure { .. }));
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.py"), "old\n").unwrap();
        let mut ws = Workspace::open(temp.path()).unwrap();
        ws.write_file(Path::new("a.py"), "new\n").unwrap();
        assert_eq!(ws.read_file(Path::new("a.py")).unwrap(), "new\n");
        assert!(ws.write_file(Path::new("../b.py"), "x").is_err());
    }
}
