//! Import resolution check.
//!
//! Local modules (top-level entries of the workspace root and of `src/`) are
//! resolved by name. Every other absolute top-level module is handed to a
//! [`ModuleResolver`] in a single batch.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use tracing::{debug, warn};

use super::{DiagnosticPass, FindingKind, RawFinding, TestFileFilter};
use crate::python::{self, ImportLine};
use crate::workspace::Workspace;

/// Probe run by the interpreter: prints each argument module that cannot be
/// found, one per line.
const FIND_SPEC_PROBE: &str = "\
import importlib.util, sys
for name in sys.argv[1:]:
    try:
        missing = importlib.util.find_spec(name) is None
    except Exception:
        missing = True
    if missing:
        print(name)
";

/// Resolves top-level module names against an environment.
pub trait ModuleResolver: Send + Sync {
    /// Return the subset of `modules` that cannot be resolved.
    ///
    /// `Ok(None)` means resolution is unavailable (e.g. no interpreter) and
    /// the import pass should be skipped.
    fn unresolved(
        &self,
        project_dir: &Path,
        modules: &BTreeSet<String>,
    ) -> anyhow::Result<Option<BTreeSet<String>>>;
}

/// Resolves modules with one batched `importlib.util.find_spec` probe.
#[derive(Debug, Clone)]
pub struct PythonModuleResolver {
    python: String,
}

impl PythonModuleResolver {
    #[must_use]
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

impl ModuleResolver for PythonModuleResolver {
    fn unresolved(
        &self,
        project_dir: &Path,
        modules: &BTreeSet<String>,
    ) -> anyhow::Result<Option<BTreeSet<String>>> {
        if modules.is_empty() {
            return Ok(Some(BTreeSet::new()));
        }

        let output = match Command::new(&self.python)
            .arg("-c")
            .arg(FIND_SPEC_PROBE)
            .args(modules)
            .current_dir(project_dir)
            .output()
        {
            Ok(out) => out,
            Err(e) => {
                warn!("Skipping import check: cannot start {}: {}", self.python, e);
                return Ok(None);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Import probe failed, skipping import check: {}", stderr.trim());
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Some(
            stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

/// Reports imports of modules that cannot be resolved.
pub struct ImportPass {
    resolver: Box<dyn ModuleResolver>,
    tests: TestFileFilter,
}

impl ImportPass {
    #[must_use]
    pub fn new(resolver: Box<dyn ModuleResolver>, tests: TestFileFilter) -> Self {
        Self { resolver, tests }
    }
}

/// One import statement that references a module.
#[derive(Debug, Clone)]
struct ImportSite {
    file: PathBuf,
    line: u32,
    module: String,
    text: String,
}

impl DiagnosticPass for ImportPass {
    fn name(&self) -> &str {
        "imports"
    }

    fn run(&self, workspace: &Workspace) -> anyhow::Result<Vec<RawFinding>> {
        let local = local_modules(workspace.root())?;
        let mut sites = Vec::new();

        for file in workspace.python_files() {
            if self.tests.is_test_file(&file) {
                continue;
            }
            let Ok(source) = workspace.read_file(&file) else {
                continue;
            };
            // Unparsable files are reported by the parse pass.
            if !python::parses_cleanly(&source) {
                continue;
            }
            sites.extend(import_sites(&file, &source));
        }

        let external: BTreeSet<String> = sites
            .iter()
            .filter(|s| !local.contains(&s.module))
            .map(|s| s.module.clone())
            .collect();

        let Some(missing) = self
            .resolver
            .unresolved(workspace.root(), &external)
            .context("module resolution failed")?
        else {
            return Ok(Vec::new());
        };
        debug!(checked = external.len(), missing = missing.len(), "Resolved imports");

        Ok(sites
            .into_iter()
            .filter(|s| missing.contains(&s.module))
            .map(|s| {
                RawFinding::new(
                    FindingKind::UnresolvedModule,
                    s.file,
                    format!("No module named '{}'", s.module),
                )
                .with_line(s.line)
                .with_context(s.text)
                .with_code("import-error")
            })
            .collect())
    }
}

/// Names importable from the workspace itself.
pub fn local_modules(root: &Path) -> anyhow::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for dir in [root.to_path_buf(), root.join("src")] {
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                names.insert(name.to_string());
            } else if let Some(stem) = name.strip_suffix(".py") {
                names.insert(stem.to_string());
            }
        }
    }
    Ok(names)
}

fn import_sites(file: &Path, source: &str) -> Vec<ImportSite> {
    let mut by_line: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    let mut texts = BTreeMap::new();
    for (idx, text) in source.lines().enumerate() {
        let Some(import) = ImportLine::parse(text) else {
            continue;
        };
        let line = idx as u32 + 1;
        let modules: Vec<String> = import
            .top_level_modules()
            .into_iter()
            .filter(|m| m != "__future__" && !m.is_empty())
            .collect();
        if !modules.is_empty() {
            by_line.insert(line, modules);
            texts.insert(line, text.to_string());
        }
    }

    by_line
        .into_iter()
        .flat_map(|(line, modules)| {
            let text = texts.get(&line).cloned().unwrap_or_default();
            modules.into_iter().map(move |module| ImportSite {
                file: file.to_path_buf(),
                line,
                module,
                text: text.clone(),
            })
        })
        .collect()
}
