//! Integration tests for the mend CLI

use std::fs;
use std::path::Path;

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the mend binary
fn mend() -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("mend"));
    cmd.env_remove("RUST_LOG").env("NO_COLOR", "1");
    cmd
}

/// A project whose settings keep the scan to parsing and the given check.
fn project(files: &[(&str, &str)]) -> TempDir {
    let temp = TempDir::new().unwrap();
    let settings = r#"{
        "diagnostics": {
            "enableLint": false,
            "enableImportCheck": false,
            "installDependencies": false
        }
    }"#;
    write(temp.path(), ".mend/settings.json", settings);
    for (path, content) in files {
        write(temp.path(), path, content);
    }
    temp
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn test_help() {
    mend()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Iteratively diagnose"))
        .stdout(predicate::str::contains("branch-name"));
}

#[test]
fn test_version() {
    mend()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_branch_name() {
    mend()
        .args(["branch-name", "--team", "Rift Raiders", "--leader", "Ada Lovelace"])
        .assert()
        .success()
        .stdout("RIFT_RAIDERS_ADA_LOVELACE_AI_Fix\n");
}

#[test]
fn test_branch_name_rejects_empty_label() {
    mend()
        .args(["branch-name", "--team", "!!!", "--leader", "Ada"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_scan_clean_project() {
    let temp = project(&[("app.py", "def main():\n    return 0\n")]);
    mend()
        .arg("scan")
        .arg(temp.path())
        .args(["--check-command", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No failures found"));
}

#[test]
fn test_scan_reports_syntax_error() {
    let temp = project(&[
        ("app.py", "def main():\n    return 0\n"),
        ("pkg/calc.py", "def add(a, b)\n    return a + b\n"),
    ]);
    mend()
        .arg("scan")
        .arg(temp.path())
        .args(["--check-command", "true"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("SYNTAX"))
        .stdout(predicate::str::contains("pkg/calc.py"));
}

#[test]
fn test_scan_json_output() {
    let temp = project(&[("broken.py", "x = (1,\n")]);
    let output = mend()
        .arg("scan")
        .arg(temp.path())
        .args(["--check-command", "true", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let diagnostics: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let list = diagnostics.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["category"], "SYNTAX");
    assert_eq!(list[0]["file"], "broken.py");
}

#[test]
fn test_config_show_defaults() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("settings.json");
    fs::write(&config, "{}").unwrap();
    mend()
        .arg("--config")
        .arg(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"checkCommand\": \"pytest -v\""))
        .stdout(predicate::str::contains("\"commitPrefix\": \"[AI-AGENT]\""));
}

#[test]
fn test_config_validate_rejects_zero_iterations() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("settings.toml");
    fs::write(&config, "[run]\nmaxIterations = 0\n").unwrap();
    mend()
        .arg("--config")
        .arg(&config)
        .args(["config", "validate"])
        .assert()
        .code(7)
        .stdout(predicate::str::contains("run.maxIterations"));
}

#[test]
fn test_missing_config_file() {
    mend()
        .args(["--config", "/definitely/not/here.json", "config", "show"])
        .assert()
        .code(7);
}

#[test]
fn test_run_unreachable_local_path_is_an_error() {
    let temp = TempDir::new().unwrap();
    let workspaces = TempDir::new().unwrap();
    let settings = temp.path().join("settings.json");
    fs::write(
        &settings,
        format!(
            r#"{{"run": {{"workspaceDir": {:?}}}}}"#,
            workspaces.path().display().to_string()
        ),
    )
    .unwrap();

    mend()
        .arg("--config")
        .arg(&settings)
        .args(["run", "/definitely/not/a/repo", "--team", "T", "--leader", "L", "--copy"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("ERROR"));
}
