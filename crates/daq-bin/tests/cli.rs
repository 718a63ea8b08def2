//! Command-line tests against the simulated instrument.
//!
//! Run with: cargo test -p daq-bin --test cli

use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn sr785() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_sr785"));
    command.env_remove("RUST_LOG");
    command
}

fn template(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../../templates");
    path.push(name);
    path
}

#[test]
fn test_help_lists_subcommands() {
    let output = sr785().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["run", "dump", "params", "identify", "reset", "status"] {
        assert!(stdout.contains(subcommand), "help should mention {subcommand}");
    }
}

#[test]
fn test_simulated_identify() {
    let output = sr785().args(["--simulate", "identify"]).output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("SR785"));
}

#[test]
fn test_simulated_run_writes_files() {
    let dir = tempfile::tempdir().unwrap();
    let output = sr785()
        .arg("--simulate")
        .arg("--output")
        .arg(dir.path())
        .arg("run")
        .arg(template("spectrum.yaml"))
        .arg("--json")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names.len(), 3);
    assert!(names[0].starts_with("spectrum_") && names[0].ends_with(".json"));
    assert!(names[1].ends_with(".txt") && !names[1].ends_with("_params.txt"));
    assert!(names[2].ends_with("_params.txt"));

    let data = fs::read_to_string(dir.path().join(&names[1])).unwrap();
    assert!(data.starts_with("# spectrum Measurement - Timestamp: "));
    assert!(data.trim_end().ends_with("overflow"));
}

#[test]
fn test_missing_template_fails_cleanly() {
    let output = sr785()
        .args(["--simulate", "run", "/nonexistent/template.yaml"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to load template"));
}
