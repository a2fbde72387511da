//! CLI subprocess integration tests.
//!
//! These tests invoke the `kiln` binary against the in-memory engine and
//! verify exit codes, stdout content, and JSON output stability.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn kiln_bin(tmp: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kiln"));
    cmd.env("KILN_ENGINE", "mock")
        .env("KILN_SKIP_PREREQS", "1")
        .env("TMPDIR", tmp)
        .env_remove("KILN_LOG");
    cmd
}

fn write_app(dir: &Path) -> PathBuf {
    let src = dir.join("app");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("main"), "print('hi')\n").unwrap();
    std::fs::write(src.join("Procfile"), "web: main\n").unwrap();
    src
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("output must be valid JSON: {e}\nstdout: {stdout}"))
}

#[test]
fn cli_version_exits_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let output = kiln_bin(tmp.path()).arg("--version").output().unwrap();
    assert!(output.status.success(), "kiln --version must exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("kiln"), "version output: {stdout}");
}

#[test]
fn cli_help_lists_commands() {
    let tmp = tempfile::tempdir().unwrap();
    let output = kiln_bin(tmp.path()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["build", "usage", "doctor", "completions", "man-pages"] {
        assert!(stdout.contains(cmd), "help must list '{cmd}': {stdout}");
    }
}

#[test]
fn cli_build_local_source_json() {
    let tmp = tempfile::tempdir().unwrap();
    let src = write_app(tmp.path());
    let output = kiln_bin(tmp.path())
        .args(["--json", "build"])
        .arg(&src)
        .args(["lang-builder:latest", "app:latest", "-e", "RACK_ENV=test"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "build must exit 0. stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = stdout_json(&output);
    assert_eq!(json["success"], true);
    assert!(!json["imageId"].as_str().unwrap().is_empty());
    assert!(json["error"].is_null());
    let working_dir = json["workingDir"].as_str().unwrap();
    assert!(!Path::new(working_dir).exists(), "working dir must be removed");
}

#[test]
fn cli_build_from_config_file() {
    let tmp = tempfile::tempdir().unwrap();
    let src = write_app(tmp.path());
    let config = tmp.path().join("kiln.toml");
    std::fs::write(
        &config,
        format!(
            "source = {:?}\nbuilder_image = \"lang-builder:latest\"\ntag = \"app:v1\"\n\n[labels]\nteam = \"web\"\n",
            src.display().to_string()
        ),
    )
    .unwrap();
    let output = kiln_bin(tmp.path())
        .args(["--json", "build", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(stdout_json(&output)["success"], true);
}

#[test]
fn cli_build_human_output_reports_image() {
    let tmp = tempfile::tempdir().unwrap();
    let src = write_app(tmp.path());
    let output = kiln_bin(tmp.path())
        .arg("build")
        .arg(&src)
        .args(["lang-builder:latest", "app:latest"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("build of app:latest"), "stdout: {stdout}");
    assert!(stdout.contains("image: sha256:"), "stdout: {stdout}");
}

#[test]
fn cli_build_missing_tag_is_configuration_error() {
    let tmp = tempfile::tempdir().unwrap();
    let src = write_app(tmp.path());
    let output = kiln_bin(tmp.path())
        .arg("build")
        .arg(&src)
        .arg("lang-builder:latest")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration error"), "stderr: {stderr}");
}

#[test]
fn cli_build_invalid_pull_policy_exits_2() {
    let tmp = tempfile::tempdir().unwrap();
    let src = write_app(tmp.path());
    let output = kiln_bin(tmp.path())
        .arg("build")
        .arg(&src)
        .args(["lang-builder:latest", "app:latest", "--pull-policy", "sometimes"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_build_disallowed_user_exits_2() {
    let tmp = tempfile::tempdir().unwrap();
    let src = write_app(tmp.path());
    let output = kiln_bin(tmp.path())
        .args(["--json", "build"])
        .arg(&src)
        .args(["lang-builder:latest", "app:latest", "--allowed-uids", "0-10"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let json = stdout_json(&output);
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["kind"], "configuration");
}

#[test]
fn cli_build_missing_source_exits_1() {
    let tmp = tempfile::tempdir().unwrap();
    let output = kiln_bin(tmp.path())
        .args(["--json", "build"])
        .arg(tmp.path().join("nope"))
        .args(["lang-builder:latest", "app:latest"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stdout_json(&output)["error"]["kind"], "source");
}

#[test]
fn cli_unknown_engine_exits_3() {
    let tmp = tempfile::tempdir().unwrap();
    let src = write_app(tmp.path());
    let output = kiln_bin(tmp.path())
        .env("KILN_ENGINE", "containerd")
        .arg("build")
        .arg(&src)
        .args(["lang-builder:latest", "app:latest"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn cli_usage_runs_without_commit() {
    let tmp = tempfile::tempdir().unwrap();
    let output = kiln_bin(tmp.path())
        .args(["--json", "usage", "lang-builder:latest"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = stdout_json(&output);
    assert_eq!(json["success"], true);
    assert!(json["imageId"].is_null());
}

#[test]
fn cli_completions_bash() {
    let tmp = tempfile::tempdir().unwrap();
    let output = kiln_bin(tmp.path())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("kiln"));
}

#[test]
fn cli_man_pages_written() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("man");
    let output = kiln_bin(tmp.path())
        .arg("man-pages")
        .arg(&dir)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(dir.join("kiln.1").is_file());
    assert!(dir.join("kiln-build.1").is_file());
}

#[test]
fn cli_doctor_json_is_stable() {
    let tmp = tempfile::tempdir().unwrap();
    let output = kiln_bin(tmp.path())
        .args(["--json", "doctor", "--work-dir"])
        .arg(tmp.path())
        .output()
        .unwrap();
    let json = stdout_json(&output);
    assert!(json["healthy"].is_boolean());
    let checks = json["checks"].as_array().unwrap();
    assert!(checks.iter().any(|c| c["name"] == "engine"));
    assert!(checks.iter().any(|c| c["name"] == "disk_space"));
}
