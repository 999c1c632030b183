//! Smoke tests -- verify the binary runs and its subcommands parse.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn parastat() -> Command {
    let mut cmd = Command::cargo_bin("parastat").unwrap();
    cmd.env_remove("PARASTAT_CONFIG").env_remove("PARASTAT_LOG_JSON");
    cmd
}

fn dataset() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for (hour, value) in [10.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 35.0].iter().enumerate() {
        writeln!(file, "CRANWELL 2016 1 1 {:02}00 {}", hour, value).unwrap();
    }
    file
}

#[test]
fn test_cli_help() {
    parastat()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("work-group reductions"));
}

#[test]
fn test_cli_version() {
    parastat()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("parastat"));
}

#[test]
fn test_run_subcommand_exists() {
    parastat()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--local-size"));
}

#[test]
fn test_list_devices() {
    parastat()
        .arg("list")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("[emulated]").and(predicate::str::contains("max work-group")),
        );
}

#[test]
fn test_list_short_flag() {
    parastat()
        .arg("-l")
        .assert()
        .success()
        .stdout(predicate::str::contains("Host work-group emulation"));
}

#[test]
fn test_run_summary() {
    let file = dataset();
    parastat()
        .args(["run", "--backend", "emulated", "--local-size", "10"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("10 values")
                .and(predicate::str::contains("8.9000"))
                .and(predicate::str::contains("81.6900")),
        );
}

#[test]
fn test_run_json() {
    let file = dataset();
    let output = parastat()
        .args(["run", "--backend", "emulated", "--local-size", "10", "--compare-atomic", "--json"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["count"], 10);
    assert_eq!(report["backend"], "emulated");
    assert_eq!(report["min"], 2.0);
    assert_eq!(report["atomic_max"], 35.0);
}

#[test]
fn test_run_config_file() {
    let file = dataset();
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        config,
        "[device]\nbackend = \"emulated\"\n\n[reduction]\nlocal_size = 4\n\n[input]\npath = {:?}\n",
        file.path().display().to_string()
    )
    .unwrap();

    parastat()
        .args(["run", "--config"])
        .arg(config.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("work-group 4, padded to 12"));
}

#[test]
fn test_run_unreadable_env_config_falls_back() {
    let file = dataset();
    parastat()
        .env("PARASTAT_CONFIG", "/nonexistent/parastat.toml")
        .args(["run", "--backend", "emulated", "--local-size", "10"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("81.6900"))
        .stderr(predicate::str::contains("PARASTAT_CONFIG set but file could not be loaded"));
}

#[test]
fn test_run_explicit_config_must_load() {
    let file = dataset();
    parastat()
        .args(["run", "--config", "/nonexistent/parastat.toml"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_run_invalid_work_group() {
    let file = dataset();
    parastat()
        .args(["run", "--backend", "emulated", "--local-size", "1"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("local_size"));
}

#[test]
fn test_run_bad_device_index() {
    let file = dataset();
    parastat()
        .args(["run", "--backend", "emulated", "-p", "3"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("platform 3"));
}

#[test]
fn test_run_without_input() {
    parastat()
        .args(["run", "--backend", "emulated"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no input file"));
}
