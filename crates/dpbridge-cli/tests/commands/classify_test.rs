//! Tests for the `classify` and `config` commands.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn dpbridge() -> Command {
    Command::cargo_bin("dpbridge").unwrap()
}

#[test]
fn test_classify_pure_overlay_model() {
    dpbridge()
        .args(["classify", "--vendor", "_TZE200_bjawzodf", "--model", "TS0601"])
        .args(["--cluster", "basic", "--cluster", "0xEF00"])
        .assert()
        .success()
        .stdout(predicate::str::contains("protocol:  overlay"))
        .stdout(predicate::str::contains("passive:   false"));
}

#[test]
fn test_classify_hybrid_device() {
    dpbridge()
        .args(["--json", "classify", "--vendor", "_TZE200_bjawzodf", "--model", "TS0601"])
        .args(["--cluster", "genBasic", "--cluster", "msTemperatureMeasurement"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"protocol\": \"hybrid\""))
        .stdout(predicate::str::contains("\"prefer_native_on_conflict\": true"));
}

#[test]
fn test_classify_native_default() {
    dpbridge()
        .args(["classify", "--vendor", "_TZ3000_fllyghyj", "--model", "TS0201"])
        .args(["--cluster", "basic", "--cluster", "temperatureMeasurement"])
        .assert()
        .success()
        .stdout(predicate::str::contains("protocol:  native"))
        .stdout(predicate::str::contains("NativeDefault"));
}

#[test]
fn test_classify_session_continuity() {
    dpbridge()
        .args(["classify", "--vendor", "_TZ3000_abc", "--model", "TS011F"])
        .args(["--cluster", "onOff", "--proprietary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("protocol:  overlay"))
        .stdout(predicate::str::contains("passive:   true"));
}

#[test]
fn test_classify_unknown_cluster() {
    dpbridge()
        .args(["classify", "--vendor", "x", "--model", "y", "--cluster", "flux"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown cluster 'flux'"));
}

#[test]
fn test_config_file_overrides_rules() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dpbridge.json");
    fs::write(
        &path,
        r#"{"classifier": {"pure_overlay_models": ["TS0999"]}, "scan": {"interval_secs": 120}}"#,
    )
    .unwrap();

    dpbridge()
        .arg("--config")
        .arg(&path)
        .args(["classify", "--vendor", "acme", "--model", "TS0999"])
        .assert()
        .success()
        .stdout(predicate::str::contains("protocol:  overlay"))
        .stdout(predicate::str::contains("PureOverlayModel"));

    dpbridge()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .env_remove("DPBRIDGE_SCAN_INTERVAL_SECS")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"interval_secs\": 120"));
}

#[test]
fn test_config_rejects_invalid_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ not json").unwrap();

    dpbridge()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid config"));
}
