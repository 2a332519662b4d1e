//! Tests for the `profiles` command.

use assert_cmd::Command;
use predicates::prelude::*;

fn dpbridge() -> Command {
    Command::cargo_bin("dpbridge").unwrap()
}

#[test]
fn test_profiles_lists_builtins() {
    dpbridge()
        .arg("profiles")
        .assert()
        .success()
        .stdout(predicate::str::contains("climate_sensor"))
        .stdout(predicate::str::contains("switch_2gang"))
        .stdout(predicate::str::contains("generic"));
}

#[test]
fn test_profile_details() {
    dpbridge()
        .args(["profiles", "switch_3gang"])
        .assert()
        .success()
        .stdout(predicate::str::contains("switch_3gang"))
        .stdout(predicate::str::contains("onoff.gang3"));
}

#[test]
fn test_profile_json() {
    dpbridge()
        .args(["--json", "profiles", "climate_sensor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"climate_sensor\""))
        .stdout(predicate::str::contains("measure_temperature"));
}

#[test]
fn test_unknown_profile() {
    dpbridge()
        .args(["profiles", "toaster"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no built-in profile 'toaster'"));
}
