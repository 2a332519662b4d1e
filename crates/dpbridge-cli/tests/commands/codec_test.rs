//! Tests for the `decode` and `encode` commands.

use assert_cmd::Command;
use predicates::prelude::*;

fn dpbridge() -> Command {
    Command::cargo_bin("dpbridge").unwrap()
}

#[test]
fn test_decode_value_frame() {
    dpbridge()
        .args(["decode", "0102000400000096"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dp   1"))
        .stdout(predicate::str::contains("150"));
}

#[test]
fn test_decode_json_output() {
    dpbridge()
        .args(["--json", "decode", "01 01 01 01"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": 1"))
        .stdout(predicate::str::contains("\"type\": \"bool\""))
        .stdout(predicate::str::contains("\"errors\": []"));
}

#[test]
fn test_decode_envelope() {
    dpbridge()
        .args(["decode", "--envelope", "010201010101"])
        .assert()
        .success()
        .stdout(predicate::str::contains("seq 258"))
        .stdout(predicate::str::contains("true"));
}

#[test]
fn test_decode_keeps_frames_before_bad_tag() {
    dpbridge()
        .args(["decode", "0101010102ff000100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("true"))
        .stdout(predicate::str::contains("Unknown type tag 0xFF"));
}

#[test]
fn test_decode_strict_fails_on_errors() {
    dpbridge()
        .args(["decode", "--strict", "01020004000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Truncated"));
}

#[test]
fn test_decode_rejects_bad_hex() {
    dpbridge()
        .args(["decode", "zz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid hex"));
}

#[test]
fn test_encode_bool() {
    dpbridge()
        .args(["encode", "--id", "1", "--type", "bool", "--value", "true"])
        .assert()
        .success()
        .stdout("01010101\n");
}

#[test]
fn test_encode_negative_value() {
    dpbridge()
        .args(["encode", "--id", "2", "--type", "value", "--value", "-45"])
        .assert()
        .success()
        .stdout("02020004ffffffd3\n");
}

#[test]
fn test_encode_with_envelope() {
    dpbridge()
        .args(["encode", "--id", "1", "--type", "bool", "--value", "on", "--seq", "258"])
        .assert()
        .success()
        .stdout("010201010101\n");
}

#[test]
fn test_encode_rejects_oversized_enum() {
    dpbridge()
        .args(["encode", "--id", "4", "--type", "enum", "--value", "300"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("exceeds 255"));
}

#[test]
fn test_encode_rejects_unknown_type() {
    dpbridge()
        .args(["encode", "--id", "4", "--type", "float", "--value", "1"])
        .assert()
        .failure()
        .code(2);
}
