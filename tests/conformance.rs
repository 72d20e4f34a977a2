use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

// Each case gets its own temp dir with the two reference files; the child
// program is a small /bin/sh script so the suite needs no fixture binaries.
fn stepper(dir: &TempDir, input: &[u8], expected: &[u8], script: &str) -> Command {
    let input_path = dir.path().join("case.input");
    let expected_path = dir.path().join("case.expected");
    fs::write(&input_path, input).unwrap();
    fs::write(&expected_path, expected).unwrap();

    let mut cmd = Command::cargo_bin("inout-stepper").unwrap();
    cmd.timeout(Duration::from_secs(10))
        .arg("--warmup-ms")
        .arg("200")
        .arg(&input_path)
        .arg(&expected_path)
        .arg("sh")
        .arg("-c")
        .arg(script);
    cmd
}

#[test]
fn adder_passes_with_interleaved_transcript() {
    let dir = TempDir::new().unwrap();
    stepper(&dir, b"2\n3\n", b"5\n", "read a; read b; echo $((a+b))")
        .assert()
        .success()
        .stdout("2\n3\n5\n");
}

#[test]
fn adder_mismatch_reports_actual_versus_expected() {
    let dir = TempDir::new().unwrap();
    stepper(&dir, b"2\n3\n", b"6\n", "read a; read b; echo $((a+b))")
        .assert()
        .failure()
        .code(1)
        .stdout(
            predicate::str::contains("!!INCORRECT OUTPUT!! Your next line of output was:")
                .and(predicate::str::contains("\"5\\n\""))
                .and(predicate::str::contains("but the next line of output expected was:"))
                .and(predicate::str::contains("\"6\\n\"")),
        );
}

#[test]
fn single_stderr_byte_fails_the_run() {
    let dir = TempDir::new().unwrap();
    stepper(&dir, b"", b"", "printf oops >&2")
        .assert()
        .failure()
        .stdout(
            predicate::str::contains("!!ERROR OUTPUT!!").and(predicate::str::contains("oops")),
        );
}

#[test]
fn output_ending_mid_line_is_premature_eof() {
    // the partial bytes are a correct prefix of the expected line, but a
    // missing terminator is always an error
    let dir = TempDir::new().unwrap();
    stepper(&dir, b"", b"partial\n", "printf partial")
        .assert()
        .failure()
        .stdout(
            predicate::str::contains("Program output ended without a newline:")
                .and(predicate::str::contains("\"partial\"")),
        );
}

#[test]
fn early_exit_leaves_expected_output_unconsumed() {
    let dir = TempDir::new().unwrap();
    stepper(&dir, b"", b"5\n6\n", "echo 5")
        .assert()
        .failure()
        .stdout(
            predicate::str::starts_with("5\n")
                .and(predicate::str::contains(
                    "Program ended but more output was expected. Expected output was:",
                ))
                .and(predicate::str::contains("\"6\\n\"")),
        );
}

#[test]
fn early_exit_leaves_input_unconsumed() {
    let dir = TempDir::new().unwrap();
    stepper(&dir, b"a\nb\nc\n", b"", "read line")
        .assert()
        .failure()
        .stdout(
            predicate::str::contains("Program ended without reading all input. Unused input was:")
                .and(predicate::str::contains("\"b\\n\""))
                .and(predicate::str::contains("\"c\\n\"")),
        );
}

#[test]
fn mismatch_window_is_bounded() {
    let dir = TempDir::new().unwrap();
    let expected: Vec<u8> = std::iter::repeat(&b"right\n"[..]).take(30).flatten().copied().collect();
    let script = "i=0; while [ $i -lt 30 ]; do echo wrong$i; i=$((i+1)); done";
    stepper(&dir, b"", &expected, script)
        .assert()
        .failure()
        .stdout(
            predicate::str::contains("Your next 10 lines of output were:")
                .and(predicate::str::contains("\"wrong0\\n\""))
                .and(predicate::str::contains("but the next 10 lines of output expected were:"))
                .and(predicate::str::contains("\"right\\n\"")),
        );
}

#[test]
fn leftover_listing_is_truncated() {
    let dir = TempDir::new().unwrap();
    let input: Vec<u8> = (1..=40).flat_map(|i| format!("line {i}\n").into_bytes()).collect();
    stepper(&dir, &input, b"", "true")
        .assert()
        .failure()
        .stdout(predicate::str::contains(
            "... (skipped 25 additional lines of unread input)",
        ));
}

#[test]
fn deterministic_pass_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let first = stepper(&dir, b"2\n3\n", b"5\n", "read a; read b; echo $((a+b))")
        .assert()
        .success();
    let second = stepper(&dir, b"2\n3\n", b"5\n", "read a; read b; echo $((a+b))")
        .assert()
        .success();
    assert_eq!(
        first.get_output().stdout,
        second.get_output().stdout,
        "identical runs should produce identical transcripts"
    );
}

#[test]
fn unlaunchable_command_aborts_before_comparison() {
    let dir = TempDir::new().unwrap();
    let input_path = dir.path().join("case.input");
    let expected_path = dir.path().join("case.expected");
    fs::write(&input_path, b"").unwrap();
    fs::write(&expected_path, b"").unwrap();

    Command::cargo_bin("inout-stepper")
        .unwrap()
        .timeout(Duration::from_secs(10))
        .arg(&input_path)
        .arg(&expected_path)
        .arg("/nonexistent/no-such-program")
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("spawning"));
}
