use std::path::PathBuf;
use std::process::Command;

use rhythm_drafter::testing::write_click_wav;
use serde_json::Value;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_draft_cli"))
}

struct Input(PathBuf);

impl Input {
    fn clicks(name: &str) -> Self {
        Self(write_click_wav(name, 120.0, 32, 0.25))
    }

    fn arg(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl Drop for Input {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[test]
fn analyze_prints_detection_stats() {
    let input = Input::clicks("cli_analyze");
    let output = cli()
        .args(["analyze", "--input", &input.arg()])
        .output()
        .expect("failed to run draft_cli analyze");
    assert!(
        output.status.success(),
        "CLI exited with {:?}",
        output.status.code()
    );

    let stdout = String::from_utf8(output.stdout).expect("stdout UTF-8");
    let json: Value = serde_json::from_str(stdout.trim()).expect("detection stats JSON payload");
    assert_eq!(json["peak_count"], 32);
    assert_eq!(json["quantization"]["grid"], "sixteenth");
    let bpm = json["quantization"]["primary"]["bpm"].as_f64().unwrap_or_default();
    assert!((bpm - 120.0).abs() < 1.0, "unexpected bpm {bpm}");
}

#[test]
fn run_prints_result_and_progress() {
    let input = Input::clicks("cli_run");
    let output = cli()
        .args(["run", "--input", &input.arg(), "--progress", "--title", "Groove"])
        .output()
        .expect("failed to run draft_cli run");
    assert!(
        output.status.success(),
        "CLI exited with {:?}",
        output.status.code()
    );

    let stdout = String::from_utf8(output.stdout).expect("stdout UTF-8");
    let json: Value = serde_json::from_str(stdout.trim()).expect("pipeline result JSON payload");
    assert_eq!(json["final_state"]["state"], "completed");
    assert_eq!(json["draft"]["title"], "Groove");
    assert!(json["draft"]["hits"].as_array().map(Vec::len).unwrap_or_default() >= 30);

    let stderr = String::from_utf8(output.stderr).expect("stderr UTF-8");
    assert!(stderr.contains("onset_detection"), "missing progress, got {stderr}");
    assert!(stderr.contains("100.0%"), "missing completion line, got {stderr}");
}

#[test]
fn run_on_missing_file_exits_faulted() {
    let output = cli()
        .args(["run", "--input", "/no/such/take.wav"])
        .output()
        .expect("failed to run draft_cli run");
    assert_eq!(output.status.code(), Some(2));

    let stdout = String::from_utf8(output.stdout).expect("stdout UTF-8");
    let json: Value = serde_json::from_str(stdout.trim()).expect("pipeline result JSON payload");
    assert_eq!(json["outcome"]["kind"], "failure");
}

#[test]
fn invalid_grid_is_rejected() {
    let output = cli()
        .args(["analyze", "--input", "x.wav", "--grid", "dotted"])
        .output()
        .expect("failed to run draft_cli analyze");
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).expect("stderr UTF-8");
    assert!(stderr.contains("unknown grid"), "got {stderr}");
}

#[test]
fn run_with_telemetry_reports_metric_events() {
    let input = Input::clicks("cli_telemetry");
    let output = cli()
        .args(["run", "--input", &input.arg(), "--telemetry"])
        .output()
        .expect("failed to run draft_cli run");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).expect("stdout UTF-8");
    let json: Value = serde_json::from_str(stdout.trim()).expect("pipeline result JSON payload");
    let events = json["telemetry"].as_array().expect("telemetry array");
    assert_eq!(events.last().unwrap()["type"], "run_finished");
    assert!(events.iter().any(|event| event["type"] == "stage_completed"));

    let stderr = String::from_utf8(output.stderr).expect("stderr UTF-8");
    assert!(stderr.contains("\"type\":\"stage_timing\""), "got {stderr}");
    assert!(stderr.contains("events recorded"), "got {stderr}");
}
