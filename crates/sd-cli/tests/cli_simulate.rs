use std::path::PathBuf;
use std::process::{Command, Output};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_staggered"))
}

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").canonicalize().unwrap()
}

fn fixture_path(name: &str) -> PathBuf {
    repo_root().join("tests/fixtures").join(name)
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

#[test]
fn simulate_panel_contract() {
    let config = fixture_path("small_run.yaml");
    assert!(config.exists(), "missing fixture: {}", config.display());

    let out = run(&["simulate", "--config", config.to_string_lossy().as_ref()]);
    assert!(
        out.status.success(),
        "simulate should succeed, stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON");
    let panel = v.get("panel").expect("panel");
    assert_eq!(panel.get("units").and_then(|x| x.as_array()).unwrap().len(), 150);
    assert_eq!(panel.get("observations").and_then(|x| x.as_array()).unwrap().len(), 900);
    let truth = v.get("ground_truth").and_then(|x| x.as_array()).unwrap();
    // Cohorts 3 and 5 over 6 periods: event times -4..=3.
    assert_eq!(truth.len(), 8);
    let e0 = truth.iter().find(|p| p[0].as_i64() == Some(0)).unwrap();
    assert_eq!(e0[1].as_f64(), Some(1.0));
}

#[test]
fn simulate_is_deterministic() {
    let config = fixture_path("small_run.yaml");
    let a = run(&["simulate", "--config", config.to_string_lossy().as_ref()]);
    let b = run(&["simulate", "--config", config.to_string_lossy().as_ref()]);
    assert!(a.status.success() && b.status.success());
    assert_eq!(a.stdout, b.stdout);
}

#[test]
fn simulate_writes_output_file() {
    let config = fixture_path("small_run.yaml");
    let dir = std::env::temp_dir().join(format!("staggered-cli-sim-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let output = dir.join("panel.json");

    let out = run(&[
        "simulate",
        "--config",
        config.to_string_lossy().as_ref(),
        "--output",
        output.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    assert!(out.stdout.is_empty());
    let v: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&output).unwrap()).expect("valid JSON file");
    assert!(v.get("period_effects").and_then(|x| x.as_array()).is_some());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_config_fails_cleanly() {
    let dir = std::env::temp_dir().join(format!("staggered-cli-bad-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let bad = dir.join("bad.yaml");
    std::fs::write(&bad, "simulation:\n  cohort_probs: [0.5, 0.6]\n").unwrap();

    let out = run(&["simulate", "--config", bad.to_string_lossy().as_ref()]);
    assert!(!out.status.success());
    assert!(!String::from_utf8_lossy(&out.stderr).is_empty());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_name() {
    let out = run(&["version"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("staggered "));
}
