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

fn run_json(args: &[&str]) -> serde_json::Value {
    let out = run(args);
    assert!(
        out.status.success(),
        "{:?} should succeed, stderr={}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON")
}

#[test]
fn pipeline_report_contract() {
    let config = fixture_path("small_run.yaml");
    let v = run_json(&["pipeline", "--config", config.to_string_lossy().as_ref()]);

    for key in ["panel", "propensity", "weights", "balance", "event_study", "profile", "att_gt"] {
        assert!(v.get(key).is_some(), "missing key {key}");
    }

    let weights = v.get("weights").unwrap();
    assert!(weights.get("cap").and_then(|x| x.as_f64()).unwrap() > 0.0);

    let effects = v.pointer("/profile/effects").and_then(|x| x.as_array()).unwrap();
    let reference = effects.iter().find(|e| e["event_time"].as_i64() == Some(-1)).unwrap();
    assert_eq!(reference["estimate"].as_f64(), Some(0.0));
    assert_eq!(reference["ci_lower"].as_f64(), Some(0.0));
    assert_eq!(reference["ci_upper"].as_f64(), Some(0.0));

    let per_cohort = v.get("per_cohort_profile").expect("per-cohort profile requested");
    assert!(per_cohort.get("effects").and_then(|x| x.as_array()).is_some());

    let cache = v.pointer("/event_study/cache").and_then(|x| x.as_str()).unwrap();
    assert_eq!(cache, "disabled");
    assert!(v.pointer("/att_gt/dynamic/overall_att").and_then(|x| x.as_f64()).unwrap().is_finite());
}

#[test]
fn pipeline_reuses_cached_fit() {
    let config = fixture_path("small_run.yaml");
    let dir = std::env::temp_dir().join(format!("staggered-cli-cache-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let args = [
        "pipeline",
        "--config",
        config.to_str().unwrap(),
        "--cache-dir",
        dir.to_str().unwrap(),
    ];

    let first = run_json(&args);
    let second = run_json(&args);
    assert_eq!(first.pointer("/event_study/cache").unwrap(), "miss");
    assert_eq!(second.pointer("/event_study/cache").unwrap(), "hit");
    let estimates = |v: &serde_json::Value| -> Vec<f64> {
        v.pointer("/profile/effects")
            .and_then(|x| x.as_array())
            .unwrap()
            .iter()
            .map(|e| e["estimate"].as_f64().unwrap())
            .collect()
    };
    let (a, b) = (estimates(&first), estimates(&second));
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-9, "{x} vs {y}");
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn att_gt_contract() {
    let config = fixture_path("small_run.yaml");
    let v = run_json(&["att-gt", "--config", config.to_string_lossy().as_ref()]);
    assert_eq!(v["control_group"].as_str(), Some("not_yet_treated"));
    let gt = v.get("group_time").and_then(|x| x.as_array()).unwrap();
    assert!(!gt.is_empty());
    for est in gt {
        assert!(est["se"].as_f64().unwrap() >= 0.0);
        assert!(est["ci_lower"].as_f64().unwrap() <= est["ci_upper"].as_f64().unwrap());
    }
    assert!(v.pointer("/dynamic/overall_se").and_then(|x| x.as_f64()).unwrap() > 0.0);
}

#[test]
fn pipeline_cache_misses_when_effect_changes() {
    let dir = std::env::temp_dir().join(format!("staggered-cli-rekey-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();

    let base = std::fs::read_to_string(fixture_path("small_run.yaml")).unwrap();
    assert!(base.contains("intercept: 1.0"));
    let stronger = dir.join("stronger.yaml");
    std::fs::write(&stronger, base.replace("intercept: 1.0", "intercept: 4.0")).unwrap();
    let cache = dir.join("cache");

    let base_cfg = fixture_path("small_run.yaml");
    let first = run_json(&[
        "pipeline",
        "--config",
        base_cfg.to_str().unwrap(),
        "--cache-dir",
        cache.to_str().unwrap(),
    ]);
    let second = run_json(&[
        "pipeline",
        "--config",
        stronger.to_str().unwrap(),
        "--cache-dir",
        cache.to_str().unwrap(),
    ]);
    assert_eq!(first.pointer("/event_study/cache").unwrap(), "miss");
    assert_eq!(second.pointer("/event_study/cache").unwrap(), "miss");
    assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 2);

    let at_zero = |v: &serde_json::Value| -> f64 {
        v.pointer("/profile/effects")
            .and_then(|x| x.as_array())
            .unwrap()
            .iter()
            .find(|e| e["event_time"].as_i64() == Some(0))
            .map(|e| e["estimate"].as_f64().unwrap())
            .unwrap()
    };
    assert!(at_zero(&second) > at_zero(&first) + 1.5);
    let _ = std::fs::remove_dir_all(&dir);
}
