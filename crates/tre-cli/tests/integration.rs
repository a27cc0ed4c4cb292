#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn tre(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tre").unwrap();
    cmd.current_dir(dir.path());
    for var in [
        "TRE_CONFIG",
        "TRE_TRACKER_BASE_URL",
        "TRE_PROJECT_KEY",
        "TRE_AUTH_CLIENT_ID",
        "TRE_AUTH_CLIENT_SECRET",
        "TRE_DRY_RUN",
        "TRE_CHECKPOINT_PATH",
        "TRE_AUDIT_DIR",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

const CATALOG: &str = r#"{
  "tests": [
    {
      "external_id": "T1", "summary": "Checkout applies coupon", "test_type": "Manual",
      "priority": "High", "labels": ["alpha"], "folder_path": "/X",
      "steps": [{"action": "Add coupon", "result": "Total drops"}],
      "precondition_refs": ["P1"]
    },
    {
      "external_id": "T2", "summary": "Cart keeps items", "test_type": "Manual",
      "priority": "Medium", "labels": [], "folder_path": "/X/Y",
      "steps": [{"action": "Reload", "result": "Items remain"}]
    }
  ],
  "preconditions": [
    {"external_id": "P1", "summary": "User logged in", "definition": "A user session exists"}
  ]
}"#;

const EMPTY_SNAPSHOT: &str =
    r#"{"project": "API", "tests": {}, "preconditions": {}, "folders": []}"#;

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn files_with_ext(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with(ext))
        .collect()
}

// ---------------------------------------------------------------------------
// tre validate
// ---------------------------------------------------------------------------

#[test]
fn validate_accepts_catalog() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.json", CATALOG);
    tre(&dir)
        .arg("validate")
        .arg(&catalog)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 test(s), 1 precondition(s), 2 folder(s)"));
}

#[test]
fn validate_json_output() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.json", CATALOG);
    let out = tre(&dir)
        .args(["validate", "--json"])
        .arg(&catalog)
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["tests"], 2);
    assert_eq!(v["preconditions"], 1);
}

#[test]
fn validate_rejects_test_id_label() {
    let dir = TempDir::new().unwrap();
    let catalog = write(
        &dir,
        "bad.json",
        &CATALOG.replace(r#""labels": ["alpha"]"#, r#""labels": ["API-123"]"#),
    );
    tre(&dir)
        .arg("validate")
        .arg(&catalog)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("looks like a test id"));
}

#[test]
fn validate_requires_a_file() {
    let dir = TempDir::new().unwrap();
    tre(&dir).arg("validate").assert().failure();
}

// ---------------------------------------------------------------------------
// tre plan
// ---------------------------------------------------------------------------

#[test]
fn plan_against_snapshot_lists_operations() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.json", CATALOG);
    let snapshot = write(&dir, "snapshot.json", EMPTY_SNAPSHOT);
    let out_path = dir.path().join("plan.json");

    let out = tre(&dir)
        .args(["plan", "--json", "--snapshot"])
        .arg(&snapshot)
        .arg("--out")
        .arg(&out_path)
        .arg(&catalog)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let plan: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let ops: Vec<&str> = plan["operations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["op"].as_str().unwrap())
        .collect();
    assert_eq!(
        ops,
        vec![
            "create_folder",
            "create_folder",
            "create_precondition",
            "create_test",
            "create_test",
            "add_precondition_link"
        ]
    );
    let written = std::fs::read_to_string(&out_path).unwrap();
    let reparsed: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(reparsed, plan);
}

#[test]
fn plan_table_output() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.json", CATALOG);
    let snapshot = write(&dir, "snapshot.json", EMPTY_SNAPSHOT);
    tre(&dir)
        .args(["plan", "--snapshot"])
        .arg(&snapshot)
        .arg(&catalog)
        .assert()
        .success()
        .stdout(predicate::str::contains("create_precondition"))
        .stdout(predicate::str::contains("6 operation(s)"));
}

#[test]
fn plan_without_tracker_settings_is_config_error() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.json", CATALOG);
    tre(&dir)
        .args(["plan", "--project", "API"])
        .arg(&catalog)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("tracker_base_url is required"));
}

// ---------------------------------------------------------------------------
// tre run
// ---------------------------------------------------------------------------

#[test]
fn dry_run_journals_every_operation() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.json", CATALOG);
    let snapshot = write(&dir, "snapshot.json", EMPTY_SNAPSHOT);

    tre(&dir)
        .args(["run", "--dry-run", "--snapshot"])
        .arg(&snapshot)
        .arg(&catalog)
        .assert()
        .success();

    let journals = files_with_ext(&dir.path().join("audit"), ".jsonl");
    assert_eq!(journals.len(), 1);
    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&journals[0])
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 6);
    assert!(lines.iter().all(|e| e["status"] == "skipped(dry_run)"));
    assert!(!dir.path().join("checkpoints").exists());
    assert_eq!(files_with_ext(&dir.path().join("audit"), ".summary.json").len(), 1);
}

#[test]
fn rehearsal_writes_checkpoint_and_resume_skips_done_work() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.json", CATALOG);
    let snapshot = write(&dir, "snapshot.json", EMPTY_SNAPSHOT);

    let out = tre(&dir)
        .args(["run", "--json", "--snapshot"])
        .arg(&snapshot)
        .arg(&catalog)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["rehearsal"], true);
    assert_eq!(report["summary"]["per_status"]["succeeded"], 6);
    let checkpoint = PathBuf::from(report["checkpoint"].as_str().unwrap());
    let checkpoint = if checkpoint.is_absolute() {
        checkpoint
    } else {
        dir.path().join(checkpoint)
    };
    assert!(checkpoint.exists());

    let status = tre(&dir)
        .args(["status", "--json"])
        .arg(&checkpoint)
        .output()
        .unwrap();
    assert!(status.status.success());
    let status: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(status["counts"]["succeeded"], 6);
    assert_eq!(status["project"], "API");
    assert!(status["symbolic_refs"]["test:T1"].is_string());

    let resumed = tre(&dir)
        .args(["run", "--json", "--snapshot"])
        .arg(&snapshot)
        .arg("--resume-from")
        .arg(&checkpoint)
        .output()
        .unwrap();
    assert!(resumed.status.success(), "{}", String::from_utf8_lossy(&resumed.stderr));
    let resumed: serde_json::Value = serde_json::from_slice(&resumed.stdout).unwrap();
    assert_eq!(resumed["summary"]["per_status"]["skipped(already_done)"], 6);
}

#[test]
fn cancelled_run_flushes_pending_checkpoint() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.json", CATALOG);
    let snapshot = write(&dir, "snapshot.json", EMPTY_SNAPSHOT);

    let out = tre(&dir)
        .args(["run", "--json", "--deadline-secs", "0", "--snapshot"])
        .arg(&snapshot)
        .arg(&catalog)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["summary"]["interrupted"], true);

    let checkpoint = dir.path().join(report["checkpoint"].as_str().unwrap());
    let status = tre(&dir)
        .args(["status", "--json"])
        .arg(&checkpoint)
        .output()
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(status["counts"]["pending"], 6);
}

#[test]
fn failed_operations_exit_with_two() {
    let dir = TempDir::new().unwrap();
    let catalog = write(
        &dir,
        "closure.json",
        r#"{"closure": {"target_status": "Closed", "issues": ["API-404"]}}"#,
    );
    let snapshot = write(&dir, "snapshot.json", EMPTY_SNAPSHOT);
    tre(&dir)
        .args(["run", "--close", "--snapshot"])
        .arg(&snapshot)
        .arg(&catalog)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("not_found"));
}

#[test]
fn run_needs_catalog_or_checkpoint() {
    let dir = TempDir::new().unwrap();
    tre(&dir)
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no catalog files given"));
}

// ---------------------------------------------------------------------------
// tre status
// ---------------------------------------------------------------------------

#[test]
fn status_of_missing_checkpoint_fails() {
    let dir = TempDir::new().unwrap();
    tre(&dir)
        .args(["status", "nope.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load checkpoint"));
}
