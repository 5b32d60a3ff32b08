use predicates::prelude::*;
use serde_json::json;

use super::common::{TestEnv, stdout_json};

fn manifest() -> serde_json::Value {
  json!({
    "version": "2",
    "pipelines": [{"name": "base", "stages": [{"type": "touch"}]}]
  })
}

#[test]
fn gc_with_empty_store_succeeds() {
  let env = TestEnv::empty();

  env
    .treebuild_cmd()
    .args(["gc", "--max-size", "0"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete"));
}

#[test]
fn gc_without_budget_is_usage_error() {
  let env = TestEnv::empty();

  env
    .treebuild_cmd()
    .arg("gc")
    .assert()
    .code(2)
    .stderr(predicate::str::contains("--max-size"));
}

#[test]
fn gc_dry_run_keeps_objects() {
  let env = TestEnv::with_manifest(&manifest());
  env.build_cmd(&["--export", "base"]).assert().success();
  assert_eq!(env.object_count(), 1);

  env
    .treebuild_cmd()
    .args(["gc", "--max-size", "0", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));
  assert_eq!(env.object_count(), 1);
}

#[test]
fn gc_evicts_down_to_budget() {
  let env = TestEnv::with_manifest(&manifest());
  env.build_cmd(&["--export", "base"]).assert().success();

  let output = env
    .treebuild_cmd()
    .args(["gc", "--max-size", "0", "--json"])
    .output()
    .unwrap();
  assert!(output.status.success());
  let doc = stdout_json(&output);
  assert_eq!(doc["stats"]["objects_deleted"], 1);
  assert_eq!(env.object_count(), 0);
}

#[test]
fn gc_uses_configured_budget() {
  let env = TestEnv::with_manifest(&manifest());
  env.build_cmd(&["--export", "base"]).assert().success();
  env.write_file("store/store.json", r#"{"max_size": 1073741824}"#);

  let output = env.treebuild_cmd().args(["gc", "--json"]).output().unwrap();
  assert!(output.status.success());
  assert_eq!(stdout_json(&output)["stats"]["objects_deleted"], 0);
  assert_eq!(env.object_count(), 1);
}
