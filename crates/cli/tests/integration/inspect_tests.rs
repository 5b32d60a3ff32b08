use predicates::prelude::*;
use serde_json::json;

use super::common::{TestEnv, stdout_json};

fn manifest() -> serde_json::Value {
  json!({
    "version": "2",
    "pipelines": [
      {"name": "base", "stages": [{"type": "touch"}]},
      {"name": "image", "build": "name:base", "stages": [{"type": "touch", "options": {"again": true}}]}
    ]
  })
}

#[test]
fn inspect_prints_ids_and_order() {
  let env = TestEnv::with_manifest(&manifest());

  let output = env
    .treebuild_cmd()
    .arg("inspect")
    .arg(&env.manifest_path)
    .arg("--json")
    .output()
    .unwrap();
  assert!(output.status.success());

  let doc = stdout_json(&output);
  assert_eq!(doc["order"], json!([["base"], ["image"]]));
  let image = &doc["pipelines"][1];
  assert_eq!(image["build"], "base");
  assert_eq!(image["id"].as_str().unwrap().len(), 64);
  assert_eq!(image["id"], image["steps"][0]["id"]);
}

#[test]
fn inspect_ids_are_stable() {
  let env = TestEnv::with_manifest(&manifest());
  let run = || {
    let output = env
      .treebuild_cmd()
      .arg("inspect")
      .arg(&env.manifest_path)
      .arg("--json")
      .output()
      .unwrap();
    stdout_json(&output)
  };
  assert_eq!(run(), run());
}

#[test]
fn inspect_marks_cached_pipelines() {
  let env = TestEnv::with_manifest(&manifest());
  env.build_cmd(&["--export", "base"]).assert().success();

  env
    .treebuild_cmd()
    .arg("inspect")
    .arg(&env.manifest_path)
    .arg("--store")
    .arg(env.store_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("(cached)"));
}

#[test]
fn inspect_reports_all_issues() {
  let env = TestEnv::with_manifest(&json!({
    "version": "2",
    "pipelines": [
      {"name": "a", "stages": [{"type": "missing"}]},
      {"name": "a", "stages": []}
    ]
  }));

  env
    .treebuild_cmd()
    .arg("inspect")
    .arg(&env.manifest_path)
    .assert()
    .code(2)
    .stderr(predicate::str::contains("/pipelines/0/stages/0/type"))
    .stderr(predicate::str::contains("/pipelines/1/name"));
}
