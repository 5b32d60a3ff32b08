use predicates::prelude::*;
use serde_json::json;

use super::common::{TestEnv, stdout_json};

fn two_pipelines() -> serde_json::Value {
  json!({
    "version": "2",
    "pipelines": [
      {"name": "base", "stages": [{"type": "touch"}]},
      {"name": "broken", "build": "name:base", "stages": [{"type": "fail"}]}
    ]
  })
}

#[test]
fn build_exports_store_path() {
  let env = TestEnv::with_manifest(&two_pipelines());

  let output = env.build_cmd(&["--export", "base", "--json"]).output().unwrap();
  assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

  let doc = stdout_json(&output);
  assert_eq!(doc["type"], "result");
  assert_eq!(doc["success"], true);
  let path = doc["exports"]["base"].as_str().unwrap();
  assert!(std::path::Path::new(path).join("touched").exists());
  assert_eq!(doc["pipelines"]["base"]["steps"][0]["stdout"], "touched\n");
  assert!(doc["pipelines"].get("broken").is_none());
}

#[test]
fn rebuild_is_cached() {
  let env = TestEnv::with_manifest(&two_pipelines());
  env.build_cmd(&["--export", "base"]).assert().success();

  env
    .build_cmd(&["--export", "base"])
    .assert()
    .success()
    .stdout(predicate::str::contains("(cached)"))
    .stdout(predicate::str::contains("Steps run: 0"));
}

#[test]
fn failed_step_exits_one_with_captured_stderr() {
  let env = TestEnv::with_manifest(&two_pipelines());

  env
    .build_cmd(&["--export", "broken"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("Pipeline 'broken' failed"))
    .stderr(predicate::str::contains("disk on fire"));

  // the build root finished first and was committed
  assert_eq!(env.object_count(), 1);
  let failures = std::fs::read_dir(env.store_path().join("failures")).unwrap().count();
  assert_eq!(failures, 1);
}

#[test]
fn failed_build_json_reports_failure() {
  let env = TestEnv::with_manifest(&two_pipelines());

  let output = env.build_cmd(&["--export", "broken", "--json"]).output().unwrap();
  assert_eq!(output.status.code(), Some(1));
  let doc = stdout_json(&output);
  assert_eq!(doc["success"], false);
  assert_eq!(doc["pipelines"]["broken"]["success"], false);
  assert!(doc["pipelines"]["broken"]["steps"][0]["stderr"].as_str().unwrap().contains("disk on fire"));
}

#[test]
fn unknown_module_is_validation_error() {
  let env = TestEnv::with_manifest(&json!({
    "version": "2",
    "pipelines": [{"name": "tree", "stages": [{"type": "does-not-exist"}]}]
  }));

  let output = env.build_cmd(&["--export", "tree", "--json"]).output().unwrap();
  assert_eq!(output.status.code(), Some(2));
  let doc = stdout_json(&output);
  assert_eq!(doc["type"], "error");
  assert_eq!(doc["error"]["kind"], "validation");
  assert_eq!(doc["error"]["details"][0]["path"], "/pipelines/0/stages/0/type");
}

#[test]
fn unknown_export_is_validation_error() {
  let env = TestEnv::with_manifest(&two_pipelines());
  env
    .build_cmd(&["--export", "nope"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("nope"));
}

#[test]
fn output_directory_receives_exports() {
  let env = TestEnv::with_manifest(&two_pipelines());
  let out = env.output_path();

  env
    .build_cmd(&["--export", "base", "--output-directory", out.to_str().unwrap()])
    .assert()
    .success();

  assert!(out.join("base/touched").exists());
  assert_eq!(env.object_count(), 0);
}

#[test]
fn checkpoint_commits_output_directory_export() {
  let env = TestEnv::with_manifest(&two_pipelines());
  let out = env.output_path();

  env
    .build_cmd(&[
      "--export",
      "base",
      "--checkpoint",
      "base",
      "--output-directory",
      out.to_str().unwrap(),
    ])
    .assert()
    .success();

  assert_eq!(env.object_count(), 1);
}

#[test]
fn secrets_file_must_be_json() {
  let env = TestEnv::with_manifest(&two_pipelines());
  let secrets = env.write_file("secrets.json", "[1, 2");

  env
    .build_cmd(&["--export", "base", "--secrets", secrets.to_str().unwrap()])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("--secrets"));
}

#[test]
fn build_env_runs_before_pipelines() {
  let env = TestEnv::with_manifest(&two_pipelines());
  let build_env = env.write_file("build-env.json", r#"{"name": "ignored", "stages": [{"type": "touch"}]}"#);

  let output = env
    .build_cmd(&["--export", "base", "--json", "--build-env", build_env.to_str().unwrap()])
    .output()
    .unwrap();
  assert!(output.status.success());
  let doc = stdout_json(&output);
  assert_eq!(doc["pipelines"]["build-env"]["success"], true);
}

#[test]
fn cache_max_size_is_recorded_and_enforced() {
  let env = TestEnv::with_manifest(&two_pipelines());

  env
    .build_cmd(&["--export", "base", "--cache-max-size", "0"])
    .assert()
    .success();

  let config: serde_json::Value =
    serde_json::from_slice(&std::fs::read(env.store_path().join("store.json")).unwrap()).unwrap();
  assert_eq!(config["max_size"], 0);
  // entries of the manifest just built are live and survive collection
  assert_eq!(env.object_count(), 1);
}
