//! Failing runs: step failures, bad sources, interrupts and invalid input.

use std::fs;
use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use treebuild_lib::execute::ExecuteError;
use treebuild_lib::sources::SourceError;
use treebuild_lib::store::Store;

use crate::common::TestEnv;

fn flaky_manifest() -> Value {
  json!({
    "version": "2",
    "pipelines": [
      {"name": "base", "stages": [{"type": "write", "options": {"path": "/base", "content": "ok"}}]},
      {
        "name": "image",
        "build": "name:base",
        "stages": [
          {"type": "write", "options": {"path": "/before", "content": "1"}},
          {"type": "flaky"},
          {"type": "write", "options": {"path": "/after", "content": "2"}}
        ]
      }
    ]
  })
}

#[tokio::test]
async fn failed_step_stops_run_and_keeps_record() {
  let env = TestEnv::new();
  fs::write(env.marker(), "").unwrap();

  let result = env.run(&flaky_manifest(), &env.config(&["image"])).await.unwrap();
  assert!(!result.success);
  let failure = result.failure.as_ref().unwrap();
  assert_eq!(failure.pipeline, "image");
  assert!(failure.record.is_file());

  let image = &result.pipelines["image"];
  assert!(!image.success);
  assert_eq!(image.steps.len(), 2);
  assert!(image.steps[1].stderr.contains("flaky failure"));
  assert!(result.exports.is_empty());
  assert_eq!(env.logged(), vec!["write /base", "write /before", "flaky"]);

  let store = Store::open(env.store()).unwrap();
  let record = store.read_failure(&failure.step).unwrap().unwrap();
  assert_eq!(record.pipeline, "image");
  // the build root finished before the failure and stays usable
  assert!(store.has(&result.pipelines["base"].id));
  assert!(!store.has(&image.id));

  fs::remove_file(env.marker()).unwrap();
  let retry = env.run(&flaky_manifest(), &env.config(&["image"])).await.unwrap();
  assert!(retry.success);
  assert!(retry.pipelines["base"].cached);
}

fn inline_manifest(data: &[u8], digest: &str) -> Value {
  json!({
    "version": "2",
    "pipelines": [{
      "name": "tree",
      "stages": [{
        "type": "copy",
        "inputs": {"tree": {"type": "files", "origin": "source", "references": [digest]}}
      }]
    }],
    "sources": {
      "inline": {"items": {digest: {"encoding": "base64", "data": STANDARD.encode(data)}}}
    }
  })
}

#[tokio::test]
async fn source_files_reach_steps() {
  let env = TestEnv::new();
  let digest = format!("sha256:{}", hex::encode(Sha256::digest(b"payload")));

  let result = env.run(&inline_manifest(b"payload", &digest), &env.config(&["tree"])).await.unwrap();
  assert!(result.success, "{:?}", result.failure);
  let copied = result.exports["tree"].join(&digest);
  assert_eq!(fs::read(copied).unwrap(), b"payload");
}

#[tokio::test]
async fn integrity_failure_builds_nothing() {
  let env = TestEnv::new();
  let digest = format!("sha256:{}", hex::encode(Sha256::digest(b"expected")));

  let err = env
    .run(&inline_manifest(b"tampered", &digest), &env.config(&["tree"]))
    .await
    .unwrap_err();
  assert!(matches!(err, ExecuteError::Source(SourceError::Integrity { .. })), "{err}");
  assert_eq!(err.kind(), "integrity");
  assert!(env.logged().is_empty());
  assert_eq!(env.object_count(), 0);

  let cache = env.store().join("sources/files");
  let cached = fs::read_dir(&cache).map(|d| d.count()).unwrap_or(0);
  assert_eq!(cached, 0);
}

#[tokio::test]
async fn interrupt_stops_before_next_step() {
  let env = TestEnv::new();
  let config = env.config(&["image"]);
  config.interrupt.store(true, Ordering::SeqCst);

  let err = env.run(&flaky_manifest(), &config).await.unwrap_err();
  assert!(matches!(err, ExecuteError::Interrupted));
  assert_eq!(err.kind(), "interrupted");
  assert!(env.logged().is_empty());
}

/// A device or mount service logging `<name> <method>` for every call.
fn install_service(env: &TestEnv, dir: &str, name: &str, reply: &str) {
  env.module(
    dir,
    name,
    &format!(
      r#"while read -r line; do
  method=$(printf '%s' "$line" | sed 's/.*"name":"\([a-z]*\)".*/\1/')
  echo "{name} $method" >> '{log}'
  echo '{{"type":"reply","data":{{"reply":{reply}}}}}'
done"#,
      log = env.log().display()
    ),
  );
}

#[tokio::test]
async fn interrupt_during_step_still_releases_its_resources() {
  let env = TestEnv::new();
  let started = env.temp.path().join("started");
  let release = env.temp.path().join("release");
  install_service(&env, "devices", "loopback", r#"{"path":"/dev/null"}"#);
  install_service(&env, "mounts", "ext4", "null");
  env.module(
    "steps",
    "slow",
    &format!(
      r#"cat > /dev/null
echo slow >> '{log}'
touch '{started}'
i=0
while [ ! -e '{release}' ] && [ $i -lt 400 ]; do sleep 0.05; i=$((i + 1)); done"#,
      log = env.log().display(),
      started = started.display(),
      release = release.display()
    ),
  );

  let manifest = json!({
    "version": "2",
    "pipelines": [{
      "name": "image",
      "stages": [
        {
          "type": "slow",
          "devices": [{"name": "disk", "type": "loopback"}],
          "mounts": [{"name": "root", "type": "ext4", "source": "disk", "target": "/"}]
        },
        {"type": "write", "options": {"path": "/after", "content": "2"}}
      ]
    }]
  });
  let config = env.config(&["image"]);
  let flag = config.interrupt.clone();

  let interrupter = async {
    while !started.exists() {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    flag.store(true, Ordering::SeqCst);
    fs::write(&release, "").unwrap();
  };
  let (result, ()) = tokio::join!(env.run(&manifest, &config), interrupter);

  assert!(matches!(result, Err(ExecuteError::Interrupted)), "{result:?}");
  assert_eq!(
    env.logged(),
    vec!["loopback open", "ext4 mount", "slow", "ext4 umount", "loopback close"]
  );
  assert_eq!(env.object_count(), 0);
}

#[tokio::test]
async fn unknown_export_is_rejected() {
  let env = TestEnv::new();
  let err = env.run(&flaky_manifest(), &env.config(&["missing"])).await.unwrap_err();
  assert!(matches!(err, ExecuteError::UnknownExport(ref name) if name == "missing"));
}

#[tokio::test]
async fn invalid_manifest_reports_every_issue() {
  let env = TestEnv::new();
  let manifest = json!({
    "version": "2",
    "pipelines": [
      {"name": "a", "stages": [{"type": "no-such-step"}]},
      {"name": "b", "build": "name:nowhere", "stages": [{"type": "write"}]}
    ]
  });

  let err = env.run(&manifest, &env.config(&["a"])).await.unwrap_err();
  let ExecuteError::Validation(validation) = &err else {
    panic!("expected validation error, got {err}");
  };
  assert!(validation.issues.len() >= 2);
  assert_eq!(err.kind(), "validation");
  assert!(env.logged().is_empty());
}
