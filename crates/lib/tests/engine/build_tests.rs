//! Building exports: trees, dependencies and output directories.

use std::fs;

use serde_json::json;
use treebuild_lib::manifest::PipelineDesc;

use crate::common::{TestEnv, mode_of};

const GIB: u64 = 1024 * 1024 * 1024;

fn newfile_manifest() -> serde_json::Value {
  json!({
    "version": "2",
    "pipelines": [{
      "name": "tree",
      "stages": [
        {"type": "mkfile", "options": {"path": "/newfile", "size": GIB}},
        {"type": "chmod", "options": {"path": "/newfile", "mode": "0444"}}
      ]
    }]
  })
}

#[tokio::test]
async fn builds_file_then_reuses_store_entry() {
  let env = TestEnv::new();
  let config = env.config(&["tree"]);

  let result = env.run(&newfile_manifest(), &config).await.unwrap();
  assert!(result.success);
  assert_eq!(result.executed_steps(), 2);

  let tree = &result.exports["tree"];
  let file = tree.join("newfile");
  assert_eq!(fs::metadata(&file).unwrap().len(), GIB);
  assert_eq!(mode_of(&file), 0o444);
  assert!(tree.starts_with(env.store().canonicalize().unwrap()));

  let again = env.run(&newfile_manifest(), &config).await.unwrap();
  assert!(again.success);
  assert_eq!(again.executed_steps(), 0);
  assert!(again.pipelines["tree"].cached);
  assert_eq!(again.exports["tree"], *tree);
  assert_eq!(env.logged(), vec!["mkfile", "chmod"]);
}

#[tokio::test]
async fn tree_input_feeds_later_pipeline() {
  let env = TestEnv::new();
  let manifest = json!({
    "version": "2",
    "pipelines": [
      {
        "name": "files",
        "stages": [{"type": "write", "options": {"path": "/hello", "content": "hi"}}]
      },
      {
        "name": "archive",
        "stages": [{
          "type": "copy",
          "inputs": {"tree": {"type": "tree", "origin": "pipeline", "references": ["name:files"]}}
        }]
      }
    ]
  });
  let mut config = env.config(&["archive"]);
  config.output_dir = Some(env.output());

  let result = env.run(&manifest, &config).await.unwrap();
  assert!(result.success, "{:?}", result.failure);
  assert_eq!(result.exports.len(), 1);
  assert_eq!(result.exports["archive"], env.output().join("archive"));
  assert_eq!(fs::read_to_string(env.output().join("archive/hello")).unwrap(), "hi");
  assert!(!env.output().join("files").exists());

  // the dependency stays in the store, the exported pipeline only in the output
  assert!(result.pipelines["files"].success);
  assert_eq!(env.object_count(), 1);
  assert_eq!(env.logged(), vec!["write /hello", "copy"]);
}

#[tokio::test]
async fn only_exported_subgraph_is_built() {
  let env = TestEnv::new();
  let manifest = json!({
    "version": "2",
    "pipelines": [
      {"name": "a", "stages": [{"type": "write", "options": {"path": "/a", "content": "a"}}]},
      {
        "name": "b",
        "stages": [{
          "type": "copy",
          "inputs": {"tree": {"type": "tree", "origin": "pipeline", "references": ["name:a"]}}
        }]
      },
      {"name": "c", "stages": [{"type": "write", "options": {"path": "/c", "content": "c"}}]}
    ]
  });

  let result = env.run(&manifest, &env.config(&["a"])).await.unwrap();
  assert!(result.success);
  assert_eq!(result.pipelines.keys().collect::<Vec<_>>(), vec!["a"]);
  assert_eq!(env.logged(), vec!["write /a"]);
}

#[tokio::test]
async fn no_exports_builds_nothing() {
  let env = TestEnv::new();
  let result = env.run(&newfile_manifest(), &env.config(&[])).await.unwrap();
  assert!(result.success);
  assert!(result.pipelines.is_empty());
  assert!(env.logged().is_empty());
}

#[tokio::test]
async fn exporting_to_output_dir_replaces_previous_export() {
  let env = TestEnv::new();
  let mut config = env.config(&["tree"]);
  config.output_dir = Some(env.output());
  fs::create_dir_all(env.output().join("tree")).unwrap();
  fs::write(env.output().join("tree/stale"), "old").unwrap();

  let manifest = json!({
    "version": "2",
    "pipelines": [{"name": "tree", "stages": [{"type": "write", "options": {"path": "/fresh", "content": "new"}}]}]
  });
  let result = env.run(&manifest, &config).await.unwrap();
  assert!(result.success);
  assert!(!env.output().join("tree/stale").exists());
  assert_eq!(fs::read_to_string(env.output().join("tree/fresh")).unwrap(), "new");
  // exported with an output directory and not needed elsewhere: not committed
  assert_eq!(env.object_count(), 0);
}

#[tokio::test]
async fn build_env_pipeline_is_built_first() {
  let env = TestEnv::new();
  let mut config = env.config(&["tree"]);
  config.build_env = Some(PipelineDesc {
    name: "build-env".to_string(),
    build: None,
    source_epoch: None,
    stages: vec![
      serde_json::from_value(json!({"type": "write", "options": {"path": "/env", "content": "host"}})).unwrap(),
    ],
  });

  let manifest = json!({
    "version": "2",
    "pipelines": [{"name": "tree", "stages": [{"type": "write", "options": {"path": "/out", "content": "x"}}]}]
  });
  let result = env.run(&manifest, &config).await.unwrap();
  assert!(result.success, "{:?}", result.failure);
  assert!(result.pipelines.contains_key("build-env"));
  assert_eq!(env.logged(), vec!["write /env", "write /out"]);
}

#[tokio::test]
async fn source_epoch_reaches_steps() {
  let env = TestEnv::new();
  env.module("steps", "epoch", r#"cat > /dev/null; printf '%s' "$SOURCE_DATE_EPOCH" > "$TREEBUILD_TREE/epoch""#);
  let manifest = json!({
    "version": "2",
    "pipelines": [{"name": "tree", "source_epoch": 1700000000, "stages": [{"type": "epoch"}]}]
  });

  let result = env.run(&manifest, &env.config(&["tree"])).await.unwrap();
  assert_eq!(fs::read_to_string(result.exports["tree"].join("epoch")).unwrap(), "1700000000");
}

#[tokio::test]
async fn step_metadata_is_reported() {
  let env = TestEnv::new();
  env.module("steps", "meta", r#"cat > /dev/null; echo '{"packages": ["base"]}' > "$TREEBUILD_META""#);
  let manifest = json!({
    "version": "2",
    "pipelines": [{"name": "tree", "stages": [{"type": "meta"}]}]
  });

  let result = env.run(&manifest, &env.config(&["tree"])).await.unwrap();
  let step = &result.pipelines["tree"].steps[0];
  assert_eq!(step.kind, "meta");
  assert_eq!(step.metadata, json!({"packages": ["base"]}));
}
