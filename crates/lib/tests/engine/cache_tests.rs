//! Store reuse across runs.

use serde_json::{Value, json};

use crate::common::TestEnv;

fn chain(content: &str) -> Value {
  json!({
    "version": "2",
    "pipelines": [
      {"name": "base", "stages": [{"type": "write", "options": {"path": "/base", "content": "base"}}]},
      {
        "name": "image",
        "stages": [
          {
            "type": "copy",
            "inputs": {"tree": {"type": "tree", "origin": "pipeline", "references": ["name:base"]}}
          },
          {"type": "write", "options": {"path": "/a", "content": "a"}},
          {"type": "write", "options": {"path": "/b", "content": content}}
        ]
      }
    ]
  })
}

#[tokio::test]
async fn cached_export_skips_its_dependencies() {
  let env = TestEnv::new();
  let config = env.config(&["image"]);

  let first = env.run(&chain("b"), &config).await.unwrap();
  assert!(first.success);
  assert_eq!(first.executed_steps(), 4);

  let second = env.run(&chain("b"), &config).await.unwrap();
  assert!(second.success);
  assert_eq!(second.executed_steps(), 0);
  // a cached export ends the walk before its dependencies are looked at
  assert!(!second.pipelines.contains_key("base"));
  assert!(second.pipelines["image"].steps.iter().all(|s| s.cached));
}

#[tokio::test]
async fn changed_step_rebuilds_from_checkpoint() {
  let env = TestEnv::new();
  let first = env.run(&chain("b"), &env.config(&["image"])).await.unwrap();
  let checkpoint = first.pipelines["image"].steps[1].id.to_string();

  // same chain again, committing the interior step this time
  let mut config = env.config(&["image"]);
  config.checkpoints = vec![checkpoint];
  let changed = env.run(&chain("b2"), &config).await.unwrap();
  assert_eq!(changed.executed_steps(), 3);

  let resumed = env.run(&chain("b3"), &config).await.unwrap();
  assert!(resumed.success);
  assert_eq!(resumed.executed_steps(), 1);
  let steps = &resumed.pipelines["image"].steps;
  assert!(steps[0].cached && steps[1].cached && !steps[2].cached);

  let tree = &resumed.exports["image"];
  assert_eq!(std::fs::read_to_string(tree.join("base")).unwrap(), "base");
  assert_eq!(std::fs::read_to_string(tree.join("b")).unwrap(), "b3");
}

#[tokio::test]
async fn identical_definitions_share_entries() {
  let env = TestEnv::new();
  let manifest = json!({
    "version": "2",
    "pipelines": [
      {"name": "one", "stages": [{"type": "write", "options": {"path": "/x", "content": "x"}}]},
      {"name": "two", "stages": [{"type": "write", "options": {"path": "/x", "content": "x"}}]}
    ]
  });

  let result = env.run(&manifest, &env.config(&["one"])).await.unwrap();
  assert!(result.success);
  let other = env.run(&manifest, &env.config(&["two"])).await.unwrap();
  assert_eq!(other.executed_steps(), 0);
  assert_eq!(result.pipelines["one"].id, other.pipelines["two"].id);
}
