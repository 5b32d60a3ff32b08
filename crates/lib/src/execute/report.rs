//! The machine-readable run report.
//!
//! A finished run is described by a result document:
//!
//! ```json
//! {
//!   "type": "result",
//!   "success": true,
//!   "pipelines": { "tree": { "id": "...", "success": true, "cached": false, "steps": [...] } },
//!   "exports": { "tree": "/out/tree" }
//! }
//! ```
//!
//! A run that could not finish is described by an error document:
//!
//! ```json
//! { "type": "error", "success": false, "error": { "kind": "validation", "message": "...", "details": [...] } }
//! ```

use serde_json::{Value, json};

use super::{ExecuteError, RunResult};
use crate::sources::SourceError;

pub fn result_document(result: &RunResult) -> Value {
  let mut doc = json!({
    "type": "result",
    "success": result.success,
    "pipelines": result.pipelines,
    "exports": result.exports,
  });
  if let Some(failure) = &result.failure {
    doc["failure"] = json!(failure);
  }
  doc
}

pub fn error_document(error: &ExecuteError) -> Value {
  let details = match error {
    ExecuteError::Validation(e) => json!(e.issues),
    ExecuteError::Source(SourceError::Integrity {
      source_kind,
      item,
      actual,
    }) => json!({"source": source_kind, "item": item, "actual": actual}),
    ExecuteError::UnknownExport(name) => json!({"export": name}),
    _ => Value::Null,
  };

  json!({
    "type": "error",
    "success": false,
    "error": {
      "kind": error.kind(),
      "message": error.to_string(),
      "details": details,
    },
  })
}
