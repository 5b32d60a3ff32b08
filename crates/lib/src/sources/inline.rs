//! The built-in `inline` source: item content embedded in the manifest.
//!
//! ```json
//! "sources": {
//!   "inline": {
//!     "items": {
//!       "sha256:2cf24d...": { "encoding": "base64", "data": "aGVsbG8=" }
//!     }
//!   }
//! }
//! ```

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::debug;

use super::{SourceError, store_verified};
use crate::util::hash::Checksum;

pub fn fetch(source_kind: &str, checksum: &Checksum, item: &Value, cache: &Path) -> Result<(), SourceError> {
  let fail = |message: String| SourceError::Fetch {
    source_kind: source_kind.to_string(),
    item: checksum.to_string(),
    message,
  };

  let encoding = item.get("encoding").and_then(Value::as_str).unwrap_or("base64");
  if encoding != "base64" {
    return Err(fail(format!("unsupported encoding '{encoding}'")));
  }
  let data = item
    .get("data")
    .and_then(Value::as_str)
    .ok_or_else(|| fail("missing 'data'".to_string()))?;
  let bytes = STANDARD.decode(data).map_err(|e| fail(e.to_string()))?;

  debug!(item = %checksum, size = bytes.len(), "decoded inline item");
  store_verified(source_kind, checksum, &bytes, cache)
}
