//! The built-in `curl` source: items downloaded over HTTP(S).
//!
//! An item is either a URL string or `{ "url": ... }`. The body is streamed
//! into a temporary file inside the cache and hashed on the way; it is
//! renamed to its checksum only when the digest matches.

use std::path::Path;

use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::SourceError;
use crate::util::hash::{Checksum, StreamHasher};

pub async fn fetch(
  client: &reqwest::Client,
  source_kind: &str,
  checksum: &Checksum,
  item: &Value,
  cache: &Path,
) -> Result<(), SourceError> {
  let fail = |message: String| SourceError::Fetch {
    source_kind: source_kind.to_string(),
    item: checksum.to_string(),
    message,
  };

  let url = match item {
    Value::String(url) => url.as_str(),
    other => other
      .get("url")
      .and_then(Value::as_str)
      .ok_or_else(|| fail("missing 'url'".to_string()))?,
  };
  info!(url = %url, item = %checksum, "fetching URL");

  let mut response = client.get(url).send().await.map_err(|e| fail(e.to_string()))?;
  if !response.status().is_success() {
    return Err(fail(format!("HTTP {}", response.status())));
  }

  let temp = NamedTempFile::with_prefix_in(".download-", cache).map_err(|e| SourceError::io(cache, e))?;
  let std_file = temp.as_file().try_clone().map_err(|e| SourceError::io(temp.path(), e))?;
  let mut file = tokio::fs::File::from_std(std_file);
  let mut hasher = StreamHasher::new(checksum.algo);
  let mut size = 0u64;

  while let Some(chunk) = response.chunk().await.map_err(|e| fail(e.to_string()))? {
    hasher.update(&chunk);
    size += chunk.len() as u64;
    file.write_all(&chunk).await.map_err(|e| SourceError::io(temp.path(), e))?;
  }
  file.flush().await.map_err(|e| SourceError::io(temp.path(), e))?;
  drop(file);

  let actual = hasher.finalize_hex();
  if actual != checksum.hex {
    return Err(SourceError::Integrity {
      source_kind: source_kind.to_string(),
      item: checksum.to_string(),
      actual: format!("{}:{actual}", checksum.algo.as_str()),
    });
  }

  let dest = cache.join(checksum.to_string());
  temp.persist(&dest).map_err(|e| SourceError::io(&dest, e.error))?;
  debug!(path = %dest.display(), size, "download complete");
  Ok(())
}
