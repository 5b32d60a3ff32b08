//! Source fetching.
//!
//! Sources fill a per-content-type cache in the store before any step runs.
//! Items of the `files` content type are named by their checksum and land at
//! `<store>/sources/files/<checksum>`; an item already present is not fetched
//! again. A fetched file whose bytes do not hash to its name is deleted and
//! the run fails with [`SourceError::Integrity`].
//!
//! The built-in `inline` and `curl` sources fetch item by item. External
//! source modules are called once per source with every missing item.

pub mod curl;
pub mod inline;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::ipc::{IpcError, call_oneshot};
use crate::modules::{Builtin, FILES_CONTENT_TYPE, ModuleImpl};
use crate::resolve::ResolvedSource;
use crate::store::{Store, StoreError};
use crate::util::hash::{Checksum, ChecksumError};

#[derive(Debug, Error)]
pub enum SourceError {
  #[error("integrity error: {item} from source '{source_kind}' has digest {actual}")]
  Integrity {
    source_kind: String,
    item: String,
    actual: String,
  },

  #[error("source '{source_kind}' failed to fetch {item}: {message}")]
  Fetch {
    source_kind: String,
    item: String,
    message: String,
  },

  #[error("source '{source_kind}': {source}")]
  Module {
    source_kind: String,
    #[source]
    source: IpcError,
  },

  #[error(transparent)]
  Checksum(#[from] ChecksumError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl SourceError {
  pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
    SourceError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// How sources are fetched.
#[derive(Debug, Clone)]
pub struct FetchOptions {
  /// Upper bound on concurrent fetches.
  pub parallelism: usize,
  /// Per-source-type secrets handed to external source modules.
  pub secrets: BTreeMap<String, Value>,
  pub timeout: Option<Duration>,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      parallelism: 4,
      secrets: BTreeMap::new(),
      timeout: None,
    }
  }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct FetchStats {
  pub fetched: usize,
  pub cached: usize,
}

/// One unit of fetch work.
enum Job {
  Item {
    builtin: Builtin,
    source_kind: String,
    key: String,
    item: Value,
  },
  External {
    source: ResolvedSource,
    items: BTreeMap<String, Value>,
  },
}

/// Make every source item available in the store's source caches.
pub async fn fetch_all(
  sources: &[ResolvedSource],
  store: &Store,
  options: &FetchOptions,
) -> Result<FetchStats, SourceError> {
  let mut stats = FetchStats::default();
  let mut jobs = Vec::new();
  let mut fetched: Vec<(String, PathBuf, String)> = Vec::new();

  for source in sources {
    let cache = store.source_cache(source.module.meta.content_type())?;
    let missing: BTreeMap<String, Value> = source
      .items
      .iter()
      .filter(|(key, _)| !cache.join(key).exists())
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();

    stats.cached += source.items.len() - missing.len();
    if missing.is_empty() {
      continue;
    }
    debug!(source = %source.kind, missing = missing.len(), "source items to fetch");

    if source.module.meta.content_type() == FILES_CONTENT_TYPE {
      fetched.extend(missing.keys().map(|k| (source.kind.clone(), cache.clone(), k.clone())));
    }
    stats.fetched += missing.len();

    match &source.module.implementation {
      ModuleImpl::Builtin(builtin) => {
        jobs.extend(missing.into_iter().map(|(key, item)| Job::Item {
          builtin: *builtin,
          source_kind: source.kind.clone(),
          key,
          item,
        }));
      }
      ModuleImpl::External(_) => jobs.push(Job::External {
        source: source.clone(),
        items: missing,
      }),
    }
  }

  if jobs.is_empty() {
    return Ok(stats);
  }

  info!(jobs = jobs.len(), "fetching sources");
  let semaphore = Arc::new(Semaphore::new(options.parallelism.max(1)));
  let client = reqwest::Client::new();
  let mut join_set = JoinSet::new();

  for job in jobs {
    let semaphore = semaphore.clone();
    let client = client.clone();
    let store = store.clone();
    let options = options.clone();

    join_set.spawn(async move {
      let _permit = semaphore
        .acquire()
        .await
        .map_err(|e| SourceError::io(store.root(), std::io::Error::other(e)))?;
      run_job(job, &store, &client, &options).await
    });
  }

  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        error!(error = %e, "source fetch failed");
        return Err(e);
      }
      Err(e) => {
        return Err(SourceError::io(store.root(), std::io::Error::other(e)));
      }
    }
  }

  // Modules are untrusted: check what they left behind.
  for (source_kind, cache, key) in fetched {
    verify_item(&source_kind, &cache, &key)?;
  }

  info!(fetched = stats.fetched, cached = stats.cached, "sources ready");
  Ok(stats)
}

async fn run_job(job: Job, store: &Store, client: &reqwest::Client, options: &FetchOptions) -> Result<(), SourceError> {
  match job {
    Job::Item {
      builtin,
      source_kind,
      key,
      item,
    } => {
      let checksum: Checksum = key.parse()?;
      let cache = store.source_cache(FILES_CONTENT_TYPE)?;
      match builtin {
        Builtin::InlineSource => inline::fetch(&source_kind, &checksum, &item, &cache),
        Builtin::CurlSource => curl::fetch(client, &source_kind, &checksum, &item, &cache).await,
        Builtin::TreeInput | Builtin::FilesInput => Err(SourceError::Fetch {
          source_kind,
          item: key,
          message: "not a source module".to_string(),
        }),
      }
    }
    Job::External { source, items } => fetch_external(&source, items, store, options).await,
  }
}

async fn fetch_external(
  source: &ResolvedSource,
  items: BTreeMap<String, Value>,
  store: &Store,
  options: &FetchOptions,
) -> Result<(), SourceError> {
  let Some(executable) = source.module.executable() else {
    return Ok(());
  };
  let cache = store.source_cache(source.module.meta.content_type())?;
  let checksums: Vec<&String> = items.keys().collect();

  let mut request = json!({
    "items": items,
    "options": source.options,
    "cache": cache,
    "checksums": checksums,
  });
  if let Some(secrets) = options.secrets.get(&source.kind) {
    request["secrets"] = secrets.clone();
  }

  let module_error = |e: IpcError| SourceError::Module {
    source_kind: source.kind.clone(),
    source: e,
  };

  let mut cmd = Command::new(executable);
  cmd.current_dir(&cache);
  let output = call_oneshot(cmd, &request, options.timeout).await.map_err(module_error)?;

  if !output.success() {
    return Err(module_error(IpcError::Failed {
      module: source.kind.clone(),
      status: output.describe_status(),
      stderr: output.stderr.trim().to_string(),
    }));
  }
  debug!(source = %source.kind, duration = ?output.duration, "external source finished");
  Ok(())
}

/// Check the cached file for `key` against its checksum, removing it on mismatch.
pub fn verify_item(source_kind: &str, cache: &Path, key: &str) -> Result<(), SourceError> {
  let checksum: Checksum = key.parse()?;
  let path = cache.join(key);
  if !path.is_file() {
    return Err(SourceError::Fetch {
      source_kind: source_kind.to_string(),
      item: key.to_string(),
      message: format!("{} was not created", path.display()),
    });
  }

  let actual = crate::util::hash::hash_file(&path, checksum.algo).map_err(|e| SourceError::io(&path, e))?;
  if actual != checksum.hex {
    fs::remove_file(&path).map_err(|e| SourceError::io(&path, e))?;
    return Err(SourceError::Integrity {
      source_kind: source_kind.to_string(),
      item: key.to_string(),
      actual: format!("{}:{actual}", checksum.algo.as_str()),
    });
  }
  Ok(())
}

/// Write `data` into the cache under `checksum`, refusing content that does
/// not match. The file appears under its final name only once complete.
pub(crate) fn store_verified(
  source_kind: &str,
  checksum: &Checksum,
  data: &[u8],
  cache: &Path,
) -> Result<(), SourceError> {
  if !checksum.matches_bytes(data) {
    let actual = {
      let mut hasher = crate::util::hash::StreamHasher::new(checksum.algo);
      hasher.update(data);
      hasher.finalize_hex()
    };
    return Err(SourceError::Integrity {
      source_kind: source_kind.to_string(),
      item: checksum.to_string(),
      actual: format!("{}:{actual}", checksum.algo.as_str()),
    });
  }
  let dest = cache.join(checksum.to_string());
  crate::util::fs::atomic_write(&dest, data).map_err(|e| SourceError::io(&dest, e))
}
