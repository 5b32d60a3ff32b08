//! Step execution.
//!
//! [`Sandbox::execute`] runs one step against a working tree:
//!
//! 1. inputs are materialized,
//! 2. devices are opened in declaration order,
//! 3. mounts are attached in declaration order,
//! 4. the step module runs, either directly on the host with a scrubbed
//!    environment or inside private namespaces chrooted into the build root,
//! 5. mounts and then devices are released in reverse order.
//!
//! Step 5 always runs, whatever failed before it. Failures of steps 1 to 4
//! are reported as a failed [`StepOutcome`] carrying the captured output;
//! only problems setting up the run directory itself are `Err`.
//!
//! Every run gets a private directory below the store's `tmp/`:
//!
//! ```text
//! run-XXXX/
//! ├── api/          # host API socket and the step's meta.json
//! ├── inputs/<name> # materialized inputs
//! ├── mounts/       # mount root; targets are attached below it
//! └── root/         # becomes / of an isolated step
//! ```

pub mod buildroot;
pub mod caps;
pub mod devices;
pub mod inputs;
pub mod mounts;
pub mod teardown;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::ipc::api::HostApi;
use crate::ipc::{IpcError, call_oneshot};
use crate::modules::ModuleKind;
use crate::platform::is_root;
use crate::resolve::ResolvedStep;
use crate::store::{Store, StoreError};

use buildroot::{BindMount, IsolationPlan};
use inputs::PreparedInput;
use teardown::Teardown;

/// Where engine paths appear inside an isolated step.
pub const SANDBOX_RUN_DIR: &str = "/run/treebuild";

const DEFAULT_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";
const META_FILE: &str = "meta.json";

#[derive(Debug, Error)]
pub enum SandboxError {
  #[error("input '{name}': {message}")]
  Input { name: String, message: String },

  #[error("device '{name}': {message}")]
  Device { name: String, message: String },

  #[error("mount '{name}': {message}")]
  Mount { name: String, message: String },

  #[error("sandbox setup failed: {0}")]
  Setup(String),

  #[error(transparent)]
  Ipc(#[from] IpcError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl SandboxError {
  pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
    SandboxError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// How steps are isolated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
  /// `isolated` when running as root, `host` otherwise.
  #[default]
  Auto,
  Isolated,
  Host,
}

impl SandboxMode {
  /// Resolve `auto` for the current process.
  pub fn effective(self) -> SandboxMode {
    match self {
      SandboxMode::Auto if is_root() => SandboxMode::Isolated,
      SandboxMode::Auto => SandboxMode::Host,
      other => other,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SandboxMode::Auto => "auto",
      SandboxMode::Isolated => "isolated",
      SandboxMode::Host => "host",
    }
  }
}

impl fmt::Display for SandboxMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SandboxMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "auto" => Ok(SandboxMode::Auto),
      "isolated" => Ok(SandboxMode::Isolated),
      "host" => Ok(SandboxMode::Host),
      other => Err(format!("unknown sandbox mode '{other}' (expected auto, isolated or host)")),
    }
  }
}

/// What a step runs against.
#[derive(Debug, Clone, Copy)]
pub struct StepEnv<'a> {
  pub pipeline: &'a str,
  /// The tree the step mutates.
  pub tree: &'a Path,
  /// Tree of the build pipeline; the host root when absent.
  pub build_root: Option<&'a Path>,
  pub source_epoch: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
  pub success: bool,
  pub stdout: String,
  pub stderr: String,
  pub duration: Duration,
  /// Whatever the step wrote to its `meta` file.
  pub metadata: Value,
  pub error: Option<String>,
}

impl StepOutcome {
  fn failed(error: String, duration: Duration) -> Self {
    Self {
      success: false,
      stdout: String::new(),
      stderr: String::new(),
      duration,
      metadata: Value::Null,
      error: Some(error),
    }
  }
}

/// Paths as the step process sees them.
struct View {
  isolated: bool,
  tree: PathBuf,
  inputs: PathBuf,
  mounts: PathBuf,
  api: PathBuf,
}

/// Host side directories of one run.
struct RunDirs {
  api: PathBuf,
  inputs: PathBuf,
  mounts: PathBuf,
  root: PathBuf,
}

impl RunDirs {
  fn create(base: &Path) -> Result<Self, SandboxError> {
    let dirs = RunDirs {
      api: base.join("api"),
      inputs: base.join("inputs"),
      mounts: base.join("mounts"),
      root: base.join("root"),
    };
    for dir in [&dirs.api, &dirs.inputs, &dirs.mounts, &dirs.root] {
      fs::create_dir_all(dir).map_err(|e| SandboxError::io(dir, e))?;
    }
    Ok(dirs)
  }
}

/// A command for a module running on the host, with a scrubbed environment.
pub(crate) fn host_command(executable: &Path, cwd: &Path) -> Command {
  let mut cmd = Command::new(executable);
  cmd
    .env_clear()
    .env("PATH", DEFAULT_PATH)
    .env("LANG", "C")
    .env("LC_ALL", "C")
    .env("HOME", "/homeless-shelter")
    .current_dir(cwd);
  cmd
}

/// Executes steps for one run.
#[derive(Debug, Clone)]
pub struct Sandbox {
  store: Store,
  mode: SandboxMode,
  timeout: Option<Duration>,
}

impl Sandbox {
  pub fn new(store: Store, mode: SandboxMode, timeout: Option<Duration>) -> Self {
    Self {
      store,
      mode: mode.effective(),
      timeout,
    }
  }

  /// The effective mode, never `auto`.
  pub fn mode(&self) -> SandboxMode {
    self.mode
  }

  /// Run `step` against `env.tree`.
  pub async fn execute(&self, step: &ResolvedStep, env: &StepEnv<'_>) -> Result<StepOutcome, SandboxError> {
    let scratch = self.store.scratch_dir("run-")?;
    let dirs = RunDirs::create(scratch.path())?;
    let api = HostApi::start(&dirs.api, self.store.clone())?;

    info!(pipeline = env.pipeline, step = %step.id.short(), module = %step.kind(), "running step");
    let start = Instant::now();
    let mut teardown = Teardown::default();

    let attempt = self.attempt(step, env, &dirs, api.socket_path(), &mut teardown).await;

    let held = teardown.len();
    let teardown_errors = teardown.unwind().await;
    let reported = api.take_error();
    api.shutdown();

    let mut outcome = match attempt {
      Ok(outcome) => outcome,
      Err(e) => StepOutcome::failed(e.to_string(), start.elapsed()),
    };
    if !outcome.success
      && let Some(reason) = reported
    {
      outcome.error = Some(reason);
    }
    outcome.metadata = read_metadata(&dirs.api.join(META_FILE));

    if !teardown_errors.is_empty() {
      outcome.success = false;
      outcome.error = Some(format!("teardown failed: {}", teardown_errors.join("; ")));
      // something may still be mounted below the run directory
      let kept = scratch.keep();
      warn!(path = %kept.display(), "leaving run directory behind after failed teardown");
    } else {
      debug!(released = held, "teardown complete");
    }

    outcome.duration = start.elapsed();
    Ok(outcome)
  }

  async fn attempt(
    &self,
    step: &ResolvedStep,
    env: &StepEnv<'_>,
    dirs: &RunDirs,
    api: &Path,
    teardown: &mut Teardown,
  ) -> Result<StepOutcome, SandboxError> {
    let mut inputs = Vec::with_capacity(step.inputs.len());
    for input in &step.inputs {
      let target = dirs.inputs.join(&input.name);
      inputs.push(inputs::prepare(input, &self.store, &target, api, self.timeout).await?);
    }

    let mut devices: BTreeMap<String, Value> = BTreeMap::new();
    for device in &step.devices {
      let parent = device.parent.as_ref().and_then(|p| devices.get(p));
      let (client, reply) = devices::open(device, parent, env.tree, api).await?;
      teardown.push(ModuleKind::Device, &device.name, devices::CLOSE, client);
      devices.insert(device.name.clone(), reply);
    }

    let mut mounts: BTreeMap<String, Value> = BTreeMap::new();
    for mount in &step.mounts {
      let device = devices.get(&mount.source).ok_or_else(|| SandboxError::Mount {
        name: mount.name.clone(),
        message: format!("device '{}' is not open", mount.source),
      })?;
      let (client, reply) = mounts::attach(mount, device, &dirs.mounts, api).await?;
      teardown.push(ModuleKind::Mount, &mount.name, mounts::UMOUNT, client);
      mounts.insert(mount.name.clone(), reply);
    }

    let executable = step
      .module
      .executable()
      .ok_or_else(|| SandboxError::Setup(format!("step '{}' has no executable", step.kind())))?;

    let (cmd, view) = match self.mode {
      SandboxMode::Isolated => self.isolated_command(step, executable, env, dirs, &inputs, &devices)?,
      _ => host_step_command(executable, env, dirs),
    };

    let request = step_request(step, &view, &inputs, &devices, &mounts);
    let start = Instant::now();

    match call_oneshot(cmd, &request, self.timeout).await {
      Ok(output) => {
        let success = output.success();
        let error = (!success).then(|| format!("step {} failed ({})", step.kind(), output.describe_status()));
        Ok(StepOutcome {
          success,
          stdout: output.stdout,
          stderr: output.stderr,
          duration: output.duration,
          metadata: Value::Null,
          error,
        })
      }
      Err(IpcError::Timeout(limit)) => Ok(StepOutcome::failed(
        format!("step {} timed out after {}", step.kind(), humantime::format_duration(limit)),
        start.elapsed(),
      )),
      Err(e) => Err(e.into()),
    }
  }

  fn isolated_command(
    &self,
    step: &ResolvedStep,
    executable: &Path,
    env: &StepEnv<'_>,
    dirs: &RunDirs,
    inputs: &[PreparedInput],
    devices: &BTreeMap<String, Value>,
  ) -> Result<(Command, View), SandboxError> {
    let keep = caps::keep_set(&step.module.meta.capabilities)
      .map_err(|name| SandboxError::Setup(format!("module {} declares unknown capability {name}", step.kind())))?;

    let run = Path::new(SANDBOX_RUN_DIR);
    let view = View {
      isolated: true,
      tree: run.join("tree"),
      inputs: run.join("inputs"),
      mounts: run.join("mounts"),
      api: run.join("api"),
    };
    let module_path = run.join("module");

    let build_root = env.build_root.unwrap_or(Path::new("/"));
    let mut plan = IsolationPlan::new(dirs.root.clone(), build_root, step.module.meta.network, keep);
    plan.bind(BindMount::writable(env.tree, &view.tree));
    plan.bind(BindMount::writable(&dirs.api, &view.api));
    plan.bind(BindMount::writable(&dirs.mounts, &view.mounts).recursive());
    plan.bind(BindMount::readonly(executable, &module_path));
    for input in inputs {
      plan.bind(BindMount::readonly(&input.path, view.inputs.join(&input.name)));
    }
    for handle in devices.values() {
      if let Some(node) = handle.get("path").and_then(Value::as_str)
        && node.starts_with("/dev/")
      {
        plan.bind(BindMount::writable(node, node));
      }
    }

    let mut cmd = Command::new(&module_path);
    cmd
      .env_clear()
      .env("PATH", DEFAULT_PATH)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("HOME", "/homeless-shelter")
      .env("TREEBUILD_TREE", &view.tree)
      .env("TREEBUILD_META", view.api.join(META_FILE));
    if let Some(epoch) = env.source_epoch {
      cmd.env("SOURCE_DATE_EPOCH", epoch.to_string());
    }

    let prepared = plan
      .prepare()
      .map_err(|e| SandboxError::Setup(format!("cannot prepare sandbox for {}: {e}", step.kind())))?;

    // SAFETY: the closure runs in the forked child before exec and only
    // makes raw syscalls on paths converted in the parent; it never allocates.
    unsafe {
      cmd.pre_exec(move || prepared.apply());
    }

    Ok((cmd, view))
  }
}

fn host_step_command(executable: &Path, env: &StepEnv<'_>, dirs: &RunDirs) -> (Command, View) {
  let view = View {
    isolated: false,
    tree: env.tree.to_path_buf(),
    inputs: dirs.inputs.clone(),
    mounts: dirs.mounts.clone(),
    api: dirs.api.clone(),
  };

  let mut cmd = host_command(executable, env.tree);
  cmd
    .env("TREEBUILD_TREE", &view.tree)
    .env("TREEBUILD_META", view.api.join(META_FILE));
  if let Some(epoch) = env.source_epoch {
    cmd.env("SOURCE_DATE_EPOCH", epoch.to_string());
  }
  (cmd, view)
}

fn step_request(
  step: &ResolvedStep,
  view: &View,
  inputs: &[PreparedInput],
  devices: &BTreeMap<String, Value>,
  mounts: &BTreeMap<String, Value>,
) -> Value {
  let inputs: Map<String, Value> = inputs
    .iter()
    .map(|input| {
      let path = if view.isolated {
        view.inputs.join(&input.name)
      } else {
        input.path.clone()
      };
      (input.name.clone(), json!({"path": path, "data": input.data}))
    })
    .collect();

  let mounts: Map<String, Value> = step
    .mounts
    .iter()
    .map(|m| {
      let path = mounts::mountpoint(&view.mounts, &m.target);
      let reply = mounts.get(&m.name).cloned().unwrap_or(Value::Null);
      (m.name.clone(), json!({"path": path, "target": m.target, "reply": reply}))
    })
    .collect();

  json!({
    "tree": view.tree,
    "options": step.options,
    "inputs": inputs,
    "devices": devices,
    "mounts": mounts,
    "paths": {"mounts": view.mounts},
    "meta": view.api.join(META_FILE),
    "api": view.api.join(crate::ipc::api::SOCKET_NAME),
  })
}

fn read_metadata(path: &Path) -> Value {
  match fs::read(path) {
    Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
      warn!(path = %path.display(), error = %e, "ignoring malformed step metadata");
      Value::Null
    }),
    Err(_) => Value::Null,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::manifest::Manifest;
  use crate::modules::ModuleRegistry;
  use crate::resolve::{ResolvedManifest, resolve};
  use crate::util::testutil::TestLibdir;
  use tempfile::TempDir;

  struct Fixture {
    lib: TestLibdir,
    _temp: TempDir,
    store: Store,
    tree: PathBuf,
  }

  impl Fixture {
    fn new() -> Self {
      let temp = TempDir::new().unwrap();
      let store = Store::open(temp.path().join("store")).unwrap();
      let tree = temp.path().join("tree");
      fs::create_dir(&tree).unwrap();
      Self {
        lib: TestLibdir::new(),
        _temp: temp,
        store,
        tree,
      }
    }

    fn resolve(&self, stage: Value) -> ResolvedManifest {
      let manifest = json!({"version": "2", "pipelines": [{"name": "p", "stages": [stage]}]});
      let manifest = Manifest::from_slice(manifest.to_string().as_bytes()).unwrap();
      resolve(&manifest, &ModuleRegistry::new(self.lib.path())).unwrap()
    }

    async fn run(&self, stage: Value, source_epoch: Option<u64>, timeout: Option<Duration>) -> StepOutcome {
      self.run_in(SandboxMode::Host, stage, source_epoch, timeout).await
    }

    async fn run_in(
      &self,
      mode: SandboxMode,
      stage: Value,
      source_epoch: Option<u64>,
      timeout: Option<Duration>,
    ) -> StepOutcome {
      let resolved = self.resolve(stage);
      let sandbox = Sandbox::new(self.store.clone(), mode, timeout);
      let env = StepEnv {
        pipeline: "p",
        tree: &self.tree,
        build_root: None,
        source_epoch,
      };
      sandbox.execute(&resolved.pipelines[0].steps[0], &env).await.unwrap()
    }

    fn log(&self) -> PathBuf {
      self.lib.path().join("log")
    }

    /// A device or mount service that logs `<name> <method>` and replies with `reply`.
    fn service(&self, kind: ModuleKind, name: &str, reply: &str) {
      let body = format!(
        r#"while read -r line; do
  method=$(printf '%s' "$line" | sed 's/.*"name":"\([a-z]*\)".*/\1/')
  echo "{name} $method" >> '{log}'
  echo '{{"type":"reply","data":{{"reply":{reply}}}}}'
done"#,
        log = self.log().display()
      );
      self.lib.script(kind, name, &body);
    }
  }

  #[tokio::test]
  async fn step_mutates_tree_and_reports_metadata() {
    let fx = Fixture::new();
    fx.lib.script(
      ModuleKind::Step,
      "touch",
      r#"cat > /dev/null
echo hello > "$TREEBUILD_TREE/file"
echo '{"files": 1}' > "$TREEBUILD_META"
echo done"#,
    );

    let outcome = fx.run(json!({"type": "touch"}), None, None).await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.stdout, "done\n");
    assert_eq!(outcome.metadata, json!({"files": 1}));
    assert_eq!(fs::read_to_string(fx.tree.join("file")).unwrap(), "hello\n");
  }

  #[tokio::test]
  async fn step_request_carries_options_and_tree() {
    let fx = Fixture::new();
    fx.lib.script(ModuleKind::Step, "echo", r#"cat > "$TREEBUILD_TREE/request.json""#);

    let outcome = fx.run(json!({"type": "echo", "options": {"size": 3}}), None, None).await;
    assert!(outcome.success);
    let request: Value = serde_json::from_slice(&fs::read(fx.tree.join("request.json")).unwrap()).unwrap();
    assert_eq!(request["options"], json!({"size": 3}));
    assert_eq!(request["tree"], json!(fx.tree));
    assert!(request["api"].as_str().unwrap().ends_with("api.sock"));
  }

  #[tokio::test]
  #[serial_test::serial]
  async fn environment_is_scrubbed() {
    let fx = Fixture::new();
    fx.lib.script(ModuleKind::Step, "env", r#"cat > /dev/null; env | sort > "$TREEBUILD_TREE/env""#);

    temp_env::async_with_vars([("TREEBUILD_LEAK", Some("1"))], async {
      let outcome = fx.run(json!({"type": "env"}), None, None).await;
      assert!(outcome.success);
    })
    .await;
    let env = fs::read_to_string(fx.tree.join("env")).unwrap();
    assert!(env.contains("HOME=/homeless-shelter"));
    assert!(env.contains("LC_ALL=C"));
    assert!(!env.contains("TREEBUILD_LEAK"));
    assert!(!env.contains("SOURCE_DATE_EPOCH"));

    fx.run(json!({"type": "env"}), Some(1700000000), None).await;
    let env = fs::read_to_string(fx.tree.join("env")).unwrap();
    assert!(env.contains("SOURCE_DATE_EPOCH=1700000000"));
  }

  #[tokio::test]
  async fn failing_step_keeps_output() {
    let fx = Fixture::new();
    fx.lib.script(ModuleKind::Step, "fail", "cat > /dev/null; echo partial; echo 'bad option' >&2; exit 4");

    let outcome = fx.run(json!({"type": "fail"}), None, None).await;
    assert!(!outcome.success);
    assert_eq!(outcome.stdout, "partial\n");
    assert_eq!(outcome.stderr, "bad option\n");
    assert_eq!(outcome.error.as_deref(), Some("step fail failed (exit status 4)"));
  }

  #[tokio::test]
  async fn mounts_are_released_in_reverse_even_when_step_crashes() {
    let fx = Fixture::new();
    fx.service(ModuleKind::Device, "loop", r#"{"path":"/dev/null"}"#);
    for name in ["m1", "m2", "m3"] {
      fx.service(ModuleKind::Mount, name, "null");
    }
    fx.lib.script(ModuleKind::Step, "crash", "kill -9 $$");

    let outcome = fx
      .run(
        json!({
          "type": "crash",
          "devices": [{"name": "disk", "type": "loop"}],
          "mounts": [
            {"name": "root", "type": "m1", "source": "disk", "target": "/"},
            {"name": "boot", "type": "m2", "source": "disk", "target": "/boot"},
            {"name": "efi", "type": "m3", "source": "disk", "target": "/boot/efi"}
          ]
        }),
        None,
        None,
      )
      .await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("killed by signal 9"));
    let log = fs::read_to_string(fx.log()).unwrap();
    assert_eq!(
      log,
      "loop open\nm1 mount\nm2 mount\nm3 mount\nm3 umount\nm2 umount\nm1 umount\nloop close\n"
    );
  }

  #[tokio::test]
  async fn device_failure_releases_earlier_devices() {
    let fx = Fixture::new();
    fx.service(ModuleKind::Device, "good", "null");
    fx.lib.script(
      ModuleKind::Device,
      "bad",
      r#"read -r line; echo '{"type":"exception","data":{"name":"OSError","value":"no loop devices"}}'"#,
    );
    fx.lib.script(ModuleKind::Step, "never", "touch \"$TREEBUILD_TREE/ran\"");

    let outcome = fx
      .run(
        json!({
          "type": "never",
          "devices": [{"name": "a", "type": "good"}, {"name": "b", "type": "bad"}]
        }),
        None,
        None,
      )
      .await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("no loop devices"));
    assert!(!fx.tree.join("ran").exists());
    assert_eq!(fs::read_to_string(fx.log()).unwrap(), "good open\ngood close\n");
  }

  #[tokio::test]
  async fn timeout_kills_step() {
    let fx = Fixture::new();
    fx.lib.script(ModuleKind::Step, "hang", "sleep 30");

    let outcome = fx
      .run(json!({"type": "hang"}), None, Some(Duration::from_millis(200)))
      .await;
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("step hang timed out after 200ms"));
  }

  #[tokio::test]
  async fn run_directory_is_removed() {
    let fx = Fixture::new();
    fx.lib.script(ModuleKind::Step, "ok", "exit 0");
    fx.run(json!({"type": "ok"}), None, None).await;
    let tmp = fx.store.root().join("tmp");
    assert_eq!(fs::read_dir(tmp).unwrap().count(), 0);
  }

  /// Effective capability mask of this process.
  fn effective_caps() -> u64 {
    let status = fs::read_to_string("/proc/self/status").unwrap();
    status
      .lines()
      .find_map(|line| line.strip_prefix("CapEff:"))
      .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
      .unwrap_or(0)
  }

  #[tokio::test]
  async fn isolated_step_sees_only_the_sandbox() {
    const CAP_SYS_ADMIN: u64 = 1 << 21;
    if !crate::platform::is_root() || effective_caps() & CAP_SYS_ADMIN == 0 {
      return;
    }
    let fx = Fixture::new();
    fx.lib.script(
      ModuleKind::Step,
      "inspect-root",
      r#"cat > /dev/null
ls / > "$TREEBUILD_TREE/root-listing"
grep CapBnd /proc/self/status > "$TREEBUILD_TREE/caps"
test -d /run/treebuild/tree && echo "$TREEBUILD_TREE" > "$TREEBUILD_TREE/tree-path"
touch /run/treebuild/module 2>/dev/null || echo readonly > "$TREEBUILD_TREE/module-ro""#,
    );

    let outcome = fx
      .run_in(SandboxMode::Isolated, json!({"type": "inspect-root"}), None, None)
      .await;
    assert!(outcome.success, "{outcome:?}");

    let listing = fs::read_to_string(fx.tree.join("root-listing")).unwrap();
    let entries: Vec<&str> = listing.lines().collect();
    for expected in ["dev", "proc", "run", "tmp", "usr", "var"] {
      assert!(entries.contains(&expected), "missing /{expected} in {entries:?}");
    }
    assert!(!entries.contains(&"home"));
    assert!(!entries.contains(&"etc"));

    assert_eq!(
      fs::read_to_string(fx.tree.join("tree-path")).unwrap().trim(),
      "/run/treebuild/tree"
    );
    assert!(fx.tree.join("module-ro").exists());

    let caps = fs::read_to_string(fx.tree.join("caps")).unwrap();
    let bounding = u64::from_str_radix(caps.trim_start_matches("CapBnd:").trim(), 16).unwrap();
    assert_eq!(bounding & CAP_SYS_ADMIN, 0);
    assert_ne!(bounding, 0);
  }

  #[test]
  fn mode_parsing() {
    assert_eq!("host".parse::<SandboxMode>(), Ok(SandboxMode::Host));
    assert!("docker".parse::<SandboxMode>().is_err());
    assert_ne!(SandboxMode::Auto.effective(), SandboxMode::Auto);
  }
}
