//! Shared fixtures for library integration tests.
//!
//! `MockShare` stands in for the 9P server: it records each staging directory
//! under a fake port. `MockScheduler` finds the directory through the port in
//! the job's mount and writes `out/layer.squashfs` itself, derived from the
//! job's stdin, env and root filesystem so equal jobs produce equal layers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flynn_builder_lib::build::share::ninep_mount;
use flynn_builder_lib::build::{FileShare, SharedDir};
use flynn_builder_lib::execute::{BuildConfig, Builder};
use flynn_builder_lib::manifest::{self, Manifest};
use flynn_builder_lib::scheduler::{
  Job, JobHandle, Mount, Mountspec, OutputLine, OutputStream, Scheduler, SchedulerError,
};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tempfile::TempDir;
use tokio::sync::watch;

type Dirs = Arc<Mutex<HashMap<u16, PathBuf>>>;

#[derive(Default)]
pub struct MockShare {
  dirs: Dirs,
  shared: Mutex<usize>,
}

impl MockShare {
  /// Number of directories shared so far.
  pub fn shared(&self) -> usize {
    *self.shared.lock().unwrap()
  }
}

struct MockShared(u16);

impl SharedDir for MockShared {
  fn mount(&self) -> Mount {
    ninep_mount(IpAddr::V4(Ipv4Addr::LOCALHOST), self.0)
  }
}

#[async_trait::async_trait]
impl FileShare for MockShare {
  async fn share(&self, dir: &Path) -> io::Result<Box<dyn SharedDir>> {
    let mut dirs = self.dirs.lock().unwrap();
    let port = 10000 + dirs.len() as u16;
    dirs.insert(port, dir.to_path_buf());
    *self.shared.lock().unwrap() += 1;
    Ok(Box::new(MockShared(port)))
  }
}

#[derive(Debug, Clone)]
pub struct Submission {
  pub job: Job,
  pub stdin: String,
}

impl Submission {
  pub fn layer_name(&self) -> &str {
    &self.job.metadata["flynn-controller.type"]
  }
}

pub struct MockScheduler {
  dirs: Dirs,
  submissions: Mutex<Vec<Submission>>,
  exit_codes: Mutex<HashMap<String, i32>>,
  gated: Mutex<Option<(HashSet<String>, usize)>>,
  gate_tx: watch::Sender<usize>,
}

impl MockScheduler {
  pub fn new(share: &MockShare) -> Self {
    let (gate_tx, _) = watch::channel(0);
    Self {
      dirs: share.dirs.clone(),
      submissions: Mutex::new(Vec::new()),
      exit_codes: Mutex::new(HashMap::new()),
      gated: Mutex::new(None),
      gate_tx,
    }
  }

  /// Make jobs for layer `name` exit with `code`.
  pub fn fail_layer(&self, name: &str, code: i32) {
    self.exit_codes.lock().unwrap().insert(name.to_string(), code);
  }

  /// Hold jobs for the named layers until `count` of them have been submitted.
  pub fn gate(&self, names: &[&str], count: usize) {
    let names = names.iter().map(|n| n.to_string()).collect();
    *self.gated.lock().unwrap() = Some((names, count));
  }

  pub fn submissions(&self) -> Vec<Submission> {
    self.submissions.lock().unwrap().clone()
  }

  pub fn submitted_layers(&self) -> Vec<String> {
    self.submissions().iter().map(|s| s.layer_name().to_string()).collect()
  }

  fn port(job: &Job) -> u16 {
    job.config.mounts[0]
      .data
      .strip_prefix("trans=tcp,port=")
      .and_then(|p| p.parse().ok())
      .expect("9p mount data")
  }

  fn layer_contents(job: &Job, stdin: &str) -> String {
    let rootfs: Vec<&str> = job.mountspecs.iter().map(|m| m.id.as_str()).collect();
    let env: BTreeMap<&String, &String> = job.config.env.iter().filter(|(k, _)| *k != "FLYNN_VERSION").collect();
    format!("rootfs={rootfs:?}\nenv={env:?}\n{stdin}\n")
  }
}

#[async_trait::async_trait]
impl Scheduler for MockScheduler {
  async fn submit(&self, job: &Job, stdin: Option<String>) -> Result<JobHandle, SchedulerError> {
    let stdin = stdin.unwrap_or_default();
    let dir = self.dirs.lock().unwrap()[&Self::port(job)].clone();
    std::fs::write(dir.join("out/layer.squashfs"), Self::layer_contents(job, &stdin)).unwrap();

    let submission = Submission {
      job: job.clone(),
      stdin,
    };
    let gated = match &*self.gated.lock().unwrap() {
      Some((names, _)) => names.contains(submission.layer_name()),
      None => false,
    };
    self.submissions.lock().unwrap().push(submission);
    if gated {
      self.gate_tx.send_modify(|n| *n += 1);
    }
    Ok(JobHandle { id: job.id.clone() })
  }

  async fn stream(&self, _handle: &JobHandle) -> Result<BoxStream<'static, Result<OutputLine, SchedulerError>>, SchedulerError> {
    let line = OutputLine {
      stream: OutputStream::Stderr,
      data: "+ true".to_string(),
    };
    Ok(stream::iter(vec![Ok(line)]).boxed())
  }

  async fn wait(&self, handle: &JobHandle) -> Result<i32, SchedulerError> {
    let submission = self
      .submissions()
      .into_iter()
      .find(|s| s.job.id == handle.id)
      .expect("submitted job");
    let name = submission.layer_name().to_string();

    let gate = self
      .gated
      .lock()
      .unwrap()
      .as_ref()
      .filter(|(names, _)| names.contains(&name))
      .map(|(_, count)| *count);
    if let Some(count) = gate {
      let mut rx = self.gate_tx.subscribe();
      let released = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n >= count)).await;
      if released.is_err() {
        // Not enough jobs ran concurrently.
        return Ok(99);
      }
    }

    Ok(self.exit_codes.lock().unwrap().get(&name).copied().unwrap_or(0))
  }
}

/// A workspace, cache and build directory in one temp dir.
pub struct TestEnv {
  pub temp: TempDir,
  pub share: Arc<MockShare>,
  pub scheduler: Arc<MockScheduler>,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    for dir in ["workspace", "cache", "tmp"] {
      std::fs::create_dir_all(temp.path().join(dir)).unwrap();
    }
    std::fs::write(temp.path().join("flynn-builder"), "builder binary").unwrap();

    let share = Arc::new(MockShare::default());
    let scheduler = Arc::new(MockScheduler::new(&share));
    Self { temp, share, scheduler }
  }

  pub fn workspace(&self) -> PathBuf {
    self.temp.path().join("workspace")
  }

  pub fn cache_dir(&self) -> PathBuf {
    self.temp.path().join("cache")
  }

  pub fn build_dir(&self) -> PathBuf {
    self.workspace().join("build")
  }

  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.workspace().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
  }

  pub fn config(&self) -> BuildConfig {
    BuildConfig {
      workspace: self.workspace(),
      build_dir: self.build_dir(),
      cache_dir: self.cache_dir(),
      staging_root: Some(self.temp.path().join("tmp")),
      builder_bin: self.temp.path().join("flynn-builder"),
      version: "dev".to_string(),
      parallelism: None,
    }
  }

  /// Start over with fresh mocks, keeping the workspace and cache.
  pub fn reset_mocks(&mut self) {
    self.share = Arc::new(MockShare::default());
    self.scheduler = Arc::new(MockScheduler::new(&self.share));
  }

  pub fn builder(&self, manifest: Manifest) -> Builder {
    Builder::new(self.config(), manifest, self.scheduler.clone(), self.share.clone(), None).unwrap()
  }

  pub fn read_build_file(&self, relative_path: &str) -> Vec<u8> {
    std::fs::read(self.build_dir().join(relative_path)).unwrap()
  }

  pub fn staging_is_clean(&self) -> bool {
    std::fs::read_dir(self.temp.path().join("tmp")).unwrap().next().is_none()
  }
}

pub fn base_layer() -> Mountspec {
  Mountspec {
    spec_type: "squashfs".to_string(),
    id: "base-layer".to_string(),
    url: "https://dl.flynn.io/tuf/layers/base-layer.squashfs".to_string(),
    size: 1024,
    ..Default::default()
  }
}

/// Parse and prepare a manifest from JSON, adding the base layer.
pub fn manifest(json: serde_json::Value) -> Manifest {
  let mut parsed: Manifest = serde_json::from_value(json).unwrap();
  parsed.base_layer = Some(base_layer());
  parsed.tuf.repository = "https://dl.flynn.io/tuf".to_string();
  manifest::prepare(parsed).unwrap()
}
