//! Common helpers for the integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use atelier_cli::core::config::VersionSettings;
use atelier_cli::core::preview::{
    ExitSummary, HealthProbe, LaunchSpec, PreviewOptions, ProcessHandle, ProcessSpawner,
};
use atelier_cli::core::{EngineResult, PortAllocator, PreviewOrchestrator};

pub struct Tmp {
    pub dir: tempfile::TempDir,
}

impl Tmp {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.path().join(rel)
    }

    pub fn write(&self, rel: &str, data: &str) {
        let p = self.path().join(rel);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(p, data).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).unwrap()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }
}

/// Version settings pointing at `dir`, with the default exclusions.
pub fn version_settings(dir: &Path, max_versions: usize) -> VersionSettings {
    VersionSettings {
        dir: dir.to_path_buf(),
        max_versions,
        ..VersionSettings::default()
    }
}

/// Millisecond-scale timings so orchestrator tests stay fast.
pub fn fast_options() -> PreviewOptions {
    PreviewOptions {
        probe_interval: Duration::from_millis(10),
        probe_attempts: 5,
        stop_timeout: Duration::from_millis(200),
        max_lifetime: None,
        output_tail_lines: 20,
        commands: Default::default(),
    }
}

/// In-memory dev server. `terminate` and `kill` end it unless it was built
/// stubborn, in which case only `kill` does.
pub struct FakeHandle {
    pid: u32,
    alive: AtomicBool,
    stubborn: bool,
    killed: AtomicBool,
}

impl FakeHandle {
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn exit_summary(&self) -> Option<ExitSummary> {
        (!self.is_alive()).then(|| ExitSummary {
            code: Some(1),
            description: "exit status: 1".to_string(),
        })
    }

    fn terminate(&self) -> EngineResult<()> {
        if !self.stubborn {
            self.alive.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn kill(&self) -> EngineResult<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_alive() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn output_tail(&self) -> Vec<String> {
        vec![format!("fake dev server {}", self.pid)]
    }
}

#[derive(Default)]
pub struct FakeSpawner {
    pub next_pid: AtomicU32,
    pub spawn_delay: Duration,
    pub stubborn: bool,
    pub fail: bool,
    pub launches: Mutex<Vec<LaunchSpec>>,
    pub handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeSpawner {
    pub fn spawn_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn last_handle(&self) -> Arc<FakeHandle> {
        self.handles.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> EngineResult<Arc<dyn ProcessHandle>> {
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        if self.fail {
            return Err(atelier_cli::EngineError::process(
                &spec.session_id,
                "spawn refused",
            ));
        }
        self.launches.lock().unwrap().push(spec.clone());
        let handle = Arc::new(FakeHandle {
            pid: 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            alive: AtomicBool::new(true),
            stubborn: self.stubborn,
            killed: AtomicBool::new(false),
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

/// Answers once `ready` is set; counts probes.
pub struct FakeProbe {
    pub ready: AtomicBool,
    pub probes: AtomicUsize,
}

impl FakeProbe {
    pub fn ready() -> Self {
        Self {
            ready: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            ready: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, _url: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.ready.load(Ordering::SeqCst)
    }
}

/// Orchestrator over ports 3000..=3009 with fake backends.
pub fn fake_orchestrator(
    spawner: Arc<FakeSpawner>,
    probe: Arc<FakeProbe>,
    options: PreviewOptions,
) -> PreviewOrchestrator {
    let ports = Arc::new(PortAllocator::new(3000, 3009));
    PreviewOrchestrator::with_backends(ports, options, spawner, probe)
}
