//! # Atelier Preview Orchestrator
//!
//! Owns at most one dev-server preview per session: allocates a port,
//! spawns the project's dev server, probes it until it answers, and tears it
//! down again.
//!
//! ## Locking
//!
//! Each session has its own slot. Start, stop and restart serialize on the
//! slot's async operation lock; status reads only take the slot's state lock
//! and never wait behind a start that is still probing. The session map
//! itself is held only long enough to look a slot up.

mod probe;
mod process;
mod reaper;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use atelier_common::{ProjectType, SessionId};

use super::config::{DevServerCommand, PreviewSettings};
use super::errors::{EngineError, EngineResult};
use super::ports::PortAllocator;

pub use probe::{HealthProbe, HttpProbe};
pub use process::{
    ExitSummary, LaunchSpec, OutputTail, ProcessHandle, ProcessSpawner, TokioSpawner,
};
pub use reaper::ReapReport;

/// Lifecycle of a preview instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    /// No instance for the session.
    NotFound,
}

impl PreviewState {
    /// `Starting` and `Running` hold a port and a live process.
    pub fn is_live(self) -> bool {
        matches!(self, PreviewState::Starting | PreviewState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PreviewState::Starting => "starting",
            PreviewState::Running => "running",
            PreviewState::Stopping => "stopping",
            PreviewState::Stopped => "stopped",
            PreviewState::Failed => "failed",
            PreviewState::NotFound => "not_found",
        }
    }
}

/// Returned by start and restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInfo {
    pub session_id: SessionId,
    pub port: u16,
    pub url: String,
    pub status: PreviewState,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub project_path: PathBuf,
    pub project_type: ProjectType,
}

/// Point-in-time view of a session's preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStatus {
    pub session_id: SessionId,
    pub status: PreviewState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreviewStatus {
    fn not_found(session_id: &SessionId) -> Self {
        Self {
            session_id: session_id.clone(),
            status: PreviewState::NotFound,
            url: None,
            port: None,
            started_at: None,
            uptime_secs: None,
            pid: None,
            error: None,
        }
    }
}

/// Per-session result of [`PreviewOrchestrator::cleanup_all_previews`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub session_id: SessionId,
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Timings and command table used by the orchestrator.
#[derive(Debug, Clone)]
pub struct PreviewOptions {
    pub probe_interval: Duration,
    pub probe_attempts: u32,
    pub stop_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    pub output_tail_lines: usize,
    pub commands: HashMap<String, DevServerCommand>,
}

impl PreviewOptions {
    pub fn from_settings(settings: &PreviewSettings) -> Self {
        let (limits, sources) = settings.limits();
        debug!(
            probe_interval_ms = limits.probe_interval_ms,
            probe_interval_src = sources.probe_interval_ms,
            probe_attempts = limits.probe_attempts,
            probe_attempts_src = sources.probe_attempts,
            stop_timeout_ms = limits.stop_timeout_ms,
            stop_timeout_src = sources.stop_timeout_ms,
            "preview limits resolved"
        );
        Self {
            probe_interval: Duration::from_millis(limits.probe_interval_ms),
            probe_attempts: limits.probe_attempts,
            stop_timeout: Duration::from_millis(limits.stop_timeout_ms),
            max_lifetime: settings.max_lifetime(),
            output_tail_lines: settings.output_tail_lines,
            commands: settings.commands.clone(),
        }
    }
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self::from_settings(&PreviewSettings::default())
    }
}

struct PreviewInstance {
    project_path: PathBuf,
    project_type: ProjectType,
    port: u16,
    url: String,
    state: PreviewState,
    started_at: DateTime<Utc>,
    handle: Arc<dyn ProcessHandle>,
    /// Set once the instance failed; the port has been released by then.
    failure: Option<String>,
}

impl PreviewInstance {
    fn info(&self, session_id: &SessionId) -> PreviewInfo {
        PreviewInfo {
            session_id: session_id.clone(),
            port: self.port,
            url: self.url.clone(),
            status: self.state,
            started_at: self.started_at,
            pid: self.handle.pid(),
            project_path: self.project_path.clone(),
            project_type: self.project_type,
        }
    }

    fn status(&self, session_id: &SessionId) -> PreviewStatus {
        let mut state = self.state;
        let mut error = self.failure.clone();
        if state.is_live() && !self.handle.is_alive() {
            state = PreviewState::Failed;
            error = Some(exit_reason(self.handle.as_ref()));
        }
        let uptime = Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
            .max(0) as u64;
        PreviewStatus {
            session_id: session_id.clone(),
            status: state,
            url: Some(self.url.clone()),
            port: Some(self.port),
            started_at: Some(self.started_at),
            uptime_secs: Some(uptime),
            pid: self.handle.pid(),
            error,
        }
    }
}

struct SessionSlot {
    ops: tokio::sync::Mutex<()>,
    instance: RwLock<Option<PreviewInstance>>,
    /// Bumped by stop requests; an in-flight start watches it.
    cancel: watch::Sender<u64>,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self {
            ops: tokio::sync::Mutex::new(()),
            instance: RwLock::new(None),
            cancel: watch::channel(0).0,
        }
    }
}

struct Inner {
    ports: Arc<PortAllocator>,
    options: PreviewOptions,
    spawner: Arc<dyn ProcessSpawner>,
    probe: Arc<dyn HealthProbe>,
    slots: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
}

/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct PreviewOrchestrator {
    inner: Arc<Inner>,
}

impl PreviewOrchestrator {
    /// Orchestrator with real subprocesses and HTTP probing.
    pub fn new(ports: Arc<PortAllocator>, settings: &PreviewSettings) -> Self {
        Self::with_backends(
            ports,
            PreviewOptions::from_settings(settings),
            Arc::new(TokioSpawner),
            Arc::new(HttpProbe::new(settings.ready_on_any_status)),
        )
    }

    pub fn with_backends(
        ports: Arc<PortAllocator>,
        options: PreviewOptions,
        spawner: Arc<dyn ProcessSpawner>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ports,
                options,
                spawner,
                probe,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.inner.ports
    }

    pub fn options(&self) -> &PreviewOptions {
        &self.inner.options
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionSlot>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, session_id: &SessionId) -> Arc<SessionSlot> {
        self.slots()
            .entry(session_id.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, session_id: &SessionId) -> Option<Arc<SessionSlot>> {
        self.slots().get(session_id).cloned()
    }

    fn all_slots(&self) -> Vec<(SessionId, Arc<SessionSlot>)> {
        let mut slots: Vec<_> = self
            .slots()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        slots
    }

    /// Starts the session's dev server and waits until it answers.
    ///
    /// A session that already has a starting or running preview gets that
    /// preview's info back unchanged. The start runs on its own task: a
    /// caller that stops waiting does not leave the preview half-started.
    pub async fn start_preview(
        &self,
        session_id: &SessionId,
        project_path: &Path,
        project_type: ProjectType,
    ) -> EngineResult<PreviewInfo> {
        let orchestrator = self.clone();
        let id = session_id.clone();
        let project_path = project_path.to_path_buf();
        run_detached(session_id, async move {
            orchestrator
                .start_task(&id, &project_path, project_type)
                .await
        })
        .await
    }

    async fn start_task(
        &self,
        session_id: &SessionId,
        project_path: &Path,
        project_type: ProjectType,
    ) -> EngineResult<PreviewInfo> {
        let slot = self.slot(session_id);
        let _op = slot.ops.lock().await;
        // Only stop requests issued while this operation holds the lock cancel it.
        let mut cancel = slot.cancel.subscribe();

        if let Some(existing) = slot.instance.read().await.as_ref() {
            if existing.state.is_live() && existing.handle.is_alive() {
                debug!(session_id = %session_id, port = existing.port, "preview already live");
                return Ok(existing.info(session_id));
            }
        }
        self.discard_dead_instance(&slot, session_id).await;

        self.start_locked(&slot, session_id, project_path, project_type, &mut cancel)
            .await
    }

    /// Stops the session's preview. Returns `false` when there was none.
    pub async fn stop_preview(&self, session_id: &SessionId) -> EngineResult<bool> {
        let Some(slot) = self.existing_slot(session_id) else {
            return Ok(false);
        };
        slot.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
        let _op = slot.ops.lock().await;
        Ok(self.stop_locked(&slot, session_id).await)
    }

    /// Stops and starts the preview again with the same project path and
    /// type, under one critical section. Runs detached like a start.
    pub async fn restart_preview(&self, session_id: &SessionId) -> EngineResult<PreviewInfo> {
        let orchestrator = self.clone();
        let id = session_id.clone();
        run_detached(session_id, async move { orchestrator.restart_task(&id).await }).await
    }

    async fn restart_task(&self, session_id: &SessionId) -> EngineResult<PreviewInfo> {
        let slot = self
            .existing_slot(session_id)
            .ok_or_else(|| EngineError::not_found("preview", session_id.as_str()))?;
        let _op = slot.ops.lock().await;
        // Only stop requests issued while this operation holds the lock cancel it.
        let mut cancel = slot.cancel.subscribe();

        let (project_path, project_type) = match slot.instance.read().await.as_ref() {
            Some(instance) => (instance.project_path.clone(), instance.project_type),
            None => return Err(EngineError::not_found("preview", session_id.as_str())),
        };

        info!(session_id = %session_id, "restarting preview");
        self.stop_locked(&slot, session_id).await;
        self.start_locked(&slot, session_id, &project_path, project_type, &mut cancel)
            .await
    }

    pub async fn get_preview_status(&self, session_id: &SessionId) -> PreviewStatus {
        let Some(slot) = self.existing_slot(session_id) else {
            return PreviewStatus::not_found(session_id);
        };
        let guard = slot.instance.read().await;
        match guard.as_ref() {
            Some(instance) => instance.status(session_id),
            None => PreviewStatus::not_found(session_id),
        }
    }

    /// Status of every session that has an instance, ordered by session id.
    pub async fn get_all_previews(&self) -> Vec<PreviewStatus> {
        let mut statuses = Vec::new();
        for (session_id, slot) in self.all_slots() {
            if let Some(instance) = slot.instance.read().await.as_ref() {
                statuses.push(instance.status(&session_id));
            }
        }
        statuses
    }

    /// Stops every preview concurrently. Failures are reported per session.
    pub async fn cleanup_all_previews(&self) -> Vec<CleanupOutcome> {
        let tasks: Vec<_> = self
            .all_slots()
            .into_iter()
            .map(|(session_id, _)| {
                let orchestrator = self.clone();
                let id = session_id.clone();
                let task = tokio::spawn(async move { orchestrator.stop_preview(&id).await });
                (session_id, task)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (session_id, task) in tasks {
            let outcome = match task.await {
                Ok(Ok(stopped)) => CleanupOutcome {
                    session_id,
                    stopped,
                    error: None,
                },
                Ok(Err(err)) => CleanupOutcome {
                    session_id,
                    stopped: false,
                    error: Some(err.to_string()),
                },
                Err(join_err) => CleanupOutcome {
                    session_id,
                    stopped: false,
                    error: Some(format!("cleanup task failed: {join_err}")),
                },
            };
            outcomes.push(outcome);
        }
        info!(count = outcomes.len(), "previews cleaned up");
        outcomes
    }

    /// Recent dev-server output for the session's preview.
    pub async fn preview_logs(&self, session_id: &SessionId) -> EngineResult<Vec<String>> {
        let slot = self
            .existing_slot(session_id)
            .ok_or_else(|| EngineError::not_found("preview", session_id.as_str()))?;
        let guard = slot.instance.read().await;
        guard
            .as_ref()
            .map(|instance| instance.handle.output_tail())
            .ok_or_else(|| EngineError::not_found("preview", session_id.as_str()))
    }

    /// Drops a failed or exited instance so a new one can take its place.
    async fn discard_dead_instance(&self, slot: &SessionSlot, session_id: &SessionId) {
        let mut guard = slot.instance.write().await;
        let Some(instance) = guard.take() else {
            return;
        };
        if instance.failure.is_none() {
            // Exited without the reaper noticing yet: the port is still ours.
            let _ = instance.handle.kill();
            self.inner.ports.release(instance.port);
        }
        debug!(session_id = %session_id, port = instance.port, "discarded dead preview");
    }

    async fn start_locked(
        &self,
        slot: &SessionSlot,
        session_id: &SessionId,
        project_path: &Path,
        project_type: ProjectType,
        cancel: &mut watch::Receiver<u64>,
    ) -> EngineResult<PreviewInfo> {
        match tokio::fs::metadata(project_path).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(EngineError::not_found(
                    "project",
                    project_path.display().to_string(),
                ))
            }
        }

        let port = self.inner.ports.acquire()?;
        let command = DevServerCommand::resolve(&self.inner.options.commands, project_type)
            .render(port);
        let spec = LaunchSpec {
            session_id: session_id.clone(),
            program: command.program,
            args: command.args,
            env: command.env,
            cwd: project_path.to_path_buf(),
            port,
            tail_lines: self.inner.options.output_tail_lines,
        };

        let handle = match self.inner.spawner.spawn(&spec).await {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.ports.release(port);
                warn!(session_id = %session_id, port, "dev server spawn failed: {err}");
                return Err(err);
            }
        };

        let url = format!("http://localhost:{port}");
        info!(
            session_id = %session_id,
            port,
            pid = handle.pid(),
            project_type = %project_type,
            program = %spec.program,
            "dev server spawned"
        );
        *slot.instance.write().await = Some(PreviewInstance {
            project_path: project_path.to_path_buf(),
            project_type,
            port,
            url: url.clone(),
            state: PreviewState::Starting,
            started_at: Utc::now(),
            handle: handle.clone(),
            failure: None,
        });

        match self.wait_until_ready(handle.as_ref(), &url, cancel).await {
            Ok(()) => {
                let mut guard = slot.instance.write().await;
                let instance = guard.as_mut().ok_or_else(|| {
                    EngineError::process(session_id, "preview vanished while starting")
                })?;
                instance.state = PreviewState::Running;
                info!(session_id = %session_id, port, url = %url, "preview running");
                Ok(instance.info(session_id))
            }
            Err(reason) => {
                self.shutdown(handle.as_ref(), session_id).await;
                self.inner.ports.release(port);
                if let Some(instance) = slot.instance.write().await.as_mut() {
                    instance.state = PreviewState::Failed;
                    instance.failure = Some(reason.clone());
                }
                warn!(session_id = %session_id, port, "preview failed to start: {reason}");
                Err(EngineError::process(session_id, reason))
            }
        }
    }

    async fn wait_until_ready(
        &self,
        handle: &dyn ProcessHandle,
        url: &str,
        cancel: &mut watch::Receiver<u64>,
    ) -> Result<(), String> {
        let attempts = self.inner.options.probe_attempts.max(1);
        for attempt in 1..=attempts {
            if cancel.has_changed().unwrap_or(false) {
                return Err("start cancelled by stop request".to_string());
            }
            if !handle.is_alive() {
                return Err(format!(
                    "dev server exited before becoming ready ({})",
                    exit_reason(handle)
                ));
            }
            if self.inner.probe.probe(url).await {
                debug!(url, attempt, "preview answered");
                return Ok(());
            }
            debug!(url, attempt, attempts, "preview not ready yet");

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.inner.options.probe_interval) => {}
                    Ok(()) = cancel.changed() => {
                        return Err("start cancelled by stop request".to_string());
                    }
                }
            }
        }
        Err(format!(
            "dev server did not answer at {url} after {attempts} probes"
        ))
    }

    /// SIGTERM, bounded wait, then SIGKILL.
    async fn shutdown(&self, handle: &dyn ProcessHandle, session_id: &SessionId) {
        let timeout = self.inner.options.stop_timeout;
        if let Err(err) = handle.terminate() {
            warn!(session_id = %session_id, "terminate failed: {err}");
        }
        if handle.wait_timeout(timeout).await {
            return;
        }
        warn!(
            session_id = %session_id,
            pid = handle.pid(),
            "dev server ignored SIGTERM for {timeout:?}, killing"
        );
        if let Err(err) = handle.kill() {
            warn!(session_id = %session_id, "kill failed: {err}");
        }
        if !handle.wait_timeout(timeout).await {
            warn!(session_id = %session_id, pid = handle.pid(), "dev server still alive after kill");
        }
    }

    async fn stop_locked(&self, slot: &SessionSlot, session_id: &SessionId) -> bool {
        let (handle, port, release_port) = {
            let mut guard = slot.instance.write().await;
            let Some(instance) = guard.as_mut() else {
                return false;
            };
            let release_port = instance.failure.is_none();
            instance.state = PreviewState::Stopping;
            (instance.handle.clone(), instance.port, release_port)
        };

        self.shutdown(handle.as_ref(), session_id).await;
        if release_port {
            self.inner.ports.release(port);
        }
        *slot.instance.write().await = None;
        info!(session_id = %session_id, port, state = PreviewState::Stopped.as_str(), "preview stopped");
        true
    }
}

/// Runs a start or restart to completion on its own task, whether or not
/// the caller keeps waiting for it.
async fn run_detached<F>(session_id: &SessionId, operation: F) -> EngineResult<PreviewInfo>
where
    F: Future<Output = EngineResult<PreviewInfo>> + Send + 'static,
{
    tokio::spawn(operation).await.map_err(|err| {
        EngineError::process(session_id, format!("preview task failed: {err}"))
    })?
}

fn exit_reason(handle: &dyn ProcessHandle) -> String {
    handle
        .exit_summary()
        .map(|summary| summary.to_string())
        .unwrap_or_else(|| "process gone".to_string())
}
