//! Dev-server subprocess handles.
//!
//! The orchestrator only sees `dyn ProcessHandle`; OS process types stay in
//! [`TokioSpawner`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{watch, Notify};
use tracing::debug;

use atelier_common::SessionId;

use crate::core::errors::{EngineError, EngineResult};

/// Everything needed to launch one dev server.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: SessionId,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub port: u16,
    pub tail_lines: usize,
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub description: String,
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Handle to a spawned dev server.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    /// Exit information once the process is gone.
    fn exit_summary(&self) -> Option<ExitSummary>;

    /// Graceful termination request (SIGTERM to the process group on unix).
    fn terminate(&self) -> EngineResult<()>;

    /// Forced termination.
    fn kill(&self) -> EngineResult<()>;

    /// Waits up to `timeout` for the process and everything it left running
    /// in its process group to exit. Returns `true` once all are gone.
    async fn wait_timeout(&self, timeout: Duration) -> bool;

    /// Most recent output lines, oldest first.
    fn output_tail(&self) -> Vec<String>;
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> EngineResult<Arc<dyn ProcessHandle>>;
}

/// Bounded ring of output lines shared between reader tasks and the handle.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Spawns dev servers with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> EngineResult<Arc<dyn ProcessHandle>> {
        let mut command = TokioCommand::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env("PORT", spec.port.to_string())
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|err| {
            EngineError::process(
                &spec.session_id,
                format!("failed to spawn '{}': {err}", spec.program),
            )
        })?;
        let pid = child.id();

        let tail = OutputTail::new(spec.tail_lines);
        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(stdout, "stdout", spec.session_id.clone(), tail.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(stderr, "stderr", spec.session_id.clone(), tail.clone());
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_request = Arc::new(Notify::new());
        tokio::spawn(monitor_child(
            child,
            exit_tx,
            kill_request.clone(),
            spec.session_id.clone(),
        ));

        Ok(Arc::new(ChildHandle {
            session_id: spec.session_id.clone(),
            pid,
            exit: exit_rx,
            kill_request,
            tail,
        }))
    }
}

fn spawn_output_reader<R>(reader: R, stream: &'static str, session_id: SessionId, tail: OutputTail)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(session_id = %session_id, stream, "{line}");
            tail.push(line);
        }
    });
}

/// Owns the child until it exits and publishes the exit status.
async fn monitor_child(
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitSummary>>,
    kill_request: Arc<Notify>,
    session_id: SessionId,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_request.notified() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let summary = match status {
        Ok(status) => ExitSummary {
            code: status.code(),
            description: status.to_string(),
        },
        Err(err) => ExitSummary {
            code: None,
            description: format!("wait failed: {err}"),
        },
    };
    debug!(session_id = %session_id, exit = %summary, "dev server exited");
    let _ = exit_tx.send(Some(summary));
}

struct ChildHandle {
    session_id: SessionId,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitSummary>>,
    kill_request: Arc<Notify>,
    tail: OutputTail,
}

impl ChildHandle {
    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> EngineResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        // The group outlives its leader while any member is still running.
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(EngineError::process(
                &self.session_id,
                format!("failed to send {signal} to process group {pid}: {errno}"),
            )),
        }
    }

    /// Whether any member of the child's process group is still running.
    #[cfg(unix)]
    fn group_alive(&self) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return self.is_alive();
        };
        match killpg(Pid::from_raw(pid as i32), None::<Signal>) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(_) => self.is_alive(),
        }
    }

    #[cfg(not(unix))]
    fn group_alive(&self) -> bool {
        self.is_alive()
    }
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    fn exit_summary(&self) -> Option<ExitSummary> {
        self.exit.borrow().clone()
    }

    #[cfg(unix)]
    fn terminate(&self) -> EngineResult<()> {
        self.signal_group(nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> EngineResult<()> {
        self.kill()
    }

    fn kill(&self) -> EngineResult<()> {
        #[cfg(unix)]
        let result = self.signal_group(nix::sys::signal::Signal::SIGKILL);
        #[cfg(not(unix))]
        let result = Ok(());
        self.kill_request.notify_one();
        result
    }

    async fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut exit = self.exit.clone();
        let leader_exited = matches!(
            tokio::time::timeout(timeout, exit.wait_for(|summary| summary.is_some())).await,
            Ok(Ok(_))
        ) || !self.is_alive();
        if !leader_exited {
            return false;
        }

        // Children left behind by the leader still hold the port.
        while self.group_alive() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    fn output_tail(&self) -> Vec<String> {
        self.tail.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_tail_is_bounded() {
        let tail = OutputTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {i}"));
        }
        assert_eq!(tail.snapshot(), vec!["line 2", "line 3", "line 4"]);

        let silent = OutputTail::new(0);
        silent.push("dropped".into());
        assert!(silent.snapshot().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_captures_output_and_exit() {
        let temp = tempfile::TempDir::new().unwrap();
        let spec = LaunchSpec {
            session_id: SessionId::from("proc-test"),
            program: "sh".into(),
            args: vec!["-c".into(), "echo ready on $PORT".into()],
            env: BTreeMap::new(),
            cwd: temp.path().to_path_buf(),
            port: 4321,
            tail_lines: 10,
        };
        let handle = TokioSpawner.spawn(&spec).await.unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(5)).await);
        assert!(!handle.is_alive());
        assert_eq!(handle.exit_summary().unwrap().code, Some(0));

        // reader task may trail the exit notification slightly
        for _ in 0..50 {
            if !handle.output_tail().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.output_tail(), vec!["ready on 4321"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_process_group() {
        let temp = tempfile::TempDir::new().unwrap();
        let spec = LaunchSpec {
            session_id: SessionId::from("proc-term"),
            program: "sleep".into(),
            args: vec!["30".into()],
            env: BTreeMap::new(),
            cwd: temp.path().to_path_buf(),
            port: 4322,
            tail_lines: 10,
        };
        let handle = TokioSpawner.spawn(&spec).await.unwrap();
        assert!(handle.is_alive());
        handle.terminate().unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(5)).await);
        assert!(handle.kill().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_reaches_children_after_leader_exit() {
        let temp = tempfile::TempDir::new().unwrap();
        let spec = LaunchSpec {
            session_id: SessionId::from("proc-orphan"),
            program: "sh".into(),
            args: vec!["-c".into(), "(sleep 2; touch leftover) & exit 0".into()],
            env: BTreeMap::new(),
            cwd: temp.path().to_path_buf(),
            port: 4323,
            tail_lines: 10,
        };
        let handle = TokioSpawner.spawn(&spec).await.unwrap();
        for _ in 0..100 {
            if !handle.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_alive());

        // the background child keeps the group open
        assert!(!handle.wait_timeout(Duration::from_millis(100)).await);

        handle.terminate().unwrap();
        handle.wait_timeout(Duration::from_secs(1)).await;
        handle.kill().unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!temp.path().join("leftover").exists());
    }
}
