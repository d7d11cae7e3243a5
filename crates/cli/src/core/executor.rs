//! # Atelier Action Executor
//!
//! Runs agent-proposed actions for a session. Each action is checked by the
//! [`PolicyGuard`] first; rejected actions are reported and never executed.
//! Results come back in the order the actions were proposed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use atelier_common::process_utils::canonicalize_within_root;
use atelier_common::{ProjectType, Session};

use super::errors::{EngineError, EngineResult};
use super::policy::{PolicyCheck, PolicyGuard, PolicyRejection};
use super::preview::PreviewOrchestrator;
use super::versions::{scan_tree, VersionStore};

const MAX_OUTPUT_BYTES: usize = 64 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;

/// Action types understood by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    WriteFile,
    ReadFile,
    DeleteFile,
    RunCommand,
    FetchUrl,
    StartPreview,
    StopPreview,
    RestartPreview,
    PreviewStatus,
    SaveVersion,
    RestoreVersion,
    ListVersions,
}

impl ActionKind {
    pub const ALL: [ActionKind; 12] = [
        ActionKind::WriteFile,
        ActionKind::ReadFile,
        ActionKind::DeleteFile,
        ActionKind::RunCommand,
        ActionKind::FetchUrl,
        ActionKind::StartPreview,
        ActionKind::StopPreview,
        ActionKind::RestartPreview,
        ActionKind::PreviewStatus,
        ActionKind::SaveVersion,
        ActionKind::RestoreVersion,
        ActionKind::ListVersions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::WriteFile => "write_file",
            ActionKind::ReadFile => "read_file",
            ActionKind::DeleteFile => "delete_file",
            ActionKind::RunCommand => "run_command",
            ActionKind::FetchUrl => "fetch_url",
            ActionKind::StartPreview => "start_preview",
            ActionKind::StopPreview => "stop_preview",
            ActionKind::RestartPreview => "restart_preview",
            ActionKind::PreviewStatus => "preview_status",
            ActionKind::SaveVersion => "save_version",
            ActionKind::RestoreVersion => "restore_version",
            ActionKind::ListVersions => "list_versions",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

/// One action as proposed by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub description: String,
}

impl ProposedAction {
    pub fn new(kind: ActionKind, params: Value, description: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            params,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success { output: Value },
    Failed { code: String, message: String },
    PolicyViolation { rule: String, reason: String },
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Success { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            ActionOutcome::Success { .. } => "success",
            ActionOutcome::Failed { .. } => "failed",
            ActionOutcome::PolicyViolation { .. } => "policy_violation",
        }
    }
}

impl From<PolicyRejection> for ActionOutcome {
    fn from(rejection: PolicyRejection) -> Self {
        ActionOutcome::PolicyViolation {
            rule: rejection.rule,
            reason: rejection.reason,
        }
    }
}

impl From<EngineError> for ActionOutcome {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::PolicyViolation { rule, reason } => {
                ActionOutcome::PolicyViolation { rule, reason }
            }
            other => ActionOutcome::Failed {
                code: other.error_code().to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

#[derive(Debug, Deserialize)]
struct WriteFileParams {
    path: PathBuf,
    content: String,
}

#[derive(Debug, Deserialize)]
struct PathParams {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandParams {
    command: String,
    #[serde(default, alias = "timeout_secs")]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FetchUrlParams {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPreviewParams {
    #[serde(default, alias = "project_type")]
    project_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SaveVersionParams {
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreVersionParams {
    #[serde(alias = "version_id", alias = "id")]
    version_id: String,
}

/// Parsed, typed form of a proposed action.
#[derive(Debug)]
enum ActionRequest {
    WriteFile { path: PathBuf, content: String },
    ReadFile { path: PathBuf },
    DeleteFile { path: PathBuf },
    RunCommand { command: String, timeout_secs: Option<u64> },
    FetchUrl { url: String },
    StartPreview { project_type: Option<ProjectType> },
    StopPreview,
    RestartPreview,
    PreviewStatus,
    SaveVersion { description: Option<String> },
    RestoreVersion { version_id: String },
    ListVersions,
}

fn params<T: DeserializeOwned>(kind: ActionKind, value: &Value) -> EngineResult<T> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value.clone()
    };
    serde_json::from_value(value).map_err(|err| EngineError::InvalidAction {
        action: kind.as_str().to_string(),
        reason: err.to_string(),
    })
}

impl ActionRequest {
    fn parse(kind: ActionKind, value: &Value) -> EngineResult<Self> {
        Ok(match kind {
            ActionKind::WriteFile => {
                let p: WriteFileParams = params(kind, value)?;
                ActionRequest::WriteFile {
                    path: p.path,
                    content: p.content,
                }
            }
            ActionKind::ReadFile => ActionRequest::ReadFile {
                path: params::<PathParams>(kind, value)?.path,
            },
            ActionKind::DeleteFile => ActionRequest::DeleteFile {
                path: params::<PathParams>(kind, value)?.path,
            },
            ActionKind::RunCommand => {
                let p: RunCommandParams = params(kind, value)?;
                ActionRequest::RunCommand {
                    command: p.command,
                    timeout_secs: p.timeout_secs,
                }
            }
            ActionKind::FetchUrl => ActionRequest::FetchUrl {
                url: params::<FetchUrlParams>(kind, value)?.url,
            },
            ActionKind::StartPreview => {
                let p: StartPreviewParams = params(kind, value)?;
                ActionRequest::StartPreview {
                    project_type: p.project_type.as_deref().map(ProjectType::parse_lenient),
                }
            }
            ActionKind::StopPreview => ActionRequest::StopPreview,
            ActionKind::RestartPreview => ActionRequest::RestartPreview,
            ActionKind::PreviewStatus => ActionRequest::PreviewStatus,
            ActionKind::SaveVersion => ActionRequest::SaveVersion {
                description: params::<SaveVersionParams>(kind, value)?.description,
            },
            ActionKind::RestoreVersion => ActionRequest::RestoreVersion {
                version_id: params::<RestoreVersionParams>(kind, value)?.version_id,
            },
            ActionKind::ListVersions => ActionRequest::ListVersions,
        })
    }
}

/// Dispatches approved actions to the previews, the version store, or the
/// filesystem, process and network layers.
pub struct ActionExecutor {
    policy: Arc<PolicyGuard>,
    previews: PreviewOrchestrator,
    versions: Arc<VersionStore>,
    http: reqwest::Client,
}

impl ActionExecutor {
    pub fn new(
        policy: Arc<PolicyGuard>,
        previews: PreviewOrchestrator,
        versions: Arc<VersionStore>,
    ) -> Self {
        let redirect_guard = policy.clone();
        let redirect_policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if redirect_guard.is_url_safe(attempt.url().as_str()) {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(redirect_policy)
            .build()
            .unwrap_or_else(|err| {
                warn!("falling back to default HTTP client: {err}");
                reqwest::Client::new()
            });

        Self {
            policy,
            previews,
            versions,
            http,
        }
    }

    pub fn policy(&self) -> &PolicyGuard {
        &self.policy
    }

    pub fn previews(&self) -> &PreviewOrchestrator {
        &self.previews
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    /// Runs `actions` in order and returns one result per action.
    pub async fn execute(&self, session: &Session, actions: Vec<ProposedAction>) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for (index, action) in actions.into_iter().enumerate() {
            let description = self.policy.sanitize_input(&action.description);
            let outcome = self.run_one(session, &action).await;
            info!(
                session_id = %session.id,
                index,
                action = %action.kind,
                status = outcome.label(),
                "action processed"
            );
            results.push(ActionResult {
                index,
                kind: action.kind,
                description,
                outcome,
            });
        }
        results
    }

    async fn run_one(&self, session: &Session, action: &ProposedAction) -> ActionOutcome {
        if let Err(rejection) = self.policy.check_session_duration(session.created_at) {
            return rejection.into();
        }

        let Some(kind) = ActionKind::parse(action.kind.trim()) else {
            return EngineError::InvalidAction {
                action: action.kind.clone(),
                reason: "unknown action type".to_string(),
            }
            .into();
        };
        let request = match ActionRequest::parse(kind, &action.params) {
            Ok(request) => request,
            Err(err) => return err.into(),
        };

        if let Err(rejection) = self.gate(session, &request).await {
            return rejection.into();
        }

        match self.dispatch(session, request, &action.description).await {
            Ok(output) => ActionOutcome::Success { output },
            Err(err) => {
                debug!(session_id = %session.id, action = kind.as_str(), "action failed: {err}");
                err.into()
            }
        }
    }

    /// Per-type policy checks.
    async fn gate(&self, session: &Session, request: &ActionRequest) -> PolicyCheck {
        let root = &session.working_directory;
        match request {
            ActionRequest::RunCommand { command, .. } => self.policy.check_command(command),
            ActionRequest::FetchUrl { url } => self.policy.check_url(url),
            ActionRequest::ReadFile { path } | ActionRequest::DeleteFile { path } => {
                self.policy.check_file_path(path, root)
            }
            ActionRequest::WriteFile { path, content } => {
                self.policy.check_file_path(path, root)?;
                let incoming = content.len() as u64;
                self.policy.check_file_size(incoming)?;
                let current = self.project_size(root).await.map_err(|err| PolicyRejection {
                    rule: "project_size".to_string(),
                    reason: format!("cannot measure project: {err}"),
                })?;
                self.policy.check_project_size(current.saturating_add(incoming))
            }
            _ => Ok(()),
        }
    }

    async fn project_size(&self, root: &Path) -> EngineResult<u64> {
        let root = root.to_path_buf();
        let filter = self.versions.snapshot_filter();
        blocking(move || {
            scan_tree(&root, &filter)
                .map(|stats| stats.size_bytes)
                .map_err(|e| EngineError::io(root.clone(), "measure project", e))
        })
        .await
    }

    async fn dispatch(
        &self,
        session: &Session,
        request: ActionRequest,
        raw_description: &str,
    ) -> EngineResult<Value> {
        let root = &session.working_directory;
        match request {
            ActionRequest::WriteFile { path, content } => {
                let target = resolve_in_project(root, &path)?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| EngineError::io(parent.to_path_buf(), "create directories", e))?;
                }
                tokio::fs::write(&target, content.as_bytes())
                    .await
                    .map_err(|e| EngineError::io(target.clone(), "write file", e))?;
                Ok(json!({ "path": path, "bytes": content.len() }))
            }
            ActionRequest::ReadFile { path } => {
                let target = resolve_in_project(root, &path)?;
                let meta = tokio::fs::metadata(&target)
                    .await
                    .map_err(|_| EngineError::not_found("file", path.display().to_string()))?;
                if !meta.is_file() {
                    return Err(invalid(ActionKind::ReadFile, "path is not a file"));
                }
                self.policy.check_file_size(meta.len())?;
                let content = tokio::fs::read_to_string(&target)
                    .await
                    .map_err(|e| EngineError::io(target.clone(), "read file", e))?;
                Ok(json!({ "path": path, "size": meta.len(), "content": content }))
            }
            ActionRequest::DeleteFile { path } => {
                let target = resolve_in_project(root, &path)?;
                let meta = tokio::fs::symlink_metadata(&target)
                    .await
                    .map_err(|_| EngineError::not_found("file", path.display().to_string()))?;
                if meta.is_dir() {
                    return Err(invalid(ActionKind::DeleteFile, "path is a directory"));
                }
                tokio::fs::remove_file(&target)
                    .await
                    .map_err(|e| EngineError::io(target.clone(), "delete file", e))?;
                Ok(json!({ "path": path, "deleted": true }))
            }
            ActionRequest::RunCommand {
                command,
                timeout_secs,
            } => self.run_command(session, &command, timeout_secs).await,
            ActionRequest::FetchUrl { url } => self.fetch_url(&url).await,
            ActionRequest::StartPreview { project_type } => {
                let project_type = project_type.unwrap_or(session.project_type);
                let info = self
                    .previews
                    .start_preview(&session.id, root, project_type)
                    .await?;
                to_output(&info)
            }
            ActionRequest::StopPreview => {
                let stopped = self.previews.stop_preview(&session.id).await?;
                Ok(json!({ "stopped": stopped }))
            }
            ActionRequest::RestartPreview => {
                let info = self.previews.restart_preview(&session.id).await?;
                to_output(&info)
            }
            ActionRequest::PreviewStatus => {
                let status = self.previews.get_preview_status(&session.id).await;
                to_output(&status)
            }
            ActionRequest::SaveVersion { description } => {
                let description = self
                    .policy
                    .sanitize_input(description.as_deref().unwrap_or(raw_description));
                let versions = self.versions.clone();
                let project = root.clone();
                let saved =
                    blocking(move || versions.save_version(&project, &description)).await?;
                to_output(&saved)
            }
            ActionRequest::RestoreVersion { version_id } => {
                let versions = self.versions.clone();
                let target = root.clone();
                let restored = blocking(move || {
                    let project = fs::canonicalize(&target).unwrap_or_else(|_| target.clone());
                    let source = versions.get_version(&version_id)?.metadata.source_project_path;
                    if source != project {
                        return Err(EngineError::policy(
                            "foreign_version",
                            format!("version {version_id} belongs to another project"),
                        ));
                    }
                    versions.restore_version(&version_id, &target)
                })
                .await?;
                to_output(&restored)
            }
            ActionRequest::ListVersions => {
                let project = fs::canonicalize(root).unwrap_or_else(|_| root.clone());
                let versions: Vec<_> = self
                    .versions
                    .get_versions()
                    .into_iter()
                    .filter(|v| v.source_project_path == project)
                    .collect();
                Ok(json!({ "count": versions.len(), "versions": versions }))
            }
        }
    }

    async fn run_command(
        &self,
        session: &Session,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> EngineResult<Value> {
        let limit = self.policy.rules().command_timeout_secs.max(1);
        let timeout_secs = timeout_secs.map_or(limit, |t| t.clamp(1, limit));

        let mut cmd = shell_command(command);
        cmd.current_dir(&session.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(session_id = %session.id, command, timeout_secs, "running command");
        let child = cmd
            .spawn()
            .map_err(|e| EngineError::process(&session.id, format!("failed to spawn shell: {e}")))?;
        let pid = child.id();

        let waited =
            tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await;
        let output = match waited {
            Ok(output) => output.map_err(|e| {
                EngineError::process(&session.id, format!("failed to wait for command: {e}"))
            })?,
            Err(_) => {
                kill_process_group(pid, session);
                warn!(session_id = %session.id, command, timeout_secs, "command timed out");
                return Err(EngineError::process(
                    &session.id,
                    format!("command timed out after {timeout_secs}s"),
                ));
            }
        };

        let (stdout, stdout_truncated) = truncate_output(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output(&output.stderr);
        Ok(json!({
            "exitCode": output.status.code(),
            "success": output.status.success(),
            "stdout": stdout,
            "stderr": stderr,
            "truncated": stdout_truncated || stderr_truncated,
        }))
    }

    async fn fetch_url(&self, url: &str) -> EngineResult<Value> {
        let fetch_err = |reason: String| {
            EngineError::io(
                None::<PathBuf>,
                "fetch url",
                std::io::Error::new(std::io::ErrorKind::Other, reason),
            )
        };

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // Stop reading once past the output cap.
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| fetch_err(e.to_string()))? {
            bytes.extend_from_slice(&chunk);
            if bytes.len() > MAX_OUTPUT_BYTES {
                debug!(url = %final_url, downloaded = bytes.len(), "fetch body cut at output cap");
                break;
            }
        }
        let (body, truncated) = truncate_output(&bytes);

        Ok(json!({
            "url": final_url,
            "status": status,
            "contentType": content_type,
            "body": body,
            "truncated": truncated,
        }))
    }
}

fn invalid(kind: ActionKind, reason: &str) -> EngineError {
    EngineError::InvalidAction {
        action: kind.as_str().to_string(),
        reason: reason.to_string(),
    }
}

fn resolve_in_project(root: &Path, path: &Path) -> EngineResult<PathBuf> {
    canonicalize_within_root(root, path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            EngineError::policy("outside_project", err.to_string())
        } else {
            EngineError::io(path.to_path_buf(), "resolve path", err)
        }
    })
}

/// SIGKILL to everything the timed-out shell started.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>, session: &Session) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => warn!(session_id = %session.id, pid, "failed to kill command group: {errno}"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>, _session: &Session) {}

#[cfg(unix)]
fn shell_command(command: &str) -> TokioCommand {
    let mut cmd = TokioCommand::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> TokioCommand {
    let mut cmd = TokioCommand::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Lossy UTF-8 limited to `MAX_OUTPUT_BYTES`, cut on a char boundary.
fn truncate_output(bytes: &[u8]) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT_BYTES {
        return (text.into_owned(), false);
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (text[..cut].to_string(), true)
}

fn to_output<T: Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(|e| {
        EngineError::io(
            None::<PathBuf>,
            "serialize output",
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })
}

async fn blocking<T, F>(work: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        EngineError::io(
            None::<PathBuf>,
            "blocking task",
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        )
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::parse("format_disk"), None);
    }

    #[test]
    fn test_malformed_params_are_invalid_action() {
        let err = ActionRequest::parse(ActionKind::WriteFile, &json!({ "path": "a.txt" })).unwrap_err();
        assert_eq!(err.error_code(), "E_INVALID_ACTION");

        let ok = ActionRequest::parse(ActionKind::ListVersions, &Value::Null);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_truncate_output_respects_char_boundaries() {
        let long = "é".repeat(MAX_OUTPUT_BYTES);
        let (text, truncated) = truncate_output(long.as_bytes());
        assert!(truncated);
        assert!(text.len() <= MAX_OUTPUT_BYTES);
        assert!(text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let result = ActionResult {
            index: 0,
            kind: "run_command".into(),
            description: "list".into(),
            outcome: ActionOutcome::PolicyViolation {
                rule: "forbidden_command".into(),
                reason: "nope".into(),
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "policy_violation");
        assert_eq!(value["rule"], "forbidden_command");
        assert_eq!(value["type"], "run_command");
    }
}
