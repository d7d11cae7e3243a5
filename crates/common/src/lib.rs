// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod limits;
pub mod process_utils;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Identifier of a workspace session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Frontend stack of a project, used to pick its dev-server command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    #[default]
    Nextjs,
    React,
    Vue,
    Svelte,
    Vanilla,
}

impl ProjectType {
    pub const ALL: [ProjectType; 5] = [
        ProjectType::Nextjs,
        ProjectType::React,
        ProjectType::Vue,
        ProjectType::Svelte,
        ProjectType::Vanilla,
    ];

    /// Parses a project type name. Unknown names fall back to `Nextjs`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "react" => ProjectType::React,
            "vue" => ProjectType::Vue,
            "svelte" => ProjectType::Svelte,
            "vanilla" | "html" | "static" => ProjectType::Vanilla,
            _ => ProjectType::Nextjs,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Nextjs => "nextjs",
            ProjectType::React => "react",
            ProjectType::Vue => "vue",
            ProjectType::Svelte => "svelte",
            ProjectType::Vanilla => "vanilla",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session record as handed over by the session registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub project_type: ProjectType,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: impl Into<SessionId>,
        working_directory: impl Into<PathBuf>,
        project_type: ProjectType,
    ) -> Self {
        Self {
            id: id.into(),
            working_directory: working_directory.into(),
            project_type,
            created_at: Utc::now(),
        }
    }
}

/// Standard JSON response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdResponse<T> {
    /// Whether the operation succeeded
    pub success: bool,
    /// Timestamp of the response
    pub timestamp: DateTime<Utc>,
    /// Optional request identifier for tracing
    pub request_id: Option<Uuid>,
    /// Error information if operation failed
    pub error: Option<StdError>,
    /// Response data if operation succeeded
    pub data: Option<T>,
}

impl<T> StdResponse<T> {
    pub fn success(data: T, request_id: Option<Uuid>) -> Self {
        Self {
            success: true,
            timestamp: Utc::now(),
            request_id,
            error: None,
            data: Some(data),
        }
    }

    pub fn error(error: StdError, request_id: Option<Uuid>) -> Self {
        Self {
            success: false,
            timestamp: Utc::now(),
            request_id,
            error: Some(error),
            data: None,
        }
    }
}

/// Standard error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdError {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional detailed error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Hints for error resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl StdError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_type_fallback() {
        assert_eq!(ProjectType::parse_lenient("React"), ProjectType::React);
        assert_eq!(ProjectType::parse_lenient(" svelte "), ProjectType::Svelte);
        assert_eq!(ProjectType::parse_lenient("angular"), ProjectType::Nextjs);
        assert_eq!(ProjectType::parse_lenient(""), ProjectType::Nextjs);
    }

    #[test]
    fn test_session_deserialize_camel_case() {
        let raw = r#"{"id":"s1","workingDirectory":"/tmp/p","projectType":"vue"}"#;
        let session: Session = serde_json::from_str(raw).unwrap();
        assert_eq!(session.id.as_str(), "s1");
        assert_eq!(session.project_type, ProjectType::Vue);
        assert_eq!(session.working_directory, PathBuf::from("/tmp/p"));
    }

    #[test]
    fn test_std_response_error_shape() {
        let resp: StdResponse<()> =
            StdResponse::error(StdError::new("E_NOT_FOUND", "missing").with_hint("check id"), None);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "E_NOT_FOUND");
        assert_eq!(value["error"]["hint"], "check id");
    }
}
