//! # Atelier Engine Error Types
//!
//! This module defines all error types that can be returned by the workspace
//! engine. Each variant corresponds to a specific failure mode and carries the
//! context a caller needs to branch on it or render a message.
//!
//! ## Error Categories
//!
//! - **Lookup**: missing sessions, previews or versions
//! - **Security**: blocked commands, paths, URLs, sizes or durations
//! - **Resource**: exhausted ports or breached limits
//! - **Process**: spawn failures, readiness timeouts, unexpected exits
//! - **System**: filesystem and archive failures

use std::path::PathBuf;

use serde_json::json;
use thiserror::Error;

use atelier_common::StdError;

/// Error categories for taxonomy and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Missing session, preview or version
    Lookup,
    /// Policy rule rejected the operation
    Security,
    /// Capacity limits
    Resource,
    /// Child process lifecycle
    Process,
    /// Malformed input or configuration
    Validation,
    /// I/O and internal failures
    System,
}

/// Result type for all engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error enumeration for workspace engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// E_NOT_FOUND - Referenced resource does not exist
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of resource ("session", "preview", "version", "project")
        resource: &'static str,
        /// Identifier or path that was looked up
        id: String,
    },

    /// E_POLICY_VIOLATION - Operation rejected by the policy guard
    #[error("Blocked by policy rule '{rule}': {reason}")]
    PolicyViolation {
        /// Rule that fired
        rule: String,
        /// Human-readable explanation
        reason: String,
    },

    /// E_RESOURCE_EXHAUSTED - No capacity left (ports, sizes, durations)
    #[error("Resource exhausted ({resource}): {detail}")]
    ResourceExhausted {
        /// Exhausted resource
        resource: &'static str,
        /// Additional context
        detail: String,
    },

    /// E_PROCESS_FAILURE - Dev server could not be spawned, never became
    /// ready, or exited unexpectedly
    #[error("Process failure for session {session_id}: {reason}")]
    ProcessFailure {
        /// Session owning the process
        session_id: String,
        /// What went wrong
        reason: String,
    },

    /// E_IO - Filesystem, copy or archive failure
    #[error("I/O error during {operation}{}: {source}", .path.as_ref().map(|p| format!(" on {}", p.display())).unwrap_or_default())]
    Io {
        /// Operation that failed
        operation: String,
        /// Path involved, if any
        path: Option<PathBuf>,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// E_INVALID_ACTION - Proposed action is unknown or malformed
    #[error("Invalid action '{action}': {reason}")]
    InvalidAction {
        /// Action type as proposed
        action: String,
        /// Parsing or validation failure
        reason: String,
    },

    /// E_CONFIG - Configuration could not be applied
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Helper to build an I/O error with an optional path and operation name.
    pub fn io<P, S>(path: P, operation: S, source: std::io::Error) -> Self
    where
        P: Into<Option<PathBuf>>,
        S: Into<String>,
    {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn policy(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    pub fn process(session_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::ProcessFailure {
            session_id: session_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the stable error code for this variant.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "E_NOT_FOUND",
            EngineError::PolicyViolation { .. } => "E_POLICY_VIOLATION",
            EngineError::ResourceExhausted { .. } => "E_RESOURCE_EXHAUSTED",
            EngineError::ProcessFailure { .. } => "E_PROCESS_FAILURE",
            EngineError::Io { .. } => "E_IO",
            EngineError::InvalidAction { .. } => "E_INVALID_ACTION",
            EngineError::Config(_) => "E_CONFIG",
        }
    }

    /// Returns the error category for taxonomic classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::NotFound { .. } => ErrorCategory::Lookup,
            EngineError::PolicyViolation { .. } => ErrorCategory::Security,
            EngineError::ResourceExhausted { .. } => ErrorCategory::Resource,
            EngineError::ProcessFailure { .. } => ErrorCategory::Process,
            EngineError::Io { .. } => ErrorCategory::System,
            EngineError::InvalidAction { .. } => ErrorCategory::Validation,
            EngineError::Config(_) => ErrorCategory::Validation,
        }
    }

    /// Short hint for the caller, when there is an obvious next step.
    pub fn recovery_hint(&self) -> Option<&'static str> {
        match self {
            EngineError::NotFound { resource: "preview", .. } => {
                Some("Start a preview for this session first")
            }
            EngineError::NotFound { resource: "version", .. } => {
                Some("List versions to find a valid id")
            }
            EngineError::ResourceExhausted { resource: "port", .. } => {
                Some("Stop idle previews to free ports or widen the port range")
            }
            EngineError::ProcessFailure { .. } => {
                Some("Check the dev-server output and the project's dependencies")
            }
            EngineError::PolicyViolation { .. } => Some("Rephrase the action within the workspace"),
            _ => None,
        }
    }

    /// Converts the error into the wire-level error record.
    pub fn to_std_error(&self) -> StdError {
        let mut error = StdError::new(self.error_code(), self.to_string());
        if let Some(hint) = self.recovery_hint() {
            error = error.with_hint(hint);
        }
        match self {
            EngineError::PolicyViolation { rule, .. } => error.with_details(json!({ "rule": rule })),
            EngineError::ResourceExhausted { resource, .. } => {
                error.with_details(json!({ "resource": resource }))
            }
            _ => error,
        }
    }
}
