//! # Atelier Library
//!
//! Workspace orchestration engine behind the `atelier` binary.

pub mod core;

// Re-export core types for convenience
pub use core::{
    ActionExecutor, ActionKind, ActionOutcome, ActionResult, EngineConfig, EngineError,
    EngineResult, PolicyGuard, PortAllocator, PreviewOrchestrator, ProjectType, ProposedAction,
    Session, SessionId, StdError, StdResponse, VersionStore, WorkspaceEngine,
};
