//! # Atelier Core Engine
//!
//! Workspace orchestration for agent sessions: dev-server previews on
//! allocated ports, full-tree project versions, and a policy layer gating
//! every agent-initiated action.
//!
//! ## Architecture
//!
//! - **Ports**: shared allocator handing out the lowest free port
//! - **Previews**: one dev server per session, probed until it answers
//! - **Versions**: immutable project snapshots with an on-disk index
//! - **Policy**: deny-lists and limits for commands, paths and URLs
//! - **Executor**: runs proposed actions through the policy, in order
//!
//! [`WorkspaceEngine`] builds all of them from one [`EngineConfig`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use atelier_common::process_utils::absolutize;

pub mod config;
pub mod errors;
pub mod executor;
pub mod policy;
pub mod ports;
pub mod preview;
pub mod versions;

pub use atelier_common::{ProjectType, Session, SessionId, StdError, StdResponse};
pub use config::{ConfigError, EngineConfig};
pub use errors::{EngineError, EngineResult, ErrorCategory};
pub use executor::{ActionExecutor, ActionKind, ActionOutcome, ActionResult, ProposedAction};
pub use policy::{PolicyGuard, PolicyRejection};
pub use ports::PortAllocator;
pub use preview::{PreviewInfo, PreviewOrchestrator, PreviewState, PreviewStatus};
pub use versions::VersionStore;

/// All engine components, wired from one configuration.
pub struct WorkspaceEngine {
    config: EngineConfig,
    ports: Arc<PortAllocator>,
    policy: Arc<PolicyGuard>,
    previews: PreviewOrchestrator,
    versions: Arc<VersionStore>,
}

impl WorkspaceEngine {
    /// Builds the engine with real dev-server processes.
    ///
    /// A relative `versions.dir` is resolved against the current directory.
    pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
        let ports = Arc::new(PortAllocator::from_settings(&config.ports));
        let previews = PreviewOrchestrator::new(ports.clone(), &config.preview);
        Self::assemble(config, ports, previews)
    }

    /// Builds the engine around an existing orchestrator (custom spawner or
    /// probe).
    pub fn with_previews(config: EngineConfig, previews: PreviewOrchestrator) -> EngineResult<Self> {
        let ports = previews.ports().clone();
        Self::assemble(config, ports, previews)
    }

    fn assemble(
        config: EngineConfig,
        ports: Arc<PortAllocator>,
        previews: PreviewOrchestrator,
    ) -> EngineResult<Self> {
        if config.ports.base == 0 {
            return Err(EngineError::Config("ports.base must be at least 1".to_string()));
        }
        if config.versions.max_versions == 0 {
            return Err(EngineError::Config(
                "versions.max_versions must be at least 1".to_string(),
            ));
        }
        let versions_dir = absolutize(&config.versions.dir)
            .map_err(|e| EngineError::io(config.versions.dir.clone(), "resolve versions dir", e))?;
        let versions = Arc::new(VersionStore::open(&versions_dir, config.versions.clone())?);
        let policy = Arc::new(PolicyGuard::new(config.policy.clone()));

        info!(
            base_port = config.ports.base,
            max_port = config.ports.max,
            versions_dir = %versions.root().display(),
            "workspace engine ready"
        );
        Ok(Self {
            config,
            ports,
            policy,
            previews,
            versions,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn policy(&self) -> &Arc<PolicyGuard> {
        &self.policy
    }

    pub fn previews(&self) -> &PreviewOrchestrator {
        &self.previews
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    /// Executor sharing this engine's policy, previews and version store.
    pub fn executor(&self) -> ActionExecutor {
        ActionExecutor::new(
            self.policy.clone(),
            self.previews.clone(),
            self.versions.clone(),
        )
    }

    /// Starts the preview reaper at the configured interval.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        self.previews
            .spawn_reaper(Duration::from_millis(self.config.preview.reaper_interval_ms))
    }
}
