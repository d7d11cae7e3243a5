//! # Atelier Engine Configuration
//!
//! Configuration structures for the workspace engine: port range, dev-server
//! preview behavior, version store layout, and policy rules.
//!
//! ## Configuration Loading
//!
//! Configuration is loaded from multiple sources in order of precedence:
//! 1. Environment variables (ATELIER_*)
//! 2. Configuration file (`--config`, `$ATELIER_CONFIG`, `atelier.toml`,
//!    `.atelier/atelier.toml`)
//! 3. Built-in defaults

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use atelier_common::limits::{resolve_preview_limits, LimitSources, PreviewLimits};
use atelier_common::ProjectType;

const DEFAULT_BASE_PORT: u16 = 3000;
const DEFAULT_MAX_PORT: u16 = 3999;
const DEFAULT_MAX_VERSIONS: usize = 50;
const DEFAULT_VERSIONS_DIR: &str = ".atelier/versions";

const DEFAULT_FORBIDDEN_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf *",
    "sudo ",
    "su root",
    "chmod 777",
    "chown ",
    "mkfs",
    "dd if=",
    "fdisk",
    "parted ",
    "format c:",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "init 0",
    "kill -9 1",
    ":(){",
    "> /dev/sd",
    "| sh",
    "| bash",
];
const DEFAULT_TRAVERSAL_TOKENS: &[&str] = &["cd ..", "../", "..\\"];
const DEFAULT_SENSITIVE_PREFIXES: &[&str] =
    &["/etc/", "/var/", "/sys/", "/proc/", "/boot/", "/root/"];
const DEFAULT_FORBIDDEN_PATH_FRAGMENTS: &[&str] = &[
    ".env",
    ".git",
    "node_modules",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    ".atelier",
];
const DEFAULT_FORBIDDEN_URL_PATTERNS: &[&str] = &[
    r"(?i)/admin(/|$)",
    r"(?i)/wp-admin",
    r"(?i)/login(/|$)",
    r"(?i)/phpmyadmin",
    r"(?i)\.env($|[/?#])",
    r"(?i)/\.git(/|$)",
];
const DEFAULT_BLOCKED_PORTS: &[u16] = &[22, 23, 25, 445, 3306, 5432, 6379, 9200, 11211, 27017];

const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_MAX_PROJECT_SIZE_BYTES: u64 = 500 * 1024 * 1024; // 500 MiB
const DEFAULT_MAX_SESSION_DURATION_SECS: u64 = 4 * 60 * 60;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Raised when the configuration file cannot be read.
    #[error("failed to read config at {path:?}")]
    Io {
        /// Path that failed to load
        path: PathBuf,
        /// Source I/O error
        #[source]
        source: std::io::Error,
    },

    /// Raised when the configuration file cannot be parsed as TOML.
    #[error("failed to parse config at {path:?}")]
    Parse {
        /// Path that failed to parse
        path: PathBuf,
        /// Underlying TOML parser error
        #[source]
        source: toml::de::Error,
    },
}

/// Root configuration for the workspace engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Port range handed to dev servers
    pub ports: PortSettings,

    /// Dev-server preview behavior
    pub preview: PreviewSettings,

    /// Version store layout and retention
    pub versions: VersionSettings,

    /// Policy rules gating agent actions
    pub policy: PolicyRuleSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub base: u16,
    pub max: u16,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_PORT,
            max: DEFAULT_MAX_PORT,
        }
    }
}

/// Program, arguments and environment of a dev server.
///
/// `{port}` in `args` or `env` values is replaced by the allocated port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevServerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl DevServerCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Built-in command for a project type.
    pub fn builtin(project_type: ProjectType) -> Self {
        match project_type {
            ProjectType::Nextjs => Self::new("npm", &["run", "dev", "--", "-p", "{port}"]),
            ProjectType::React => Self::new("npm", &["start"]).with_env("BROWSER", "none"),
            ProjectType::Vue => Self::new("npm", &["run", "dev", "--", "--port", "{port}"]),
            ProjectType::Svelte => Self::new("npm", &["run", "dev", "--", "--port", "{port}"]),
            ProjectType::Vanilla => Self::new("npx", &["http-server", "-p", "{port}", "."]),
        }
    }

    /// Override from `overrides` keyed by type name, else the builtin.
    pub fn resolve(
        overrides: &HashMap<String, DevServerCommand>,
        project_type: ProjectType,
    ) -> Self {
        overrides
            .get(project_type.as_str())
            .cloned()
            .unwrap_or_else(|| Self::builtin(project_type))
    }

    /// Substitutes `{port}` placeholders.
    pub fn render(&self, port: u16) -> DevServerCommand {
        let port = port.to_string();
        DevServerCommand {
            program: self.program.clone(),
            args: self
                .args
                .iter()
                .map(|arg| arg.replace("{port}", &port))
                .collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.replace("{port}", &port)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSettings {
    /// Interval between readiness probes (ms)
    pub probe_interval_ms: Option<u64>,
    /// Maximum number of readiness probes
    pub probe_attempts: Option<u32>,
    /// Grace period between SIGTERM and SIGKILL (ms)
    pub stop_timeout_ms: Option<u64>,
    /// Any HTTP response counts as ready; `false` requires a 2xx
    pub ready_on_any_status: bool,
    /// Previews older than this are stopped by the reaper
    pub max_lifetime_secs: Option<u64>,
    /// Reaper sweep interval (ms)
    pub reaper_interval_ms: u64,
    /// Dev-server output lines kept per preview
    pub output_tail_lines: usize,
    /// Per project type overrides, keyed by type name
    pub commands: HashMap<String, DevServerCommand>,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: None,
            probe_attempts: None,
            stop_timeout_ms: None,
            ready_on_any_status: true,
            max_lifetime_secs: None,
            reaper_interval_ms: 1_000,
            output_tail_lines: 200,
            commands: HashMap::new(),
        }
    }
}

impl PreviewSettings {
    /// Effective probe/stop timings after env overrides and clamping.
    pub fn limits(&self) -> (PreviewLimits, LimitSources) {
        resolve_preview_limits(
            self.probe_interval_ms,
            self.probe_attempts,
            self.stop_timeout_ms,
        )
    }

    /// Dev-server command for `project_type`, honoring overrides.
    pub fn command_for(&self, project_type: ProjectType) -> DevServerCommand {
        DevServerCommand::resolve(&self.commands, project_type)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionSettings {
    /// Directory holding `versions.json` and one directory per version
    pub dir: PathBuf,
    /// Index capacity; oldest versions are pruned beyond it
    pub max_versions: usize,
    /// Directory names never copied into a version
    pub exclude_dirs: Vec<String>,
    /// File extensions never copied into a version
    pub exclude_extensions: Vec<String>,
}

impl Default for VersionSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_VERSIONS_DIR),
            max_versions: DEFAULT_MAX_VERSIONS,
            exclude_dirs: vec!["node_modules".into(), ".git".into()],
            exclude_extensions: vec!["log".into()],
        }
    }
}

/// Deny-lists and ceilings evaluated by the policy guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRuleSet {
    pub forbidden_commands: Vec<String>,
    pub traversal_tokens: Vec<String>,
    pub sensitive_prefixes: Vec<String>,
    pub forbidden_path_fragments: Vec<String>,
    pub forbidden_url_patterns: Vec<String>,
    pub blocked_ports: Vec<u16>,
    pub max_file_size_bytes: u64,
    pub max_project_size_bytes: u64,
    pub max_session_duration_secs: u64,
    pub command_timeout_secs: u64,
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Default for PolicyRuleSet {
    fn default() -> Self {
        Self {
            forbidden_commands: owned(DEFAULT_FORBIDDEN_COMMANDS),
            traversal_tokens: owned(DEFAULT_TRAVERSAL_TOKENS),
            sensitive_prefixes: owned(DEFAULT_SENSITIVE_PREFIXES),
            forbidden_path_fragments: owned(DEFAULT_FORBIDDEN_PATH_FRAGMENTS),
            forbidden_url_patterns: owned(DEFAULT_FORBIDDEN_URL_PATTERNS),
            blocked_ports: DEFAULT_BLOCKED_PORTS.to_vec(),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            max_project_size_bytes: DEFAULT_MAX_PROJECT_SIZE_BYTES,
            max_session_duration_secs: DEFAULT_MAX_SESSION_DURATION_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    /// Returns the base defaults without reading disk or environment.
    pub fn builtin_defaults() -> Self {
        Self::default()
    }

    /// Loads configuration from the given path, applying environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;

        let mut config: EngineConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path_ref.to_path_buf(),
                source,
            })?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from standard sources (path override, env, defaults).
    ///
    /// A file that fails to load is reported and replaced by defaults.
    pub fn from_sources(path_override: Option<PathBuf>) -> Self {
        if let Some(path) = Self::discover_config_path(path_override) {
            match Self::load_from_path(&path) {
                Ok(config) => return config,
                Err(err) => warn!(path = %path.display(), "ignoring config: {err:#}"),
            }
        }

        let mut config = Self::builtin_defaults();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides using the `ATELIER_*` namespace.
    ///
    /// Preview timings are resolved later through `PreviewSettings::limits`.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("ATELIER_BASE_PORT") {
            if let Ok(parsed) = value.trim().parse::<u16>() {
                self.ports.base = parsed;
            }
        }

        if let Ok(value) = env::var("ATELIER_VERSIONS_DIR") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                self.versions.dir = PathBuf::from(trimmed);
            }
        }

        if let Ok(value) = env::var("ATELIER_MAX_VERSIONS") {
            if let Ok(parsed) = value.trim().parse::<usize>() {
                self.versions.max_versions = parsed;
            }
        }

        if self.ports.max < self.ports.base {
            self.ports.max = self.ports.base.saturating_add(999);
        }
    }

    /// Discovers the configuration path to use.
    fn discover_config_path(path_override: Option<PathBuf>) -> Option<PathBuf> {
        if let Some(path) = path_override {
            return Some(path);
        }

        if let Ok(from_env) = env::var("ATELIER_CONFIG") {
            let trimmed = from_env.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }

        let candidates = [
            PathBuf::from("atelier.toml"),
            Path::new(".atelier").join("atelier.toml"),
        ];

        candidates.into_iter().find(|candidate| candidate.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::builtin_defaults();
        assert_eq!(config.ports.base, 3000);
        assert_eq!(config.versions.max_versions, 50);
        assert!(config.preview.ready_on_any_status);
        assert!(config
            .policy
            .forbidden_commands
            .iter()
            .any(|c| c == "rm -rf /"));
        assert!(config.policy.blocked_ports.contains(&5432));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("atelier.toml");
        fs::write(
            &path,
            r#"
[ports]
base = 4100

[versions]
max_versions = 5

[preview.commands.vanilla]
program = "python3"
args = ["-m", "http.server", "{port}"]
"#,
        )
        .unwrap();

        let config = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(config.ports.base, 4100);
        assert_eq!(config.ports.max, 5099);
        assert_eq!(config.versions.max_versions, 5);
        assert_eq!(config.versions.exclude_dirs, vec!["node_modules", ".git"]);

        let vanilla = config.preview.command_for(ProjectType::Vanilla).render(4100);
        assert_eq!(vanilla.program, "python3");
        assert_eq!(vanilla.args, vec!["-m", "http.server", "4100"]);
        // untouched types keep the builtin table
        assert_eq!(
            config.preview.command_for(ProjectType::Vue),
            DevServerCommand::builtin(ProjectType::Vue)
        );
    }

    #[test]
    fn test_parse_error_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.toml");
        fs::write(&path, "[ports\nbase = ").unwrap();
        let err = EngineConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_render_substitutes_port() {
        let cmd = DevServerCommand::builtin(ProjectType::Nextjs).render(3007);
        assert_eq!(cmd.program, "npm");
        assert_eq!(cmd.args, vec!["run", "dev", "--", "-p", "3007"]);
    }
}
