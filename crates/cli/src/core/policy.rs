//! # Atelier Policy Guard
//!
//! Allow/deny rules gating every agent-initiated command, path and URL.
//!
//! The guard is a best-effort filter, not a sandbox. Every check fails
//! closed: an unparseable URL, an invalid configured pattern, or a path that
//! cannot be resolved is reported as unsafe.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use url::Url;

use atelier_common::process_utils::resolve_through_existing;

use super::config::PolicyRuleSet;
use super::errors::EngineError;

static EVENT_HANDLER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)\bon\w+\s*=").ok());
static JAVASCRIPT_SCHEME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)javascript\s*:").ok());
static EMBEDDING_TAG: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)<\s*/?\s*(script|iframe|object|embed)\b").ok());

const MAX_SANITIZE_PASSES: usize = 8;

/// Rule that rejected an input, with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyRejection {
    pub rule: String,
    pub reason: String,
}

impl PolicyRejection {
    fn new(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.reason)
    }
}

impl From<PolicyRejection> for EngineError {
    fn from(rejection: PolicyRejection) -> Self {
        EngineError::PolicyViolation {
            rule: rejection.rule,
            reason: rejection.reason,
        }
    }
}

pub type PolicyCheck = Result<(), PolicyRejection>;

/// Stateless evaluator over an immutable [`PolicyRuleSet`].
#[derive(Debug)]
pub struct PolicyGuard {
    rules: PolicyRuleSet,
    forbidden_commands: Vec<String>,
    traversal_tokens: Vec<String>,
    sensitive_prefixes: Vec<String>,
    url_patterns: Vec<Regex>,
    invalid_url_patterns: Vec<String>,
}

impl PolicyGuard {
    pub fn new(rules: PolicyRuleSet) -> Self {
        let lower = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|v| v.to_lowercase())
                .filter(|v| !v.is_empty())
                .collect()
        };

        let mut url_patterns = Vec::new();
        let mut invalid_url_patterns = Vec::new();
        for pattern in &rules.forbidden_url_patterns {
            match Regex::new(pattern) {
                Ok(re) => url_patterns.push(re),
                Err(err) => {
                    warn!(%pattern, "invalid forbidden URL pattern: {err}");
                    invalid_url_patterns.push(pattern.clone());
                }
            }
        }

        Self {
            forbidden_commands: lower(&rules.forbidden_commands),
            traversal_tokens: lower(&rules.traversal_tokens),
            sensitive_prefixes: lower(&rules.sensitive_prefixes),
            url_patterns,
            invalid_url_patterns,
            rules,
        }
    }

    pub fn rules(&self) -> &PolicyRuleSet {
        &self.rules
    }

    pub fn check_command(&self, command: &str) -> PolicyCheck {
        let lowered = command.to_lowercase();
        let result = if lowered.trim().is_empty() {
            Err(PolicyRejection::new("empty_command", "command is empty"))
        } else if let Some(hit) = self.forbidden_commands.iter().find(|c| lowered.contains(c.as_str())) {
            Err(PolicyRejection::new(
                "forbidden_command",
                format!("command contains forbidden pattern '{hit}'"),
            ))
        } else if let Some(hit) = self.traversal_tokens.iter().find(|t| lowered.contains(t.as_str())) {
            Err(PolicyRejection::new(
                "path_traversal",
                format!("command contains traversal token '{hit}'"),
            ))
        } else if let Some(hit) = self.sensitive_prefixes.iter().find(|p| lowered.contains(p.as_str())) {
            Err(PolicyRejection::new(
                "sensitive_path",
                format!("command references sensitive location '{hit}'"),
            ))
        } else {
            Ok(())
        };
        log_rejection("command", command, &result);
        result
    }

    /// Relative paths are taken relative to `project_root`.
    pub fn check_file_path(&self, path: &Path, project_root: &Path) -> PolicyCheck {
        let result = self.evaluate_path(path, project_root);
        log_rejection("path", &path.display().to_string(), &result);
        result
    }

    fn evaluate_path(&self, path: &Path, project_root: &Path) -> PolicyCheck {
        let root = resolve_through_existing(project_root).map_err(|err| {
            PolicyRejection::new(
                "path_unresolvable",
                format!("cannot resolve project root {}: {err}", project_root.display()),
            )
        })?;
        let joined: PathBuf = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let resolved = resolve_through_existing(&joined).map_err(|err| {
            PolicyRejection::new(
                "path_unresolvable",
                format!("cannot resolve {}: {err}", path.display()),
            )
        })?;

        let Ok(relative) = resolved.strip_prefix(&root) else {
            return Err(PolicyRejection::new(
                "outside_project",
                format!("{} is outside the project root", resolved.display()),
            ));
        };

        let relative = relative.to_string_lossy().replace('\\', "/");
        if let Some(fragment) = self
            .rules
            .forbidden_path_fragments
            .iter()
            .find(|f| !f.is_empty() && relative.contains(f.as_str()))
        {
            return Err(PolicyRejection::new(
                "forbidden_path",
                format!("path touches protected entry '{fragment}'"),
            ));
        }
        Ok(())
    }

    pub fn check_url(&self, raw: &str) -> PolicyCheck {
        let result = self.evaluate_url(raw);
        log_rejection("url", raw, &result);
        result
    }

    fn evaluate_url(&self, raw: &str) -> PolicyCheck {
        if !self.invalid_url_patterns.is_empty() {
            return Err(PolicyRejection::new(
                "url_pattern_invalid",
                format!(
                    "URL rules contain invalid patterns: {}",
                    self.invalid_url_patterns.join(", ")
                ),
            ));
        }

        let url = Url::parse(raw.trim())
            .map_err(|err| PolicyRejection::new("url_invalid", format!("cannot parse URL: {err}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(PolicyRejection::new(
                "url_scheme",
                format!("scheme '{}' is not allowed", url.scheme()),
            ));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(PolicyRejection::new("url_invalid", "URL has no host"));
        }
        if let Some(port) = url.port_or_known_default() {
            if self.rules.blocked_ports.contains(&port) {
                return Err(PolicyRejection::new(
                    "blocked_port",
                    format!("port {port} is blocked"),
                ));
            }
        }

        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        if let Some(re) = self.url_patterns.iter().find(|re| re.is_match(&target)) {
            return Err(PolicyRejection::new(
                "forbidden_url",
                format!("URL matches forbidden pattern '{}'", re.as_str()),
            ));
        }
        Ok(())
    }

    pub fn check_file_size(&self, bytes: u64) -> PolicyCheck {
        let result = if bytes > self.rules.max_file_size_bytes {
            Err(PolicyRejection::new(
                "file_size",
                format!(
                    "{bytes} bytes exceeds the {} byte file limit",
                    self.rules.max_file_size_bytes
                ),
            ))
        } else {
            Ok(())
        };
        log_rejection("file size", &bytes.to_string(), &result);
        result
    }

    pub fn check_project_size(&self, bytes: u64) -> PolicyCheck {
        let result = if bytes > self.rules.max_project_size_bytes {
            Err(PolicyRejection::new(
                "project_size",
                format!(
                    "{bytes} bytes exceeds the {} byte project limit",
                    self.rules.max_project_size_bytes
                ),
            ))
        } else {
            Ok(())
        };
        log_rejection("project size", &bytes.to_string(), &result);
        result
    }

    pub fn check_session_duration(&self, started_at: DateTime<Utc>) -> PolicyCheck {
        let elapsed = Utc::now()
            .signed_duration_since(started_at)
            .num_seconds()
            .max(0) as u64;
        let result = if elapsed > self.rules.max_session_duration_secs {
            Err(PolicyRejection::new(
                "session_duration",
                format!(
                    "session running for {elapsed}s exceeds {}s",
                    self.rules.max_session_duration_secs
                ),
            ))
        } else {
            Ok(())
        };
        log_rejection("session", &started_at.to_rfc3339(), &result);
        result
    }

    pub fn is_command_safe(&self, command: &str) -> bool {
        self.check_command(command).is_ok()
    }

    pub fn is_file_path_safe(&self, path: &Path, project_root: &Path) -> bool {
        self.check_file_path(path, project_root).is_ok()
    }

    pub fn is_url_safe(&self, url: &str) -> bool {
        self.check_url(url).is_ok()
    }

    pub fn is_file_size_safe(&self, bytes: u64) -> bool {
        self.check_file_size(bytes).is_ok()
    }

    pub fn is_project_size_safe(&self, bytes: u64) -> bool {
        self.check_project_size(bytes).is_ok()
    }

    pub fn is_session_duration_safe(&self, started_at: DateTime<Utc>) -> bool {
        self.check_session_duration(started_at).is_ok()
    }

    /// Strips angle brackets, `javascript:` schemes and `on*=` handlers.
    ///
    /// Removal is repeated until the text is stable so that nested payloads
    /// cannot reassemble. Yields an empty string if the patterns are
    /// unavailable.
    pub fn sanitize_input(&self, text: &str) -> String {
        let (Some(scheme), Some(handler)) = ((*JAVASCRIPT_SCHEME).as_ref(), (*EVENT_HANDLER).as_ref())
        else {
            return String::new();
        };

        let mut current = text.to_string();
        for _ in 0..MAX_SANITIZE_PASSES {
            let next = current.replace(['<', '>'], "");
            let next = scheme.replace_all(&next, "").into_owned();
            let next = handler.replace_all(&next, "").into_owned();
            if next == current {
                return next;
            }
            current = next;
        }
        current
    }

    /// Applies [`sanitize_input`](Self::sanitize_input) to every string in a
    /// JSON value, keys included.
    pub fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_input(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (self.sanitize_input(k), self.sanitize_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// True when `text` carries markup or script injection markers.
    pub fn detect_intrusion(&self, text: &str) -> bool {
        let patterns = [&*EMBEDDING_TAG, &*JAVASCRIPT_SCHEME, &*EVENT_HANDLER];
        let detected = patterns.iter().any(|re| match re {
            Some(re) => re.is_match(text),
            None => true,
        });
        if detected {
            warn!(len = text.len(), "intrusion markers detected in input");
        }
        detected
    }
}

impl Default for PolicyGuard {
    fn default() -> Self {
        Self::new(PolicyRuleSet::default())
    }
}

fn log_rejection(kind: &str, subject: &str, result: &PolicyCheck) {
    if let Err(rejection) = result {
        warn!(kind, subject, rule = %rejection.rule, "policy rejected: {}", rejection.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::TempDir;

    fn guard() -> PolicyGuard {
        PolicyGuard::default()
    }

    #[test]
    fn test_commands() {
        let g = guard();
        assert!(!g.is_command_safe("rm -rf /"));
        assert!(!g.is_command_safe("SUDO apt install x"));
        assert!(!g.is_command_safe("cd .. && ls"));
        assert!(!g.is_command_safe("cat /etc/passwd"));
        assert!(!g.is_command_safe("   "));
        assert!(g.is_command_safe("ls"));
        assert!(g.is_command_safe("npm install react"));

        let rejection = g.check_command("cat ../secret").unwrap_err();
        assert_eq!(rejection.rule, "path_traversal");
    }

    #[test]
    fn test_paths() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let g = guard();

        assert!(g.is_file_path_safe(&root.join("src/app.ts"), root));
        assert!(g.is_file_path_safe(Path::new("src/app.ts"), root));
        assert!(!g.is_file_path_safe(Path::new("/etc/passwd"), root));
        assert!(!g.is_file_path_safe(Path::new("../outside.txt"), root));
        assert_eq!(
            g.check_file_path(Path::new(".env"), root).unwrap_err().rule,
            "forbidden_path"
        );
        assert!(!g.is_file_path_safe(Path::new("node_modules/x/index.js"), root));
    }

    #[test]
    fn test_urls() {
        let g = guard();
        assert!(g.is_url_safe("https://example.com/docs"));
        assert!(g.is_url_safe("http://localhost:3000/"));
        assert!(!g.is_url_safe("ftp://example.com/file"));
        assert!(!g.is_url_safe("not a url"));
        assert!(!g.is_url_safe("https://example.com/wp-admin/"));
        assert!(!g.is_url_safe("https://example.com/.env"));
        assert_eq!(
            g.check_url("http://db.internal:5432/").unwrap_err().rule,
            "blocked_port"
        );
    }

    #[test]
    fn test_invalid_pattern_fails_closed() {
        let rules = PolicyRuleSet {
            forbidden_url_patterns: vec!["(unclosed".into()],
            ..PolicyRuleSet::default()
        };
        let g = PolicyGuard::new(rules);
        assert!(!g.is_url_safe("https://example.com/"));
    }

    #[test]
    fn test_limits() {
        let g = guard();
        assert!(g.is_file_size_safe(1024));
        assert!(!g.is_file_size_safe(g.rules().max_file_size_bytes + 1));
        assert!(!g.is_project_size_safe(g.rules().max_project_size_bytes + 1));
        assert!(g.is_session_duration_safe(Utc::now()));
        assert!(!g.is_session_duration_safe(Utc::now() - ChronoDuration::hours(5)));
    }

    #[test]
    fn test_sanitize() {
        let g = guard();
        assert_eq!(g.sanitize_input("<b>hi</b>"), "bhi/b");
        assert_eq!(g.sanitize_input("javascript:alert(1)"), "alert(1)");
        assert_eq!(g.sanitize_input("img onclick=run()"), "img run()");
        assert_eq!(g.sanitize_input("javajavascript:script:x"), "x");
        assert_eq!(g.sanitize_input("plain text"), "plain text");

        let value = json!({"title": "<i>x</i>", "count": 3, "tags": ["a<b", true]});
        let clean = g.sanitize_value(&value);
        assert_eq!(clean, json!({"title": "ix/i", "count": 3, "tags": ["ab", true]}));
    }

    #[test]
    fn test_detect_intrusion() {
        let g = guard();
        assert!(g.detect_intrusion("<script>alert(1)</script>"));
        assert!(g.detect_intrusion("<IFRAME src=x>"));
        assert!(g.detect_intrusion("a href=javascript:void(0)"));
        assert!(g.detect_intrusion("<img onerror=x>"));
        assert!(!g.detect_intrusion("Add a contact form to the landing page"));
    }
}
