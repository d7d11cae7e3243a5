// # -----------------------------
// # crates/cli/src/main.rs
// # -----------------------------
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use atelier_common::process_utils::absolutize;
use atelier_cli::core::versions::{PreviewDescriptor, VersionStore};
use atelier_cli::core::{
    EngineConfig, EngineResult, PolicyGuard, PortAllocator, PreviewOrchestrator, ProjectType,
    ProposedAction, Session, SessionId, StdError, StdResponse, WorkspaceEngine,
};

#[derive(Parser, Debug)]
#[command(name = "atelier", version, about = "Atelier - workspace orchestration engine", long_about = None)]
struct Cli {
    /// Configuration file (defaults: $ATELIER_CONFIG, atelier.toml, .atelier/atelier.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Debug logging (overrides RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute action batches read as JSON lines on stdin
    Serve,
    /// Manage project versions
    Versions {
        #[command(subcommand)]
        action: VersionsCommand,
    },
    /// Evaluate input against the policy rules (exit 1 when rejected)
    Check {
        #[command(subcommand)]
        target: CheckCommand,
    },
    /// Start a dev-server preview and keep it running until Ctrl-C
    Preview {
        /// Project directory
        project: PathBuf,
        /// Project type (nextjs, react, vue, svelte, vanilla)
        #[arg(long = "type", value_name = "TYPE")]
        project_type: Option<String>,
        /// Session identifier
        #[arg(long, default_value = "cli")]
        session: String,
    },
}

#[derive(Subcommand, Debug)]
enum VersionsCommand {
    /// List versions, newest first
    List,
    /// Show metadata and files of a version
    Show { id: String },
    /// Snapshot a project directory
    Save {
        #[arg(default_value = ".")]
        project: PathBuf,
        /// Description recorded with the version
        #[arg(short = 'm', long, default_value = "")]
        message: String,
        /// Preview URL recorded in preview.json
        #[arg(long)]
        preview_url: Option<String>,
    },
    /// Replace a directory's contents with a version
    Restore {
        id: String,
        #[arg(default_value = ".")]
        target: PathBuf,
    },
    /// Files added and removed between two versions
    Diff { from: String, to: String },
    /// Delete a version
    Delete { id: String },
    /// Export a version as a zip archive
    Export {
        id: String,
        #[arg(default_value = ".")]
        dest: PathBuf,
    },
    /// Totals over all versions
    Stats,
}

#[derive(Subcommand, Debug)]
enum CheckCommand {
    /// Shell command
    Command { command: String },
    /// File path relative to a project root
    Path {
        path: PathBuf,
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// URL
    Url { url: String },
    /// Print the sanitized form of a text
    Sanitize { text: String },
    /// Look for script injection markers
    Intrusion { text: String },
}

/// One request of the `serve` protocol.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServeRequest {
    session: Session,
    #[serde(default)]
    actions: Vec<ProposedAction>,
    #[serde(default)]
    request_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct CheckReport<'a> {
    kind: &'a str,
    input: &'a str,
    safe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    debug!("CLI arguments: {:?}", cli);

    let config = EngineConfig::from_sources(cli.config.clone());
    let pretty = cli.pretty;

    match cli.command {
        Commands::Serve => serve(config, pretty).await,
        Commands::Versions { action } => versions(config, action, pretty).await,
        Commands::Check { target } => check(config, target, pretty),
        Commands::Preview {
            project,
            project_type,
            session,
        } => preview(config, &project, project_type.as_deref(), session, pretty).await,
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{text}")?;
    stdout.flush()?;
    Ok(())
}

/// Prints the result as a standard response; errors exit with status 1.
fn respond<T: Serialize>(result: EngineResult<T>, pretty: bool) -> Result<ExitCode> {
    match result {
        Ok(data) => {
            print_json(&StdResponse::success(data, None), pretty)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            warn!("{err}");
            print_json(&StdResponse::<()>::error(err.to_std_error(), None), pretty)?;
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn serve(config: EngineConfig, pretty: bool) -> Result<ExitCode> {
    let engine = WorkspaceEngine::from_config(config).context("start workspace engine")?;
    let executor = engine.executor();
    let reaper = engine.spawn_reaper();
    info!("serving action batches on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = &mut ctrl_c => {
                info!("interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ServeRequest>(&line) {
            Ok(request) => {
                let results = executor.execute(&request.session, request.actions).await;
                serde_json::to_value(StdResponse::success(results, request.request_id))?
            }
            Err(err) => {
                warn!("rejecting malformed request: {err}");
                serde_json::to_value(StdResponse::<()>::error(
                    StdError::new("E_INVALID_ACTION", format!("malformed request: {err}")),
                    None,
                ))?
            }
        };
        let mut text = if pretty {
            serde_json::to_string_pretty(&response)?
        } else {
            serde_json::to_string(&response)?
        };
        text.push('\n');
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
    }

    reaper.abort();
    let outcomes = engine.previews().cleanup_all_previews().await;
    for outcome in outcomes.iter().filter(|o| o.error.is_some()) {
        warn!(session_id = %outcome.session_id, "cleanup failed: {:?}", outcome.error);
    }
    info!(previews = outcomes.len(), "serve finished");
    Ok(ExitCode::SUCCESS)
}

async fn versions(config: EngineConfig, action: VersionsCommand, pretty: bool) -> Result<ExitCode> {
    let dir = absolutize(&config.versions.dir).context("resolve versions dir")?;
    let store = Arc::new(VersionStore::open(&dir, config.versions.clone()).context("open version store")?);

    // The store is blocking; keep it off the runtime threads.
    let outcome = tokio::task::spawn_blocking(move || -> Result<ExitCode> {
        match action {
            VersionsCommand::List => respond(Ok(store.get_versions()), pretty),
            VersionsCommand::Show { id } => respond(store.get_version(&id), pretty),
            VersionsCommand::Save {
                project,
                message,
                preview_url,
            } => {
                let preview = preview_url.map(|url| PreviewDescriptor {
                    url: Some(url),
                    screenshot: None,
                });
                respond(
                    store.save_version_with_preview(&project, &message, preview.as_ref()),
                    pretty,
                )
            }
            VersionsCommand::Restore { id, target } => {
                respond(store.restore_version(&id, &target), pretty)
            }
            VersionsCommand::Diff { from, to } => respond(store.compare_versions(&from, &to), pretty),
            VersionsCommand::Delete { id } => respond(
                store.delete_version(&id).map(|deleted| json!({ "id": id, "deleted": deleted })),
                pretty,
            ),
            VersionsCommand::Export { id, dest } => respond(store.export_version(&id, &dest), pretty),
            VersionsCommand::Stats => respond(Ok(store.get_version_stats()), pretty),
        }
    })
    .await
    .context("version task panicked")??;
    Ok(outcome)
}

fn check(config: EngineConfig, target: CheckCommand, pretty: bool) -> Result<ExitCode> {
    let guard = PolicyGuard::new(config.policy);

    let (kind, input, verdict) = match &target {
        CheckCommand::Command { command } => ("command", command.clone(), guard.check_command(command)),
        CheckCommand::Path { path, root } => (
            "path",
            path.display().to_string(),
            guard.check_file_path(path, root),
        ),
        CheckCommand::Url { url } => ("url", url.clone(), guard.check_url(url)),
        CheckCommand::Sanitize { text } => {
            let sanitized = guard.sanitize_input(text);
            print_json(&json!({ "input": text, "sanitized": sanitized }), pretty)?;
            return Ok(ExitCode::SUCCESS);
        }
        CheckCommand::Intrusion { text } => {
            let detected = guard.detect_intrusion(text);
            print_json(
                &CheckReport {
                    kind: "intrusion",
                    input: text,
                    safe: !detected,
                    rule: detected.then(|| "intrusion".to_string()),
                    reason: detected.then(|| "script injection markers found".to_string()),
                },
                pretty,
            )?;
            return Ok(if detected {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            });
        }
    };

    let (rule, reason) = match &verdict {
        Ok(()) => (None, None),
        Err(rejection) => (Some(rejection.rule.clone()), Some(rejection.reason.clone())),
    };
    print_json(
        &CheckReport {
            kind,
            input: &input,
            safe: verdict.is_ok(),
            rule,
            reason,
        },
        pretty,
    )?;
    Ok(if verdict.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn preview(
    config: EngineConfig,
    project: &Path,
    project_type: Option<&str>,
    session: String,
    pretty: bool,
) -> Result<ExitCode> {
    let ports = Arc::new(PortAllocator::from_settings(&config.ports));
    let orchestrator = PreviewOrchestrator::new(ports, &config.preview);
    let reaper = orchestrator.spawn_reaper(std::time::Duration::from_millis(
        config.preview.reaper_interval_ms,
    ));
    let session_id = SessionId::new(session);
    let project_type = project_type
        .map(ProjectType::parse_lenient)
        .unwrap_or_default();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = tokio::select! {
        started = orchestrator.start_preview(&session_id, project, project_type) => started,
        _ = &mut ctrl_c => {
            warn!("interrupted while the preview was starting");
            reaper.abort();
            // Cancels the start and tears down whatever it spawned.
            let stopped = orchestrator.stop_preview(&session_id).await;
            return respond(
                stopped.map(|stopped| json!({ "sessionId": session_id, "stopped": stopped })),
                pretty,
            );
        }
    };
    if started.is_err() {
        reaper.abort();
        return respond(started, pretty);
    }
    respond(started, pretty)?;

    info!("preview running, press Ctrl-C to stop");
    (&mut ctrl_c).await.context("wait for Ctrl-C")?;

    reaper.abort();
    let stopped = orchestrator.stop_preview(&session_id).await;
    respond(
        stopped.map(|stopped| json!({ "sessionId": session_id, "stopped": stopped })),
        pretty,
    )
}
