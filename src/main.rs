//! Entry point for `agentctl`.
//!
//! Initializes tracing, loads a typed [`agentctl::config::Config`] from the
//! path given by `--config`/`AGENTCTL_CONFIG`, restores the session registry
//! from its persisted state file, starts the scheduler, and (if configured)
//! serves the RPC bridge. This is ambient CLI glue only -- it never touches
//! session/driver/matcher logic directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use agentctl::config::Config;
use agentctl::manager::{Hooks, SessionManager};
use agentctl::output::{OutputEvent, OutputPayload, OutputPipeline};
use agentctl::persistence::PersistenceStore;
use agentctl::rpc;
use agentctl::scheduler::Scheduler;

/// Multi-tenant controller for long-lived interactive CLI subprocess sessions.
#[derive(Parser)]
#[command(name = "agentctl", version)]
struct Cli {
    /// Path to the JSON configuration file (§6 "Configuration contract").
    #[arg(long, env = "AGENTCTL_CONFIG")]
    config: PathBuf,
}

fn load_config(path: &std::path::Path) -> Result<Config> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing config file {}", path.display()))
}

/// Log each delivered output event instead of forwarding it anywhere --
/// the chat transport that would actually render these to a user is an
/// excluded collaborator (§1 non-goals), so this is the core's own
/// observability surface standing in for it (§6 "Observability surface").
fn log_output_event(destination: &str, event: OutputEvent) {
    match event {
        OutputEvent::Summary { session_id, text } => {
            tracing::info!(
                destination,
                session_id = %session_id,
                chars = text.len(),
                "summary ready"
            );
        }
        OutputEvent::Payload {
            session_id,
            payload,
        } => match payload {
            OutputPayload::Inline { text } => {
                tracing::info!(
                    destination,
                    session_id = %session_id,
                    chars = text.len(),
                    "inline output ready"
                );
            }
            OutputPayload::Artifact { html_path, preview } => {
                tracing::info!(
                    destination,
                    session_id = %session_id,
                    artifact = %html_path.display(),
                    preview_chars = preview.len(),
                    "artifact output ready"
                );
            }
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(load_config(&cli.config)?);

    tracing::info!(config = %cli.config.display(), tools = config.tools.len(), "starting agentctl");

    let store = PersistenceStore::new(config.defaults.state_path.clone());
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(
        SessionManager::restore(config.clone(), store, Hooks::default(), Some(dispatch_tx))
            .await
            .context("restoring session manager from persisted state")?,
    );

    let artifact_dir = config
        .defaults
        .state_path
        .parent()
        .map(|p| p.join("agentctl-artifacts"))
        .unwrap_or_else(|| PathBuf::from("agentctl-artifacts"));
    let pipeline = Arc::new(OutputPipeline::new(
        config.defaults.output.clone(),
        artifact_dir,
        log_output_event,
    ));

    let scheduler = Scheduler::new(manager.clone(), pipeline);
    tokio::spawn(scheduler.run(dispatch_rx));

    if config.rpc.enabled {
        tracing::info!(host = %config.rpc.host, port = config.rpc.port, "rpc bridge enabled");
        rpc::serve(
            manager.clone(),
            &config.rpc.host,
            config.rpc.port,
            config.rpc.token.clone(),
        )
        .await
        .context("rpc bridge failed")?;
    } else {
        tracing::info!("rpc bridge disabled (rpc.enabled=false); idling with no external surface");
        std::future::pending::<()>().await;
    }

    Ok(())
}
