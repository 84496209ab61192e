//! Lithos Backend Runtime
//!
//! The entry point: CLI args, subsystem wiring, the stdio IPC loop, and
//! graceful shutdown. Stdout is reserved for IPC frames; all logging goes
//! to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::time::Duration;
use tracing::{info, warn};

use lithos::agent::AgentLoopController;
use lithos::config::{get_app_dir, get_config_path, load_config, save_config};
use lithos::history::ConversationHistory;
use lithos::memory::HttpMemoryStore;
use lithos::model::OllamaClient;
use lithos::sandbox::SandboxPolicy;
use lithos::server::Backend;
use lithos::tools::FileToolSet;
use lithos::transcript::TranscriptStore;
use lithos::types::{MemoryStore, ModelClient};

const VERSION: &str = "0.1.0";

/// How long shutdown waits for background memory stores to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lithos -- local multi-agent chat backend
#[derive(Parser, Debug)]
#[command(
    name = "lithos",
    version = VERSION,
    about = "Lithos -- local multi-agent chat backend",
    long_about = "Serves a roster of local model agents with sandboxed filesystem tools over stdio IPC."
)]
struct Cli {
    /// Start the backend (stdio IPC loop)
    #[arg(long)]
    run: bool,

    /// Show the current configuration and exit
    #[arg(long)]
    status: bool,
}

fn show_status() {
    let config = load_config();
    println!(
        r#"
=== LITHOS STATUS ===
Config:     {}
Model URL:  {}
Memory URL: {}
Agents:     {}
Iterations: {}
History:    {} turns per agent
=====================
"#,
        get_config_path().display(),
        config.model_url,
        config.memory_url.as_deref().unwrap_or("(disabled)"),
        config
            .agents
            .iter()
            .map(|a| a.id.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        config.max_iterations,
        config.history_capacity,
    );
}

async fn run() -> Result<()> {
    let config = load_config();
    info!(version = VERSION, model_url = %config.model_url, "starting");

    // First start: write the defaults out so the operator has a file to edit.
    if !get_config_path().exists() {
        if let Err(e) = save_config(&config) {
            warn!(error = %e, "could not write default config");
        }
    }

    let home = dirs::home_dir().context("Cannot determine home directory")?;
    let sandbox = Arc::new(SandboxPolicy::new(&home).context("Failed to create sandbox")?);
    let tools = Arc::new(FileToolSet::new(Arc::clone(&sandbox)));
    let history = Arc::new(ConversationHistory::new(config.history_capacity));
    let transcripts = Arc::new(
        TranscriptStore::new(get_app_dir().join("chats"))
            .context("Failed to open transcript store")?,
    );

    let probe = Arc::new(OllamaClient::new(config.model_url.clone()));
    let model: Arc<dyn ModelClient> = Arc::new(OllamaClient::new(config.model_url.clone()));
    let memory: Option<Arc<dyn MemoryStore>> = config
        .memory_url
        .as_ref()
        .map(|url| Arc::new(HttpMemoryStore::new(url.clone())) as Arc<dyn MemoryStore>);

    let controller = Arc::new(AgentLoopController::new(
        config.agents.clone(),
        Arc::clone(&history),
        Arc::clone(&tools),
        model,
        memory.clone(),
        config.max_iterations,
    ));

    let backend = Arc::new(Backend::new(
        Arc::clone(&controller),
        tools,
        sandbox,
        history,
        transcripts,
        memory,
        probe,
    ));

    let shutdown = async {
        let ctrl_c = signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received SIGINT, shutting down");
        }
    };

    tokio::select! {
        result = Arc::clone(&backend).run_stdio() => {
            result?;
            info!("stdin closed, shutting down");
        }
        _ = shutdown => {}
    }

    controller.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries IPC frames; logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.status {
        show_status();
        return Ok(());
    }

    if cli.run {
        return run().await;
    }

    // Default to the backend loop so the desktop shell can spawn the
    // binary without flags.
    run().await
}
