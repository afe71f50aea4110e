//! MedQA Chat - Terminal Client for the Medical Answer Service
//!
//! Streams answers from the knowledge-graph QA service into the terminal.
//!
//! # Usage
//!
//! ```bash
//! # One question, answer streamed to stdout
//! medqa-chat ask 感冒了怎么办
//!
//! # Interactive, several conversation windows
//! medqa-chat chat
//!
//! # Hosted model
//! SILICONFLOW_API_KEY=sk-... medqa-chat --model-source siliconflow ask 头痛怎么办
//!
//! # Service helpers
//! medqa-chat models
//! medqa-chat graph-status
//! medqa-chat graph-connect --password secret
//!
//! # Verbose logging (stderr)
//! RUST_LOG=debug medqa-chat chat
//! ```

mod repl;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use medqa_core::config::{default_config_path, load_config_from_path};
use medqa_core::{
    ChatBackend, ClientConfig, ConfigOverrides, ConversationStore, HttpBackend, ModelSource,
    StreamEvent,
};

/// MedQA Chat - Terminal client for the medical knowledge-graph QA service
#[derive(Parser, Debug)]
#[command(name = "medqa-chat")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Answer service base URL
    #[arg(short = 'u', long, value_name = "URL")]
    base_url: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "MEDQA_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model source (local, siliconflow)
    #[arg(short = 's', long, value_name = "SOURCE")]
    model_source: Option<ModelSource>,

    /// Model name
    #[arg(short = 'm', long, value_name = "NAME")]
    model: Option<String>,

    /// SiliconFlow API key
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Graph database password
    #[arg(long, value_name = "PASSWORD")]
    graph_password: Option<String>,

    /// Seconds to wait for the next chunk (0 waits forever)
    #[arg(long, value_name = "SECS")]
    idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "MEDQA_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask one question and stream the answer
    Ask {
        /// The question
        #[arg(required = true)]
        query: Vec<String>,
    },
    /// Interactive chat (default)
    Chat,
    /// List the models the service offers
    Models,
    /// Show the graph database connection status
    GraphStatus,
    /// Ask the service to connect its graph database
    GraphConnect {
        /// Password (defaults to the configured one)
        #[arg(long)]
        password: Option<String>,
    },
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref url) = self.base_url {
            overrides = overrides.with_base_url(url.clone());
        }
        if let Some(secs) = self.idle_timeout_secs {
            overrides = overrides.with_idle_timeout_secs(secs);
        }
        if let Some(source) = self.model_source {
            overrides = overrides.with_model_source(source);
        }
        if let Some(ref model) = self.model {
            overrides = overrides.with_model(model.clone());
        }
        if let Some(ref key) = self.api_key {
            overrides = overrides.with_api_key(key.clone());
        }
        if let Some(ref password) = self.graph_password {
            overrides = overrides.with_graph_password(password.clone());
        }
        overrides
    }
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so streamed answers on stdout stay clean.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("medqa_cli={level},medqa_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(())
}

fn load(args: &Args) -> Result<ClientConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);

    info!(
        base_url = %config.base_url,
        source = %config.source(),
        model = ?config.selection.model_name,
        "Configuration loaded"
    );
    Ok(config)
}

fn build_store(config: &ClientConfig) -> Result<ConversationStore> {
    let backend = HttpBackend::with_connect_timeout(&config.base_url, config.connect_timeout)
        .with_context(|| format!("Invalid service URL: {}", config.base_url))?;
    let backend: Arc<dyn ChatBackend> = Arc::new(backend);
    Ok(ConversationStore::new(
        backend,
        config.selection.clone(),
        config.session.clone(),
    ))
}

/// Fetch the catalog when no model is configured
async fn ensure_model(store: &mut ConversationStore) -> Result<()> {
    if store.selection().is_ready() {
        return Ok(());
    }
    let catalog = store.refresh_models().await;
    debug!(
        local = catalog.local.len(),
        siliconflow = catalog.siliconflow.len(),
        "Fetched model catalog"
    );
    if !store.selection().is_ready() {
        anyhow::bail!("No model available; pass --model or check the service");
    }
    Ok(())
}

async fn ask(store: &mut ConversationStore, query: &str) -> Result<()> {
    ensure_model(store).await?;
    let message_id = store.send_active(query)?;

    let mut stdout = std::io::stdout();
    let mut failed = false;
    while let Some(update) = store.pump().await {
        if update.message_id != message_id {
            continue;
        }
        match update.event {
            StreamEvent::Delta { text } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamEvent::Error { message } => {
                writeln!(stdout, "\n{message}")?;
                failed = true;
            }
            StreamEvent::Meta(meta) => {
                debug!(intent = %meta.intent, entities = ?meta.entities, "Query analysed");
            }
            StreamEvent::Done => break,
        }
    }
    writeln!(stdout)?;

    if failed {
        anyhow::bail!("Answer generation failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    let config = load(&args)?;
    let mut store = build_store(&config)?;

    match args.command.unwrap_or(Command::Chat) {
        Command::Ask { query } => ask(&mut store, &query.join(" ")).await?,
        Command::Chat => {
            ensure_model(&mut store).await?;
            repl::run(&mut store).await?;
        }
        Command::Models => {
            let catalog = store.backend().models_or_empty().await;
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Command::GraphStatus => {
            let status = store.backend().graph_status_or_unavailable().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::GraphConnect { password } => {
            let password = password.or_else(|| config.selection.graph_password.clone());
            let status = store
                .backend()
                .connect_graph_or_unavailable(password.as_deref())
                .await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
