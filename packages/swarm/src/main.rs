use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use swarm::config::default_config_dir;
use swarm::discovery::resolve_backend;
use swarm::{
    AvatarChoice, ChatChannel, ChatEvent, HttpCredentialService, Orchestrator,
    OrchestratorSettings, RestStore, SecureStorage, SwarmConfig, SwarmEvent,
};

const CHAT_NAME_KEY: &str = "chat_name";

#[derive(Parser)]
#[command(name = "swarm")]
#[command(about = "Join many sessions to a realtime group and drive them together")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding swarm.toml (defaults to ~/.swarm)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join sessions and print events until the group ends or Ctrl-C
    Join(JoinArgs),

    /// Bridge stdin to the chat channel
    Chat(ChatArgs),
}

#[derive(Parser)]
struct JoinArgs {
    /// Group identifier
    group: String,

    /// Base display name; suffixed with 1..N when joining more than one
    name: String,

    /// Number of sessions
    #[arg(short = 'n', long, default_value = "1")]
    count: usize,

    /// Avatar value, or "random"
    #[arg(long, default_value = "random")]
    avatar: AvatarChoice,

    /// Keep re-applying FIELD=VALUE on every session (VALUE is JSON or a string)
    #[arg(long, value_parser = parse_assignment)]
    enforce: Option<(String, Value)>,
}

#[derive(Parser)]
struct ChatArgs {
    /// Name shown next to your messages; remembered for later runs
    #[arg(long)]
    name: Option<String>,
}

fn parse_assignment(s: &str) -> Result<(String, Value), String> {
    let (field, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got `{s}`"))?;
    if field.is_empty() {
        return Err("field must not be empty".to_string());
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((field.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "swarm=debug,info"
    } else {
        "swarm=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let config = SwarmConfig::load(&config_dir)?;
    let storage = Arc::new(SecureStorage::open(&config_dir, config.sealer.clone())?);

    match cli.command {
        Commands::Join(args) => join_command(&config, &storage, args).await,
        Commands::Chat(args) => chat_command(&config, storage, args).await,
    }
}

/// Use the given chat name and remember it, or fall back to the remembered one.
fn chat_name(given: Option<String>, storage: &SecureStorage) -> Result<String> {
    match given.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
        Some(name) => {
            storage.set(CHAT_NAME_KEY, &name)?;
            Ok(name)
        }
        None => storage
            .get::<String>(CHAT_NAME_KEY)
            .context("no chat name remembered yet, pass --name"),
    }
}

async fn join_command(
    config: &SwarmConfig,
    storage: &SecureStorage,
    args: JoinArgs,
) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(config.backend.timeout)
        .build()
        .context("Failed to build HTTP client")?;
    // Subscriptions are long-lived streams, so only the connect phase is bounded
    let streaming = reqwest::Client::builder()
        .connect_timeout(config.backend.timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let backend = resolve_backend(&http, &config.backend, Some(storage)).await;
    info!(%backend, "using credential service");

    let orchestrator = Orchestrator::new(
        OrchestratorSettings::from(config),
        config.sealer.clone(),
        Arc::new(HttpCredentialService::new(
            http,
            config.sealer.clone(),
            &backend,
            &config.backend.join_path,
        )),
        Arc::new(RestStore::new(streaming, config.store_auth_url.clone())),
    );
    let mut events = orchestrator.subscribe();

    let result = orchestrator
        .join_batch(&args.group, &args.name, args.count, args.avatar)
        .await?;
    println!("{}", serde_json::to_string(&result)?);
    if result.connected == 0 {
        anyhow::bail!("no session could join group {}", args.group);
    }

    if let Some((field, value)) = args.enforce {
        orchestrator.set_desired(&field, value).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if matches!(event, SwarmEvent::SessionEnded { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    orchestrator.teardown_all().await;
    Ok(())
}

async fn chat_command(
    config: &SwarmConfig,
    storage: Arc<SecureStorage>,
    args: ChatArgs,
) -> Result<()> {
    let url = config
        .chat
        .url
        .as_deref()
        .context("chat.url is not configured")?;
    let name = chat_name(args.name, &storage)?;

    let chat = ChatChannel::spawn(
        url,
        config.sealer.clone(),
        config.chat.reconnect,
        Some(storage),
    );
    let mut events = chat.subscribe();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = chat.send(&name, line.trim()).await {
                        warn!(error = %e, "message not sent");
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Ok(ChatEvent::Message(m)) => {
                    println!("[{:?}] {} {}", m.source, m.author, m.content)
                }
                Ok(ChatEvent::History { messages }) => {
                    for m in messages {
                        println!("[{:?}] {} {}", m.source, m.author, m.content);
                    }
                }
                Ok(ChatEvent::Error { message }) => warn!(%message, "chat error"),
                Ok(ChatEvent::Banned) => warn!("banned from chat, sending is disabled"),
                Ok(ChatEvent::Connected | ChatEvent::Disconnected) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "chat output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    chat.shutdown().await;
    Ok(())
}
