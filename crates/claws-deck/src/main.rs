mod chat;
mod config;
mod fleet;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use claws_gateway::{FileSettings, GatewayClient, GatewayConfig};
use std::{io, path::PathBuf, time::Duration};
use tracing_subscriber::EnvFilter;

const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "claws-deck")]
#[command(about = "Operator deck for the claws agent gateway", long_about = None)]
struct Cli {
    /// Gateway WebSocket URL (overrides CLAWS_WS_URL and the settings file)
    #[arg(long, global = true)]
    url: Option<String>,
    /// Gateway token (overrides CLAWS_TOKEN and the settings file)
    #[arg(long, global = true)]
    token: Option<String>,
    /// Settings file (defaults to CLAWS_SETTINGS_PATH, then the XDG config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Seconds to wait for the gateway handshake
    #[arg(long, global = true, default_value_t = DEFAULT_READY_TIMEOUT_SECS)]
    ready_timeout: u64,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Follow connection status, gateway events and fleet presence
    Watch(fleet::WatchArgs),
    /// List gateway sessions
    Sessions,
    /// Check that the gateway is up and answering
    Status,
    /// Send a message to an agent and stream the reply
    Send(chat::SendArgs),
    /// Ask an agent to read back its MEMORY.md
    CheckMemory(chat::AgentArgs),
    /// Stop the reply an agent is currently generating
    Abort(chat::AbortArgs),
    /// Show or edit the settings file
    Config {
        #[command(subcommand)]
        action: config::ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let store = settings_store(&cli);
    let ready_timeout = Duration::from_secs(cli.ready_timeout);
    let command = cli
        .command
        .unwrap_or_else(|| Command::Watch(fleet::WatchArgs::default()));

    match command {
        Command::Config { action } => config::run(action, &store, cli.url, cli.token),
        Command::Watch(args) => fleet::watch(new_client(store), args).await,
        Command::Status => fleet::status(new_client(store), ready_timeout).await,
        Command::Sessions => {
            let client = ready_client(store, ready_timeout).await?;
            let result = fleet::sessions(&client).await;
            client.disconnect();
            result
        }
        Command::Send(args) => {
            let client = ready_client(store, ready_timeout).await?;
            let result = chat::send(&client, &args.target, &args.message.join(" ")).await;
            client.disconnect();
            result.map(|_| ())
        }
        Command::CheckMemory(args) => {
            let client = ready_client(store, ready_timeout).await?;
            let result = chat::send(&client, &args, chat::CHECK_MEMORY_PROMPT).await;
            client.disconnect();
            result.map(|_| ())
        }
        Command::Abort(args) => {
            let client = ready_client(store, ready_timeout).await?;
            let result = chat::abort_agent(&client, &args).await;
            client.disconnect();
            result
        }
    }
}

fn settings_store(cli: &Cli) -> FileSettings {
    let mut store = match &cli.settings {
        Some(path) => FileSettings::new(path),
        None => FileSettings::from_env(),
    };
    if let Some(url) = cli.url.as_deref() {
        store = store.with_url_override(url);
    }
    if let Some(token) = cli.token.as_deref() {
        store = store.with_token_override(token);
    }
    store
}

fn new_client(store: FileSettings) -> GatewayClient {
    GatewayClient::new(GatewayConfig::default(), store)
}

async fn ready_client(store: FileSettings, ready_timeout: Duration) -> Result<GatewayClient> {
    let client = new_client(store);
    client.connect();
    client
        .wait_until_ready(ready_timeout)
        .await
        .context("gateway handshake did not complete")?;
    Ok(client)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("CLAWS_LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_enabled = matches!(
        std::env::var("CLAWS_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stderr_enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
