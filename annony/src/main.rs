mod gateway;
mod migrations;
mod server;
mod shutdown;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use annony_core::{logging, Config};

#[derive(Parser, Debug)]
#[command(name = "annony")]
#[command(about = "Anonymous chat relay", long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON); skipped when missing
    #[arg(short, long, env = "ANNONY_CONFIG_PATH", default_value = "config.yaml", global = true)]
    config: String,

    /// Listening port, overriding every other source
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a message instance
    Chat {
        /// Node ID (auto-generated from hostname if not provided)
        #[arg(long, env = "NODE_ID")]
        node_id: Option<String>,
    },
    /// Run the edge gateway in front of the message instances
    Gateway,
}

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(Some(&args.config))?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // 1.5. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("HTTP address: {}", config.http_address());

    match args.command {
        Command::Chat { node_id } => {
            let node_id = node_id.unwrap_or_else(generate_node_id);
            server::run(config, node_id).await
        }
        Command::Gateway => gateway::run(config).await,
    }
}
