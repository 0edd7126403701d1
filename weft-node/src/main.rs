//! weft-node entry point.
//!
//! ```text
//! weft-node serve                  Run the echo server (foreground)
//! weft-node send <message>         Send one message and print the echo
//! weft-node --config <path> ...    Load a custom config TOML
//! weft-node --gen-config           Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_node::config::NodeConfig;
use weft_node::service;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "weft-node", about = "Echo server and sender for weft links")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "weft-node.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to `--config` and exit.
    #[arg(long)]
    init_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every message.
    Serve,
    /// Dial the configured peer, send `message` and print the reply.
    Send { message: String },
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&NodeConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if cli.init_config {
        NodeConfig::write_default(&cli.config)?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    // Load config.
    let config = NodeConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("weft-node v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let mut server = service::serve(&config)?;

            // The engine runs its own reactors; this runtime only waits
            // for Ctrl-C.
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(tokio::signal::ctrl_c())?;
            info!("Ctrl-C received, shutting down");
            server.stop();
        }
        Command::Send { message } => {
            let reply = service::send(&config, message.as_bytes())?;
            println!("{}", String::from_utf8_lossy(&reply));
        }
    }

    Ok(())
}
