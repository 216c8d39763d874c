// Kestrel server binary
use clap::{CommandFactory, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use kestrel_server::{ServerConfig, DEFAULT_CONFIG_PATH};
use std::io::stderr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Kestrel fleet orchestration server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Server configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestration server
    Serve,
    /// Load and validate the configuration file, then exit
    CheckConfig,
}

fn load_config(path: &PathBuf) -> Result<ServerConfig> {
    // anyhow errors carry their context chain in the alternate format
    ServerConfig::load(path).map_err(|e| eyre!("{:#}", e))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Respect RUST_LOG, fall back to info (debug with --verbose) for our crates
    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!("kestrel={level},kestrel_server={level},kestrel_snmp={level},kestrel_dhcp={level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    match cli.command {
        Some(Commands::CheckConfig) => {
            let config = load_config(&cli.config)?;
            println!(
                "{}: OK (subnet {}/{}, {} seed switch(es))",
                cli.config.display(),
                config.network.subnet,
                config.network.netmask,
                config.seeds.len()
            );
        }
        Some(Commands::Serve) => {
            let config = load_config(&cli.config)?;
            debug!(config = %cli.config.display(), "configuration loaded");

            let (shutdown_tx, shutdown_rx) = watch::channel(());
            tokio::spawn(async move {
                wait_for_signal().await;
                info!("Sending shutdown signal");
                let _ = shutdown_tx.send(());
            });

            kestrel_server::run(config, shutdown_rx)
                .await
                .map_err(|e| eyre!("{:#}", e))?;
        }
        None => {
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
