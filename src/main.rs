//! ConfSync Node Binary
//!
//! Runs a master or slave node from a TOML configuration file.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use confsync::{ConfSyncConfig, Node};

#[derive(Parser)]
#[command(name = "confsync", version, about = "Distributed configuration store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a node from a configuration file
    Start {
        /// Path to the TOML configuration file
        #[arg(short, long, default_value = "/etc/confsync/confsync.toml")]
        config: PathBuf,
    },
    /// Write a sample configuration file
    Init {
        /// Where to write the sample
        #[arg(short, long, default_value = "confsync.toml")]
        output: PathBuf,
    },
    /// Validate a configuration file without starting anything
    Validate {
        /// Path to the TOML configuration file
        #[arg(short, long, default_value = "/etc/confsync/confsync.toml")]
        config: PathBuf,
    },
}

const SAMPLE_CONFIG: &str = r#"[node]
# "master" or "slave"
role = "master"
bind_address = "0.0.0.0:9019"
# advertise_address = "10.0.0.1:9019"
data_dir = "/var/lib/confsync"
# ephemeral = true
# canonical_tags = true

[cluster]
# Required for slaves:
# master_address = "10.0.0.1:9019"
health_interval_secs = 10
probe_retries = 3
sync_retries = 3

[notify]
# Defaults to bind_address with the port incremented by one.
# bind_address = "0.0.0.0:9020"
secret = "change-me"
heartbeat_secs = 30

[logging]
level = "info"
"#;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("confsync={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start { config } => run_start(config).await,
        Command::Init { output } => run_init(output),
        Command::Validate { config } => run_validate(config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run_start(path: PathBuf) -> confsync::Result<()> {
    let config = ConfSyncConfig::from_file(&path)?;
    init_logging(&config.logging.level);

    let node = Node::start(config).await?;
    tracing::info!(
        "ConfSync {} ready: http={} notify={}",
        confsync::VERSION,
        node.http_addr(),
        node.notify_addr()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    // Give in-flight requests a short window before tasks are torn down.
    tokio::time::timeout(std::time::Duration::from_secs(5), node.shutdown())
        .await
        .unwrap_or_else(|_| tracing::warn!("Shutdown window elapsed, stopping anyway"));
    Ok(())
}

fn run_init(output: PathBuf) -> confsync::Result<()> {
    if output.exists() {
        return Err(confsync::Error::Config(format!(
            "{} already exists",
            output.display()
        )));
    }
    std::fs::write(&output, SAMPLE_CONFIG)?;
    println!("Wrote sample configuration to {}", output.display());
    Ok(())
}

fn run_validate(path: PathBuf) -> confsync::Result<()> {
    let config = ConfSyncConfig::from_file(&path)?;
    println!(
        "Configuration OK: {} node, http {}, notify {}",
        config.node.role,
        config.node.bind_address,
        config.notify_bind_address()?
    );
    Ok(())
}
