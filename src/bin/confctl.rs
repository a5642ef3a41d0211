//! ConfSync Control CLI
//!
//! Operator tool for a running cluster: push and pull config entries,
//! list registered slaves, and watch an entry for live updates.

use std::process;

use clap::{Parser, Subcommand};

use confsync::watch::{WatchClient, WatchConfig};
use confsync::{Error, Result};

#[derive(Parser)]
#[command(name = "confctl", version, about = "ConfSync cluster control tool")]
struct Cli {
    /// HTTP address of the node to talk to (host:port)
    #[arg(short, long, default_value = "127.0.0.1:9019")]
    address: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push a config entry to the master
    Push {
        /// Entry name
        name: String,
        /// Entry body (reads stdin when omitted)
        #[arg(short, long)]
        body: Option<String>,
        /// Tags addressing the entry, repeatable
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Pull a config entry from a node
    Pull {
        /// Entry name
        name: String,
        /// Tags addressing the entry, repeatable
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// List the slaves registered with the master
    Slaves,
    /// Watch an entry and print every update until interrupted
    Watch {
        /// Entry name
        name: String,
        /// Tags addressing the entry, repeatable
        #[arg(short, long)]
        tag: Vec<String>,
        /// Notification endpoints to connect to (at least two), repeatable
        #[arg(short, long)]
        endpoint: Vec<String>,
        /// Shared secret for the notification endpoint
        #[arg(short, long)]
        secret: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Push { name, body, tag } => push(&cli.address, name, body, tag).await,
        Command::Pull { name, tag } => pull(&cli.address, name, tag).await,
        Command::Slaves => slaves(&cli.address).await,
        Command::Watch {
            name,
            tag,
            endpoint,
            secret,
        } => watch(name, tag, endpoint, secret).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn http_error(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Transport(format!("{}: {}", status, body)))
}

async fn push(address: &str, name: String, body: Option<String>, tags: Vec<String>) -> Result<()> {
    let body = match body {
        Some(body) => body,
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let resp = reqwest::Client::new()
        .post(format!("http://{}/push", address))
        .json(&serde_json::json!({"name": name, "tags": tags, "body": body}))
        .send()
        .await
        .map_err(http_error)?;
    check(resp).await?;
    println!("OK");
    Ok(())
}

async fn pull(address: &str, name: String, tags: Vec<String>) -> Result<()> {
    let resp = reqwest::Client::new()
        .post(format!("http://{}/pull", address))
        .json(&serde_json::json!({"name": name, "tags": tags}))
        .send()
        .await
        .map_err(http_error)?;
    let body: serde_json::Value = check(resp).await?.json().await.map_err(http_error)?;
    println!("{}", body["body"].as_str().unwrap_or_default());
    Ok(())
}

async fn slaves(address: &str) -> Result<()> {
    let resp = reqwest::Client::new()
        .get(format!("http://{}/slaves", address))
        .send()
        .await
        .map_err(http_error)?;
    let body: serde_json::Value = check(resp).await?.json().await.map_err(http_error)?;

    let slaves = body["slaves"].as_array().cloned().unwrap_or_default();
    if slaves.is_empty() {
        println!("No slaves registered");
        return Ok(());
    }
    for slave in slaves {
        println!(
            "{}  {}  registered {}",
            slave["id"].as_str().unwrap_or("?"),
            slave["address"].as_str().unwrap_or("?"),
            slave["registered_at"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

async fn watch(
    name: String,
    tags: Vec<String>,
    endpoints: Vec<String>,
    secret: String,
) -> Result<()> {
    let config = WatchConfig::new(endpoints, secret, name, tags);
    let mut client = WatchClient::connect(config).await?;
    let rx = client.watch().await?;

    eprintln!("Watching; ctrl-c to stop");
    loop {
        tokio::select! {
            update = rx.recv() => {
                match update {
                    Some(payload) => println!("{}", String::from_utf8_lossy(&payload)),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.close().await;
    Ok(())
}
