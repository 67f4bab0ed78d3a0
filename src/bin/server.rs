//! Slipgate server binary.
//!
//! Usage: slipgate-server [COMMAND] [OPTIONS]
//!
//! Commands:
//!   start            Run the server (default)
//!   stop             Ask a running instance to stop
//!   gen              Create a token and print its access key
//!   list             List tokens and their usage
//!   rm <token-id>    Delete a token
//!
//! The working directory is used as storage; a `storage/` subdirectory is
//! created on first run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use slipgate::access::{AccessManager, FileAccessManager, TokenOptions};
use slipgate::server::Server;

const COMMAND_FILE: &str = "storage/server-command";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("start");

    match command {
        "-?" | "--help" => print_usage(),
        "-n" | "--version" => println!("slipgate-server {}", env!("CARGO_PKG_VERSION")),
        "start" => run_server(&args[2..]).await?,
        "stop" => request_stop()?,
        "gen" => generate_token(&args[2..])?,
        "list" => list_tokens()?,
        "rm" => {
            let Some(token_id) = args.get(2) else {
                eprintln!("Error: rm requires a token id");
                std::process::exit(1);
            };
            remove_token(token_id)?;
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            std::process::exit(1);
        }
    }
    Ok(())
}

fn print_usage() {
    println!(
        r#"Slipgate Server

USAGE:
    slipgate-server [COMMAND] [OPTIONS]

COMMANDS:
    start             Run the server (default)
        --tcp <EP>    TCP endpoint to listen on (default 0.0.0.0:443)
        --udp <EP>    UDP endpoint for the UDP channel (optional)
        --manager <URL> [--auth <TOKEN>]
                      Use a central HTTP access manager instead of storage/
    stop              Ask the running instance to stop
    gen               Create a token and print its access key
        --max-traffic <BYTES>   Traffic quota (default unlimited)
        --max-clients <N>       Simultaneous clients (default unlimited)
    list              List tokens and their usage
    rm <TOKEN-ID>     Delete a token

OPTIONS:
    -n, --version     Print version
    -?, --help        Print this help
"#
    );
}

fn flag_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn open_file_manager(args: &[String]) -> anyhow::Result<FileAccessManager> {
    let tcp = flag_value(args, "--tcp").unwrap_or_else(|| "0.0.0.0:443".into());
    let udp = flag_value(args, "--udp");

    let tcp_endpoints = vec![tcp.parse()?];
    let udp_endpoints = match udp {
        Some(ep) => vec![ep.parse()?],
        None => Vec::new(),
    };
    Ok(FileAccessManager::open(
        &working_dir(),
        tcp_endpoints,
        udp_endpoints,
    )?)
}

async fn run_server(args: &[String]) -> anyhow::Result<()> {
    let (access, server_id): (Arc<dyn AccessManager>, _) =
        if let Some(url) = flag_value(args, "--manager") {
            let auth = flag_value(args, "--auth");
            let manager = slipgate::access::HttpAccessManager::new(url, auth)?;
            (Arc::new(manager), uuid::Uuid::new_v4())
        } else {
            let manager = open_file_manager(args)?;
            let server_id = manager.server_id();
            (Arc::new(manager), server_id)
        };

    let server = Server::new(access, server_id);

    // The stop command talks to us through a file in storage/.
    let command_file = working_dir().join(COMMAND_FILE);
    let _ = std::fs::remove_file(&command_file);
    let watcher = Arc::clone(&server);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let stop_requested = std::fs::read_to_string(&command_file)
                .map(|text| text.trim() == "stop")
                .unwrap_or(false);
            if stop_requested {
                let _ = std::fs::remove_file(&command_file);
                tracing::info!("stop requested via command file");
                watcher.stop().await;
                break;
            }
        }
    });

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            server.stop().await;
        }
    }
    Ok(())
}

fn request_stop() -> anyhow::Result<()> {
    let path = working_dir().join(COMMAND_FILE);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, "stop\n")?;
    println!("stop requested");
    Ok(())
}

fn generate_token(args: &[String]) -> anyhow::Result<()> {
    let manager = open_file_manager(args)?;
    let options = TokenOptions {
        max_traffic: flag_value(args, "--max-traffic")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(0),
        max_clients: flag_value(args, "--max-clients")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(0),
        expiration_unix: None,
    };

    let token = manager.create_token(options)?;
    println!("Token created: {}", token.token_id);
    println!();
    println!("Access key:");
    println!("{}", token.to_access_key());
    Ok(())
}

fn list_tokens() -> anyhow::Result<()> {
    let manager = open_file_manager(&[])?;
    let tokens = manager.list_tokens();
    if tokens.is_empty() {
        println!("No tokens.");
        return Ok(());
    }
    for (token, usage) in tokens {
        println!(
            "{}  sent={} received={}",
            token.token_id, usage.sent, usage.received
        );
    }
    Ok(())
}

fn remove_token(token_id: &str) -> anyhow::Result<()> {
    let manager = open_file_manager(&[])?;
    manager.remove_token(token_id.parse()?)?;
    println!("Token {token_id} removed");
    Ok(())
}
