//! Slipgate client binary.
//!
//! Usage: slipgate-client --key <ACCESS-KEY> [OPTIONS]
//!
//! Establishes a session against the server named in the access key and
//! keeps it alive until interrupted. The platform packet capture plugs in
//! from outside this crate; without one this binary runs the session over a
//! loopback capture, which is useful for connectivity checks and little
//! else.

use std::sync::Arc;
use std::time::Duration;

use slipgate::client::{ChannelCapture, ClientConfig, PacketCapture, VpnClient};
use slipgate::Token;

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
    if args.iter().any(|a| a == "-?" || a == "--help") {
        print_usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "-n" || a == "--version") {
        println!("slipgate-client {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some(key) = flag_value(&args, "--key").or_else(|| flag_value(&args, "-k")) else {
        eprintln!("Error: --key <ACCESS-KEY> is required");
        print_usage();
        std::process::exit(1);
    };

    let token = Token::from_access_key(&key)?;
    tracing::info!(token_id = %token.token_id, host = %token.host_name, "access key parsed");

    let mut config = ClientConfig::new(token);
    config.use_udp_channel = args.iter().any(|a| a == "--udp");
    config.drop_udp = args.iter().any(|a| a == "--drop-udp");
    if let Some(dns) = flag_value(&args, "--dns") {
        config.dns_upstream = Some(dns.parse()?);
    }

    let (capture, mut inbound) = ChannelCapture::new();
    let capture = Arc::new(capture);
    let client = VpnClient::new(config, Arc::clone(&capture) as Arc<dyn PacketCapture>);
    client.connect().await?;

    // Drain injected packets so the loopback capture never backs up.
    tokio::spawn(async move { while inbound.recv().await.is_some() {} });

    let status_client = Arc::clone(&client);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            if status_client.is_disposed() {
                break;
            }
            let traffic = status_client.tunnel().traffic();
            let speed = status_client.tunnel().speed();
            tracing::info!(
                sent = traffic.sent,
                received = traffic.received,
                up_bps = speed.sent,
                down_bps = speed.received,
                "session alive"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, saying goodbye");
    client.bye().await;
    Ok(())
}

fn print_usage() {
    println!(
        r#"Slipgate Client

USAGE:
    slipgate-client --key <ACCESS-KEY> [OPTIONS]

OPTIONS:
    -k, --key <KEY>   Access key (vh://...)
    --udp             Use the UDP channel instead of stream channels
    --drop-udp        Drop tunneled UDP instead of forwarding it
    --dns <IP>        Rewrite DNS to this upstream resolver
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
