//! edgesocks binary
//!
//! Usage: edgesocks [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>              Path to configuration file
//!   --classify <FILE> <HOST[:PORT]>  Show how a destination would be routed
//!   -h, --help                       Print help information

use std::env;

use anyhow::Context;
use edgesocks::{Proxy, ProxyConfig};

const DEFAULT_CONFIG: &str = "config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return run_proxy(DEFAULT_CONFIG).await;
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_proxy(&args[2]).await?;
        }
        "--classify" => {
            if args.len() < 4 {
                eprintln!("Error: --classify requires a config file and a destination");
                return Ok(());
            }
            classify(&args[2], &args[3]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"edgesocks - split-routing SOCKS5 proxy

USAGE:
    edgesocks [OPTIONS]

OPTIONS:
    -c, --config <FILE>               Path to configuration file (default: config.json)
    --classify <FILE> <HOST[:PORT]>   Show how a destination would be routed
    -h, --help                        Print help information

EXAMPLES:
    Run the proxy:
        edgesocks --config config.json

    Check a destination:
        edgesocks --classify config.json example.com:443

    Verbose logging:
        RUST_LOG=debug edgesocks
"#
    );
}

async fn run_proxy(config_path: &str) -> anyhow::Result<()> {
    let proxy = load_proxy(config_path)?;
    proxy.run().await?;
    Ok(())
}

async fn classify(config_path: &str, destination: &str) -> anyhow::Result<()> {
    let proxy = load_proxy(config_path)?;
    let (host, port) = split_destination(destination)?;

    let decision = proxy.plan(host, port).await;
    println!(
        "{}:{} -> {} {}:{}",
        host, port, decision.mode, decision.host, decision.port
    );
    Ok(())
}

fn load_proxy(path: &str) -> anyhow::Result<Proxy<edgesocks::classify::DohResolver>> {
    let config = ProxyConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path))?;
    Ok(Proxy::new(config)?)
}

/// Split `host[:port]`, accepting `[v6]:port` and bare IPv6 literals.
fn split_destination(destination: &str) -> anyhow::Result<(&str, u16)> {
    if let Some(rest) = destination.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("unterminated '[' in {}", destination))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse()?,
            None => 443,
        };
        return Ok((host, port));
    }

    match destination.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host, port.parse()?)),
        _ => Ok((destination, 443)),
    }
}
