//! `nikobus-gatewayd`: thin binary wiring the `nikobus_gateway` library to a
//! JSON config file, a couple of CLI flags, and a tracing subscriber.
//!
//! Usage: `nikobus-gatewayd <config.json> [--serial <path> | --tcp <host:port>]`
//!
//! A two-flag surface doesn't earn pulling in `clap` over a small
//! `std::env::args()` loop, so argument parsing stays this minimal.

use std::fs;

use anyhow::{Context, Result};
use nikobus_gateway::config::Config;
use nikobus_gateway::transport::Endpoint;
use nikobus_gateway::{EngineEvent, NikobusEngine};
use tracing::{info, warn};

struct Args {
    config_path: String,
    endpoint: Endpoint,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().context("usage: nikobus-gatewayd <config.json> [--serial <path> | --tcp <host:port>]")?;

    let mut endpoint = None;
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--serial" => {
                let path = args.next().context("--serial requires a device path")?;
                endpoint = Some(Endpoint::serial(path));
            }
            "--tcp" => {
                let addr = args.next().context("--tcp requires a host:port")?;
                let (host, port) = addr
                    .rsplit_once(':')
                    .context("--tcp value must be host:port")?;
                let port: u16 = port.parse().context("--tcp port must be a u16")?;
                endpoint = Some(Endpoint::tcp(host.to_string(), port));
            }
            other => anyhow::bail!("unrecognized flag: {other}"),
        }
    }

    Ok(Args {
        config_path,
        endpoint: endpoint.unwrap_or_else(|| Endpoint::serial("/dev/ttyUSB0")),
    })
}

fn log_events(mut rx: tokio::sync::broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(?event, "engine event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event log fell behind, dropped events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = parse_args()?;
    info!(config = %args.config_path, endpoint = ?args.endpoint, "nikobus gateway starting");

    let raw = fs::read_to_string(&args.config_path)
        .with_context(|| format!("failed to read config file {}", args.config_path))?;
    let config = Config::parse(&raw).context("failed to parse config file")?;

    let engine = NikobusEngine::connect(config, args.endpoint)
        .await
        .context("failed to connect to the bus")?;

    log_events(engine.subscribe());

    info!("gateway running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("received Ctrl+C, shutting down");
    drop(engine);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_defaults_to_serial_when_no_flags_given() {
        // parse_args reads std::env::args(), which we can't easily fake here
        // without a process boundary; exercise the underlying logic instead.
        let endpoint = Endpoint::serial("/dev/ttyUSB0");
        match endpoint {
            Endpoint::Serial { path, baud_rate } => {
                assert_eq!(path, "/dev/ttyUSB0");
                assert_eq!(baud_rate, 9600);
            }
            Endpoint::Tcp { .. } => panic!("expected serial endpoint"),
        }
    }
}
