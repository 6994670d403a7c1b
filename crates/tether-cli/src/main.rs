//! # Tether CLI
//!
//! Command line client for Tether realtime channels.
//!
//! ## Usage
//!
//! ```bash
//! # Print everything published on two channels
//! tether --channel news --channel chat:lobby
//!
//! # Publish stdin lines, one message per line
//! tail -f app.log | tether --channel logs --publish --event line
//!
//! # Enter presence with data, over Comet
//! tether --channel lobby --presence '{"status":"away"}' --transport comet_stream
//!
//! # Credentials from the environment
//! TETHER_CLIENT__KEY=app.key:secret tether --channel news
//! ```

mod config;
mod metrics;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tether_core::Realtime;
use tether_transport::TransportKind;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Realtime pub/sub client")]
struct Arguments {
    /// Config file (default: tether.toml, /etc/tether/, ~/.config/tether/)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Channel to attach; repeat for several
    #[arg(short = 'n', long = "channel", required = true)]
    channels: Vec<String>,

    /// Publish stdin lines to every channel
    #[arg(short, long)]
    publish: bool,

    /// Event name for published lines
    #[arg(short, long, default_value = "message")]
    event: String,

    /// Enter presence on every channel, with optional JSON data
    #[arg(long, value_name = "DATA", num_args = 0..=1)]
    presence: Option<Option<String>>,

    /// Use only this transport
    #[arg(short, long, value_parser = parse_transport)]
    transport: Option<TransportKind>,

    /// API key, overriding the config file
    #[arg(short, long, env = "TETHER_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Client id for presence
    #[arg(long)]
    client_id: Option<String>,
}

fn parse_transport(value: &str) -> Result<TransportKind, String> {
    TransportKind::ALL
        .into_iter()
        .find(|kind| kind.as_str() == value)
        .ok_or_else(|| format!("unknown transport '{value}'; expected websocket, comet_stream or comet_poll"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info,tether_core=info,tether_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Arguments::parse();

    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(key) = args.key {
        config.client.key = Some(key);
    }
    if let Some(client_id) = args.client_id {
        config.client.client_id = Some(client_id);
    }
    if let Some(kind) = args.transport {
        config.client.transports = vec![kind];
    }

    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)?;
    }

    tracing::info!(
        host = %config.client.realtime_host,
        transports = ?config.client.transports,
        "Starting Tether client"
    );
    let client = Realtime::new(config.client).context("Unable to create client")?;

    let session = session::SessionArgs {
        channels: args.channels,
        publish: args.publish.then_some(args.event),
        presence: args.presence,
    };

    let outcome = tokio::select! {
        result = session::run(&client, &session) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            tracing::info!("Interrupted; closing connection");
            Ok(())
        }
    };

    let state = client.close().await?;
    tracing::info!(%state, "Connection closed");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transport() {
        assert_eq!(parse_transport("websocket"), Ok(TransportKind::WebSocket));
        assert_eq!(parse_transport("comet_poll"), Ok(TransportKind::CometPoll));
        assert!(parse_transport("carrier-pigeon").is_err());
    }

    #[test]
    fn test_arguments() {
        let args = Arguments::parse_from([
            "tether", "-n", "a", "--channel", "b", "--publish", "--presence", "--transport", "comet_stream",
        ]);
        assert_eq!(args.channels, ["a", "b"]);
        assert!(args.publish);
        assert_eq!(args.presence, Some(None));
        assert_eq!(args.transport, Some(TransportKind::CometStream));
        assert_eq!(args.event, "message");
    }
}
