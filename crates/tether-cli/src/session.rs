//! One CLI session: attach channels, print traffic, publish stdin.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_core::{ChannelState, Realtime, RealtimeChannel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics;

/// What to do once connected.
#[derive(Debug, Clone)]
pub struct SessionArgs {
    pub channels: Vec<String>,
    /// Publish stdin lines under this event name.
    pub publish: Option<String>,
    /// Enter presence, with optional data.
    pub presence: Option<Option<String>>,
}

/// Parse a line as JSON, falling back to a plain string.
pub fn parse_data(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

fn watch_connection(client: &Realtime) {
    let mut changes = client.on_state_change();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    metrics::record_state(change.current);
                    match &change.reason {
                        Some(reason) => warn!(
                            from = %change.previous,
                            to = %change.current,
                            code = reason.code,
                            reason = %reason.message,
                            retry_in = ?change.retry_in,
                            "Connection state"
                        ),
                        None => info!(from = %change.previous, to = %change.current, "Connection state"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "State observer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn watch_channel(channel: &RealtimeChannel, attached: Arc<AtomicUsize>) {
    let name = channel.name().to_string();
    let mut messages = channel.subscribe();
    let mut states = channel.on_state_change();
    let mut presence = channel.presence_subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Ok(message) => {
                        let size = message.data.as_ref().map_or(0, |d| d.to_string().len());
                        metrics::record_message(size, "in");
                        match serde_json::to_string(&*message) {
                            Ok(line) => println!("{name}\t{line}"),
                            Err(e) => warn!(channel = %name, error = %e, "Unprintable message"),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        metrics::record_error("lagged");
                        warn!(channel = %name, skipped, "Dropped messages; consumer too slow");
                    }
                    Err(RecvError::Closed) => break,
                },
                change = states.recv() => match change {
                    Ok(change) => {
                        if change.current == ChannelState::Attached {
                            metrics::set_attached_channels(attached.fetch_add(1, Ordering::Relaxed) + 1);
                        } else if change.previous == ChannelState::Attached {
                            metrics::set_attached_channels(attached.fetch_sub(1, Ordering::Relaxed).saturating_sub(1));
                        }
                        info!(channel = %name, from = %change.previous, to = %change.current, resumed = change.resumed, "Channel state");
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                update = presence.recv() => match update {
                    Ok(update) => info!(
                        channel = %name,
                        client = %update.member.client_id,
                        action = ?update.member.action,
                        applied = update.applied,
                        "Presence"
                    ),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

async fn publish_stdin(channels: &[RealtimeChannel], event: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let data = parse_data(&line);
        for channel in channels {
            let started = Instant::now();
            match channel.publish(event, data.clone()).await {
                Ok(()) => {
                    metrics::record_message(line.len(), "out");
                    metrics::record_publish_latency(started.elapsed().as_secs_f64());
                    debug!(channel = %channel.name(), "Published");
                }
                Err(e) => {
                    metrics::record_error("publish");
                    warn!(channel = %channel.name(), error = %e, "Publish failed");
                }
            }
        }
    }
    info!("End of input");
    Ok(())
}

/// Run the session until stdin ends (when publishing) or forever.
///
/// # Errors
///
/// Returns an error if a channel name is invalid or a channel fails to
/// attach.
pub async fn run(client: &Realtime, args: &SessionArgs) -> Result<()> {
    watch_connection(client);

    let attached = Arc::new(AtomicUsize::new(0));
    let mut channels = Vec::with_capacity(args.channels.len());
    for name in &args.channels {
        let channel = client
            .channel(name)
            .with_context(|| format!("Invalid channel name: {name}"))?;
        watch_channel(&channel, attached.clone());
        channel
            .attach()
            .await
            .with_context(|| format!("Failed to attach to {name}"))?;
        info!(channel = %name, "Attached");

        if let Some(data) = &args.presence {
            let data = data.as_deref().map(parse_data);
            if let Err(e) = channel.presence_enter(data).await {
                metrics::record_error("presence");
                warn!(channel = %name, error = %e, "Presence enter failed");
            }
        }
        channels.push(channel);
    }

    match &args.publish {
        Some(event) => publish_stdin(&channels, event).await,
        None => {
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}
