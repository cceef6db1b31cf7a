//! Consumer side: print what the producer streams through the relay.

use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use testcast_core::output::format_clock;
use testcast_core::{Channel, Envelope, EnvelopeKind, OutputLine};

use crate::client::{ClientError, RelayClient};

/// Why a watch session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    /// The shutdown future resolved (Ctrl-C).
    Interrupted,
    /// The relay connection closed.
    Disconnected,
    /// The relay already had two participants.
    Rejected,
}

enum Event {
    Envelope(Envelope),
    Closed,
}

/// Format one console line as `[HH:MM:SS] text`, marking stderr lines.
pub fn render_line(line: &OutputLine) -> String {
    render_output(&line.timestamp, line.channel, &line.text)
}

fn render_output(timestamp: &str, channel: Channel, text: &str) -> String {
    let clock = format_clock(timestamp);
    match channel {
        Channel::Primary => format!("[{clock}] {text}"),
        Channel::Error => format!("[{clock}] [{}] {text}", channel.label()),
    }
}

/// Format an envelope received from the relay.
pub fn render_envelope(envelope: &Envelope) -> String {
    let clock = format_clock(&envelope.timestamp);
    match envelope.kind {
        EnvelopeKind::Output => render_output(
            &envelope.timestamp,
            envelope.channel().unwrap_or(Channel::Primary),
            envelope.message(),
        ),
        EnvelopeKind::Status => {
            let extra = &envelope.payload.extra;
            let mut text = match extra.get("test").and_then(Value::as_str) {
                Some(test) => format!("[{clock}] -- {test}: {}", envelope.message()),
                None => format!("[{clock}] -- {}", envelope.message()),
            };
            if let Some(code) = extra.get("exitCode").and_then(Value::as_i64) {
                text.push_str(&format!(" (exit code {code})"));
            }
            text
        }
        EnvelopeKind::Error => format!("[{clock}] error: {}", envelope.message()),
    }
}

/// Connect and print every envelope until `shutdown` resolves, the relay
/// closes the connection, or the relay turns this client away.
pub async fn watch<P, F>(
    client: &RelayClient,
    mut print: P,
    shutdown: F,
) -> Result<WatchEnd, ClientError>
where
    P: FnMut(&str),
    F: Future<Output = ()>,
{
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let closed_tx = events_tx.clone();

    client
        .connect(
            move |envelope| {
                let _ = events_tx.send(Event::Envelope(envelope));
            },
            move |up| {
                if !up {
                    let _ = closed_tx.send(Event::Closed);
                }
            },
        )
        .await?;
    info!(url = %client.config().url, "Watching relay");

    tokio::pin!(shutdown);
    let end = loop {
        tokio::select! {
            () = &mut shutdown => break WatchEnd::Interrupted,
            event = events.recv() => match event {
                Some(Event::Envelope(envelope)) if envelope.is_capacity_rejection() => {
                    warn!("Relay is full, another watcher is already connected");
                    print(&render_envelope(&envelope));
                    break WatchEnd::Rejected;
                }
                Some(Event::Envelope(envelope)) => print(&render_envelope(&envelope)),
                Some(Event::Closed) | None => break WatchEnd::Disconnected,
            },
        }
    };

    debug!(?end, "Watch finished");
    client.disconnect().await;
    Ok(end)
}
