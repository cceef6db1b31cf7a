//! WebSocket relay between a test producer and a test consumer.
//!
//! Each accepted TCP connection goes through the WebSocket handshake and is
//! then either admitted to the [`ParticipantSet`] or, when two participants
//! are already connected, sent a single `MAX_CLIENTS_REACHED` error envelope
//! and left for the peer to close.
//!
//! Admitted connections are served by one task each. Inbound text frames are
//! validated as envelopes; `output` and `status` envelopes are queued, as the
//! original text, on the other participant's task. Everything else is logged
//! and dropped. A disconnect removes the participant without notifying the
//! remaining one.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use testcast_core::{Envelope, EnvelopeKind};

use crate::participants::{
    CapacityExceeded, OUTBOUND_CAPACITY, Outbound, ParticipantId, ParticipantSet,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Upper bound on how long `stop` waits for connection tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub addr: SocketAddr,
    /// How long a rejected connection may stay open waiting for the peer
    /// to disconnect before the relay closes it.
    pub reject_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            reject_grace: Duration::from_secs(5),
        }
    }
}

/// Errors from relay lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct Running {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    participants: ParticipantSet,
}

/// An explicitly owned relay instance.
///
/// `start` is idempotent while the relay is running; `stop` releases the
/// listening socket and every connection, after which `start` binds afresh.
pub struct RelayServer {
    config: RelayConfig,
    running: Mutex<Option<Running>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind and start accepting connections. Returns the bound address.
    ///
    /// If the relay is already running, returns the existing address
    /// without rebinding.
    pub async fn start(&self) -> Result<SocketAddr, RelayError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                debug!(addr = %current.addr, "Relay already running");
                return Ok(current.addr);
            }
        }

        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: self.config.addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let participants = ParticipantSet::new();
        let task = tokio::spawn(accept_loop(
            listener,
            participants.clone(),
            shutdown_rx,
            self.config.reject_grace,
        ));

        info!(addr = %addr, "Relay server listening");
        *running = Some(Running {
            addr,
            shutdown_tx,
            task,
            participants,
        });
        Ok(addr)
    }

    /// Stop listening and close all connections. A no-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.task.await {
            warn!(error = %e, "Relay accept task ended abnormally");
        }
        info!(addr = %running.addr, "Relay server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Number of currently admitted participants.
    pub async fn participant_count(&self) -> usize {
        let participants = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.participants.clone());
        match participants {
            Some(p) => p.count().await,
            None => 0,
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown_tx.send(true);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    participants: ParticipantSet,
    mut shutdown_rx: watch::Receiver<bool>,
    reject_grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Relay shutting down");
                break;
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    warn!(error = %e, "Connection task ended abnormally");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(addr = %peer, "Accepted TCP connection");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        participants.clone(),
                        shutdown_rx.clone(),
                        reject_grace,
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Relay accept error");
                }
            }
        }
    }

    drop(listener);
    let departing = participants.drain().await;
    debug!(count = departing.len(), "Closing admitted connections");
    let wind_down = async {
        for participant in &departing {
            participant.close().await;
        }
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, wind_down).await.is_err() {
        warn!("Connections did not close in time, aborting");
        connections.abort_all();
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    participants: ParticipantSet,
    shutdown_rx: watch::Receiver<bool>,
    reject_grace: Duration,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(addr = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let (frame_tx, mut frame_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let participant = match participants.admit(peer, frame_tx).await {
        Ok(p) => p,
        Err(full) => {
            reject(sink, source, peer, full, shutdown_rx, reject_grace).await;
            return;
        }
    };
    let id = participant.id;
    // Shutdown may have drained the set before this admission.
    if *shutdown_rx.borrow() {
        participant.close().await;
    }
    drop(participant);

    loop {
        tokio::select! {
            Some(frame) = frame_rx.recv() => match frame {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(participant = %id, error = %e, "Failed to write to participant");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => route(&participants, id, text).await,
                Some(Ok(Message::Binary(_))) => {
                    warn!(participant = %id, "Dropping binary frame, envelopes must be text");
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(participant = %id, "Participant closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(participant = %id, error = %e, "WebSocket transport error");
                    break;
                }
            }
        }
    }

    participants.remove(id).await;
}

/// Validate one inbound frame and pass it on to the other participant.
async fn route(participants: &ParticipantSet, from: ParticipantId, text: String) {
    let envelope = match Envelope::from_json(&text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(participant = %from, error = %e, "Dropping malformed envelope");
            return;
        }
    };

    match envelope.kind {
        EnvelopeKind::Output | EnvelopeKind::Status => {
            let Some(peer) = participants.peer_of(from).await else {
                warn!(
                    participant = %from,
                    kind = envelope.kind.as_str(),
                    "No peer connected, dropping envelope"
                );
                return;
            };
            if peer.send(Outbound::Text(text)) {
                trace!(
                    from = %from,
                    to = %peer.id,
                    kind = envelope.kind.as_str(),
                    "Forwarded envelope"
                );
            } else {
                debug!(from = %from, to = %peer.id, "Envelope not delivered to peer");
            }
        }
        EnvelopeKind::Error => {
            warn!(
                participant = %from,
                text = envelope.message(),
                "Dropping error envelope sent by participant"
            );
        }
    }
}

/// Tell a connection the relay is full, then wait for it to leave.
async fn reject(
    mut sink: WsSink,
    mut source: WsSource,
    peer: SocketAddr,
    full: CapacityExceeded,
    mut shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
) {
    warn!(
        addr = %peer,
        current = full.current,
        max = full.max,
        "Maximum number of participants reached, rejecting connection"
    );

    match Envelope::capacity_exceeded().to_json() {
        Ok(text) => {
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(addr = %peer, error = %e, "Could not deliver capacity error");
                return;
            }
        }
        Err(e) => error!(error = %e, "Failed to encode capacity error"),
    }

    // Inbound frames from a rejected connection are discarded.
    let wait_for_close = async {
        while let Some(Ok(msg)) = source.next().await {
            if msg.is_close() {
                break;
            }
        }
    };
    tokio::select! {
        () = wait_for_close => debug!(addr = %peer, "Rejected connection closed by peer"),
        _ = shutdown_rx.changed() => {}
        () = tokio::time::sleep(grace) => {
            debug!(addr = %peer, "Closing rejected connection after grace period");
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
