//! Relay client.
//!
//! Holds at most one WebSocket connection to the relay. A background task owns
//! the socket: it writes queued envelopes and passes every inbound frame
//! through envelope validation before `on_message` sees it. The client never
//! reconnects on its own; a dropped connection stays dropped until the next
//! [`RelayClient::connect`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use testcast_core::Envelope;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `disconnect` waits for the connection task before aborting it.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoint, e.g. `ws://localhost:3001`.
    pub url: String,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3001".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Already connected or connecting to {url}")]
    AlreadyConnected { url: String },

    #[error("Timed out connecting to {url} after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
}

enum Outgoing {
    Text(String),
    Close,
}

struct Session {
    outbound: mpsc::UnboundedSender<Outgoing>,
    task: JoinHandle<()>,
}

/// Marks the client disconnected and fires `on_status(false)` when the
/// connection task ends, whether it returns or is aborted.
struct Teardown<S: FnMut(bool)> {
    on_status: S,
    state_tx: watch::Sender<ConnectionState>,
    generation: Arc<AtomicU64>,
    mine: u64,
}

impl<S: FnMut(bool)> Drop for Teardown<S> {
    fn drop(&mut self) {
        if self.generation.load(Ordering::SeqCst) == self.mine {
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
        (self.on_status)(false);
        info!("Disconnected from relay");
    }
}

/// WebSocket client for the relay.
pub struct RelayClient {
    config: ClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    /// Bumped on every connect so a finished task never clobbers a newer
    /// connection's state.
    generation: Arc<AtomicU64>,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state_tx,
            session: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Open the connection.
    ///
    /// `on_status(true)` fires once the socket is open; `on_status(false)` fires
    /// when it closes for any reason, or right away if this attempt fails.
    /// `on_message` only ever receives validated envelopes.
    pub async fn connect<M, S>(&self, on_message: M, mut on_status: S) -> Result<(), ClientError>
    where
        M: FnMut(Envelope) + Send + 'static,
        S: FnMut(bool) + Send + 'static,
    {
        let url = self.config.url.clone();

        let reserved = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !reserved {
            return Err(ClientError::AlreadyConnected { url });
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(url = %url, "Connecting to relay");
        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await;
        let ws = match attempt {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                return Err(self.fail_connect(
                    ClientError::Connect {
                        url,
                        source: Box::new(e),
                    },
                    &mut on_status,
                ));
            }
            Err(_) => {
                return Err(self.fail_connect(
                    ClientError::Timeout {
                        url,
                        timeout: self.config.connect_timeout,
                    },
                    &mut on_status,
                ));
            }
        };

        on_status(true);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let teardown = Teardown {
            on_status,
            state_tx: self.state_tx.clone(),
            generation: Arc::clone(&self.generation),
            mine: generation,
        };
        let task = tokio::spawn(connection_loop(ws, outbound_rx, on_message, teardown));
        *self.lock_session() = Some(Session { outbound, task });

        // The task may already have seen the socket close.
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        info!(url = %url, "Connected to relay");
        Ok(())
    }

    /// Queue an envelope for the relay.
    ///
    /// Logs and drops the envelope when it fails validation or the client is
    /// not connected.
    pub fn send(&self, envelope: &Envelope) {
        let kind = envelope.kind.as_str();
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind, error = %e, "Refusing to send invalid envelope");
                return;
            }
        };

        if !self.is_connected() {
            warn!(kind, "Not connected to relay, dropping envelope");
            return;
        }

        let session = self.lock_session();
        match session.as_ref() {
            Some(s) if s.outbound.send(Outgoing::Text(text)).is_ok() => {
                trace!(kind, "Queued envelope");
            }
            _ => warn!(kind, "Relay connection closed, dropping envelope"),
        }
    }

    /// Close the connection and wait for it to wind down. No-op when not
    /// connected.
    pub async fn disconnect(&self) {
        let session = self.lock_session().take();
        let Some(session) = session else {
            debug!("Disconnect requested while not connected");
            return;
        };
        close_session(session, DISCONNECT_GRACE).await;
    }

    fn fail_connect<S: FnMut(bool)>(&self, error: ClientError, on_status: &mut S) -> ClientError {
        warn!(error = %error, "Relay connection failed");
        self.mark_disconnected();
        on_status(false);
        error
    }

    fn mark_disconnected(&self) {
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Ask the connection task to close, aborting it after `grace`.
///
/// Returns once the task is gone, so its teardown has already run.
async fn close_session(session: Session, grace: Duration) {
    let Session { outbound, mut task } = session;
    let _ = outbound.send(Outgoing::Close);
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => error!("Relay connection task panicked"),
        Ok(Err(_)) => {}
        Err(_) => {
            warn!("Relay connection did not close in time, aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

async fn connection_loop<M, S>(
    ws: Ws,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    mut on_message: M,
    _teardown: Teardown<S>,
) where
    M: FnMut(Envelope) + Send + 'static,
    S: FnMut(bool) + Send + 'static,
{
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "Failed to send to relay");
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    debug!("Closing relay connection");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => match Envelope::from_json(&text) {
                    Ok(envelope) => on_message(envelope),
                    Err(e) => warn!(error = %e, "Dropping malformed envelope from relay"),
                },
                Some(Ok(Message::Binary(data))) => {
                    warn!(len = data.len(), "Dropping binary frame from relay");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Relay connection error");
                    break;
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use testcast_core::EnvelopeKind;

    fn status_log() -> (Arc<Mutex<Vec<bool>>>, impl FnMut(bool) + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |up| sink.lock().unwrap().push(up))
    }

    #[test]
    fn starts_disconnected() {
        let client = RelayClient::new(ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.config().url, "ws://localhost:3001");
    }

    #[tokio::test]
    async fn send_while_disconnected_is_a_no_op() {
        let client = RelayClient::new(ClientConfig::default());
        client.send(&Envelope::new(EnvelopeKind::Output, "dropped"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_a_no_op() {
        let client = RelayClient::new(ClientConfig::default());
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_connection_reports_status_false() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RelayClient::new(ClientConfig {
            url: format!("ws://{addr}"),
            connect_timeout: Duration::from_secs(2),
        });
        let (log, on_status) = status_log();
        let err = client.connect(|_| {}, on_status).await.unwrap_err();

        assert!(matches!(err, ClientError::Connect { .. }));
        assert_eq!(*log.lock().unwrap(), vec![false]);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn handshake_that_never_completes_times_out() {
        // Accepts TCP but never answers the upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let client = RelayClient::new(ClientConfig {
            url: format!("ws://{addr}"),
            connect_timeout: Duration::from_millis(200),
        });
        let (log, on_status) = status_log();
        let err = client.connect(|_| {}, on_status).await.unwrap_err();

        assert!(matches!(err, ClientError::Timeout { .. }));
        assert_eq!(*log.lock().unwrap(), vec![false]);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn aborted_connection_task_still_reports_status_false() {
        let client = RelayClient::new(ClientConfig::default());
        client.state_tx.send_replace(ConnectionState::Connected);
        let (log, on_status) = status_log();
        let teardown = Teardown {
            on_status,
            state_tx: client.state_tx.clone(),
            generation: Arc::clone(&client.generation),
            mine: client.generation.load(Ordering::SeqCst),
        };
        // A connection task that never notices the close request
        let task = tokio::spawn(async move {
            let _teardown = teardown;
            std::future::pending::<()>().await;
        });
        let (outbound, _outbound_rx) = mpsc::unbounded_channel();

        close_session(Session { outbound, task }, Duration::from_millis(50)).await;

        assert_eq!(*log.lock().unwrap(), vec![false]);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn invalid_url_is_a_connect_error() {
        let client = RelayClient::new(ClientConfig {
            url: "not a url".to_string(),
            connect_timeout: Duration::from_secs(1),
        });
        let err = client.connect(|_| {}, |_| {}).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
