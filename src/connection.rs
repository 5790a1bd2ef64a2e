use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use backoff::backoff::{Backoff as _, Constant};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::config::Config;
use crate::error::{Error, Kind, SessionError};
use crate::events::HandlerRegistry;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Header carrying the API token on the upgrade request.
pub const TOKEN_HEADER: &str = "X-API-TOKEN";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No active session
    Disconnected,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Session ended, dialing the hub again
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// State shared between the client facade and the background activities.
///
/// The writer handle and the closing flag are the only mutable shared
/// resources. Both live behind one lock: senders take the shared lock to
/// fetch the current writer, the run loop and `stop` take the exclusive lock
/// to install or tear down a session. Once `closing` is set no new writer is
/// ever installed.
pub(crate) struct Shared {
    inner: RwLock<SharedInner>,
    /// Wakes suspended background activities when `stop` is called
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
}

struct SharedInner {
    writer: Option<Arc<Mutex<WsSink>>>,
    closing: bool,
}

/// Result of the first `begin_close` race.
pub(crate) enum CloseHandoff {
    /// Another caller already closed the client
    AlreadyClosing,
    /// This caller owns shutdown; the writer, if a session was live, is
    /// handed off for the best-effort close handshake
    Writer(Option<Arc<Mutex<WsSink>>>),
}

impl Shared {
    pub(crate) fn new() -> (Arc<Self>, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Self {
            inner: RwLock::new(SharedInner {
                writer: None,
                closing: false,
            }),
            cancel: CancellationToken::new(),
            state_tx,
        };
        (Arc::new(shared), state_rx)
    }

    /// Current writer handle, if a session is live. Hot path for senders.
    pub(crate) fn writer(&self) -> Option<Arc<Mutex<WsSink>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .writer
            .clone()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closing
    }

    /// Install the writer half of a fresh connection.
    ///
    /// Returns `false` when shutdown was requested while the dial was in
    /// flight; the caller must discard the connection.
    pub(crate) fn install(&self, sink: WsSink) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.closing {
            return false;
        }
        inner.writer = Some(Arc::new(Mutex::new(sink)));
        drop(inner);

        _ = self.state_tx.send(ConnectionState::Connected {
            since: Instant::now(),
        });
        true
    }

    /// Drop the writer handle after a session ends. Closes the transport
    /// once in-flight senders release their clones.
    pub(crate) fn clear_writer(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .writer = None;
    }

    /// Flip the closing flag and take the writer for the close handshake.
    pub(crate) fn begin_close(&self) -> CloseHandoff {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.closing {
            return CloseHandoff::AlreadyClosing;
        }
        inner.closing = true;
        let writer = inner.writer.take();
        drop(inner);

        self.cancel.cancel();
        _ = self.state_tx.send(ConnectionState::Disconnected);
        CloseHandoff::Writer(writer)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        _ = self.state_tx.send(state);
    }

    pub(crate) fn state_subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Open one WebSocket connection to the hub, attaching the API token to the
/// upgrade request. Retry policy lives in the run loop, not here.
pub(crate) async fn connect(endpoint: &Url, token: &SecretString) -> Result<WsStream> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| Error::with_source(Kind::Connect, e))?;
    let token_name = HeaderName::from_bytes(TOKEN_HEADER.as_bytes())
        .map_err(|e| Error::with_source(Kind::Connect, e))?;
    let token_value = HeaderValue::from_str(token.expose_secret())
        .map_err(|e| Error::with_source(Kind::Connect, e))?;
    request.headers_mut().insert(token_name, token_value);

    let (stream, _response) = connect_async(request)
        .await
        .map_err(|e| Error::with_source(Kind::Connect, e))?;
    Ok(stream)
}

enum SessionEnd {
    /// Read/write failure or idle expiry; hand control to the supervisor
    Degraded(SessionError),
    /// The closing flag was observed; no reconnect
    Terminated,
}

/// Background run loop: drives one session at a time and, when a session
/// degrades, retries the connector at a fixed interval until it succeeds or
/// shutdown is requested.
pub(crate) async fn run_loop(
    shared: Arc<Shared>,
    endpoint: Url,
    config: Config,
    registry: HandlerRegistry,
    source: WsSource,
) {
    let mut source = Some(source);

    loop {
        let Some(read) = source.take() else { break };

        let ended = run_session(&shared, &config, &registry, read).await;
        shared.clear_writer();

        match ended {
            SessionEnd::Terminated => break,
            SessionEnd::Degraded(reason) => {
                let error = Error::from(reason);
                tracing::warn!(%error, "session ended, reconnecting");
            }
        }

        match supervise_reconnect(&shared, &endpoint, &config).await {
            Some(stream) => {
                let (sink, read) = stream.split();
                if shared.install(sink) {
                    source = Some(read);
                } else {
                    // Shutdown was requested during the dial; discard.
                    break;
                }
            }
            None => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    tracing::debug!("hub client run loop exited");
}

/// Reconnection supervisor: dial the hub at a fixed interval until success
/// or shutdown. Never gives up on its own.
async fn supervise_reconnect(shared: &Shared, endpoint: &Url, config: &Config) -> Option<WsStream> {
    let mut policy = Constant::new(config.reconnect_interval);
    let mut attempt: u32 = 0;

    loop {
        if shared.is_closing() {
            return None;
        }

        attempt = attempt.saturating_add(1);
        shared.set_state(ConnectionState::Reconnecting { attempt });

        match connect(endpoint, &config.token).await {
            Ok(stream) => {
                tracing::info!(attempt, "reconnected to hub");
                return Some(stream);
            }
            Err(error) => {
                tracing::warn!(attempt, %error, "reconnect attempt failed");
            }
        }

        let delay = policy.next_backoff().unwrap_or(config.reconnect_interval);
        tokio::select! {
            () = sleep(delay) => {}
            () = shared.cancelled() => return None,
        }
    }
}

/// Session loop for one established connection.
///
/// Runs the read path inline and a heartbeat timer as a separate task so a
/// slow or absent peer cannot prevent outgoing probes. Every inbound frame
/// resets the idle deadline; probe writes share the outbound writer and its
/// per-write deadline.
async fn run_session(
    shared: &Arc<Shared>,
    config: &Config,
    registry: &HandlerRegistry,
    mut read: WsSource,
) -> SessionEnd {
    if shared.is_closing() {
        return SessionEnd::Terminated;
    }

    let (ping_tx, mut ping_rx) = mpsc::channel::<()>(1);
    let heartbeat = tokio::spawn(heartbeat_timer(
        config.ping_interval,
        ping_tx,
        shared.cancel.clone(),
    ));

    let mut idle_deadline = tokio::time::Instant::now() + config.idle_timeout;

    let mut end = loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(message)) => {
                        idle_deadline = tokio::time::Instant::now() + config.idle_timeout;
                        match message {
                            Message::Text(text) => {
                                if config.debug {
                                    tracing::trace!(frame = %text, "received frame");
                                }
                                registry.dispatch(text.as_bytes());
                            }
                            Message::Binary(data) => {
                                registry.dispatch(&data);
                            }
                            Message::Pong(_) => {
                                tracing::trace!("pong received");
                            }
                            Message::Close(frame) => {
                                tracing::info!(?frame, "peer requested close");
                                break SessionEnd::Degraded(SessionError::PeerClosed);
                            }
                            // Pings are answered by the transport layer.
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        break SessionEnd::Degraded(SessionError::Transport(e));
                    }
                    None => {
                        break SessionEnd::Degraded(SessionError::PeerClosed);
                    }
                }
            }

            () = sleep_until(idle_deadline) => {
                break SessionEnd::Degraded(SessionError::IdleTimeout {
                    window: config.idle_timeout,
                });
            }

            ping = ping_rx.recv() => {
                match ping {
                    Some(()) => {
                        let Some(writer) = shared.writer() else {
                            break SessionEnd::Degraded(SessionError::HeartbeatStopped);
                        };
                        let probe = timeout(config.write_timeout, async {
                            writer.lock().await.send(Message::Ping(Bytes::new())).await
                        })
                        .await;
                        match probe {
                            Ok(Ok(())) => tracing::trace!("liveness probe sent"),
                            Ok(Err(e)) => {
                                break SessionEnd::Degraded(SessionError::Transport(e));
                            }
                            Err(_) => {
                                break SessionEnd::Degraded(SessionError::ProbeTimeout {
                                    window: config.write_timeout,
                                });
                            }
                        }
                    }
                    None => break SessionEnd::Degraded(SessionError::HeartbeatStopped),
                }
            }

            () = shared.cancelled() => {
                break SessionEnd::Terminated;
            }
        }

        if shared.is_closing() {
            break SessionEnd::Terminated;
        }
    };

    heartbeat.abort();

    // A degrade that raced shutdown terminates instead of reconnecting.
    if shared.is_closing() {
        end = SessionEnd::Terminated;
    }
    end
}

/// Emits a tick per ping interval; the session loop performs the probe write
/// so probes share the writer and cannot interleave with outbound frames.
async fn heartbeat_timer(period: Duration, ping_tx: mpsc::Sender<()>, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if ping_tx.send(()).await.is_err() {
                    // Session loop is gone.
                    break;
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}
