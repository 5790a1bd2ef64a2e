use std::sync::Arc;

use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::Result;
use crate::config::Config;
use crate::connection::{self, CloseHandoff, ConnectionState, Shared};
use crate::error::SendError;
use crate::events::{Event, EventType, HandlerRegistry};

/// Client maintaining one long-lived connection to the fleet hub.
///
/// The client dispatches inbound events to the handlers registered before
/// start, keeps the connection alive with liveness probes, and reconnects at
/// a fixed interval when a session fails. Clones share the same connection;
/// any clone may send, and a single `stop` shuts the client down for all of
/// them.
///
/// # Examples
///
/// ```rust, no_run
/// use fleet_hub_client::{Client, Config, EventType, HandlerRegistry};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::from_env();
///
///     let mut registry = HandlerRegistry::new();
///     registry.register(EventType::OrderForDriver, |event| {
///         println!("order received: {}", event.payload);
///     });
///
///     let client = Client::start(config, registry).await?;
///     client
///         .send(EventType::SendPos, &serde_json::json!({"lat": -6.2, "lon": 106.8}))
///         .await?;
///     client.stop().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    config: Arc<Config>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Validate the config, connect to the hub and start the background run
    /// loop.
    ///
    /// The initial connect is not retried: a hub that is unreachable at
    /// startup is a deployment problem, not a transient failure. Returns once
    /// the first connection is live. The registry is consumed so handler
    /// registration cannot race dispatch.
    pub async fn start(config: Config, registry: HandlerRegistry) -> Result<Self> {
        let endpoint = config.validate()?;

        let stream = connection::connect(&endpoint, &config.token).await?;
        tracing::info!(endpoint = %endpoint, "connected to hub");

        let (shared, state_rx) = Shared::new();
        let (sink, source) = stream.split();
        shared.install(sink);

        tokio::spawn(connection::run_loop(
            Arc::clone(&shared),
            endpoint,
            config.clone(),
            registry,
            source,
        ));

        Ok(Self {
            shared,
            config: Arc::new(config),
            state_rx,
        })
    }

    /// Send one event to the hub.
    ///
    /// The payload is serialized before anything touches the connection, so a
    /// serialization failure reports immediately with no partial write. Fails
    /// fast with [`SendError::NotConnected`] when no session is live; frames
    /// are never buffered across a reconnect. The write runs under the
    /// configured deadline, and concurrent callers are serialized so frame
    /// boundaries never interleave.
    pub async fn send<P: Serialize>(&self, event_type: EventType, payload: &P) -> Result<()> {
        let payload = serde_json::to_value(payload).map_err(SendError::Serialization)?;
        let frame = serde_json::to_string(&Event::new(event_type, payload))
            .map_err(SendError::Serialization)?;

        let Some(writer) = self.shared.writer() else {
            return Err(SendError::NotConnected.into());
        };

        let window = self.config.write_timeout;
        let write = timeout(window, async {
            writer.lock().await.send(Message::Text(frame.into())).await
        })
        .await;

        match write {
            Ok(Ok(())) => {
                if self.config.debug {
                    tracing::trace!("outbound frame written");
                }
                Ok(())
            }
            Ok(Err(e)) => Err(SendError::Transport(e).into()),
            Err(_) => Err(SendError::WriteTimeout { window }.into()),
        }
    }

    /// Shut the client down.
    ///
    /// Idempotent: a second call returns immediately. Sets the closing flag,
    /// sends a close frame best-effort, then force-closes the transport; the
    /// read task observes the closed connection and terminates instead of
    /// reconnecting. Safe to call from a concurrent shutdown signal while a
    /// session is mid-flight or mid-reconnect.
    pub async fn stop(&self) {
        let writer = match self.shared.begin_close() {
            CloseHandoff::AlreadyClosing => return,
            CloseHandoff::Writer(writer) => writer,
        };
        tracing::info!("closing hub connection");

        if let Some(writer) = writer {
            let close = timeout(self.config.write_timeout, async {
                let mut sink = writer.lock().await;
                sink.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client shutting down".into(),
                })))
                .await?;
                sink.close().await
            })
            .await;

            match close {
                Ok(Ok(())) => tracing::debug!("close handshake sent"),
                Ok(Err(error)) => tracing::warn!(%error, "close handshake failed"),
                Err(_) => tracing::warn!("close handshake timed out"),
            }
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether a session is currently live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection state changes.
    ///
    /// Useful for observing reconnections, or for waiting out a connectivity
    /// gap before retrying a failed send.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_subscribe()
    }
}
