use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Broad classification of a client error.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Missing or invalid configuration. Fatal at startup, never retried.
    Config,
    /// Failure establishing the WebSocket connection. Transient, retried by
    /// the run loop at a fixed interval.
    Connect,
    /// Read or write failure on an established connection. Always triggers a
    /// reconnect, never surfaced to callers directly.
    Session,
    /// Malformed inbound frame. Logged and dropped, the session continues.
    Decode,
    /// Failure on the outbound send path, returned synchronously to the
    /// caller.
    Send,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn config<S: Into<String>>(reason: S) -> Self {
        ConfigError {
            reason: reason.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Configuration that cannot produce a working client.
#[non_exhaustive]
#[derive(Debug)]
pub struct ConfigError {
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl StdError for ConfigError {}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::with_source(Kind::Config, err)
    }
}

/// Failure reported to a caller of [`Client::send`](crate::Client::send).
///
/// The caller decides whether to retry. The client never buffers an outbound
/// frame across a reconnect.
#[non_exhaustive]
#[derive(Debug)]
pub enum SendError {
    /// No active session; the frame was not written.
    NotConnected,
    /// The payload could not be serialized. Nothing was written.
    Serialization(serde_json::Error),
    /// The write did not complete within the configured deadline.
    WriteTimeout {
        /// The deadline that elapsed
        window: Duration,
    },
    /// The transport rejected the write.
    Transport(tungstenite::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected to the hub"),
            Self::Serialization(e) => write!(f, "failed to serialize payload: {e}"),
            Self::WriteTimeout { window } => {
                write!(f, "write deadline of {window:?} exceeded")
            }
            Self::Transport(e) => write!(f, "transport write failed: {e}"),
        }
    }
}

impl StdError for SendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Serialization(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SendError> for Error {
    fn from(err: SendError) -> Self {
        Self::with_source(Kind::Send, err)
    }
}

/// The event that ended an established session.
///
/// Never returned to callers; converted to a log record and a reconnect by
/// the run loop.
#[non_exhaustive]
#[derive(Debug)]
pub enum SessionError {
    /// The transport errored while reading or writing.
    Transport(tungstenite::Error),
    /// The peer sent a close frame or ended the stream.
    PeerClosed,
    /// No frame or pong arrived within the idle window.
    IdleTimeout {
        /// The idle window that elapsed
        window: Duration,
    },
    /// A liveness probe write did not complete within the write deadline.
    ProbeTimeout {
        /// The deadline that elapsed
        window: Duration,
    },
    /// The heartbeat task stopped unexpectedly.
    HeartbeatStopped,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::IdleTimeout { window } => {
                write!(f, "no inbound frame within the idle window of {window:?}")
            }
            Self::ProbeTimeout { window } => {
                write!(f, "liveness probe not written within {window:?}")
            }
            Self::HeartbeatStopped => write!(f, "heartbeat task stopped"),
        }
    }
}

impl StdError for SessionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Self::with_source(Kind::Session, err)
    }
}
