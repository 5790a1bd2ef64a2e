use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Kind};

/// Type tag discriminating inbound and outbound hub events.
///
/// The catalog covers the tags the hub is known to emit; anything else
/// round-trips losslessly through [`EventType::Other`], so handlers can be
/// registered for tags this crate does not know about yet.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, EnumString, SerializeDisplay, DeserializeFromStr)]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    /// Initial on-connect authentication handshake
    InitAuth,
    /// Periodic personnel position update
    SendPos,
    GetWsStats,
    /// Order forwarded to drivers
    OrderForDriver,
    /// Zone update pushed to fleets
    UpdateZone,
    SendNotification,
    AccountRegistrationRequest,
    GetAllPersonnelPos,
    PanicButton,
    GetStakeholderMemberStats,
    PersonnelOnline,
    PersonnelOffline,
    SendMessage,
    ResponseSuccess,
    ResponseUnauthorized,
    ResponseBadRequest,
    ResponseInternalError,
    ResponseUnsupportedClientType,
    ResponseUnsupportedEventType,
    /// Any tag outside the known catalog
    #[strum(default)]
    Other(String),
}

/// Wire frame exchanged with the hub.
///
/// The payload is forwarded undecoded; the handler owns its schema.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    #[must_use]
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

type EventHandler = Box<dyn Fn(Event) + Send + Sync + 'static>;

/// Registry mapping type tags to callbacks.
///
/// Populated before the client starts; [`Client::start`](crate::Client::start)
/// consumes it, so registration cannot race dispatch. Registering a second
/// handler for the same tag replaces the first.
///
/// Handlers run synchronously on the read task. A handler that blocks
/// unboundedly stalls dispatch and delays liveness probes; this is a
/// documented contract, not enforced by the client.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, EventHandler>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type.
    pub fn register<F>(&mut self, event_type: EventType, handler: F) -> &mut Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.handlers.insert(event_type, Box::new(handler));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decode one inbound frame and invoke the matching handler.
    ///
    /// Never raises past its own boundary: a malformed frame is logged and
    /// dropped so it cannot end the session, and an unknown tag is a
    /// debug-level notice.
    pub(crate) fn dispatch(&self, raw: &[u8]) {
        let event = match serde_json::from_slice::<Event>(raw) {
            Ok(event) => event,
            Err(e) => {
                let error = Error::with_source(Kind::Decode, e);
                tracing::error!(%error, "failed to decode inbound frame");
                return;
            }
        };

        match self.handlers.get(&event.event_type) {
            Some(handler) => handler(event),
            None => {
                tracing::debug!(event_type = %event.event_type, "no handler registered for event");
            }
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
