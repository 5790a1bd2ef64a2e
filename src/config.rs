use std::env;
use std::time::Duration;

use bon::Builder;
use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use crate::Result;
use crate::error::Error;

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable holding the hub endpoint URL.
pub const ENDPOINT_VAR: &str = "WS_URL";
/// Environment variable holding the hub API token.
pub const TOKEN_VAR: &str = "WS_API_TOKEN";
/// Environment variable holding the reconnect interval in seconds.
pub const RECONNECT_INTERVAL_VAR: &str = "WS_RECONNECT_INTERVAL";
/// Environment variable gating verbose frame logging.
pub const DEBUG_VAR: &str = "DEBUG";

/// Configuration snapshot consumed by [`Client::start`](crate::Client::start).
///
/// Construct programmatically via the builder or from the deployment
/// environment via [`Config::from_env`]. Validation happens at startup, not
/// at construction, so a config built from an incomplete environment is
/// representable but will fail `start` with a configuration error.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Hub endpoint, `ws://` or `wss://`
    #[builder(into)]
    pub endpoint: String,
    /// Token attached as `X-API-TOKEN` on the upgrade request
    #[builder(into)]
    pub token: SecretString,
    /// Delay between reconnect attempts after a session ends
    #[builder(default = DEFAULT_RECONNECT_INTERVAL)]
    pub reconnect_interval: Duration,
    /// Interval between liveness probes. Must be strictly less than
    /// `idle_timeout`.
    #[builder(default = DEFAULT_PING_INTERVAL)]
    pub ping_interval: Duration,
    /// Maximum time between inbound frames before the session is declared
    /// failed
    #[builder(default = DEFAULT_IDLE_TIMEOUT)]
    pub idle_timeout: Duration,
    /// Per-write deadline for outbound frames and liveness probes
    #[builder(default = DEFAULT_WRITE_TIMEOUT)]
    pub write_timeout: Duration,
    /// Gates trace-level logging of raw frames
    #[builder(default = false)]
    pub debug: bool,
}

impl Config {
    /// Build a config from the deployment environment.
    ///
    /// Reads `WS_URL`, `WS_API_TOKEN`, `WS_RECONNECT_INTERVAL` and `DEBUG`.
    /// Unset or unparseable values fall back to defaults; missing endpoint or
    /// token surface as a startup error from `Client::start`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::builder()
            .endpoint(env::var(ENDPOINT_VAR).unwrap_or_default())
            .token(env::var(TOKEN_VAR).unwrap_or_default())
            .reconnect_interval(Duration::from_secs(parse_secs(
                env::var(RECONNECT_INTERVAL_VAR).ok(),
                DEFAULT_RECONNECT_INTERVAL.as_secs(),
            )))
            .debug(parse_bool(env::var(DEBUG_VAR).ok(), false))
            .build()
    }

    /// Validate required fields and return the parsed endpoint.
    pub(crate) fn validate(&self) -> Result<Url> {
        if self.endpoint.is_empty() {
            return Err(Error::config("websocket endpoint not set"));
        }
        if self.token.expose_secret().is_empty() {
            return Err(Error::config("websocket API token not set"));
        }

        let endpoint = Url::parse(&self.endpoint)
            .map_err(|e| Error::config(format!("invalid endpoint {:?}: {e}", self.endpoint)))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "endpoint scheme must be ws or wss, got {:?}",
                endpoint.scheme()
            )));
        }

        if self.reconnect_interval < Duration::from_secs(1) {
            return Err(Error::config("reconnect interval must be at least 1s"));
        }
        if self.ping_interval >= self.idle_timeout {
            return Err(Error::config(
                "ping interval must be strictly less than the idle timeout",
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::config("write timeout must be non-zero"));
        }

        Ok(endpoint)
    }
}

fn parse_secs(value: Option<String>, default: u64) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
