//! Configuration for the Postman client

use crate::store::RetryPolicy;
use std::time::Duration;

/// Configuration for connecting to a Postman broker
#[derive(Debug, Clone)]
pub struct PostmanConfig {
    /// Server address as typed by the user (e.g. "127.0.0.1:8800", "wss://host/postman")
    pub address: String,

    /// Use `wss://`/`https://` unless the address carries its own scheme
    pub secure: bool,

    /// Secure-mode token sent as the `tkn` query parameter
    pub token: Option<String>,

    /// Whether to automatically reconnect when the connection drops
    pub auto_reconnect: bool,

    /// Double the reconnect wait after every failed round
    pub exponential_backoff: bool,

    /// Base wait between reconnect attempts
    pub reconnect_delay: Duration,

    /// Upper bound of the random component added to every reconnect wait
    pub reconnect_jitter: Duration,

    /// Ceiling for the doubled base wait
    pub max_reconnect_delay: Duration,

    /// Probe the server host independently of the socket
    pub check_network_reachable: bool,

    /// Interval between reachability probes
    pub reachability_interval: Duration,

    /// Timeout for a single reachability probe
    pub probe_timeout: Duration,

    /// The host forbids non-blocking sends from the calling thread; publish
    /// frames are written synchronously from a background work item instead
    pub sync_send: bool,

    /// Retry budget for the store helpers
    pub store_retry: RetryPolicy,
}

impl PostmanConfig {
    /// Create a new configuration for the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            secure: false,
            token: None,
            auto_reconnect: true,
            exponential_backoff: false,
            reconnect_delay: Duration::from_secs(1),
            reconnect_jitter: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(300),
            check_network_reachable: false,
            reachability_interval: Duration::from_millis(3000),
            probe_timeout: Duration::from_millis(2000),
            sync_send: false,
            store_retry: RetryPolicy::default(),
        }
    }

    /// Default to TLS when the address has no scheme
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Set the secure-mode token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Double the wait after every failed reconnect round
    pub fn exponential_backoff(mut self) -> Self {
        self.exponential_backoff = true;
        self
    }

    /// Set the base reconnect wait and its random component
    pub fn reconnect_delay(mut self, base: Duration, jitter: Duration) -> Self {
        self.reconnect_delay = base;
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the ceiling for the doubled reconnect wait; `Duration::MAX`
    /// doubles without bound
    pub fn max_reconnect_delay(mut self, max: Duration) -> Self {
        self.max_reconnect_delay = max;
        self
    }

    /// Enable the reachability watchdog with the given probe interval
    pub fn check_network_reachable(mut self, interval: Duration) -> Self {
        self.check_network_reachable = true;
        self.reachability_interval = interval;
        self
    }

    /// Set the timeout for a single reachability probe
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Declare that the host requires synchronous sends
    pub fn sync_send(mut self) -> Self {
        self.sync_send = true;
        self
    }

    /// Set the retry policy used by the store helpers
    pub fn store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }
}
