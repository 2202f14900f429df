//! Postman client implementation

use crate::config::PostmanConfig;
use crate::endpoint::Endpoint;
use crate::error::{PostmanError, Result};
use crate::inbox::{Batch, Dispatcher, InboundEvent, Inbox};
use crate::protocol::{PublishMessage, WireMessage};
use crate::reconnect::Backoff;
use crate::store::StoreClient;
use crate::transport::{Connector, EventSink, Transport, TransportEvent, WsConnector};
use crate::watchdog::{IcmpProbe, Probe, Watchdog};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to the server
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Connected and ready
    Connected,
    /// Recovering a lost connection: an attempt of the reconnect loop is in
    /// flight or the loop is waiting before the next one
    Reconnecting,
}

/// The current connection and everything bound to its lifetime
struct Live {
    generation: u64,
    transport: Arc<dyn Transport>,
    events: EventSink,
    probe_host: String,
    watchdog: Option<Watchdog>,
}

/// Internal client state
struct ClientInner {
    config: PostmanConfig,
    runtime: Handle,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn Probe>,

    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,

    inbox: Inbox,
    live: Mutex<Option<Live>>,
    generation: AtomicU64,

    // Single-flight guard of the reconnect loop
    reconnecting: AtomicBool,
    // Set by close(), cleared by connect()
    user_closed: AtomicBool,
    reconnect_loops: AtomicUsize,
}

/// Postman pub/sub client
///
/// Network callbacks run on the tokio runtime; inbound events are queued and
/// delivered on the consumer's thread by [`PostmanClient::tick`]. This struct
/// is cheaply cloneable as it uses an internal Arc. Dropping the last clone
/// closes the connection and stops reconnecting.
#[derive(Clone)]
pub struct PostmanClient {
    inner: Arc<ClientInner>,
}

impl PostmanClient {
    /// Create a client on the current tokio runtime
    pub fn new(config: PostmanConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| PostmanError::Runtime(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a client whose network side runs on the given runtime
    ///
    /// Use this when the consumer loop runs on a thread outside the runtime.
    pub fn with_runtime(config: PostmanConfig, runtime: Handle) -> Self {
        let probe = Arc::new(IcmpProbe::new(config.probe_timeout));
        Self::with_parts(config, runtime, Arc::new(WsConnector), probe)
    }

    /// Create a client with a custom transport and reachability probe
    pub fn with_parts(
        config: PostmanConfig,
        runtime: Handle,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(ClientInner {
            config,
            runtime,
            connector,
            probe,
            state: state_tx,
            state_rx,
            inbox: Inbox::new(),
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            user_closed: AtomicBool::new(false),
            reconnect_loops: AtomicUsize::new(0),
        });

        Self { inner }
    }

    pub fn config(&self) -> &PostmanConfig {
        &self.inner.config
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Connected with a live socket
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.inner.is_alive()
    }

    /// Start connecting and return immediately
    ///
    /// Failures are logged and leave the client `Disconnected` (or
    /// reconnecting, when enabled); watch [`Self::state_receiver`] or the
    /// dispatcher's connect callback for the outcome. Does nothing while
    /// already connected.
    pub fn connect(&self) {
        if self.is_connected() {
            debug!("Already connected");
            return;
        }
        self.inner.user_closed.store(false, Ordering::SeqCst);
        self.inner.open_connection(ConnectionState::Connecting);
    }

    /// Connect and wait until connected or the timeout elapses
    pub async fn connect_and_wait(&self, timeout: Duration) -> bool {
        let mut rx = self.state_receiver();
        self.connect();

        let connected = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await;
        connected.is_ok_and(|r| r.is_ok())
    }

    /// Close the connection and stop reconnecting
    ///
    /// Raises the close event like a remote close would.
    pub fn close(&self) {
        self.inner.user_closed.store(true, Ordering::SeqCst);
        let had_connection = self.inner.release_transport();
        self.inner.set_state(ConnectionState::Disconnected);

        if had_connection {
            info!("Connection closed by user");
            self.inner.inbox.push(InboundEvent::Closed);
        }
    }

    /// Ask the broker for a pong
    pub fn ping(&self) {
        self.send(WireMessage::Ping);
    }

    /// Join a channel
    pub fn subscribe(&self, channel: &str, client_info: &str) {
        self.send(WireMessage::Subscribe {
            channel: channel.to_string(),
            client_info: client_info.to_string(),
        });
    }

    /// Leave a channel
    pub fn unsubscribe(&self, channel: &str) {
        self.send(WireMessage::Unsubscribe {
            channel: channel.to_string(),
        });
    }

    /// Publish a message to a channel
    pub fn publish(&self, channel: &str, message: &str, tag: &str, extension: &str) {
        let msg = WireMessage::Publish(PublishMessage::new(channel, message, tag, extension));

        if !self.inner.config.sync_send {
            self.send(msg);
            return;
        }

        let Some((transport, frame)) = self.prepare(&msg) else {
            return;
        };
        self.inner.runtime.spawn_blocking(move || {
            if let Err(e) = transport.send_sync(frame) {
                warn!(error = %e, "Failed to send publish");
            }
        });
    }

    /// Deliver queued events to the dispatcher
    ///
    /// Call once per iteration of the consumer loop. Also acts on the
    /// reachability watchdog: a connection whose server stopped answering
    /// probes is closed here, and its close event delivered in this tick.
    pub fn tick(&self, dispatcher: &mut Dispatcher) {
        self.inner.check_reachability();

        let batch: Batch = self.inner.inbox.take().into_iter().collect();
        if !batch.is_empty() {
            dispatcher.dispatch(batch);
        }
    }

    /// HTTP client for the same broker
    pub fn store(&self) -> Result<StoreClient> {
        StoreClient::from_config(&self.inner.config)
    }

    fn prepare(&self, msg: &WireMessage) -> Option<(Arc<dyn Transport>, String)> {
        let verb = msg.verb().unwrap_or("?");

        if self.state() != ConnectionState::Connected {
            debug!(verb, "Not connected, dropping command");
            return None;
        }
        let transport = self.inner.transport().filter(|t| t.is_alive());
        let Some(transport) = transport else {
            debug!(verb, "Socket not alive, dropping command");
            return None;
        };

        let frame = msg.encode()?;
        trace!(frame = %frame, "Send");
        Some((transport, frame))
    }

    fn send(&self, msg: WireMessage) {
        let Some((transport, frame)) = self.prepare(&msg) else {
            return;
        };
        if let Err(e) = transport.send(frame) {
            warn!(verb = msg.verb().unwrap_or("?"), error = %e, "Failed to send");
        }
    }

    #[cfg(test)]
    fn reconnect_loop_count(&self) -> usize {
        self.inner.reconnect_loops.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PostmanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostmanClient")
            .field("address", &self.inner.config.address)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "State changed");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.live.lock().as_ref().map(|live| live.transport.clone())
    }

    fn is_alive(&self) -> bool {
        self.transport().is_some_and(|t| t.is_alive())
    }

    /// Detach and close the current connection
    ///
    /// Callbacks are unregistered before the transport is closed, so the old
    /// socket cannot raise events against whatever replaces it. Returns
    /// whether there was a connection.
    fn release_transport(&self) -> bool {
        let Some(live) = self.live.lock().take() else {
            return false;
        };

        live.events.unregister();
        if let Some(watchdog) = &live.watchdog {
            watchdog.cancel();
        }
        live.transport.close();
        true
    }

    /// Replace the current connection with a new attempt
    ///
    /// `state` is the state reported while the attempt is in flight. An
    /// explicit close wins over an attempt racing it: the flag is checked
    /// again under the `live` lock, which `close()` takes after setting it.
    fn open_connection(self: &Arc<Self>, state: ConnectionState) {
        self.release_transport();
        if self.user_closed.load(Ordering::SeqCst) {
            return;
        }

        let endpoint = match Endpoint::parse(
            &self.config.address,
            self.config.secure,
            self.config.token.as_deref(),
        ) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(error = %e, "Cannot connect");
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        self.set_state(state);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(host = endpoint.host(), secure = endpoint.is_secure(), "Connecting");

        let events = self.event_sink(generation);
        let transport = self
            .connector
            .create(&endpoint.ws_url(), events.clone(), &self.runtime);

        {
            let mut live = self.live.lock();
            if self.user_closed.load(Ordering::SeqCst) {
                drop(live);
                debug!("Closed while connecting, dropping attempt");
                events.unregister();
                transport.close();
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            *live = Some(Live {
                generation,
                transport: transport.clone(),
                events,
                probe_host: endpoint.probe_host().to_string(),
                watchdog: None,
            });
        }

        // May raise Open synchronously; no lock held here
        transport.connect();
    }

    fn event_sink(self: &Arc<Self>, generation: u64) -> EventSink {
        let weak = Arc::downgrade(self);
        EventSink::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(generation, event);
            }
        })
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                info!("Connected");
                self.set_state(ConnectionState::Connected);
                self.inbox.push(InboundEvent::Connected);
                self.start_watchdog(generation);
            }
            TransportEvent::Message(frame) => match WireMessage::decode(&frame) {
                WireMessage::Pong => self.inbox.push(InboundEvent::Pong),
                WireMessage::Publish(msg) => self.inbox.push(InboundEvent::Message(msg)),
                _ => trace!(frame = %frame, "Ignoring frame"),
            },
            TransportEvent::Close => self.handle_close(),
            TransportEvent::Error(e) => error!(error = %e, "Transport error"),
        }
    }

    fn start_watchdog(&self, generation: u64) {
        if !self.config.check_network_reachable {
            return;
        }

        let mut live = self.live.lock();
        let Some(live) = live.as_mut().filter(|l| l.generation == generation) else {
            return;
        };
        live.watchdog = Some(Watchdog::spawn(
            &self.runtime,
            self.probe.clone(),
            live.probe_host.clone(),
            self.config.reachability_interval,
        ));
    }

    /// A connection went away without the user asking for it
    fn handle_close(self: &Arc<Self>) {
        if let Some(watchdog) = self.live.lock().as_mut().and_then(|l| l.watchdog.take()) {
            watchdog.cancel();
        }

        let was_connected = self.state() == ConnectionState::Connected;
        let recover = self.config.auto_reconnect && !self.user_closed.load(Ordering::SeqCst);
        self.set_state(if recover {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        });

        if was_connected {
            info!("Connection closed");
            self.inbox.push(InboundEvent::Closed);
        }

        if recover {
            self.spawn_reconnect();
        }
    }

    fn check_reachability(self: &Arc<Self>) {
        if !self.config.check_network_reachable || self.state() != ConnectionState::Connected {
            return;
        }

        let unreachable = self
            .live
            .lock()
            .as_ref()
            .and_then(|l| l.watchdog.as_ref())
            .is_some_and(|w| !w.is_reachable());

        if unreachable && self.is_alive() {
            warn!("Server unreachable, closing connection");
            self.release_transport();
            self.handle_close();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already in progress");
            return;
        }
        self.reconnect_loops.fetch_add(1, Ordering::SeqCst);

        let weak = Arc::downgrade(self);
        let backoff = Backoff::from_config(&self.config);
        self.runtime.spawn(reconnect_loop(weak, backoff));
    }
}

async fn reconnect_loop(weak: Weak<ClientInner>, mut backoff: Backoff) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.user_closed.load(Ordering::SeqCst) {
            break;
        }

        info!(attempt = backoff.attempt() + 1, "Reconnecting");
        inner.open_connection(ConnectionState::Reconnecting);
        drop(inner);

        let delay = backoff.next_delay();
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.user_closed.load(Ordering::SeqCst) {
            break;
        }
        if inner.is_alive() {
            info!(attempts = backoff.attempt(), "Reconnected");
            break;
        }

        warn!(attempt = backoff.attempt(), "Reconnect attempt failed");
    }

    let Some(inner) = weak.upgrade() else {
        return;
    };
    inner.reconnecting.store(false, Ordering::SeqCst);

    // A close that raced the exit found the guard still set
    if inner.config.auto_reconnect
        && !inner.user_closed.load(Ordering::SeqCst)
        && inner.state() == ConnectionState::Reconnecting
    {
        inner.spawn_reconnect();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // The sink holds only a Weak, which can no longer be upgraded
        if let Some(live) = self.live.get_mut().take() {
            live.transport.close();
        }
    }
}
