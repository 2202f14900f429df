//! Socket transport seam
//!
//! The client never talks to a socket library directly. It asks a
//! [`Connector`] for a [`Transport`] bound to an [`EventSink`]; the transport
//! reports open/message/close/error through the sink from whatever thread it
//! runs on. Unregistering the sink is synchronous: once
//! [`EventSink::unregister`] returns, no callback of that transport runs
//! again, so a replaced connection cannot talk over its successor.

use crate::error::{PostmanError, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

/// Lifecycle and data events raised by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close,
    Error(String),
}

type Listener = Box<dyn Fn(TransportEvent) + Send + Sync>;

/// Callback registration shared by a client and one transport
#[derive(Clone)]
pub struct EventSink {
    listener: Arc<Mutex<Option<Listener>>>,
}

impl EventSink {
    pub fn new(listener: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            listener: Arc::new(Mutex::new(Some(Box::new(listener)))),
        }
    }

    /// Deliver an event; a no-op once unregistered
    ///
    /// The registration lock is held while the listener runs, so
    /// [`Self::unregister`] waits for an in-flight callback to finish.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(listener) = self.listener.lock().as_ref() {
            listener(event);
        }
    }

    /// Drop the listener; must not be called from inside it
    pub fn unregister(&self) {
        self.listener.lock().take();
    }

    pub fn is_registered(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// A single socket connection
pub trait Transport: Send + Sync {
    /// Start connecting; the outcome arrives as `Open` or `Close` events
    fn connect(&self);

    /// Whether the socket is open
    fn is_alive(&self) -> bool;

    /// Queue a text frame without waiting for it to be written
    fn send(&self, frame: String) -> Result<()>;

    /// Write a text frame and wait until it has been handed to the socket
    ///
    /// Blocks the calling thread; call from a blocking work item only.
    fn send_sync(&self, frame: String) -> Result<()> {
        self.send(frame)
    }

    /// Close the socket
    fn close(&self);
}

/// Factory for transports
pub trait Connector: Send + Sync {
    fn create(&self, url: &str, events: EventSink, runtime: &Handle) -> Arc<dyn Transport>;
}

/// Connector producing [`WsTransport`]s
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn create(&self, url: &str, events: EventSink, runtime: &Handle) -> Arc<dyn Transport> {
        Arc::new(WsTransport::new(url, events, runtime.clone()))
    }
}

enum Outbound {
    Frame(String, Option<oneshot::Sender<Result<()>>>),
    Close,
}

/// WebSocket transport on tokio-tungstenite
pub struct WsTransport {
    url: String,
    events: EventSink,
    runtime: Handle,
    alive: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(url: &str, events: EventSink, runtime: Handle) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            url: url.to_string(),
            events,
            runtime,
            alive: Arc::new(AtomicBool::new(false)),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            task: Mutex::new(None),
        }
    }
}

impl fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Transport for WsTransport {
    fn connect(&self) {
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            debug!(url = %self.url, "Transport already started");
            return;
        };

        let task = self.runtime.spawn(run_socket(
            self.url.clone(),
            self.events.clone(),
            self.alive.clone(),
            outbound_rx,
        ));
        *self.task.lock() = Some(task);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn send(&self, frame: String) -> Result<()> {
        if !self.is_alive() {
            return Err(PostmanError::NotConnected);
        }
        self.outbound
            .send(Outbound::Frame(frame, None))
            .map_err(|_| PostmanError::NotConnected)
    }

    fn send_sync(&self, frame: String) -> Result<()> {
        if !self.is_alive() {
            return Err(PostmanError::NotConnected);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Frame(frame, Some(ack_tx)))
            .map_err(|_| PostmanError::NotConnected)?;
        ack_rx
            .blocking_recv()
            .map_err(|_| PostmanError::Transport("socket task ended".into()))?
    }

    fn close(&self) {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        if was_alive {
            let _ = self.outbound.send(Outbound::Close);
        } else if let Some(task) = self.task.lock().take() {
            // Still connecting: nothing to say goodbye to
            task.abort();
        }
    }
}

async fn run_socket(
    url: String,
    events: EventSink,
    alive: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    debug!(url = %url, "Connecting");
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let err = PostmanError::Connection(e.to_string());
            events.emit(TransportEvent::Error(err.to_string()));
            events.emit(TransportEvent::Close);
            return;
        }
    };

    let (mut write, mut read) = stream.split();
    alive.store(true, Ordering::SeqCst);
    events.emit(TransportEvent::Open);

    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Frame(text, ack)) => {
                    let result = write.send(WsMessage::Text(text)).await;
                    let failed = result.is_err();
                    let result = result.map_err(|e| PostmanError::Transport(e.to_string()));
                    match ack {
                        Some(ack) => {
                            let _ = ack.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                events.emit(TransportEvent::Error(e.to_string()));
                            }
                        }
                    }
                    if failed {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
            },

            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => events.emit(TransportEvent::Message(text)),
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!("Connection closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
            },
        }
    }

    alive.store(false, Ordering::SeqCst);
    events.emit(TransportEvent::Close);
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted transport for driving the state machine in tests

    use super::*;
    use tokio::time::Instant;

    pub(crate) struct MockTransport {
        pub url: String,
        pub events: EventSink,
        alive: AtomicBool,
        open_on_connect: bool,
        pub connected_at: Mutex<Option<Instant>>,
        pub sent: Mutex<Vec<String>>,
        pub closed: AtomicBool,
    }

    impl MockTransport {
        /// Simulate the socket opening
        pub fn open(&self) {
            self.alive.store(true, Ordering::SeqCst);
            self.events.emit(TransportEvent::Open);
        }

        /// Simulate the server dropping the connection
        pub fn remote_close(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.events.emit(TransportEvent::Close);
        }

        /// Simulate an inbound frame
        pub fn receive(&self, frame: &str) {
            self.events.emit(TransportEvent::Message(frame.to_string()));
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    impl Transport for MockTransport {
        fn connect(&self) {
            *self.connected_at.lock() = Some(Instant::now());
            if self.open_on_connect {
                self.open();
            }
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn send(&self, frame: String) -> Result<()> {
            if !self.is_alive() {
                return Err(PostmanError::NotConnected);
            }
            self.sent.lock().push(frame);
            Ok(())
        }

        fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    type Hook = Box<dyn FnOnce() + Send>;

    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub transports: Mutex<Vec<Arc<MockTransport>>>,
        open_on_connect: bool,
        before_create: Mutex<Option<Hook>>,
    }

    impl MockConnector {
        /// Connector whose transports open as soon as they connect
        pub fn opening() -> Self {
            Self {
                open_on_connect: true,
                ..Self::default()
            }
        }

        pub fn count(&self) -> usize {
            self.transports.lock().len()
        }

        pub fn latest(&self) -> Arc<MockTransport> {
            self.transports.lock().last().cloned().expect("no transport created")
        }

        pub fn all(&self) -> Vec<Arc<MockTransport>> {
            self.transports.lock().clone()
        }

        /// Run `hook` inside the next `create`, before the transport exists
        pub fn before_next_create(&self, hook: impl FnOnce() + Send + 'static) {
            *self.before_create.lock() = Some(Box::new(hook));
        }
    }

    impl Connector for MockConnector {
        fn create(&self, url: &str, events: EventSink, _runtime: &Handle) -> Arc<dyn Transport> {
            let hook = self.before_create.lock().take();
            if let Some(hook) = hook {
                hook();
            }

            let transport = Arc::new(MockTransport {
                url: url.to_string(),
                events,
                alive: AtomicBool::new(false),
                open_on_connect: self.open_on_connect,
                connected_at: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            });
            self.transports.lock().push(transport.clone());
            transport
        }
    }
}
