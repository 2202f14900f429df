//! Hand-off of inbound events from the network side to a single consumer
//!
//! Transport callbacks run on threads the consumer does not control. They
//! push [`InboundEvent`]s into the [`Inbox`]; once per tick the consumer swaps
//! the pending batch out under the same lock and hands it to a
//! [`Dispatcher`], which invokes callbacks with no lock held.
//!
//! Dispatch order within a tick is fixed: connect, messages (arrival order),
//! close, pong. Connect, close and pong are one-shot signals: several of the
//! same kind within one tick are delivered once.

use crate::protocol::PublishMessage;
use parking_lot::Mutex;
use std::fmt;
use tracing::debug;

/// Event produced on the network side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The transport opened
    Connected,
    /// A publish frame arrived
    Message(PublishMessage),
    /// The connection closed (remote, local or watchdog)
    Closed,
    /// The broker answered a ping
    Pong,
}

/// Pending events awaiting the next consumer tick
#[derive(Debug, Default)]
pub struct Inbox {
    pending: Mutex<Vec<InboundEvent>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event; never blocks on the consumer
    pub fn push(&self, event: InboundEvent) {
        self.pending.lock().push(event);
    }

    /// Swap the pending events out for an empty buffer
    pub fn take(&self) -> Vec<InboundEvent> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// One tick's events, grouped in dispatch order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    pub connected: bool,
    pub messages: Vec<PublishMessage>,
    pub closed: bool,
    pub pong: bool,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        !self.connected && self.messages.is_empty() && !self.closed && !self.pong
    }
}

impl FromIterator<InboundEvent> for Batch {
    fn from_iter<I: IntoIterator<Item = InboundEvent>>(events: I) -> Self {
        let mut batch = Self::default();
        for event in events {
            match event {
                InboundEvent::Connected => batch.connected = true,
                InboundEvent::Message(msg) => batch.messages.push(msg),
                InboundEvent::Closed => batch.closed = true,
                InboundEvent::Pong => batch.pong = true,
            }
        }
        batch
    }
}

type Callback = Box<dyn FnMut()>;
type MessageCallback = Box<dyn FnMut(&PublishMessage)>;

/// Consumer-side callbacks, invoked once per tick
///
/// Lives on the consumer thread only, so callbacks need not be `Send`. They
/// may freely call back into the client (subscribe on connect, publish a
/// reply, ...).
#[derive(Default)]
pub struct Dispatcher {
    on_connect: Option<Callback>,
    on_message: Option<MessageCallback>,
    on_close: Option<Callback>,
    on_pingpong: Option<Callback>,
    latest_message: Option<PublishMessage>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when a connection opens
    pub fn on_connect(mut self, callback: impl FnMut() + 'static) -> Self {
        self.on_connect = Some(Box::new(callback));
        self
    }

    /// Called for every received message, in arrival order
    pub fn on_message(mut self, callback: impl FnMut(&PublishMessage) + 'static) -> Self {
        self.on_message = Some(Box::new(callback));
        self
    }

    /// Called when the connection closes, whoever closed it
    pub fn on_close(mut self, callback: impl FnMut() + 'static) -> Self {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// Called when the broker answers a ping
    pub fn on_pingpong(mut self, callback: impl FnMut() + 'static) -> Self {
        self.on_pingpong = Some(Box::new(callback));
        self
    }

    /// Last message delivered by [`Self::dispatch`]
    pub fn latest_message(&self) -> Option<&PublishMessage> {
        self.latest_message.as_ref()
    }

    /// Deliver a batch in the fixed order
    pub fn dispatch(&mut self, batch: Batch) {
        if batch.connected {
            if let Some(callback) = self.on_connect.as_mut() {
                callback();
            }
        }

        for msg in batch.messages {
            debug!(channel = %msg.channel, "[{}] > {}", msg.channel, msg.message);
            if let Some(callback) = self.on_message.as_mut() {
                callback(&msg);
            }
            self.latest_message = Some(msg);
        }

        if batch.closed {
            if let Some(callback) = self.on_close.as_mut() {
                callback();
            }
        }

        if batch.pong {
            debug!("pong");
            if let Some(callback) = self.on_pingpong.as_mut() {
                callback();
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_pingpong", &self.on_pingpong.is_some())
            .field("latest_message", &self.latest_message)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn recording_dispatcher() -> (Dispatcher, Rc<RefCell<Vec<String>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));

        let dispatcher = Dispatcher::new()
            .on_connect({
                let log = log.clone();
                move || log.borrow_mut().push("connect".to_string())
            })
            .on_message({
                let log = log.clone();
                move |msg| log.borrow_mut().push(format!("message:{}", msg.channel))
            })
            .on_close({
                let log = log.clone();
                move || log.borrow_mut().push("close".to_string())
            })
            .on_pingpong({
                let log = log.clone();
                move || log.borrow_mut().push("pong".to_string())
            });

        (dispatcher, log)
    }

    fn message(channel: &str) -> InboundEvent {
        InboundEvent::Message(PublishMessage::new(channel, "m", "", ""))
    }

    #[test]
    fn test_take_empties_inbox() {
        let inbox = Inbox::new();
        inbox.push(InboundEvent::Connected);
        inbox.push(message("a"));

        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.take().len(), 2);
        assert!(inbox.is_empty());
        assert!(inbox.take().is_empty());
    }

    #[test]
    fn test_batch_groups_events() {
        let batch: Batch = vec![
            InboundEvent::Pong,
            message("a"),
            InboundEvent::Closed,
            InboundEvent::Connected,
            message("b"),
        ]
        .into_iter()
        .collect();

        assert!(batch.connected);
        assert!(batch.closed);
        assert!(batch.pong);
        let channels: Vec<_> = batch.messages.iter().map(|m| m.channel.as_str()).collect();
        assert_eq!(channels, vec!["a", "b"]);
    }

    #[test]
    fn test_dispatch_fixed_order() {
        let (mut dispatcher, log) = recording_dispatcher();

        let batch: Batch = vec![
            InboundEvent::Closed,
            InboundEvent::Pong,
            message("a"),
            InboundEvent::Connected,
            message("b"),
        ]
        .into_iter()
        .collect();
        dispatcher.dispatch(batch);

        assert_eq!(
            *log.borrow(),
            vec!["connect", "message:a", "message:b", "close", "pong"]
        );
    }

    #[test]
    fn test_one_shot_signals_coalesce() {
        let (mut dispatcher, log) = recording_dispatcher();

        let batch: Batch = vec![
            InboundEvent::Closed,
            InboundEvent::Closed,
            InboundEvent::Pong,
            InboundEvent::Pong,
        ]
        .into_iter()
        .collect();
        dispatcher.dispatch(batch);

        assert_eq!(*log.borrow(), vec!["close", "pong"]);
    }

    #[test]
    fn test_latest_message_is_last_dispatched() {
        let (mut dispatcher, _log) = recording_dispatcher();
        assert!(dispatcher.latest_message().is_none());

        dispatcher.dispatch(vec![message("a"), message("b")].into_iter().collect());
        assert_eq!(dispatcher.latest_message().unwrap().channel, "b");

        dispatcher.dispatch(Batch::default());
        assert_eq!(dispatcher.latest_message().unwrap().channel, "b");
    }

    #[test]
    fn test_dispatch_without_callbacks() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.dispatch(vec![InboundEvent::Connected, message("a")].into_iter().collect());
        assert_eq!(dispatcher.latest_message().unwrap().channel, "a");
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let inbox = Arc::new(Inbox::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let inbox = inbox.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        inbox.push(message(&format!("{}-{}", p, i)));
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        while received.len() < 2000 {
            let batch: Batch = inbox.take().into_iter().collect();
            received.extend(batch.messages);
            std::thread::yield_now();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        received.extend(Batch::from_iter(inbox.take()).messages);

        assert_eq!(received.len(), 2000);

        // Per-producer insertion order survives the swaps
        for p in 0..4 {
            let prefix = format!("{}-", p);
            let seq: Vec<usize> = received
                .iter()
                .filter_map(|m| m.channel.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(seq, (0..500).collect::<Vec<_>>());
        }
    }
}
