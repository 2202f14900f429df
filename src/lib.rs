//! Postman - client for the Postman pub/sub broker
//!
//! Talks to a broker over a persistent WebSocket (ping, subscribe,
//! unsubscribe, publish) and over its HTTP side-channel (key-value store,
//! publish, status). Connections are supervised: a dropped socket is
//! reconnected with jittered backoff, and an optional reachability watchdog
//! catches dead links the socket never reports.
//!
//! Inbound traffic is queued on the network side and delivered on the
//! caller's thread, in a fixed order, each time [`PostmanClient::tick`] runs.
//!
//! # Example
//!
//! ```no_run
//! use postman_client::{Dispatcher, PostmanClient, PostmanConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PostmanConfig::new("127.0.0.1:8800").exponential_backoff();
//!     let client = PostmanClient::new(config)?;
//!
//!     let subscriber = client.clone();
//!     let mut dispatcher = Dispatcher::new()
//!         .on_connect(move || subscriber.subscribe("TEST", "example"))
//!         .on_message(|msg| println!("[{}] {}", msg.channel, msg.message));
//!
//!     client.connect();
//!
//!     let mut frames = tokio::time::interval(Duration::from_millis(16));
//!     loop {
//!         frames.tick().await;
//!         client.tick(&mut dispatcher);
//!     }
//! }
//! ```

mod client;
mod config;
mod endpoint;
mod error;
mod inbox;
mod protocol;
mod reconnect;
mod store;
mod transport;
mod watchdog;

pub use client::{ConnectionState, PostmanClient};
pub use config::PostmanConfig;
pub use endpoint::{Endpoint, SERVICE_PATH};
pub use error::{PostmanError, Result};
pub use inbox::{Batch, Dispatcher, InboundEvent, Inbox};
pub use protocol::{PublishMessage, WireMessage, MESSAGE_TAG, PONG_BODY};
pub use reconnect::Backoff;
pub use store::{
    BlockingStoreClient, RetryBackoff, RetryPolicy, StatusResult, StoreClient, StoreCommand,
    StoreResult, SUCCESS,
};
pub use transport::{Connector, EventSink, Transport, TransportEvent, WsConnector, WsTransport};
pub use watchdog::{IcmpProbe, Probe, Watchdog};
