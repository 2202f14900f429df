//! Integration tests for postman-client
//!
//! Most tests run against a minimal in-process broker. The ignored ones need
//! a real Postman broker and can be run with:
//!
//! ```sh
//! POSTMAN_TEST_URL=127.0.0.1:8800 cargo test --test integration -- --ignored
//! ```

use futures_util::{SinkExt, StreamExt};
use postman_client::{ConnectionState, Dispatcher, PostmanClient, PostmanConfig, PublishMessage};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::env;
use std::rc::Rc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Broker stub: answers pings, echoes publishes to subscribed connections
struct Broker {
    address: String,
    kick: broadcast::Sender<()>,
}

impl Broker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (kick, _) = broadcast::channel(4);

        let kicker = kick.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, kicker.subscribe()));
            }
        });

        Self { address, kick }
    }

    /// Close every open connection from the server side
    fn kick_all(&self) {
        let _ = self.kick.send(());
    }
}

async fn serve(stream: TcpStream, mut kick: broadcast::Receiver<()>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let mut subscribed = HashSet::new();

    loop {
        let frame = tokio::select! {
            _ = kick.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(_)) => continue,
            _ => return,
        };

        let (verb, body) = text.split_once(' ').unwrap_or((text.as_str(), "{}"));
        let value: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
        let channel = value["channel"].as_str().unwrap_or_default().to_string();

        match verb {
            "ping" => {
                let _ = write.send(Message::Text("message \"pong\"".into())).await;
            }
            "subscribe" => {
                subscribed.insert(channel);
            }
            "unsubscribe" => {
                subscribed.remove(&channel);
            }
            "publish" if subscribed.contains(&channel) => {
                let _ = write.send(Message::Text(format!("message {}", body))).await;
            }
            _ => {}
        }
    }
}

fn test_config(address: &str) -> PostmanConfig {
    PostmanConfig::new(address).reconnect_delay(Duration::from_millis(100), Duration::from_millis(50))
}

/// Tick until the condition holds or the timeout elapses
async fn tick_until(
    client: &PostmanClient,
    dispatcher: &mut Dispatcher,
    timeout: Duration,
    condition: impl Fn() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        client.tick(dispatcher);
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_ping_pong_round_trip() {
    let broker = Broker::start().await;
    let client = PostmanClient::new(test_config(&broker.address)).unwrap();

    let pongs = Rc::new(Cell::new(0));
    let mut dispatcher = Dispatcher::new().on_pingpong({
        let pongs = pongs.clone();
        move || pongs.set(pongs.get() + 1)
    });

    assert!(client.connect_and_wait(Duration::from_secs(5)).await);
    client.ping();

    assert!(tick_until(&client, &mut dispatcher, Duration::from_secs(5), || pongs.get() == 1).await);
    client.close();
}

#[tokio::test]
async fn test_subscribe_and_receive_publish() {
    let broker = Broker::start().await;
    let client = PostmanClient::new(test_config(&broker.address)).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let subscriber = client.clone();
    let mut dispatcher = Dispatcher::new()
        .on_connect(move || subscriber.subscribe("TEST", "integration"))
        .on_message({
            let received = received.clone();
            move |msg| received.borrow_mut().push(msg.clone())
        });

    client.connect();
    assert!(tick_until(&client, &mut dispatcher, Duration::from_secs(5), || client.is_connected()).await);

    client.publish("TEST", "say \"hi\" ✓", "chat", "{\"x\":1}");
    client.publish("OTHER", "not subscribed", "", "");

    assert!(
        tick_until(&client, &mut dispatcher, Duration::from_secs(5), || !received
            .borrow()
            .is_empty())
        .await
    );

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0],
        PublishMessage::new("TEST", "say \"hi\" ✓", "chat", "{\"x\":1}")
    );
    assert_eq!(dispatcher.latest_message(), Some(&received[0]));
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    let broker = Broker::start().await;
    let client = PostmanClient::new(test_config(&broker.address)).unwrap();

    let connects = Rc::new(Cell::new(0));
    let closes = Rc::new(Cell::new(0));
    let mut dispatcher = Dispatcher::new()
        .on_connect({
            let connects = connects.clone();
            move || connects.set(connects.get() + 1)
        })
        .on_close({
            let closes = closes.clone();
            move || closes.set(closes.get() + 1)
        });

    client.connect();
    assert!(tick_until(&client, &mut dispatcher, Duration::from_secs(5), || connects.get() == 1).await);

    broker.kick_all();

    assert!(
        tick_until(&client, &mut dispatcher, Duration::from_secs(10), || connects.get() == 2)
            .await
    );
    assert_eq!(closes.get(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_user_close_emits_one_close_and_stays_closed() {
    let broker = Broker::start().await;
    let client = PostmanClient::new(test_config(&broker.address)).unwrap();

    let closes = Rc::new(Cell::new(0));
    let mut dispatcher = Dispatcher::new().on_close({
        let closes = closes.clone();
        move || closes.set(closes.get() + 1)
    });

    assert!(client.connect_and_wait(Duration::from_secs(5)).await);
    client.close();

    tick_until(&client, &mut dispatcher, Duration::from_millis(500), || false).await;

    assert_eq!(closes.get(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unreachable_address_stays_disconnected() {
    // Bind and release a port so nothing is listening on it
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let client = PostmanClient::new(test_config(&address).no_reconnect()).unwrap();
    assert!(!client.connect_and_wait(Duration::from_millis(500)).await);

    let mut state = client.state_receiver();
    let settled = tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .is_ok();
    assert!(settled);

    // Commands while disconnected are silent no-ops
    client.ping();
    client.publish("TEST", "dropped", "", "");
}

fn get_test_config() -> Option<PostmanConfig> {
    let address = env::var("POSTMAN_TEST_URL").ok()?;
    let mut config = PostmanConfig::new(address);
    if let Ok(token) = env::var("POSTMAN_TEST_TOKEN") {
        config = config.token(token);
    }
    Some(config)
}

#[tokio::test]
#[ignore = "requires running Postman broker"]
async fn test_broker_ping() {
    let config = get_test_config().expect("POSTMAN_TEST_URL must be set");
    let client = PostmanClient::new(config).unwrap();

    let ponged = Rc::new(Cell::new(false));
    let mut dispatcher = Dispatcher::new().on_pingpong({
        let ponged = ponged.clone();
        move || ponged.set(true)
    });

    assert!(client.connect_and_wait(Duration::from_secs(5)).await, "Failed to connect");
    client.ping();

    assert!(tick_until(&client, &mut dispatcher, Duration::from_secs(5), || ponged.get()).await);
    client.close();
}

#[tokio::test]
#[ignore = "requires running Postman broker"]
async fn test_broker_subscribe_publish() {
    let config = get_test_config().expect("POSTMAN_TEST_URL must be set");
    let client = PostmanClient::new(config).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let mut dispatcher = Dispatcher::new().on_message({
        let received = received.clone();
        move |msg| received.borrow_mut().push(msg.clone())
    });

    assert!(client.connect_and_wait(Duration::from_secs(5)).await, "Failed to connect");
    client.subscribe("postman-client-test", "integration");
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.publish("postman-client-test", "hello", "", "");

    assert!(
        tick_until(&client, &mut dispatcher, Duration::from_secs(5), || received
            .borrow()
            .iter()
            .any(|m| m.message == "hello"))
        .await
    );
    client.close();
}

#[tokio::test]
#[ignore = "requires running Postman broker"]
async fn test_broker_store_round_trip() {
    let config = get_test_config().expect("POSTMAN_TEST_URL must be set");
    let client = PostmanClient::new(config).unwrap();
    let store = client.store().unwrap();

    assert!(store.set_with_retry("postman-client-test", "value").await.is_success());
    assert!(store.has("postman-client-test").await);
    assert_eq!(store.get("postman-client-test").await.result, "value");
    assert!(store.delete("postman-client-test").await.is_success());
}
