//! Postman CLI entry point

mod cli;

use crate::cli::{Cli, Commands, StoreCommands};
use anyhow::{bail, Context, Result};
use clap::Parser;
use postman_client::{Dispatcher, PostmanClient, PostmanConfig, StoreClient, StoreResult};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Consumer loop period, about one frame at 60 Hz
const TICK: Duration = Duration::from_millis(16);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        Commands::Listen {
            channels,
            client_info,
        } => listen(config, channels, client_info).await,
        Commands::Publish {
            channel,
            message,
            tag,
            ext,
            http,
        } => publish(config, channel, message, tag, ext, http).await,
        Commands::Ping { timeout } => ping(config, Duration::from_secs(timeout)).await,
        Commands::Store { command } => store(config, command).await,
        Commands::Status => status(config).await,
    }
}

async fn listen(config: PostmanConfig, channels: Vec<String>, client_info: String) -> Result<()> {
    let client = PostmanClient::new(config).context("Failed to create client")?;

    let subscriber = client.clone();
    let mut dispatcher = Dispatcher::new()
        .on_connect(move || {
            for channel in &channels {
                subscriber.subscribe(channel, &client_info);
            }
            info!(channels = channels.len(), "Subscribed");
        })
        .on_message(|msg| {
            let mut line = format!("[{}] {}", msg.channel, msg.message);
            if !msg.tag.is_empty() {
                line.push_str(" / ");
                line.push_str(&msg.tag);
            }
            if !msg.extension.is_empty() {
                line.push_str(" / ");
                line.push_str(&msg.extension);
            }
            println!("{}", line);
        })
        .on_close(|| warn!("Disconnected"));

    client.connect();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut frames = tokio::time::interval(TICK);

    loop {
        tokio::select! {
            _ = frames.tick() => client.tick(&mut dispatcher),
            _ = &mut shutdown => break,
        }
    }

    info!("Shutting down");
    client.close();
    client.tick(&mut dispatcher);
    Ok(())
}

async fn publish(
    config: PostmanConfig,
    channel: String,
    message: String,
    tag: String,
    ext: String,
    http: bool,
) -> Result<()> {
    if http {
        let store = StoreClient::from_config(&config).context("Invalid address")?;
        let result = store.publish_with_retry(&channel, &message, &tag, &ext).await;
        return print_result(result);
    }

    let address = config.address.clone();
    let client = PostmanClient::new(config).context("Failed to create client")?;
    if !client.connect_and_wait(CONNECT_TIMEOUT).await {
        bail!("Could not connect to {}", address);
    }

    client.publish(&channel, &message, &tag, &ext);

    // Let the socket task write the frame before the close handshake
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.close();
    Ok(())
}

async fn ping(config: PostmanConfig, timeout: Duration) -> Result<()> {
    let address = config.address.clone();
    let client = PostmanClient::new(config).context("Failed to create client")?;
    if !client.connect_and_wait(timeout).await {
        bail!("Could not connect to {}", address);
    }

    let ponged = Rc::new(Cell::new(false));
    let mut dispatcher = Dispatcher::new().on_pingpong({
        let ponged = ponged.clone();
        move || ponged.set(true)
    });

    let started = Instant::now();
    client.ping();

    let mut frames = tokio::time::interval(TICK);
    while !ponged.get() {
        if started.elapsed() > timeout {
            client.close();
            bail!("No pong from {} within {:?}", address, timeout);
        }
        frames.tick().await;
        client.tick(&mut dispatcher);
    }

    println!("pong from {} in {:?}", address, started.elapsed());
    client.close();
    Ok(())
}

async fn store(config: PostmanConfig, command: StoreCommands) -> Result<()> {
    let store = StoreClient::from_config(&config).context("Invalid address")?;

    match command {
        StoreCommands::Get { key } => print_result(store.get_with_retry(&key).await),
        StoreCommands::Set { key, value } => print_result(store.set_with_retry(&key, &value).await),
        StoreCommands::Has { key } => {
            println!("{}", store.has_with_retry(&key).await);
            Ok(())
        }
        StoreCommands::Del { key } => print_result(store.delete_with_retry(&key).await),
    }
}

async fn status(config: PostmanConfig) -> Result<()> {
    let store = StoreClient::from_config(&config).context("Invalid address")?;
    let status = store.status().await.context("Status request failed")?;

    println!("Postman {}", status.version);

    let mut channels: Vec<_> = status.channels.iter().collect();
    channels.sort();

    if channels.is_empty() {
        println!("No channels");
    }
    for (channel, members) in channels {
        println!("  {} ({}): {}", channel, members.len(), members.join(", "));
    }

    Ok(())
}

fn print_result(result: StoreResult) -> Result<()> {
    if result.is_error() {
        bail!("{}", result.error);
    }
    println!("{}", result.result);
    Ok(())
}
