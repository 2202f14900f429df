//! CLI command definitions

use clap::{Parser, Subcommand};
use postman_client::PostmanConfig;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "postman")]
#[command(about = "Client for the Postman pub/sub broker", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Broker address (host:port, or a ws/wss/http/https URL)
    #[arg(short, long, env = "POSTMAN_ADDRESS", default_value = "127.0.0.1:8800", global = true)]
    pub address: String,

    /// Use TLS when the address has no scheme
    #[arg(long, env = "POSTMAN_SECURE", global = true)]
    pub secure: bool,

    /// Secure-mode token
    #[arg(long, env = "POSTMAN_TOKEN", global = true)]
    pub token: Option<String>,

    /// Probe the broker host and drop connections it stops answering
    #[arg(long, global = true)]
    pub reachability: bool,

    /// Probe interval in milliseconds
    #[arg(long, default_value_t = 3000, global = true)]
    pub reachability_interval: u64,

    /// Double the wait after every failed reconnect attempt
    #[arg(long, global = true)]
    pub exponential_backoff: bool,
}

impl Cli {
    /// Client configuration from the global flags
    pub fn config(&self) -> PostmanConfig {
        let mut config = PostmanConfig::new(&self.address);

        if self.secure {
            config = config.secure();
        }
        if let Some(token) = &self.token {
            config = config.token(token.as_str());
        }
        if self.reachability {
            config = config
                .check_network_reachable(Duration::from_millis(self.reachability_interval));
        }
        if self.exponential_backoff {
            config = config.exponential_backoff();
        }

        config
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Subscribe to channels and print messages until Ctrl-C
    ///
    /// Examples:
    ///   postman listen TEST
    ///   postman --address wss://broker.example.com listen room.1 room.2
    Listen {
        /// Channel(s) to subscribe to
        #[arg(required = true)]
        channels: Vec<String>,

        /// Client info sent with every subscribe
        #[arg(long, default_value = "postman-cli")]
        client_info: String,
    },

    /// Publish a message
    ///
    /// Examples:
    ///   postman publish TEST 'hello'
    ///   postman publish TEST 'hello' --tag chat --http
    Publish {
        /// Channel to publish to
        channel: String,

        /// Message body
        message: String,

        /// Message tag
        #[arg(long, default_value = "")]
        tag: String,

        /// Extension field
        #[arg(long, default_value = "")]
        ext: String,

        /// Publish over the HTTP API (with retry) instead of the socket
        #[arg(long)]
        http: bool,
    },

    /// Ping the broker and wait for the pong
    Ping {
        /// Seconds to wait for the connection and the pong
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },

    /// Key-value store operations (with retry)
    Store {
        #[command(subcommand)]
        command: StoreCommands,
    },

    /// Show broker version and channel membership
    Status,
}

#[derive(Subcommand)]
pub enum StoreCommands {
    /// Read a key
    Get {
        key: String,
    },

    /// Write a key
    Set {
        key: String,
        value: String,
    },

    /// Check whether a key exists
    Has {
        key: String,
    },

    /// Delete a key
    Del {
        key: String,
    },
}
