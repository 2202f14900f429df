//! Error types for the Postman client

use thiserror::Error;

/// Errors that can occur inside the Postman client
///
/// Connection, command and store calls never return these to the caller;
/// they are logged and turned into observable state or a failed
/// [`StoreResult`](crate::StoreResult). Constructors and transport
/// implementations use them to propagate failures internally.
#[derive(Error, Debug)]
pub enum PostmanError {
    /// The server address could not be normalized into an endpoint
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Connection to the server failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The transport rejected or dropped a frame
    #[error("Transport error: {0}")]
    Transport(String),

    /// Not currently connected to the server
    #[error("Not connected")]
    NotConnected,

    /// Failed to serialize/deserialize a message body
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request to the store endpoint failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Reachability probe could not be performed
    #[error("Probe error: {0}")]
    Probe(String),

    /// No async runtime available to run background tasks
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<reqwest::Error> for PostmanError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result type for Postman operations
pub type Result<T> = std::result::Result<T, PostmanError>;
