//! HTTP side-channel: key-value store, publish and broker status
//!
//! Every operation is a single GET against the broker's HTTP API:
//!
//! ```text
//! GET /postman/store?cmd={GET|SET|HAS|DEL}&key=<k>[&val=<v>][&tkn=<token>]
//! GET /postman/publish?ch=<ch>&msg=<msg>&tag=<tag>&ext=<ext>[&tkn=<token>]
//! GET /postman/status[?tkn=<token>]
//! ```
//!
//! Store and publish answer `{"result": "...", "error": "..."}`. Transport
//! failures (connection errors, 4xx/5xx, unparsable bodies) are folded into a
//! [`StoreResult`] with `error` set, so callers only ever inspect results.
//! The `*_with_retry` wrappers repeat a call while its result is an error, up
//! to [`RetryPolicy::max_attempts`] calls in total, and return the last result.

use crate::config::PostmanConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::protocol::PublishMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Result sentinel of a successful write
pub const SUCCESS: &str = "success";

/// Store command verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Get,
    Set,
    Has,
    Delete,
}

impl StoreCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Has => "HAS",
            Self::Delete => "DEL",
        }
    }
}

impl fmt::Display for StoreCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply of a store or publish request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResult {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
}

impl StoreResult {
    /// Synthetic result for a request that never produced a reply
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: String::new(),
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Whether a write was acknowledged
    pub fn is_success(&self) -> bool {
        !self.is_error() && self.result == SUCCESS
    }

    /// `result` as a boolean, for `HAS`
    pub fn as_bool(&self) -> Option<bool> {
        match self.result.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

/// Broker status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    #[serde(default)]
    pub version: String,
    /// Channel name to subscriber addresses
    #[serde(default)]
    pub channels: HashMap<String, Vec<String>>,
}

/// Wait between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    Immediate,
    Fixed(Duration),
    Exponential { base: Duration },
}

/// Attempt budget of the retrying wrappers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of calls, first one included
    pub max_attempts: u32,
    pub backoff: RetryBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: RetryBackoff::Immediate,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            RetryBackoff::Immediate => Duration::ZERO,
            RetryBackoff::Fixed(delay) => delay,
            RetryBackoff::Exponential { base } => {
                base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            }
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

fn store_url(endpoint: &Endpoint, command: StoreCommand, key: &str, value: Option<&str>) -> String {
    let mut url = format!(
        "{}?cmd={}&key={}",
        endpoint.http_url("store"),
        command,
        urlencoding::encode(key)
    );
    if let Some(value) = value {
        url.push_str("&val=");
        url.push_str(&urlencoding::encode(value));
    }
    push_token(&mut url, endpoint);
    url
}

fn publish_url(endpoint: &Endpoint, msg: &PublishMessage) -> String {
    let mut url = format!(
        "{}?ch={}&msg={}&tag={}&ext={}",
        endpoint.http_url("publish"),
        urlencoding::encode(&msg.channel),
        urlencoding::encode(&msg.message),
        urlencoding::encode(&msg.tag),
        urlencoding::encode(&msg.extension)
    );
    push_token(&mut url, endpoint);
    url
}

fn status_url(endpoint: &Endpoint) -> String {
    let mut url = endpoint.http_url("status");
    if let Some(token) = endpoint.token() {
        url.push_str("?tkn=");
        url.push_str(&urlencoding::encode(token));
    }
    url
}

fn push_token(url: &mut String, endpoint: &Endpoint) {
    if let Some(token) = endpoint.token() {
        url.push_str("&tkn=");
        url.push_str(&urlencoding::encode(token));
    }
}

fn store_failed(result: &StoreResult) -> bool {
    result.is_error()
}

fn set_failed(result: &StoreResult) -> bool {
    !result.is_success()
}

async fn retry_async<F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    failed: fn(&StoreResult) -> bool,
    mut attempt: F,
) -> StoreResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult>,
{
    let attempts = policy.attempts();
    let mut result = attempt().await;

    for n in 1..attempts {
        if !failed(&result) {
            return result;
        }
        warn!(operation, attempt = n, error = %result.error, "Store request failed, retrying");

        let delay = policy.delay_after(n);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result = attempt().await;
    }

    if failed(&result) {
        warn!(operation, attempts, error = %result.error, "Store request failed, giving up");
    }
    result
}

fn retry_blocking<F>(
    policy: &RetryPolicy,
    operation: &str,
    failed: fn(&StoreResult) -> bool,
    mut attempt: F,
) -> StoreResult
where
    F: FnMut() -> StoreResult,
{
    let attempts = policy.attempts();
    let mut result = attempt();

    for n in 1..attempts {
        if !failed(&result) {
            return result;
        }
        warn!(operation, attempt = n, error = %result.error, "Store request failed, retrying");

        let delay = policy.delay_after(n);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        result = attempt();
    }

    if failed(&result) {
        warn!(operation, attempts, error = %result.error, "Store request failed, giving up");
    }
    result
}

/// Async client for the broker's HTTP API
#[derive(Debug, Clone)]
pub struct StoreClient {
    endpoint: Endpoint,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl StoreClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            http: reqwest::Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Build from a user-supplied address; see [`Endpoint::parse`]
    pub fn from_address(address: &str, secure: bool, token: Option<&str>) -> Result<Self> {
        Ok(Self::new(Endpoint::parse(address, secure, token)?))
    }

    pub fn from_config(config: &PostmanConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(&config.address, config.secure, config.token.as_deref())?;
        Ok(Self::new(endpoint).with_retry(config.store_retry))
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn request(&self, url: String) -> StoreResult {
        match self.fetch::<StoreResult>(&url).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "HTTP request failed");
                StoreResult::failure(e.to_string())
            }
        }
    }

    async fn store(&self, command: StoreCommand, key: &str, value: Option<&str>) -> StoreResult {
        let result = self
            .request(store_url(&self.endpoint, command, key, value))
            .await;
        if !result.is_error() {
            info!(command = %command, key, result = %result.result, "Store");
        }
        result
    }

    /// Read a key; an absent key yields an empty `result`
    pub async fn get(&self, key: &str) -> StoreResult {
        self.store(StoreCommand::Get, key, None).await
    }

    pub async fn set(&self, key: &str, value: &str) -> StoreResult {
        self.store(StoreCommand::Set, key, Some(value)).await
    }

    /// Raw reply of `HAS`
    pub async fn has_as_data(&self, key: &str) -> StoreResult {
        self.store(StoreCommand::Has, key, None).await
    }

    /// Whether the key exists; `false` when the request fails
    pub async fn has(&self, key: &str) -> bool {
        self.has_as_data(key).await.as_bool().unwrap_or(false)
    }

    pub async fn delete(&self, key: &str) -> StoreResult {
        self.store(StoreCommand::Delete, key, None).await
    }

    pub async fn get_with_retry(&self, key: &str) -> StoreResult {
        retry_async(&self.retry, "get", store_failed, || self.get(key)).await
    }

    /// Retries until the broker answers `success`
    pub async fn set_with_retry(&self, key: &str, value: &str) -> StoreResult {
        retry_async(&self.retry, "set", set_failed, || self.set(key, value)).await
    }

    pub async fn has_with_retry(&self, key: &str) -> bool {
        retry_async(&self.retry, "has", store_failed, || self.has_as_data(key))
            .await
            .as_bool()
            .unwrap_or(false)
    }

    pub async fn delete_with_retry(&self, key: &str) -> StoreResult {
        retry_async(&self.retry, "delete", store_failed, || self.delete(key)).await
    }

    /// Publish through the HTTP API instead of the socket
    pub async fn publish(&self, channel: &str, message: &str, tag: &str, extension: &str) -> StoreResult {
        let msg = PublishMessage::new(channel, message, tag, extension);
        let result = self.request(publish_url(&self.endpoint, &msg)).await;
        if !result.is_error() {
            info!(channel, "[{}] < {}", channel, message);
        }
        result
    }

    pub async fn publish_with_retry(
        &self,
        channel: &str,
        message: &str,
        tag: &str,
        extension: &str,
    ) -> StoreResult {
        retry_async(&self.retry, "publish", store_failed, || {
            self.publish(channel, message, tag, extension)
        })
        .await
    }

    /// Broker version and channel membership; `None` when the request fails
    pub async fn status(&self) -> Option<StatusResult> {
        match self.fetch::<StatusResult>(&status_url(&self.endpoint)).await {
            Ok(status) => Some(status),
            Err(e) => {
                error!(error = %e, "Status request failed");
                None
            }
        }
    }
}

/// Blocking counterpart of [`StoreClient`]
///
/// Must not be created or used from inside an async context.
#[derive(Debug, Clone)]
pub struct BlockingStoreClient {
    endpoint: Endpoint,
    http: reqwest::blocking::Client,
    retry: RetryPolicy,
}

impl BlockingStoreClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            http: reqwest::blocking::Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_address(address: &str, secure: bool, token: Option<&str>) -> Result<Self> {
        Ok(Self::new(Endpoint::parse(address, secure, token)?))
    }

    pub fn from_config(config: &PostmanConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(&config.address, config.secure, config.token.as_deref())?;
        Ok(Self::new(endpoint).with_retry(config.store_retry))
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn fetch<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send()?.error_for_status()?;
        Ok(response.json::<T>()?)
    }

    fn request(&self, url: String) -> StoreResult {
        match self.fetch::<StoreResult>(&url) {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "HTTP request failed");
                StoreResult::failure(e.to_string())
            }
        }
    }

    fn store(&self, command: StoreCommand, key: &str, value: Option<&str>) -> StoreResult {
        let result = self.request(store_url(&self.endpoint, command, key, value));
        if !result.is_error() {
            info!(command = %command, key, result = %result.result, "Store");
        }
        result
    }

    pub fn get(&self, key: &str) -> StoreResult {
        self.store(StoreCommand::Get, key, None)
    }

    pub fn set(&self, key: &str, value: &str) -> StoreResult {
        self.store(StoreCommand::Set, key, Some(value))
    }

    pub fn has_as_data(&self, key: &str) -> StoreResult {
        self.store(StoreCommand::Has, key, None)
    }

    pub fn has(&self, key: &str) -> bool {
        self.has_as_data(key).as_bool().unwrap_or(false)
    }

    pub fn delete(&self, key: &str) -> StoreResult {
        self.store(StoreCommand::Delete, key, None)
    }

    pub fn get_with_retry(&self, key: &str) -> StoreResult {
        retry_blocking(&self.retry, "get", store_failed, || self.get(key))
    }

    pub fn set_with_retry(&self, key: &str, value: &str) -> StoreResult {
        retry_blocking(&self.retry, "set", set_failed, || self.set(key, value))
    }

    pub fn has_with_retry(&self, key: &str) -> bool {
        retry_blocking(&self.retry, "has", store_failed, || self.has_as_data(key))
            .as_bool()
            .unwrap_or(false)
    }

    pub fn delete_with_retry(&self, key: &str) -> StoreResult {
        retry_blocking(&self.retry, "delete", store_failed, || self.delete(key))
    }

    pub fn publish(&self, channel: &str, message: &str, tag: &str, extension: &str) -> StoreResult {
        let msg = PublishMessage::new(channel, message, tag, extension);
        let result = self.request(publish_url(&self.endpoint, &msg));
        if !result.is_error() {
            info!(channel, "[{}] < {}", channel, message);
        }
        result
    }

    pub fn publish_with_retry(
        &self,
        channel: &str,
        message: &str,
        tag: &str,
        extension: &str,
    ) -> StoreResult {
        retry_blocking(&self.retry, "publish", store_failed, || {
            self.publish(channel, message, tag, extension)
        })
    }

    pub fn status(&self) -> Option<StatusResult> {
        match self.fetch::<StatusResult>(&status_url(&self.endpoint)) {
            Ok(status) => Some(status),
            Err(e) => {
                error!(error = %e, "Status request failed");
                None
            }
        }
    }
}
