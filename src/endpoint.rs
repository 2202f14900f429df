//! Server address normalization
//!
//! Users type addresses in many shapes: `127.0.0.1:8800`, `https://host:8800/`,
//! `wss://host/postman?tkn=abc`. Every shape resolves to the same [`Endpoint`]:
//! scheme prefixes are stripped (and decide TLS), trailing slashes and a
//! trailing `/postman` segment are removed, and the service path is appended
//! again when URLs are built. Parsing an endpoint's own URL yields the same
//! endpoint.

use crate::error::{PostmanError, Result};
use std::fmt;

/// Path the broker serves the socket and HTTP API under
pub const SERVICE_PATH: &str = "/postman";

/// Recognised scheme prefixes and whether they imply TLS
const SCHEMES: [(&str, bool); 4] = [
    ("http://", false),
    ("https://", true),
    ("ws://", false),
    ("wss://", true),
];

/// A resolved broker target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    secure: bool,
    token: Option<String>,
}

impl Endpoint {
    /// Normalize a user-supplied address
    ///
    /// `secure` applies only when the address carries no scheme. A `tkn`
    /// query parameter in the address is used when no token is given.
    pub fn parse(address: &str, secure: bool, token: Option<&str>) -> Result<Self> {
        let mut rest = address.trim();
        let mut token = token.filter(|t| !t.is_empty()).map(str::to_string);

        if let Some((head, query)) = rest.split_once('?') {
            if token.is_none() {
                token = query_token(query);
            }
            rest = head;
        }

        let mut secure = secure;
        for (prefix, tls) in SCHEMES {
            if let Some(stripped) = rest.strip_prefix(prefix) {
                secure = tls;
                rest = stripped;
                break;
            }
        }

        let mut host = rest.trim_end_matches('/');
        if let Some(stripped) = host.strip_suffix(SERVICE_PATH) {
            host = stripped.trim_end_matches('/');
        }

        if host.is_empty() {
            return Err(PostmanError::InvalidAddress(format!(
                "no host in '{}'",
                address
            )));
        }

        if host.chars().any(char::is_whitespace) {
            return Err(PostmanError::InvalidAddress(format!(
                "whitespace in host '{}'",
                host
            )));
        }

        Ok(Self {
            host: host.to_string(),
            secure,
            token,
        })
    }

    /// Host and optional port, e.g. `host:8800`
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether TLS is used
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Secure-mode token, if any
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// WebSocket URL including the token query parameter
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = format!("{}://{}{}", scheme, self.host, SERVICE_PATH);
        if let Some(token) = &self.token {
            url.push_str("?tkn=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    /// HTTP URL for a path below the service path, e.g. `store`
    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}{}/{}", scheme, self.host, SERVICE_PATH, path)
    }

    /// Host name or IP without port, as used by the reachability probe
    pub fn probe_host(&self) -> &str {
        let authority = self.host.split('/').next().unwrap_or("");

        if let Some(bracketed) = authority.strip_prefix('[') {
            return bracketed.split(']').next().unwrap_or(bracketed);
        }

        match authority.rsplit_once(':') {
            Some((host, port))
                if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
            {
                host
            }
            _ => authority,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ws_url())
    }
}

fn query_token(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("tkn="))
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            urlencoding::decode(raw)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| raw.to_string())
        })
}
