//! Wire format of the Postman socket protocol
//!
//! Outbound frames are a verb, a space and a JSON body:
//!
//! ```text
//! ping {}
//! subscribe {"channel":"ch","client_info":"info"}
//! unsubscribe {"channel":"ch"}
//! publish {"channel":"ch","message":"msg","tag":"tag","extention":"ext"}
//! ```
//!
//! Inbound frames always start with the 8-byte tag `message ` followed by
//! either the JSON string `"pong"` or a publish body. Anything else is not a
//! protocol frame and decodes to [`WireMessage::Unknown`].

use serde::{Deserialize, Serialize};

/// Prefix of every inbound protocol frame
pub const MESSAGE_TAG: &str = "message ";

/// Body of the broker's reply to `ping`
pub const PONG_BODY: &str = "\"pong\"";

/// A message published to a channel
///
/// The broker spells the last field `extention`; the Rust field is
/// `extension` and (de)serializes under the broker's name. The short
/// aliases `ch`, `msg` and `ext` are accepted on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    #[serde(alias = "ch")]
    pub channel: String,
    #[serde(alias = "msg")]
    pub message: String,
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "extention", alias = "ext", default)]
    pub extension: String,
}

impl PublishMessage {
    /// Create a message with every field set
    pub fn new(
        channel: impl Into<String>,
        message: impl Into<String>,
        tag: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
            tag: tag.into(),
            extension: extension.into(),
        }
    }
}

#[derive(Serialize)]
struct SubscribeBody<'a> {
    channel: &'a str,
    client_info: &'a str,
}

#[derive(Serialize)]
struct UnsubscribeBody<'a> {
    channel: &'a str,
}

/// A frame of the socket protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Liveness request (outbound)
    Ping,

    /// Reply to [`WireMessage::Ping`] (inbound)
    Pong,

    /// Join a channel (outbound)
    Subscribe { channel: String, client_info: String },

    /// Leave a channel (outbound)
    Unsubscribe { channel: String },

    /// A message on a channel (both directions)
    Publish(PublishMessage),

    /// Not a protocol frame, or a malformed one
    Unknown,
}

impl WireMessage {
    /// Command verb of an outbound frame
    pub fn verb(&self) -> Option<&'static str> {
        match self {
            Self::Ping => Some("ping"),
            Self::Subscribe { .. } => Some("subscribe"),
            Self::Unsubscribe { .. } => Some("unsubscribe"),
            Self::Publish(_) => Some("publish"),
            Self::Pong | Self::Unknown => None,
        }
    }

    /// JSON body of the frame
    pub fn body(&self) -> Option<String> {
        let body = match self {
            Self::Ping => Ok("{}".to_string()),
            Self::Pong => Ok(PONG_BODY.to_string()),
            Self::Subscribe {
                channel,
                client_info,
            } => serde_json::to_string(&SubscribeBody {
                channel,
                client_info,
            }),
            Self::Unsubscribe { channel } => serde_json::to_string(&UnsubscribeBody { channel }),
            Self::Publish(msg) => serde_json::to_string(msg),
            Self::Unknown => return None,
        };
        body.ok()
    }

    /// Encode an outbound command; inbound-only variants yield `None`
    pub fn encode(&self) -> Option<String> {
        let verb = self.verb()?;
        let body = self.body()?;
        Some(format!("{} {}", verb, body))
    }

    /// Decode an inbound frame
    ///
    /// Never fails: frames without the `message ` tag and bodies that are not
    /// valid JSON decode to [`WireMessage::Unknown`].
    pub fn decode(frame: &str) -> Self {
        let Some(body) = frame.strip_prefix(MESSAGE_TAG) else {
            return Self::Unknown;
        };

        if body.trim() == PONG_BODY {
            return Self::Pong;
        }

        match serde_json::from_str::<PublishMessage>(body) {
            Ok(msg) => Self::Publish(msg),
            Err(_) => Self::Unknown,
        }
    }
}
