//! Bus event types — messages flowing between transports and the kernel.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::MediaAttachment;

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// An inbound message from a transport to the kernel.
///
/// `id` and `timestamp` may be left empty; the bus assigns them on publish.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Unique message id. Empty until published.
    #[serde(default)]
    pub id: String,
    /// Channel name (e.g. "telegram", "qq", "cli").
    pub channel: String,
    /// Which bot account on the channel received the message.
    pub account_id: String,
    /// Chat/conversation identifier.
    pub chat_id: String,
    /// Sender identifier within the channel. Empty for synthetic messages.
    #[serde(default)]
    pub sender_id: String,
    /// Text content of the message.
    pub content: String,
    /// Attached media (photos, voice, documents).
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata, passed through opaquely.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the message was received. Epoch until published.
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Create a new inbound message with minimal required fields.
    ///
    /// `id` and `timestamp` stay unset so the bus can stamp them.
    pub fn new(
        channel: impl Into<String>,
        account_id: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            id: String::new(),
            channel: channel.into(),
            account_id: account_id.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
            timestamp: epoch(),
        }
    }

    /// Whether a human sent this message (as opposed to a synthetic
    /// system/cron/sub-agent announcement).
    pub fn is_user_originated(&self) -> bool {
        !self.sender_id.trim().is_empty()
    }
}

/// An outbound message from the kernel to a transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Unique message id. Empty until published.
    #[serde(default)]
    pub id: String,
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Text content to send.
    pub content: String,
    /// Optional message id to reply to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Channel-specific metadata, passed through opaquely.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the message was published. Epoch until published.
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        OutboundMessage {
            id: String::new(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            metadata: HashMap::new(),
            timestamp: epoch(),
        }
    }
}
