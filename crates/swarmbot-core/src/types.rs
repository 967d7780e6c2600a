//! Shared conversation types.
//!
//! Agent history is a sequence of `AgentMessage`s, each holding an ordered
//! list of tagged `ContentBlock` variants. The kernel never interprets
//! metadata keys; they pass through as an opaque map.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utils;

// ─────────────────────────────────────────────
// Roles
// ─────────────────────────────────────────────

/// Who produced a message.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

// ─────────────────────────────────────────────
// Content blocks
// ─────────────────────────────────────────────

/// One block of message content, discriminated by `type`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text { text: String },
    /// An image, by URL or inline base64 payload.
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        base64: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
    /// A tool invocation requested by the model.
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// Model reasoning that is kept but not shown to users.
    Thinking { text: String },
}

impl ContentBlock {
    /// Create a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Create an image block from a URL.
    pub fn image_url(url: impl Into<String>, mime: Option<String>) -> Self {
        ContentBlock::Image {
            url: Some(url.into()),
            base64: None,
            mime,
        }
    }
}

// ─────────────────────────────────────────────
// Agent messages
// ─────────────────────────────────────────────

/// A single entry in an agent's conversation history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentMessage {
    /// Create a message with the given role and blocks, stamped now.
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        AgentMessage {
            role,
            content,
            timestamp_ms: utils::now_ms(),
            metadata: HashMap::new(),
        }
    }

    /// Create a plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    /// Create a plain-text assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    /// Create a plain-text system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// IDs of all `ToolCall` blocks in this message.
    pub fn tool_call_ids(&self) -> Vec<String> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

// ─────────────────────────────────────────────
// Media attachments
// ─────────────────────────────────────────────

/// A media attachment carried on an inbound or outbound message.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaAttachment {
    /// Kind hint (e.g. "image", "voice", "document").
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}
