//! Session key derivation.
//!
//! A session key is the canonical identity of one conversation stream:
//! `channel:account_id:chat_id`. Components are trimmed and defaulted, so
//! the same inputs always produce the same key — except in fresh mode, where
//! a default chat is minted a unique id per call.

/// Component used when a field is blank.
pub const DEFAULT_COMPONENT: &str = "default";

/// Channel used when none is given.
pub const DEFAULT_CHANNEL: &str = "cli";

/// Derive the canonical session key for a (channel, account, chat) triple.
///
/// With `fresh_on_default`, a blank or `"default"` chat id is replaced by a
/// fresh UUID, so every such call starts a new conversation stream. Keys
/// minted this way are unique even under rapid succession.
pub fn resolve_session_key(
    channel: &str,
    account_id: &str,
    chat_id: &str,
    fresh_on_default: bool,
) -> String {
    let channel = non_blank(channel, DEFAULT_CHANNEL);
    let account_id = non_blank(account_id, DEFAULT_COMPONENT);
    let mut chat_id = non_blank(chat_id, DEFAULT_COMPONENT);

    if fresh_on_default && chat_id == DEFAULT_COMPONENT {
        chat_id = uuid::Uuid::new_v4().to_string();
    }

    format!("{channel}:{account_id}:{chat_id}")
}

fn non_blank(value: &str, default: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}
