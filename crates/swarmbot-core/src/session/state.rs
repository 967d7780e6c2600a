//! Per-session agent state.
//!
//! Holds the conversation history plus the two side-queues (steering notes
//! injected into the next turn, follow-ups processed after it) and the set
//! of tool calls still awaiting results.

use std::collections::{HashSet, VecDeque};

use crate::types::{AgentMessage, Role};

/// Everything the kernel tracks for one conversation stream.
///
/// `Clone` is deep: history, queues, and the pending set are owned values.
#[derive(Clone, Debug)]
pub struct AgentState {
    pub session_key: String,
    pub system_prompt: String,
    pub model_tag: String,
    pub provider_tag: String,
    pub tools: Vec<String>,
    pub history: Vec<AgentMessage>,
    steering: VecDeque<String>,
    followups: VecDeque<String>,
    pending_tools: HashSet<String>,
}

impl AgentState {
    /// Create an empty state for the given session.
    pub fn new(session_key: impl Into<String>) -> Self {
        AgentState {
            session_key: session_key.into(),
            system_prompt: String::new(),
            model_tag: String::new(),
            provider_tag: String::new(),
            tools: Vec::new(),
            history: Vec::new(),
            steering: VecDeque::new(),
            followups: VecDeque::new(),
            pending_tools: HashSet::new(),
        }
    }

    /// Append a message, tracking tool-call bookkeeping.
    ///
    /// Assistant tool calls become pending; a tool-role message resolves the
    /// pending entry named by its `tool_call_id` metadata, if present.
    pub fn append(&mut self, msg: AgentMessage) {
        match msg.role {
            Role::Assistant => {
                for id in msg.tool_call_ids() {
                    self.pending_tools.insert(id);
                }
            }
            Role::Tool => {
                if let Some(id) = msg.metadata.get("tool_call_id").and_then(|v| v.as_str()) {
                    self.pending_tools.remove(id);
                }
            }
            _ => {}
        }
        self.history.push(msg);
    }

    /// Queue a steering note for the next turn.
    pub fn push_steering(&mut self, note: impl Into<String>) {
        self.steering.push_back(note.into());
    }

    /// Take all queued steering notes, oldest first.
    pub fn drain_steering(&mut self) -> Vec<String> {
        self.steering.drain(..).collect()
    }

    /// Queue a follow-up to run after the current turn.
    pub fn push_followup(&mut self, text: impl Into<String>) {
        self.followups.push_back(text.into());
    }

    /// Pop the oldest queued follow-up.
    pub fn pop_followup(&mut self) -> Option<String> {
        self.followups.pop_front()
    }

    /// Tool-call ids still awaiting results.
    pub fn pending_tools(&self) -> &HashSet<String> {
        &self.pending_tools
    }

    /// Mark a pending tool call resolved. Returns whether it was pending.
    pub fn resolve_pending_tool(&mut self, id: &str) -> bool {
        self.pending_tools.remove(id)
    }

    /// Compact the history for a context-overflow retry.
    ///
    /// Keeps every system message, plus everything from the
    /// `keep_last_users`-th most recent user message onward. Returns the
    /// number of messages dropped.
    pub fn compress(&mut self, keep_last_users: usize) -> usize {
        let cut = self.compression_cut(keep_last_users);
        let before = self.history.len();
        let mut index = 0;
        self.history.retain(|msg| {
            let keep = msg.role == Role::System || index >= cut;
            index += 1;
            keep
        });
        before - self.history.len()
    }

    /// Index of the first message to keep unconditionally.
    fn compression_cut(&self, keep_last_users: usize) -> usize {
        if keep_last_users == 0 {
            return self.history.len();
        }
        let mut remaining = keep_last_users;
        for (i, msg) in self.history.iter().enumerate().rev() {
            if msg.role == Role::User {
                remaining -= 1;
                if remaining == 0 {
                    return i;
                }
            }
        }
        0
    }
}
