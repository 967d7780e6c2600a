//! In-memory session store with optional Markdown transcript export.
//!
//! The store keeps one `AgentState` per session key behind a per-session
//! mutex, so concurrent sessions never contend with each other. History
//! lives in memory for the life of the process; the only disk artifact is
//! the optional human-readable transcript.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use super::state::AgentState;
use crate::types::{ContentBlock, Role};
use crate::utils::safe_filename;

/// Thread-safe map of session key → conversation state.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<AgentState>>>>,
    /// When set, transcripts are exported here after each append.
    transcript_dir: Option<PathBuf>,
}

impl SessionStore {
    /// Create a store. Pass a directory to enable transcript export.
    pub fn new(transcript_dir: Option<PathBuf>) -> Self {
        SessionStore {
            sessions: RwLock::new(HashMap::new()),
            transcript_dir,
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<AgentState>> {
        {
            let sessions = self.sessions.read().unwrap();
            if let Some(state) = sessions.get(key) {
                return state.clone();
            }
        }
        let mut sessions = self.sessions.write().unwrap();
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AgentState::new(key))))
            .clone()
    }

    /// Run a closure against the session's state, creating it if needed.
    pub fn with_state<R>(&self, key: &str, f: impl FnOnce(&mut AgentState) -> R) -> R {
        let entry = self.entry(key);
        let mut state = entry.lock().unwrap();
        f(&mut state)
    }

    /// Append a message to the session's history.
    pub fn append(&self, key: &str, msg: crate::types::AgentMessage) {
        self.with_state(key, |state| state.append(msg));
    }

    /// Snapshot of the session's history.
    pub fn history(&self, key: &str) -> Vec<crate::types::AgentMessage> {
        self.with_state(key, |state| state.history.clone())
    }

    /// Compact the session for a context-overflow retry.
    /// Returns the number of messages dropped.
    pub fn compress(&self, key: &str, keep_last_users: usize) -> usize {
        self.with_state(key, |state| state.compress(keep_last_users))
    }

    /// Number of sessions currently tracked.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Whether no sessions exist yet.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Export the session transcript as Markdown, if a directory is configured.
    ///
    /// Write errors are logged and swallowed; the in-memory history is the
    /// source of truth.
    pub fn export_transcript(&self, key: &str) {
        let Some(dir) = &self.transcript_dir else {
            return;
        };
        let snapshot = self.with_state(key, |state| state.clone());
        if let Err(e) = write_transcript(dir, key, &snapshot) {
            warn!(session_key = %key, error = %e, "transcript export failed");
        } else {
            debug!(session_key = %key, "transcript exported");
        }
    }
}

fn write_transcript(dir: &PathBuf, key: &str, state: &AgentState) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.md", safe_filename(key)));
    let mut file = std::fs::File::create(&path)?;

    writeln!(file, "# Session {key}\n")?;
    for msg in &state.history {
        let role = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
        };
        writeln!(file, "## {role}\n")?;
        for block in &msg.content {
            match block {
                ContentBlock::Text { text } => writeln!(file, "{text}\n")?,
                ContentBlock::Image { url, mime, .. } => writeln!(
                    file,
                    "*[image{} {}]*\n",
                    mime.as_deref().map(|m| format!(" {m}")).unwrap_or_default(),
                    url.as_deref().unwrap_or("inline")
                )?,
                ContentBlock::ToolCall { name, arguments, .. } => {
                    writeln!(file, "```tool:{name}\n{arguments}\n```\n")?
                }
                ContentBlock::Thinking { .. } => {}
            }
        }
    }
    Ok(())
}
