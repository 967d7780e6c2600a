//! Configuration schema.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case.
//! Every section has serde defaults so a partial file loads cleanly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ─────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────

/// Root configuration — loaded from `~/.swarmbot/config.json` + env vars.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub inbound: InboundConfig,
    pub subagents: SubagentsConfig,
    pub tools: ToolsConfig,
    pub bus: BusConfig,
    pub storage: StorageConfig,
}

// ─────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────

/// Agent configuration container: shared defaults plus named agents and
/// the channel/account binding table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
    /// Named agent definitions, keyed by agent id.
    pub catalog: HashMap<String, AgentEntry>,
    /// `"channel:account_id"` → agent id.
    pub bindings: HashMap<String, String>,
    /// Agent used when no binding matches.
    pub default_agent: Option<String>,
}

/// Default agent settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    /// Default LLM model identifier.
    pub model: String,
    /// Sampling temperature (0.0 – 2.0).
    pub temperature: f64,
    /// Maximum tokens to generate per response.
    pub max_tokens: u32,
    /// Maximum tool-calling loop iterations before forcing a response.
    pub max_iterations: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            temperature: 0.7,
            max_tokens: 8192,
            max_iterations: 15,
        }
    }
}

/// A single named agent. Unset fields inherit from `AgentDefaults`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentEntry {
    pub system_prompt: String,
    pub workspace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Tools exposed to this agent.
    pub tools: Vec<String>,
}

// ─────────────────────────────────────────────
// Inbound dispatch
// ─────────────────────────────────────────────

/// Tuning for the inbound dispatcher and its session workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundConfig {
    /// Minimum seconds between "queued" acknowledgements per session.
    pub queue_ack_interval_secs: u64,
    /// Idle seconds before a session worker retires itself.
    pub session_idle_ttl_secs: u64,
    /// Optional cap on concurrently routing sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            queue_ack_interval_secs: 3,
            session_idle_ttl_secs: 600,
            max_concurrent: None,
        }
    }
}

impl InboundConfig {
    pub fn queue_ack_interval(&self) -> Duration {
        Duration::from_secs(self.queue_ack_interval_secs)
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl_secs)
    }
}

// ─────────────────────────────────────────────
// Sub-agents
// ─────────────────────────────────────────────

/// Sub-agent run limits and layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentsConfig {
    /// Per-run timeout in seconds.
    pub timeout_seconds: u64,
    /// Directory (under the workspace) holding per-run work dirs.
    pub workdir_base: String,
    /// Directory holding per-role skill files.
    pub skills_role_dir: String,
    /// Minutes after which a finished run record is archived by the sweeper.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_after_minutes: Option<i64>,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 900,
            workdir_base: "subagents".to_string(),
            skills_role_dir: "skills".to_string(),
            archive_after_minutes: None,
        }
    }
}

// ─────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────

/// User-configured tool policy lists. Static denies apply on top.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub deny: Vec<String>,
    pub allow: Vec<String>,
    /// When set, only tools in `allow` (minus denies) are permitted.
    pub allow_only: bool,
}

// ─────────────────────────────────────────────
// Bus & storage
// ─────────────────────────────────────────────

/// Message bus sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// On-disk locations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Data directory; defaults to `~/.swarmbot` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// When set, session transcripts are exported here as Markdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_dir: Option<String>,
}
