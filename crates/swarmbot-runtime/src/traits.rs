//! The external-collaborator traits.
//!
//! `MainRuntime` drives a full LLM reasoning loop for one agent session.
//! `SubagentRuntime` spawns and awaits ephemeral child runs.
//! `TaskTracker` is the optional persistence collaborator for linked tasks.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use swarmbot_core::types::MediaAttachment;

use crate::events::StreamEvent;

// ─────────────────────────────────────────────
// Main runtime
// ─────────────────────────────────────────────

/// A single reasoning request against an agent's runtime.
#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    pub agent_id: String,
    pub session_key: String,
    pub prompt: String,
    pub system_prompt: String,
    pub workspace: PathBuf,
    pub media: Vec<MediaAttachment>,
    /// Opaque request metadata, passed through to the driver.
    pub metadata: HashMap<String, serde_json::Value>,
    /// When set, only the named tools are exposed for this run.
    /// A sentinel name that matches no tool disables tools entirely.
    pub tool_whitelist: Option<Vec<String>>,
}

/// The result of a completed (non-streaming) run.
#[derive(Clone, Debug, Default)]
pub struct RunOutput {
    pub output: String,
}

/// Driver for one agent's LLM reasoning loop.
///
/// Implementations are expected to abort promptly when `ctx` fires.
#[async_trait]
pub trait MainRuntime: Send + Sync {
    /// Run one turn to completion and return the final output.
    async fn run(&self, ctx: &CancellationToken, req: RunRequest) -> anyhow::Result<RunOutput>;

    /// Run one turn, streaming events. The channel ends after an `Error`
    /// or `Terminal` event.
    async fn run_stream(
        &self,
        ctx: &CancellationToken,
        req: RunRequest,
    ) -> mpsc::Receiver<StreamEvent>;

    /// Release any underlying resources. Called exactly once per handle.
    async fn close(&self);
}

// ─────────────────────────────────────────────
// Sub-agent runtime
// ─────────────────────────────────────────────

/// Everything needed to start an ephemeral child run.
#[derive(Clone, Debug, Default)]
pub struct SpawnRequest {
    pub run_id: String,
    pub task: String,
    pub role: String,
    /// The repository the child works in.
    pub repo_dir: PathBuf,
    /// Scratch directory for this run.
    pub workdir: PathBuf,
    /// Role-specific skill files mounted for the child.
    pub skills_dir: PathBuf,
    pub system_prompt: String,
    pub timeout_seconds: u64,
    pub mcp_config_path: Option<String>,
}

/// Terminal status of a child run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Timeout,
    #[default]
    Unknown,
}

/// The outcome reported by `SubagentRuntime::wait`.
#[derive(Clone, Debug, Default)]
pub struct WaitOutcome {
    pub status: RunStatus,
    pub output: String,
    pub error_msg: Option<String>,
}

/// A tool-permission question raised by a child run's ask-rule.
#[derive(Clone, Debug, Default)]
pub struct PermissionRequest {
    pub run_id: String,
    pub role: String,
    pub task: String,
    pub repo_dir: String,
    pub tool_name: String,
    /// The sandbox rule that fired.
    pub rule: String,
    /// What the tool was about to touch.
    pub target: String,
    pub reason: String,
    /// Snapshot of the tool parameters.
    pub parameters: serde_json::Value,
}

/// The answer to a permission question.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// Async callback deciding a child's tool-permission question.
pub type PermissionDeciderFn = Arc<
    dyn Fn(
            CancellationToken,
            PermissionRequest,
        ) -> Pin<Box<dyn Future<Output = PermissionDecision> + Send>>
        + Send
        + Sync,
>;

/// Driver for ephemeral child runs.
#[async_trait]
pub trait SubagentRuntime: Send + Sync {
    /// Start a child run. Returns the accepted run id.
    async fn spawn(&self, ctx: &CancellationToken, req: SpawnRequest) -> anyhow::Result<String>;

    /// Block until the run finishes (or times out) and report the outcome.
    async fn wait(&self, ctx: &CancellationToken, run_id: &str) -> anyhow::Result<WaitOutcome>;

    /// Install the callback consulted when an ask-rule fires.
    fn set_permission_decider(&self, decider: PermissionDeciderFn);
}

// ─────────────────────────────────────────────
// Task tracker
// ─────────────────────────────────────────────

/// Status values understood by the task store.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Completed,
    Blocked,
}

/// A progress entry appended to a tracked task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub run_id: String,
    pub status: String,
    pub message: String,
}

/// Optional persistence collaborator linking child runs to tracked tasks.
#[async_trait]
pub trait TaskTracker: Send + Sync {
    async fn link_subagent_run(&self, run_id: &str, task_id: &str) -> anyhow::Result<()>;

    async fn resolve_task_by_run(&self, run_id: &str) -> Option<String>;

    async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> anyhow::Result<()>;

    async fn append_task_progress(&self, entry: TaskProgress) -> anyhow::Result<()>;
}

// ─────────────────────────────────────────────
// Runtime builder
// ─────────────────────────────────────────────

/// Constructs `MainRuntime` handles — the expensive external call the
/// runtime cache wraps.
#[async_trait]
pub trait RuntimeBuilder: Send + Sync {
    async fn build(
        &self,
        ctx: &CancellationToken,
        agent_id: &str,
        fingerprint: &crate::cache::Fingerprint,
    ) -> anyhow::Result<Arc<dyn MainRuntime>>;
}
