//! Agent manager — binds channel/account tuples to agents, routes inbound
//! messages through cached runtimes, publishes replies, and owns the
//! sub-agent announce/cleanup flow.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use tokio_util::sync::CancellationToken;

use swarmbot_core::bus::queue::MessageBus;
use swarmbot_core::bus::types::{InboundMessage, OutboundMessage};
use swarmbot_core::config::schema::{AgentDefaults, Config};
use swarmbot_core::errors::{is_context_overflow, user_facing_message, KernelError};
use swarmbot_core::session::store::SessionStore;
use swarmbot_core::types::{AgentMessage, ContentBlock, Role};
use swarmbot_runtime::{
    Fingerprint, PermissionDecision, PermissionDeciderFn, PermissionRequest, RunRequest,
    RunStatus, RuntimeCache, SubagentRuntime,
};

use crate::approval::{ApprovalPipeline, ApproverRuntime, TOOLS_DISABLED_SENTINEL};
use crate::dispatch::InboundRouter;
use crate::policy::ToolPolicy;
use crate::registry::{CleanupPolicy, RunOutcome, SubagentRegistry, SubagentRunRecord};
use crate::subagent::{SpawnParams, SubagentOrchestrator};

/// User turns retained (besides system messages) on a context-overflow
/// compression.
const COMPRESS_KEEP_USERS: usize = 4;

/// Bound on follow-ups drained after one inbound message.
const MAX_FOLLOWUPS_PER_TURN: usize = 8;

// ─────────────────────────────────────────────
// Resolved agents
// ─────────────────────────────────────────────

/// An agent entry with defaults folded in.
#[derive(Clone, Debug)]
pub struct ResolvedAgent {
    pub id: String,
    pub system_prompt: String,
    pub workspace: PathBuf,
    pub model: String,
    pub provider: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub tools: Vec<String>,
}

impl ResolvedAgent {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(
            self.workspace.clone(),
            self.system_prompt.clone(),
            self.model.clone(),
            self.temperature,
            self.max_tokens,
        )
    }
}

fn resolve_catalog(config: &Config) -> HashMap<String, ResolvedAgent> {
    let defaults: &AgentDefaults = &config.agents.defaults;
    config
        .agents
        .catalog
        .iter()
        .map(|(id, entry)| {
            (
                id.clone(),
                ResolvedAgent {
                    id: id.clone(),
                    system_prompt: entry.system_prompt.clone(),
                    workspace: PathBuf::from(&entry.workspace),
                    model: entry.model.clone().unwrap_or_else(|| defaults.model.clone()),
                    provider: entry.provider.clone().unwrap_or_default(),
                    temperature: entry.temperature.unwrap_or(defaults.temperature),
                    max_tokens: entry.max_tokens.unwrap_or(defaults.max_tokens),
                    tools: entry.tools.clone(),
                },
            )
        })
        .collect()
}

// ─────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────

/// Owns the agent catalog, the binding table, and the orchestration wiring.
pub struct AgentManager {
    agents: HashMap<String, ResolvedAgent>,
    bindings: HashMap<String, String>,
    default_agent: Option<String>,
    bus: Arc<MessageBus>,
    sessions: Arc<SessionStore>,
    cache: Arc<RuntimeCache>,
    registry: Arc<SubagentRegistry>,
    orchestrator: Arc<SubagentOrchestrator>,
    policy: ToolPolicy,
    /// Self-handle for the completion callback and permission decider.
    weak_self: Weak<AgentManager>,
}

impl AgentManager {
    pub fn new(
        config: &Config,
        bus: Arc<MessageBus>,
        sessions: Arc<SessionStore>,
        cache: Arc<RuntimeCache>,
        registry: Arc<SubagentRegistry>,
        orchestrator: Arc<SubagentOrchestrator>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak_self| AgentManager {
            agents: resolve_catalog(config),
            bindings: config.agents.bindings.clone(),
            default_agent: config.agents.default_agent.clone(),
            bus,
            sessions,
            cache,
            registry,
            orchestrator,
            policy: ToolPolicy::from_config(&config.tools),
            weak_self: weak_self.clone(),
        });

        manager.install_completion_callback();
        manager
    }

    /// Install the permission decider on the sub-agent runtime.
    ///
    /// Policy denies answer immediately; everything else goes through the
    /// approval pipeline. A request for an unknown run is denied.
    pub fn wire_permission_decider(&self, runtime: &dyn SubagentRuntime) {
        let weak = self.weak_self.clone();
        let decider: PermissionDeciderFn = Arc::new(move |ctx, req: PermissionRequest| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(manager) = weak.upgrade() else {
                    return PermissionDecision::Deny;
                };
                manager.decide_permission(ctx, req).await
            })
        });
        runtime.set_permission_decider(decider);
    }

    async fn decide_permission(
        &self,
        ctx: CancellationToken,
        req: PermissionRequest,
    ) -> PermissionDecision {
        if !self.policy.is_allowed(&req.tool_name) {
            info!(
                run_id = %req.run_id,
                tool = %req.tool_name,
                "tool denied by policy"
            );
            return PermissionDecision::Deny;
        }

        let Some(record) = self.registry.get(&req.run_id) else {
            warn!(run_id = %req.run_id, "permission ask for unknown run, denying");
            return PermissionDecision::Deny;
        };

        let Some(approver) = self.weak_self.upgrade() else {
            return PermissionDecision::Deny;
        };
        let pipeline = ApprovalPipeline::new(approver as Arc<dyn ApproverRuntime>);
        let (decision, _reason) = pipeline
            .decide(&ctx, &req, &record.requester_origin)
            .await;
        decision
    }

    /// Sub-agent completions announce through here, gated by the registry's
    /// begin-cleanup latch so each run is surfaced at most once.
    fn install_completion_callback(&self) {
        let weak = self.weak_self.clone();
        self.registry.set_on_complete(Arc::new(move |record| {
            let weak: Weak<AgentManager> = weak.clone();
            Box::pin(async move {
                if let Some(manager) = weak.upgrade() {
                    manager.announce_subagent(record).await;
                }
            })
        }));
    }

    async fn announce_subagent(&self, record: SubagentRunRecord) {
        if !self.registry.begin_cleanup(&record.run_id) {
            debug!(run_id = %record.run_id, "result already announced");
            return;
        }

        let content = announce_text(&record);
        let mut msg = OutboundMessage::new(
            &record.requester_origin.channel,
            &record.requester_origin.to,
            content,
        );
        msg.metadata.insert(
            "kind".into(),
            serde_json::Value::String("subagent_result".into()),
        );
        msg.metadata.insert(
            "run_id".into(),
            serde_json::Value::String(record.run_id.clone()),
        );

        let ctx = CancellationToken::new();
        let did_announce = match self.bus.publish_outbound(&ctx, msg).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %record.run_id, error = %e, "announce publish failed");
                false
            }
        };
        self.registry
            .cleanup(&record.run_id, record.cleanup, did_announce);
    }

    // ─────────────────────────────────────────
    // Inbound routing
    // ─────────────────────────────────────────

    /// Route one inbound message: resolve the agent, run the turn, publish
    /// the reply, then drain any queued follow-ups.
    pub async fn route(
        &self,
        ctx: &CancellationToken,
        session_key: &str,
        msg: InboundMessage,
    ) {
        let Some(agent) = self.resolve_agent(&msg.channel, &msg.account_id) else {
            warn!(
                channel = %msg.channel,
                account_id = %msg.account_id,
                "no agent bound, dropping with error reply"
            );
            self.publish_error(
                ctx,
                &msg.channel,
                &msg.chat_id,
                "no agent is bound to this channel/account",
            )
            .await;
            return;
        };

        debug!(session_key = %session_key, agent_id = %agent.id, "routing inbound");

        let prompt = self.prompt_with_steering(session_key, &msg.content);
        let mut user_msg = AgentMessage::new(Role::User, message_blocks(&msg));
        user_msg
            .metadata
            .insert("message_id".into(), serde_json::Value::String(msg.id.clone()));

        if self
            .run_turn(ctx, &agent, session_key, &msg, user_msg, prompt)
            .await
            .is_err()
        {
            return;
        }

        // Follow-ups queued during the turn run as their own turns, in order.
        for _ in 0..MAX_FOLLOWUPS_PER_TURN {
            let Some(followup) = self
                .sessions
                .with_state(session_key, |state| state.pop_followup())
            else {
                break;
            };
            let user_msg = AgentMessage::user(&followup);
            if self
                .run_turn(ctx, &agent, session_key, &msg, user_msg, followup)
                .await
                .is_err()
            {
                break;
            }
        }
    }

    /// One full turn: acquire the runtime, run, append history, publish the
    /// reply. Retries once after compression on a context overflow.
    async fn run_turn(
        &self,
        ctx: &CancellationToken,
        agent: &ResolvedAgent,
        session_key: &str,
        origin: &InboundMessage,
        user_msg: AgentMessage,
        prompt: String,
    ) -> Result<()> {
        let mut compressed = false;
        loop {
            let lease = match self
                .cache
                .acquire(ctx, &agent.id, agent.fingerprint())
                .await
            {
                Ok(lease) => lease,
                Err(e) => {
                    error!(agent_id = %agent.id, error = %e, "runtime build failed");
                    let kind = KernelError::RuntimeBuildFailed(e.to_string());
                    self.publish_error(ctx, &origin.channel, &origin.chat_id, &kind.to_string())
                        .await;
                    return Err(e);
                }
            };

            let request = self.build_request(agent, session_key, origin, &prompt);
            let result = lease.handle().run(ctx, request).await;
            self.cache.release(lease).await;

            match result {
                Ok(output) => {
                    self.sessions.append(session_key, user_msg);
                    self.sessions
                        .append(session_key, AgentMessage::assistant(&output.output));
                    self.sessions.export_transcript(session_key);

                    let mut reply =
                        OutboundMessage::new(&origin.channel, &origin.chat_id, output.output);
                    reply.reply_to = Some(origin.id.clone());
                    if let Err(e) = self.bus.publish_outbound(ctx, reply).await {
                        warn!(session_key = %session_key, error = %e, "reply publish failed");
                    }
                    return Ok(());
                }
                Err(e) if is_context_overflow(&e.to_string()) && !compressed => {
                    let dropped = self.sessions.compress(session_key, COMPRESS_KEEP_USERS);
                    info!(
                        session_key = %session_key,
                        dropped,
                        "context overflow, compressed and retrying"
                    );
                    compressed = true;
                }
                Err(e) => {
                    error!(session_key = %session_key, error = %e, "turn failed");
                    self.publish_error(ctx, &origin.channel, &origin.chat_id, &e.to_string())
                        .await;
                    return Err(e);
                }
            }
        }
    }

    fn build_request(
        &self,
        agent: &ResolvedAgent,
        session_key: &str,
        origin: &InboundMessage,
        prompt: &str,
    ) -> RunRequest {
        let mut metadata = HashMap::new();
        for (key, value) in [
            ("session_key", session_key),
            ("agent_id", agent.id.as_str()),
            ("channel", origin.channel.as_str()),
            ("account_id", origin.account_id.as_str()),
            ("chat_id", origin.chat_id.as_str()),
        ] {
            metadata.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        }

        RunRequest {
            agent_id: agent.id.clone(),
            session_key: session_key.to_string(),
            prompt: prompt.to_string(),
            system_prompt: agent.system_prompt.clone(),
            workspace: agent.workspace.clone(),
            media: origin.media.clone(),
            metadata,
            tool_whitelist: None,
        }
    }

    /// Prefix queued steering notes onto the prompt.
    fn prompt_with_steering(&self, session_key: &str, content: &str) -> String {
        let notes = self
            .sessions
            .with_state(session_key, |state| state.drain_steering());
        if notes.is_empty() {
            content.to_string()
        } else {
            let mut prompt = String::from("[steering]\n");
            for note in notes {
                prompt.push_str("- ");
                prompt.push_str(&note);
                prompt.push('\n');
            }
            prompt.push('\n');
            prompt.push_str(content);
            prompt
        }
    }

    async fn publish_error(
        &self,
        ctx: &CancellationToken,
        channel: &str,
        chat_id: &str,
        error_text: &str,
    ) {
        let msg = OutboundMessage::new(channel, chat_id, user_facing_message(error_text));
        if let Err(e) = self.bus.publish_outbound(ctx, msg).await {
            error!(error = %e, "error message publish failed");
        }
    }

    // ─────────────────────────────────────────
    // Agent resolution
    // ─────────────────────────────────────────

    fn resolve_agent(&self, channel: &str, account_id: &str) -> Option<ResolvedAgent> {
        let binding = format!("{channel}:{account_id}");
        if let Some(agent_id) = self.bindings.get(&binding) {
            if let Some(agent) = self.agents.get(agent_id) {
                return Some(agent.clone());
            }
        }
        self.default_agent
            .as_ref()
            .and_then(|id| self.agents.get(id))
            .cloned()
    }

    /// Queue a steering note for a session's next turn.
    pub fn queue_steering(&self, session_key: &str, note: impl Into<String>) {
        let note = note.into();
        self.sessions
            .with_state(session_key, |state| state.push_steering(note));
    }

    /// Queue a follow-up processed after the session's current turn.
    pub fn queue_followup(&self, session_key: &str, text: impl Into<String>) {
        let text = text.into();
        self.sessions
            .with_state(session_key, |state| state.push_followup(text));
    }

    // ─────────────────────────────────────────
    // Spawn tool handler
    // ─────────────────────────────────────────

    /// Handle the model's sub-agent spawn tool call.
    ///
    /// Always returns a tool-result string: a confirmation on success, a
    /// structured error (never a turn abort) on failure.
    pub async fn handle_spawn_tool(
        &self,
        ctx: &CancellationToken,
        requester_session_key: &str,
        origin: &InboundMessage,
        args: serde_json::Value,
    ) -> String {
        let Some(task) = args.get("task").and_then(|t| t.as_str()) else {
            return structured_tool_failure("spawn_subagent", "missing required parameter: task");
        };
        let Some(agent) = self.resolve_agent(&origin.channel, &origin.account_id) else {
            return structured_tool_failure("spawn_subagent", "no agent bound for this origin");
        };

        let cleanup = match args.get("cleanup").and_then(|c| c.as_str()) {
            Some("keep") => CleanupPolicy::Keep,
            _ => CleanupPolicy::Delete,
        };

        let params = SpawnParams {
            task: task.to_string(),
            label: args
                .get("label")
                .and_then(|l| l.as_str())
                .map(|l| l.to_string()),
            role: args
                .get("role")
                .and_then(|r| r.as_str())
                .map(|r| r.to_string()),
            requester_session_key: requester_session_key.to_string(),
            requester_origin: crate::registry::RequesterOrigin {
                channel: origin.channel.clone(),
                account_id: origin.account_id.clone(),
                to: origin.chat_id.clone(),
                thread: origin
                    .metadata
                    .get("thread")
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string()),
            },
            workspace: agent.workspace.clone(),
            task_id: args
                .get("task_id")
                .and_then(|t| t.as_str())
                .map(|t| t.to_string()),
            cleanup,
            timeout_seconds: args.get("timeout_seconds").and_then(|t| t.as_u64()),
            mcp_config_path: args
                .get("mcp_config_path")
                .and_then(|p| p.as_str())
                .map(|p| p.to_string()),
        };

        match self.orchestrator.spawn(ctx, params).await {
            Ok(run_id) => format!(
                "Sub-agent started (run {run_id}). The result will be announced here when it completes."
            ),
            Err(e) => structured_tool_failure("spawn_subagent", &e.to_string()),
        }
    }
}

// ─────────────────────────────────────────────
// Trait impls
// ─────────────────────────────────────────────

#[async_trait]
impl InboundRouter for AgentManager {
    async fn route_inbound(
        &self,
        ctx: &CancellationToken,
        session_key: &str,
        msg: InboundMessage,
    ) {
        self.route(ctx, session_key, msg).await;
    }
}

#[async_trait]
impl ApproverRuntime for AgentManager {
    fn resolve_approver(&self, channel: &str, account_id: &str) -> Option<String> {
        let binding = format!("{channel}:{account_id}");
        if let Some(agent_id) = self.bindings.get(&binding) {
            if self.agents.contains_key(agent_id) {
                return Some(agent_id.clone());
            }
        }
        if let Some(agent_id) = &self.default_agent {
            if self.agents.contains_key(agent_id) {
                return Some(agent_id.clone());
            }
        }
        let mut ids: Vec<&String> = self.agents.keys().collect();
        ids.sort();
        ids.first().map(|id| id.to_string())
    }

    async fn run_approval_turn(
        &self,
        ctx: &CancellationToken,
        agent_id: &str,
        prompt: String,
    ) -> anyhow::Result<String> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| anyhow::anyhow!("unknown approver agent {agent_id}"))?;

        let lease = self.cache.acquire(ctx, agent_id, agent.fingerprint()).await?;
        let request = RunRequest {
            agent_id: agent_id.to_string(),
            session_key: format!("approval:{agent_id}"),
            prompt,
            system_prompt: agent.system_prompt.clone(),
            workspace: agent.workspace.clone(),
            tool_whitelist: Some(vec![TOOLS_DISABLED_SENTINEL.to_string()]),
            ..Default::default()
        };
        let result = lease.handle().run(ctx, request).await;
        self.cache.release(lease).await;
        Ok(result?.output)
    }
}

// ─────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────

/// Content blocks for an inbound message: text plus any image attachments.
fn message_blocks(msg: &InboundMessage) -> Vec<ContentBlock> {
    let mut blocks = vec![ContentBlock::text(&msg.content)];
    for media in &msg.media {
        let is_image = media.media_type == "image"
            || media
                .mime
                .as_deref()
                .map(|m| m.starts_with("image/"))
                .unwrap_or(false);
        if is_image {
            blocks.push(ContentBlock::Image {
                url: media.url.clone(),
                base64: media.base64.clone(),
                mime: media.mime.clone(),
            });
        }
    }
    blocks
}

fn announce_text(record: &SubagentRunRecord) -> String {
    let label = &record.label;
    match &record.outcome {
        Some(RunOutcome {
            status: RunStatus::Ok,
            result,
            ..
        }) => format!(
            "Sub-agent [{label}] finished:\n{}",
            result.as_deref().unwrap_or("(no output)")
        ),
        Some(RunOutcome {
            status: RunStatus::Timeout,
            ..
        }) => format!(
            "Sub-agent [{label}] timed out after {}s.",
            record.timeout_seconds
        ),
        Some(outcome) => format!(
            "Sub-agent [{label}] failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
        None => format!("Sub-agent [{label}] ended without an outcome."),
    }
}

/// Render a tool failure as a structured result the model can read,
/// instead of aborting the turn.
pub fn structured_tool_failure(tool: &str, error: &str) -> String {
    let suggestion = match tool {
        "spawn_subagent" => "check that the sub-agent runtime is configured and the workspace exists",
        "exec" => "check the command syntax and working directory",
        "read_file" | "write_file" | "edit_file" => "verify the path exists inside the workspace",
        "web_fetch" | "web_search" => "check the URL or query and retry",
        _ => "adjust the parameters and retry",
    };
    serde_json::json!({
        "status": "error",
        "tool": tool,
        "error": error,
        "suggestion": suggestion,
    })
    .to_string()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
