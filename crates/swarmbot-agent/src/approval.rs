//! Approval pipeline — delegates a sub-agent's permission ask to the main
//! agent and parses its structured decision.
//!
//! The approver is asked through a one-shot main-runtime turn with tools
//! disabled. Anything short of a clear "allow" — unreachable approver,
//! unparseable output, ambiguity — resolves to Deny.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use swarmbot_core::errors::KernelError;
use swarmbot_runtime::{PermissionDecision, PermissionRequest};

use crate::registry::RequesterOrigin;

/// Whitelist entry that matches no real tool, disabling tools for the
/// approval turn.
pub const TOOLS_DISABLED_SENTINEL: &str = "__approval_only__";

/// The manager-side surface the pipeline needs: approver lookup and a
/// one-shot tools-disabled turn.
#[async_trait]
pub trait ApproverRuntime: Send + Sync {
    /// Resolve the approver agent for a requester:
    /// binding match → default agent → any configured agent → `None`.
    fn resolve_approver(&self, channel: &str, account_id: &str) -> Option<String>;

    /// Run a single turn against the agent's main runtime with the tool
    /// whitelist set to `TOOLS_DISABLED_SENTINEL`.
    async fn run_approval_turn(
        &self,
        ctx: &CancellationToken,
        agent_id: &str,
        prompt: String,
    ) -> anyhow::Result<String>;
}

/// Decides sub-agent permission asks by consulting the main agent.
pub struct ApprovalPipeline {
    runtime: Arc<dyn ApproverRuntime>,
}

impl ApprovalPipeline {
    pub fn new(runtime: Arc<dyn ApproverRuntime>) -> Self {
        ApprovalPipeline { runtime }
    }

    /// Resolve an approver and ask it to rule on the request.
    ///
    /// Returns the decision and the reason recorded for it.
    pub async fn decide(
        &self,
        ctx: &CancellationToken,
        req: &PermissionRequest,
        origin: &RequesterOrigin,
    ) -> (PermissionDecision, String) {
        let approver = match self
            .runtime
            .resolve_approver(&origin.channel, &origin.account_id)
        {
            Some(agent_id) => agent_id,
            None => {
                warn!(run_id = %req.run_id, tool = %req.tool_name, "no approver agent, denying");
                return (PermissionDecision::Deny, "no approver agent configured".into());
            }
        };

        let prompt = build_approval_prompt(req);
        let output = match self.runtime.run_approval_turn(ctx, &approver, prompt).await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    run_id = %req.run_id,
                    approver = %approver,
                    error = %e,
                    "approver unreachable, denying"
                );
                let reason = KernelError::ApprovalUnreachable(e.to_string()).to_string();
                return (PermissionDecision::Deny, reason);
            }
        };

        match parse_decision(&output) {
            Some((decision, reason)) => {
                let reason = reason.unwrap_or_else(|| "no reason given".into());
                info!(
                    run_id = %req.run_id,
                    tool = %req.tool_name,
                    decision = ?decision,
                    reason = %reason,
                    "approval decided"
                );
                (decision, reason)
            }
            None => {
                warn!(run_id = %req.run_id, tool = %req.tool_name, "unparseable approver output, denying");
                (PermissionDecision::Deny, "unparseable approver output".into())
            }
        }
    }
}

/// Build the structured prompt shown to the approver agent.
fn build_approval_prompt(req: &PermissionRequest) -> String {
    let params = serde_json::to_string_pretty(&req.parameters)
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        "A sub-agent you delegated work to wants to use a tool that needs \
         your approval.\n\n\
         - run_id: {run_id}\n\
         - role: {role}\n\
         - task: {task}\n\
         - repo_dir: {repo}\n\
         - tool: {tool}\n\
         - rule: {rule}\n\
         - target: {target}\n\
         - reason: {reason}\n\n\
         Tool parameters:\n\
         ```json\n{params}\n```\n\n\
         Reply with exactly one JSON object: \
         {{\"decision\": \"allow\" | \"deny\", \"reason\": \"...\"}}",
        run_id = req.run_id,
        role = req.role,
        task = req.task,
        repo = req.repo_dir,
        tool = req.tool_name,
        rule = req.rule,
        target = req.target,
        reason = req.reason,
    )
}

// ─────────────────────────────────────────────
// Decision parsing
// ─────────────────────────────────────────────

/// Parse the approver's reply.
///
/// Tries, in order: a JSON object (after stripping code fences, the
/// outermost `{...}`), then keyword heuristics. Returns `None` when the
/// output is ambiguous — the caller treats that as Deny.
pub fn parse_decision(text: &str) -> Option<(PermissionDecision, Option<String>)> {
    let stripped = strip_code_fences(text);

    if let Some(json) = extract_json_object(&stripped) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
            let reason = value
                .get("reason")
                .and_then(|r| r.as_str())
                .map(|r| r.to_string());
            if let Some(word) = value.get("decision").and_then(|d| d.as_str()) {
                if let Some(decision) = decision_from_word(word) {
                    return Some((decision, reason));
                }
            }
        }
    }

    keyword_heuristic(&stripped).map(|decision| (decision, None))
}

/// Drop fence marker lines so the JSON inside survives.
fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The outermost `{...}` span, if any.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

fn decision_from_word(word: &str) -> Option<PermissionDecision> {
    match word.trim().to_lowercase().as_str() {
        "allow" | "allowed" | "approve" | "approved" | "accept" | "accepted" | "permit"
        | "permitted" | "yes" | "y" | "ok" => Some(PermissionDecision::Allow),
        "deny" | "denied" | "reject" | "rejected" | "refuse" | "refused" | "block"
        | "blocked" | "disallow" | "no" | "n" => Some(PermissionDecision::Deny),
        _ => None,
    }
}

/// Last-resort keyword scan. Deny phrases win; ambiguity yields `None`.
fn keyword_heuristic(text: &str) -> Option<PermissionDecision> {
    let lower = text.to_lowercase();
    let denies = ["deny", "denied", "reject", "not allow", "don't allow", "do not allow", "block this", "refuse"];
    if denies.iter().any(|p| lower.contains(p)) {
        return Some(PermissionDecision::Deny);
    }
    let allows = ["allow", "approve", "approved", "go ahead", "yes"];
    if allows.iter().any(|p| lower.contains(p)) {
        return Some(PermissionDecision::Allow);
    }
    None
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
