//! Sub-agent orchestrator — builds the run request, spawns the child
//! runtime, and applies the outcome to the registry and task tracker.
//!
//! The orchestrator never announces results itself; the registry's
//! completion callback (installed by the manager) owns that, gated by the
//! begin-cleanup latch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use swarmbot_core::config::schema::SubagentsConfig;
use swarmbot_core::session::key::resolve_session_key;
use swarmbot_core::utils::truncate_string;
use swarmbot_runtime::{
    RunStatus, SpawnRequest, SubagentRuntime, TaskProgress, TaskStatus, TaskTracker, WaitOutcome,
};

use crate::registry::{
    CleanupPolicy, RegisterRun, RequesterOrigin, RunOutcome, SubagentRegistry,
};

/// Slack added on top of the child's own timeout before the waiter gives up.
const WAIT_GRACE: Duration = Duration::from_secs(30);

/// Maximum label length derived from the task text.
const LABEL_MAX_CHARS: usize = 30;

// ─────────────────────────────────────────────
// Spawn parameters
// ─────────────────────────────────────────────

/// What the spawn handler needs to start a child run.
#[derive(Clone, Debug, Default)]
pub struct SpawnParams {
    pub task: String,
    pub label: Option<String>,
    pub role: Option<String>,
    pub requester_session_key: String,
    pub requester_origin: RequesterOrigin,
    /// The requesting agent's workspace root.
    pub workspace: PathBuf,
    pub task_id: Option<String>,
    pub cleanup: CleanupPolicy,
    pub timeout_seconds: Option<u64>,
    pub mcp_config_path: Option<String>,
}

// ─────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────

/// Spawns child runs and tracks them to completion.
pub struct SubagentOrchestrator {
    registry: Arc<SubagentRegistry>,
    runtime: Arc<dyn SubagentRuntime>,
    tracker: Option<Arc<dyn TaskTracker>>,
    config: SubagentsConfig,
    /// Waiters outlive the request that spawned them; this token stops
    /// them at orchestrator shutdown.
    lifecycle: CancellationToken,
    /// Self-handle for waiter tasks.
    weak_self: std::sync::Weak<SubagentOrchestrator>,
}

impl SubagentOrchestrator {
    pub fn new(
        registry: Arc<SubagentRegistry>,
        runtime: Arc<dyn SubagentRuntime>,
        tracker: Option<Arc<dyn TaskTracker>>,
        config: SubagentsConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| SubagentOrchestrator {
            registry,
            runtime,
            tracker,
            config,
            lifecycle: CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Register and spawn a child run, then watch it in the background.
    ///
    /// Returns the run id. A spawn failure is recorded in the registry
    /// before the error is returned.
    pub async fn spawn(&self, ctx: &CancellationToken, params: SpawnParams) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let role = params
            .role
            .clone()
            .unwrap_or_else(|| resolve_role(&params.task, params.label.as_deref()));
        let label = params
            .label
            .clone()
            .unwrap_or_else(|| truncate_string(&params.task, LABEL_MAX_CHARS));
        let timeout_seconds = params
            .timeout_seconds
            .unwrap_or(self.config.timeout_seconds);

        let workdir = params
            .workspace
            .join(&self.config.workdir_base)
            .join(&run_id);
        let repo_dir = workdir.join("repo");
        let skills_dir = params.workspace.join(&self.config.skills_role_dir).join(&role);

        let child_session_key = resolve_session_key("subagent", &role, &run_id, false);

        self.registry.register_run(RegisterRun {
            run_id: run_id.clone(),
            child_session_key,
            requester_session_key: params.requester_session_key.clone(),
            requester_origin: params.requester_origin.clone(),
            task: params.task.clone(),
            task_id: params.task_id.clone(),
            mcp_config_path: params.mcp_config_path.clone(),
            cleanup: params.cleanup,
            label: label.clone(),
            timeout_seconds,
            archive_after_minutes: self.config.archive_after_minutes,
        });

        let request = SpawnRequest {
            run_id: run_id.clone(),
            task: params.task.clone(),
            role: role.clone(),
            repo_dir,
            workdir,
            skills_dir,
            system_prompt: build_subagent_prompt(&params.task, &role),
            timeout_seconds,
            mcp_config_path: params.mcp_config_path.clone(),
        };

        if let Err(e) = self.runtime.spawn(ctx, request).await {
            error!(run_id = %run_id, error = %e, "sub-agent spawn failed");
            let _ = self.registry.mark_completed(
                &run_id,
                RunOutcome {
                    status: RunStatus::Error,
                    error: Some(e.to_string()),
                    result: None,
                },
                chrono::Utc::now(),
            );
            return Err(e);
        }

        info!(run_id = %run_id, role = %role, label = %label, "sub-agent spawned");

        if let (Some(tracker), Some(task_id)) = (&self.tracker, &params.task_id) {
            if let Err(e) = tracker.link_subagent_run(&run_id, task_id).await {
                warn!(run_id = %run_id, error = %e, "task link failed");
            }
            if let Err(e) = tracker.update_task_status(task_id, TaskStatus::InProgress).await {
                warn!(task_id = %task_id, error = %e, "task status update failed");
            }
        }

        self.watch(run_id.clone(), timeout_seconds);
        Ok(run_id)
    }

    /// Stop all waiters. Idempotent.
    pub fn shutdown(&self) {
        self.lifecycle.cancel();
    }

    /// Spawn the waiter task for a run.
    fn watch(&self, run_id: String, timeout_seconds: u64) {
        let Some(orchestrator) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = orchestrator.await_outcome(&run_id, timeout_seconds).await;
            orchestrator.apply_outcome(&run_id, outcome).await;
        });
    }

    /// Wait for the child, bounding it by its timeout plus grace.
    async fn await_outcome(&self, run_id: &str, timeout_seconds: u64) -> RunOutcome {
        let deadline = Duration::from_secs(timeout_seconds) + WAIT_GRACE;
        let wait = self.runtime.wait(&self.lifecycle, run_id);

        match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(outcome)) => outcome_from_wait(outcome),
            Ok(Err(e)) => RunOutcome {
                status: RunStatus::Error,
                error: Some(e.to_string()),
                result: None,
            },
            Err(_) => RunOutcome {
                status: RunStatus::Timeout,
                error: Some(format!("no result within {timeout_seconds}s")),
                result: None,
            },
        }
    }

    /// Record the outcome and update the linked task, if any.
    async fn apply_outcome(&self, run_id: &str, outcome: RunOutcome) {
        let status = outcome.status;
        let message = outcome
            .result
            .clone()
            .or_else(|| outcome.error.clone())
            .unwrap_or_default();

        if let Err(e) = self
            .registry
            .mark_completed(run_id, outcome, chrono::Utc::now())
        {
            error!(run_id = %run_id, error = %e, "failed to record sub-agent outcome");
            return;
        }

        let Some(tracker) = &self.tracker else {
            return;
        };
        let Some(task_id) = tracker.resolve_task_by_run(run_id).await else {
            return;
        };

        let task_status = match status {
            RunStatus::Ok => TaskStatus::Completed,
            _ => TaskStatus::Blocked,
        };
        if let Err(e) = tracker.update_task_status(&task_id, task_status).await {
            warn!(task_id = %task_id, error = %e, "task status update failed");
        }
        let progress = TaskProgress {
            task_id: task_id.clone(),
            run_id: run_id.to_string(),
            status: status_label(status).to_string(),
            message: truncate_string(&message, 400),
        };
        if let Err(e) = tracker.append_task_progress(progress).await {
            warn!(task_id = %task_id, error = %e, "task progress append failed");
        }
    }
}

fn outcome_from_wait(outcome: WaitOutcome) -> RunOutcome {
    RunOutcome {
        status: outcome.status,
        error: outcome.error_msg,
        result: if outcome.output.is_empty() {
            None
        } else {
            Some(outcome.output)
        },
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Ok => "ok",
        RunStatus::Error => "error",
        RunStatus::Timeout => "timeout",
        RunStatus::Unknown => "unknown",
    }
}

/// Guess a role from the task and label text.
pub fn resolve_role(task: &str, label: Option<&str>) -> String {
    let haystack = format!("{} {}", label.unwrap_or(""), task).to_lowercase();
    let frontend = ["frontend", "front-end", "ui", "css", "react", "layout"];
    let backend = ["backend", "back-end", "api", "server", "database", "sql"];
    if frontend.iter().any(|w| haystack.contains(w)) {
        "frontend".to_string()
    } else if backend.iter().any(|w| haystack.contains(w)) {
        "backend".to_string()
    } else {
        "generalist".to_string()
    }
}

/// Build the child's system prompt.
fn build_subagent_prompt(task: &str, role: &str) -> String {
    format!(
        "# Sub-agent ({role})\n\
         You were spawned by the main agent to complete one bounded task.\n\n\
         ## Your Task\n\
         {task}\n\n\
         ## Rules\n\
         1. Stay focused — complete only the assigned task\n\
         2. Your final response is reported back to the main agent\n\
         3. Do not initiate conversations or take on side tasks\n\
         4. Be concise but informative\n\n\
         ## Limits\n\
         - You cannot message users directly\n\
         - You cannot spawn further sub-agents\n\
         - Tool calls outside your sandbox rules require approval"
    )
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use swarmbot_runtime::PermissionDeciderFn;
    use tempfile::tempdir;

    struct ScriptedSubagentRuntime {
        spawn_error: Option<String>,
        wait_result: Mutex<Option<anyhow::Result<WaitOutcome>>>,
        spawned: Mutex<Vec<SpawnRequest>>,
    }

    impl ScriptedSubagentRuntime {
        fn ok(output: &str) -> Arc<Self> {
            Arc::new(Self {
                spawn_error: None,
                wait_result: Mutex::new(Some(Ok(WaitOutcome {
                    status: RunStatus::Ok,
                    output: output.into(),
                    error_msg: None,
                }))),
                spawned: Mutex::new(Vec::new()),
            })
        }

        fn with_wait(result: anyhow::Result<WaitOutcome>) -> Arc<Self> {
            Arc::new(Self {
                spawn_error: None,
                wait_result: Mutex::new(Some(result)),
                spawned: Mutex::new(Vec::new()),
            })
        }

        fn failing_spawn(message: &str) -> Arc<Self> {
            Arc::new(Self {
                spawn_error: Some(message.into()),
                wait_result: Mutex::new(None),
                spawned: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SubagentRuntime for ScriptedSubagentRuntime {
        async fn spawn(
            &self,
            _ctx: &CancellationToken,
            req: SpawnRequest,
        ) -> anyhow::Result<String> {
            if let Some(message) = &self.spawn_error {
                anyhow::bail!("{message}");
            }
            let run_id = req.run_id.clone();
            self.spawned.lock().unwrap().push(req);
            Ok(run_id)
        }

        async fn wait(
            &self,
            _ctx: &CancellationToken,
            _run_id: &str,
        ) -> anyhow::Result<WaitOutcome> {
            self.wait_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(WaitOutcome::default()))
        }

        fn set_permission_decider(&self, _decider: PermissionDeciderFn) {}
    }

    #[derive(Default)]
    struct RecordingTracker {
        links: Mutex<Vec<(String, String)>>,
        statuses: Mutex<Vec<(String, TaskStatus)>>,
        progress: Mutex<Vec<TaskProgress>>,
    }

    #[async_trait]
    impl TaskTracker for RecordingTracker {
        async fn link_subagent_run(&self, run_id: &str, task_id: &str) -> anyhow::Result<()> {
            self.links
                .lock()
                .unwrap()
                .push((run_id.into(), task_id.into()));
            Ok(())
        }

        async fn resolve_task_by_run(&self, run_id: &str) -> Option<String> {
            self.links
                .lock()
                .unwrap()
                .iter()
                .find(|(r, _)| r == run_id)
                .map(|(_, t)| t.clone())
        }

        async fn update_task_status(
            &self,
            task_id: &str,
            status: TaskStatus,
        ) -> anyhow::Result<()> {
            self.statuses
                .lock()
                .unwrap()
                .push((task_id.into(), status));
            Ok(())
        }

        async fn append_task_progress(&self, entry: TaskProgress) -> anyhow::Result<()> {
            self.progress.lock().unwrap().push(entry);
            Ok(())
        }
    }

    fn spawn_params(workspace: &std::path::Path) -> SpawnParams {
        SpawnParams {
            task: "count all files in the repo".into(),
            requester_session_key: "telegram:bot1:c1".into(),
            requester_origin: RequesterOrigin {
                channel: "telegram".into(),
                account_id: "bot1".into(),
                to: "c1".into(),
                thread: None,
            },
            workspace: workspace.to_path_buf(),
            ..Default::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_spawn_registers_and_completes() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        let runtime = ScriptedSubagentRuntime::ok("42 files");
        let orchestrator = SubagentOrchestrator::new(
            registry.clone(),
            runtime.clone(),
            None,
            SubagentsConfig::default(),
        );

        let run_id = orchestrator
            .spawn(&CancellationToken::new(), spawn_params(dir.path()))
            .await
            .unwrap();

        settle().await;
        let record = registry.get(&run_id).unwrap();
        assert!(record.ended_at.is_some());
        let outcome = record.outcome.unwrap();
        assert_eq!(outcome.status, RunStatus::Ok);
        assert_eq!(outcome.result.as_deref(), Some("42 files"));
    }

    #[tokio::test]
    async fn test_spawn_request_paths() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        let runtime = ScriptedSubagentRuntime::ok("done");
        let orchestrator = SubagentOrchestrator::new(
            registry,
            runtime.clone(),
            None,
            SubagentsConfig::default(),
        );

        let mut params = spawn_params(dir.path());
        params.task = "fix the backend api endpoint".into();
        let run_id = orchestrator
            .spawn(&CancellationToken::new(), params)
            .await
            .unwrap();

        let spawned = runtime.spawned.lock().unwrap();
        let req = &spawned[0];
        assert_eq!(req.role, "backend");
        assert_eq!(
            req.workdir,
            dir.path().join("subagents").join(&run_id)
        );
        assert_eq!(req.repo_dir, req.workdir.join("repo"));
        assert_eq!(req.skills_dir, dir.path().join("skills").join("backend"));
        assert_eq!(req.timeout_seconds, 900);
        assert!(req.system_prompt.contains("fix the backend api endpoint"));
    }

    #[tokio::test]
    async fn test_spawn_failure_recorded() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        let runtime = ScriptedSubagentRuntime::failing_spawn("no container");
        let orchestrator = SubagentOrchestrator::new(
            registry.clone(),
            runtime,
            None,
            SubagentsConfig::default(),
        );

        let err = orchestrator
            .spawn(&CancellationToken::new(), spawn_params(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no container"));

        let record = &registry.list()[0];
        let outcome = record.outcome.as_ref().unwrap();
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.as_ref().unwrap().contains("no container"));
    }

    #[tokio::test]
    async fn test_ok_outcome_completes_linked_task() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        let runtime = ScriptedSubagentRuntime::ok("all good");
        let tracker = Arc::new(RecordingTracker::default());
        let orchestrator = SubagentOrchestrator::new(
            registry,
            runtime,
            Some(tracker.clone()),
            SubagentsConfig::default(),
        );

        let mut params = spawn_params(dir.path());
        params.task_id = Some("task-9".into());
        let run_id = orchestrator
            .spawn(&CancellationToken::new(), params)
            .await
            .unwrap();

        settle().await;
        assert_eq!(
            tracker.links.lock().unwrap()[0],
            (run_id.clone(), "task-9".to_string())
        );
        let statuses = tracker.statuses.lock().unwrap();
        assert_eq!(statuses[0].1, TaskStatus::InProgress);
        assert_eq!(statuses[1].1, TaskStatus::Completed);
        let progress = tracker.progress.lock().unwrap();
        assert_eq!(progress[0].status, "ok");
        assert_eq!(progress[0].message, "all good");
    }

    #[tokio::test]
    async fn test_timeout_outcome_blocks_linked_task() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        let runtime = ScriptedSubagentRuntime::with_wait(Ok(WaitOutcome {
            status: RunStatus::Timeout,
            output: String::new(),
            error_msg: Some("deadline exceeded".into()),
        }));
        let tracker = Arc::new(RecordingTracker::default());
        let orchestrator = SubagentOrchestrator::new(
            registry.clone(),
            runtime,
            Some(tracker.clone()),
            SubagentsConfig::default(),
        );

        let mut params = spawn_params(dir.path());
        params.task_id = Some("task-1".into());
        let run_id = orchestrator
            .spawn(&CancellationToken::new(), params)
            .await
            .unwrap();

        settle().await;
        let record = registry.get(&run_id).unwrap();
        assert_eq!(record.outcome.unwrap().status, RunStatus::Timeout);

        let statuses = tracker.statuses.lock().unwrap();
        assert_eq!(statuses.last().unwrap().1, TaskStatus::Blocked);
        let progress = tracker.progress.lock().unwrap();
        assert_eq!(progress[0].status, "timeout");
    }

    #[tokio::test]
    async fn test_wait_error_becomes_error_outcome() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        let runtime =
            ScriptedSubagentRuntime::with_wait(Err(anyhow::anyhow!("channel torn down")));
        let orchestrator = SubagentOrchestrator::new(
            registry.clone(),
            runtime,
            None,
            SubagentsConfig::default(),
        );

        let run_id = orchestrator
            .spawn(&CancellationToken::new(), spawn_params(dir.path()))
            .await
            .unwrap();

        settle().await;
        let outcome = registry.get(&run_id).unwrap().outcome.unwrap();
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.unwrap().contains("channel torn down"));
    }

    #[test]
    fn test_resolve_role() {
        assert_eq!(resolve_role("polish the css on the landing page", None), "frontend");
        assert_eq!(resolve_role("add a database migration", None), "backend");
        assert_eq!(resolve_role("summarize this paper", None), "generalist");
        assert_eq!(resolve_role("do the thing", Some("ui tweak")), "frontend");
    }

    #[test]
    fn test_default_label_truncated() {
        let long = "a task description that is well over thirty characters long";
        let label = truncate_string(long, LABEL_MAX_CHARS);
        assert_eq!(label.chars().count(), LABEL_MAX_CHARS);
        assert!(label.ends_with('…'));
    }
}
