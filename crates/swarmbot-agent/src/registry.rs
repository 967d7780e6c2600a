//! Sub-agent run registry — the persistent map of in-flight child runs.
//!
//! Records journal to a single JSON document so a restart can see what was
//! running, but the in-memory map is the source of truth while the process
//! lives: disk write failures are logged and never fail the operation.
//!
//! A sweeper task deletes records past their archive deadline on a 60 s
//! tick; it starts with the first archivable record and stops itself once
//! nothing is left to archive.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use swarmbot_core::errors::KernelError;
use swarmbot_core::utils::now_ms;
use swarmbot_runtime::RunStatus;

/// Sweeper tick interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// File name of the journal inside the data directory.
pub const REGISTRY_FILE: &str = "subagent_registry.json";

// ─────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────

/// Where the requester's conversation lives, for announcing results.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequesterOrigin {
    pub channel: String,
    pub account_id: String,
    /// Chat the announcement goes to.
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

/// What to do with a record once its result has been announced.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    #[default]
    Delete,
    Keep,
}

/// Terminal outcome of a child run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// One in-flight (or recently finished) child run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRunRecord {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_origin: RequesterOrigin,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config_path: Option<String>,
    pub cleanup: CleanupPolicy,
    pub label: String,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    /// Absolute archive deadline in epoch millis; 0 means never.
    #[serde(default)]
    pub archive_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cleanup_handled: bool,
}

/// Parameters for `register_run`.
#[derive(Clone, Debug, Default)]
pub struct RegisterRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_origin: RequesterOrigin,
    pub task: String,
    pub task_id: Option<String>,
    pub mcp_config_path: Option<String>,
    pub cleanup: CleanupPolicy,
    pub label: String,
    pub timeout_seconds: u64,
    /// Minutes until the record may be swept; `None` or non-positive
    /// disables archiving.
    pub archive_after_minutes: Option<i64>,
}

/// Async callback fired (off the registry lock) when a run completes.
pub type CompletionCallback = Arc<
    dyn Fn(SubagentRunRecord) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

// ─────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────

struct RegistryInner {
    records: HashMap<String, SubagentRunRecord>,
    sweeper_running: bool,
}

/// Persistent map of child runs, with a TTL sweeper and completion callback.
pub struct SubagentRegistry {
    inner: Mutex<RegistryInner>,
    path: PathBuf,
    on_complete: RwLock<Option<CompletionCallback>>,
    stop: CancellationToken,
    /// Self-handle for the sweeper task.
    weak_self: std::sync::Weak<SubagentRegistry>,
}

impl SubagentRegistry {
    /// Open (or create) the registry journaled at `data_dir/subagent_registry.json`.
    ///
    /// An unreadable or corrupt journal starts the registry empty.
    pub fn new(data_dir: impl Into<PathBuf>) -> Arc<Self> {
        let path = data_dir.into().join(REGISTRY_FILE);
        let records = load_journal(&path);
        if !records.is_empty() {
            info!(count = records.len(), "loaded sub-agent registry");
        }
        Arc::new_cyclic(|weak_self| SubagentRegistry {
            inner: Mutex::new(RegistryInner {
                records,
                sweeper_running: false,
            }),
            path,
            on_complete: RwLock::new(None),
            stop: CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Install the completion callback. Replaces any previous one.
    pub fn set_on_complete(&self, callback: CompletionCallback) {
        *self.on_complete.write().unwrap() = Some(callback);
    }

    /// Register a new run and start the sweeper if it now has work.
    pub fn register_run(&self, params: RegisterRun) -> SubagentRunRecord {
        let now = Utc::now();
        let archive_at_ms = match params.archive_after_minutes {
            Some(mins) if mins > 0 => now_ms() + mins * 60_000,
            _ => 0,
        };
        let record = SubagentRunRecord {
            run_id: params.run_id,
            child_session_key: params.child_session_key,
            requester_session_key: params.requester_session_key,
            requester_origin: params.requester_origin,
            task: params.task,
            task_id: params.task_id,
            mcp_config_path: params.mcp_config_path,
            cleanup: params.cleanup,
            label: params.label,
            timeout_seconds: params.timeout_seconds,
            created_at: now,
            started_at: Some(now),
            ended_at: None,
            outcome: None,
            archive_at_ms,
            cleanup_completed_at: None,
            cleanup_handled: false,
        };

        let needs_sweeper = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .records
                .insert(record.run_id.clone(), record.clone());
            self.save_locked(&inner);
            archive_at_ms > 0 && !inner.sweeper_running
        };
        if needs_sweeper {
            self.start_sweeper();
        }

        debug!(run_id = %record.run_id, label = %record.label, "registered sub-agent run");
        record
    }

    /// Attach the outcome to a run and fire the completion callback.
    ///
    /// The callback runs on its own task so the caller is never blocked.
    pub fn mark_completed(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        ended_at: DateTime<Utc>,
    ) -> Result<SubagentRunRecord, KernelError> {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            let record = inner
                .records
                .get_mut(run_id)
                .ok_or_else(|| KernelError::NotFound(format!("run {run_id}")))?;
            record.ended_at = Some(ended_at);
            record.outcome = Some(outcome);
            let record = record.clone();
            self.save_locked(&inner);
            record
        };

        info!(
            run_id = %run_id,
            status = ?record.outcome.as_ref().map(|o| o.status),
            "sub-agent run completed"
        );

        if let Some(callback) = self.on_complete.read().unwrap().clone() {
            let snapshot = record.clone();
            tokio::spawn(callback(snapshot));
        }
        Ok(record)
    }

    /// Single-shot latch gating the announce step.
    ///
    /// Returns `true` exactly once per record (until `cleanup` resets it
    /// for a retry), so the result is announced at most once.
    pub fn begin_cleanup(&self, run_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let won = match inner.records.get_mut(run_id) {
            Some(record) if !record.cleanup_handled => {
                record.cleanup_handled = true;
                true
            }
            _ => false,
        };
        if won {
            self.save_locked(&inner);
        }
        won
    }

    /// Finalize a record after the announce attempt.
    ///
    /// A failed announce (`did_announce == false`) re-opens the latch so a
    /// later attempt can retry. Otherwise the record is deleted or stamped
    /// per its cleanup policy.
    pub fn cleanup(&self, run_id: &str, policy: CleanupPolicy, did_announce: bool) {
        let mut inner = self.inner.lock().unwrap();
        if !did_announce {
            if let Some(record) = inner.records.get_mut(run_id) {
                record.cleanup_handled = false;
            }
        } else if policy == CleanupPolicy::Delete {
            inner.records.remove(run_id);
        } else if let Some(record) = inner.records.get_mut(run_id) {
            record.cleanup_completed_at = Some(Utc::now());
        }
        self.save_locked(&inner);
    }

    /// Look up a run by id.
    pub fn get(&self, run_id: &str) -> Option<SubagentRunRecord> {
        self.inner.lock().unwrap().records.get(run_id).cloned()
    }

    /// Snapshot of all records.
    pub fn list(&self) -> Vec<SubagentRunRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<_> = inner.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().records.is_empty()
    }

    /// Stop the sweeper. Idempotent.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Delete records past their archive deadline.
    /// Returns the number removed. Exposed for the sweeper and tests.
    pub fn sweep_now(&self) -> usize {
        let now = now_ms();
        let mut inner = self.inner.lock().unwrap();
        let before = inner.records.len();
        inner
            .records
            .retain(|_, r| r.archive_at_ms <= 0 || r.archive_at_ms > now);
        let removed = before - inner.records.len();
        if removed > 0 {
            info!(removed, "swept archived sub-agent records");
            self.save_locked(&inner);
        }
        removed
    }

    /// Whether any record still has an archive deadline.
    fn has_archivable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.records.values().any(|r| r.archive_at_ms > 0)
    }

    fn start_sweeper(&self) {
        let Some(registry) = self.weak_self.upgrade() else {
            return;
        };
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.sweeper_running {
                return;
            }
            inner.sweeper_running = true;
        }
        debug!("sub-agent sweeper starting");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        registry.sweep_now();
                        if !registry.has_archivable() {
                            break;
                        }
                    }
                    _ = registry.stop.cancelled() => break,
                }
            }
            registry.inner.lock().unwrap().sweeper_running = false;
            debug!("sub-agent sweeper stopped");
        });
    }

    /// Persist the journal. Failures are logged; the in-memory map stays
    /// authoritative.
    fn save_locked(&self, inner: &RegistryInner) {
        if let Err(e) = write_journal(&self.path, &inner.records) {
            warn!(path = %self.path.display(), error = %e, "registry journal write failed");
        }
    }
}

fn load_journal(path: &PathBuf) -> HashMap<String, SubagentRunRecord> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt registry journal, starting empty");
                HashMap::new()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable registry journal, starting empty");
            HashMap::new()
        }
    }
}

fn write_journal(
    path: &PathBuf,
    records: &HashMap<String, SubagentRunRecord>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(records)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let mut file = std::fs::File::create(path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn params(run_id: &str) -> RegisterRun {
        RegisterRun {
            run_id: run_id.into(),
            child_session_key: format!("subagent:generalist:{run_id}"),
            requester_session_key: "telegram:bot1:c1".into(),
            requester_origin: RequesterOrigin {
                channel: "telegram".into(),
                account_id: "bot1".into(),
                to: "c1".into(),
                thread: None,
            },
            task: "count the files".into(),
            task_id: None,
            mcp_config_path: None,
            cleanup: CleanupPolicy::Delete,
            label: "file-count".into(),
            timeout_seconds: 900,
            archive_after_minutes: None,
        }
    }

    fn outcome_ok() -> RunOutcome {
        RunOutcome {
            status: RunStatus::Ok,
            error: None,
            result: Some("42 files".into()),
        }
    }

    #[tokio::test]
    async fn test_register_sets_timestamps_and_latch() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());

        let record = registry.register_run(params("run-1"));
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_none());
        assert!(record.outcome.is_none());
        assert!(!record.cleanup_handled);
        assert_eq!(record.archive_at_ms, 0);
    }

    #[tokio::test]
    async fn test_register_with_archive_deadline() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());

        let mut p = params("run-1");
        p.archive_after_minutes = Some(30);
        let record = registry.register_run(p);
        assert!(record.archive_at_ms > now_ms());
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_journal_round_trip() {
        let dir = tempdir().unwrap();
        let original = {
            let registry = SubagentRegistry::new(dir.path());
            let mut p = params("run-1");
            p.task_id = Some("task-9".into());
            registry.register_run(p);
            registry.register_run(params("run-2"));
            registry
                .mark_completed("run-1", outcome_ok(), Utc::now())
                .unwrap();
            registry.list()
        };

        let reloaded = SubagentRegistry::new(dir.path());
        assert_eq!(reloaded.list(), original);
    }

    #[tokio::test]
    async fn test_mark_completed_unknown_run() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        let err = registry
            .mark_completed("ghost", outcome_ok(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, KernelError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_completed_sets_outcome_and_ended_together() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        registry.register_run(params("run-1"));

        let record = registry
            .mark_completed("run-1", outcome_ok(), Utc::now())
            .unwrap();
        assert!(record.ended_at.is_some());
        assert_eq!(record.outcome.as_ref().unwrap().status, RunStatus::Ok);
    }

    #[tokio::test]
    async fn test_completion_callback_fires_async() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        registry.set_on_complete(Arc::new(move |record: SubagentRunRecord| {
            let counter = counter.clone();
            Box::pin(async move {
                assert_eq!(record.run_id, "run-1");
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));

        registry.register_run(params("run-1"));
        registry
            .mark_completed("run-1", outcome_ok(), Utc::now())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_begin_cleanup_returns_true_once() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        registry.register_run(params("run-1"));

        assert!(registry.begin_cleanup("run-1"));
        assert!(!registry.begin_cleanup("run-1"));
        assert!(!registry.begin_cleanup("missing"));
    }

    #[tokio::test]
    async fn test_begin_cleanup_once_under_contention() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        registry.register_run(params("run-1"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.begin_cleanup("run-1") as usize
            }));
        }
        let mut wins = 0;
        for handle in handles {
            wins += handle.await.unwrap();
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_cleanup_delete_empties_registry() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        registry.register_run(params("run-1"));
        registry
            .mark_completed("run-1", outcome_ok(), Utc::now())
            .unwrap();

        assert!(registry.begin_cleanup("run-1"));
        registry.cleanup("run-1", CleanupPolicy::Delete, true);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keep_stamps_completion() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        registry.register_run(params("run-1"));

        assert!(registry.begin_cleanup("run-1"));
        registry.cleanup("run-1", CleanupPolicy::Keep, true);

        let record = registry.get("run-1").unwrap();
        assert!(record.cleanup_completed_at.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_announce_reopens_latch() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        registry.register_run(params("run-1"));

        assert!(registry.begin_cleanup("run-1"));
        registry.cleanup("run-1", CleanupPolicy::Delete, false);
        // Record survives and the latch is open again.
        assert_eq!(registry.len(), 1);
        assert!(registry.begin_cleanup("run-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_deletes_expired_and_stops_when_idle() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());

        let mut p = params("run-1");
        p.archive_after_minutes = Some(1);
        registry.register_run(p);

        // The archive deadline is wall-clock; force it into the past so the
        // next (virtual-time) tick finds it due.
        registry.inner.lock().unwrap().records.get_mut("run-1").unwrap().archive_at_ms =
            now_ms() - 1;

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(registry.get("run-1").is_none());
        // Nothing archivable remains, so the sweeper exits on its own.
        tokio::task::yield_now().await;
        assert!(!registry.inner.lock().unwrap().sweeper_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_restarts_for_new_archivable_work() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());

        let mut first = params("run-1");
        first.archive_after_minutes = Some(1);
        registry.register_run(first);
        registry.inner.lock().unwrap().records.get_mut("run-1").unwrap().archive_at_ms =
            now_ms() - 1;
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(registry.is_empty());

        // A later registration with a deadline brings the sweeper back.
        let mut second = params("run-2");
        second.archive_after_minutes = Some(1);
        registry.register_run(second);
        assert!(registry.inner.lock().unwrap().sweeper_running);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_sweep_now_removes_due_records_only() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());

        registry.register_run(params("keep"));
        let mut due = params("due");
        due.archive_after_minutes = Some(1);
        registry.register_run(due);

        // Force the deadline into the past.
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.records.get_mut("due").unwrap().archive_at_ms = now_ms() - 1;
        }

        assert_eq!(registry.sweep_now(), 1);
        assert!(registry.get("due").is_none());
        assert!(registry.get("keep").is_some());
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_register_after_delete_round_trip() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::new(dir.path());
        registry.register_run(params("run-1"));
        registry
            .mark_completed("run-1", outcome_ok(), Utc::now())
            .unwrap();
        assert!(registry.begin_cleanup("run-1"));
        registry.cleanup("run-1", CleanupPolicy::Delete, true);

        // The journal on disk is empty too.
        let reloaded = SubagentRegistry::new(dir.path());
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_journal_starts_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(REGISTRY_FILE), "{broken").unwrap();
        let registry = SubagentRegistry::new(dir.path());
        assert!(registry.is_empty());
    }
}
