//! Fingerprinted, reference-counted cache of live runtime handles.
//!
//! One agent gets at most one live handle. A handle is reused while its
//! fingerprint (workspace, system prompt, model, sampling params) matches;
//! a mismatch invalidates the old entry, which closes once its last lease
//! is released. Builds happen outside the map lock, serialized per agent,
//! so at most one build runs per (agent_id, fingerprint) at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::traits::{MainRuntime, RuntimeBuilder};

// ─────────────────────────────────────────────
// Fingerprint
// ─────────────────────────────────────────────

/// The tuple whose equality decides whether a cached runtime may be reused.
///
/// Temperature is stored in millis so the fingerprint stays `Eq`-comparable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub workspace: PathBuf,
    pub system_prompt: String,
    pub model: String,
    pub temperature_milli: i32,
    pub max_tokens: u32,
}

impl Fingerprint {
    pub fn new(
        workspace: impl Into<PathBuf>,
        system_prompt: impl Into<String>,
        model: impl Into<String>,
        temperature: f64,
        max_tokens: u32,
    ) -> Self {
        Fingerprint {
            workspace: workspace.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            temperature_milli: (temperature * 1000.0).round() as i32,
            max_tokens,
        }
    }
}

// ─────────────────────────────────────────────
// Entries and leases
// ─────────────────────────────────────────────

struct Entry {
    handle: Arc<dyn MainRuntime>,
    fingerprint: Fingerprint,
    in_use: AtomicU32,
    invalidated: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("fingerprint", &self.fingerprint)
            .field("in_use", &self.in_use)
            .field("invalidated", &self.invalidated)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Entry {
    fn new(handle: Arc<dyn MainRuntime>, fingerprint: Fingerprint) -> Arc<Self> {
        Arc::new(Entry {
            handle,
            fingerprint,
            in_use: AtomicU32::new(0),
            invalidated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Close the underlying handle exactly once.
    async fn close_once(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.handle.close().await;
        }
    }
}

/// A checked-out reference to a cached runtime.
///
/// Must be returned with `RuntimeCache::release`; the entry cannot close
/// while leases are outstanding.
#[derive(Debug)]
pub struct RuntimeLease {
    agent_id: String,
    entry: Arc<Entry>,
}

impl RuntimeLease {
    /// The runtime handle this lease refers to.
    pub fn handle(&self) -> Arc<dyn MainRuntime> {
        self.entry.handle.clone()
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

// ─────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────

/// Cache of live runtime handles, keyed by agent id.
pub struct RuntimeCache {
    builder: Arc<dyn RuntimeBuilder>,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    /// Per-agent build serialization. Held across the (slow) external build.
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RuntimeCache {
    pub fn new(builder: Arc<dyn RuntimeBuilder>) -> Self {
        RuntimeCache {
            builder,
            entries: Mutex::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get a usable runtime for the agent, building one if needed.
    ///
    /// The returned lease pins the entry open until `release`.
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        agent_id: &str,
        fingerprint: Fingerprint,
    ) -> anyhow::Result<RuntimeLease> {
        // Fast path: matching live entry.
        if let Some(lease) = self.try_reuse(agent_id, &fingerprint) {
            return Ok(lease);
        }

        // Serialize builds per agent; the winner installs, the rest reuse.
        let build_lock = self.build_lock(agent_id);
        let _guard = build_lock.lock().await;

        if let Some(lease) = self.try_reuse(agent_id, &fingerprint) {
            return Ok(lease);
        }

        debug!(agent_id, model = %fingerprint.model, "building runtime");
        let handle = self.builder.build(ctx, agent_id, &fingerprint).await?;

        let (lease, displaced, redundant) = {
            let mut entries = self.entries.lock().unwrap();

            // A compatible entry may have appeared while we built
            // (e.g. installed by a caller that bypassed the cache lock
            // discipline). Prefer it and discard our fresh handle.
            if let Some(existing) = entries.get(agent_id) {
                if existing.fingerprint == fingerprint
                    && !existing.invalidated.load(Ordering::Acquire)
                {
                    existing.in_use.fetch_add(1, Ordering::AcqRel);
                    let lease = RuntimeLease {
                        agent_id: agent_id.to_string(),
                        entry: existing.clone(),
                    };
                    (lease, None, Some(handle))
                } else {
                    // Stale entry: invalidate; it closes when its last
                    // lease is released (or now, if idle).
                    existing.invalidated.store(true, Ordering::Release);
                    let displaced = if existing.in_use.load(Ordering::Acquire) == 0 {
                        entries.remove(agent_id)
                    } else {
                        None
                    };
                    let entry = Entry::new(handle, fingerprint);
                    entry.in_use.store(1, Ordering::Release);
                    entries.insert(agent_id.to_string(), entry.clone());
                    let lease = RuntimeLease {
                        agent_id: agent_id.to_string(),
                        entry,
                    };
                    (lease, displaced, None)
                }
            } else {
                let entry = Entry::new(handle, fingerprint);
                entry.in_use.store(1, Ordering::Release);
                entries.insert(agent_id.to_string(), entry.clone());
                let lease = RuntimeLease {
                    agent_id: agent_id.to_string(),
                    entry,
                };
                (lease, None, None)
            }
        };

        if let Some(old) = displaced {
            info!(agent_id, "closing displaced runtime");
            old.close_once().await;
        }
        if let Some(fresh) = redundant {
            debug!(agent_id, "discarding redundant runtime build");
            fresh.close().await;
        }

        Ok(lease)
    }

    /// Return a lease. The entry closes if it was invalidated and this was
    /// the last lease.
    pub async fn release(&self, lease: RuntimeLease) {
        let RuntimeLease { agent_id, entry } = lease;

        let close_now = {
            let mut entries = self.entries.lock().unwrap();
            let remaining = entry.in_use.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 && entry.invalidated.load(Ordering::Acquire) {
                // Remove only if the map still points at this exact entry;
                // a replacement must not be clobbered.
                if let Some(current) = entries.get(&agent_id) {
                    if Arc::ptr_eq(current, &entry) {
                        entries.remove(&agent_id);
                    }
                }
                true
            } else {
                false
            }
        };

        if close_now {
            entry.close_once().await;
        }
    }

    /// Invalidate the agent's cached runtime, if any.
    ///
    /// Closes immediately when idle; otherwise the last release closes it.
    pub async fn invalidate(&self, agent_id: &str) {
        let to_close = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(agent_id) {
                Some(entry) => {
                    entry.invalidated.store(true, Ordering::Release);
                    if entry.in_use.load(Ordering::Acquire) == 0 {
                        entries.remove(agent_id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(entry) = to_close {
            info!(agent_id, "closing invalidated runtime");
            entry.close_once().await;
        }
    }

    /// Invalidate and close every idle entry; busy entries close on their
    /// final release.
    pub async fn shutdown(&self) {
        let to_close: Vec<Arc<Entry>> = {
            let mut entries = self.entries.lock().unwrap();
            let idle: Vec<String> = entries
                .iter()
                .map(|(id, entry)| {
                    entry.invalidated.store(true, Ordering::Release);
                    (id, entry)
                })
                .filter(|(_, entry)| entry.in_use.load(Ordering::Acquire) == 0)
                .map(|(id, _)| id.clone())
                .collect();
            idle.iter().filter_map(|id| entries.remove(id)).collect()
        };

        for entry in to_close {
            entry.close_once().await;
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    fn try_reuse(&self, agent_id: &str, fingerprint: &Fingerprint) -> Option<RuntimeLease> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(agent_id)?;
        if entry.fingerprint == *fingerprint && !entry.invalidated.load(Ordering::Acquire) {
            entry.in_use.fetch_add(1, Ordering::AcqRel);
            Some(RuntimeLease {
                agent_id: agent_id.to_string(),
                entry: entry.clone(),
            })
        } else {
            None
        }
    }

    fn build_lock(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.build_locks.lock().unwrap();
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Drop for RuntimeCache {
    fn drop(&mut self) {
        let entries = self.entries.lock().unwrap();
        if !entries.is_empty() {
            warn!(live = entries.len(), "runtime cache dropped with live entries");
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
