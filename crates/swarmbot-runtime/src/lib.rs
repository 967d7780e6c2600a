//! Runtime interfaces — the seams where LLM drivers and task persistence
//! plug into the kernel — plus the fingerprinted runtime cache.
//!
//! Concrete providers (HTTP clients, local processes) live outside this
//! workspace; the kernel only ever sees `MainRuntime`, `SubagentRuntime`,
//! and `TaskTracker` trait objects.

pub mod cache;
pub mod events;
pub mod traits;

pub use cache::{Fingerprint, RuntimeCache, RuntimeLease};
pub use events::StreamEvent;
pub use traits::{
    MainRuntime, PermissionDecision, PermissionDeciderFn, PermissionRequest, RunOutput,
    RunRequest, RunStatus, RuntimeBuilder, SpawnRequest, SubagentRuntime, TaskProgress,
    TaskStatus, TaskTracker, WaitOutcome,
};
