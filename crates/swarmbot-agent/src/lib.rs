//! Swarmbot agent orchestration kernel.
//!
//! The pieces fit together like this: transports publish onto the bus, the
//! `InboundDispatcher` fans messages out to strict-FIFO per-session workers,
//! each worker hands its message to the `AgentManager`, which resolves the
//! bound agent, acquires a cached runtime, runs the turn, and publishes the
//! reply. Sub-agent work flows through the `SubagentOrchestrator` and its
//! registry, with tool permissions gated by `ToolPolicy` and the
//! `ApprovalPipeline`.

pub mod approval;
pub mod dispatch;
pub mod manager;
pub mod policy;
pub mod registry;
pub mod subagent;
