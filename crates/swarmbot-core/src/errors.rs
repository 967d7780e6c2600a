//! Kernel error kinds and the provider-error classifier.
//!
//! Provider failures arrive as free-form text. The classifier maps that text
//! onto failover categories with ordered lowercase substring patterns; the
//! first matching category wins. Separate predicates detect context-overflow,
//! role-ordering, and image-size faults from the same text.

use thiserror::Error;

use crate::utils::truncate_string;

/// Maximum length of a user-visible error before truncation.
const USER_ERROR_MAX_CHARS: usize = 600;

// ─────────────────────────────────────────────
// Kernel errors
// ─────────────────────────────────────────────

/// Operational failures surfaced by the kernel itself.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("bus is closed")]
    BusClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("runtime build failed: {0}")]
    RuntimeBuildFailed(String),

    #[error("approver unreachable: {0}")]
    ApprovalUnreachable(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

// ─────────────────────────────────────────────
// Failover classification
// ─────────────────────────────────────────────

/// Categories of provider errors that may trigger provider rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailoverKind {
    Auth,
    RateLimit,
    Timeout,
    Billing,
}

/// Ordered (kind, patterns) table. Checked top to bottom; within a kind the
/// patterns are checked in order and any hit classifies the error.
const FAILOVER_PATTERNS: &[(FailoverKind, &[&str])] = &[
    (
        FailoverKind::Auth,
        &[
            "unauthorized",
            "invalid api key",
            "invalid x-api-key",
            "authentication_error",
            "permission_error",
            "forbidden",
            "401",
            "403",
        ],
    ),
    (
        FailoverKind::RateLimit,
        &[
            "rate limit",
            "rate_limit",
            "too many requests",
            "overloaded",
            "429",
            "quota exceeded",
        ],
    ),
    (
        FailoverKind::Timeout,
        &[
            "timed out",
            "timeout",
            "deadline exceeded",
            "connection reset",
            "504",
        ],
    ),
    (
        FailoverKind::Billing,
        &[
            "billing",
            "insufficient credit",
            "insufficient_quota",
            "payment required",
            "402",
        ],
    ),
];

/// Classify a provider-reported error. First matching category wins.
pub fn classify(error_text: &str) -> Option<FailoverKind> {
    let lower = error_text.to_lowercase();
    for (kind, patterns) in FAILOVER_PATTERNS {
        if patterns.iter().any(|p| lower.contains(p)) {
            return Some(*kind);
        }
    }
    None
}

/// Whether the error is eligible for provider failover.
pub fn is_failover(error_text: &str) -> bool {
    classify(error_text).is_some()
}

/// The prompt exceeded the model's context window.
pub fn is_context_overflow(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    ["context length", "context window", "maximum context", "prompt is too long", "too many tokens"]
        .iter()
        .any(|p| lower.contains(p))
}

/// Messages violate the provider's role-ordering rules
/// (e.g. consecutive assistant turns, tool result without a call).
pub fn is_role_ordering(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    ["role", "message order", "unexpected tool", "must alternate"]
        .iter()
        .any(|p| lower.contains(p))
        && !is_context_overflow(error_text)
}

/// An attached image exceeded the provider's size limit.
pub fn is_image_too_large(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    ["image too large", "image exceeds", "image_size", "image dimensions"]
        .iter()
        .any(|p| lower.contains(p))
}

// ─────────────────────────────────────────────
// User-visible rendering
// ─────────────────────────────────────────────

/// Render a runtime error as a single human-readable outbound message.
///
/// Specific kinds get tailored text; anything long is truncated.
pub fn user_facing_message(error_text: &str) -> String {
    if is_context_overflow(error_text) {
        return "Context overflow: prompt too large for the model. \
                I've noted it and will compact the conversation."
            .to_string();
    }
    if is_image_too_large(error_text) {
        return "That image is too large for the model to process. \
                Try a smaller one."
            .to_string();
    }
    let detail = truncate_string(error_text, USER_ERROR_MAX_CHARS);
    match classify(error_text) {
        Some(FailoverKind::Auth) => format!("The model provider rejected my credentials: {detail}"),
        Some(FailoverKind::RateLimit) => format!("The model provider is rate limiting me: {detail}"),
        Some(FailoverKind::Timeout) => format!("The model provider timed out: {detail}"),
        Some(FailoverKind::Billing) => format!("The model provider reports a billing problem: {detail}"),
        None => format!("I encountered an error: {detail}"),
    }
}
