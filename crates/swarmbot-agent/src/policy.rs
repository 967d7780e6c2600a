//! Tool policy — per-invocation allow/deny evaluation.
//!
//! Built once from the configured deny/allow lists; a static deny set is
//! always applied on top. Evaluation is two set lookups with deny winning.

use std::collections::HashSet;

use swarmbot_core::config::schema::ToolsConfig;

/// Tools a sub-agent may never call, regardless of configuration:
/// spawning more sub-agents, session management, and the gateway/cron
/// surfaces.
pub const STATIC_DENY: &[&str] = &[
    "spawn_subagent",
    "subagent_status",
    "session_new",
    "session_switch",
    "session_list",
    "gateway",
    "cron",
];

/// Immutable allow/deny decision table for tool invocations.
#[derive(Clone, Debug)]
pub struct ToolPolicy {
    deny: HashSet<String>,
    allow: HashSet<String>,
    allow_only: bool,
}

impl ToolPolicy {
    /// Build a policy from user lists. The static denies are always added.
    pub fn new(
        deny: impl IntoIterator<Item = String>,
        allow: impl IntoIterator<Item = String>,
        allow_only: bool,
    ) -> Self {
        let mut deny: HashSet<String> = deny.into_iter().collect();
        deny.extend(STATIC_DENY.iter().map(|s| s.to_string()));
        ToolPolicy {
            deny,
            allow: allow.into_iter().collect(),
            allow_only,
        }
    }

    /// Build from the `tools` config section.
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self::new(
            config.deny.iter().cloned(),
            config.allow.iter().cloned(),
            config.allow_only,
        )
    }

    /// Whether the named tool may be invoked. Deny wins over allow.
    pub fn is_allowed(&self, name: &str) -> bool {
        if self.deny.contains(name) {
            return false;
        }
        if self.allow_only {
            return self.allow.contains(name);
        }
        true
    }
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::new([], [], false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_denies_always_apply() {
        let policy = ToolPolicy::default();
        assert!(!policy.is_allowed("spawn_subagent"));
        assert!(!policy.is_allowed("cron"));
        assert!(policy.is_allowed("read_file"));
    }

    #[test]
    fn test_user_deny() {
        let policy = ToolPolicy::new(vec!["exec".to_string()], vec![], false);
        assert!(!policy.is_allowed("exec"));
        assert!(policy.is_allowed("write_file"));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = ToolPolicy::new(
            vec!["exec".to_string()],
            vec!["exec".to_string()],
            true,
        );
        assert!(!policy.is_allowed("exec"));
    }

    #[test]
    fn test_allow_only_mode() {
        let policy = ToolPolicy::new(vec![], vec!["read_file".to_string()], true);
        assert!(policy.is_allowed("read_file"));
        assert!(!policy.is_allowed("write_file"));
    }

    #[test]
    fn test_allow_only_cannot_resurrect_static_deny() {
        let policy = ToolPolicy::new(vec![], vec!["gateway".to_string()], true);
        assert!(!policy.is_allowed("gateway"));
    }

    #[test]
    fn test_from_config() {
        let config = ToolsConfig {
            deny: vec!["web_search".into()],
            allow: vec![],
            allow_only: false,
        };
        let policy = ToolPolicy::from_config(&config);
        assert!(!policy.is_allowed("web_search"));
        assert!(policy.is_allowed("exec"));
    }
}
