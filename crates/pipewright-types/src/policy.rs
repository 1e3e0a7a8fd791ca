//! Access policy types.
//!
//! A policy grants or denies one role a set of actions on every resource
//! whose `"namespace.key"` string fully matches `resource_pattern`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role wildcard: a policy with this role applies to every role.
pub const ANY_ROLE: &str = "*";

/// An action performed against a context resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Delete,
    #[serde(rename = "*")]
    Any,
}

impl Action {
    /// Whether a policy listing `self` covers `requested`.
    pub fn covers(self, requested: Action) -> bool {
        self == Action::Any || self == requested
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
            Action::Any => "*",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

/// A single access rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub role: String,
    /// Regular expression, matched against the whole resource string.
    pub resource_pattern: String,
    pub actions: Vec<Action>,
    pub effect: PolicyEffect,
}

impl Policy {
    pub fn allow(role: &str, resource_pattern: &str, actions: &[Action]) -> Self {
        Self {
            role: role.to_string(),
            resource_pattern: resource_pattern.to_string(),
            actions: actions.to_vec(),
            effect: PolicyEffect::Allow,
        }
    }

    pub fn deny(role: &str, resource_pattern: &str, actions: &[Action]) -> Self {
        Self {
            role: role.to_string(),
            resource_pattern: resource_pattern.to_string(),
            actions: actions.to_vec(),
            effect: PolicyEffect::Deny,
        }
    }

    pub fn applies_to_role(&self, role: &str) -> bool {
        self.role == ANY_ROLE || self.role == role
    }

    pub fn covers_action(&self, action: Action) -> bool {
        self.actions.iter().any(|a| a.covers(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_action_covers_everything() {
        assert!(Action::Any.covers(Action::Delete));
        assert!(Action::Read.covers(Action::Read));
        assert!(!Action::Read.covers(Action::Write));
    }

    #[test]
    fn test_wildcard_role_applies_to_all() {
        let policy = Policy::deny("*", ".*", &[Action::Delete]);
        assert!(policy.applies_to_role("pipeline"));
        let scoped = Policy::allow("pipeline", ".*", &[Action::Read]);
        assert!(!scoped.applies_to_role("web"));
    }

    #[test]
    fn test_policy_deserializes_from_toml_shape() {
        let policy: Policy = serde_json::from_value(serde_json::json!({
            "role": "pipeline",
            "resource_pattern": "jobs\\..*",
            "actions": ["read", "*"],
            "effect": "deny"
        }))
        .unwrap();
        assert_eq!(policy.actions, vec![Action::Read, Action::Any]);
        assert_eq!(policy.effect, PolicyEffect::Deny);
    }
}
