//! Policy-based access control for context resources.
//!
//! Resources are `"namespace.key"` strings. Deny always wins: every matching
//! deny policy is checked before any allow policy, independent of the order
//! policies were added. No match means deny.

use std::sync::RwLock;

use pipewright_types::config::PermissionsConfig;
use pipewright_types::error::PermissionError;
use pipewright_types::policy::{Action, Policy, PolicyEffect};
use regex::Regex;

/// A policy with its resource pattern compiled as a full-match regex.
#[derive(Debug, Clone)]
struct CompiledPolicy {
    policy: Policy,
    pattern: Regex,
}

impl CompiledPolicy {
    fn compile(policy: Policy) -> Result<Self, PermissionError> {
        let anchored = format!("^(?:{})$", policy.resource_pattern);
        let pattern = Regex::new(&anchored).map_err(|e| PermissionError::InvalidPattern {
            pattern: policy.resource_pattern.clone(),
            message: e.to_string(),
        })?;
        Ok(Self { policy, pattern })
    }

    fn matches(&self, role: &str, resource: &str, action: Action) -> bool {
        self.policy.applies_to_role(role)
            && self.policy.covers_action(action)
            && self.pattern.is_match(resource)
    }
}

/// Evaluates (role, resource, action) triples against a policy set.
#[derive(Debug)]
pub struct PermissionManager {
    enabled: bool,
    policies: RwLock<Vec<CompiledPolicy>>,
}

impl PermissionManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            policies: RwLock::new(Vec::new()),
        }
    }

    /// A manager that allows everything.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Build from configuration, compiling every policy up front.
    pub fn from_config(config: &PermissionsConfig) -> Result<Self, PermissionError> {
        let manager = Self::new(config.enabled);
        for policy in &config.policies {
            manager.add_policy(policy.clone())?;
        }
        Ok(manager)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add a policy. An invalid regex is rejected and nothing is added.
    pub fn add_policy(&self, policy: Policy) -> Result<(), PermissionError> {
        let compiled = CompiledPolicy::compile(policy)?;
        self.policies
            .write()
            .expect("policy lock poisoned")
            .push(compiled);
        Ok(())
    }

    /// Snapshot of the configured policies in insertion order.
    pub fn policies(&self) -> Vec<Policy> {
        self.policies
            .read()
            .expect("policy lock poisoned")
            .iter()
            .map(|c| c.policy.clone())
            .collect()
    }

    pub fn check_permission(&self, role: &str, resource: &str, action: Action) -> bool {
        if !self.enabled {
            return true;
        }

        let policies = self.policies.read().expect("policy lock poisoned");
        let matching = |effect: PolicyEffect| {
            policies
                .iter()
                .filter(move |c| c.policy.effect == effect)
                .any(|c| c.matches(role, resource, action))
        };

        if matching(PolicyEffect::Deny) {
            tracing::debug!(role, resource, %action, "denied by policy");
            return false;
        }
        if matching(PolicyEffect::Allow) {
            return true;
        }
        tracing::debug!(role, resource, %action, "no matching allow policy");
        false
    }

    /// Like [`check_permission`](Self::check_permission) but returns a typed error.
    pub fn require_permission(
        &self,
        role: &str,
        resource: &str,
        action: Action,
    ) -> Result<(), PermissionError> {
        if self.check_permission(role, resource, action) {
            Ok(())
        } else {
            tracing::warn!(role, resource, %action, "permission denied");
            Err(PermissionError::Denied {
                role: role.to_string(),
                resource: resource.to_string(),
                action,
            })
        }
    }
}
