//! Namespace role policy
//!
//! A namespace may carry an annotation listing the roles its mapping
//! resources are allowed to use. The decision is recomputed on every sync
//! tick so annotation edits apply on the next tick.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Separator between roles in the namespace annotation.
pub const ROLE_DELIMITER: char = ',';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePolicy {
    pub namespace: String,

    /// `None` when the annotation is absent, which is not the same as an
    /// annotation listing no roles.
    pub allowed_roles: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDecision {
    Allow,
    Deny,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

impl NamespacePolicy {
    /// Namespace without the annotation.
    pub fn unrestricted(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            allowed_roles: None,
        }
    }

    /// Build from the raw annotation value, if any.
    ///
    /// Roles are separated by commas; surrounding whitespace and empty items
    /// are dropped.
    pub fn from_annotation(namespace: impl Into<String>, annotation: Option<&str>) -> Self {
        let allowed_roles = annotation.map(|raw| {
            raw.split(ROLE_DELIMITER)
                .map(str::trim)
                .filter(|role| !role.is_empty())
                .map(str::to_string)
                .collect()
        });

        Self {
            namespace: namespace.into(),
            allowed_roles,
        }
    }
}

/// Decide whether `role` may be used by mapping resources in the policy's namespace.
///
/// | annotation | role          | decision |
/// |------------|---------------|----------|
/// | present    | listed        | allow    |
/// | present    | not listed    | deny     |
/// | present    | empty         | deny     |
/// | absent     | any           | allow    |
pub fn authorize(policy: &NamespacePolicy, role: &str) -> AccessDecision {
    match &policy.allowed_roles {
        None => AccessDecision::Allow,
        Some(_) if role.is_empty() => AccessDecision::Deny,
        Some(allowed) if allowed.contains(role) => AccessDecision::Allow,
        Some(_) => AccessDecision::Deny,
    }
}
