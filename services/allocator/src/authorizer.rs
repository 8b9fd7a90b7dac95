//! Authorization of quota changes.
//!
//! [`LocalAuthorizer`] evaluates ordered ACLs: the first rule whose
//! principals and roles both match the request decides, and requests no rule
//! matches fall back to `permissive`.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a principal wants to do to a role's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaAction {
    Set,
    Remove,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `principal` may perform `action` on `role`. A missing
    /// principal stands for an unauthenticated caller.
    async fn authorize(
        &self,
        principal: Option<&str>,
        action: QuotaAction,
        role: &str,
    ) -> Result<bool>;
}

/// The principals or roles an ACL rule covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Any,
    None,
    Values(Vec<String>),
}

impl Entity {
    /// Whether the rule applies to `value` (`None` meaning "anyone").
    fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (Entity::Any | Entity::None, _) => true,
            (Entity::Values(_), None) => false,
            (Entity::Values(values), Some(value)) => values.iter().any(|v| v == value),
        }
    }

    /// Whether a matching rule grants access to `value`.
    fn allows(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (Entity::None, _) => false,
            (Entity::Any, _) => true,
            (Entity::Values(_), None) => false,
            (Entity::Values(values), Some(value)) => values.iter().any(|v| v == value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAcl {
    pub principals: Entity,
    pub roles: Entity,
}

impl QuotaAcl {
    fn decide(&self, principal: Option<&str>, role: &str) -> Option<bool> {
        if self.principals.matches(principal) && self.roles.matches(Some(role)) {
            Some(self.principals.allows(principal) && self.roles.allows(Some(role)))
        } else {
            None
        }
    }
}

fn default_permissive() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acls {
    #[serde(default = "default_permissive")]
    pub permissive: bool,
    #[serde(default)]
    pub set_quotas: Vec<QuotaAcl>,
    #[serde(default)]
    pub remove_quotas: Vec<QuotaAcl>,
}

impl Default for Acls {
    fn default() -> Self {
        Self {
            permissive: true,
            set_quotas: Vec::new(),
            remove_quotas: Vec::new(),
        }
    }
}

/// Authorizer backed by a static set of ACLs.
#[derive(Debug, Clone, Default)]
pub struct LocalAuthorizer {
    acls: Acls,
}

impl LocalAuthorizer {
    pub fn new(acls: Acls) -> Self {
        Self { acls }
    }

    /// Loads ACLs from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ACLs from {}", path.display()))?;
        let acls: Acls = serde_json::from_str(&content).context("invalid ACL JSON")?;
        Ok(Self::new(acls))
    }

    fn evaluate(&self, principal: Option<&str>, action: QuotaAction, role: &str) -> bool {
        let rules = match action {
            QuotaAction::Set => &self.acls.set_quotas,
            QuotaAction::Remove => &self.acls.remove_quotas,
        };
        rules
            .iter()
            .find_map(|rule| rule.decide(principal, role))
            .unwrap_or(self.acls.permissive)
    }
}

#[async_trait]
impl Authorizer for LocalAuthorizer {
    async fn authorize(
        &self,
        principal: Option<&str>,
        action: QuotaAction,
        role: &str,
    ) -> Result<bool> {
        let allowed = self.evaluate(principal, action, role);
        debug!(?principal, ?action, role, allowed, "Authorized quota request");
        Ok(allowed)
    }
}
