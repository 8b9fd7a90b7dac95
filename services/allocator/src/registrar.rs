//! Registry interface for persisting quota.
//!
//! The allocator never changes quota in memory before the registry has
//! accepted the change. An in-memory registrar is provided for tests and
//! single-node deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::quota::Quota;

/// A registry mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    UpdateQuota { quota: Quota },
    RemoveQuota { role: String },
}

impl Operation {
    pub fn role(&self) -> &str {
        match self {
            Operation::UpdateQuota { quota } => &quota.role,
            Operation::RemoveQuota { role } => role,
        }
    }
}

/// Durable store of cluster state.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Applies `operation`. Returns whether the persisted state changed.
    async fn apply(&self, operation: Operation) -> Result<bool>;

    /// Quota persisted by earlier runs.
    async fn recover(&self) -> Result<Vec<Quota>> {
        Ok(Vec::new())
    }
}

/// Registrar that keeps quota in a map.
#[derive(Default)]
pub struct InMemoryRegistrar {
    quotas: RwLock<BTreeMap<String, Quota>>,

    /// Whether every operation should fail.
    fail_applies: AtomicBool,
}

impl InMemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registrar seeded with already persisted quota.
    pub fn with_quotas(quotas: impl IntoIterator<Item = Quota>) -> Self {
        let quotas = quotas
            .into_iter()
            .map(|quota| (quota.role.clone(), quota))
            .collect();
        Self {
            quotas: RwLock::new(quotas),
            fail_applies: AtomicBool::new(false),
        }
    }

    /// Makes every later `apply` fail.
    pub fn fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    pub async fn quotas(&self) -> Vec<Quota> {
        self.quotas.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl Registrar for InMemoryRegistrar {
    async fn apply(&self, operation: Operation) -> Result<bool> {
        if self.fail_applies.load(Ordering::SeqCst) {
            anyhow::bail!("registrar configured to fail");
        }

        let mut quotas = self.quotas.write().await;
        let changed = match operation {
            Operation::UpdateQuota { quota } => {
                info!(role = %quota.role, guarantee = %quota.guarantee, "Persisting quota");
                quotas.insert(quota.role.clone(), quota);
                true
            }
            Operation::RemoveQuota { role } => {
                let removed = quotas.remove(&role).is_some();
                debug!(role = %role, removed, "Removing persisted quota");
                removed
            }
        };
        Ok(changed)
    }

    async fn recover(&self) -> Result<Vec<Quota>> {
        Ok(self.quotas().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_resources::Resources;

    fn quota(role: &str, text: &str) -> Quota {
        Quota::new(role, &Resources::parse(text).unwrap())
    }

    #[tokio::test]
    async fn test_update_always_changes_state() {
        let registrar = InMemoryRegistrar::new();
        let op = Operation::UpdateQuota {
            quota: quota("R", "cpus:1"),
        };
        assert!(registrar.apply(op.clone()).await.unwrap());
        assert!(registrar.apply(op).await.unwrap());
        assert_eq!(registrar.recover().await.unwrap(), vec![quota("R", "cpus:1")]);
    }

    #[tokio::test]
    async fn test_remove_reports_whether_anything_changed() {
        let registrar = InMemoryRegistrar::with_quotas([quota("R", "cpus:1")]);
        let remove = Operation::RemoveQuota { role: "R".into() };
        assert!(registrar.apply(remove.clone()).await.unwrap());
        assert!(!registrar.apply(remove).await.unwrap());
        assert!(registrar.quotas().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_registrar() {
        let registrar = InMemoryRegistrar::new();
        registrar.fail_applies(true);
        let result = registrar
            .apply(Operation::RemoveQuota { role: "R".into() })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_operation_json_shape() {
        let op = Operation::RemoveQuota { role: "R".into() };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, serde_json::json!({"type": "remove_quota", "role": "R"}));
        assert_eq!(op.role(), "R");
    }
}
