//! The hierarchical allocator.
//!
//! All state lives in a single allocator process actor. The
//! [`DispatchAllocator`] façade turns each call into a message; mutators
//! return as soon as the message is enqueued, queries wait for the reply.
//!
//! Offers leave the allocator through an [`OfferSink`], so the allocator
//! never depends on whoever consumes them.

mod dispatch;
mod filters;
mod hierarchical;
mod messages;
mod quota_handler;

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use corral_id::{FrameworkId, SlaveId};
use corral_resources::{Resources, ResourcesError, Transformation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::actors::ActorError;
use crate::metrics::MetricsSnapshot;
use crate::quota::{Quota, QuotaError, QuotaInfo};

pub use dispatch::DispatchAllocator;

/// Resources offered to one framework, by agent.
pub type Offers = HashMap<SlaveId, Resources>;

/// Static description of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub hostname: String,
    /// Resources the agent advertised at registration.
    pub resources: Resources,
}

impl SlaveInfo {
    pub fn new(hostname: impl Into<String>, resources: Resources) -> Self {
        Self {
            hostname: hostname.into(),
            resources,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// The framework accepts revocable resources.
    RevocableResources,
}

fn default_role() -> String {
    corral_resources::DEFAULT_ROLE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl FrameworkInfo {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            principal: None,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// How long a framework refuses resources it declined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    pub refuse_seconds: f64,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            refuse_seconds: 5.0,
        }
    }
}

impl Filters {
    pub fn refuse_seconds(refuse_seconds: f64) -> Self {
        Self { refuse_seconds }
    }
}

/// A framework's request for resources, optionally on a specific agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub slave_id: Option<SlaveId>,
    pub resources: Resources,
}

/// Receives allocation decisions.
pub trait OfferSink: Send + Sync {
    /// Called once per framework per allocation pass that produced offers.
    fn offer(&self, framework_id: FrameworkId, offers: Offers);

    /// Called when outstanding offers are taken back to make room for quota.
    fn rescind(&self, framework_id: FrameworkId, slave_id: SlaveId, resources: &Resources) {
        debug!(
            framework_id = %framework_id,
            slave_id = %slave_id,
            resources = %resources,
            "Rescinded offer"
        );
    }
}

impl<F> OfferSink for F
where
    F: Fn(FrameworkId, Offers) + Send + Sync,
{
    fn offer(&self, framework_id: FrameworkId, offers: Offers) {
        self(framework_id, offers)
    }
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("unknown agent {0}")]
    UnknownSlave(SlaveId),

    #[error(transparent)]
    Resources(#[from] ResourcesError),

    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// The allocator interface exposed to the rest of the master.
///
/// Mutators are fire-and-forget and only fail once the allocator has
/// stopped. Calls made from one task take effect in call order.
#[async_trait]
pub trait Allocator: Send + Sync {
    fn add_framework(
        &self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
        used: HashMap<SlaveId, Resources>,
    ) -> Result<(), ActorError>;

    fn remove_framework(&self, framework_id: FrameworkId) -> Result<(), ActorError>;

    fn activate_framework(&self, framework_id: FrameworkId) -> Result<(), ActorError>;

    fn deactivate_framework(&self, framework_id: FrameworkId) -> Result<(), ActorError>;

    fn add_slave(
        &self,
        slave_id: SlaveId,
        info: SlaveInfo,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    ) -> Result<(), ActorError>;

    fn remove_slave(&self, slave_id: SlaveId) -> Result<(), ActorError>;

    /// Replaces the revocable part of the agent's total.
    fn update_slave(&self, slave_id: SlaveId, oversubscribed: Resources) -> Result<(), ActorError>;

    fn activate_slave(&self, slave_id: SlaveId) -> Result<(), ActorError>;

    fn deactivate_slave(&self, slave_id: SlaveId) -> Result<(), ActorError>;

    /// `None` offers every agent; `Some` only agents whose hostname is listed.
    fn update_whitelist(&self, whitelist: Option<HashSet<String>>) -> Result<(), ActorError>;

    fn request_resources(
        &self,
        framework_id: FrameworkId,
        requests: Vec<Request>,
    ) -> Result<(), ActorError>;

    /// Applies offer operations to resources already allocated to a framework.
    fn update_allocation(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        operations: Vec<Transformation>,
    ) -> Result<(), ActorError>;

    /// Returns resources to the pool, optionally refusing them for a while.
    fn recover_resources(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
        filters: Option<Filters>,
    ) -> Result<(), ActorError>;

    /// Marks offered resources as used by the framework.
    fn offer_accepted(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    ) -> Result<(), ActorError>;

    fn revive_offers(&self, framework_id: FrameworkId) -> Result<(), ActorError>;

    /// Grants an already validated and persisted quota.
    fn set_quota(&self, quota: Quota) -> Result<(), ActorError>;

    fn remove_quota(&self, role: String) -> Result<(), ActorError>;

    /// Applies offer operations to the unallocated part of an agent.
    async fn update_available(
        &self,
        slave_id: SlaveId,
        operations: Vec<Transformation>,
    ) -> Result<(), AllocatorError>;

    async fn request_set_quota(
        &self,
        info: QuotaInfo,
        force: bool,
        principal: Option<String>,
    ) -> Result<(), QuotaError>;

    async fn request_remove_quota(
        &self,
        role: String,
        principal: Option<String>,
    ) -> Result<(), QuotaError>;

    async fn metrics(&self) -> Result<MetricsSnapshot, ActorError>;

    /// Stops the allocator and waits for it to exit. Idempotent.
    async fn cease_allocation(&self);
}
