use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use corral_id::{FrameworkId, SlaveId};
use corral_resources::{Resources, Transformation};
use tokio::sync::Mutex;
use tracing::info;

use super::hierarchical::HierarchicalAllocatorProcess;
use super::messages::AllocatorMessage;
use super::{Allocator, AllocatorError, Filters, FrameworkInfo, OfferSink, Request, SlaveInfo};
use crate::actors::{self, ActorError, ActorHandle, ActorRef};
use crate::authorizer::Authorizer;
use crate::config::AllocatorConfig;
use crate::metrics::MetricsSnapshot;
use crate::quota::{Quota, QuotaError, QuotaInfo};
use crate::registrar::{InMemoryRegistrar, Registrar};

/// Runs the allocator process and forwards every call to it as a message.
///
/// Must be created inside a Tokio runtime.
pub struct DispatchAllocator {
    handle: ActorHandle<AllocatorMessage>,
    actor: Mutex<Option<ActorRef>>,
}

impl DispatchAllocator {
    /// Starts an allocator. Quota persisted in `registrar` is granted before
    /// the first allocation pass. Without an authorizer every quota change
    /// is allowed.
    pub fn initialize(
        config: AllocatorConfig,
        offer_sink: Arc<dyn OfferSink>,
        registrar: Arc<dyn Registrar>,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Self {
        let process = HierarchicalAllocatorProcess::new(config, offer_sink, registrar, authorizer);
        let (handle, actor) = actors::spawn(process);
        Self {
            handle,
            actor: Mutex::new(Some(actor)),
        }
    }

    /// Starts an allocator with an in-memory registrar and no authorizer.
    pub fn new(config: AllocatorConfig, offer_sink: impl OfferSink + 'static) -> Self {
        Self::initialize(
            config,
            Arc::new(offer_sink),
            Arc::new(InMemoryRegistrar::new()),
            None,
        )
    }

    fn send(&self, msg: AllocatorMessage) -> Result<(), ActorError> {
        self.handle.send(msg)
    }
}

impl Drop for DispatchAllocator {
    fn drop(&mut self) {
        if let Some(actor) = self.actor.get_mut().take() {
            actor.stop();
        }
    }
}

#[async_trait]
impl Allocator for DispatchAllocator {
    fn add_framework(
        &self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
        used: HashMap<SlaveId, Resources>,
    ) -> Result<(), ActorError> {
        self.send(AllocatorMessage::AddFramework {
            framework_id,
            info,
            used,
        })
    }

    fn remove_framework(&self, framework_id: FrameworkId) -> Result<(), ActorError> {
        self.send(AllocatorMessage::RemoveFramework { framework_id })
    }

    fn activate_framework(&self, framework_id: FrameworkId) -> Result<(), ActorError> {
        self.send(AllocatorMessage::ActivateFramework { framework_id })
    }

    fn deactivate_framework(&self, framework_id: FrameworkId) -> Result<(), ActorError> {
        self.send(AllocatorMessage::DeactivateFramework { framework_id })
    }

    fn add_slave(
        &self,
        slave_id: SlaveId,
        info: SlaveInfo,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    ) -> Result<(), ActorError> {
        self.send(AllocatorMessage::AddSlave {
            slave_id,
            info,
            total,
            used,
        })
    }

    fn remove_slave(&self, slave_id: SlaveId) -> Result<(), ActorError> {
        self.send(AllocatorMessage::RemoveSlave { slave_id })
    }

    fn update_slave(&self, slave_id: SlaveId, oversubscribed: Resources) -> Result<(), ActorError> {
        self.send(AllocatorMessage::UpdateSlave {
            slave_id,
            oversubscribed,
        })
    }

    fn activate_slave(&self, slave_id: SlaveId) -> Result<(), ActorError> {
        self.send(AllocatorMessage::ActivateSlave { slave_id })
    }

    fn deactivate_slave(&self, slave_id: SlaveId) -> Result<(), ActorError> {
        self.send(AllocatorMessage::DeactivateSlave { slave_id })
    }

    fn update_whitelist(&self, whitelist: Option<HashSet<String>>) -> Result<(), ActorError> {
        self.send(AllocatorMessage::UpdateWhitelist { whitelist })
    }

    fn request_resources(
        &self,
        framework_id: FrameworkId,
        requests: Vec<Request>,
    ) -> Result<(), ActorError> {
        self.send(AllocatorMessage::RequestResources {
            framework_id,
            requests,
        })
    }

    fn update_allocation(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        operations: Vec<Transformation>,
    ) -> Result<(), ActorError> {
        self.send(AllocatorMessage::UpdateAllocation {
            framework_id,
            slave_id,
            operations,
        })
    }

    fn recover_resources(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
        filters: Option<Filters>,
    ) -> Result<(), ActorError> {
        self.send(AllocatorMessage::RecoverResources {
            framework_id,
            slave_id,
            resources,
            filters,
        })
    }

    fn offer_accepted(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    ) -> Result<(), ActorError> {
        self.send(AllocatorMessage::OfferAccepted {
            framework_id,
            slave_id,
            resources,
        })
    }

    fn revive_offers(&self, framework_id: FrameworkId) -> Result<(), ActorError> {
        self.send(AllocatorMessage::ReviveOffers { framework_id })
    }

    fn set_quota(&self, quota: Quota) -> Result<(), ActorError> {
        self.send(AllocatorMessage::SetQuota { quota })
    }

    fn remove_quota(&self, role: String) -> Result<(), ActorError> {
        self.send(AllocatorMessage::RemoveQuota { role })
    }

    async fn update_available(
        &self,
        slave_id: SlaveId,
        operations: Vec<Transformation>,
    ) -> Result<(), AllocatorError> {
        self.handle
            .ask(|reply| AllocatorMessage::UpdateAvailable {
                slave_id,
                operations,
                reply,
            })
            .await?
    }

    async fn request_set_quota(
        &self,
        info: QuotaInfo,
        force: bool,
        principal: Option<String>,
    ) -> Result<(), QuotaError> {
        self.handle
            .ask(|reply| AllocatorMessage::RequestSetQuota {
                info,
                force,
                principal,
                reply,
            })
            .await
            .unwrap_or(Err(QuotaError::AllocatorStopped))
    }

    async fn request_remove_quota(
        &self,
        role: String,
        principal: Option<String>,
    ) -> Result<(), QuotaError> {
        self.handle
            .ask(|reply| AllocatorMessage::RequestRemoveQuota {
                role,
                principal,
                reply,
            })
            .await
            .unwrap_or(Err(QuotaError::AllocatorStopped))
    }

    async fn metrics(&self) -> Result<MetricsSnapshot, ActorError> {
        self.handle
            .ask(|reply| AllocatorMessage::Metrics { reply })
            .await
    }

    async fn cease_allocation(&self) {
        let actor = self.actor.lock().await.take();
        if let Some(actor) = actor {
            actor.terminate().await;
            info!("Allocation ceased");
        }
    }
}
