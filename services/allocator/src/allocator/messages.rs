use std::collections::{HashMap, HashSet};

use corral_id::{FrameworkId, SlaveId};
use corral_resources::{Resources, Transformation};
use tokio::sync::oneshot;

use super::{AllocatorError, Filters, FrameworkInfo, Request, SlaveInfo};
use crate::metrics::MetricsSnapshot;
use crate::quota::{Quota, QuotaError, QuotaInfo};

pub(crate) type QuotaReply = oneshot::Sender<Result<(), QuotaError>>;

/// Result of the asynchronous part of a quota change.
#[derive(Debug)]
pub(crate) enum QuotaOutcome {
    Denied,
    AuthorizationFailed(anyhow::Error),
    /// The registrar answered; `false` means the registry did not change.
    Applied(bool),
    PersistenceFailed(anyhow::Error),
}

/// Messages handled by the allocator process.
#[derive(Debug)]
pub(crate) enum AllocatorMessage {
    AddFramework {
        framework_id: FrameworkId,
        info: FrameworkInfo,
        used: HashMap<SlaveId, Resources>,
    },
    RemoveFramework {
        framework_id: FrameworkId,
    },
    ActivateFramework {
        framework_id: FrameworkId,
    },
    DeactivateFramework {
        framework_id: FrameworkId,
    },
    AddSlave {
        slave_id: SlaveId,
        info: SlaveInfo,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    },
    RemoveSlave {
        slave_id: SlaveId,
    },
    UpdateSlave {
        slave_id: SlaveId,
        oversubscribed: Resources,
    },
    ActivateSlave {
        slave_id: SlaveId,
    },
    DeactivateSlave {
        slave_id: SlaveId,
    },
    UpdateWhitelist {
        whitelist: Option<HashSet<String>>,
    },
    RequestResources {
        framework_id: FrameworkId,
        requests: Vec<Request>,
    },
    UpdateAllocation {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        operations: Vec<Transformation>,
    },
    UpdateAvailable {
        slave_id: SlaveId,
        operations: Vec<Transformation>,
        reply: oneshot::Sender<Result<(), AllocatorError>>,
    },
    RecoverResources {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
        filters: Option<Filters>,
    },
    OfferAccepted {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    },
    ReviveOffers {
        framework_id: FrameworkId,
    },
    SetQuota {
        quota: Quota,
    },
    RemoveQuota {
        role: String,
    },
    RequestSetQuota {
        info: QuotaInfo,
        force: bool,
        principal: Option<String>,
        reply: oneshot::Sender<Result<(), QuotaError>>,
    },
    RequestRemoveQuota {
        role: String,
        principal: Option<String>,
        reply: oneshot::Sender<Result<(), QuotaError>>,
    },
    SetQuotaCompleted {
        quota: Quota,
        principal: Option<String>,
        outcome: QuotaOutcome,
        reply: QuotaReply,
    },
    RemoveQuotaCompleted {
        role: String,
        principal: Option<String>,
        outcome: QuotaOutcome,
        reply: QuotaReply,
    },
    Metrics {
        reply: oneshot::Sender<MetricsSnapshot>,
    },
    /// Runs a pass over the agents queued since the last one.
    Allocate,
    /// Periodic pass over every agent.
    Batch,
    FilterExpired {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        filter_id: u64,
    },
}
