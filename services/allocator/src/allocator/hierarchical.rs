//! The allocator process.
//!
//! Resources are divided in two levels: roles compete for agents through a
//! role sorter, and the frameworks of a role compete for the role's share
//! through that role's framework sorter. A third sorter orders the roles that
//! have quota, and every allocation pass first serves those roles until their
//! guarantees are met.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use corral_id::{FrameworkId, SlaveId};
use corral_resources::{Resources, Transformation};
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use super::filters::{refusal_timeout, OfferFilter};
use super::messages::AllocatorMessage;
use super::{
    AllocatorError, Capability, Filters, FrameworkInfo, OfferSink, Offers, Request, SlaveInfo,
};
use crate::actors::{Actor, ActorContext, ActorError, TimerHandle};
use crate::authorizer::Authorizer;
use crate::config::AllocatorConfig;
use crate::metrics::{self, metric_definitions, MetricsSnapshot};
use crate::quota::Quota;
use crate::registrar::Registrar;
use crate::sorter::{ClientName, DrfSorter, Sorter};

pub(super) type Context = ActorContext<AllocatorMessage>;

pub(super) struct Framework {
    pub info: FrameworkInfo,
    pub active: bool,
    /// Refusals by agent.
    filters: HashMap<SlaveId, Vec<OfferFilter>>,
}

impl Framework {
    fn new(info: FrameworkInfo) -> Self {
        Self {
            info,
            active: true,
            filters: HashMap::new(),
        }
    }

    pub fn role(&self) -> &str {
        &self.info.role
    }

    fn accepts_revocable(&self) -> bool {
        self.info.has_capability(Capability::RevocableResources)
    }

    fn is_filtered(&self, slave_id: SlaveId, resources: &Resources) -> bool {
        self.filters
            .get(&slave_id)
            .is_some_and(|filters| filters.iter().any(|f| f.filters(resources)))
    }
}

pub(super) struct Slave {
    pub info: SlaveInfo,
    pub total: Resources,
    /// Everything offered or in use.
    pub allocated: Resources,
    pub activated: bool,
    /// Outstanding offers, by framework.
    pub offered: HashMap<FrameworkId, Resources>,
    /// Resources in use, by framework. Frameworks that have not registered
    /// since the agent did may appear here.
    pub used: HashMap<FrameworkId, Resources>,
}

impl Slave {
    fn available(&self) -> Resources {
        &self.total - &self.allocated
    }

    /// Forgets `resources` returned by a framework, taking them out of what
    /// the framework uses before touching its outstanding offers.
    fn debit(&mut self, framework_id: FrameworkId, resources: &Resources) {
        let rest = debit_entry(&mut self.used, framework_id, resources);
        debit_entry(&mut self.offered, framework_id, &rest);
    }
}

/// Subtracts `resources` from the framework's entry and returns the part the
/// entry did not hold.
fn debit_entry(
    entries: &mut HashMap<FrameworkId, Resources>,
    framework_id: FrameworkId,
    resources: &Resources,
) -> Resources {
    let Some(held) = entries.get_mut(&framework_id) else {
        return resources.clone();
    };
    let before = held.clone();
    *held -= resources;
    let taken = &before - &*held;
    if held.is_empty() {
        entries.remove(&framework_id);
    }
    resources - &taken
}

/// A quota change waiting on authorization or the registry.
#[derive(Debug)]
pub(super) enum PendingQuota {
    Set(Quota),
    Remove,
}

impl PendingQuota {
    pub fn quota(&self) -> Option<&Quota> {
        match self {
            PendingQuota::Set(quota) => Some(quota),
            PendingQuota::Remove => None,
        }
    }
}

pub(crate) struct HierarchicalAllocatorProcess {
    pub(super) config: AllocatorConfig,
    pub(super) offer_sink: Arc<dyn OfferSink>,
    pub(super) registrar: Arc<dyn Registrar>,
    pub(super) authorizer: Option<Arc<dyn Authorizer>>,

    pub(super) frameworks: HashMap<FrameworkId, Framework>,
    pub(super) slaves: HashMap<SlaveId, Slave>,
    /// Agent ids in registration order.
    pub(super) slave_order: Vec<SlaveId>,
    whitelist: Option<HashSet<String>>,

    pub(super) quotas: HashMap<String, Quota>,
    pub(super) pending_quotas: HashMap<String, PendingQuota>,

    role_sorter: Box<dyn Sorter<String>>,
    quota_role_sorter: Box<dyn Sorter<String>>,
    framework_sorters: HashMap<String, Box<dyn Sorter<FrameworkId>>>,

    allocation_pending: bool,
    allocation_candidates: HashSet<SlaveId>,
    batch_timer: Option<TimerHandle>,
    next_filter_id: u64,
    allocation_runs: u64,
    published_total: BTreeMap<String, f64>,
    published_allocated: BTreeMap<String, f64>,
}

impl HierarchicalAllocatorProcess {
    pub(crate) fn new(
        config: AllocatorConfig,
        offer_sink: Arc<dyn OfferSink>,
        registrar: Arc<dyn Registrar>,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Self {
        let role_sorter = new_sorter(&config);
        let quota_role_sorter = new_sorter(&config);
        Self {
            config,
            offer_sink,
            registrar,
            authorizer,
            frameworks: HashMap::new(),
            slaves: HashMap::new(),
            slave_order: Vec::new(),
            whitelist: None,
            quotas: HashMap::new(),
            pending_quotas: HashMap::new(),
            role_sorter,
            quota_role_sorter,
            framework_sorters: HashMap::new(),
            allocation_pending: false,
            allocation_candidates: HashSet::new(),
            batch_timer: None,
            next_filter_id: 0,
            allocation_runs: 0,
            published_total: BTreeMap::new(),
            published_allocated: BTreeMap::new(),
        }
    }

    // =========================================================================
    // Frameworks
    // =========================================================================

    fn add_framework(
        &mut self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
        used: HashMap<SlaveId, Resources>,
        ctx: &Context,
    ) {
        if self.frameworks.contains_key(&framework_id) {
            warn!(framework_id = %framework_id, "Ignoring duplicate framework");
            return;
        }

        let role = info.role.clone();
        if !self.framework_sorters.contains_key(&role) {
            self.role_sorter
                .add_client(role.clone(), self.config.role_weight(&role));
            self.framework_sorters
                .insert(role.clone(), new_sorter(&self.config));
        }
        if let Some(sorter) = self.framework_sorters.get_mut(&role) {
            sorter.add_client(framework_id, 1.0);
        }

        // Resources already in use are known to the agents' bookkeeping;
        // only the sorters need to learn who holds them.
        for (slave_id, resources) in &used {
            self.track_allocated(framework_id, &role, *slave_id, resources);
        }

        info!(
            framework_id = %framework_id,
            name = %info.name,
            role = %role,
            "Added framework"
        );
        self.frameworks.insert(framework_id, Framework::new(info));
        self.request_allocation_all(ctx);
    }

    fn remove_framework(&mut self, framework_id: FrameworkId) {
        let Some(framework) = self.frameworks.remove(&framework_id) else {
            warn!(framework_id = %framework_id, "Cannot remove unknown framework");
            return;
        };
        let role = framework.info.role.clone();

        let allocation: Vec<(SlaveId, Resources)> = self
            .framework_sorters
            .get(&role)
            .and_then(|sorter| sorter.allocation(&framework_id))
            .map(|allocation| allocation.iter().map(|(s, r)| (*s, r.clone())).collect())
            .unwrap_or_default();

        for (slave_id, resources) in allocation {
            self.untrack_allocated(framework_id, &role, slave_id, &resources);
            if let Some(slave) = self.slaves.get_mut(&slave_id) {
                slave.allocated -= &resources;
            }
        }
        for slave in self.slaves.values_mut() {
            slave.offered.remove(&framework_id);
            slave.used.remove(&framework_id);
        }

        if let Some(sorter) = self.framework_sorters.get_mut(&role) {
            sorter.remove_client(&framework_id);
            if sorter.count() == 0 {
                self.framework_sorters.remove(&role);
                self.role_sorter.remove_client(&role);
            }
        }

        // Dropping the framework cancels its refusal timers.
        info!(framework_id = %framework_id, role = %role, "Removed framework");
    }

    fn activate_framework(&mut self, framework_id: FrameworkId, ctx: &Context) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework_id = %framework_id, "Cannot activate unknown framework");
            return;
        };
        framework.active = true;
        if let Some(sorter) = self.framework_sorters.get_mut(&framework.info.role) {
            sorter.activate(&framework_id);
        }
        info!(framework_id = %framework_id, "Activated framework");
        self.request_allocation_all(ctx);
    }

    fn deactivate_framework(&mut self, framework_id: FrameworkId) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework_id = %framework_id, "Cannot deactivate unknown framework");
            return;
        };
        framework.active = false;
        framework.filters.clear();
        if let Some(sorter) = self.framework_sorters.get_mut(&framework.info.role) {
            sorter.deactivate(&framework_id);
        }
        info!(framework_id = %framework_id, "Deactivated framework");
    }

    fn revive_offers(&mut self, framework_id: FrameworkId, ctx: &Context) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework_id = %framework_id, "Cannot revive offers for unknown framework");
            return;
        };
        framework.filters.clear();
        info!(framework_id = %framework_id, "Removed all filters");
        self.request_allocation_all(ctx);
    }

    fn request_resources(&self, framework_id: FrameworkId, requests: Vec<Request>) {
        info!(
            framework_id = %framework_id,
            requests = requests.len(),
            "Received resource request"
        );
    }

    // =========================================================================
    // Agents
    // =========================================================================

    fn add_slave(
        &mut self,
        slave_id: SlaveId,
        info: SlaveInfo,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
        ctx: &Context,
    ) {
        if self.slaves.contains_key(&slave_id) {
            warn!(slave_id = %slave_id, "Ignoring duplicate agent");
            return;
        }

        self.role_sorter.add_total(&total.unreserved());
        self.quota_role_sorter.add_total(&total.non_revocable());

        let mut allocated = Resources::new();
        for (framework_id, resources) in &used {
            allocated += resources;
            let Some(role) = self.frameworks.get(framework_id).map(|f| f.info.role.clone())
            else {
                continue;
            };
            self.track_allocated(*framework_id, &role, slave_id, resources);
        }

        info!(
            slave_id = %slave_id,
            hostname = %info.hostname,
            total = %total,
            allocated = %allocated,
            "Added agent"
        );
        self.slaves.insert(
            slave_id,
            Slave {
                info,
                total,
                allocated,
                activated: true,
                offered: HashMap::new(),
                used,
            },
        );
        self.slave_order.push(slave_id);
        self.request_allocation(ctx, [slave_id]);
    }

    fn remove_slave(&mut self, slave_id: SlaveId) {
        let Some(slave) = self.slaves.remove(&slave_id) else {
            warn!(slave_id = %slave_id, "Cannot remove unknown agent");
            return;
        };

        let held: Vec<(String, FrameworkId, Resources)> = self
            .framework_sorters
            .iter()
            .flat_map(|(role, sorter)| {
                sorter
                    .allocations_on_slave(slave_id)
                    .into_iter()
                    .map(move |(framework_id, resources)| (role.clone(), framework_id, resources))
            })
            .collect();
        for (role, framework_id, resources) in held {
            self.untrack_allocated(framework_id, &role, slave_id, &resources);
        }

        self.role_sorter.remove_total(&slave.total.unreserved());
        self.quota_role_sorter
            .remove_total(&slave.total.non_revocable());

        self.slave_order.retain(|id| *id != slave_id);
        self.allocation_candidates.remove(&slave_id);
        for framework in self.frameworks.values_mut() {
            framework.filters.remove(&slave_id);
        }

        info!(slave_id = %slave_id, hostname = %slave.info.hostname, "Removed agent");
    }

    fn update_slave(&mut self, slave_id: SlaveId, oversubscribed: Resources, ctx: &Context) {
        let Some(slave) = self.slaves.get_mut(&slave_id) else {
            warn!(slave_id = %slave_id, "Cannot update unknown agent");
            return;
        };

        let old_total = std::mem::take(&mut slave.total);
        let new_total = old_total.non_revocable() + oversubscribed.revocable();
        slave.total = new_total.clone();

        self.swap_sorter_totals(&old_total, &new_total);

        info!(
            slave_id = %slave_id,
            oversubscribed = %oversubscribed.revocable(),
            total = %new_total,
            "Updated agent"
        );
        self.request_allocation(ctx, [slave_id]);
    }

    fn set_slave_activated(&mut self, slave_id: SlaveId, activated: bool, ctx: &Context) {
        let Some(slave) = self.slaves.get_mut(&slave_id) else {
            warn!(slave_id = %slave_id, activated, "Cannot change state of unknown agent");
            return;
        };
        slave.activated = activated;
        if activated {
            info!(slave_id = %slave_id, "Activated agent");
            self.request_allocation(ctx, [slave_id]);
        } else {
            info!(slave_id = %slave_id, "Deactivated agent");
        }
    }

    fn update_whitelist(&mut self, whitelist: Option<HashSet<String>>) {
        match &whitelist {
            None => info!("Advertising offers for all agents"),
            Some(hosts) if hosts.is_empty() => {
                warn!("Whitelist is empty, no offers will be made!")
            }
            Some(hosts) => info!(hosts = hosts.len(), "Updated agent whitelist"),
        }
        self.whitelist = whitelist;
    }

    fn is_whitelisted(&self, hostname: &str) -> bool {
        self.whitelist
            .as_ref()
            .is_none_or(|hosts| hosts.contains(hostname))
    }

    // =========================================================================
    // Resource changes
    // =========================================================================

    fn update_allocation(
        &mut self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        operations: &[Transformation],
    ) {
        let Some(role) = self.frameworks.get(&framework_id).map(|f| f.info.role.clone()) else {
            warn!(framework_id = %framework_id, "Cannot update allocation of unknown framework");
            return;
        };
        let Some(slave) = self.slaves.get(&slave_id) else {
            warn!(slave_id = %slave_id, "Cannot update allocation on unknown agent");
            return;
        };

        let allocation = self
            .framework_sorters
            .get(&role)
            .and_then(|sorter| sorter.allocation(&framework_id))
            .and_then(|allocation| allocation.get(&slave_id))
            .cloned()
            .unwrap_or_default();

        let (updated, new_total) = match allocation
            .apply_all(operations)
            .and_then(|updated| Ok((updated, slave.total.apply_all(operations)?)))
        {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    framework_id = %framework_id,
                    slave_id = %slave_id,
                    error = %e,
                    "Failed to update allocation"
                );
                return;
            }
        };

        if let Some(sorter) = self.framework_sorters.get_mut(&role) {
            sorter.update(&framework_id, slave_id, &allocation, &updated);
            sorter.remove_total(&allocation);
            sorter.add_total(&updated);
        }
        self.role_sorter.update(
            &role,
            slave_id,
            &allocation.unreserved(),
            &updated.unreserved(),
        );
        if self.quotas.contains_key(&role) {
            self.quota_role_sorter.update(
                &role,
                slave_id,
                &allocation.non_revocable(),
                &updated.non_revocable(),
            );
        }

        let Some(slave) = self.slaves.get_mut(&slave_id) else {
            return;
        };
        let old_total = std::mem::replace(&mut slave.total, new_total.clone());
        slave.allocated -= &allocation;
        slave.allocated += &updated;
        // Operations run against either an outstanding offer or resources
        // already in use.
        for entries in [&mut slave.offered, &mut slave.used] {
            if let Some(held) = entries.get_mut(&framework_id) {
                if let Ok(transformed) = held.apply_all(operations) {
                    *held = transformed;
                    break;
                }
            }
        }
        self.swap_sorter_totals(&old_total, &new_total);

        info!(
            framework_id = %framework_id,
            slave_id = %slave_id,
            allocation = %updated,
            "Updated allocation"
        );
    }

    fn update_available(
        &mut self,
        slave_id: SlaveId,
        operations: &[Transformation],
    ) -> Result<(), AllocatorError> {
        let slave = self
            .slaves
            .get_mut(&slave_id)
            .ok_or(AllocatorError::UnknownSlave(slave_id))?;

        // The operations must fit in what is not allocated.
        slave.available().apply_all(operations)?;

        let new_total = slave.total.apply_all(operations)?;
        let old_total = std::mem::replace(&mut slave.total, new_total.clone());
        self.swap_sorter_totals(&old_total, &new_total);

        debug!(slave_id = %slave_id, total = %new_total, "Updated available resources");
        Ok(())
    }

    fn recover_resources(
        &mut self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
        filters: Option<Filters>,
        ctx: &Context,
    ) {
        if resources.is_empty() {
            return;
        }

        self.release(framework_id, slave_id, &resources);
        if let Some(slave) = self.slaves.get_mut(&slave_id) {
            slave.debit(framework_id, &resources);
            debug!(
                framework_id = %framework_id,
                slave_id = %slave_id,
                recovered = %resources,
                allocated = %slave.allocated,
                "Recovered resources"
            );
        }

        let Some(filters) = filters else {
            return;
        };
        if !self.frameworks.contains_key(&framework_id) {
            return;
        }
        let Some(timeout) = refusal_timeout(
            &filters,
            self.config.default_refuse,
            self.config.allocation_interval,
        ) else {
            return;
        };

        let filter_id = self.next_filter_id;
        self.next_filter_id += 1;
        let timer = ctx.delay(
            timeout,
            AllocatorMessage::FilterExpired {
                framework_id,
                slave_id,
                filter_id,
            },
        );
        if let Some(framework) = self.frameworks.get_mut(&framework_id) {
            framework
                .filters
                .entry(slave_id)
                .or_default()
                .push(OfferFilter::new(filter_id, resources.clone(), timer));
        }
        debug!(
            framework_id = %framework_id,
            slave_id = %slave_id,
            refused = %resources,
            timeout = ?timeout,
            "Installed offer filter"
        );
    }

    /// Returns resources held by a framework to the agent's free pool.
    /// Sorters only change if the framework is registered.
    fn release(&mut self, framework_id: FrameworkId, slave_id: SlaveId, resources: &Resources) {
        match self.frameworks.get(&framework_id).map(|f| f.info.role.clone()) {
            Some(role)
                if self
                    .framework_sorters
                    .get(&role)
                    .is_some_and(|sorter| sorter.contains(&framework_id)) =>
            {
                self.untrack_allocated(framework_id, &role, slave_id, resources);
            }
            Some(_) => {}
            None => debug!(
                framework_id = %framework_id,
                resources = %resources,
                "Released resources of unknown framework"
            ),
        }
        if let Some(slave) = self.slaves.get_mut(&slave_id) {
            slave.allocated -= resources;
        }
    }

    fn offer_accepted(&mut self, framework_id: FrameworkId, slave_id: SlaveId, resources: &Resources) {
        let Some(slave) = self.slaves.get_mut(&slave_id) else {
            return;
        };
        let accepted = resources - &debit_entry(&mut slave.offered, framework_id, resources);
        if !accepted.is_empty() {
            *slave.used.entry(framework_id).or_default() += accepted;
        }
    }

    fn expire_filter(&mut self, framework_id: FrameworkId, slave_id: SlaveId, filter_id: u64) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        if let Some(filters) = framework.filters.get_mut(&slave_id) {
            filters.retain(|filter| filter.id != filter_id);
            if filters.is_empty() {
                framework.filters.remove(&slave_id);
            }
        }
        debug!(framework_id = %framework_id, slave_id = %slave_id, "Expired offer filter");
    }

    /// Takes back every outstanding offer on the agent.
    pub(super) fn rescind_offers(&mut self, slave_id: SlaveId) {
        let Some(slave) = self.slaves.get_mut(&slave_id) else {
            return;
        };
        let offers: Vec<(FrameworkId, Resources)> = slave.offered.drain().collect();
        for (framework_id, resources) in offers {
            self.offer_sink.rescind(framework_id, slave_id, &resources);
            self.release(framework_id, slave_id, &resources);
        }
    }

    // =========================================================================
    // Quota
    // =========================================================================

    pub(super) fn set_quota(&mut self, quota: Quota, ctx: &Context) {
        if self.quotas.contains_key(&quota.role) {
            warn!(role = %quota.role, "Ignoring quota for role that already has quota");
            return;
        }
        let role = quota.role.clone();
        self.quota_role_sorter
            .add_client(role.clone(), self.config.role_weight(&role));

        // The role may already hold resources that count towards its quota.
        let mut held = Vec::new();
        if let Some(sorter) = self.framework_sorters.get(&role) {
            for (framework_id, _) in self.frameworks.iter().filter(|(_, f)| f.role() == role) {
                if let Some(allocation) = sorter.allocation(framework_id) {
                    held.extend(allocation.iter().map(|(s, r)| (*s, r.non_revocable())));
                }
            }
        }
        for (slave_id, resources) in held {
            self.quota_role_sorter.allocated(&role, slave_id, &resources);
        }

        info!(role = %role, guarantee = %quota.guarantee, "Set quota");
        self.quotas.insert(role, quota);
        self.request_allocation_all(ctx);
    }

    pub(super) fn remove_quota(&mut self, role: &str, ctx: &Context) {
        if self.quotas.remove(role).is_none() {
            warn!(role, "Cannot remove quota of role without quota");
            return;
        }
        self.quota_role_sorter.remove_client(&role.to_owned());
        info!(role, "Removed quota");
        self.request_allocation_all(ctx);
    }

    // =========================================================================
    // Sorter bookkeeping
    // =========================================================================

    /// Records `resources` on `slave_id` as held by the framework, in the
    /// framework's sorter and in the role-level sorters.
    fn track_allocated(
        &mut self,
        framework_id: FrameworkId,
        role: &str,
        slave_id: SlaveId,
        resources: &Resources,
    ) {
        if let Some(sorter) = self.framework_sorters.get_mut(role) {
            sorter.add_total(resources);
            sorter.allocated(&framework_id, slave_id, resources);
        }
        let role = role.to_owned();
        self.role_sorter
            .allocated(&role, slave_id, &resources.unreserved());
        if self.quotas.contains_key(&role) {
            self.quota_role_sorter
                .allocated(&role, slave_id, &resources.non_revocable());
        }
    }

    fn untrack_allocated(
        &mut self,
        framework_id: FrameworkId,
        role: &str,
        slave_id: SlaveId,
        resources: &Resources,
    ) {
        if let Some(sorter) = self.framework_sorters.get_mut(role) {
            sorter.unallocated(&framework_id, slave_id, resources);
            sorter.remove_total(resources);
        }
        let role = role.to_owned();
        self.role_sorter
            .unallocated(&role, slave_id, &resources.unreserved());
        if self.quotas.contains_key(&role) {
            self.quota_role_sorter
                .unallocated(&role, slave_id, &resources.non_revocable());
        }
    }

    fn swap_sorter_totals(&mut self, old_total: &Resources, new_total: &Resources) {
        self.role_sorter.remove_total(&old_total.unreserved());
        self.role_sorter.add_total(&new_total.unreserved());
        self.quota_role_sorter
            .remove_total(&old_total.non_revocable());
        self.quota_role_sorter.add_total(&new_total.non_revocable());
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Queues agents for the next pass. Triggers arriving before that pass
    /// runs are coalesced into it.
    fn request_allocation(&mut self, ctx: &Context, slave_ids: impl IntoIterator<Item = SlaveId>) {
        self.allocation_candidates.extend(slave_ids);
        if !self.allocation_pending {
            self.allocation_pending = true;
            ctx.notify(AllocatorMessage::Allocate);
        }
    }

    fn request_allocation_all(&mut self, ctx: &Context) {
        let slave_ids = self.slave_order.clone();
        self.request_allocation(ctx, slave_ids);
    }

    fn allocatable(&self, resources: &Resources) -> bool {
        resources
            .cpus()
            .is_some_and(|cpus| cpus >= self.config.min_allocatable_cpus)
            || resources
                .mem()
                .is_some_and(|mem| mem >= self.config.min_allocatable_mem_mb)
    }

    fn is_filtered(&self, framework_id: FrameworkId, slave_id: SlaveId, resources: &Resources) -> bool {
        self.frameworks
            .get(&framework_id)
            .is_some_and(|framework| framework.is_filtered(slave_id, resources))
    }

    /// Moves `resources` from the agent's free pool to the framework's
    /// pending offer.
    fn allocate_to(
        &mut self,
        framework_id: FrameworkId,
        role: &str,
        slave_id: SlaveId,
        resources: Resources,
        offerable: &mut HashMap<FrameworkId, Offers>,
    ) {
        debug!(
            framework_id = %framework_id,
            slave_id = %slave_id,
            resources = %resources,
            "Allocating resources"
        );
        if let Some(slave) = self.slaves.get_mut(&slave_id) {
            slave.allocated += &resources;
            *slave.offered.entry(framework_id).or_default() += &resources;
        }
        self.track_allocated(framework_id, role, slave_id, &resources);
        *offerable
            .entry(framework_id)
            .or_default()
            .entry(slave_id)
            .or_default() += resources;
    }

    #[instrument(skip_all, fields(slaves = slave_ids.len()))]
    fn allocate(&mut self, slave_ids: Vec<SlaveId>) {
        let started = Instant::now();

        let mut slave_ids: Vec<SlaveId> = slave_ids
            .into_iter()
            .filter(|slave_id| {
                self.slaves.get(slave_id).is_some_and(|slave| {
                    slave.activated && self.is_whitelisted(&slave.info.hostname)
                })
            })
            .collect();
        slave_ids.shuffle(&mut rand::rng());

        let mut offerable: HashMap<FrameworkId, Offers> = HashMap::new();

        // Stage 1: roles below their quota guarantee.
        for &slave_id in &slave_ids {
            for role in self.quota_role_sorter.sort() {
                let Some(guarantee) = self
                    .quotas
                    .get(&role)
                    .map(|quota| quota.guarantee.create_stripped_scalar_quantity())
                else {
                    continue;
                };
                if self
                    .quota_role_sorter
                    .allocation_scalar_quantities(&role)
                    .contains(&guarantee)
                {
                    continue;
                }
                let Some(sorter) = self.framework_sorters.get_mut(&role) else {
                    continue;
                };

                for framework_id in sorter.sort() {
                    let Some(available) = self.slaves.get(&slave_id).map(Slave::available) else {
                        break;
                    };
                    let resources =
                        (available.unreserved() + available.reserved(&role)).non_revocable();
                    if !self.allocatable(&resources)
                        || self.is_filtered(framework_id, slave_id, &resources)
                    {
                        continue;
                    }
                    self.allocate_to(framework_id, &role, slave_id, resources, &mut offerable);
                }
            }
        }

        // Unreserved resources left once every quota's unmet part is set
        // aside. Fair-share allocation may not dip into that part.
        let mut remaining: Resources = slave_ids
            .iter()
            .filter_map(|slave_id| self.slaves.get(slave_id))
            .map(|slave| {
                slave
                    .available()
                    .unreserved()
                    .non_revocable()
                    .create_stripped_scalar_quantity()
            })
            .sum();
        for (role, quota) in &self.quotas {
            let consumed = self.quota_role_sorter.allocation_scalar_quantities(role);
            remaining -= &quota.guarantee.create_stripped_scalar_quantity() - &consumed;
        }
        let mut allocated_fair_share = Resources::new();

        // Stage 2: every role by fair share.
        for &slave_id in &slave_ids {
            for role in self.role_sorter.sort() {
                let Some(sorter) = self.framework_sorters.get_mut(&role) else {
                    continue;
                };

                for framework_id in sorter.sort() {
                    let Some(available) = self.slaves.get(&slave_id).map(Slave::available) else {
                        break;
                    };
                    let mut resources = available.unreserved() + available.reserved(&role);
                    let accepts_revocable = self
                        .frameworks
                        .get(&framework_id)
                        .is_some_and(Framework::accepts_revocable);
                    if !accepts_revocable {
                        resources = resources.non_revocable();
                    }

                    let unreserved = resources.unreserved().non_revocable();
                    let wanted = &allocated_fair_share + &unreserved.create_stripped_scalar_quantity();
                    if !remaining.contains(&wanted) {
                        resources -= &unreserved;
                    }

                    if !self.allocatable(&resources)
                        || self.is_filtered(framework_id, slave_id, &resources)
                    {
                        continue;
                    }
                    allocated_fair_share += resources
                        .unreserved()
                        .non_revocable()
                        .create_stripped_scalar_quantity();
                    self.allocate_to(framework_id, &role, slave_id, resources, &mut offerable);
                }
            }
        }

        let frameworks = offerable.len();
        for (framework_id, offers) in offerable {
            self.offer_sink.offer(framework_id, offers);
        }

        self.allocation_runs += 1;
        metrics::record_allocation_run();
        self.publish_metrics();

        debug!(
            frameworks,
            elapsed = ?started.elapsed(),
            "Performed allocation"
        );
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    fn scalar_totals(&self) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
        let total: Resources = self.slaves.values().map(|slave| &slave.total).sum();
        let allocated: Resources = self.slaves.values().map(|slave| &slave.allocated).sum();
        (metrics::scalar_map(&total), metrics::scalar_map(&allocated))
    }

    fn publish_metrics(&mut self) {
        let (total, allocated) = self.scalar_totals();
        metrics::record_resources(
            metric_definitions::TOTAL_PREFIX,
            &total,
            &self.published_total,
        );
        metrics::record_resources(
            metric_definitions::ALLOCATED_PREFIX,
            &allocated,
            &self.published_allocated,
        );
        self.published_total = total;
        self.published_allocated = allocated;
    }

    fn snapshot(&self, ctx: &Context) -> MetricsSnapshot {
        let (total, allocated) = self.scalar_totals();
        MetricsSnapshot {
            event_queue_dispatches: ctx.handle().pending(),
            allocation_runs: self.allocation_runs,
            total,
            allocated,
        }
    }
}

fn new_sorter<C: ClientName>(config: &AllocatorConfig) -> Box<dyn Sorter<C>> {
    Box::new(DrfSorter::with_exclusions(
        config.fairness_exclusions.clone(),
    ))
}

#[async_trait]
impl Actor for HierarchicalAllocatorProcess {
    type Message = AllocatorMessage;

    fn name(&self) -> &str {
        "allocator"
    }

    async fn on_start(&mut self, ctx: &mut Context) -> Result<(), ActorError> {
        for quota in self.registrar.recover().await? {
            info!(role = %quota.role, "Recovered quota");
            self.set_quota(quota, ctx);
        }
        self.batch_timer = Some(ctx.delay(self.config.allocation_interval, AllocatorMessage::Batch));
        info!(
            interval = ?self.config.allocation_interval,
            quotas = self.quotas.len(),
            "Allocator started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &mut Context) {
        if let Some(timer) = self.batch_timer.take() {
            timer.cancel();
        }
        for framework in self.frameworks.values_mut() {
            framework.filters.clear();
        }
    }

    async fn handle(
        &mut self,
        msg: AllocatorMessage,
        ctx: &mut Context,
    ) -> Result<bool, ActorError> {
        metrics::record_queue_depth(ctx.handle().pending());

        match msg {
            AllocatorMessage::AddFramework {
                framework_id,
                info,
                used,
            } => self.add_framework(framework_id, info, used, ctx),
            AllocatorMessage::RemoveFramework { framework_id } => {
                self.remove_framework(framework_id)
            }
            AllocatorMessage::ActivateFramework { framework_id } => {
                self.activate_framework(framework_id, ctx)
            }
            AllocatorMessage::DeactivateFramework { framework_id } => {
                self.deactivate_framework(framework_id)
            }
            AllocatorMessage::AddSlave {
                slave_id,
                info,
                total,
                used,
            } => self.add_slave(slave_id, info, total, used, ctx),
            AllocatorMessage::RemoveSlave { slave_id } => self.remove_slave(slave_id),
            AllocatorMessage::UpdateSlave {
                slave_id,
                oversubscribed,
            } => self.update_slave(slave_id, oversubscribed, ctx),
            AllocatorMessage::ActivateSlave { slave_id } => {
                self.set_slave_activated(slave_id, true, ctx)
            }
            AllocatorMessage::DeactivateSlave { slave_id } => {
                self.set_slave_activated(slave_id, false, ctx)
            }
            AllocatorMessage::UpdateWhitelist { whitelist } => self.update_whitelist(whitelist),
            AllocatorMessage::RequestResources {
                framework_id,
                requests,
            } => self.request_resources(framework_id, requests),
            AllocatorMessage::UpdateAllocation {
                framework_id,
                slave_id,
                operations,
            } => self.update_allocation(framework_id, slave_id, &operations),
            AllocatorMessage::UpdateAvailable {
                slave_id,
                operations,
                reply,
            } => {
                let result = self.update_available(slave_id, &operations);
                if let Err(e) = &result {
                    warn!(slave_id = %slave_id, error = %e, "Failed to update available resources");
                }
                let _ = reply.send(result);
            }
            AllocatorMessage::RecoverResources {
                framework_id,
                slave_id,
                resources,
                filters,
            } => self.recover_resources(framework_id, slave_id, resources, filters, ctx),
            AllocatorMessage::OfferAccepted {
                framework_id,
                slave_id,
                resources,
            } => self.offer_accepted(framework_id, slave_id, &resources),
            AllocatorMessage::ReviveOffers { framework_id } => {
                self.revive_offers(framework_id, ctx)
            }
            AllocatorMessage::SetQuota { quota } => self.set_quota(quota, ctx),
            AllocatorMessage::RemoveQuota { role } => self.remove_quota(&role, ctx),
            AllocatorMessage::RequestSetQuota {
                info,
                force,
                principal,
                reply,
            } => self.request_set_quota(info, force, principal, reply, ctx),
            AllocatorMessage::RequestRemoveQuota {
                role,
                principal,
                reply,
            } => self.request_remove_quota(role, principal, reply, ctx),
            AllocatorMessage::SetQuotaCompleted {
                quota,
                principal,
                outcome,
                reply,
            } => self.complete_set_quota(quota, principal, outcome, reply, ctx)?,
            AllocatorMessage::RemoveQuotaCompleted {
                role,
                principal,
                outcome,
                reply,
            } => self.complete_remove_quota(role, principal, outcome, reply, ctx)?,
            AllocatorMessage::Metrics { reply } => {
                let _ = reply.send(self.snapshot(ctx));
            }
            AllocatorMessage::Allocate => {
                self.allocation_pending = false;
                let candidates: Vec<SlaveId> = self.allocation_candidates.drain().collect();
                self.allocate(candidates);
            }
            AllocatorMessage::Batch => {
                self.allocate(self.slave_order.clone());
                self.batch_timer =
                    Some(ctx.delay(self.config.allocation_interval, AllocatorMessage::Batch));
            }
            AllocatorMessage::FilterExpired {
                framework_id,
                slave_id,
                filter_id,
            } => self.expire_filter(framework_id, slave_id, filter_id),
        }

        Ok(true)
    }
}
