use corral_id::SlaveId;
use corral_resources::Resources;

use super::{Quota, QuotaError};

/// Checks whether the cluster could plausibly satisfy `request` on top of
/// every quota already granted.
///
/// `agents` yields the static resources of each active agent. Only
/// unreserved resources count, and the sum stops as soon as it covers the
/// combined guarantee.
pub fn capacity_heuristic<'a>(
    request: &Quota,
    existing: impl IntoIterator<Item = &'a Quota>,
    agents: impl IntoIterator<Item = &'a Resources>,
) -> Result<(), QuotaError> {
    let mut total_quota = request.guarantee.clone();
    for quota in existing {
        total_quota += &quota.guarantee;
    }
    let total_quota = total_quota.flatten();

    let mut available = Resources::new();
    for resources in agents {
        available += resources.unreserved();
        if available.contains(&total_quota) {
            return Ok(());
        }
    }

    if available.contains(&total_quota) {
        Ok(())
    } else {
        Err(QuotaError::InsufficientCapacity)
    }
}

/// An agent considered for offer rescission, in registration order.
#[derive(Debug, Clone)]
pub struct RescindCandidate {
    pub slave_id: SlaveId,
    pub active: bool,
    /// Resources currently tied up in outstanding offers on the agent.
    pub offered: Resources,
}

/// The agents whose offers should all be rescinded.
#[derive(Debug, Clone, Default)]
pub struct RescindPlan {
    pub slaves: Vec<SlaveId>,
    pub rescinded: Resources,
}

/// Greedily picks whole agents until the rescinded offers cover `guarantee`
/// and at least `frameworks` agents have been visited.
///
/// Inactive agents are skipped. Requiring one visited agent per framework of
/// the role gives each of them a chance at the freed resources.
pub fn plan_rescind(
    guarantee: &Resources,
    frameworks: usize,
    candidates: impl IntoIterator<Item = RescindCandidate>,
) -> RescindPlan {
    let guarantee = guarantee.flatten();
    let mut plan = RescindPlan::default();

    for candidate in candidates {
        if plan.rescinded.contains(&guarantee) && plan.slaves.len() >= frameworks {
            break;
        }
        if !candidate.active {
            continue;
        }
        plan.rescinded += candidate.offered;
        plan.slaves.push(candidate.slave_id);
    }
    plan
}
