use std::time::Duration;

use corral_resources::Resources;

use super::Filters;
use crate::actors::TimerHandle;

/// Keeps a framework from being offered resources it recently declined.
///
/// The expiry timer is cancelled when the filter is dropped, so removing a
/// filter from its framework is all that revival or removal needs to do.
#[derive(Debug)]
pub(crate) struct OfferFilter {
    pub id: u64,
    refused: Resources,
    timer: TimerHandle,
}

impl OfferFilter {
    pub fn new(id: u64, refused: Resources, timer: TimerHandle) -> Self {
        Self { id, refused, timer }
    }

    /// Whether an offer of `resources` should be withheld.
    pub fn filters(&self, resources: &Resources) -> bool {
        self.refused.contains(resources)
    }
}

impl Drop for OfferFilter {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

/// How long a refusal lasts, or `None` if no filter should be installed.
///
/// Negative or unrepresentable durations fall back to `default_refuse`, and
/// a filter never expires before the next periodic allocation.
pub(crate) fn refusal_timeout(
    filters: &Filters,
    default_refuse: Duration,
    allocation_interval: Duration,
) -> Option<Duration> {
    let refuse = if filters.refuse_seconds < 0.0 {
        default_refuse
    } else {
        Duration::try_from_secs_f64(filters.refuse_seconds).unwrap_or(default_refuse)
    };
    if refuse.is_zero() {
        return None;
    }
    Some(refuse.max(allocation_interval))
}
