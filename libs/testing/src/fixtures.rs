//! Test fixtures. These panic on malformed input.

use std::time::Duration;

use corral_allocator::quota::{Quota, QuotaInfo};
use corral_allocator::{AllocatorConfig, Capability, FrameworkInfo, SlaveInfo};
use corral_id::{FrameworkId, SlaveId};
use corral_resources::Resources;

/// Parses `text` such as `cpus:2;mem:1024;ports:[31000-32000]`.
pub fn resources(text: &str) -> Resources {
    Resources::parse(text).unwrap_or_else(|e| panic!("bad resources '{text}': {e}"))
}

/// Parses `text` with every entry reserved for `role`.
pub fn reserved(text: &str, role: &str) -> Resources {
    Resources::parse_with_role(text, role)
        .unwrap_or_else(|e| panic!("bad resources '{text}' for role '{role}': {e}"))
}

/// An agent with a fresh id whose advertised and total resources are `text`.
pub fn agent(hostname: &str, text: &str) -> (SlaveId, SlaveInfo) {
    (SlaveId::new(), SlaveInfo::new(hostname, resources(text)))
}

/// A framework with a fresh id registered in `role`.
pub fn framework(role: &str) -> (FrameworkId, FrameworkInfo) {
    (
        FrameworkId::new(),
        FrameworkInfo::new(format!("framework-{role}"), role),
    )
}

/// A framework that accepts revocable resources.
pub fn revocable_framework(role: &str) -> (FrameworkId, FrameworkInfo) {
    let (id, info) = framework(role);
    (id, info.with_capability(Capability::RevocableResources))
}

/// A quota request whose guarantee is `text` reserved for `role`.
pub fn quota_request(role: &str, text: &str) -> QuotaInfo {
    QuotaInfo::from_resources(reserved(text, role))
}

/// An already granted quota, as handed to `set_quota`.
pub fn quota(role: &str, text: &str) -> Quota {
    Quota::new(role, &resources(text))
}

/// Default configuration with a one second allocation interval.
pub fn config() -> AllocatorConfig {
    AllocatorConfig {
        allocation_interval: Duration::from_secs(1),
        ..AllocatorConfig::default()
    }
}
