//! Per-role resource guarantees.
//!
//! A quota request arrives as a [`QuotaInfo`], is checked structurally by
//! [`validate`], and becomes a [`Quota`] whose guarantee carries no role
//! annotations. [`capacity_heuristic`] and [`plan_rescind`] are the two
//! cluster-wide checks run before a new quota is granted.

mod heuristic;
mod validation;

use corral_resources::{Resource, Resources};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use heuristic::{capacity_heuristic, plan_rescind, RescindCandidate, RescindPlan};
pub use validation::validate;

/// A quota request as handed over by the API layer.
///
/// The guarantee is kept as the raw list of resources so that malformed
/// entries reach validation instead of being dropped. `role` may be empty, in
/// which case the role of the first guarantee entry is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    #[serde(default)]
    pub role: String,
    pub guarantee: Vec<Resource>,
}

impl QuotaInfo {
    pub fn new(role: impl Into<String>, guarantee: impl IntoIterator<Item = Resource>) -> Self {
        Self {
            role: role.into(),
            guarantee: guarantee.into_iter().collect(),
        }
    }

    /// Builds a request whose role is taken from the first resource.
    pub fn from_resources(guarantee: impl IntoIterator<Item = Resource>) -> Self {
        let guarantee: Vec<Resource> = guarantee.into_iter().collect();
        let role = guarantee
            .first()
            .map(|resource| resource.role.clone())
            .unwrap_or_default();
        Self { role, guarantee }
    }
}

/// A granted guarantee for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub role: String,
    /// Role-free scalar quantities.
    pub guarantee: Resources,
}

impl Quota {
    pub fn new(role: impl Into<String>, guarantee: &Resources) -> Self {
        Self {
            role: role.into(),
            guarantee: guarantee.flatten(),
        }
    }
}

impl TryFrom<QuotaInfo> for Quota {
    type Error = QuotaError;

    fn try_from(info: QuotaInfo) -> Result<Self, Self::Error> {
        let role = validate(&info)?;
        Ok(Quota::new(role, &Resources::from(info.guarantee)))
    }
}

/// How an error should surface at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    Conflict,
    Forbidden,
    Internal,
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("{0}")]
    Invalid(String),

    #[error("Unknown role: '{0}'")]
    UnknownRole(String),

    #[error("Can not set quota for role '{0}' that already has quota")]
    AlreadyExists(String),

    #[error("Role '{0}' has no quota set")]
    NotFound(String),

    #[error(
        "Not enough available cluster capacity to reasonably satisfy quota request; \
         the force flag can be used to override this check"
    )]
    InsufficientCapacity,

    #[error("A quota change for role '{0}' is already in progress")]
    InProgress(String),

    #[error("principal {principal:?} is not allowed to change quota of role '{role}'")]
    Unauthorized {
        principal: Option<String>,
        role: String,
    },

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("failed to persist quota change: {0}")]
    Persistence(String),

    #[error("allocator is not running")]
    AllocatorStopped,
}

impl QuotaError {
    pub fn class(&self) -> ErrorClass {
        match self {
            QuotaError::Invalid(_)
            | QuotaError::UnknownRole(_)
            | QuotaError::AlreadyExists(_)
            | QuotaError::NotFound(_) => ErrorClass::BadRequest,
            QuotaError::InsufficientCapacity | QuotaError::InProgress(_) => ErrorClass::Conflict,
            QuotaError::Unauthorized { .. } => ErrorClass::Forbidden,
            QuotaError::AuthorizationFailed(_)
            | QuotaError::Persistence(_)
            | QuotaError::AllocatorStopped => ErrorClass::Internal,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        QuotaError::Invalid(message.into())
    }
}
