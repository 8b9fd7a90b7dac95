//! # corral-resources
//!
//! The `Resources` value type: a multiset of named resources (`cpus`, `mem`,
//! `disk`, `ports`, ...) supporting addition, subtraction, containment and
//! the role/reservation views the allocator reasons about.
//!
//! A resource is scalar (`cpus:2.5`), a set of ranges (`ports:[31000-32000]`)
//! or a set of strings (`zones:{a, b}`). Each resource belongs to a role; the
//! default role `*` means unreserved. A resource reserved to a role may also
//! carry dynamic reservation info, and disk resources may describe a
//! persistent volume.
//!
//! Entries with identical metadata are merged, so a `Resources` value never
//! holds two entries that could be added together.

mod error;
mod parse;
mod resource;
mod resources;
mod transformation;

pub use error::ResourcesError;
pub use resource::{
    DiskInfo, Range, Ranges, ReservationInfo, Resource, Value, ValueKind, DEFAULT_ROLE,
};
pub use resources::Resources;
pub use transformation::Transformation;

/// Validates a single resource in isolation.
pub fn validate_resource(resource: &Resource) -> Result<(), ResourcesError> {
    resource.validate()
}
