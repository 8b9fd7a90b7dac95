//! Fairness ordering over named clients.
//!
//! A sorter tracks, for each client, what has been allocated to it on each
//! agent, and orders the active clients so that the one furthest below its
//! fair share comes first. The allocator runs one sorter over roles and one
//! per role over that role's frameworks.

mod drf;

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use corral_id::SlaveId;
use corral_resources::Resources;

pub use drf::DrfSorter;

/// Anything usable as a sorter client name.
pub trait ClientName: Clone + Ord + Hash + Debug + Display + Send + 'static {}

impl<T: Clone + Ord + Hash + Debug + Display + Send + 'static> ClientName for T {}

/// Operations the allocator needs from a fairness sorter.
///
/// Misuse such as adding a client twice or allocating to an unknown client
/// is logged and ignored.
pub trait Sorter<C: ClientName>: Send {
    /// Registers a client with an empty allocation. New clients are active.
    fn add_client(&mut self, client: C, weight: f64);

    fn update_weight(&mut self, client: &C, weight: f64);

    /// Forgets a client and its allocation. Unknown clients are ignored.
    fn remove_client(&mut self, client: &C);

    /// Makes a client take part in `sort` again, recomputing its share.
    fn activate(&mut self, client: &C);

    /// Hides a client from `sort` while keeping its allocation history.
    fn deactivate(&mut self, client: &C);

    /// Records an allocation decision for `client` on `slave_id`.
    fn allocated(&mut self, client: &C, slave_id: SlaveId, resources: &Resources);

    /// Replaces part of an allocation, e.g. after an offer operation changed
    /// resource metadata.
    fn update(&mut self, client: &C, slave_id: SlaveId, old: &Resources, new: &Resources);

    /// Returns resources previously allocated to `client`.
    fn unallocated(&mut self, client: &C, slave_id: SlaveId, resources: &Resources);

    fn allocation(&self, client: &C) -> Option<&HashMap<SlaveId, Resources>>;

    /// Everything allocated on `slave_id`, by client.
    fn allocations_on_slave(&self, slave_id: SlaveId) -> HashMap<C, Resources>;

    /// The client's allocation summed over agents as role-free scalars.
    fn allocation_scalar_quantities(&self, client: &C) -> Resources;

    fn total_scalar_quantities(&self) -> &Resources;

    /// Grows the pool the shares are computed against.
    fn add_total(&mut self, resources: &Resources);

    fn remove_total(&mut self, resources: &Resources);

    /// Active clients in ascending order of share, allocation count, name.
    fn sort(&mut self) -> Vec<C>;

    fn contains(&self, client: &C) -> bool;

    fn is_active(&self, client: &C) -> bool;

    /// Number of clients, active or not.
    fn count(&self) -> usize;

    fn share(&self, client: &C) -> Option<f64>;
}
