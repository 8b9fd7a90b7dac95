//! The `Resources` collection.

use std::collections::BTreeSet;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::resource::{Resource, DEFAULT_ROLE};
use crate::ResourcesError;

/// A multiset of resources.
///
/// Invalid and empty resources are dropped on insertion, and entries that can
/// be merged are merged, so two `Resources` compare equal whenever each
/// contains the other.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Resource>", into = "Vec<Resource>")]
pub struct Resources {
    resources: Vec<Resource>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `name(role):value;...` with unreserved as the default role.
    pub fn parse(text: &str) -> Result<Self, ResourcesError> {
        crate::parse::parse(text, DEFAULT_ROLE)
    }

    /// Parses with `role` applied to entries that do not name one.
    pub fn parse_with_role(text: &str, role: &str) -> Result<Self, ResourcesError> {
        crate::parse::parse(text, role)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.resources.iter()
    }

    /// True if `that` is a sub-multiset of `self`.
    pub fn contains(&self, that: &Resources) -> bool {
        let mut remaining = self.clone();
        for resource in &that.resources {
            if !remaining.contains_resource(resource) {
                return false;
            }
            remaining.subtract_resource(resource);
        }
        true
    }

    pub fn contains_resource(&self, that: &Resource) -> bool {
        self.resources.iter().any(|r| r.contains(that))
    }

    pub fn filter<F>(&self, predicate: F) -> Resources
    where
        F: Fn(&Resource) -> bool,
    {
        self.resources
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    pub fn unreserved(&self) -> Resources {
        self.filter(Resource::is_unreserved)
    }

    /// Resources reserved to `role`, statically or dynamically.
    pub fn reserved(&self, role: &str) -> Resources {
        self.filter(|r| r.is_reserved(Some(role)))
    }

    /// Resources reserved to any role.
    pub fn reserved_any(&self) -> Resources {
        self.filter(|r| r.is_reserved(None))
    }

    pub fn revocable(&self) -> Resources {
        self.filter(|r| r.revocable)
    }

    pub fn non_revocable(&self) -> Resources {
        self.filter(|r| !r.revocable)
    }

    pub fn persistent_volumes(&self) -> Resources {
        self.filter(Resource::is_persistent_volume)
    }

    /// The same quantities with every role reset to `*` and reservation
    /// info removed.
    pub fn flatten(&self) -> Resources {
        self.resources
            .iter()
            .map(|r| {
                let mut r = r.clone();
                r.role = DEFAULT_ROLE.to_owned();
                r.reservation = None;
                r
            })
            .collect()
    }

    /// Scalar quantities only, stripped of role, reservation, disk and
    /// revocable metadata. Used to compare amounts regardless of who holds
    /// them.
    pub fn create_stripped_scalar_quantity(&self) -> Resources {
        self.resources
            .iter()
            .filter_map(|r| {
                r.scalar_value()
                    .map(|value| Resource::scalar(r.name.clone(), value))
            })
            .collect()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.resources.iter().map(|r| r.name.clone()).collect()
    }

    /// Sum of every scalar entry named `name`, across roles.
    pub fn get_scalar(&self, name: &str) -> Option<f64> {
        let mut found = false;
        let mut total = 0.0;
        for value in self
            .resources
            .iter()
            .filter(|r| r.name == name)
            .filter_map(Resource::scalar_value)
        {
            found = true;
            total += value;
        }
        found.then(|| crate::resource::round_scalar(total))
    }

    pub fn cpus(&self) -> Option<f64> {
        self.get_scalar("cpus")
    }

    pub fn mem(&self) -> Option<f64> {
        self.get_scalar("mem")
    }

    /// Applies a sequence of offer operations atomically.
    pub fn apply_all<'a, I>(&self, operations: I) -> Result<Resources, ResourcesError>
    where
        I: IntoIterator<Item = &'a crate::Transformation>,
    {
        operations
            .into_iter()
            .try_fold(self.clone(), |acc, op| acc.apply(op))
    }

    fn add_resource(&mut self, that: &Resource) {
        if that.validate().is_err() || that.is_empty() {
            return;
        }
        match self.resources.iter_mut().find(|r| r.addable(that)) {
            Some(existing) => existing.value.add(&that.value),
            None => self.resources.push(that.clone()),
        }
    }

    fn subtract_resource(&mut self, that: &Resource) {
        if that.validate().is_err() || that.is_empty() {
            return;
        }
        if let Some(index) = self.resources.iter().position(|r| r.subtractable(that)) {
            let existing = &mut self.resources[index];
            existing.value.subtract(&that.value);
            if existing.validate().is_err() || existing.is_empty() {
                self.resources.remove(index);
            }
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<Resource> for Resources {
    fn from(resource: Resource) -> Self {
        let mut out = Resources::new();
        out.add_resource(&resource);
        out
    }
}

impl From<Vec<Resource>> for Resources {
    fn from(resources: Vec<Resource>) -> Self {
        resources.into_iter().collect()
    }
}

impl From<Resources> for Vec<Resource> {
    fn from(resources: Resources) -> Self {
        resources.resources
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<T: IntoIterator<Item = Resource>>(iter: T) -> Self {
        let mut out = Resources::new();
        for resource in iter {
            out.add_resource(&resource);
        }
        out
    }
}

impl<'a> IntoIterator for &'a Resources {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.iter()
    }
}

impl IntoIterator for Resources {
    type Item = Resource;
    type IntoIter = std::vec::IntoIter<Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.into_iter()
    }
}

impl std::str::FromStr for Resources {
    type Err = ResourcesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resources::parse(s)
    }
}

// =============================================================================
// Arithmetic
// =============================================================================

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, rhs: &Resources) {
        for resource in &rhs.resources {
            self.add_resource(resource);
        }
    }
}

impl AddAssign<Resources> for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self += &rhs;
    }
}

impl AddAssign<&Resource> for Resources {
    fn add_assign(&mut self, rhs: &Resource) {
        self.add_resource(rhs);
    }
}

impl SubAssign<&Resources> for Resources {
    fn sub_assign(&mut self, rhs: &Resources) {
        for resource in &rhs.resources {
            self.subtract_resource(resource);
        }
    }
}

impl SubAssign<Resources> for Resources {
    fn sub_assign(&mut self, rhs: Resources) {
        *self -= &rhs;
    }
}

impl SubAssign<&Resource> for Resources {
    fn sub_assign(&mut self, rhs: &Resource) {
        self.subtract_resource(rhs);
    }
}

impl Add<&Resources> for &Resources {
    type Output = Resources;

    fn add(self, rhs: &Resources) -> Resources {
        let mut out = self.clone();
        out += rhs;
        out
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, rhs: Resources) -> Resources {
        self += &rhs;
        self
    }
}

impl Add<&Resources> for Resources {
    type Output = Resources;

    fn add(mut self, rhs: &Resources) -> Resources {
        self += rhs;
        self
    }
}

impl Sub<&Resources> for &Resources {
    type Output = Resources;

    fn sub(self, rhs: &Resources) -> Resources {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(mut self, rhs: Resources) -> Resources {
        self -= &rhs;
        self
    }
}

impl Sub<&Resources> for Resources {
    type Output = Resources;

    fn sub(mut self, rhs: &Resources) -> Resources {
        self -= rhs;
        self
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Self {
        iter.fold(Resources::new(), |acc, r| acc + r)
    }
}

impl<'a> Sum<&'a Resources> for Resources {
    fn sum<I: Iterator<Item = &'a Resources>>(iter: I) -> Self {
        iter.fold(Resources::new(), |mut acc, r| {
            acc += r;
            acc
        })
    }
}

impl PartialEq for Resources {
    fn eq(&self, other: &Self) -> bool {
        self.contains(other) && other.contains(self)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, resource) in self.resources.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{resource}")?;
        }
        Ok(())
    }
}
