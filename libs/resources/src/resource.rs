//! A single named resource and its value.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ResourcesError;

/// The role of unreserved resources.
pub const DEFAULT_ROLE: &str = "*";

fn default_role() -> String {
    DEFAULT_ROLE.to_owned()
}

/// Scalars are kept at three decimal digits so repeated arithmetic does not
/// accumulate floating point drift.
pub(crate) fn round_scalar(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// =============================================================================
// Ranges
// =============================================================================

/// An inclusive range `[begin, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

impl Range {
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }
}

/// A normalized list of ranges: sorted, non-overlapping and non-adjacent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Range>", into = "Vec<Range>")]
pub struct Ranges(Vec<Range>);

impl Ranges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.0.iter()
    }

    fn normalize(mut ranges: Vec<Range>) -> Vec<Range> {
        ranges.retain(|r| r.begin <= r.end);
        ranges.sort();

        let mut out: Vec<Range> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match out.last_mut() {
                Some(last) if range.begin <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => out.push(range),
            }
        }
        out
    }

    pub fn union(&self, other: &Ranges) -> Ranges {
        let mut all = self.0.clone();
        all.extend_from_slice(&other.0);
        Ranges(Self::normalize(all))
    }

    pub fn difference(&self, other: &Ranges) -> Ranges {
        let mut pieces = self.0.clone();
        for cut in &other.0 {
            let mut next = Vec::with_capacity(pieces.len() + 1);
            for piece in pieces {
                if cut.end < piece.begin || cut.begin > piece.end {
                    next.push(piece);
                    continue;
                }
                if cut.begin > piece.begin {
                    next.push(Range::new(piece.begin, cut.begin - 1));
                }
                if cut.end < piece.end {
                    next.push(Range::new(cut.end + 1, piece.end));
                }
            }
            pieces = next;
        }
        Ranges(Self::normalize(pieces))
    }

    /// True if every value in `other` is covered by `self`.
    pub fn contains(&self, other: &Ranges) -> bool {
        // Normalized ranges are coalesced, so each range of `other` has to
        // fit inside a single range of `self`.
        other.0.iter().all(|needle| {
            self.0
                .iter()
                .any(|r| r.begin <= needle.begin && needle.end <= r.end)
        })
    }
}

impl From<Vec<Range>> for Ranges {
    fn from(ranges: Vec<Range>) -> Self {
        Ranges(Self::normalize(ranges))
    }
}

impl From<Ranges> for Vec<Range> {
    fn from(ranges: Ranges) -> Self {
        ranges.0
    }
}

impl FromIterator<Range> for Ranges {
    fn from_iter<T: IntoIterator<Item = Range>>(iter: T) -> Self {
        Ranges::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl fmt::Display for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}-{}", r.begin, r.end)?;
        }
        f.write_str("]")
    }
}

// =============================================================================
// Value
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Scalar,
    Ranges,
    Set,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Scalar(f64),
    Ranges(Ranges),
    Set(BTreeSet<String>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::Ranges(_) => ValueKind::Ranges,
            Value::Set(_) => ValueKind::Set,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(v) => *v <= 0.0,
            Value::Ranges(r) => r.is_empty(),
            Value::Set(s) => s.is_empty(),
        }
    }

    /// Adds `other` in place. Values of different kinds are left untouched.
    pub(crate) fn add(&mut self, other: &Value) {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => *a = round_scalar(*a + b),
            (Value::Ranges(a), Value::Ranges(b)) => *a = a.union(b),
            (Value::Set(a), Value::Set(b)) => a.extend(b.iter().cloned()),
            _ => {}
        }
    }

    pub(crate) fn subtract(&mut self, other: &Value) {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => *a = round_scalar(*a - b),
            (Value::Ranges(a), Value::Ranges(b)) => *a = a.difference(b),
            (Value::Set(a), Value::Set(b)) => a.retain(|item| !b.contains(item)),
            _ => {}
        }
    }

    pub(crate) fn contains(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => b <= a,
            (Value::Ranges(a), Value::Ranges(b)) => a.contains(b),
            (Value::Set(a), Value::Set(b)) => b.is_subset(a),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(v) => write!(f, "{v}"),
            Value::Ranges(r) => write!(f, "{r}"),
            Value::Set(s) => {
                f.write_str("{")?;
                for (i, item) in s.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(item)?;
                }
                f.write_str("}")
            }
        }
    }
}

// =============================================================================
// Resource
// =============================================================================

/// Marks a resource as dynamically reserved, optionally by a principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

/// Disk metadata; a disk with a persistence id is a persistent volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: Value,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<ReservationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskInfo>,
    #[serde(default)]
    pub revocable: bool,
}

impl Resource {
    fn with_value(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            role: default_role(),
            reservation: None,
            disk: None,
            revocable: false,
        }
    }

    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self::with_value(name, Value::Scalar(round_scalar(value)))
    }

    pub fn ranges(name: impl Into<String>, ranges: impl Into<Ranges>) -> Self {
        Self::with_value(name, Value::Ranges(ranges.into()))
    }

    pub fn set<I, S>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_value(name, Value::Set(items.into_iter().map(Into::into).collect()))
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Marks the resource as dynamically reserved by `principal`.
    #[must_use]
    pub fn reserved_by(mut self, principal: Option<&str>) -> Self {
        self.reservation = Some(ReservationInfo {
            principal: principal.map(str::to_owned),
        });
        self
    }

    #[must_use]
    pub fn with_volume(mut self, persistence_id: &str, container_path: &str) -> Self {
        self.disk = Some(DiskInfo {
            persistence_id: Some(persistence_id.to_owned()),
            container_path: Some(container_path.to_owned()),
        });
        self
    }

    #[must_use]
    pub fn into_revocable(mut self) -> Self {
        self.revocable = true;
        self
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }

    pub fn scalar_value(&self) -> Option<f64> {
        match self.value {
            Value::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_unreserved(&self) -> bool {
        self.role == DEFAULT_ROLE && self.reservation.is_none()
    }

    /// Reserved to `role`, or to any role when `role` is `None`.
    pub fn is_reserved(&self, role: Option<&str>) -> bool {
        self.role != DEFAULT_ROLE && role.is_none_or(|r| self.role == r)
    }

    pub fn is_dynamically_reserved(&self) -> bool {
        self.reservation.is_some()
    }

    pub fn is_persistent_volume(&self) -> bool {
        self.disk
            .as_ref()
            .is_some_and(|d| d.persistence_id.is_some())
    }

    /// Checks the structural rules every resource must satisfy.
    pub fn validate(&self) -> Result<(), ResourcesError> {
        if self.name.is_empty() {
            return Err(ResourcesError::invalid("", "empty resource name"));
        }
        if self.role.is_empty() {
            return Err(ResourcesError::invalid(&self.name, "empty role"));
        }
        match &self.value {
            Value::Scalar(v) if !v.is_finite() || *v < 0.0 => {
                return Err(ResourcesError::invalid(
                    &self.name,
                    format!("scalar value {v} must be finite and non-negative"),
                ));
            }
            Value::Set(items) if items.iter().any(String::is_empty) => {
                return Err(ResourcesError::invalid(&self.name, "empty set item"));
            }
            _ => {}
        }
        if self.disk.is_some() && self.name != "disk" {
            return Err(ResourcesError::invalid(
                &self.name,
                "disk info is only allowed on 'disk' resources",
            ));
        }
        if self.role == DEFAULT_ROLE && self.reservation.is_some() {
            return Err(ResourcesError::invalid(
                &self.name,
                "role '*' cannot be dynamically reserved",
            ));
        }
        Ok(())
    }

    /// Same name, kind and metadata, so the two can be merged into one entry.
    /// Persistent volumes are never merged.
    pub(crate) fn addable(&self, other: &Resource) -> bool {
        self.same_metadata(other) && !self.is_persistent_volume()
    }

    /// Persistent volumes can only be subtracted as a whole.
    pub(crate) fn subtractable(&self, other: &Resource) -> bool {
        if !self.same_metadata(other) {
            return false;
        }
        !self.is_persistent_volume() || self == other
    }

    pub(crate) fn contains(&self, other: &Resource) -> bool {
        self.subtractable(other) && self.value.contains(&other.value)
    }

    fn same_metadata(&self, other: &Resource) -> bool {
        self.name == other.name
            && self.kind() == other.kind()
            && self.role == other.role
            && self.reservation == other.reservation
            && self.disk == other.disk
            && self.revocable == other.revocable
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.name, self.role)?;
        if let Some(reservation) = &self.reservation {
            write!(f, ", {}", reservation.principal.as_deref().unwrap_or(""))?;
        }
        f.write_str(")")?;
        if let Some(disk) = &self.disk {
            write!(
                f,
                "[{}:{}]",
                disk.persistence_id.as_deref().unwrap_or(""),
                disk.container_path.as_deref().unwrap_or("")
            )?;
        }
        if self.revocable {
            f.write_str("{REV}")?;
        }
        write!(f, ":{}", self.value)
    }
}
