//! Configuration for the allocator.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Time between periodic allocation passes.
    pub allocation_interval: Duration,

    /// An offer must carry at least this many cpus, or at least
    /// `min_allocatable_mem_mb` of memory.
    pub min_allocatable_cpus: f64,

    pub min_allocatable_mem_mb: f64,

    /// Resource names ignored when computing fair shares.
    pub fairness_exclusions: HashSet<String>,

    /// Refusal used when a framework declines with a negative duration.
    pub default_refuse: Duration,

    /// Hostname whitelist file. `None` offers every agent.
    pub whitelist: Option<PathBuf>,

    /// Known roles and their weights. Empty means any role is accepted.
    pub roles: BTreeMap<String, f64>,

    /// JSON ACL file for quota changes. `None` authorizes everything.
    pub acls: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            allocation_interval: Duration::from_secs(1),
            min_allocatable_cpus: 0.01,
            min_allocatable_mem_mb: 32.0,
            fairness_exclusions: HashSet::new(),
            default_refuse: Duration::from_secs(5),
            whitelist: None,
            roles: BTreeMap::new(),
            acls: None,
            log_level: "info".to_string(),
        }
    }
}

impl AllocatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let allocation_interval = match lookup("CORRAL_ALLOCATION_INTERVAL_MS") {
            Some(value) => {
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("invalid CORRAL_ALLOCATION_INTERVAL_MS '{value}'"))?;
                if ms == 0 {
                    bail!("CORRAL_ALLOCATION_INTERVAL_MS must be positive");
                }
                Duration::from_millis(ms)
            }
            None => defaults.allocation_interval,
        };

        let min_allocatable_cpus = parse_non_negative(
            &lookup,
            "CORRAL_MIN_ALLOCATABLE_CPUS",
            defaults.min_allocatable_cpus,
        )?;
        let min_allocatable_mem_mb = parse_non_negative(
            &lookup,
            "CORRAL_MIN_ALLOCATABLE_MEM_MB",
            defaults.min_allocatable_mem_mb,
        )?;

        let fairness_exclusions = lookup("CORRAL_FAIRNESS_EXCLUDE")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let default_refuse = Duration::from_secs_f64(parse_non_negative(
            &lookup,
            "CORRAL_DEFAULT_REFUSE_SECS",
            defaults.default_refuse.as_secs_f64(),
        )?);

        let whitelist = lookup("CORRAL_WHITELIST")
            .filter(|value| !value.is_empty() && value != "*")
            .map(PathBuf::from);

        let roles = match lookup("CORRAL_ROLES") {
            Some(value) => parse_roles(&value)?,
            None => BTreeMap::new(),
        };

        let acls = lookup("CORRAL_ACLS")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let log_level = lookup("CORRAL_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            allocation_interval,
            min_allocatable_cpus,
            min_allocatable_mem_mb,
            fairness_exclusions,
            default_refuse,
            whitelist,
            roles,
            acls,
            log_level,
        })
    }

    /// Weight of `role`, 1.0 unless configured otherwise.
    pub fn role_weight(&self, role: &str) -> f64 {
        self.roles.get(role).copied().unwrap_or(1.0)
    }
}

fn parse_non_negative(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
) -> Result<f64> {
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    let parsed: f64 = value
        .parse()
        .with_context(|| format!("invalid {key} '{value}'"))?;
    if !parsed.is_finite() || parsed < 0.0 {
        bail!("{key} must be a non-negative number, got '{value}'");
    }
    Ok(parsed)
}

/// Parses `name[:weight],...`.
fn parse_roles(value: &str) -> Result<BTreeMap<String, f64>> {
    let mut roles = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, weight) = match entry.split_once(':') {
            Some((name, weight)) => {
                let weight: f64 = weight
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid weight for role '{name}'"))?;
                (name.trim(), weight)
            }
            None => (entry, 1.0),
        };
        if name.is_empty() {
            bail!("empty role name in CORRAL_ROLES");
        }
        if !weight.is_finite() || weight <= 0.0 {
            bail!("weight of role '{name}' must be positive");
        }
        roles.insert(name.to_string(), weight);
    }
    Ok(roles)
}
