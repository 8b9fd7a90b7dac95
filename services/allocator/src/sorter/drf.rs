//! Dominant resource fairness.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use corral_id::SlaveId;
use corral_resources::Resources;
use tracing::warn;

use super::{ClientName, Sorter};

/// Position of an active client in the ordering.
#[derive(Debug, Clone)]
struct Rank<C> {
    share: f64,
    allocations: u64,
    name: C,
}

impl<C: Ord> PartialEq for Rank<C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<C: Ord> Eq for Rank<C> {}

impl<C: Ord> PartialOrd for Rank<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C: Ord> Ord for Rank<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.share
            .total_cmp(&other.share)
            .then(self.allocations.cmp(&other.allocations))
            .then_with(|| self.name.cmp(&other.name))
    }
}

#[derive(Debug, Default)]
struct Client {
    weight: f64,
    share: f64,
    allocations: u64,
    active: bool,
    allocation: HashMap<SlaveId, Resources>,
    scalar_quantities: Resources,
}

/// Orders clients by their dominant share: the largest fraction of any
/// resource in the pool that the client holds, divided by its weight.
///
/// Changing the pool or rewriting an allocation invalidates every share at
/// once; those paths only mark the sorter dirty and the next `sort` call
/// recomputes everything. Allocating or returning resources moves a single
/// client and is applied eagerly while the sorter is clean.
#[derive(Debug)]
pub struct DrfSorter<C: ClientName> {
    clients: HashMap<C, Client>,
    ranking: BTreeSet<Rank<C>>,
    total: Resources,
    fairness_exclusions: HashSet<String>,
    dirty: bool,
}

impl<C: ClientName> Default for DrfSorter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ClientName> DrfSorter<C> {
    pub fn new() -> Self {
        Self::with_exclusions(HashSet::new())
    }

    /// A sorter that ignores the named resources when computing shares.
    pub fn with_exclusions(fairness_exclusions: HashSet<String>) -> Self {
        Self {
            clients: HashMap::new(),
            ranking: BTreeSet::new(),
            total: Resources::new(),
            fairness_exclusions,
            dirty: false,
        }
    }

    fn calculate_share(&self, client: &Client) -> f64 {
        let mut share = 0.0_f64;
        for name in self.total.names() {
            if self.fairness_exclusions.contains(&name) {
                continue;
            }
            let Some(total) = self.total.get_scalar(&name) else {
                continue;
            };
            if total > 0.0 {
                let allocated = client.scalar_quantities.get_scalar(&name).unwrap_or(0.0);
                share = share.max(allocated / total);
            }
        }
        share / client.weight
    }

    /// Takes the client out of the ranking, lets `change` mutate it, then
    /// puts it back. The share is refreshed unless a full recompute is
    /// already pending.
    fn reposition(&mut self, name: &C, change: impl FnOnce(&mut Client)) -> bool {
        let Some(mut client) = self.clients.remove(name) else {
            return false;
        };
        if client.active {
            self.ranking.remove(&Rank {
                share: client.share,
                allocations: client.allocations,
                name: name.clone(),
            });
        }

        change(&mut client);
        if !self.dirty {
            client.share = self.calculate_share(&client);
        }

        if client.active {
            self.ranking.insert(Rank {
                share: client.share,
                allocations: client.allocations,
                name: name.clone(),
            });
        }
        self.clients.insert(name.clone(), client);
        true
    }

    fn recompute(&mut self) {
        let shares: Vec<(C, f64)> = self
            .clients
            .iter()
            .map(|(name, client)| (name.clone(), self.calculate_share(client)))
            .collect();

        self.ranking.clear();
        for (name, share) in shares {
            if let Some(client) = self.clients.get_mut(&name) {
                client.share = share;
                if client.active {
                    self.ranking.insert(Rank {
                        share,
                        allocations: client.allocations,
                        name,
                    });
                }
            }
        }
        self.dirty = false;
    }
}

impl<C: ClientName> Sorter<C> for DrfSorter<C> {
    fn add_client(&mut self, client: C, weight: f64) {
        if self.clients.contains_key(&client) {
            warn!(%client, "client is already known to the sorter");
            return;
        }
        let mut state = Client {
            weight,
            active: true,
            ..Client::default()
        };
        state.share = self.calculate_share(&state);
        self.ranking.insert(Rank {
            share: state.share,
            allocations: 0,
            name: client.clone(),
        });
        self.clients.insert(client, state);
    }

    fn update_weight(&mut self, client: &C, weight: f64) {
        if !self.reposition(client, |state| state.weight = weight) {
            warn!(%client, "cannot update weight of unknown client");
        }
    }

    fn remove_client(&mut self, client: &C) {
        if let Some(state) = self.clients.remove(client) {
            if state.active {
                self.ranking.remove(&Rank {
                    share: state.share,
                    allocations: state.allocations,
                    name: client.clone(),
                });
            }
        }
    }

    fn activate(&mut self, client: &C) {
        let Some(state) = self.clients.get(client) else {
            warn!(%client, "cannot activate unknown client");
            return;
        };
        if state.active {
            return;
        }
        let share = self.calculate_share(state);
        if let Some(state) = self.clients.get_mut(client) {
            state.active = true;
            state.share = share;
            self.ranking.insert(Rank {
                share,
                allocations: state.allocations,
                name: client.clone(),
            });
        }
    }

    fn deactivate(&mut self, client: &C) {
        let Some(state) = self.clients.get_mut(client) else {
            warn!(%client, "cannot deactivate unknown client");
            return;
        };
        if !state.active {
            return;
        }
        state.active = false;
        self.ranking.remove(&Rank {
            share: state.share,
            allocations: state.allocations,
            name: client.clone(),
        });
    }

    fn allocated(&mut self, client: &C, slave_id: SlaveId, resources: &Resources) {
        let known = self.reposition(client, |state| {
            *state.allocation.entry(slave_id).or_default() += resources;
            state.scalar_quantities += resources.create_stripped_scalar_quantity();
            state.allocations += 1;
        });
        if !known {
            warn!(%client, %slave_id, "allocation to unknown client ignored");
        }
    }

    fn update(&mut self, client: &C, slave_id: SlaveId, old: &Resources, new: &Resources) {
        let Some(state) = self.clients.get_mut(client) else {
            warn!(%client, %slave_id, "update for unknown client ignored");
            return;
        };
        let allocation = state.allocation.entry(slave_id).or_default();
        *allocation -= old;
        *allocation += new;
        if allocation.is_empty() {
            state.allocation.remove(&slave_id);
        }
        state.scalar_quantities -= old.create_stripped_scalar_quantity();
        state.scalar_quantities += new.create_stripped_scalar_quantity();
        self.dirty = true;
    }

    fn unallocated(&mut self, client: &C, slave_id: SlaveId, resources: &Resources) {
        let known = self.reposition(client, |state| {
            if let Some(allocation) = state.allocation.get_mut(&slave_id) {
                *allocation -= resources;
                if allocation.is_empty() {
                    state.allocation.remove(&slave_id);
                }
            }
            state.scalar_quantities -= resources.create_stripped_scalar_quantity();
        });
        if !known {
            warn!(%client, %slave_id, "unallocation for unknown client ignored");
        }
    }

    fn allocation(&self, client: &C) -> Option<&HashMap<SlaveId, Resources>> {
        self.clients.get(client).map(|state| &state.allocation)
    }

    fn allocations_on_slave(&self, slave_id: SlaveId) -> HashMap<C, Resources> {
        self.clients
            .iter()
            .filter_map(|(name, state)| {
                state
                    .allocation
                    .get(&slave_id)
                    .map(|resources| (name.clone(), resources.clone()))
            })
            .collect()
    }

    fn allocation_scalar_quantities(&self, client: &C) -> Resources {
        self.clients
            .get(client)
            .map(|state| state.scalar_quantities.clone())
            .unwrap_or_default()
    }

    fn total_scalar_quantities(&self) -> &Resources {
        &self.total
    }

    fn add_total(&mut self, resources: &Resources) {
        self.total += resources.create_stripped_scalar_quantity();
        self.dirty = true;
    }

    fn remove_total(&mut self, resources: &Resources) {
        self.total -= resources.create_stripped_scalar_quantity();
        self.dirty = true;
    }

    fn sort(&mut self) -> Vec<C> {
        if self.dirty {
            self.recompute();
        }
        self.ranking.iter().map(|rank| rank.name.clone()).collect()
    }

    fn contains(&self, client: &C) -> bool {
        self.clients.contains_key(client)
    }

    fn is_active(&self, client: &C) -> bool {
        self.clients.get(client).is_some_and(|state| state.active)
    }

    fn count(&self) -> usize {
        self.clients.len()
    }

    fn share(&self, client: &C) -> Option<f64> {
        let state = self.clients.get(client)?;
        Some(self.calculate_share(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(text: &str) -> Resources {
        Resources::parse(text).unwrap()
    }

    fn sorter(total: &str) -> DrfSorter<String> {
        let mut sorter = DrfSorter::new();
        sorter.add_total(&r(total));
        sorter
    }

    #[test]
    fn test_orders_by_dominant_share() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:100;mem:100");
        sorter.add_client("a".into(), 1.0);
        sorter.add_client("b".into(), 1.0);

        sorter.allocated(&"a".into(), slave, &r("cpus:5;mem:5"));
        sorter.allocated(&"b".into(), slave, &r("cpus:6;mem:6"));
        assert_eq!(sorter.sort(), vec!["a", "b"]);

        sorter.add_client("c".into(), 1.0);
        sorter.allocated(&"c".into(), slave, &r("cpus:1"));
        assert_eq!(sorter.sort(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_ties_break_on_allocation_count_then_name() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:10;mem:10");
        sorter.add_client("b".into(), 1.0);
        sorter.add_client("a".into(), 1.0);
        assert_eq!(sorter.sort(), vec!["a", "b"]);

        sorter.allocated(&"a".into(), slave, &Resources::new());
        assert_eq!(sorter.sort(), vec!["b", "a"]);
    }

    #[test]
    fn test_weight_divides_share() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:10;mem:10");
        sorter.add_client("heavy".into(), 2.0);
        sorter.add_client("light".into(), 1.0);
        sorter.allocated(&"heavy".into(), slave, &r("cpus:4"));
        sorter.allocated(&"light".into(), slave, &r("cpus:3"));

        assert_eq!(sorter.share(&"heavy".into()), Some(0.2));
        assert_eq!(sorter.sort(), vec!["heavy", "light"]);

        sorter.update_weight(&"heavy".into(), 1.0);
        assert_eq!(sorter.sort(), vec!["light", "heavy"]);
    }

    #[test]
    fn test_zero_total_contributes_nothing() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:10");
        sorter.add_client("a".into(), 1.0);
        sorter.allocated(&"a".into(), slave, &r("gpus:1"));
        assert_eq!(sorter.share(&"a".into()), Some(0.0));
    }

    #[test]
    fn test_excluded_resources_are_ignored() {
        let slave = SlaveId::new();
        let mut sorter = DrfSorter::with_exclusions(HashSet::from(["gpus".to_owned()]));
        sorter.add_total(&r("cpus:10;gpus:1"));
        sorter.add_client("gpu-user".to_owned(), 1.0);
        sorter.add_client("cpu-user".to_owned(), 1.0);
        sorter.allocated(&"gpu-user".into(), slave, &r("cpus:1;gpus:1"));
        sorter.allocated(&"cpu-user".into(), slave, &r("cpus:2"));

        assert_eq!(sorter.sort(), vec!["gpu-user", "cpu-user"]);
    }

    #[test]
    fn test_deactivated_clients_are_skipped_but_keep_allocations() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:10");
        sorter.add_client("a".into(), 1.0);
        sorter.add_client("b".into(), 1.0);
        sorter.allocated(&"a".into(), slave, &r("cpus:2"));

        sorter.deactivate(&"a".into());
        assert_eq!(sorter.sort(), vec!["b"]);
        assert!(sorter.contains(&"a".into()));
        assert!(!sorter.is_active(&"a".into()));
        assert_eq!(sorter.count(), 2);

        sorter.activate(&"a".into());
        assert_eq!(sorter.sort(), vec!["b", "a"]);
        assert_eq!(sorter.allocation_scalar_quantities(&"a".into()), r("cpus:2"));
    }

    #[test]
    fn test_unallocated_drops_empty_slave_entries() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:10");
        sorter.add_client("a".into(), 1.0);
        sorter.allocated(&"a".into(), slave, &r("cpus:2"));
        assert_eq!(sorter.allocations_on_slave(slave).len(), 1);

        sorter.unallocated(&"a".into(), slave, &r("cpus:2"));
        assert!(sorter.allocation(&"a".into()).unwrap().is_empty());
        assert!(sorter.allocations_on_slave(slave).is_empty());
        assert_eq!(sorter.share(&"a".into()), Some(0.0));
    }

    #[test]
    fn test_total_change_takes_effect_on_sort() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:10;mem:100");
        sorter.add_client("a".into(), 1.0);
        sorter.add_client("b".into(), 1.0);
        sorter.allocated(&"a".into(), slave, &r("cpus:5"));
        sorter.allocated(&"b".into(), slave, &r("mem:40"));
        assert_eq!(sorter.sort(), vec!["b", "a"]);

        sorter.add_total(&r("cpus:90"));
        assert_eq!(sorter.sort(), vec!["a", "b"]);

        sorter.remove_total(&r("cpus:90"));
        assert_eq!(sorter.sort(), vec!["b", "a"]);
    }

    #[test]
    fn test_update_rewrites_allocation() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:10");
        sorter.add_client("a".into(), 1.0);
        sorter.allocated(&"a".into(), slave, &r("cpus:2"));

        let reserved = r("cpus(role1):2");
        sorter.update(&"a".into(), slave, &r("cpus:2"), &reserved);
        assert_eq!(sorter.allocation(&"a".into()).unwrap()[&slave], reserved);
        assert_eq!(sorter.allocation_scalar_quantities(&"a".into()), r("cpus:2"));
    }

    #[test]
    fn test_misuse_is_ignored() {
        let slave = SlaveId::new();
        let mut sorter = sorter("cpus:10");
        sorter.add_client("a".into(), 1.0);
        sorter.add_client("a".into(), 3.0);
        sorter.allocated(&"ghost".into(), slave, &r("cpus:1"));
        sorter.remove_client(&"ghost".into());
        assert_eq!(sorter.count(), 1);
        assert_eq!(sorter.sort(), vec!["a"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(usize, u8, u8),
        Unallocate(usize),
        AddTotal(u8),
        Toggle(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize, 0..8u8, 0..64u8).prop_map(|(c, cpus, mem)| Op::Allocate(c, cpus, mem)),
            (0..4usize).prop_map(Op::Unallocate),
            (1..16u8).prop_map(Op::AddTotal),
            (0..4usize).prop_map(Op::Toggle),
        ]
    }

    proptest! {
        #[test]
        fn prop_incremental_matches_full_recompute(ops in prop::collection::vec(op(), 0..40)) {
            let slave = SlaveId::new();
            let names: Vec<String> = (0..4).map(|i| format!("c{i}")).collect();
            let mut sorter = sorter("cpus:32;mem:256");
            for name in &names {
                sorter.add_client(name.clone(), 1.0);
            }

            for op in ops {
                match op {
                    Op::Allocate(c, cpus, mem) => {
                        let res = Resources::parse(&format!("cpus:{cpus};mem:{mem}")).unwrap();
                        sorter.allocated(&names[c], slave, &res);
                    }
                    Op::Unallocate(c) => {
                        let held = sorter
                            .allocation(&names[c])
                            .and_then(|a| a.get(&slave).cloned())
                            .unwrap_or_default();
                        sorter.unallocated(&names[c], slave, &held);
                    }
                    Op::AddTotal(cpus) => {
                        sorter.add_total(&Resources::parse(&format!("cpus:{cpus}")).unwrap());
                    }
                    Op::Toggle(c) => {
                        if sorter.is_active(&names[c]) {
                            sorter.deactivate(&names[c]);
                        } else {
                            sorter.activate(&names[c]);
                        }
                    }
                }
            }

            let sorted = sorter.sort();
            let mut expected: Vec<(f64, u64, String)> = sorter
                .clients
                .iter()
                .filter(|(_, state)| state.active)
                .map(|(name, state)| (sorter.calculate_share(state), state.allocations, name.clone()))
                .collect();
            expected.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
            let expected: Vec<String> = expected.into_iter().map(|(_, _, n)| n).collect();
            prop_assert_eq!(sorted, expected);
        }
    }
}
