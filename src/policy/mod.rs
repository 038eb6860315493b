//! Replication policy abstraction.
//!
//! The team builder consumes exactly two operations from a policy: the set
//! of locality attribute keys it inspects, and `select_replicas` over an
//! indexed group of candidate localities with some entries forced into the
//! result. Concrete policies (spread over zones, over datacenters, nested
//! combinations) plug in behind the trait.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use crate::model::{Locality, ServerId, LOC_ZONEID};

use rand::prelude::*;
use rand::rngs::StdRng;

/// An indexed set of `(server id, locality)` entries that policies select
/// over. Entries are addressed by their index so that policies can work on
/// arbitrary sub-slices without copying localities around.
#[derive(Debug, Default, Clone)]
pub struct LocalityGroup {
    entries: Vec<(ServerId, Locality)>,
}

impl LocalityGroup {
    pub fn new() -> Self {
        LocalityGroup {
            entries: Vec::new(),
        }
    }

    /// Drops all entries, keeping allocations.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Adds an entry and returns its index.
    pub fn add(&mut self, id: ServerId, locality: Locality) -> usize {
        self.entries.push((id, locality));
        self.entries.len() - 1
    }

    pub fn id_of(&self, entry: usize) -> ServerId {
        self.entries[entry].0
    }

    pub fn locality_of(&self, entry: usize) -> &Locality {
        &self.entries[entry].1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entry indices, for use as the initial candidate set.
    pub fn all_entries(&self) -> Vec<usize> {
        (0..self.entries.len()).collect()
    }
}

/// A predicate over locality entries that decides acceptable replica
/// placements, plus the ability to construct one.
pub trait ReplicationPolicy: fmt::Debug + Send + Sync {
    /// Human-readable description of the policy tree.
    fn info(&self) -> String;

    /// Total number of replicas this policy places.
    fn replica_count(&self) -> usize;

    /// Collects the locality attribute keys this policy inspects.
    fn attribute_keys(&self, out: &mut BTreeSet<String>);

    /// Selects replicas out of `candidates` (indices into `group`) so that
    /// the union of `forced` and the appended `out` entries satisfies the
    /// policy. Only newly chosen entries are appended to `out`; `forced`
    /// entries are never re-appended. Returns false when no satisfying
    /// selection exists among the candidates.
    fn select_replicas(
        &self,
        group: &LocalityGroup,
        candidates: &[usize],
        forced: &[usize],
        rng: &mut StdRng,
        out: &mut Vec<usize>,
    ) -> bool;

    /// Whether the given localities are an acceptable replica placement.
    fn satisfied_by(&self, localities: &[&Locality]) -> bool;
}

/// A locality is usable by a policy only if it carries every attribute the
/// policy inspects.
pub fn is_valid_locality(policy: &dyn ReplicationPolicy, locality: &Locality) -> bool {
    let mut keys = BTreeSet::new();
    policy.attribute_keys(&mut keys);
    locality.has_keys(keys.iter())
}

/// Policy placing a single replica anywhere.
#[derive(Debug, Default, Clone)]
pub struct PolicyOne;

impl ReplicationPolicy for PolicyOne {
    fn info(&self) -> String {
        "One()".to_string()
    }

    fn replica_count(&self) -> usize {
        1
    }

    fn attribute_keys(&self, _out: &mut BTreeSet<String>) {}

    fn select_replicas(
        &self,
        _group: &LocalityGroup,
        candidates: &[usize],
        forced: &[usize],
        rng: &mut StdRng,
        out: &mut Vec<usize>,
    ) -> bool {
        if !forced.is_empty() {
            // a forced entry already satisfies the single slot
            return true;
        }
        match candidates.choose(rng) {
            Some(&entry) => {
                out.push(entry);
                true
            }
            None => false,
        }
    }

    fn satisfied_by(&self, localities: &[&Locality]) -> bool {
        !localities.is_empty()
    }
}

/// Policy requiring `count` groups with distinct values of one locality
/// attribute, each group satisfying an inner policy.
#[derive(Debug)]
pub struct PolicyAcross {
    count: usize,
    attribute: String,
    inner: Box<dyn ReplicationPolicy>,
}

impl PolicyAcross {
    pub fn new(count: usize, attribute: &str, inner: Box<dyn ReplicationPolicy>) -> Self {
        PolicyAcross {
            count,
            attribute: attribute.to_string(),
            inner,
        }
    }

    /// The common case: `count` replicas across distinct zones.
    pub fn across_zones(count: usize) -> Self {
        PolicyAcross::new(count, LOC_ZONEID, Box::new(PolicyOne))
    }

    /// Partitions entry indices by this policy's attribute value; entries
    /// missing the attribute are dropped.
    fn partition<'a>(
        &self,
        group: &'a LocalityGroup,
        entries: &[usize],
    ) -> BTreeMap<&'a str, Vec<usize>> {
        let mut by_value: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for &entry in entries {
            if let Some(value) = group.locality_of(entry).get(&self.attribute) {
                by_value.entry(value).or_default().push(entry);
            }
        }
        by_value
    }
}

impl ReplicationPolicy for PolicyAcross {
    fn info(&self) -> String {
        format!("Across({},{},{})", self.count, self.attribute, self.inner.info())
    }

    fn replica_count(&self) -> usize {
        self.count * self.inner.replica_count()
    }

    fn attribute_keys(&self, out: &mut BTreeSet<String>) {
        out.insert(self.attribute.clone());
        self.inner.attribute_keys(out);
    }

    fn select_replicas(
        &self,
        group: &LocalityGroup,
        candidates: &[usize],
        forced: &[usize],
        rng: &mut StdRng,
        out: &mut Vec<usize>,
    ) -> bool {
        let by_value = self.partition(group, candidates);
        let forced_by_value = self.partition(group, forced);

        // a forced entry missing the attribute can never be placed
        if forced_by_value.values().map(|v| v.len()).sum::<usize>() != forced.len() {
            return false;
        }

        let checkpoint = out.len();
        let mut satisfied = 0;

        // first complete the groups that forced entries already pin
        for (value, value_forced) in &forced_by_value {
            let empty = Vec::new();
            let value_candidates = by_value.get(value).unwrap_or(&empty);
            if !self.inner.select_replicas(
                group,
                value_candidates,
                value_forced,
                rng,
                out,
            ) {
                out.truncate(checkpoint);
                return false;
            }
            satisfied += 1;
        }

        // then fill the remaining slots from unclaimed values, visiting the
        // values in random order
        let mut others: Vec<&str> = by_value
            .keys()
            .filter(|v| !forced_by_value.contains_key(*v))
            .copied()
            .collect();
        others.shuffle(rng);

        for value in others {
            if satisfied >= self.count {
                break;
            }
            let mark = out.len();
            if self
                .inner
                .select_replicas(group, &by_value[value], &[], rng, out)
            {
                satisfied += 1;
            } else {
                out.truncate(mark);
            }
        }

        if satisfied >= self.count {
            true
        } else {
            out.truncate(checkpoint);
            false
        }
    }

    fn satisfied_by(&self, localities: &[&Locality]) -> bool {
        let mut by_value: BTreeMap<&str, Vec<&Locality>> = BTreeMap::new();
        for loc in localities {
            if let Some(value) = loc.get(&self.attribute) {
                by_value.entry(value).or_default().push(loc);
            }
        }
        let satisfied = by_value
            .values()
            .filter(|group| self.inner.satisfied_by(group))
            .count();
        satisfied >= self.count
    }
}
