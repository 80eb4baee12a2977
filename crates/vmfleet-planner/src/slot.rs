//! Availability timeline, slots and allocations.
//!
//! Availability is a piecewise-constant timeline of free capacity. A slot
//! is a window at least one walltime long, paired with the capacity that
//! stays free during the whole window.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use vmfleet_core::{ExclusionSet, PoolId, Walltime};

/// Free capacity per pool at some point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTree {
    /// Free hosts per cluster.
    pub clusters: BTreeMap<PoolId, u32>,
    /// Free virtual networks.
    pub vlans: u32,
}

impl ResourceTree {
    pub fn free(&self, cluster: &str) -> u32 {
        self.clusters.get(cluster).copied().unwrap_or(0)
    }

    pub fn total_hosts(&self) -> u32 {
        self.clusters.values().sum()
    }

    /// Capacity free in both trees.
    pub fn min_with(&self, other: &ResourceTree) -> ResourceTree {
        let clusters = self
            .clusters
            .keys()
            .chain(other.clusters.keys())
            .map(|id| (id.clone(), self.free(id).min(other.free(id))))
            .collect();
        ResourceTree {
            clusters,
            vlans: self.vlans.min(other.vlans),
        }
    }

    /// Drop excluded clusters and clusters with nothing free.
    pub fn without(&self, exclusions: &ExclusionSet) -> ResourceTree {
        ResourceTree {
            clusters: self
                .clusters
                .iter()
                .filter(|(id, free)| **free > 0 && !exclusions.contains(id))
                .map(|(id, free)| (id.clone(), *free))
                .collect(),
            vlans: self.vlans,
        }
    }
}

/// The period over which availability is queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Capacity that holds from `at` until the next step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityStep {
    pub at: DateTime<Utc>,
    pub free: ResourceTree,
}

/// Free capacity over a planning window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub window: PlanningWindow,
    /// Sorted by `at`.
    pub steps: Vec<CapacityStep>,
}

impl Availability {
    /// Candidate slots: one per capacity change that leaves room for a full walltime.
    pub fn slots(&self, walltime: Walltime, exclusions: &ExclusionSet) -> Vec<Slot> {
        let Some(length) = i64::try_from(walltime.as_secs())
            .ok()
            .and_then(TimeDelta::try_seconds)
        else {
            return Vec::new();
        };
        let mut slots = Vec::new();

        for (i, step) in self.steps.iter().enumerate() {
            let start = step.at.max(self.window.start);
            let end = match start.checked_add_signed(length) {
                Some(end) if end <= self.window.end => end,
                _ => break,
            };

            let mut free = step.free.clone();
            for later in &self.steps[i + 1..] {
                if later.at >= end {
                    break;
                }
                free = free.min_with(&later.free);
            }

            let resources = free.without(exclusions);
            if resources.total_hosts() == 0 {
                continue;
            }
            slots.push(Slot {
                start,
                end,
                resources,
            });
        }

        slots
    }
}

/// A window with the capacity free during all of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resources: ResourceTree,
}

impl Slot {
    pub fn length(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// Hosts bound per cluster within a chosen slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Hosts per cluster, zero entries omitted.
    pub hosts: BTreeMap<PoolId, u32>,
    /// Site of every allocated cluster.
    pub sites: BTreeMap<PoolId, String>,
    /// One virtual network unit is part of the allocation.
    pub vlan: bool,
}

impl Allocation {
    pub fn total_hosts(&self) -> u32 {
        self.hosts.values().sum()
    }

    /// Number of distinct clusters touched.
    pub fn pool_count(&self) -> usize {
        self.hosts.len()
    }

    /// Clusters grouped per site, both in name order.
    pub fn by_site(&self) -> BTreeMap<String, BTreeMap<PoolId, u32>> {
        let mut grouped: BTreeMap<String, BTreeMap<PoolId, u32>> = BTreeMap::new();
        for (cluster, count) in &self.hosts {
            let site = self
                .sites
                .get(cluster)
                .cloned()
                .unwrap_or_else(|| cluster.clone());
            grouped.entry(site).or_default().insert(cluster.clone(), *count);
        }
        grouped
    }

    /// Every cluster stays within what the slot has free.
    pub fn fits(&self, slot: &Slot) -> bool {
        self.hosts
            .iter()
            .all(|(cluster, count)| *count <= slot.resources.free(cluster))
            && (!self.vlan || slot.resources.vlans > 0)
    }
}

/// Earliest start wins, then fewer clusters, then cluster names.
///
/// Equal candidates keep their input order.
pub(crate) fn pick_allocation(candidates: impl IntoIterator<Item = Allocation>) -> Option<Allocation> {
    candidates.into_iter().min_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(a.pool_count().cmp(&b.pool_count()))
            .then_with(|| a.hosts.keys().cmp(b.hosts.keys()))
    })
}
