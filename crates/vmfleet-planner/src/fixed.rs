//! Fixed-capacity algorithm — explicit per-pool counts.
//!
//! Cluster entries take their count from the cluster itself. Site entries
//! spread their count over the site's clusters in name order, filling each
//! before moving on. Unconstrained entries are left out.

use std::collections::BTreeMap;

use tracing::debug;

use vmfleet_core::PoolId;

use crate::planner::SearchInput;
use crate::slot::{Allocation, Slot, pick_allocation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedCapacity;

impl FixedCapacity {
    /// Distribute the explicit counts on `slot`, or `None` if they do not fit.
    pub fn distribute(&self, slot: &Slot, input: &SearchInput<'_>) -> Option<Allocation> {
        if input.requirement.requires_vlan() && slot.resources.vlans == 0 {
            debug!(start = %slot.start, "slot has no free virtual network");
            return None;
        }

        let mut hosts: BTreeMap<PoolId, u32> = BTreeMap::new();
        let (clusters, sites): (Vec<_>, Vec<_>) = input
            .requirement
            .explicit()
            .partition(|(pool, _)| input.catalog.is_cluster(pool));

        for (cluster, count) in clusters {
            if input.exclusions.contains(cluster) {
                debug!(%cluster, "explicitly requested cluster is excluded");
                return None;
            }
            let free = remaining(slot, &hosts, cluster);
            if free < count {
                debug!(start = %slot.start, %cluster, free, count, "not enough free hosts");
                return None;
            }
            *hosts.entry(cluster.clone()).or_insert(0) += count;
        }

        for (site, count) in sites {
            if input.exclusions.contains(site) {
                debug!(%site, "explicitly requested site is excluded");
                return None;
            }
            let mut missing = count;
            for cluster in input.catalog.clusters_of_site(site) {
                if missing == 0 {
                    break;
                }
                if !cluster.virt || input.exclusions.contains(&cluster.id) {
                    continue;
                }
                let take = remaining(slot, &hosts, &cluster.id).min(missing);
                if take > 0 {
                    *hosts.entry(cluster.id.clone()).or_insert(0) += take;
                    missing -= take;
                }
            }
            if missing > 0 {
                debug!(start = %slot.start, %site, missing, "site cannot supply its count");
                return None;
            }
        }

        if hosts.is_empty() {
            return None;
        }

        let sites = hosts
            .keys()
            .filter_map(|c| input.catalog.site_of(c).map(|s| (c.clone(), s.to_string())))
            .collect();

        Some(Allocation {
            start: slot.start,
            end: slot.end,
            hosts,
            sites,
            vlan: input.requirement.requires_vlan(),
        })
    }

    /// Earliest slot on which the counts can be distributed.
    pub fn allocate(&self, slots: &[Slot], input: &SearchInput<'_>) -> Option<Allocation> {
        let earliest = slots
            .iter()
            .filter_map(|slot| self.distribute(slot, input))
            .map(|a| a.start)
            .min()?;
        pick_allocation(
            slots
                .iter()
                .filter(|slot| slot.start == earliest)
                .filter_map(|slot| self.distribute(slot, input)),
        )
    }
}

fn remaining(slot: &Slot, taken: &BTreeMap<PoolId, u32>, cluster: &str) -> u32 {
    slot.resources
        .free(cluster)
        .saturating_sub(taken.get(cluster).copied().unwrap_or(0))
}
