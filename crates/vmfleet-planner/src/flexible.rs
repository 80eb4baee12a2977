//! Flexible-capacity algorithm: any host count, as long as the VMs fit.
//!
//! Per slot, clusters are ranked by how many of the VMs they can hold,
//! largest first, and the smallest prefix that absorbs the whole VM set
//! is kept. Across slots the earliest start wins, then the allocation
//! touching fewer clusters.

use std::collections::BTreeMap;

use tracing::debug;

use vmfleet_core::{PoolId, VmDescriptor};

use crate::catalog::ClusterInfo;
use crate::planner::SearchInput;
use crate::slot::{Allocation, Slot, pick_allocation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlexibleCapacity;

/// How many leading VMs a cluster absorbs and how many hosts that takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packing {
    pub placed: usize,
    pub hosts: u32,
}

/// Fill up to `available_hosts` hosts of `cluster` with VMs in order.
///
/// A host takes VMs while both its memory and `cpus * overcommit` virtual
/// CPUs hold out. Packing stops at the first VM that fits no empty host.
pub fn pack(
    vms: &[VmDescriptor],
    cluster: &ClusterInfo,
    available_hosts: u32,
    overcommit: u32,
) -> Packing {
    let vcpu_limit = u64::from(cluster.cpus) * u64::from(overcommit.max(1));
    let mut packing = Packing { placed: 0, hosts: 0 };
    let mut mem_left = 0u64;
    let mut cpu_left = 0u64;

    for vm in vms {
        let mem = vm.template.mem;
        let cpu = u64::from(vm.template.cpu);
        if mem > cluster.memory_mb || cpu > vcpu_limit {
            break;
        }
        if packing.hosts == 0 || mem > mem_left || cpu > cpu_left {
            if packing.hosts == available_hosts {
                break;
            }
            packing.hosts += 1;
            mem_left = cluster.memory_mb;
            cpu_left = vcpu_limit;
        }
        mem_left -= mem;
        cpu_left -= cpu;
        packing.placed += 1;
    }

    packing
}

impl FlexibleCapacity {
    /// Smallest set of clusters on `slot` that absorbs every VM.
    pub fn fit_slot(&self, slot: &Slot, input: &SearchInput<'_>) -> Option<Allocation> {
        if input.vms.is_empty() {
            return None;
        }
        if input.requirement.requires_vlan() && slot.resources.vlans == 0 {
            debug!(start = %slot.start, "slot has no free virtual network");
            return None;
        }

        let mut ranked: Vec<(&ClusterInfo, u32, usize)> = input
            .catalog
            .referenced_clusters(input.requirement)
            .into_iter()
            .filter(|c| c.virt && !input.exclusions.contains(&c.id))
            .filter_map(|c| {
                let free = slot.resources.free(&c.id);
                let capacity = pack(input.vms, c, free, input.cpu_overcommit).placed;
                (capacity > 0).then_some((c, free, capacity))
            })
            .collect();
        ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.id.cmp(&b.0.id)));

        let mut remaining = input.vms;
        let mut hosts: BTreeMap<PoolId, u32> = BTreeMap::new();
        let mut sites: BTreeMap<PoolId, String> = BTreeMap::new();

        for (cluster, free, _) in ranked {
            if remaining.is_empty() {
                break;
            }
            let packing = pack(remaining, cluster, free, input.cpu_overcommit);
            if packing.hosts == 0 {
                continue;
            }
            hosts.insert(cluster.id.clone(), packing.hosts);
            sites.insert(cluster.id.clone(), cluster.site.clone());
            remaining = &remaining[packing.placed..];
        }

        if !remaining.is_empty() {
            debug!(start = %slot.start, unplaced = remaining.len(), "slot too small for the VM set");
            return None;
        }

        Some(Allocation {
            start: slot.start,
            end: slot.end,
            hosts,
            sites,
            vlan: input.requirement.requires_vlan(),
        })
    }

    pub fn find_joint_slot(&self, slots: &[Slot], input: &SearchInput<'_>) -> Option<Allocation> {
        pick_allocation(slots.iter().filter_map(|slot| self.fit_slot(slot, input)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use vmfleet_core::{ExclusionSet, PoolRequirement, VLAN_POOL, VmTemplate};

    use crate::catalog::PoolCatalog;
    use crate::catalog::tests::{cluster, sample_catalog};
    use crate::slot::ResourceTree;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, 0, 0).unwrap()
    }

    fn slot(hour: u32, entries: &[(&str, u32)], vlans: u32) -> Slot {
        Slot {
            start: at(hour),
            end: at(hour + 3),
            resources: ResourceTree {
                clusters: entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                vlans,
            },
        }
    }

    fn vms(n: usize, mem: u64, cpu: u32) -> Vec<VmDescriptor> {
        let template = VmTemplate {
            mem,
            cpu,
            ..VmTemplate::default()
        };
        (1..=n)
            .map(|i| VmDescriptor::new(format!("vm-{i}"), template.clone()))
            .collect()
    }

    fn input<'a>(
        requirement: &'a PoolRequirement,
        exclusions: &'a ExclusionSet,
        catalog: &'a PoolCatalog,
        vms: &'a [VmDescriptor],
    ) -> SearchInput<'a> {
        SearchInput {
            requirement,
            exclusions,
            catalog,
            vms,
            cpu_overcommit: 2,
        }
    }

    #[test]
    fn pack_respects_memory_and_vcpu() {
        let host = cluster("taurus", "lyon", 8, 4096);
        // 4 per host by memory.
        let p = pack(&vms(10, 1024, 1), &host, 8, 2);
        assert_eq!(p, Packing { placed: 10, hosts: 3 });

        // 16 cpus * 2 overcommit = 32 vcpus, 8 vcpus each -> 4 per host by cpu.
        let p = pack(&vms(10, 512, 8), &host, 2, 2);
        assert_eq!(p, Packing { placed: 8, hosts: 2 });
    }

    #[test]
    fn pack_stops_on_oversized_vm() {
        let host = cluster("taurus", "lyon", 8, 2048);
        let p = pack(&vms(3, 4096, 1), &host, 8, 2);
        assert_eq!(p.placed, 0);
        assert_eq!(p.hosts, 0);
    }

    #[test]
    fn one_cluster_holding_everything_is_enough() {
        let catalog = sample_catalog();
        let req = PoolRequirement::parse_tokens("taurus,graphene").unwrap();
        let excl = ExclusionSet::default();
        let set = vms(40, 1024, 1);
        // Either cluster holds all 40; the name breaks the tie.
        let s = slot(0, &[("taurus", 2), ("graphene", 20)], 0);

        let alloc = FlexibleCapacity.fit_slot(&s, &input(&req, &excl, &catalog, &set)).unwrap();
        assert_eq!(alloc.pool_count(), 1);
        assert!(alloc.hosts.contains_key("graphene"));
        assert!(alloc.fits(&s));
    }

    #[test]
    fn spills_over_to_the_next_cluster() {
        let catalog = sample_catalog();
        let req = PoolRequirement::parse_tokens("nancy").unwrap();
        let excl = ExclusionSet::default();
        let set = vms(40, 4096, 1);
        // 4 VMs per 16 GiB host: graphene holds 12, griffon 16.
        let s = slot(0, &[("graphene", 3), ("griffon", 4)], 0);

        let alloc = FlexibleCapacity.fit_slot(&s, &input(&req, &excl, &catalog, &set));
        assert!(alloc.is_none(), "7 hosts hold only 28 VMs");

        let set = vms(20, 4096, 1);
        let alloc = FlexibleCapacity.fit_slot(&s, &input(&req, &excl, &catalog, &set)).unwrap();
        assert_eq!(alloc.hosts["griffon"], 4);
        assert_eq!(alloc.hosts["graphene"], 1);
    }

    #[test]
    fn earlier_slot_beats_fewer_pools() {
        let catalog = sample_catalog();
        let req = PoolRequirement::parse_tokens("all").unwrap();
        let excl = ExclusionSet::default();
        let expanded = catalog.expand(&req).unwrap();
        let set = vms(8, 16384, 1);
        let slots = vec![
            slot(5, &[("taurus", 8)], 0),
            slot(1, &[("taurus", 2), ("graphene", 4)], 0),
        ];

        let alloc = FlexibleCapacity
            .find_joint_slot(&slots, &input(&expanded, &excl, &catalog, &set))
            .unwrap();
        assert_eq!(alloc.start, at(1));
        assert_eq!(alloc.pool_count(), 2);
    }

    #[test]
    fn fewer_pools_win_on_equal_start() {
        let catalog = sample_catalog();
        let req = catalog.expand(&PoolRequirement::parse_tokens("all").unwrap()).unwrap();
        let excl = ExclusionSet::default();
        let set = vms(4, 16384, 1);
        let slots = vec![
            slot(2, &[("taurus", 1), ("griffon", 2)], 0),
            slot(2, &[("graphene", 4)], 0),
        ];

        let alloc = FlexibleCapacity
            .find_joint_slot(&slots, &input(&req, &excl, &catalog, &set))
            .unwrap();
        assert_eq!(alloc.pool_count(), 1);
        assert_eq!(alloc.hosts["graphene"], 4);
    }

    #[test]
    fn excluded_and_unreferenced_clusters_are_ignored() {
        let catalog = sample_catalog();
        let req = PoolRequirement::parse_tokens("lyon").unwrap();
        let excl = ExclusionSet::parse_list("taurus");
        let set = vms(2, 1024, 1);
        let s = slot(0, &[("taurus", 8), ("graphene", 8)], 0);

        assert!(FlexibleCapacity.fit_slot(&s, &input(&req, &excl, &catalog, &set)).is_none());
    }

    #[test]
    fn vlan_is_required_when_requested() {
        let catalog = sample_catalog();
        let mut req = PoolRequirement::parse_tokens("taurus").unwrap();
        req.insert(VLAN_POOL, 1);
        let excl = ExclusionSet::default();
        let set = vms(2, 1024, 1);

        let none = slot(0, &[("taurus", 8)], 0);
        assert!(FlexibleCapacity.fit_slot(&none, &input(&req, &excl, &catalog, &set)).is_none());
        let one = slot(0, &[("taurus", 8)], 1);
        let alloc = FlexibleCapacity.fit_slot(&one, &input(&req, &excl, &catalog, &set)).unwrap();
        assert!(alloc.vlan);
    }
}
