//! VM distribution across surviving hosts.
//!
//! A host accepts a VM while the VMs already bound to it leave enough
//! memory, so a host never carries more than
//! `floor(host_memory / vm_memory)` VMs of one size. VMs that fit on no
//! host are reported as unplaced.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use vmfleet_core::{PhysicalHost, VmDescriptor};

use crate::error::{DeployError, DeployResult};

/// Rule for assigning VMs to hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DistributionPolicy {
    /// Cycle through the hosts, skipping full ones.
    #[default]
    RoundRobin,
    /// At most `K` VMs per host, hosts filled in order.
    PerHost(u32),
    /// A random host with room, from an optional seed.
    Random { seed: Option<u64> },
    /// Fill each host to its bound before moving to the next.
    Concentrated,
}

impl FromStr for DistributionPolicy {
    type Err = DeployError;

    fn from_str(s: &str) -> DeployResult<Self> {
        let invalid = || {
            DeployError::Config(format!(
                "unknown distribution '{s}' (expected round-robin, per-host:K, random[:SEED] or concentrated)"
            ))
        };
        match s.split_once(':') {
            None => match s {
                "round-robin" => Ok(DistributionPolicy::RoundRobin),
                "random" => Ok(DistributionPolicy::Random { seed: None }),
                "concentrated" => Ok(DistributionPolicy::Concentrated),
                _ => Err(invalid()),
            },
            Some(("per-host", k)) => match k.parse::<u32>() {
                Ok(k) if k > 0 => Ok(DistributionPolicy::PerHost(k)),
                _ => Err(invalid()),
            },
            Some(("random", seed)) => seed
                .parse()
                .map(|seed| DistributionPolicy::Random { seed: Some(seed) })
                .map_err(|_| invalid()),
            Some(_) => Err(invalid()),
        }
    }
}

impl fmt::Display for DistributionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistributionPolicy::RoundRobin => f.write_str("round-robin"),
            DistributionPolicy::PerHost(k) => write!(f, "per-host:{k}"),
            DistributionPolicy::Random { seed: None } => f.write_str("random"),
            DistributionPolicy::Random { seed: Some(seed) } => write!(f, "random:{seed}"),
            DistributionPolicy::Concentrated => f.write_str("concentrated"),
        }
    }
}

/// VM → host bindings produced by a distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Distribution {
    /// `(vm id, host id)` in VM order.
    pub bindings: Vec<(String, String)>,
    pub unplaced: Vec<String>,
}

impl Distribution {
    pub fn per_host(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for (_, host) in &self.bindings {
            *counts.entry(host.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

/// Remaining room on one host.
#[derive(Debug, Clone)]
struct HostRoom {
    id: String,
    pool: String,
    site: String,
    free_mb: u64,
    count: u32,
}

impl HostRoom {
    fn fits(&self, vm: &VmDescriptor, per_host: Option<u32>) -> bool {
        vm.template.mem > 0
            && vm.template.mem <= self.free_mb
            && per_host.is_none_or(|k| self.count < k)
    }

    fn take(&mut self, vm: &VmDescriptor) {
        self.free_mb -= vm.template.mem;
        self.count += 1;
    }
}

/// Assign `vms` to `hosts` under `policy`.
///
/// VMs carrying a host hint are placed first: hint hosts are mapped, in
/// order of appearance, onto resolved hosts of the same cluster or site.
/// Hints that cannot be honoured fall back to `policy`.
pub fn distribute(
    vms: &[VmDescriptor],
    hosts: &[PhysicalHost],
    policy: DistributionPolicy,
) -> Distribution {
    let mut rooms: Vec<HostRoom> = hosts
        .iter()
        .map(|h| HostRoom {
            id: h.id.clone(),
            pool: h.pool.clone(),
            site: h.site.clone(),
            free_mb: h.memory_mb,
            count: 0,
        })
        .collect();

    let hint_map = map_hints(vms, &rooms);
    let mut placed: BTreeMap<usize, String> = BTreeMap::new();
    let mut rest: Vec<usize> = Vec::new();

    for (i, vm) in vms.iter().enumerate() {
        let target = vm
            .host_hint
            .as_ref()
            .and_then(|hint| hint_map.get(hint.as_str()))
            .and_then(|host| rooms.iter().position(|r| &r.id == host));
        match target {
            Some(idx) if rooms[idx].fits(vm, None) => {
                rooms[idx].take(vm);
                placed.insert(i, rooms[idx].id.clone());
            }
            Some(_) => {
                warn!(vm = %vm.id, "hinted host is full, falling back to {policy}");
                rest.push(i);
            }
            None => {
                if vm.host_hint.is_some() {
                    debug!(vm = %vm.id, "host hint has no matching host");
                }
                rest.push(i);
            }
        }
    }

    let per_host = match policy {
        DistributionPolicy::PerHost(k) => Some(k),
        _ => None,
    };
    let mut rng = match policy {
        DistributionPolicy::Random { seed: Some(seed) } => StdRng::seed_from_u64(seed),
        _ => StdRng::from_entropy(),
    };
    let mut cursor = 0usize;
    let mut unplaced = Vec::new();

    for i in rest {
        let vm = &vms[i];
        let chosen = match policy {
            DistributionPolicy::RoundRobin => {
                let n = rooms.len();
                let found = (0..n)
                    .map(|step| (cursor + step) % n)
                    .find(|&idx| rooms[idx].fits(vm, None));
                if let Some(idx) = found {
                    cursor = (idx + 1) % n;
                }
                found
            }
            DistributionPolicy::PerHost(_) | DistributionPolicy::Concentrated => {
                rooms.iter().position(|r| r.fits(vm, per_host))
            }
            DistributionPolicy::Random { .. } => {
                let open: Vec<usize> = (0..rooms.len()).filter(|&idx| rooms[idx].fits(vm, None)).collect();
                (!open.is_empty()).then(|| open[rng.gen_range(0..open.len())])
            }
        };

        match chosen {
            Some(idx) => {
                rooms[idx].take(vm);
                placed.insert(i, rooms[idx].id.clone());
            }
            None => unplaced.push(vm.id.clone()),
        }
    }

    if !unplaced.is_empty() {
        warn!(count = unplaced.len(), "host capacity exhausted, VMs left unplaced");
    }

    Distribution {
        bindings: placed
            .into_iter()
            .map(|(i, host)| (vms[i].id.clone(), host))
            .collect(),
        unplaced,
    }
}

/// Hint host → resolved host, pool by pool, in order of first appearance.
fn map_hints<'a>(vms: &'a [VmDescriptor], rooms: &[HostRoom]) -> BTreeMap<&'a str, String> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut hints_per_pool: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for vm in vms {
        if let (Some(host), Some(pool)) = (vm.host_hint.as_deref(), vm.pool_hint.as_deref()) {
            if seen.insert(host) {
                hints_per_pool.entry(pool).or_default().push(host);
            }
        }
    }

    let mut mapping = BTreeMap::new();
    for (pool, hints) in hints_per_pool {
        // A hint that names a resolved host keeps it.
        let mut free: Vec<&str> = rooms
            .iter()
            .filter(|r| r.pool == pool || r.site == pool)
            .map(|r| r.id.as_str())
            .filter(|id| !hints.contains(id))
            .collect();
        for hint in hints {
            if rooms.iter().any(|r| r.id == hint) {
                mapping.insert(hint, hint.to_string());
            } else if !free.is_empty() {
                mapping.insert(hint, free.remove(0).to_string());
            }
        }
    }
    mapping
}
