//! Resource planner — exclusions, network mode, slot search.
//!
//! Mode selection is decided once per request: any explicit count on a
//! physical pool selects [`FixedCapacity`], otherwise [`FlexibleCapacity`].
//! A mixed requirement runs fixed-capacity with its unconstrained pools
//! left out of the distribution.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vmfleet_core::{
    ExclusionSet, NetworkMode, PoolRequirement, Topology, VLAN_POOL, VmDescriptor, Walltime,
};

use crate::capacity::CapacityService;
use crate::catalog::PoolCatalog;
use crate::error::{PlanError, PlanResult};
use crate::fixed::FixedCapacity;
use crate::flexible::FlexibleCapacity;
use crate::slot::{Allocation, PlanningWindow, Slot};

const DEFAULT_HORIZON_DAYS: u32 = 5;
const DEFAULT_CPU_OVERCOMMIT: u32 = 2;

/// Everything a capacity algorithm looks at besides the slots.
#[derive(Debug, Clone, Copy)]
pub struct SearchInput<'a> {
    pub requirement: &'a PoolRequirement,
    pub exclusions: &'a ExclusionSet,
    pub catalog: &'a PoolCatalog,
    pub vms: &'a [VmDescriptor],
    /// Virtual CPUs allowed per physical CPU thread.
    pub cpu_overcommit: u32,
}

/// The capacity algorithm chosen for a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacitySearch {
    Fixed(FixedCapacity),
    Flexible(FlexibleCapacity),
}

impl CapacitySearch {
    pub fn select(requirement: &PoolRequirement) -> Self {
        if requirement.has_explicit_counts() {
            CapacitySearch::Fixed(FixedCapacity)
        } else {
            CapacitySearch::Flexible(FlexibleCapacity)
        }
    }

    pub fn allocate(&self, slots: &[Slot], input: &SearchInput<'_>) -> Option<Allocation> {
        match self {
            CapacitySearch::Fixed(fixed) => fixed.allocate(slots, input),
            CapacitySearch::Flexible(flexible) => flexible.find_joint_slot(slots, input),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CapacitySearch::Fixed(_) => "fixed",
            CapacitySearch::Flexible(_) => "flexible",
        }
    }
}

/// What the planner needs to know about one run.
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub topology: &'a Topology,
    pub walltime: Walltime,
    pub blacklist: &'a ExclusionSet,
    pub dedicated_vlan: bool,
    /// Earliest start considered.
    pub now: DateTime<Utc>,
}

/// Outcome of a successful planning pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub allocation: Allocation,
    pub network: NetworkMode,
    pub walltime: Walltime,
    /// Requirement after catalog expansion, virtual network included.
    pub requirement: PoolRequirement,
    pub exclusions: ExclusionSet,
    /// `fixed` or `flexible`.
    pub search: String,
}

pub struct ResourcePlanner {
    capacity: Arc<dyn CapacityService>,
    horizon_days: u32,
    cpu_overcommit: u32,
}

impl ResourcePlanner {
    pub fn new(capacity: Arc<dyn CapacityService>) -> Self {
        Self {
            capacity,
            horizon_days: DEFAULT_HORIZON_DAYS,
            cpu_overcommit: DEFAULT_CPU_OVERCOMMIT,
        }
    }

    pub fn with_horizon_days(mut self, days: u32) -> Self {
        self.horizon_days = days.max(1);
        self
    }

    pub fn with_cpu_overcommit(mut self, overcommit: u32) -> Self {
        self.cpu_overcommit = overcommit.max(1);
        self
    }

    /// Find a slot and an allocation for the request.
    pub async fn plan(&self, request: &PlanRequest<'_>) -> PlanResult<Plan> {
        let topology = request.topology;
        let catalog = self.capacity.catalog().await?;
        let mut requirement = catalog.expand(&topology.requirement)?;

        let exclusions = ExclusionSet::merge(
            catalog.unsupported(),
            catalog.blacklisted_clusters(request.blacklist.iter()),
        );
        if !exclusions.is_empty() {
            let excluded: Vec<&str> = exclusions.iter().map(String::as_str).collect();
            info!(pools = %excluded.join(","), "excluding pools");
        }

        let network = NetworkMode::for_vm_count(topology.vm_count(), request.dedicated_vlan);
        match network {
            NetworkMode::DedicatedVlan => requirement.insert(VLAN_POOL, 1),
            NetworkMode::Subnet { units } => debug!(units, "subnet sized to the VM count"),
        }

        info!(
            vms = topology.vm_count(),
            memory_mb = topology.total_memory(),
            vcpus = topology.total_cpu(),
            requirement = %requirement,
            "planning reservation"
        );

        let window = PlanningWindow {
            start: request.now,
            end: request.now + TimeDelta::days(i64::from(self.horizon_days)),
        };
        let availability = self.capacity.planning(&requirement, &exclusions, window).await?;
        let slots = self
            .capacity
            .compute_slots(&availability, request.walltime, &exclusions);
        debug!(slots = slots.len(), walltime = %request.walltime, "candidate slots computed");

        let search = CapacitySearch::select(&requirement);
        let input = SearchInput {
            requirement: &requirement,
            exclusions: &exclusions,
            catalog: &catalog,
            vms: &topology.vms,
            cpu_overcommit: self.cpu_overcommit,
        };
        let allocation = search.allocate(&slots, &input).ok_or_else(|| {
            PlanError::NoSlotFound(format!(
                "{} candidate slot(s) within {} day(s) cannot hold {} VM(s) on {}",
                slots.len(),
                self.horizon_days,
                topology.vm_count(),
                requirement
            ))
        })?;

        info!(
            search = search.name(),
            start = %allocation.start.format("%Y-%m-%d %H:%M:%S"),
            hosts = allocation.total_hosts(),
            pools = allocation.pool_count(),
            "slot found"
        );

        Ok(Plan {
            allocation,
            network,
            walltime: request.walltime,
            requirement,
            exclusions,
            search: search.name().to_string(),
        })
    }
}
