//! Capacity service contract.
//!
//! The service that knows the pool catalog and what is free over time.
//! The planner never computes availability itself; it only asks.

use async_trait::async_trait;

use vmfleet_core::{ExclusionSet, PoolRequirement, Walltime};

use crate::catalog::PoolCatalog;
use crate::error::PlanResult;
use crate::slot::{Availability, PlanningWindow, Slot};

#[async_trait]
pub trait CapacityService: Send + Sync {
    /// Sites and clusters known to the service.
    async fn catalog(&self) -> PlanResult<PoolCatalog>;

    /// Free capacity over `window` for the pools of `requirement`.
    async fn planning(
        &self,
        requirement: &PoolRequirement,
        exclusions: &ExclusionSet,
        window: PlanningWindow,
    ) -> PlanResult<Availability>;

    /// Candidate slots at least one walltime long.
    fn compute_slots(
        &self,
        availability: &Availability,
        walltime: Walltime,
        exclusions: &ExclusionSet,
    ) -> Vec<Slot> {
        availability.slots(walltime, exclusions)
    }
}
