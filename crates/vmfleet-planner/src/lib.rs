//! vmfleet resource planner — finds a time slot and an allocation.
//!
//! Given a pool requirement and a walltime, the planner queries the
//! capacity service for availability over the planning horizon, turns it
//! into candidate slots, and produces an [`Allocation`] with one of two
//! algorithms:
//!
//! - **`fixed`** — explicit per-pool counts distributed on the earliest slot
//! - **`flexible`** — joint search over time and pools sized by the VM set
//!
//! # Components
//!
//! - **`catalog`** — sites, clusters and pool-token expansion
//! - **`slot`** — availability timeline, slots, allocations
//! - **`capacity`** — the capacity service contract
//! - **`planner`** — exclusions, network mode, mode selection

pub mod capacity;
pub mod catalog;
pub mod error;
pub mod fixed;
pub mod flexible;
pub mod planner;
pub mod slot;

pub use capacity::CapacityService;
pub use catalog::{ClusterInfo, PoolCatalog};
pub use error::{PlanError, PlanResult};
pub use fixed::FixedCapacity;
pub use flexible::FlexibleCapacity;
pub use planner::{CapacitySearch, Plan, PlanRequest, ResourcePlanner, SearchInput};
pub use slot::{Allocation, Availability, CapacityStep, PlanningWindow, ResourceTree, Slot};
