//! vmfleet-testbed — a simulated testbed behind every collaborator contract.
//!
//! A `catalog.toml` describes sites, clusters, virtual networks, busy
//! windows, pre-existing jobs and the failures to inject. [`Testbed`]
//! turns it into a capacity service, a batch scheduler, a provisioning
//! service, host executors and a VM runtime, all in memory.

pub mod catalog;
pub mod error;
pub mod testbed;

pub use catalog::{BusyWindow, ClusterDef, ExistingJob, FailurePlan, SiteDef, TestbedCatalog};
pub use error::{TestbedError, TestbedResult};
pub use testbed::{JobRecord, Submission, Testbed};
