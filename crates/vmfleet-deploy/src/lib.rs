//! vmfleet deployment — phased host provisioning and VM instantiation.
//!
//! Turns the hosts behind a set of job handles into a running virtual
//! fleet. The orchestrator walks a fixed sequence of phases and fans
//! per-host and per-VM work out on a bounded worker pool.
//!
//! # Components
//!
//! - **`phase`** — Phase sequence, deployment state and run options
//! - **`orchestrator`** — Drives the phases against the collaborators
//! - **`executors`** — Collaborator contracts (resolver, provisioner, runtimes)
//! - **`workers`** — Bounded fan-out with a phase deadline
//! - **`distribution`** — VM-to-host placement policies
//! - **`addressing`** — IPv4 leases, MACs and DHCP configuration
//! - **`output`** — Host list, VM list and topology snapshots

pub mod addressing;
pub mod distribution;
pub mod error;
pub mod executors;
pub mod orchestrator;
pub mod output;
pub mod phase;
pub mod workers;

pub use addressing::{AddressPlan, DEFAULT_VM_NETWORK, Lease};
pub use distribution::{Distribution, DistributionPolicy, distribute};
pub use error::{DeployError, DeployResult, ExecError};
pub use executors::{
    Collaborators, Executor, HypervisorConfig, JobWindow, PackageConfig, ProvisionOptions,
    Provisioner, Reachability, ResolvedResources, ResourceResolver, ServiceNodeConfig, VmHandle,
    VmRuntime,
};
pub use orchestrator::{DeploymentReport, Orchestrator};
pub use output::{HOSTS_FILE, SNAPSHOT_AFTER, SNAPSHOT_BEFORE, TopologySnapshot, VMS_FILE};
pub use phase::{
    DeployOptions, DeploymentState, DiskLocation, HostImage, PackageMode, Phase, PhaseOutcome,
};
pub use workers::{CloseHandle, DEFAULT_MAX_PARALLELISM, FanOutReport, WorkerPool};
