//! vmfleet-core — shared model for the vmfleet pipeline.
//!
//! Holds the types every stage exchanges (VM descriptors, pool
//! requirements, exclusion sets, job handles, physical hosts), the
//! topology builder that turns user intent into those types, the
//! `fleet.toml` configuration, and the per-run context that collects
//! stage timings and exclusions.

pub mod config;
pub mod context;
pub mod error;
pub mod topology;
pub mod types;

pub use config::FleetConfig;
pub use context::{RunContext, RunStatus, StageTiming};
pub use error::{CoreError, CoreResult};
pub use topology::{PlacementDocument, Topology, TopologyBuilder};
pub use types::*;
