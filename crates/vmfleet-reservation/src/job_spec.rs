//! Job specs — one reservation request per site of an allocation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vmfleet_core::{NetworkMode, PoolId, Walltime};
use vmfleet_planner::Allocation;

use crate::error::{ReservationError, ReservationResult};

/// Job type asking for hosts that can be network-deployed.
pub const DEPLOY_JOB_TYPE: &str = "deploy";

/// Resource unit for one global virtual network.
const VLAN_SELECTOR: &str = "{type='kavlan-global'}/vlan=1";

/// A reservation request for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub site: String,
    /// Hosts per cluster of the site.
    pub clusters: BTreeMap<PoolId, u32>,
    /// The global virtual network unit rides on this spec.
    pub vlan: bool,
    /// `/22` blocks to route to the VMs.
    pub subnet_units: Option<u32>,
    pub walltime: Walltime,
    pub start: DateTime<Utc>,
    /// Job type, `deploy` unless built by hand.
    pub job_type: String,
}

impl JobSpec {
    /// Resource selector, e.g. `{cluster='taurus'}/nodes=3+slash_22=1`.
    pub fn selector(&self) -> String {
        let mut parts: Vec<String> = self
            .clusters
            .iter()
            .map(|(cluster, nodes)| format!("{{cluster='{cluster}'}}/nodes={nodes}"))
            .collect();
        if self.vlan {
            parts.push(VLAN_SELECTOR.to_string());
        }
        if let Some(units) = self.subnet_units {
            parts.push(format!("slash_22={units}"));
        }
        parts.join("+")
    }

    pub fn total_hosts(&self) -> u32 {
        self.clusters.values().sum()
    }

    /// Reject specs the scheduler would choke on.
    pub fn validate(&self) -> ReservationResult<()> {
        if self.site.trim().is_empty() {
            return Err(ReservationError::InvalidSpec("empty site".into()));
        }
        if self.clusters.is_empty() {
            return Err(ReservationError::InvalidSpec(format!(
                "no cluster requested on site {}",
                self.site
            )));
        }
        for (cluster, nodes) in &self.clusters {
            if cluster.is_empty() || cluster.contains(['\'', '"', '{', '}', '+', ',']) {
                return Err(ReservationError::InvalidSpec(format!(
                    "malformed cluster name '{cluster}'"
                )));
            }
            if *nodes == 0 {
                return Err(ReservationError::InvalidSpec(format!(
                    "cluster {cluster} requests no host"
                )));
            }
        }
        if self.subnet_units == Some(0) {
            return Err(ReservationError::InvalidSpec("subnet of zero blocks".into()));
        }
        if self.walltime.as_secs() == 0 {
            return Err(ReservationError::InvalidSpec("zero walltime".into()));
        }
        Ok(())
    }
}

/// One spec per site touched by `allocation`, in site name order.
///
/// A dedicated virtual network is attached to the first spec only; a
/// subnet annotation is attached to every spec.
pub fn build_job_specs(
    allocation: &Allocation,
    walltime: Walltime,
    network: NetworkMode,
) -> ReservationResult<Vec<JobSpec>> {
    let wants_vlan = allocation.vlan || network == NetworkMode::DedicatedVlan;
    let specs: Vec<JobSpec> = allocation
        .by_site()
        .into_iter()
        .enumerate()
        .map(|(i, (site, clusters))| JobSpec {
            site,
            clusters,
            vlan: wants_vlan && i == 0,
            subnet_units: network.subnet_units(),
            walltime,
            start: allocation.start,
            job_type: DEPLOY_JOB_TYPE.to_string(),
        })
        .collect();

    if specs.is_empty() {
        return Err(ReservationError::InvalidSpec("allocation binds no host".into()));
    }
    for spec in &specs {
        spec.validate()?;
        debug!(site = %spec.site, selector = %spec.selector(), "job spec built");
    }
    Ok(specs)
}
