//! `catalog.toml` — the testbed description.
//!
//! ```toml
//! vlans = 2
//! latency_ms = 5
//!
//! [[site]]
//! id = "lyon"
//!
//! [[site.cluster]]
//! id = "taurus"
//! hosts = 16
//! memory_mb = 32768
//! cpus = 12
//!
//! [[busy]]
//! cluster = "taurus"
//! hosts = 4
//! start_mins = 0
//! end_mins = 120
//!
//! [[job]]
//! id = 1001
//! site = "lyon"
//! cluster = "taurus"
//! hosts = 2
//! start_mins = -10
//! walltime = "3:00:00"
//!
//! [failures]
//! unreachable = { "taurus-3" = 1 }
//! vms = ["vm-7"]
//! ```
//!
//! Times are minutes relative to the moment the testbed is created.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use vmfleet_core::Walltime;
use vmfleet_planner::{ClusterInfo, PoolCatalog};

use crate::error::{TestbedError, TestbedResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedCatalog {
    /// Global virtual networks shared by every site.
    pub vlans: u32,
    /// Simulated duration of every remote operation.
    pub latency_ms: u64,
    #[serde(rename = "site")]
    pub sites: Vec<SiteDef>,
    pub busy: Vec<BusyWindow>,
    #[serde(rename = "job")]
    pub jobs: Vec<ExistingJob>,
    pub failures: FailurePlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteDef {
    pub id: String,
    #[serde(default, rename = "cluster")]
    pub clusters: Vec<ClusterDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDef {
    pub id: String,
    pub hosts: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_true")]
    pub virt: bool,
    #[serde(default = "default_true")]
    pub vlan: bool,
}

fn default_memory_mb() -> u64 {
    32768
}

fn default_cpus() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

/// Hosts of a cluster held by somebody else for a while.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusyWindow {
    pub cluster: String,
    pub hosts: u32,
    pub start_mins: i64,
    pub end_mins: i64,
}

/// A job that exists before the run, usable with `--job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingJob {
    pub id: u64,
    /// Absent for grid jobs.
    pub site: Option<String>,
    pub cluster: String,
    pub hosts: u32,
    #[serde(default)]
    pub start_mins: i64,
    pub walltime: String,
    #[serde(default)]
    pub vlan: bool,
}

/// Failures the testbed injects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePlan {
    /// Reject single-site submissions.
    pub submit: bool,
    /// Reject grid submissions.
    pub submit_batch: bool,
    /// Host → number of deployment attempts that leave it unreachable.
    pub unreachable: BTreeMap<String, u32>,
    pub packages: BTreeSet<String>,
    pub hypervisor: BTreeSet<String>,
    pub service_node: bool,
    pub disks: BTreeSet<String>,
    /// VMs that fail to boot.
    pub vms: BTreeSet<String>,
}

impl TestbedCatalog {
    pub fn parse(content: &str) -> TestbedResult<Self> {
        let catalog: Self = toml::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_file(path: &Path) -> TestbedResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn validate(&self) -> TestbedResult<()> {
        let mut seen = BTreeSet::new();
        for cluster in self.sites.iter().flat_map(|s| &s.clusters) {
            if !seen.insert(cluster.id.as_str()) {
                return Err(TestbedError::Invalid(format!(
                    "cluster '{}' is declared twice",
                    cluster.id
                )));
            }
        }
        for busy in &self.busy {
            if !seen.contains(busy.cluster.as_str()) {
                return Err(TestbedError::Invalid(format!(
                    "busy window on unknown cluster '{}'",
                    busy.cluster
                )));
            }
            if busy.end_mins <= busy.start_mins {
                return Err(TestbedError::Invalid(format!(
                    "busy window on '{}' ends before it starts",
                    busy.cluster
                )));
            }
        }
        for job in &self.jobs {
            if !seen.contains(job.cluster.as_str()) {
                return Err(TestbedError::Invalid(format!(
                    "job {} uses unknown cluster '{}'",
                    job.id, job.cluster
                )));
            }
            job.walltime
                .parse::<Walltime>()
                .map_err(|e| TestbedError::Invalid(format!("job {}: {e}", job.id)))?;
        }
        Ok(())
    }

    pub fn cluster(&self, id: &str) -> Option<(&SiteDef, &ClusterDef)> {
        self.sites
            .iter()
            .find_map(|s| s.clusters.iter().find(|c| c.id == id).map(|c| (s, c)))
    }

    /// The planner's view of the sites and clusters.
    pub fn pool_catalog(&self) -> PoolCatalog {
        PoolCatalog::new(self.sites.iter().flat_map(|site| {
            site.clusters.iter().map(|c| ClusterInfo {
                id: c.id.clone(),
                site: site.id.clone(),
                hosts: c.hosts,
                memory_mb: c.memory_mb,
                cpus: c.cpus,
                virt: c.virt,
                vlan: c.vlan,
            })
        }))
    }
}

/// Host names of a cluster: `CLUSTER-1` to `CLUSTER-N`.
pub fn host_names(cluster: &ClusterDef) -> impl Iterator<Item = String> + '_ {
    (1..=cluster.hosts).map(move |i| format!("{}-{i}", cluster.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
vlans = 1

[[site]]
id = "lyon"

[[site.cluster]]
id = "taurus"
hosts = 4
memory_mb = 65536
cpus = 12

[[site.cluster]]
id = "orion"
hosts = 2
virt = false

[[site]]
id = "nancy"

[[site.cluster]]
id = "graphene"
hosts = 8

[[busy]]
cluster = "graphene"
hosts = 3
start_mins = 0
end_mins = 60

[[job]]
id = 77
site = "lyon"
cluster = "taurus"
hosts = 2
walltime = "1:00:00"

[failures]
unreachable = { "taurus-2" = 1 }
vms = ["vm-3"]
"#;

    #[test]
    fn parses_a_full_catalog() {
        let catalog = TestbedCatalog::parse(SAMPLE).unwrap();
        assert_eq!(catalog.sites.len(), 2);
        assert_eq!(catalog.busy.len(), 1);
        assert_eq!(catalog.jobs[0].id, 77);
        assert_eq!(catalog.failures.unreachable["taurus-2"], 1);
        assert!(catalog.failures.vms.contains("vm-3"));

        let (site, orion) = catalog.cluster("orion").unwrap();
        assert_eq!(site.id, "lyon");
        assert!(!orion.virt);
        assert_eq!(orion.memory_mb, 32768);
    }

    #[test]
    fn pool_catalog_keeps_sites() {
        let pools = TestbedCatalog::parse(SAMPLE).unwrap().pool_catalog();
        assert_eq!(pools.site_of("graphene"), Some("nancy"));
        assert!(pools.is_site("lyon"));
        assert_eq!(pools.clusters().count(), 3);
    }

    #[test]
    fn rejects_jobs_on_unknown_clusters() {
        let bad = r#"
[[site]]
id = "lyon"
[[site.cluster]]
id = "taurus"
hosts = 1

[[job]]
id = 1
cluster = "sagittaire"
hosts = 1
walltime = "1:00:00"
"#;
        assert!(matches!(
            TestbedCatalog::parse(bad),
            Err(TestbedError::Invalid(_))
        ));
    }

    #[test]
    fn hosts_are_numbered_from_one() {
        let catalog = TestbedCatalog::parse(SAMPLE).unwrap();
        let (_, taurus) = catalog.cluster("taurus").unwrap();
        assert_eq!(
            host_names(taurus).collect::<Vec<_>>(),
            vec!["taurus-1", "taurus-2", "taurus-3", "taurus-4"]
        );
    }
}
