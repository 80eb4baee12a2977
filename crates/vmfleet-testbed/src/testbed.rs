//! In-memory testbed serving every collaborator contract.
//!
//! One [`Testbed`] plays the capacity service, the batch scheduler, the
//! provisioning service, the host executors and the VM runtime. State is
//! kept behind a single async mutex; no lock is held across a simulated
//! operation.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use ipnetwork::Ipv4Network;
use tokio::sync::Mutex;
use tracing::{debug, info};

use vmfleet_core::{ExclusionSet, JobHandle, PhysicalHost, PoolRequirement, VmDescriptor, Walltime};
use vmfleet_deploy::{
    Collaborators, DiskLocation, ExecError, Executor, HostImage, HypervisorConfig, JobWindow,
    PackageConfig, ProvisionOptions, Provisioner, Reachability, ResolvedResources,
    ResourceResolver, ServiceNodeConfig, VmHandle, VmRuntime,
};
use vmfleet_planner::{
    Availability, CapacityService, CapacityStep, PlanResult, PlanningWindow, PoolCatalog,
    ResourceTree,
};
use vmfleet_reservation::{JobSpec, ReservationTransport, TransportError};

use crate::catalog::{TestbedCatalog, host_names};

/// First job id handed out when the catalog declares none.
const FIRST_JOB_ID: u64 = 1000;

/// Base of the routed subnets handed to jobs asking for `/22` blocks.
const SUBNET_BASE: Ipv4Addr = Ipv4Addr::new(10, 158, 0, 0);

/// A submission received by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Single(JobSpec),
    Batch(Vec<JobSpec>),
}

/// A granted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub handle: JobHandle,
    pub hosts: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub vlan: Option<u32>,
    pub subnet_units: Option<u32>,
}

impl JobRecord {
    fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }

    fn active_at(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Hosts of one cluster unavailable over an interval.
#[derive(Debug, Clone)]
struct Hold {
    cluster: String,
    hosts: u32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LabState {
    jobs: BTreeMap<u64, JobRecord>,
    next_job_id: u64,
    submissions: Vec<Submission>,
    deploy_attempts: BTreeMap<String, u32>,
    installed: BTreeMap<String, Vec<String>>,
    hypervisors: BTreeSet<String>,
    dhcp: Option<(String, ServiceNodeConfig)>,
    disks: BTreeSet<(String, String)>,
    running: BTreeMap<String, Vec<String>>,
}

pub struct Testbed {
    catalog: TestbedCatalog,
    epoch: DateTime<Utc>,
    state: Mutex<LabState>,
}

impl Testbed {
    /// A testbed whose relative times count from now.
    pub fn new(catalog: TestbedCatalog) -> Self {
        Self::starting_at(catalog, Utc::now())
    }

    pub fn starting_at(catalog: TestbedCatalog, epoch: DateTime<Utc>) -> Self {
        let mut state = LabState {
            next_job_id: FIRST_JOB_ID,
            ..LabState::default()
        };
        for job in &catalog.jobs {
            let Some((_, cluster)) = catalog.cluster(&job.cluster) else {
                continue;
            };
            let Ok(walltime) = job.walltime.parse::<Walltime>() else {
                continue;
            };
            let start = epoch + TimeDelta::minutes(job.start_mins);
            let handle = match &job.site {
                Some(site) => JobHandle::on_site(job.id, site.clone()),
                None => JobHandle::grid(job.id),
            };
            state.jobs.insert(
                job.id,
                JobRecord {
                    handle,
                    hosts: host_names(cluster).take(job.hosts as usize).collect(),
                    start,
                    end: start + TimeDelta::seconds(walltime.as_secs() as i64),
                    vlan: job.vlan.then_some(1),
                    subnet_units: None,
                },
            );
            state.next_job_id = state.next_job_id.max(job.id + 1);
        }
        debug!(jobs = state.jobs.len(), "testbed ready");

        Self {
            catalog,
            epoch,
            state: Mutex::new(state),
        }
    }

    pub fn catalog(&self) -> &TestbedCatalog {
        &self.catalog
    }

    /// Every collaborator contract, served by this testbed.
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            resolver: self.clone(),
            provisioner: self.clone(),
            packages: self.clone(),
            hypervisor: self.clone(),
            service_node: self.clone(),
            runtime: self.clone(),
            reservations: self.clone(),
        }
    }

    pub async fn submissions(&self) -> Vec<Submission> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn job(&self, id: u64) -> Option<JobRecord> {
        self.state.lock().await.jobs.get(&id).cloned()
    }

    pub async fn deploy_attempts(&self, host: &str) -> u32 {
        self.state
            .lock()
            .await
            .deploy_attempts
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    /// VMs running per host.
    pub async fn running(&self) -> BTreeMap<String, Vec<String>> {
        self.state.lock().await.running.clone()
    }

    /// Packages installed on `host`, in installation order.
    pub async fn installed(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .installed
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    /// `(host, backing image)` pairs prepared so far.
    pub async fn disks(&self) -> BTreeSet<(String, String)> {
        self.state.lock().await.disks.clone()
    }

    pub async fn service_node(&self) -> Option<(String, ServiceNodeConfig)> {
        self.state.lock().await.dhcp.clone()
    }

    async fn pause(&self) {
        if self.catalog.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.catalog.latency_ms)).await;
        }
    }

    fn holds(&self, state: &LabState) -> Vec<Hold> {
        let mut holds: Vec<Hold> = self
            .catalog
            .busy
            .iter()
            .map(|b| Hold {
                cluster: b.cluster.clone(),
                hosts: b.hosts,
                start: self.epoch + TimeDelta::minutes(b.start_mins),
                end: self.epoch + TimeDelta::minutes(b.end_mins),
            })
            .collect();
        for job in state.jobs.values() {
            let mut per_cluster: BTreeMap<&str, u32> = BTreeMap::new();
            for host in &job.hosts {
                *per_cluster.entry(cluster_of(host)).or_default() += 1;
            }
            holds.extend(per_cluster.into_iter().map(|(cluster, hosts)| Hold {
                cluster: cluster.to_string(),
                hosts,
                start: job.start,
                end: job.end,
            }));
        }
        holds
    }

    fn free_at(&self, state: &LabState, holds: &[Hold], at: DateTime<Utc>) -> ResourceTree {
        let clusters = self
            .catalog
            .sites
            .iter()
            .flat_map(|s| &s.clusters)
            .map(|c| {
                let held: u32 = holds
                    .iter()
                    .filter(|h| h.cluster == c.id && h.start <= at && at < h.end)
                    .map(|h| h.hosts)
                    .sum();
                (c.id.clone(), c.hosts.saturating_sub(held))
            })
            .collect();
        let vlans_held = state
            .jobs
            .values()
            .filter(|j| j.vlan.is_some() && j.active_at(at))
            .count() as u32;
        ResourceTree {
            clusters,
            vlans: self.catalog.vlans.saturating_sub(vlans_held),
        }
    }

    /// Pick hosts for `clusters` over `[start, end)`.
    fn pick_hosts(
        &self,
        state: &LabState,
        clusters: &BTreeMap<String, u32>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, TransportError> {
        let taken: BTreeSet<&str> = state
            .jobs
            .values()
            .filter(|j| j.overlaps(start, end))
            .flat_map(|j| j.hosts.iter().map(String::as_str))
            .collect();

        let mut picked = Vec::new();
        for (id, wanted) in clusters {
            let (_, cluster) = self
                .catalog
                .cluster(id)
                .ok_or_else(|| TransportError::Rejected(format!("unknown cluster '{id}'")))?;
            let busy: u32 = self
                .catalog
                .busy
                .iter()
                .filter(|b| {
                    b.cluster == *id
                        && self.epoch + TimeDelta::minutes(b.start_mins) < end
                        && start < self.epoch + TimeDelta::minutes(b.end_mins)
                })
                .map(|b| b.hosts)
                .sum();
            let free: Vec<String> = host_names(cluster)
                .filter(|h| !taken.contains(h.as_str()))
                .collect();
            let room = (free.len() as u32).min(cluster.hosts.saturating_sub(busy));
            if *wanted > room {
                return Err(TransportError::Rejected(format!(
                    "cluster '{id}': {wanted} hosts requested, {room} free"
                )));
            }
            picked.extend(free.into_iter().take(*wanted as usize));
        }
        Ok(picked)
    }

    fn pick_vlan(
        &self,
        state: &LabState,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u32, TransportError> {
        let used: BTreeSet<u32> = state
            .jobs
            .values()
            .filter(|j| j.overlaps(start, end))
            .filter_map(|j| j.vlan)
            .collect();
        (1..=self.catalog.vlans)
            .find(|v| !used.contains(v))
            .ok_or_else(|| TransportError::Rejected("no virtual network left".into()))
    }

    fn grant(
        &self,
        state: &mut LabState,
        specs: &[JobSpec],
        site: Option<String>,
    ) -> Result<JobHandle, TransportError> {
        let spec = specs.first().ok_or(TransportError::NoHandle)?;
        let start = spec.start;
        let end = start + TimeDelta::seconds(spec.walltime.as_secs() as i64);

        let mut clusters = BTreeMap::new();
        for spec in specs {
            for (cluster, n) in &spec.clusters {
                *clusters.entry(cluster.clone()).or_default() += *n;
            }
        }
        let hosts = self.pick_hosts(state, &clusters, start, end)?;
        let vlan = if specs.iter().any(|s| s.vlan) {
            Some(self.pick_vlan(state, start, end)?)
        } else {
            None
        };

        let id = state.next_job_id;
        state.next_job_id += 1;
        let handle = match site {
            Some(site) => JobHandle::on_site(id, site),
            None => JobHandle::grid(id),
        };
        info!(job = %handle, hosts = hosts.len(), ?vlan, "testbed job granted");
        state.jobs.insert(
            id,
            JobRecord {
                handle: handle.clone(),
                hosts,
                start,
                end,
                vlan,
                subnet_units: specs.iter().find_map(|s| s.subnet_units),
            },
        );
        Ok(handle)
    }

    fn records<'a>(
        state: &'a LabState,
        handles: &[JobHandle],
    ) -> Result<Vec<&'a JobRecord>, ExecError> {
        handles
            .iter()
            .map(|h| {
                state
                    .jobs
                    .get(&h.id)
                    .ok_or_else(|| ExecError::Failed(format!("unknown job {h}")))
            })
            .collect()
    }

    fn physical_host(&self, id: &str) -> Option<PhysicalHost> {
        let (site, cluster) = self.catalog.cluster(cluster_of(id))?;
        Some(PhysicalHost {
            id: id.to_string(),
            pool: cluster.id.clone(),
            site: site.id.clone(),
            memory_mb: cluster.memory_mb,
            cpus: cluster.cpus,
        })
    }
}

/// `taurus-12` belongs to `taurus`.
fn cluster_of(host: &str) -> &str {
    host.rsplit_once('-').map_or(host, |(cluster, _)| cluster)
}

/// Network covering `units` `/22` blocks, rounded up to a power of two.
fn subnet_network(units: u32) -> Result<Ipv4Network, ExecError> {
    let bits = units.max(1).next_power_of_two().trailing_zeros();
    let prefix = 22u32.saturating_sub(bits) as u8;
    Ipv4Network::new(SUBNET_BASE, prefix).map_err(|e| ExecError::Failed(e.to_string()))
}

// ── Capacity ──────────────────────────────────────────────────────

#[async_trait]
impl CapacityService for Testbed {
    async fn catalog(&self) -> PlanResult<PoolCatalog> {
        Ok(self.catalog.pool_catalog())
    }

    async fn planning(
        &self,
        requirement: &PoolRequirement,
        exclusions: &ExclusionSet,
        window: PlanningWindow,
    ) -> PlanResult<Availability> {
        let state = self.state.lock().await;
        let holds = self.holds(&state);

        let mut points: BTreeSet<DateTime<Utc>> = BTreeSet::from([window.start]);
        for hold in &holds {
            for at in [hold.start, hold.end] {
                if window.start < at && at < window.end {
                    points.insert(at);
                }
            }
        }
        let steps: Vec<CapacityStep> = points
            .into_iter()
            .map(|at| CapacityStep {
                at,
                free: self.free_at(&state, &holds, at).without(exclusions),
            })
            .collect();
        debug!(
            pools = requirement.len(),
            steps = steps.len(),
            "testbed availability computed"
        );
        Ok(Availability { window, steps })
    }
}

// ── Scheduler ─────────────────────────────────────────────────────

#[async_trait]
impl ReservationTransport for Testbed {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, TransportError> {
        let mut state = self.state.lock().await;
        state.submissions.push(Submission::Single(spec.clone()));
        if self.catalog.failures.submit {
            return Err(TransportError::Rejected(format!(
                "site {} refused the submission",
                spec.site
            )));
        }
        self.grant(&mut state, std::slice::from_ref(spec), Some(spec.site.clone()))
    }

    async fn submit_batch(&self, specs: &[JobSpec]) -> Result<JobHandle, TransportError> {
        let mut state = self.state.lock().await;
        state.submissions.push(Submission::Batch(specs.to_vec()));
        if self.catalog.failures.submit_batch {
            return Err(TransportError::Rejected("grid submission refused".into()));
        }
        self.grant(&mut state, specs, None)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        match state.jobs.remove(&handle.id) {
            Some(_) => {
                info!(job = %handle, "testbed job cancelled");
                Ok(())
            }
            None => Err(TransportError::UnknownJob(handle.to_string())),
        }
    }
}

// ── Resolution ────────────────────────────────────────────────────

#[async_trait]
impl ResourceResolver for Testbed {
    async fn job_window(&self, handles: &[JobHandle]) -> Result<JobWindow, ExecError> {
        let state = self.state.lock().await;
        let records = Self::records(&state, handles)?;
        let start = records.iter().map(|r| r.start).max();
        let end = records.iter().map(|r| r.end).min();
        match (start, end) {
            (Some(start), Some(end)) => Ok(JobWindow { start, end }),
            _ => Err(ExecError::Failed("no job given".into())),
        }
    }

    async fn wait_start(&self, handles: &[JobHandle]) -> Result<(), ExecError> {
        let window = self.job_window(handles).await?;
        if window.start > Utc::now() {
            // Simulated clock: the start is reached instantly.
            debug!(start = %window.start, "testbed clock moved to job start");
        }
        self.pause().await;
        Ok(())
    }

    async fn resolve(&self, handles: &[JobHandle]) -> Result<ResolvedResources, ExecError> {
        let state = self.state.lock().await;
        let records = Self::records(&state, handles)?;

        let mut hosts = Vec::new();
        for id in records.iter().flat_map(|r| &r.hosts) {
            let host = self
                .physical_host(id)
                .ok_or_else(|| ExecError::Failed(format!("host {id} is not in the catalog")))?;
            hosts.push(host);
        }
        let network = match records.iter().find_map(|r| r.subnet_units) {
            Some(units) => Some(subnet_network(units)?),
            None => None,
        };
        Ok(ResolvedResources {
            hosts,
            vlan: records.iter().find_map(|r| r.vlan),
            network,
        })
    }
}

// ── Hosts ─────────────────────────────────────────────────────────

#[async_trait]
impl Provisioner for Testbed {
    async fn deploy(
        &self,
        host: &PhysicalHost,
        image: &HostImage,
        options: &ProvisionOptions,
    ) -> Result<Reachability, ExecError> {
        self.pause().await;
        let mut state = self.state.lock().await;
        let attempts = state.deploy_attempts.entry(host.id.clone()).or_default();
        *attempts += 1;
        let failing = self
            .catalog
            .failures
            .unreachable
            .get(&host.id)
            .copied()
            .unwrap_or(0);
        debug!(host = %host.id, %image, attempt = options.attempt, "testbed deploy");
        if *attempts <= failing {
            Ok(Reachability::Unreachable)
        } else {
            Ok(Reachability::Reachable)
        }
    }
}

#[async_trait]
impl Executor<PackageConfig> for Testbed {
    async fn apply(&self, host: &PhysicalHost, config: &PackageConfig) -> Result<(), ExecError> {
        self.pause().await;
        if self.catalog.failures.packages.contains(&host.id) {
            return Err(ExecError::Failed(format!("{}: package install failed", host.id)));
        }
        let mut state = self.state.lock().await;
        state
            .installed
            .entry(host.id.clone())
            .or_default()
            .extend(config.packages.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl Executor<HypervisorConfig> for Testbed {
    async fn apply(&self, host: &PhysicalHost, config: &HypervisorConfig) -> Result<(), ExecError> {
        self.pause().await;
        if self.catalog.failures.hypervisor.contains(&host.id) {
            return Err(ExecError::Failed(format!("{}: hypervisor did not start", host.id)));
        }
        debug!(host = %host.id, max_vms = config.max_vms, "testbed hypervisor ready");
        self.state.lock().await.hypervisors.insert(host.id.clone());
        Ok(())
    }
}

#[async_trait]
impl Executor<ServiceNodeConfig> for Testbed {
    async fn apply(&self, host: &PhysicalHost, config: &ServiceNodeConfig) -> Result<(), ExecError> {
        self.pause().await;
        if self.catalog.failures.service_node {
            return Err(ExecError::Unreachable(host.id.clone()));
        }
        self.state.lock().await.dhcp = Some((host.id.clone(), config.clone()));
        Ok(())
    }
}

// ── VMs ───────────────────────────────────────────────────────────

#[async_trait]
impl VmRuntime for Testbed {
    async fn destroy_all(&self, host: &PhysicalHost) -> Result<u32, ExecError> {
        self.pause().await;
        let removed = self.state.lock().await.running.remove(&host.id);
        Ok(removed.map_or(0, |vms| vms.len() as u32))
    }

    async fn prepare_disk(&self, host: &PhysicalHost, backing: &str) -> Result<(), ExecError> {
        self.pause().await;
        if self.catalog.failures.disks.contains(&host.id) {
            return Err(ExecError::Failed(format!("{}: cannot copy {backing}", host.id)));
        }
        self.state
            .lock()
            .await
            .disks
            .insert((host.id.clone(), backing.to_string()));
        Ok(())
    }

    async fn instantiate(
        &self,
        host: &PhysicalHost,
        vm: &VmDescriptor,
        disk: DiskLocation,
    ) -> Result<VmHandle, ExecError> {
        self.pause().await;
        if self.catalog.failures.vms.contains(&vm.id) {
            return Err(ExecError::Failed(format!("{} did not boot", vm.id)));
        }
        let mut state = self.state.lock().await;
        if !state.hypervisors.contains(&host.id) {
            return Err(ExecError::Failed(format!("{} runs no hypervisor", host.id)));
        }
        debug!(vm = %vm.id, host = %host.id, ?disk, "testbed VM started");
        state
            .running
            .entry(host.id.clone())
            .or_default()
            .push(vm.id.clone());
        Ok(VmHandle {
            vm_id: vm.id.clone(),
            host: host.id.clone(),
            ip: vm.ip,
        })
    }

    async fn list(&self, host: &PhysicalHost) -> Result<Vec<String>, ExecError> {
        Ok(self
            .state
            .lock()
            .await
            .running
            .get(&host.id)
            .cloned()
            .unwrap_or_default())
    }
}
