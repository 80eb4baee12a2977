//! Deployment orchestrator — drives the phase pipeline.
//!
//! A single control flow sequences the phases. Within a phase, per-host
//! and per-VM operations fan out on a [`WorkerPool`]; their results are
//! folded into the [`DeploymentState`] and the [`RunContext`] only once
//! every worker has reported back.
//!
//! ```text
//! ResourceResolution ─► HostProvisioning ─► PackageManagement
//!        ─► HypervisorConfiguration ─► ServiceNodeConfiguration ─► VmInstantiation
//! ```
//!
//! Host failures exclude the host; VM failures exclude the VM. The run
//! aborts only when a phase is left without any candidate.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{error, info, warn};

use vmfleet_core::{JobHandle, PhysicalHost, RunContext, RunStatus, Topology, VmDescriptor};

use crate::addressing::{AddressPlan, default_network};
use crate::distribution::distribute;
use crate::error::{DeployError, DeployResult, ExecError};
use crate::executors::{
    Collaborators, HypervisorConfig, PackageConfig, ProvisionOptions, Reachability,
    ResolvedResources,
};
use crate::output::{
    SNAPSHOT_AFTER, SNAPSHOT_BEFORE, TopologySnapshot, create_outdir, write_host_list,
    write_vm_list,
};
use crate::phase::{
    DeployOptions, DeploymentState, DiskLocation, HostImage, PackageMode, Phase, PhaseOutcome,
};
use crate::workers::WorkerPool;

const VM_BRIDGE: &str = "br0";
const VM_STORAGE_DIR: &str = "/tmp/vmfleet";

/// What a finished deployment leaves behind.
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub status: RunStatus,
    /// Hosts that survived every phase.
    pub hosts: Vec<PhysicalHost>,
    /// VMs that were started, with host and address.
    pub vms: Vec<VmDescriptor>,
    /// VM → host of every started VM.
    pub bindings: BTreeMap<String, String>,
    pub service_node: String,
    pub hosts_file: PathBuf,
    pub vms_file: PathBuf,
    pub phases: Vec<(Phase, PhaseOutcome)>,
}

pub struct Orchestrator {
    collaborators: Collaborators,
    options: DeployOptions,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, options: DeployOptions) -> Self {
        Self {
            collaborators,
            options,
        }
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.options.parallelism).with_timeout(self.options.phase_timeout)
    }

    /// Run every phase for the hosts behind `handles`.
    pub async fn run(
        &self,
        handles: &[JobHandle],
        topology: &Topology,
        ctx: &mut RunContext,
    ) -> DeployResult<DeploymentReport> {
        if handles.is_empty() {
            return Err(DeployError::ResourceResolutionFailed("no job handle".into()));
        }
        create_outdir(&self.options.outdir)?;
        let mut state = DeploymentState::new();

        info!("── HOSTS ──");
        let hosts_started = Instant::now();
        let resources = self.resolve_resources(handles, &mut state, ctx).await?;
        let hosts_file = self.options.outdir.join(crate::output::HOSTS_FILE);
        self.provision_hosts(&mut state, ctx).await?;
        self.manage_packages(&mut state, ctx).await?;

        let vm_memory = topology
            .vms
            .iter()
            .map(|vm| vm.template.mem)
            .min()
            .unwrap_or(self.options.vm_template.mem);
        self.configure_hypervisor(&mut state, ctx, resources.vlan, vm_memory)
            .await?;

        let vms = self.vm_set(topology, state.hosts());
        let network = match resources.network {
            Some(network) => network,
            None => default_network()?,
        };
        let ids: Vec<String> = vms.iter().map(|vm| vm.id.clone()).collect();
        let plan = AddressPlan::allocate(network, &ids, &mut StdRng::from_entropy())?;
        info!(
            network = %plan.network,
            router = %plan.router,
            leases = plan.leases.len(),
            "VM addresses generated"
        );

        let service_node = self
            .configure_service_node(&mut state, ctx, &plan, &vms)
            .await?;
        info!("stage done in {:.1} s", hosts_started.elapsed().as_secs_f64());

        info!("── VIRTUAL MACHINES ──");
        let vms_started = Instant::now();
        let placed = self
            .instantiate_vms(&mut state, ctx, vms, &plan, &service_node)
            .await?;
        info!("stage done in {:.1} s", vms_started.elapsed().as_secs_f64());

        let vms_file = write_vm_list(&self.options.outdir, &placed)?;
        if placed.is_empty() {
            return Err(DeployError::NoVmPlaced);
        }

        let status = if ctx.excluded_hosts().is_empty() && ctx.failed_vms().is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::PartiallyCompleted
        };
        info!(
            status = status.label(),
            hosts = state.hosts().len(),
            vms = placed.len(),
            excluded_hosts = ctx.excluded_hosts().len(),
            failed_vms = ctx.failed_vms().len(),
            "deployment finished"
        );

        Ok(DeploymentReport {
            status,
            hosts: state.hosts().to_vec(),
            vms: placed,
            bindings: state.bindings().clone(),
            service_node: service_node.id,
            hosts_file,
            vms_file,
            phases: state.completed().to_vec(),
        })
    }

    // ── ResourceResolution ────────────────────────────────────────

    async fn resolve_resources(
        &self,
        handles: &[JobHandle],
        state: &mut DeploymentState,
        ctx: &mut RunContext,
    ) -> DeployResult<ResolvedResources> {
        state.enter(Phase::ResourceResolution)?;
        let started = Instant::now();
        let jobs = handle_list(handles);
        let resolver = &self.collaborators.resolver;
        let failed = |e: ExecError| DeployError::ResourceResolutionFailed(format!("{jobs}: {e}"));

        let window = resolver.job_window(handles).await.map_err(failed)?;
        let now = Utc::now();
        if window.end <= now {
            return Err(DeployError::ResourceResolutionFailed(format!(
                "job(s) {jobs} already finished at {}",
                window.end.format("%Y-%m-%d %H:%M:%S")
            )));
        }
        if window.start > now {
            info!(
                jobs = %jobs,
                start = %window.start.format("%Y-%m-%d %H:%M:%S"),
                "reservation not started yet, waiting"
            );
        }
        resolver.wait_start(handles).await.map_err(failed)?;
        info!(jobs = %jobs, "reservation has started");

        let resources = resolver.resolve(handles).await.map_err(failed)?;
        if resources.hosts.is_empty() {
            return Err(DeployError::ResourceResolutionFailed(format!(
                "job(s) {jobs} hold no host"
            )));
        }

        if self.options.dedicated_vlan && resources.vlan.is_none() {
            error!(jobs = %jobs, "no virtual network found, cancelling the reservation");
            for handle in handles {
                if let Err(e) = self.collaborators.reservations.cancel(handle).await {
                    warn!(job = %handle, error = %e, "failed to cancel reservation");
                }
            }
            return Err(DeployError::VlanMissing(jobs));
        }

        state.set_hosts(resources.hosts.clone());
        write_host_list(&self.options.outdir, state.hosts())?;
        info!(
            hosts = state.hosts().len(),
            vlan = ?resources.vlan,
            network = ?resources.network,
            "resources resolved"
        );

        ctx.finish_stage(Phase::ResourceResolution.name(), started);
        state.finish(PhaseOutcome::Done);
        Ok(resources)
    }

    // ── HostProvisioning ──────────────────────────────────────────

    async fn provision_hosts(
        &self,
        state: &mut DeploymentState,
        ctx: &mut RunContext,
    ) -> DeployResult<()> {
        state.enter(Phase::HostProvisioning)?;
        if self.options.max_retries == 0 {
            info!("host provisioning skipped, hosts are used as they are");
            ctx.record_stage(Phase::HostProvisioning.name(), Duration::ZERO);
            state.finish(PhaseOutcome::Skipped);
            return Ok(());
        }
        let started = Instant::now();

        let mut pending: Vec<PhysicalHost> = state.hosts().to_vec();
        let mut deployed: BTreeSet<String> = BTreeSet::new();
        let mut last_error: BTreeMap<String, String> = BTreeMap::new();

        for attempt in 1..=self.options.max_retries {
            if pending.is_empty() {
                break;
            }
            info!(
                attempt,
                hosts = pending.len(),
                image = %self.options.host_image,
                "deploying hosts"
            );

            let provisioner = Arc::clone(&self.collaborators.provisioner);
            let image = self.options.host_image.clone();
            let options = ProvisionOptions {
                attempt,
                force: self.options.force_deploy,
            };
            let report = self
                .pool()
                .run(pending, move |host| {
                    let provisioner = Arc::clone(&provisioner);
                    let image = image.clone();
                    let options = options.clone();
                    async move { provisioner.deploy(&host, &image, &options).await }
                })
                .await;

            pending = Vec::new();
            for (host, reachability) in report.succeeded {
                match reachability {
                    Reachability::Reachable => {
                        deployed.insert(host.id.clone());
                    }
                    Reachability::Unreachable => {
                        last_error.insert(host.id.clone(), "unreachable after deployment".into());
                        pending.push(host);
                    }
                }
            }
            for (host, e) in report.failed {
                last_error.insert(host.id.clone(), e.to_string());
                pending.push(host);
            }
            if !pending.is_empty() && attempt < self.options.max_retries {
                warn!(hosts = pending.len(), attempt, "redeploying hosts that did not come back");
            }
        }

        for host in &pending {
            let reason = last_error
                .get(&host.id)
                .cloned()
                .unwrap_or_else(|| "not deployed".into());
            warn!(host = %host.id, %reason, "host excluded");
            ctx.exclude_host(&host.id, format!("deployment failed: {reason}"));
        }
        state.retain_hosts(|id| deployed.contains(id));
        if state.hosts().is_empty() {
            return Err(DeployError::NoSurvivingHosts("no host has been deployed".into()));
        }

        info!(
            deployed = state.hosts().len(),
            excluded = pending.len(),
            "hosts deployed"
        );
        ctx.finish_stage(Phase::HostProvisioning.name(), started);
        state.finish(PhaseOutcome::Done);
        Ok(())
    }

    // ── PackageManagement ─────────────────────────────────────────

    async fn manage_packages(
        &self,
        state: &mut DeploymentState,
        ctx: &mut RunContext,
    ) -> DeployResult<()> {
        state.enter(Phase::PackageManagement)?;
        let (packages, upgrade, cache) = match self.options.effective_packages() {
            PackageMode::Skip => {
                if matches!(self.options.host_image, HostImage::File(_)) {
                    warn!("image file given, the image must already carry the hypervisor stack");
                }
                info!("package management skipped");
                ctx.record_stage(Phase::PackageManagement.name(), Duration::ZERO);
                state.finish(PhaseOutcome::Skipped);
                return Ok(());
            }
            PackageMode::Full { cache } => (self.options.full_packages.clone(), true, cache),
            PackageMode::Minimal => (self.options.minimal_packages.clone(), false, false),
        };
        let started = Instant::now();
        let executor = Arc::clone(&self.collaborators.packages);

        let mut cache_host = None;
        if cache {
            if let Some(host) = state.hosts().first() {
                let staging = PackageConfig {
                    packages: vec![self.options.cache_package.clone()],
                    upgrade: false,
                    cache_host: None,
                };
                match executor.apply(host, &staging).await {
                    Ok(()) => {
                        info!(host = %host.id, "package cache staged");
                        cache_host = Some(host.id.clone());
                    }
                    Err(e) => warn!(host = %host.id, error = %e, "package cache unavailable"),
                }
            }
        }

        let config = Arc::new(PackageConfig {
            packages,
            upgrade,
            cache_host,
        });
        info!(
            hosts = state.hosts().len(),
            packages = config.packages.len(),
            upgrade,
            "installing packages"
        );
        let report = self
            .pool()
            .run(state.hosts().to_vec(), move |host| {
                let executor = Arc::clone(&executor);
                let config = Arc::clone(&config);
                async move { executor.apply(&host, &config).await }
            })
            .await;

        self.exclude_failed(state, ctx, report.failed, "package installation failed");
        ctx.finish_stage(Phase::PackageManagement.name(), started);
        state.finish(PhaseOutcome::Done);
        Ok(())
    }

    // ── HypervisorConfiguration ───────────────────────────────────

    async fn configure_hypervisor(
        &self,
        state: &mut DeploymentState,
        ctx: &mut RunContext,
        vlan: Option<u32>,
        vm_memory_mb: u64,
    ) -> DeployResult<()> {
        state.enter(Phase::HypervisorConfiguration)?;
        let started = Instant::now();
        let executor = Arc::clone(&self.collaborators.hypervisor);

        let report = self
            .pool()
            .run(state.hosts().to_vec(), move |host| {
                let executor = Arc::clone(&executor);
                let config = HypervisorConfig {
                    bridge: VM_BRIDGE.to_string(),
                    storage_dir: VM_STORAGE_DIR.to_string(),
                    vlan,
                    max_vms: host.max_vms(vm_memory_mb),
                };
                async move { executor.apply(&host, &config).await }
            })
            .await;

        self.exclude_failed(state, ctx, report.failed, "hypervisor configuration failed");
        if state.hosts().is_empty() {
            return Err(DeployError::NoSurvivingHosts(
                "no host has a configured hypervisor".into(),
            ));
        }

        let capacity: u32 = state.hosts().iter().map(|h| h.max_vms(vm_memory_mb)).sum();
        info!(
            hosts = state.hosts().len(),
            max_vms = capacity,
            vm_memory_mb,
            "hypervisor configured"
        );
        ctx.finish_stage(Phase::HypervisorConfiguration.name(), started);
        state.finish(PhaseOutcome::Done);
        Ok(())
    }

    // ── ServiceNodeConfiguration ──────────────────────────────────

    async fn configure_service_node(
        &self,
        state: &mut DeploymentState,
        ctx: &mut RunContext,
        plan: &AddressPlan,
        vms: &[VmDescriptor],
    ) -> DeployResult<PhysicalHost> {
        state.enter(Phase::ServiceNodeConfiguration)?;
        let started = Instant::now();
        let service_node = state
            .hosts()
            .first()
            .cloned()
            .ok_or_else(|| DeployError::NoSurvivingHosts("no host left for the service node".into()))?;

        let config = plan.service_node_config();
        self.collaborators
            .service_node
            .apply(&service_node, &config)
            .await
            .map_err(|source| DeployError::ServiceNode {
                host: service_node.id.clone(),
                source,
            })?;
        info!(host = %service_node.id, dhcp_hosts = config.dhcp_hosts.len(), "service node configured");

        // The shared copy must exist before any VM references it.
        if self.options.disk_location == DiskLocation::One {
            for backing in backing_images(vms) {
                self.collaborators
                    .runtime
                    .prepare_disk(&service_node, &backing)
                    .await
                    .map_err(|source| DeployError::ServiceNode {
                        host: service_node.id.clone(),
                        source,
                    })?;
                info!(host = %service_node.id, %backing, "backing image prepared once");
            }
        }

        ctx.finish_stage(Phase::ServiceNodeConfiguration.name(), started);
        state.finish(PhaseOutcome::Done);
        Ok(service_node)
    }

    // ── VmInstantiation ───────────────────────────────────────────

    async fn instantiate_vms(
        &self,
        state: &mut DeploymentState,
        ctx: &mut RunContext,
        mut vms: Vec<VmDescriptor>,
        plan: &AddressPlan,
        service_node: &PhysicalHost,
    ) -> DeployResult<Vec<VmDescriptor>> {
        state.enter(Phase::VmInstantiation)?;
        let started = Instant::now();
        let runtime = Arc::clone(&self.collaborators.runtime);

        if self.options.snapshots {
            self.snapshot(state.hosts(), SNAPSHOT_BEFORE).await?;
        }

        let cleaner = Arc::clone(&runtime);
        let report = self
            .pool()
            .run(state.hosts().to_vec(), move |host| {
                let runtime = Arc::clone(&cleaner);
                async move { runtime.destroy_all(&host).await }
            })
            .await;
        let destroyed: u32 = report.succeeded.iter().map(|(_, n)| n).sum();
        info!(destroyed, "existing VMs destroyed");
        self.exclude_failed(state, ctx, report.failed, "pre-clean failed");

        let distribution = distribute(&vms, state.hosts(), self.options.distribution);
        for vm in &distribution.unplaced {
            ctx.fail_vm(vm, "no host with enough free memory");
        }
        let targets: BTreeMap<String, String> = distribution.bindings.into_iter().collect();
        for vm in &mut vms {
            vm.host = targets.get(&vm.id).cloned();
            if let Some(lease) = plan.lease(&vm.id) {
                vm.ip = Some(lease.ip);
                vm.mac = Some(lease.mac.clone());
            }
        }
        let hosts_by_id: Arc<BTreeMap<String, PhysicalHost>> = Arc::new(
            state
                .hosts()
                .iter()
                .map(|h| (h.id.clone(), h.clone()))
                .collect(),
        );

        if self.options.disk_location == DiskLocation::All {
            let failed_hosts = self.prepare_disks_on_hosts(&vms, &hosts_by_id).await;
            for vm in &mut vms {
                if let Some(reason) = vm.host.as_ref().and_then(|h| failed_hosts.get(h)) {
                    ctx.fail_vm(&vm.id, format!("backing disk preparation failed: {reason}"));
                    vm.host = None;
                }
            }
        }

        let to_start: Vec<VmDescriptor> = vms.iter().filter(|vm| vm.host.is_some()).cloned().collect();
        info!(
            vms = to_start.len(),
            hosts = hosts_by_id.len(),
            policy = %self.options.distribution,
            service_node = %service_node.id,
            "instantiating VMs"
        );
        let disk = self.options.disk_location;
        let hosts = Arc::clone(&hosts_by_id);
        let report = self
            .pool()
            .run(to_start, move |vm| {
                let runtime = Arc::clone(&runtime);
                let hosts = Arc::clone(&hosts);
                async move {
                    let host = vm
                        .host
                        .as_ref()
                        .and_then(|id| hosts.get(id))
                        .ok_or_else(|| ExecError::Failed("VM has no host".into()))?;
                    runtime.instantiate(host, &vm, disk).await
                }
            })
            .await;

        for (vm, e) in &report.failed {
            warn!(vm = %vm.id, host = ?vm.host, error = %e, "VM failed to start");
            ctx.fail_vm(&vm.id, e.to_string());
        }
        let mut placed = Vec::with_capacity(report.succeeded.len());
        for (mut vm, handle) in report.succeeded {
            state.bind(vm.id.clone(), handle.host.clone());
            vm.host = Some(handle.host);
            if handle.ip.is_some() {
                vm.ip = handle.ip;
            }
            placed.push(vm);
        }
        info!(started = placed.len(), failed = report.failed.len(), "VMs started");

        if self.options.snapshots {
            self.snapshot(state.hosts(), SNAPSHOT_AFTER).await?;
        }

        ctx.finish_stage(Phase::VmInstantiation.name(), started);
        state.finish(PhaseOutcome::Done);
        Ok(placed)
    }

    /// Prepare backing images on every host that receives VMs.
    ///
    /// Returns the hosts that failed, with the reason.
    async fn prepare_disks_on_hosts(
        &self,
        vms: &[VmDescriptor],
        hosts_by_id: &BTreeMap<String, PhysicalHost>,
    ) -> BTreeMap<String, String> {
        let mut per_host: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for vm in vms {
            if let Some(host) = &vm.host {
                let images = per_host.entry(host.clone()).or_default();
                if !vm.backing_image().is_empty() {
                    images.insert(vm.backing_image().to_string());
                }
            }
        }
        let items: Vec<(PhysicalHost, Vec<String>)> = per_host
            .into_iter()
            .filter_map(|(id, images)| {
                hosts_by_id
                    .get(&id)
                    .map(|h| (h.clone(), images.into_iter().collect()))
            })
            .collect();
        info!(hosts = items.len(), "preparing backing images on every host");

        let runtime = Arc::clone(&self.collaborators.runtime);
        let report = self
            .pool()
            .run(items, move |(host, images)| {
                let runtime = Arc::clone(&runtime);
                async move {
                    for image in &images {
                        runtime.prepare_disk(&host, image).await?;
                    }
                    Ok(())
                }
            })
            .await;

        report
            .failed
            .into_iter()
            .map(|((host, _), e)| {
                warn!(host = %host.id, error = %e, "backing image preparation failed");
                (host.id, e.to_string())
            })
            .collect()
    }

    async fn snapshot(&self, hosts: &[PhysicalHost], name: &str) -> DeployResult<()> {
        let runtime = Arc::clone(&self.collaborators.runtime);
        let report = self
            .pool()
            .run(hosts.to_vec(), move |host| {
                let runtime = Arc::clone(&runtime);
                async move { runtime.list(&host).await }
            })
            .await;
        for (host, e) in &report.failed {
            warn!(host = %host.id, error = %e, "cannot list VMs for snapshot");
        }
        let snapshot = TopologySnapshot {
            taken_at: Utc::now(),
            hosts: report
                .succeeded
                .into_iter()
                .map(|(host, vms)| (host.id, vms))
                .collect(),
        };
        snapshot.write(&self.options.outdir, name)?;
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────

    /// Exclude every failed host from the state and record why.
    fn exclude_failed(
        &self,
        state: &mut DeploymentState,
        ctx: &mut RunContext,
        failed: Vec<(PhysicalHost, ExecError)>,
        what: &str,
    ) {
        if failed.is_empty() {
            return;
        }
        let mut excluded = BTreeSet::new();
        for (host, e) in failed {
            warn!(host = %host.id, error = %e, "{what}, host excluded");
            ctx.exclude_host(&host.id, format!("{what}: {e}"));
            excluded.insert(host.id);
        }
        state.retain_hosts(|id| !excluded.contains(id));
    }

    /// The requested VMs, or one VM per host when none were requested.
    fn vm_set(&self, topology: &Topology, hosts: &[PhysicalHost]) -> Vec<VmDescriptor> {
        if !topology.vms.is_empty() {
            return topology.vms.clone();
        }
        info!(vms = hosts.len(), "no VM requested, defining one per host");
        (1..=hosts.len())
            .map(|i| VmDescriptor::new(format!("vm-{i}"), self.options.vm_template.clone()))
            .collect()
    }
}

fn handle_list(handles: &[JobHandle]) -> String {
    handles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn backing_images(vms: &[VmDescriptor]) -> BTreeSet<String> {
    vms.iter()
        .map(|vm| vm.backing_image().to_string())
        .filter(|b| !b.is_empty())
        .collect()
}
