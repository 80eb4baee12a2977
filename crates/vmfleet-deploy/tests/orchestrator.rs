//! Orchestrator integration tests.
//!
//! Every collaborator is served by one in-memory `FakeLab` that records
//! the calls it receives and fails on demand, so the whole phase pipeline
//! runs in-process.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use vmfleet_core::{
    FleetConfig, JobHandle, PhysicalHost, PoolRequirement, RunContext, RunStatus, Topology,
    VmDescriptor, VmTemplate,
};
use vmfleet_deploy::*;
use vmfleet_reservation::{JobSpec, ReservationTransport, TransportError};

#[derive(Default)]
struct FakeLab {
    hosts: Vec<PhysicalHost>,
    vlan: Option<u32>,
    window: Option<JobWindow>,
    /// Host → deployment attempts that come back unreachable.
    unreachable: BTreeMap<String, u32>,
    broken_packages: BTreeSet<String>,
    broken_hypervisors: BTreeSet<String>,
    broken_service_node: bool,
    broken_disks: BTreeSet<String>,
    broken_vms: BTreeSet<String>,

    deploy_calls: Mutex<Vec<(String, u32)>>,
    cancelled: Mutex<Vec<JobHandle>>,
    package_calls: Mutex<Vec<(String, PackageConfig)>>,
    prepared: Mutex<Vec<(String, String)>>,
    service_configs: Mutex<Vec<(String, ServiceNodeConfig)>>,
    running: Mutex<BTreeMap<String, Vec<String>>>,
}

fn host(id: &str, pool: &str, site: &str) -> PhysicalHost {
    PhysicalHost {
        id: id.into(),
        pool: pool.into(),
        site: site.into(),
        memory_mb: 32768,
        cpus: 16,
    }
}

impl FakeLab {
    fn with_hosts(ids: &[&str]) -> Self {
        Self {
            hosts: ids.iter().map(|id| host(id, "taurus", "lyon")).collect(),
            ..Self::default()
        }
    }

    fn collaborators(self: &Arc<Self>) -> Collaborators {
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
}

#[async_trait]
impl ResourceResolver for FakeLab {
    async fn job_window(&self, _handles: &[JobHandle]) -> Result<JobWindow, ExecError> {
        Ok(self.window.unwrap_or_else(|| JobWindow {
            start: Utc::now() - ChronoDuration::hours(1),
            end: Utc::now() + ChronoDuration::hours(2),
        }))
    }

    async fn wait_start(&self, _handles: &[JobHandle]) -> Result<(), ExecError> {
        Ok(())
    }

    async fn resolve(&self, _handles: &[JobHandle]) -> Result<ResolvedResources, ExecError> {
        Ok(ResolvedResources {
            hosts: self.hosts.clone(),
            vlan: self.vlan,
            network: None,
        })
    }
}

#[async_trait]
impl Provisioner for FakeLab {
    async fn deploy(
        &self,
        host: &PhysicalHost,
        _image: &HostImage,
        options: &ProvisionOptions,
    ) -> Result<Reachability, ExecError> {
        self.deploy_calls
            .lock()
            .unwrap()
            .push((host.id.clone(), options.attempt));
        match self.unreachable.get(&host.id) {
            Some(failures) if options.attempt <= *failures => Ok(Reachability::Unreachable),
            _ => Ok(Reachability::Reachable),
        }
    }
}

#[async_trait]
impl Executor<PackageConfig> for FakeLab {
    async fn apply(&self, host: &PhysicalHost, config: &PackageConfig) -> Result<(), ExecError> {
        self.package_calls
            .lock()
            .unwrap()
            .push((host.id.clone(), config.clone()));
        if self.broken_packages.contains(&host.id) {
            return Err(ExecError::Failed("dpkg lock held".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor<HypervisorConfig> for FakeLab {
    async fn apply(&self, host: &PhysicalHost, _config: &HypervisorConfig) -> Result<(), ExecError> {
        if self.broken_hypervisors.contains(&host.id) {
            return Err(ExecError::Failed("libvirtd did not start".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor<ServiceNodeConfig> for FakeLab {
    async fn apply(&self, host: &PhysicalHost, config: &ServiceNodeConfig) -> Result<(), ExecError> {
        if self.broken_service_node {
            return Err(ExecError::Unreachable(host.id.clone()));
        }
        self.service_configs
            .lock()
            .unwrap()
            .push((host.id.clone(), config.clone()));
        Ok(())
    }
}

#[async_trait]
impl VmRuntime for FakeLab {
    async fn destroy_all(&self, host: &PhysicalHost) -> Result<u32, ExecError> {
        let removed = self.running.lock().unwrap().remove(&host.id);
        Ok(removed.map_or(0, |vms| vms.len() as u32))
    }

    async fn prepare_disk(&self, host: &PhysicalHost, backing: &str) -> Result<(), ExecError> {
        if self.broken_disks.contains(&host.id) {
            return Err(ExecError::Failed("no space left on device".into()));
        }
        self.prepared
            .lock()
            .unwrap()
            .push((host.id.clone(), backing.to_string()));
        Ok(())
    }

    async fn instantiate(
        &self,
        host: &PhysicalHost,
        vm: &VmDescriptor,
        _disk: DiskLocation,
    ) -> Result<VmHandle, ExecError> {
        if self.broken_vms.contains(&vm.id) {
            return Err(ExecError::Failed(format!("{} did not boot", vm.id)));
        }
        self.running
            .lock()
            .unwrap()
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
            .running
            .lock()
            .unwrap()
            .get(&host.id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ReservationTransport for FakeLab {
    async fn submit(&self, _spec: &JobSpec) -> Result<JobHandle, TransportError> {
        Err(TransportError::Rejected("not used".into()))
    }

    async fn submit_batch(&self, _specs: &[JobSpec]) -> Result<JobHandle, TransportError> {
        Err(TransportError::Rejected("not used".into()))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), TransportError> {
        self.cancelled.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

fn options(dir: &tempfile::TempDir) -> DeployOptions {
    DeployOptions::from_config(&FleetConfig::default(), dir.path()).unwrap()
}

fn topology(n: usize) -> Topology {
    let template = VmTemplate {
        backing: Some("/images/base.qcow2".into()),
        ..VmTemplate::default()
    };
    Topology {
        vms: (1..=n)
            .map(|i| VmDescriptor::new(format!("vm-{i}"), template.clone()))
            .collect(),
        requirement: PoolRequirement::new(),
    }
}

fn handles() -> Vec<JobHandle> {
    vec![JobHandle::on_site(4242, "lyon")]
}

#[tokio::test]
async fn healthy_run_places_every_vm() {
    let dir = tempfile::tempdir().unwrap();
    let lab = Arc::new(FakeLab::with_hosts(&["taurus-3", "taurus-1", "taurus-2"]));
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));
    let mut ctx = RunContext::new();

    let report = orchestrator
        .run(&handles(), &topology(6), &mut ctx)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.vms.len(), 6);
    assert_eq!(report.service_node, "taurus-1");
    assert!(report.vms.iter().all(|vm| vm.ip.is_some() && vm.mac.is_some()));
    assert_eq!(
        report.phases.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
        Phase::ALL.to_vec()
    );

    let per_host: BTreeMap<String, usize> =
        report.vms.iter().fold(BTreeMap::new(), |mut acc, vm| {
            *acc.entry(vm.host.clone().unwrap()).or_default() += 1;
            acc
        });
    assert!(per_host.values().all(|n| *n == 2));
    assert_eq!(report.bindings.len(), 6);
    for vm in &report.vms {
        assert_eq!(report.bindings.get(&vm.id), vm.host.as_ref());
    }

    let hosts = fs::read_to_string(&report.hosts_file).unwrap();
    assert_eq!(hosts, "taurus-1\ntaurus-2\ntaurus-3\n");
    let vms = fs::read_to_string(&report.vms_file).unwrap();
    assert_eq!(vms.lines().count(), 6);

    let configs = lab.service_configs.lock().unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].0, "taurus-1");
    assert_eq!(configs[0].1.dhcp_hosts.len(), 6);
    assert!(ctx.stage(Phase::VmInstantiation.name()).is_some());
}

#[tokio::test]
async fn unreachable_hosts_are_retried_then_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1", "taurus-2", "taurus-3"]);
    lab.unreachable.insert("taurus-2".into(), 1);
    lab.unreachable.insert("taurus-3".into(), u32::MAX);
    let lab = Arc::new(lab);
    let mut opts = options(&dir);
    opts.max_retries = 3;
    let orchestrator = Orchestrator::new(lab.collaborators(), opts);
    let mut ctx = RunContext::new();

    let report = orchestrator
        .run(&handles(), &topology(4), &mut ctx)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartiallyCompleted);
    assert_eq!(
        report.hosts.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(),
        vec!["taurus-1", "taurus-2"]
    );
    assert!(ctx.is_host_excluded("taurus-3"));
    assert!(report.vms.iter().all(|vm| vm.host.as_deref() != Some("taurus-3")));

    let calls = lab.deploy_calls.lock().unwrap();
    let attempts = |id: &str| calls.iter().filter(|(h, _)| h == id).count();
    assert_eq!(attempts("taurus-1"), 1);
    assert_eq!(attempts("taurus-2"), 2);
    assert_eq!(attempts("taurus-3"), 3);
}

#[tokio::test]
async fn no_deployed_host_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1"]);
    lab.unreachable.insert("taurus-1".into(), u32::MAX);
    let lab = Arc::new(lab);
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));

    let err = orchestrator
        .run(&handles(), &topology(1), &mut RunContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NoSurvivingHosts(_)));
}

#[tokio::test]
async fn missing_vlan_cancels_the_reservation() {
    let dir = tempfile::tempdir().unwrap();
    let lab = Arc::new(FakeLab::with_hosts(&["taurus-1"]));
    let mut opts = options(&dir);
    opts.dedicated_vlan = true;
    let orchestrator = Orchestrator::new(lab.collaborators(), opts);

    let err = orchestrator
        .run(&handles(), &topology(1), &mut RunContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::VlanMissing(_)));
    assert_eq!(*lab.cancelled.lock().unwrap(), handles());
    assert!(lab.deploy_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn finished_job_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1"]);
    lab.window = Some(JobWindow {
        start: Utc::now() - ChronoDuration::hours(4),
        end: Utc::now() - ChronoDuration::hours(1),
    });
    let lab = Arc::new(lab);
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));

    let err = orchestrator
        .run(&handles(), &topology(1), &mut RunContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ResourceResolutionFailed(_)));
}

#[tokio::test]
async fn zero_retries_skips_provisioning_and_packages() {
    let dir = tempfile::tempdir().unwrap();
    let lab = Arc::new(FakeLab::with_hosts(&["taurus-1", "taurus-2"]));
    let mut opts = options(&dir);
    opts.max_retries = 0;
    let orchestrator = Orchestrator::new(lab.collaborators(), opts);

    let report = orchestrator
        .run(&handles(), &topology(2), &mut RunContext::new())
        .await
        .unwrap();

    assert!(lab.deploy_calls.lock().unwrap().is_empty());
    assert!(lab.package_calls.lock().unwrap().is_empty());
    assert!(report.phases.contains(&(Phase::HostProvisioning, PhaseOutcome::Skipped)));
    assert!(report.phases.contains(&(Phase::PackageManagement, PhaseOutcome::Skipped)));
    assert_eq!(report.vms.len(), 2);
}

#[tokio::test]
async fn cache_is_staged_on_the_service_node_first() {
    let dir = tempfile::tempdir().unwrap();
    let lab = Arc::new(FakeLab::with_hosts(&["taurus-1", "taurus-2"]));
    let mut opts = options(&dir);
    opts.packages = PackageMode::Full { cache: true };
    let orchestrator = Orchestrator::new(lab.collaborators(), opts.clone());

    orchestrator
        .run(&handles(), &topology(2), &mut RunContext::new())
        .await
        .unwrap();

    let calls = lab.package_calls.lock().unwrap();
    assert_eq!(calls[0].0, "taurus-1");
    assert_eq!(calls[0].1.packages, vec![opts.cache_package.clone()]);
    assert!(
        calls[1..]
            .iter()
            .all(|(_, c)| c.cache_host.as_deref() == Some("taurus-1") && c.upgrade)
    );
}

#[tokio::test]
async fn failed_package_install_excludes_the_host() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1", "taurus-2"]);
    lab.broken_packages.insert("taurus-2".into());
    let lab = Arc::new(lab);
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));
    let mut ctx = RunContext::new();

    let report = orchestrator
        .run(&handles(), &topology(2), &mut ctx)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartiallyCompleted);
    assert!(ctx.is_host_excluded("taurus-2"));
    assert!(report.vms.iter().all(|vm| vm.host.as_deref() == Some("taurus-1")));
}

#[tokio::test]
async fn no_hypervisor_left_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1", "taurus-2"]);
    lab.broken_hypervisors = ["taurus-1", "taurus-2"].map(String::from).into();
    let lab = Arc::new(lab);
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));

    let err = orchestrator
        .run(&handles(), &topology(2), &mut RunContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NoSurvivingHosts(_)));
}

#[tokio::test]
async fn service_node_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1", "taurus-2"]);
    lab.broken_service_node = true;
    let lab = Arc::new(lab);
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));

    let err = orchestrator
        .run(&handles(), &topology(2), &mut RunContext::new())
        .await
        .unwrap_err();
    match err {
        DeployError::ServiceNode { host, .. } => assert_eq!(host, "taurus-1"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn failed_vm_degrades_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1", "taurus-2"]);
    lab.broken_vms.insert("vm-2".into());
    let lab = Arc::new(lab);
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));
    let mut ctx = RunContext::new();

    let report = orchestrator
        .run(&handles(), &topology(3), &mut ctx)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartiallyCompleted);
    assert_eq!(report.vms.len(), 2);
    assert!(ctx.failed_vms().contains_key("vm-2"));
    assert!(!report.bindings.contains_key("vm-2"));
    let vms = fs::read_to_string(&report.vms_file).unwrap();
    assert!(!vms.contains("vm-2"));
}

#[tokio::test]
async fn every_vm_failing_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1"]);
    lab.broken_vms.insert("vm-1".into());
    let lab = Arc::new(lab);
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));

    let err = orchestrator
        .run(&handles(), &topology(1), &mut RunContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NoVmPlaced));
}

#[tokio::test]
async fn shared_disk_is_prepared_once_on_the_service_node() {
    let dir = tempfile::tempdir().unwrap();
    let lab = Arc::new(FakeLab::with_hosts(&["taurus-1", "taurus-2", "taurus-3"]));
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));

    orchestrator
        .run(&handles(), &topology(6), &mut RunContext::new())
        .await
        .unwrap();

    assert_eq!(
        *lab.prepared.lock().unwrap(),
        vec![("taurus-1".to_string(), "/images/base.qcow2".to_string())]
    );
}

#[tokio::test]
async fn local_disks_follow_the_vms() {
    let dir = tempfile::tempdir().unwrap();
    let mut lab = FakeLab::with_hosts(&["taurus-1", "taurus-2", "taurus-3"]);
    lab.broken_disks.insert("taurus-3".into());
    let lab = Arc::new(lab);
    let mut opts = options(&dir);
    opts.disk_location = DiskLocation::All;
    let orchestrator = Orchestrator::new(lab.collaborators(), opts);
    let mut ctx = RunContext::new();

    let report = orchestrator
        .run(&handles(), &topology(3), &mut ctx)
        .await
        .unwrap();

    let prepared: BTreeSet<String> = lab
        .prepared
        .lock()
        .unwrap()
        .iter()
        .map(|(h, _)| h.clone())
        .collect();
    assert_eq!(prepared, ["taurus-1", "taurus-2"].map(String::from).into());
    assert_eq!(report.vms.len(), 2);
    assert_eq!(ctx.failed_vms().len(), 1);
}

#[tokio::test]
async fn one_vm_per_host_when_none_requested() {
    let dir = tempfile::tempdir().unwrap();
    let lab = Arc::new(FakeLab::with_hosts(&["taurus-1", "taurus-2"]));
    let orchestrator = Orchestrator::new(lab.collaborators(), options(&dir));

    let report = orchestrator
        .run(&handles(), &topology(0), &mut RunContext::new())
        .await
        .unwrap();

    let ids: Vec<&str> = report.vms.iter().map(|vm| vm.id.as_str()).collect();
    assert_eq!(ids, vec!["vm-1", "vm-2"]);
}

#[tokio::test]
async fn snapshots_capture_before_and_after() {
    let dir = tempfile::tempdir().unwrap();
    let lab = Arc::new(FakeLab::with_hosts(&["taurus-1"]));
    lab.running
        .lock()
        .unwrap()
        .insert("taurus-1".into(), vec!["stale".into()]);
    let mut opts = options(&dir);
    opts.snapshots = true;
    let orchestrator = Orchestrator::new(lab.collaborators(), opts);

    orchestrator
        .run(&handles(), &topology(2), &mut RunContext::new())
        .await
        .unwrap();

    let before = TopologySnapshot::read(&dir.path().join(SNAPSHOT_BEFORE)).unwrap();
    let after = TopologySnapshot::read(&dir.path().join(SNAPSHOT_AFTER)).unwrap();
    assert_eq!(before.hosts["taurus-1"], vec!["stale".to_string()]);
    let mut started = after.hosts["taurus-1"].clone();
    started.sort();
    assert_eq!(started, vec!["vm-1".to_string(), "vm-2".to_string()]);
}
