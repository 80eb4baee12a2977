//! Deployment phases and the state they advance.
//!
//! Phases run in a fixed order. Each one either runs or is skipped, and
//! the cursor never moves backwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use vmfleet_core::{FleetConfig, PhysicalHost, VmTemplate};

use crate::distribution::DistributionPolicy;
use crate::error::{DeployError, DeployResult};

/// One step of the deployment pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Phase {
    ResourceResolution,
    HostProvisioning,
    PackageManagement,
    HypervisorConfiguration,
    ServiceNodeConfiguration,
    VmInstantiation,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::ResourceResolution,
        Phase::HostProvisioning,
        Phase::PackageManagement,
        Phase::HypervisorConfiguration,
        Phase::ServiceNodeConfiguration,
        Phase::VmInstantiation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::ResourceResolution => "resource resolution",
            Phase::HostProvisioning => "host provisioning",
            Phase::PackageManagement => "package management",
            Phase::HypervisorConfiguration => "hypervisor configuration",
            Phase::ServiceNodeConfiguration => "service node configuration",
            Phase::VmInstantiation => "VM instantiation",
        }
    }

    pub fn next(&self) -> Option<Phase> {
        let idx = Phase::ALL.iter().position(|p| p == self)?;
        Phase::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PhaseOutcome {
    Done,
    Skipped,
}

/// Phase cursor, surviving hosts and VM bindings of one run.
///
/// Only the orchestrator's control flow mutates it, after workers of a
/// phase have all reported back.
#[derive(Debug, Clone, Default)]
pub struct DeploymentState {
    current: Option<Phase>,
    completed: Vec<(Phase, PhaseOutcome)>,
    hosts: Vec<PhysicalHost>,
    /// VM id → host id.
    bindings: BTreeMap<String, String>,
}

impl DeploymentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    pub fn completed(&self) -> &[(Phase, PhaseOutcome)] {
        &self.completed
    }

    pub fn is_done(&self, phase: Phase) -> bool {
        self.completed
            .iter()
            .any(|(p, outcome)| *p == phase && *outcome == PhaseOutcome::Done)
    }

    /// Enter `phase`. Fails if it is not the next one.
    pub fn enter(&mut self, phase: Phase) -> DeployResult<()> {
        let expected = match self.completed.last() {
            None => Some(Phase::ResourceResolution),
            Some((last, _)) => last.next(),
        };
        if expected != Some(phase) {
            return Err(DeployError::Config(format!(
                "phase {phase} entered out of order (expected {})",
                expected.map(|p| p.name()).unwrap_or("none")
            )));
        }
        debug!(%phase, "entering phase");
        self.current = Some(phase);
        Ok(())
    }

    /// Close the current phase.
    pub fn finish(&mut self, outcome: PhaseOutcome) {
        if let Some(phase) = self.current.take() {
            info!(%phase, ?outcome, "phase finished");
            self.completed.push((phase, outcome));
        }
    }

    pub fn hosts(&self) -> &[PhysicalHost] {
        &self.hosts
    }

    pub fn set_hosts(&mut self, mut hosts: Vec<PhysicalHost>) {
        hosts.sort();
        hosts.dedup();
        self.hosts = hosts;
    }

    /// Keep only hosts whose id satisfies `keep`. Returns the dropped ids.
    pub fn retain_hosts(&mut self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        self.hosts.retain(|h| {
            let kept = keep(&h.id);
            if !kept {
                dropped.push(h.id.clone());
            }
            kept
        });
        dropped
    }

    pub fn bind(&mut self, vm: impl Into<String>, host: impl Into<String>) {
        self.bindings.insert(vm.into(), host.into());
    }

    pub fn bindings(&self) -> &BTreeMap<String, String> {
        &self.bindings
    }
}

// ── Phase settings ────────────────────────────────────────────────

/// What the package phase installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PackageMode {
    /// Upgrade hosts and install the full package list, optionally
    /// through a package cache staged on the service node.
    Full { cache: bool },
    /// Only what disk copies between hosts need.
    Minimal,
    Skip,
}

impl FromStr for PackageMode {
    type Err = DeployError;

    fn from_str(s: &str) -> DeployResult<Self> {
        match s {
            "full" => Ok(PackageMode::Full { cache: false }),
            "minimal" => Ok(PackageMode::Minimal),
            "skip" | "none" => Ok(PackageMode::Skip),
            other => Err(DeployError::Config(format!(
                "unknown package mode '{other}' (expected full, minimal or skip)"
            ))),
        }
    }
}

/// Where backing disk images are prepared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DiskLocation {
    /// Once, on the service node, before any VM is created.
    #[default]
    One,
    /// On every host that receives VMs.
    All,
}

impl FromStr for DiskLocation {
    type Err = DeployError;

    fn from_str(s: &str) -> DeployResult<Self> {
        match s {
            "one" => Ok(DiskLocation::One),
            "all" => Ok(DiskLocation::All),
            other => Err(DeployError::Config(format!(
                "unknown disk location '{other}' (expected one or all)"
            ))),
        }
    }
}

/// The operating system image hosts are deployed with.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HostImage {
    Named(String),
    File(PathBuf),
}

impl HostImage {
    /// At most one of a name or a file may be given.
    pub fn select(name: Option<String>, file: Option<PathBuf>, default: &str) -> DeployResult<Self> {
        match (name, file) {
            (Some(_), Some(_)) => Err(DeployError::Config(
                "a host image name and an image file are mutually exclusive".into(),
            )),
            (None, Some(file)) => Ok(HostImage::File(file)),
            (Some(name), None) => Ok(HostImage::Named(name)),
            (None, None) => Ok(HostImage::Named(default.to_string())),
        }
    }
}

impl fmt::Display for HostImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostImage::Named(name) => f.write_str(name),
            HostImage::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Everything the orchestrator needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub host_image: HostImage,
    /// Deployment rounds per host; 0 skips provisioning altogether.
    pub max_retries: u32,
    /// Redeploy hosts even if they already run the image.
    pub force_deploy: bool,
    pub packages: PackageMode,
    pub full_packages: Vec<String>,
    pub minimal_packages: Vec<String>,
    pub cache_package: String,
    pub distribution: DistributionPolicy,
    pub disk_location: DiskLocation,
    pub dedicated_vlan: bool,
    pub snapshots: bool,
    pub outdir: PathBuf,
    pub parallelism: usize,
    pub phase_timeout: Duration,
    /// Template for VMs synthesized when the request names none.
    pub vm_template: VmTemplate,
}

impl DeployOptions {
    /// Options seeded from the fleet configuration.
    pub fn from_config(config: &FleetConfig, outdir: impl Into<PathBuf>) -> DeployResult<Self> {
        let vm_template = config
            .vm_template()
            .map_err(|e| DeployError::Config(e.to_string()))?;
        Ok(Self {
            host_image: HostImage::Named(config.defaults.host_image.clone()),
            max_retries: config.provisioning.max_retries,
            force_deploy: !config.provisioning.check_deployed,
            packages: PackageMode::Full { cache: false },
            full_packages: config.packages.full.clone(),
            minimal_packages: config.packages.minimal.clone(),
            cache_package: config.packages.cache_package.clone(),
            distribution: DistributionPolicy::default(),
            disk_location: DiskLocation::default(),
            dedicated_vlan: false,
            snapshots: false,
            outdir: outdir.into(),
            parallelism: config.orchestrator.parallelism,
            phase_timeout: Duration::from_secs(config.orchestrator.phase_timeout_secs),
            vm_template,
        })
    }

    /// Package mode after accounting for the host image and provisioning.
    ///
    /// Image files must already carry the hypervisor stack, and hosts
    /// that were not provisioned are left as they are.
    pub fn effective_packages(&self) -> PackageMode {
        if self.max_retries == 0 || matches!(self.host_image, HostImage::File(_)) {
            PackageMode::Skip
        } else {
            self.packages
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: &str) -> PhysicalHost {
        PhysicalHost {
            id: id.into(),
            pool: "taurus".into(),
            site: "lyon".into(),
            memory_mb: 32768,
            cpus: 16,
        }
    }

    #[test]
    fn phases_run_in_order() {
        let mut state = DeploymentState::new();
        assert!(state.enter(Phase::HostProvisioning).is_err());

        for phase in Phase::ALL {
            state.enter(phase).unwrap();
            assert_eq!(state.current(), Some(phase));
            state.finish(PhaseOutcome::Done);
        }
        assert_eq!(state.completed().len(), 6);
        assert!(state.is_done(Phase::VmInstantiation));
        assert_eq!(Phase::VmInstantiation.next(), None);
    }

    #[test]
    fn skipped_phase_still_advances_the_cursor() {
        let mut state = DeploymentState::new();
        state.enter(Phase::ResourceResolution).unwrap();
        state.finish(PhaseOutcome::Done);
        state.enter(Phase::HostProvisioning).unwrap();
        state.finish(PhaseOutcome::Skipped);

        assert!(!state.is_done(Phase::HostProvisioning));
        state.enter(Phase::PackageManagement).unwrap();
        assert!(state.enter(Phase::ResourceResolution).is_err());
    }

    #[test]
    fn retain_reports_dropped_hosts() {
        let mut state = DeploymentState::new();
        state.set_hosts(vec![host("b-2"), host("a-1"), host("b-2")]);
        assert_eq!(state.hosts().len(), 2);
        assert_eq!(state.hosts()[0].id, "a-1");

        let dropped = state.retain_hosts(|id| id != "a-1");
        assert_eq!(dropped, vec!["a-1".to_string()]);
        assert_eq!(state.hosts().len(), 1);
    }

    #[test]
    fn host_image_name_and_file_are_exclusive() {
        assert!(HostImage::select(Some("jessie".into()), Some("img.tgz".into()), "base").is_err());
        assert_eq!(
            HostImage::select(None, None, "base").unwrap(),
            HostImage::Named("base".into())
        );
        assert!(matches!(
            HostImage::select(None, Some("img.tgz".into()), "base").unwrap(),
            HostImage::File(_)
        ));
    }

    #[test]
    fn image_file_and_no_provisioning_skip_packages() {
        let mut opts = DeployOptions::from_config(&FleetConfig::default(), "/tmp/out").unwrap();
        assert_eq!(opts.effective_packages(), PackageMode::Full { cache: false });

        opts.host_image = HostImage::File("img.tgz".into());
        assert_eq!(opts.effective_packages(), PackageMode::Skip);

        opts.host_image = HostImage::Named("base".into());
        opts.max_retries = 0;
        assert_eq!(opts.effective_packages(), PackageMode::Skip);
    }

    #[test]
    fn modes_parse() {
        assert_eq!("minimal".parse::<PackageMode>().unwrap(), PackageMode::Minimal);
        assert_eq!("all".parse::<DiskLocation>().unwrap(), DiskLocation::All);
        assert!("sometimes".parse::<DiskLocation>().is_err());
    }
}
