//! fleet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::types::{VmTemplate, Walltime};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub defaults: DefaultsConfig,
    pub provisioning: ProvisioningConfig,
    pub packages: PackagesConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub vm_template: String,
    pub backing_image: String,
    pub host_image: String,
    pub walltime: String,
    pub resources: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            vm_template: "mem=1024,cpu=1,hdd=2,cpuset=auto".to_string(),
            backing_image: "/var/lib/vmfleet/images/debian-base.qcow2".to_string(),
            host_image: "debian-base".to_string(),
            walltime: "3:00:00".to_string(),
            resources: "all".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Deployment attempts per host. 0 treats hosts as already deployed.
    pub max_retries: u32,
    /// Skip hosts that already run the requested image.
    pub check_deployed: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            check_deployed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    pub full: Vec<String>,
    pub minimal: Vec<String>,
    pub cache_package: String,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            full: [
                "qemu-kvm",
                "libvirt-daemon-system",
                "libvirt-clients",
                "virtinst",
                "dnsmasq",
                "taktuk",
                "rsync",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            minimal: ["taktuk", "rsync"].into_iter().map(String::from).collect(),
            cache_package: "apt-cacher-ng".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrent per-host operations.
    pub parallelism: usize,
    pub phase_timeout_secs: u64,
    /// vCPUs allowed per physical CPU when sizing a slot.
    pub cpu_overcommit: u32,
    /// Address capacity of a global virtual network.
    pub max_vms: u32,
    pub planning_horizon_days: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: 16,
            phase_timeout_secs: 3600,
            cpu_overcommit: 2,
            max_vms: 10_000,
            planning_horizon_days: 5,
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CoreResult<Self> {
        let config: FleetConfig =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.orchestrator.parallelism == 0 {
            return Err(CoreError::Config("orchestrator.parallelism must be positive".into()));
        }
        if self.orchestrator.cpu_overcommit == 0 {
            return Err(CoreError::Config("orchestrator.cpu_overcommit must be positive".into()));
        }
        if self.orchestrator.max_vms == 0 {
            return Err(CoreError::Config("orchestrator.max_vms must be positive".into()));
        }
        self.vm_template()?.validate()?;
        self.walltime()?;
        Ok(())
    }

    /// Default VM template, with the default backing image applied.
    pub fn vm_template(&self) -> CoreResult<VmTemplate> {
        let mut template: VmTemplate = self.defaults.vm_template.parse()?;
        if template.backing.is_none() {
            template.backing = Some(self.defaults.backing_image.clone());
        }
        Ok(template)
    }

    pub fn walltime(&self) -> CoreResult<Walltime> {
        self.defaults.walltime.parse()
    }
}
