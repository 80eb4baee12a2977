//! Files written to the run's output directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use vmfleet_core::{PhysicalHost, VmDescriptor};

use crate::error::DeployResult;

pub const HOSTS_FILE: &str = "hosts.list";
pub const VMS_FILE: &str = "vms.list";
pub const SNAPSHOT_BEFORE: &str = "topology-before.json";
pub const SNAPSHOT_AFTER: &str = "topology-after.json";

pub fn create_outdir(dir: &Path) -> DeployResult<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

/// One host identifier per line.
pub fn write_host_list(dir: &Path, hosts: &[PhysicalHost]) -> DeployResult<PathBuf> {
    let path = dir.join(HOSTS_FILE);
    let mut content: String = hosts.iter().map(|h| format!("{}\n", h.id)).collect();
    if content.is_empty() {
        content.push('\n');
    }
    fs::write(&path, content)?;
    info!(path = %path.display(), hosts = hosts.len(), "host list written");
    Ok(path)
}

/// `ADDRESS ID` per line; VMs without an address are written as `- ID`.
pub fn write_vm_list(dir: &Path, vms: &[VmDescriptor]) -> DeployResult<PathBuf> {
    let path = dir.join(VMS_FILE);
    let content: String = vms
        .iter()
        .map(|vm| match vm.ip {
            Some(ip) => format!("{ip} {}\n", vm.id),
            None => format!("- {}\n", vm.id),
        })
        .collect();
    fs::write(&path, content)?;
    info!(path = %path.display(), vms = vms.len(), "VM list written");
    Ok(path)
}

/// VMs defined on each host at some point of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub taken_at: DateTime<Utc>,
    pub hosts: BTreeMap<String, Vec<String>>,
}

impl TopologySnapshot {
    pub fn vm_count(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }

    pub fn write(&self, dir: &Path, name: &str) -> DeployResult<PathBuf> {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), vms = self.vm_count(), "topology snapshot written");
        Ok(path)
    }

    pub fn read(path: &Path) -> DeployResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
