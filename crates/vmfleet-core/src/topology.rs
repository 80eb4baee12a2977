//! Topology builder — turns user intent into VM descriptors and a pool requirement.
//!
//! Two inputs are accepted:
//! - a VM count, a template and a list of pool tokens (`pool` or `pool:count`)
//! - a placement document listing pools, hosts and the VMs on each host

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::{PoolRequirement, VmDescriptor, VmTemplate};

/// Placement document (TOML).
///
/// ```toml
/// [[pool]]
/// id = "taurus"
///
/// [[pool.host]]
/// id = "taurus-1"
///
/// [[pool.host.vm]]
/// id = "web-1"
/// mem = 2048
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementDocument {
    #[serde(default, rename = "pool")]
    pub pools: Vec<PlacementPool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementPool {
    pub id: String,
    #[serde(default, rename = "host")]
    pub hosts: Vec<PlacementHost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementHost {
    pub id: String,
    #[serde(default, rename = "vm")]
    pub vms: Vec<PlacementVm>,
}

/// A VM entry; absent fields are inherited from the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementVm {
    pub id: String,
    pub mem: Option<u64>,
    pub cpu: Option<u32>,
    pub hdd: Option<u32>,
    pub cpuset: Option<String>,
    pub backing: Option<String>,
}

impl PlacementDocument {
    pub fn parse(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::Parse(format!("placement document: {e}")))
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Number of VMs declared across all hosts.
    pub fn vm_count(&self) -> usize {
        self.pools
            .iter()
            .flat_map(|p| &p.hosts)
            .map(|h| h.vms.len())
            .sum()
    }
}

/// Output of the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub vms: Vec<VmDescriptor>,
    pub requirement: PoolRequirement,
}

impl Topology {
    /// Total memory of the VM set in MiB.
    pub fn total_memory(&self) -> u64 {
        self.vms.iter().map(|vm| vm.template.mem).sum()
    }

    pub fn total_cpu(&self) -> u64 {
        self.vms.iter().map(|vm| u64::from(vm.template.cpu)).sum()
    }

    pub fn vm_count(&self) -> u32 {
        self.vms.len() as u32
    }
}

/// Builds a [`Topology`] from a count or a placement document.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    default_backing: String,
    max_vms: u32,
}

impl TopologyBuilder {
    pub fn new(default_backing: impl Into<String>) -> Self {
        Self {
            default_backing: default_backing.into(),
            max_vms: u32::MAX,
        }
    }

    /// Cap the number of VMs a count request may ask for.
    pub fn with_max_vms(mut self, max_vms: u32) -> Self {
        self.max_vms = max_vms;
        self
    }

    /// Count mode: `vm-1..vm-N` sharing one template.
    pub fn from_count(
        &self,
        n_vm: u32,
        template: &VmTemplate,
        pools: &str,
    ) -> CoreResult<Topology> {
        if n_vm == 0 {
            return Err(CoreError::Config("number of VMs must be positive".into()));
        }
        let n_vm = if n_vm > self.max_vms {
            warn!(
                requested = n_vm,
                max = self.max_vms,
                "reducing the number of VMs to the address capacity of the network"
            );
            self.max_vms
        } else {
            n_vm
        };

        let template = self.resolve_template(template.clone())?;
        let requirement = PoolRequirement::parse_tokens(pools)?;
        if requirement.is_empty() {
            return Err(CoreError::Config("no pool given".into()));
        }

        let vms = (1..=n_vm)
            .map(|i| VmDescriptor::new(format!("vm-{i}"), template.clone()))
            .collect();

        info!(vms = n_vm, pools = %requirement, "topology built from VM count");
        Ok(Topology { vms, requirement })
    }

    /// Placement mode: one descriptor per declared VM, hosts tallied per pool.
    pub fn from_placement(
        &self,
        document: &PlacementDocument,
        template: &VmTemplate,
    ) -> CoreResult<Topology> {
        if document.pools.is_empty() {
            return Err(CoreError::Parse("placement document declares no pool".into()));
        }

        let mut requirement = PoolRequirement::new();
        let mut vms = Vec::with_capacity(document.vm_count());
        let mut vm_ids = BTreeSet::new();
        let mut host_ids = BTreeSet::new();

        for pool in &document.pools {
            if pool.hosts.is_empty() {
                return Err(CoreError::Parse(format!("pool '{}' declares no host", pool.id)));
            }
            requirement.add(pool.id.clone(), pool.hosts.len() as u32);

            for host in &pool.hosts {
                if !host_ids.insert(host.id.as_str()) {
                    return Err(CoreError::Parse(format!("host '{}' declared twice", host.id)));
                }
                for entry in &host.vms {
                    if !vm_ids.insert(entry.id.as_str()) {
                        return Err(CoreError::Parse(format!("VM '{}' declared twice", entry.id)));
                    }
                    let vm_template = self.resolve_template(inherit(entry, template))?;
                    let mut vm = VmDescriptor::new(entry.id.clone(), vm_template);
                    vm.pool_hint = Some(pool.id.clone());
                    vm.host_hint = Some(host.id.clone());
                    vms.push(vm);
                }
            }
        }

        if vms.is_empty() {
            return Err(CoreError::Parse("placement document declares no VM".into()));
        }

        info!(vms = vms.len(), pools = %requirement, "topology built from placement document");
        Ok(Topology { vms, requirement })
    }

    fn resolve_template(&self, mut template: VmTemplate) -> CoreResult<VmTemplate> {
        if template.backing.is_none() {
            template.backing = Some(self.default_backing.clone());
        }
        template.validate()?;
        Ok(template)
    }
}

fn inherit(entry: &PlacementVm, template: &VmTemplate) -> VmTemplate {
    VmTemplate {
        mem: entry.mem.unwrap_or(template.mem),
        cpu: entry.cpu.unwrap_or(template.cpu),
        hdd: entry.hdd.unwrap_or(template.hdd),
        cpuset: entry.cpuset.clone().unwrap_or_else(|| template.cpuset.clone()),
        backing: entry.backing.clone().or_else(|| template.backing.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
[[pool]]
id = "taurus"

[[pool.host]]
id = "taurus-1"

[[pool.host.vm]]
id = "web-1"
mem = 2048

[[pool.host.vm]]
id = "web-2"

[[pool.host]]
id = "taurus-2"

[[pool]]
id = "graphene"

[[pool.host]]
id = "graphene-4"

[[pool.host.vm]]
id = "db-1"
cpu = 4
backing = "/images/db.qcow2"
"#;

    fn builder() -> TopologyBuilder {
        TopologyBuilder::new("/images/base.qcow2")
    }

    #[test]
    fn count_mode_names_vms_deterministically() {
        let topo = builder()
            .from_count(3, &VmTemplate::default(), "all")
            .unwrap();
        let ids: Vec<&str> = topo.vms.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["vm-1", "vm-2", "vm-3"]);
        assert_eq!(topo.requirement.get("all"), Some(0));
        assert!(topo.vms.iter().all(|v| v.backing_image() == "/images/base.qcow2"));
        assert_eq!(topo.total_memory(), 3 * 1024);
    }

    #[test]
    fn count_mode_caps_to_max_vms() {
        let topo = builder()
            .with_max_vms(5)
            .from_count(9, &VmTemplate::default(), "lyon")
            .unwrap();
        assert_eq!(topo.vm_count(), 5);
    }

    #[test]
    fn count_mode_rejects_zero_and_bad_template() {
        assert!(matches!(
            builder().from_count(0, &VmTemplate::default(), "lyon"),
            Err(CoreError::Config(_))
        ));
        let bad = VmTemplate {
            cpu: 0,
            ..VmTemplate::default()
        };
        assert!(matches!(
            builder().from_count(2, &bad, "lyon"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn placement_mode_tallies_hosts_per_pool() {
        let doc = PlacementDocument::parse(DOC).unwrap();
        let topo = builder().from_placement(&doc, &VmTemplate::default()).unwrap();

        assert_eq!(topo.requirement.get("taurus"), Some(2));
        assert_eq!(topo.requirement.get("graphene"), Some(1));
        assert_eq!(topo.vm_count(), 3);

        let web1 = &topo.vms[0];
        assert_eq!(web1.template.mem, 2048);
        assert_eq!(web1.host_hint.as_deref(), Some("taurus-1"));
        let web2 = &topo.vms[1];
        assert_eq!(web2.template.mem, 1024);
        let db = &topo.vms[2];
        assert_eq!(db.template.cpu, 4);
        assert_eq!(db.backing_image(), "/images/db.qcow2");
        assert_eq!(db.pool_hint.as_deref(), Some("graphene"));
    }

    #[test]
    fn placement_mode_is_idempotent() {
        let doc = PlacementDocument::parse(DOC).unwrap();
        let a = builder().from_placement(&doc, &VmTemplate::default()).unwrap();
        let b = builder().from_placement(&doc, &VmTemplate::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        assert!(matches!(
            PlacementDocument::parse("[[pool]]\nname = 1\n"),
            Err(CoreError::Parse(_))
        ));

        let dup = r#"
[[pool]]
id = "a"
[[pool.host]]
id = "a-1"
[[pool.host.vm]]
id = "x"
[[pool.host.vm]]
id = "x"
"#;
        let doc = PlacementDocument::parse(dup).unwrap();
        assert!(matches!(
            builder().from_placement(&doc, &VmTemplate::default()),
            Err(CoreError::Parse(_))
        ));

        let empty_pool = PlacementDocument::parse("[[pool]]\nid = \"a\"\n").unwrap();
        assert!(matches!(
            builder().from_placement(&empty_pool, &VmTemplate::default()),
            Err(CoreError::Parse(_))
        ));
    }
}
