//! Shared types used across vmfleet crates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Identifier of a pool: a site, a cluster, or the virtual-network pseudo-pool.
pub type PoolId = String;

/// Name of the virtual-network pseudo-pool.
pub const VLAN_POOL: &str = "vlan";

/// Addresses covered by one subnet unit (a /22 block).
pub const ADDRESSES_PER_SUBNET_UNIT: u32 = 1024;

// ── VM template & descriptor ──────────────────────────────────────

/// Resources given to every VM built from this template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    /// Memory in MiB.
    pub mem: u64,
    /// Number of vCPUs.
    pub cpu: u32,
    /// Disk size in GiB.
    pub hdd: u32,
    /// CPU pinning policy ("auto" or an explicit cpuset).
    pub cpuset: String,
    /// Backing disk image. `None` until the topology builder applies the default.
    pub backing: Option<String>,
}

impl Default for VmTemplate {
    fn default() -> Self {
        Self {
            mem: 1024,
            cpu: 1,
            hdd: 2,
            cpuset: "auto".to_string(),
            backing: None,
        }
    }
}

impl VmTemplate {
    /// Parse a `mem=1024,cpu=1,hdd=2,cpuset=auto` string on top of `base`.
    ///
    /// Keys absent from `spec` keep the value from `base`.
    pub fn parse_with(spec: &str, base: &VmTemplate) -> CoreResult<Self> {
        let mut template = base.clone();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| CoreError::Parse(format!("template entry '{pair}' is not key=value")))?;
            let value = value.trim();
            match key.trim() {
                "mem" => template.mem = parse_number(key, value)?,
                "cpu" => template.cpu = parse_number(key, value)?,
                "hdd" => template.hdd = parse_number(key, value)?,
                "cpuset" => template.cpuset = value.to_string(),
                "backing" => template.backing = Some(value.to_string()),
                other => {
                    return Err(CoreError::Parse(format!("unknown template key '{other}'")));
                }
            }
        }
        Ok(template)
    }

    /// Check that every required field carries a usable value.
    pub fn validate(&self) -> CoreResult<()> {
        if self.mem == 0 {
            return Err(CoreError::Config("VM template memory must be positive".into()));
        }
        if self.cpu == 0 {
            return Err(CoreError::Config("VM template cpu count must be positive".into()));
        }
        if self.hdd == 0 {
            return Err(CoreError::Config("VM template disk size must be positive".into()));
        }
        if self.cpuset.trim().is_empty() {
            return Err(CoreError::Config("VM template cpuset is empty".into()));
        }
        match &self.backing {
            Some(b) if b.trim().is_empty() => {
                Err(CoreError::Config("VM template backing image is empty".into()))
            }
            _ => Ok(()),
        }
    }
}

impl FromStr for VmTemplate {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::parse_with(s, &VmTemplate::default())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> CoreResult<T> {
    value
        .parse()
        .map_err(|_| CoreError::Parse(format!("template key '{key}' expects a number, got '{value}'")))
}

/// One virtual machine of the requested fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub id: String,
    pub template: VmTemplate,
    /// Pool named by a placement document.
    pub pool_hint: Option<PoolId>,
    /// Host named by a placement document.
    pub host_hint: Option<String>,
    /// Host chosen during VM instantiation.
    pub host: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<String>,
}

impl VmDescriptor {
    pub fn new(id: impl Into<String>, template: VmTemplate) -> Self {
        Self {
            id: id.into(),
            template,
            pool_hint: None,
            host_hint: None,
            host: None,
            ip: None,
            mac: None,
        }
    }

    pub fn backing_image(&self) -> &str {
        self.template.backing.as_deref().unwrap_or_default()
    }
}

// ── Pool requirement & exclusions ─────────────────────────────────

/// Required unit count per pool. A count of 0 means "any amount".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRequirement {
    counts: BTreeMap<PoolId, u32>,
}

impl PoolRequirement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma separated list of `pool` or `pool:count` tokens.
    pub fn parse_tokens(tokens: &str) -> CoreResult<Self> {
        let mut req = Self::new();
        for token in tokens.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (pool, count) = match token.split_once(':') {
                Some((pool, count)) => {
                    let count = count.trim().parse::<u32>().map_err(|_| {
                        CoreError::Parse(format!("pool token '{token}' has a non-numeric count"))
                    })?;
                    (pool.trim(), count)
                }
                None => (token, 0),
            };
            if pool.is_empty() {
                return Err(CoreError::Parse(format!("pool token '{token}' has no pool name")));
            }
            req.insert(pool, count);
        }
        Ok(req)
    }

    pub fn insert(&mut self, pool: impl Into<PoolId>, count: u32) {
        self.counts.insert(pool.into(), count);
    }

    /// Add `count` units to a pool, creating it if needed.
    pub fn add(&mut self, pool: impl Into<PoolId>, count: u32) {
        *self.counts.entry(pool.into()).or_insert(0) += count;
    }

    pub fn remove(&mut self, pool: &str) -> Option<u32> {
        self.counts.remove(pool)
    }

    pub fn get(&self, pool: &str) -> Option<u32> {
        self.counts.get(pool).copied()
    }

    pub fn contains(&self, pool: &str) -> bool {
        self.counts.contains_key(pool)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PoolId, u32)> {
        self.counts.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Pools with an explicit count, the virtual-network pseudo-pool excluded.
    pub fn explicit(&self) -> impl Iterator<Item = (&PoolId, u32)> {
        self.iter().filter(|(pool, count)| *count > 0 && pool.as_str() != VLAN_POOL)
    }

    /// Whether any physical pool carries an explicit count.
    pub fn has_explicit_counts(&self) -> bool {
        self.explicit().next().is_some()
    }

    /// Whether one virtual-network unit is required.
    pub fn requires_vlan(&self) -> bool {
        self.get(VLAN_POOL).is_some_and(|n| n > 0)
    }
}

impl fmt::Display for PoolRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(pool, count)| {
                if count == 0 {
                    pool.clone()
                } else {
                    format!("{pool}:{count}")
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Pools removed from consideration: unsupported pools plus the user blacklist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionSet(BTreeSet<PoolId>);

impl ExclusionSet {
    /// Deduplicated union of both inputs.
    pub fn merge<I, J, S, T>(unsupported: I, blacklist: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<PoolId>,
        T: Into<PoolId>,
    {
        let mut set: BTreeSet<PoolId> = unsupported.into_iter().map(Into::into).collect();
        set.extend(blacklist.into_iter().map(Into::into));
        Self(set)
    }

    /// Parse a comma separated blacklist.
    pub fn parse_list(list: &str) -> Self {
        Self(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    pub fn contains(&self, pool: &str) -> bool {
        self.0.contains(pool)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Walltime & network mode ───────────────────────────────────────

/// Longest walltime accepted, about a century.
pub const MAX_WALLTIME_HOURS: u64 = 1_000_000;

/// Reservation duration, written `H:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime(Duration);

impl Walltime {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

impl FromStr for Walltime {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let invalid = || CoreError::Config(format!("walltime '{s}' is not H:MM:SS"));
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [h, m, sec] = parts.as_slice() else {
            return Err(invalid());
        };
        let hours: u64 = h.parse().map_err(|_| invalid())?;
        let minutes: u64 = m.parse().map_err(|_| invalid())?;
        let seconds: u64 = sec.parse().map_err(|_| invalid())?;
        if minutes >= 60 || seconds >= 60 {
            return Err(invalid());
        }
        if hours > MAX_WALLTIME_HOURS {
            return Err(CoreError::Config(format!(
                "walltime '{s}' exceeds {MAX_WALLTIME_HOURS} hours"
            )));
        }
        let total = hours * 3600 + minutes * 60 + seconds;
        if total == 0 {
            return Err(CoreError::Config("walltime must be longer than zero".into()));
        }
        Ok(Self::from_secs(total))
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.as_secs();
        write!(f, "{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

impl TryFrom<String> for Walltime {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        value.parse()
    }
}

impl From<Walltime> for String {
    fn from(value: Walltime) -> Self {
        value.to_string()
    }
}

/// How the VMs get their addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkMode {
    /// One dedicated virtual network is reserved alongside the hosts.
    DedicatedVlan,
    /// A routed subnet made of `units` /22 blocks.
    Subnet { units: u32 },
}

impl NetworkMode {
    pub fn for_vm_count(vm_count: u32, dedicated_vlan: bool) -> Self {
        if dedicated_vlan {
            NetworkMode::DedicatedVlan
        } else {
            NetworkMode::Subnet {
                units: subnet_units(vm_count),
            }
        }
    }

    pub fn subnet_units(&self) -> Option<u32> {
        match self {
            NetworkMode::DedicatedVlan => None,
            NetworkMode::Subnet { units } => Some(*units),
        }
    }
}

/// Number of /22 blocks needed to address `vm_count` VMs.
pub fn subnet_units(vm_count: u32) -> u32 {
    vm_count.div_ceil(ADDRESSES_PER_SUBNET_UNIT)
}

// ── Jobs & hosts ──────────────────────────────────────────────────

/// A granted reservation, written `ID` (grid job) or `SITE:ID` (site job).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: u64,
    pub site: Option<String>,
}

impl JobHandle {
    pub fn grid(id: u64) -> Self {
        Self { id, site: None }
    }

    pub fn on_site(id: u64, site: impl Into<String>) -> Self {
        Self {
            id,
            site: Some(site.into()),
        }
    }
}

impl FromStr for JobHandle {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let parse_id = |id: &str| {
            id.trim()
                .parse::<u64>()
                .map_err(|_| CoreError::Parse(format!("job handle '{s}' has a non-numeric id")))
        };
        match s.split_once(':') {
            Some((site, id)) if !site.trim().is_empty() => Ok(Self::on_site(parse_id(id)?, site.trim())),
            Some(_) => Err(CoreError::Parse(format!("job handle '{s}' has an empty site"))),
            None => Ok(Self::grid(parse_id(s)?)),
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.site {
            Some(site) => write!(f, "{site}:{}", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A physical machine bound to a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalHost {
    pub id: String,
    /// Cluster the host belongs to.
    pub pool: PoolId,
    pub site: String,
    /// Total memory in MiB.
    pub memory_mb: u64,
    pub cpus: u32,
}

impl PhysicalHost {
    /// Upper bound of VMs of `vm_memory_mb` this host can carry.
    pub fn max_vms(&self, vm_memory_mb: u64) -> u32 {
        max_vms_on_host(self.memory_mb, vm_memory_mb)
    }
}

/// `floor(host_memory / vm_memory)`, saturated to `u32`.
pub fn max_vms_on_host(host_memory_mb: u64, vm_memory_mb: u64) -> u32 {
    if vm_memory_mb == 0 {
        return 0;
    }
    (host_memory_mb / vm_memory_mb).min(u64::from(u32::MAX)) as u32
}
