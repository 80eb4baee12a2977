//! Collaborator contracts driven by the orchestrator.
//!
//! Every remote operation sits behind one of these traits. They are held
//! as `Arc<dyn Trait>` and called from worker tasks, so all of them are
//! `Send + Sync`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use vmfleet_core::{JobHandle, PhysicalHost, VmDescriptor};
use vmfleet_reservation::ReservationTransport;

use crate::error::ExecError;
use crate::phase::{DiskLocation, HostImage};

/// When a reservation holds its hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// What a set of job handles resolves to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedResources {
    pub hosts: Vec<PhysicalHost>,
    /// Dedicated virtual network, when one was reserved.
    pub vlan: Option<u32>,
    /// Network the VMs are addressed from.
    pub network: Option<Ipv4Network>,
}

#[async_trait]
pub trait ResourceResolver: Send + Sync {
    /// Start and end of the reservation behind `handles`.
    async fn job_window(&self, handles: &[JobHandle]) -> Result<JobWindow, ExecError>;

    /// Block until the reservation has started.
    async fn wait_start(&self, handles: &[JobHandle]) -> Result<(), ExecError>;

    async fn resolve(&self, handles: &[JobHandle]) -> Result<ResolvedResources, ExecError>;
}

/// Outcome of one deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOptions {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Deploy even when the host already runs the image.
    pub force: bool,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Network-boot `host` with `image` and report whether it came back.
    async fn deploy(
        &self,
        host: &PhysicalHost,
        image: &HostImage,
        options: &ProvisionOptions,
    ) -> Result<Reachability, ExecError>;
}

/// A configuration step applied to one host.
#[async_trait]
pub trait Executor<C: Sync>: Send + Sync {
    async fn apply(&self, host: &PhysicalHost, config: &C) -> Result<(), ExecError>;
}

/// Packages to install on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub packages: Vec<String>,
    /// Upgrade installed packages first.
    pub upgrade: bool,
    /// Host serving the package cache, if one was staged.
    pub cache_host: Option<String>,
}

/// Hypervisor runtime and storage backend setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Bridge the VMs attach to.
    pub bridge: String,
    /// Directory holding VM disks.
    pub storage_dir: String,
    pub vlan: Option<u32>,
    /// VMs this host may receive.
    pub max_vms: u32,
}

/// DHCP service configured on the service node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNodeConfig {
    pub dhcp_range: String,
    pub dhcp_router: String,
    pub dhcp_hosts: Vec<String>,
    pub gateway: Ipv4Addr,
}

/// Handle to a started VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    pub vm_id: String,
    pub host: String,
    pub ip: Option<Ipv4Addr>,
}

#[async_trait]
pub trait VmRuntime: Send + Sync {
    /// Destroy every VM on `host`, returning how many there were.
    async fn destroy_all(&self, host: &PhysicalHost) -> Result<u32, ExecError>;

    /// Make the backing image available on `host`.
    async fn prepare_disk(&self, host: &PhysicalHost, backing: &str) -> Result<(), ExecError>;

    /// Create and start `vm` on `host`.
    async fn instantiate(
        &self,
        host: &PhysicalHost,
        vm: &VmDescriptor,
        disk: DiskLocation,
    ) -> Result<VmHandle, ExecError>;

    /// Identifiers of the VMs currently defined on `host`.
    async fn list(&self, host: &PhysicalHost) -> Result<Vec<String>, ExecError>;
}

/// Every collaborator a deployment talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ResourceResolver>,
    pub provisioner: Arc<dyn Provisioner>,
    pub packages: Arc<dyn Executor<PackageConfig>>,
    pub hypervisor: Arc<dyn Executor<HypervisorConfig>>,
    pub service_node: Arc<dyn Executor<ServiceNodeConfig>>,
    pub runtime: Arc<dyn VmRuntime>,
    /// Used to cancel a reservation that turns out unusable.
    pub reservations: Arc<dyn ReservationTransport>,
}
