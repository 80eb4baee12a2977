//! VM addressing — IPv4 leases, MAC addresses and DHCP configuration.
//!
//! Usable addresses skip the network address, anything ending in `.0`
//! and the broadcast address. The last usable address is the router,
//! which the service node answers for; every other usable address can be
//! leased to a VM.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};
use crate::executors::ServiceNodeConfig;

/// Network used when resolution reports none.
pub const DEFAULT_VM_NETWORK: &str = "10.172.0.0/18";

/// Locally administered prefix given to every VM MAC.
pub const MAC_PREFIX: [u8; 3] = [0x00, 0x16, 0x3e];

const LEASE_TIME: &str = "12h";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub vm_id: String,
    pub ip: Ipv4Addr,
    pub mac: String,
}

/// Leases for a VM set plus the router of their network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPlan {
    pub network: Ipv4Network,
    pub router: Ipv4Addr,
    pub leases: Vec<Lease>,
}

pub fn default_network() -> DeployResult<Ipv4Network> {
    DEFAULT_VM_NETWORK
        .parse()
        .map_err(|e: ipnetwork::IpNetworkError| DeployError::Addressing(e.to_string()))
}

/// Usable addresses of `network`, router included, in ascending order.
pub fn usable_addresses(network: Ipv4Network) -> impl Iterator<Item = Ipv4Addr> {
    let first = network.network();
    let last = network.broadcast();
    network
        .iter()
        .filter(move |ip| *ip != first && *ip != last && ip.octets()[3] != 0)
}

/// A MAC with [`MAC_PREFIX`] not yet in `taken`.
pub fn random_mac<R: Rng>(rng: &mut R, taken: &mut HashSet<[u8; 6]>) -> String {
    loop {
        let mac = [
            MAC_PREFIX[0],
            MAC_PREFIX[1],
            MAC_PREFIX[2],
            rng.r#gen(),
            rng.r#gen(),
            rng.r#gen(),
        ];
        if taken.insert(mac) {
            return mac
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":");
        }
    }
}

impl AddressPlan {
    /// Lease one address and one MAC per VM, in the given order.
    pub fn allocate<R: Rng>(
        network: Ipv4Network,
        vm_ids: &[String],
        rng: &mut R,
    ) -> DeployResult<Self> {
        if network.prefix() > 30 {
            return Err(DeployError::Addressing(format!(
                "network {network} is too small to address VMs"
            )));
        }
        let router = Ipv4Addr::from(u32::from(network.broadcast()) - 1);

        let mut taken = HashSet::new();
        let mut addresses = usable_addresses(network).filter(|ip| *ip != router);
        let mut leases = Vec::with_capacity(vm_ids.len());
        for vm_id in vm_ids {
            let ip = addresses.next().ok_or_else(|| {
                DeployError::Addressing(format!(
                    "network {network} cannot address {} VMs",
                    vm_ids.len()
                ))
            })?;
            leases.push(Lease {
                vm_id: vm_id.clone(),
                ip,
                mac: random_mac(rng, &mut taken),
            });
        }

        Ok(Self {
            network,
            router,
            leases,
        })
    }

    pub fn lease(&self, vm_id: &str) -> Option<&Lease> {
        self.leases.iter().find(|l| l.vm_id == vm_id)
    }

    /// `dhcp-range=FIRST,LAST,NETMASK,12h`, LAST being the router.
    pub fn dhcp_range(&self) -> String {
        let first = self.leases.first().map(|l| l.ip).unwrap_or(self.router);
        format!(
            "dhcp-range={first},{last},{mask},{LEASE_TIME}",
            last = self.router,
            mask = self.network.mask()
        )
    }

    pub fn dhcp_router(&self) -> String {
        format!("dhcp-option=option:router,{}", self.router)
    }

    pub fn dhcp_hosts(&self) -> Vec<String> {
        self.leases
            .iter()
            .map(|l| format!("dhcp-host={},{}", l.mac, l.ip))
            .collect()
    }

    pub fn service_node_config(&self) -> ServiceNodeConfig {
        ServiceNodeConfig {
            dhcp_range: self.dhcp_range(),
            dhcp_router: self.dhcp_router(),
            dhcp_hosts: self.dhcp_hosts(),
            gateway: self.router,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("vm-{i}")).collect()
    }

    #[test]
    fn skips_network_zero_and_broadcast_addresses() {
        let net: Ipv4Network = "10.0.0.0/23".parse().unwrap();
        let usable: Vec<Ipv4Addr> = usable_addresses(net).collect();

        assert_eq!(usable[0], Ipv4Addr::new(10, 0, 0, 1));
        assert!(!usable.contains(&Ipv4Addr::new(10, 0, 1, 0)));
        assert!(!usable.contains(&Ipv4Addr::new(10, 0, 1, 255)));
        assert_eq!(*usable.last().unwrap(), Ipv4Addr::new(10, 0, 1, 254));
        // 512 minus network, broadcast and 10.0.1.0.
        assert_eq!(usable.len(), 509);
    }

    #[test]
    fn leases_are_unique_and_avoid_the_router() {
        let mut rng = StdRng::seed_from_u64(1);
        let plan = AddressPlan::allocate(default_network().unwrap(), &ids(300), &mut rng).unwrap();

        assert_eq!(plan.router, Ipv4Addr::new(10, 172, 63, 254));
        assert_eq!(plan.leases.len(), 300);
        let ips: HashSet<_> = plan.leases.iter().map(|l| l.ip).collect();
        let macs: HashSet<_> = plan.leases.iter().map(|l| l.mac.clone()).collect();
        assert_eq!(ips.len(), 300);
        assert_eq!(macs.len(), 300);
        assert!(!ips.contains(&plan.router));
        assert!(plan.leases.iter().all(|l| l.mac.starts_with("00:16:3e:")));
        assert!(plan.leases.iter().all(|l| l.ip.octets()[3] != 0));
        assert_eq!(plan.lease("vm-1").unwrap().ip, Ipv4Addr::new(10, 172, 0, 1));
    }

    #[test]
    fn dhcp_lines() {
        let mut rng = StdRng::seed_from_u64(3);
        let net: Ipv4Network = "192.168.10.0/24".parse().unwrap();
        let plan = AddressPlan::allocate(net, &ids(2), &mut rng).unwrap();

        assert_eq!(
            plan.dhcp_range(),
            "dhcp-range=192.168.10.1,192.168.10.254,255.255.255.0,12h"
        );
        assert_eq!(plan.dhcp_router(), "dhcp-option=option:router,192.168.10.254");
        let hosts = plan.dhcp_hosts();
        assert_eq!(hosts.len(), 2);
        assert!(hosts[1].starts_with("dhcp-host=00:16:3e:"));
        assert!(hosts[1].ends_with(",192.168.10.2"));
    }

    #[test]
    fn too_many_vms_is_an_error() {
        let mut rng = StdRng::seed_from_u64(5);
        let net: Ipv4Network = "192.168.10.0/29".parse().unwrap();
        // 6 usable, one of which is the router.
        assert!(AddressPlan::allocate(net, &ids(5), &mut rng).is_ok());
        assert!(matches!(
            AddressPlan::allocate(net, &ids(6), &mut rng),
            Err(DeployError::Addressing(_))
        ));
    }
}
