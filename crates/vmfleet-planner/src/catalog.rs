//! Pool catalog — sites, clusters and their per-host attributes.
//!
//! Pool tokens from the user are resolved here: the `all` keyword
//! expands to every site and capable cluster, a site pulls in its
//! capable clusters, and anything unknown is rejected.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use vmfleet_core::{PoolId, PoolRequirement, VLAN_POOL};

use crate::error::{PlanError, PlanResult};

/// Keywords that stand for the whole catalog.
const ALL_POOLS: [&str; 2] = ["all", "grid5000"];

/// Static description of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: PoolId,
    pub site: String,
    /// Number of hosts in the cluster.
    pub hosts: u32,
    /// Memory per host in MiB.
    pub memory_mb: u64,
    /// CPU threads per host.
    pub cpus: u32,
    /// Hosts support hardware virtualization.
    pub virt: bool,
    /// Hosts can join a dedicated virtual network.
    pub vlan: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCatalog {
    clusters: BTreeMap<PoolId, ClusterInfo>,
}

impl PoolCatalog {
    pub fn new(clusters: impl IntoIterator<Item = ClusterInfo>) -> Self {
        Self {
            clusters: clusters.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn cluster(&self, id: &str) -> Option<&ClusterInfo> {
        self.clusters.get(id)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &ClusterInfo> {
        self.clusters.values()
    }

    pub fn sites(&self) -> BTreeSet<&str> {
        self.clusters.values().map(|c| c.site.as_str()).collect()
    }

    pub fn is_site(&self, id: &str) -> bool {
        self.clusters.values().any(|c| c.site == id)
    }

    pub fn is_cluster(&self, id: &str) -> bool {
        self.clusters.contains_key(id)
    }

    pub fn site_of(&self, cluster: &str) -> Option<&str> {
        self.clusters.get(cluster).map(|c| c.site.as_str())
    }

    /// Clusters of a site, in name order.
    pub fn clusters_of_site<'a>(&'a self, site: &'a str) -> impl Iterator<Item = &'a ClusterInfo> {
        self.clusters.values().filter(move |c| c.site == site)
    }

    /// Clusters lacking virtualization support.
    pub fn unsupported(&self) -> Vec<PoolId> {
        self.clusters
            .values()
            .filter(|c| !c.virt)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Blacklisted pools with every site replaced by the site and its clusters.
    pub fn blacklisted_clusters<'a>(
        &self,
        blacklist: impl IntoIterator<Item = &'a PoolId>,
    ) -> Vec<PoolId> {
        let mut pools = Vec::new();
        for pool in blacklist {
            pools.push(pool.clone());
            if self.is_site(pool) {
                pools.extend(self.clusters_of_site(pool).map(|c| c.id.clone()));
            }
        }
        pools
    }

    /// Resolve pool tokens against the catalog.
    ///
    /// Explicit counts are kept; clusters pulled in by a site or by the
    /// `all` keyword are added as unconstrained entries.
    pub fn expand(&self, requirement: &PoolRequirement) -> PlanResult<PoolRequirement> {
        let mut expanded = PoolRequirement::new();
        let mut pulled_in: Vec<PoolId> = Vec::new();

        for (pool, count) in requirement.iter() {
            if ALL_POOLS.contains(&pool.as_str()) {
                for site in self.sites() {
                    pulled_in.push(site.to_string());
                }
                pulled_in.extend(self.clusters.values().filter(|c| c.virt).map(|c| c.id.clone()));
            } else if self.is_cluster(pool) || pool == VLAN_POOL {
                expanded.add(pool.clone(), count);
            } else if self.is_site(pool) {
                expanded.add(pool.clone(), count);
                pulled_in.extend(
                    self.clusters_of_site(pool)
                        .filter(|c| c.virt)
                        .map(|c| c.id.clone()),
                );
            } else {
                return Err(PlanError::UnknownPool(pool.clone()));
            }
        }

        for pool in pulled_in {
            if !expanded.contains(&pool) {
                expanded.insert(pool, 0);
            }
        }

        debug!(input = %requirement, expanded = %expanded, "pool tokens expanded");
        Ok(expanded)
    }

    /// Clusters referenced by the requirement, directly or through their site.
    pub fn referenced_clusters(&self, requirement: &PoolRequirement) -> Vec<&ClusterInfo> {
        self.clusters
            .values()
            .filter(|c| requirement.contains(&c.id) || requirement.contains(&c.site))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use vmfleet_core::ExclusionSet;

    pub(crate) fn cluster(id: &str, site: &str, hosts: u32, memory_mb: u64) -> ClusterInfo {
        ClusterInfo {
            id: id.to_string(),
            site: site.to_string(),
            hosts,
            memory_mb,
            cpus: 16,
            virt: true,
            vlan: true,
        }
    }

    pub(crate) fn sample_catalog() -> PoolCatalog {
        let mut legacy = cluster("sagittaire", "lyon", 10, 2048);
        legacy.virt = false;
        PoolCatalog::new([
            cluster("taurus", "lyon", 8, 32768),
            legacy,
            cluster("graphene", "nancy", 20, 16384),
            cluster("griffon", "nancy", 4, 16384),
        ])
    }

    #[test]
    fn all_keyword_expands_to_sites_and_capable_clusters() {
        let catalog = sample_catalog();
        let req = PoolRequirement::parse_tokens("all").unwrap();
        let expanded = catalog.expand(&req).unwrap();

        assert_eq!(expanded.get("lyon"), Some(0));
        assert_eq!(expanded.get("nancy"), Some(0));
        assert_eq!(expanded.get("taurus"), Some(0));
        assert_eq!(expanded.get("graphene"), Some(0));
        assert!(!expanded.contains("sagittaire"));
        assert!(!expanded.contains("all"));
    }

    #[test]
    fn site_pulls_in_clusters_without_overriding_counts() {
        let catalog = sample_catalog();
        let req = PoolRequirement::parse_tokens("nancy,graphene:3").unwrap();
        let expanded = catalog.expand(&req).unwrap();

        assert_eq!(expanded.get("graphene"), Some(3));
        assert_eq!(expanded.get("griffon"), Some(0));
        assert_eq!(expanded.get("nancy"), Some(0));
    }

    #[test]
    fn unknown_pool_is_rejected() {
        let catalog = sample_catalog();
        let req = PoolRequirement::parse_tokens("atlantis").unwrap();
        assert!(matches!(catalog.expand(&req), Err(PlanError::UnknownPool(p)) if p == "atlantis"));
    }

    #[test]
    fn unsupported_lists_clusters_without_virt() {
        assert_eq!(sample_catalog().unsupported(), vec!["sagittaire".to_string()]);
    }

    #[test]
    fn blacklisted_site_covers_its_clusters() {
        let catalog = sample_catalog();
        let blacklist = ExclusionSet::parse_list("lyon,griffon");
        let pools = catalog.blacklisted_clusters(blacklist.iter());
        assert_eq!(pools, ["griffon", "lyon", "sagittaire", "taurus"]);
    }

    #[test]
    fn referenced_clusters_follow_sites() {
        let catalog = sample_catalog();
        let req = PoolRequirement::parse_tokens("lyon").unwrap();
        let ids: Vec<&str> = catalog
            .referenced_clusters(&req)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, ["sagittaire", "taurus"]);
    }
}
