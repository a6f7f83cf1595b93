//! Table → region → server resolution.
//!
//! Snapshots are re-fetched on every call and never cached across runs; the
//! driver only ever reads them.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use futures_util::future::try_join_all;

use crate::{
    admin::{AdminClient, AdminError, RegionId, ServerName},
    error::TopologyError,
    observability::{log_debug, log_warn},
};

/// Per-family state of one store as reported by its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    /// Fragments currently on disk.
    pub fragments: usize,
    /// Last completed major compaction (ms since epoch), if known.
    pub last_major_ms: Option<u64>,
}

/// A region, its host and its per-family store state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Hosting server.
    pub server: ServerName,
    /// Store state keyed by family.
    pub stores: BTreeMap<String, StoreInfo>,
}

/// Ordered view of a table's regions at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    regions: BTreeMap<RegionId, RegionInfo>,
}

impl TopologySnapshot {
    /// Regions in key order.
    pub fn regions(&self) -> &BTreeMap<RegionId, RegionInfo> {
        &self.regions
    }

    /// Servers hosting at least one region.
    pub fn servers(&self) -> BTreeSet<ServerName> {
        self.regions.values().map(|r| r.server.clone()).collect()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the table has no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Resolves a table's topology through the admin client.
#[derive(Clone)]
pub struct TopologyResolver {
    admin: Arc<dyn AdminClient>,
    retries: u32,
    retry_delay: Duration,
}

impl TopologyResolver {
    /// Resolver retrying transient failures `retries` times, `retry_delay` apart.
    pub fn new(admin: Arc<dyn AdminClient>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            admin,
            retries,
            retry_delay,
        }
    }

    /// Resolve every region of `table` with its host and per-family store state.
    pub async fn resolve(
        &self,
        table: &str,
        families: &BTreeSet<String>,
    ) -> Result<TopologySnapshot, TopologyError> {
        let mut attempt = 0u32;
        loop {
            match self.resolve_once(table, families).await {
                Ok(snapshot) => {
                    log_debug!(
                        component = "topology",
                        event = "topology_resolved",
                        table = table,
                        regions = snapshot.len(),
                        attempt = attempt,
                    );
                    return Ok(snapshot);
                }
                Err(err) if is_transient(&err) && attempt < self.retries => {
                    attempt += 1;
                    log_warn!(
                        component = "topology",
                        event = "topology_retry",
                        table = table,
                        attempt = attempt,
                        error = %err,
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn resolve_once(
        &self,
        table: &str,
        families: &BTreeSet<String>,
    ) -> Result<TopologySnapshot, TopologyError> {
        let locations = self.admin.list_regions(table).await.map_err(|err| match err {
            AdminError::TableNotFound(name) => TopologyError::TableNotFound(name),
            other => TopologyError::Admin(other),
        })?;

        let mut assigned = Vec::with_capacity(locations.len());
        for location in locations {
            let server = location
                .server
                .ok_or_else(|| TopologyError::RegionUnassigned(location.region.clone()))?;
            assigned.push((location.region, server));
        }

        let regions = try_join_all(
            assigned
                .into_iter()
                .map(|(region, server)| self.region_info(region, server, families)),
        )
        .await?;
        Ok(TopologySnapshot {
            regions: regions.into_iter().collect(),
        })
    }

    async fn region_info(
        &self,
        region: RegionId,
        server: ServerName,
        families: &BTreeSet<String>,
    ) -> Result<(RegionId, RegionInfo), TopologyError> {
        let mut stores = BTreeMap::new();
        for family in families {
            let fragments = self.admin.fragment_count(&region, family).await?;
            let last_major_ms = self.admin.last_major_compaction(&region, family).await?;
            stores.insert(
                family.clone(),
                StoreInfo {
                    fragments,
                    last_major_ms,
                },
            );
        }
        Ok((region, RegionInfo { server, stores }))
    }

    /// Current host of one region; `None` while it is in transition.
    pub async fn locate(&self, region: &RegionId) -> Result<Option<ServerName>, AdminError> {
        self.admin.region_location(region).await
    }
}

fn is_transient(err: &TopologyError) -> bool {
    match err {
        TopologyError::TableNotFound(_) => false,
        TopologyError::RegionUnassigned(_) => true,
        TopologyError::Admin(admin) => admin.is_retryable(),
    }
}
