//! In-memory cluster implementing [`AdminClient`].
//!
//! Hosts multi-region tables on named servers. Writes land in a per-store
//! memstore; `flush` turns every non-empty memstore into one more fragment.
//! A major-compaction request selects the fragments present at request time
//! and merges them into one once the discharger interval has elapsed, so
//! callers observe the merge asynchronously just as they would against real
//! storage servers.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    admin::{AdminClient, AdminError, AdminFuture, RegionId, RegionLocation, ServerName},
    task::unix_millis,
};

/// Tuning for an [`InMemoryCluster`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    servers: Vec<ServerName>,
    discharger_interval: Duration,
    ack_latency: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            servers: vec![ServerName::from("server-0")],
            discharger_interval: Duration::from_millis(10),
            ack_latency: Duration::ZERO,
        }
    }
}

impl ClusterOptions {
    /// Cluster with `count` servers named `server-0..server-{count-1}`.
    pub fn with_servers(count: usize) -> Self {
        Self {
            servers: (0..count.max(1))
                .map(|idx| ServerName::new(format!("server-{idx}")))
                .collect(),
            ..Default::default()
        }
    }

    /// Interval after which a requested major compaction is merged.
    pub fn discharger_interval(self, discharger_interval: Duration) -> Self {
        Self {
            discharger_interval,
            ..self
        }
    }

    /// Time a server takes to acknowledge a compaction request.
    pub fn ack_latency(self, ack_latency: Duration) -> Self {
        Self {
            ack_latency,
            ..self
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    memstore_rows: usize,
    fragments: usize,
    /// Fragments selected by a pending major compaction and when they merge.
    pending: Option<(usize, Instant)>,
    last_major_ms: Option<u64>,
    requests: u64,
}

#[derive(Debug)]
struct RegionState {
    server: Option<ServerName>,
    /// Set by `move_region`; the next request reports the move once.
    moved_to: Option<ServerName>,
    stores: BTreeMap<String, StoreState>,
}

#[derive(Debug, Default)]
struct ServerState {
    reachable: bool,
    in_flight: usize,
    peak_in_flight: usize,
    requests: u64,
}

#[derive(Debug)]
struct TableState {
    regions: Vec<RegionId>,
}

#[derive(Debug, Default)]
struct ClusterState {
    tables: BTreeMap<String, TableState>,
    regions: BTreeMap<RegionId, RegionState>,
    servers: BTreeMap<ServerName, ServerState>,
    discharger_paused: bool,
}

impl ClusterState {
    fn discharge(&mut self, now: Instant) {
        if self.discharger_paused {
            return;
        }
        for region in self.regions.values_mut() {
            for store in region.stores.values_mut() {
                if let Some((selected, due)) = store.pending {
                    if due <= now {
                        store.fragments = store.fragments.saturating_sub(selected) + 1;
                        store.pending = None;
                        store.last_major_ms = Some(unix_millis());
                    }
                }
            }
        }
    }

    fn hosted_region(&self, region: &RegionId) -> Result<(&RegionState, &ServerName), AdminError> {
        let state = self
            .regions
            .get(region)
            .ok_or_else(|| AdminError::RegionNotFound(region.clone()))?;
        let server = state
            .server
            .as_ref()
            .ok_or_else(|| AdminError::RegionInTransition(region.clone()))?;
        let reachable = self
            .servers
            .get(server)
            .map(|s| s.reachable)
            .unwrap_or(false);
        if !reachable {
            return Err(AdminError::ServerUnavailable(server.clone()));
        }
        Ok((state, server))
    }
}

/// Simulated region-partitioned cluster.
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    discharger_interval: Duration,
    ack_latency: Duration,
}

impl InMemoryCluster {
    /// Start a cluster with the given options.
    pub fn new(options: ClusterOptions) -> Self {
        let servers = options
            .servers
            .into_iter()
            .map(|name| {
                (
                    name,
                    ServerState {
                        reachable: true,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(ClusterState {
                servers,
                ..Default::default()
            }),
            discharger_interval: options.discharger_interval,
            ack_latency: options.ack_latency,
        }
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `table` with `regions` regions assigned round-robin to servers.
    ///
    /// Recreating an existing table replaces it.
    pub fn create_table<I, S>(&self, table: &str, families: I, regions: usize) -> Vec<RegionId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let families: BTreeSet<String> = families.into_iter().map(Into::into).collect();
        let mut state = self.state();
        if let Some(old) = state.tables.remove(table) {
            for region in old.regions {
                state.regions.remove(&region);
            }
        }
        let servers: Vec<ServerName> = state.servers.keys().cloned().collect();
        let mut ids = Vec::with_capacity(regions.max(1));
        for idx in 0..regions.max(1) {
            let id = RegionId::new(format!("{table},{idx:04}"));
            let server = servers.get(idx % servers.len().max(1)).cloned();
            let stores = families
                .iter()
                .map(|family| (family.clone(), StoreState::default()))
                .collect();
            state.regions.insert(
                id.clone(),
                RegionState {
                    server,
                    moved_to: None,
                    stores,
                },
            );
            ids.push(id);
        }
        state.tables.insert(
            table.to_string(),
            TableState {
                regions: ids.clone(),
            },
        );
        ids
    }

    /// Route rows to regions by their first key byte and buffer them in memstores.
    pub fn put_rows<I>(&self, table: &str, family: &str, rows: I) -> Result<usize, AdminError>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut state = self.state();
        let regions = state
            .tables
            .get(table)
            .map(|t| t.regions.clone())
            .ok_or_else(|| AdminError::TableNotFound(table.to_string()))?;
        let mut written = 0;
        for row in rows {
            let first = row.first().copied().unwrap_or(0) as usize;
            let region = &regions[first * regions.len() / 256];
            let store = state
                .regions
                .get_mut(region)
                .and_then(|r| r.stores.get_mut(family))
                .ok_or_else(|| AdminError::FamilyNotFound {
                    region: region.clone(),
                    family: family.to_string(),
                })?;
            store.memstore_rows += 1;
            written += 1;
        }
        Ok(written)
    }

    /// Flush every non-empty memstore of `table` into a new fragment.
    pub fn flush(&self, table: &str) -> Result<usize, AdminError> {
        let mut state = self.state();
        let regions = state
            .tables
            .get(table)
            .map(|t| t.regions.clone())
            .ok_or_else(|| AdminError::TableNotFound(table.to_string()))?;
        let mut flushed = 0;
        for region in &regions {
            if let Some(region) = state.regions.get_mut(region) {
                for store in region.stores.values_mut() {
                    if store.memstore_rows > 0 {
                        store.memstore_rows = 0;
                        store.fragments += 1;
                        flushed += 1;
                    }
                }
            }
        }
        Ok(flushed)
    }

    /// Total fragments of `family` across the table's regions.
    pub fn fragment_total(&self, table: &str, family: &str) -> usize {
        let mut state = self.state();
        state.discharge(Instant::now());
        let Some(regions) = state.tables.get(table).map(|t| t.regions.clone()) else {
            return 0;
        };
        regions
            .iter()
            .filter_map(|id| state.regions.get(id))
            .filter_map(|r| r.stores.get(family))
            .map(|s| s.fragments)
            .sum()
    }

    /// Number of regions the table has.
    pub fn region_count(&self, table: &str) -> usize {
        self.state()
            .tables
            .get(table)
            .map(|t| t.regions.len())
            .unwrap_or(0)
    }

    /// Servers hosting at least one region of `table`.
    pub fn servers_of(&self, table: &str) -> BTreeSet<ServerName> {
        let state = self.state();
        let Some(table) = state.tables.get(table) else {
            return BTreeSet::new();
        };
        table
            .regions
            .iter()
            .filter_map(|id| state.regions.get(id))
            .filter_map(|r| r.server.clone())
            .collect()
    }

    /// Regions currently hosted by `server`.
    pub fn regions_on(&self, server: &ServerName) -> Vec<RegionId> {
        self.state()
            .regions
            .iter()
            .filter(|(_, r)| r.server.as_ref() == Some(server))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Mark a server reachable or unreachable.
    pub fn set_server_reachable(&self, server: &ServerName, reachable: bool) {
        if let Some(state) = self.state().servers.get_mut(server) {
            state.reachable = reachable;
        }
    }

    /// Stop merging requested compactions until resumed.
    pub fn pause_discharger(&self, paused: bool) {
        self.state().discharger_paused = paused;
    }

    /// Take a region offline, as during reassignment.
    pub fn unassign_region(&self, region: &RegionId) {
        if let Some(state) = self.state().regions.get_mut(region) {
            state.server = None;
        }
    }

    /// Host a region on `server`.
    pub fn assign_region(&self, region: &RegionId, server: &ServerName) {
        if let Some(state) = self.state().regions.get_mut(region) {
            state.server = Some(server.clone());
        }
    }

    /// Move a region to `server`; the next compaction request for it reports the move.
    pub fn move_region(&self, region: &RegionId, server: &ServerName) {
        if let Some(state) = self.state().regions.get_mut(region) {
            state.server = Some(server.clone());
            state.moved_to = Some(server.clone());
        }
    }

    /// Compaction requests acknowledged for a pair.
    pub fn compaction_requests(&self, region: &RegionId, family: &str) -> u64 {
        self.state()
            .regions
            .get(region)
            .and_then(|r| r.stores.get(family))
            .map(|s| s.requests)
            .unwrap_or(0)
    }

    /// Compaction requests acknowledged across the cluster.
    pub fn total_compaction_requests(&self) -> u64 {
        self.state().servers.values().map(|s| s.requests).sum()
    }

    /// Compaction requests acknowledged by one server.
    pub fn server_requests(&self, server: &ServerName) -> u64 {
        self.state()
            .servers
            .get(server)
            .map(|s| s.requests)
            .unwrap_or(0)
    }

    /// Highest number of simultaneous requests a server has seen.
    pub fn peak_in_flight(&self, server: &ServerName) -> usize {
        self.state()
            .servers
            .get(server)
            .map(|s| s.peak_in_flight)
            .unwrap_or(0)
    }

    fn begin_request(&self, region: &RegionId, family: &str) -> Result<ServerName, AdminError> {
        let mut state = self.state();
        let server = {
            let (region_state, server) = state.hosted_region(region)?;
            if !region_state.stores.contains_key(family) {
                return Err(AdminError::FamilyNotFound {
                    region: region.clone(),
                    family: family.to_string(),
                });
            }
            server.clone()
        };
        if let Some(moved) = state.regions.get_mut(region).and_then(|r| r.moved_to.take()) {
            return Err(AdminError::RegionMoved {
                region: region.clone(),
                server: moved,
            });
        }
        if let Some(server_state) = state.servers.get_mut(&server) {
            server_state.in_flight += 1;
            server_state.peak_in_flight = server_state.peak_in_flight.max(server_state.in_flight);
        }
        Ok(server)
    }

    fn finish_request(&self, region: &RegionId, family: &str, server: &ServerName) {
        let due = Instant::now() + self.discharger_interval;
        let mut state = self.state();
        if let Some(server_state) = state.servers.get_mut(server) {
            server_state.in_flight = server_state.in_flight.saturating_sub(1);
            server_state.requests += 1;
        }
        if let Some(store) = state
            .regions
            .get_mut(region)
            .and_then(|r| r.stores.get_mut(family))
        {
            store.requests += 1;
            if store.pending.is_none() && store.fragments > 1 {
                store.pending = Some((store.fragments, due));
            }
        }
    }
}

impl AdminClient for InMemoryCluster {
    fn list_regions<'a>(&'a self, table: &'a str) -> AdminFuture<'a, Vec<RegionLocation>> {
        Box::pin(async move {
            let state = self.state();
            let table_state = state
                .tables
                .get(table)
                .ok_or_else(|| AdminError::TableNotFound(table.to_string()))?;
            Ok(table_state
                .regions
                .iter()
                .map(|id| RegionLocation {
                    region: id.clone(),
                    server: state.regions.get(id).and_then(|r| r.server.clone()),
                })
                .collect())
        })
    }

    fn fragment_count<'a>(
        &'a self,
        region: &'a RegionId,
        family: &'a str,
    ) -> AdminFuture<'a, usize> {
        Box::pin(async move {
            let mut state = self.state();
            state.discharge(Instant::now());
            let (region_state, _) = state.hosted_region(region)?;
            region_state
                .stores
                .get(family)
                .map(|s| s.fragments)
                .ok_or_else(|| AdminError::FamilyNotFound {
                    region: region.clone(),
                    family: family.to_string(),
                })
        })
    }

    fn major_compact<'a>(&'a self, region: &'a RegionId, family: &'a str) -> AdminFuture<'a, ()> {
        Box::pin(async move {
            let server = self.begin_request(region, family)?;
            if !self.ack_latency.is_zero() {
                tokio::time::sleep(self.ack_latency).await;
            }
            self.finish_request(region, family, &server);
            Ok(())
        })
    }

    fn region_location<'a>(
        &'a self,
        region: &'a RegionId,
    ) -> AdminFuture<'a, Option<ServerName>> {
        Box::pin(async move {
            let state = self.state();
            state
                .regions
                .get(region)
                .map(|r| r.server.clone())
                .ok_or_else(|| AdminError::RegionNotFound(region.clone()))
        })
    }

    fn last_major_compaction<'a>(
        &'a self,
        region: &'a RegionId,
        family: &'a str,
    ) -> AdminFuture<'a, Option<u64>> {
        Box::pin(async move {
            let mut state = self.state();
            state.discharge(Instant::now());
            Ok(state
                .regions
                .get(region)
                .and_then(|r| r.stores.get(family))
                .and_then(|s| s.last_major_ms))
        })
    }
}
