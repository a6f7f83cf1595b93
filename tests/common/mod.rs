#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use major_compactor::{
    mem::{ClusterOptions, InMemoryCluster},
    CompactorConfig,
};

pub const TABLE: &str = "MajorCompactorTest";
pub const FAMILY: &str = "a";

/// Random 16-byte row keys spread across the whole key space.
pub fn random_rows(rng: &mut fastrand::Rng, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|_| {
            let mut key = vec![0u8; 16];
            rng.fill(&mut key);
            key
        })
        .collect()
}

/// Load and flush `flushes` times so every region holds `flushes` fragments.
pub fn load(cluster: &InMemoryCluster, rng: &mut fastrand::Rng, flushes: usize) {
    for _ in 0..flushes {
        cluster
            .put_rows(TABLE, FAMILY, random_rows(rng, 2_000))
            .expect("put rows");
        cluster.flush(TABLE).expect("flush");
    }
}

pub fn cluster(options: ClusterOptions, regions: usize, flushes: usize) -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new(options));
    cluster.create_table(TABLE, [FAMILY], regions);
    let mut rng = fastrand::Rng::with_seed(7);
    load(&cluster, &mut rng, flushes);
    cluster
}

pub fn config() -> CompactorConfig {
    CompactorConfig::new(TABLE, [FAMILY])
        .poll_interval(Duration::from_millis(20))
        .run_timeout(Duration::from_secs(30))
        .retry_backoff(Duration::from_millis(10))
}
