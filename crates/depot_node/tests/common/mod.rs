//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use blob_depot::depot::{DepotConfig, LogoBlobId, TabletId};
use depot_node::{start_node, Authorities, DepotNode, MemBlobStore, NodeConfig};

/// Timeout for any single client round-trip.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);

pub const DEPOT_TABLET: TabletId = 72;
pub const USER_TABLET: TabletId = 1000;
pub const DATA_GROUP: u32 = 7;

pub fn node_config(data_dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::single_agent(
        data_dir.to_path_buf(),
        DepotConfig::with_data_groups(DEPOT_TABLET, 1, &[DATA_GROUP]),
    );
    config.sweep_interval_ms = 50;
    config.agent_tick_ms = 20;
    config
}

pub async fn start(config: NodeConfig, store: &Arc<MemBlobStore>) -> DepotNode {
    start_with(config, store, Authorities::default()).await
}

pub async fn start_with(
    config: NodeConfig,
    store: &Arc<MemBlobStore>,
    authorities: Authorities,
) -> DepotNode {
    depot_node::init_tracing();
    start_node(config, store.clone(), authorities)
        .await
        .expect("start node")
}

pub fn blob_id(step: u32, size: usize) -> LogoBlobId {
    LogoBlobId::new(USER_TABLET, 4, step, 0, 0, size as u32)
}

/// Await `fut`, failing the test if it takes longer than [`IO_TIMEOUT`].
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(IO_TIMEOUT, fut)
        .await
        .expect("operation timed out")
}
