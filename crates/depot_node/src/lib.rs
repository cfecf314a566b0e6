//! Runtime wiring for a blob depot node: a fjall-backed coordinator, its
//! agents and an in-process blob store, each state machine on its own tokio
//! task.

pub mod config;
mod runtime;
mod store;
mod table;

use std::sync::Arc;

use anyhow::Context;
use blob_depot::depot::{BarrierTable, BlobStore, BlocksTable, Collaborators, Coordinator};

pub use config::NodeConfig;
pub use runtime::{
    spawn_agent, spawn_coordinator, AgentHandle, CoordinatorHandle, CoordinatorLink, DepotNode,
};
pub use store::MemBlobStore;
pub use table::FjallTable;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info`
/// filter; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

/// Authorities consulted by the coordinator of a node.
#[derive(Clone, Debug, Default)]
pub struct Authorities {
    pub blocks: BlocksTable,
    pub barriers: BarrierTable,
}

/// Open the keyspace under `config.data_dir`, start a coordinator under a
/// fresh generation and one task per configured agent.
pub async fn start_node(
    config: NodeConfig,
    store: Arc<dyn BlobStore>,
    authorities: Authorities,
) -> anyhow::Result<DepotNode> {
    config.validate()?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let table = Arc::new(FjallTable::open(&config.data_dir.join("depot"))?);
    let generation = table.next_generation()?;

    let mut coordinator = Coordinator::open(
        generation,
        Collaborators {
            table,
            blocks: Arc::new(authorities.blocks),
            barriers: Arc::new(authorities.barriers),
        },
        config.seed,
    )
    .context("open coordinator")?;
    if coordinator.config() != Some(&config.depot) {
        coordinator
            .apply_config(config.depot.clone())
            .context("apply depot config")?;
    }
    tracing::info!(
        generation,
        tablet_id = config.depot.tablet_id,
        agents = config.agents.len(),
        "starting depot node"
    );

    let (handle, coordinator_task) =
        spawn_coordinator(coordinator, store.clone(), config.sweep_interval());
    let mut tasks = vec![coordinator_task];
    let mut agents = Vec::with_capacity(config.agents.len());
    for agent in &config.agents {
        let (agent, task) = spawn_agent(
            agent.clone(),
            handle.clone(),
            store.clone(),
            config.agent_tick(),
        );
        agents.push(agent);
        tasks.push(task);
    }
    Ok(DepotNode::new(handle, agents, tasks))
}
