//! Node configuration file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use blob_depot::agent::AgentConfig;
use blob_depot::depot::DepotConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
const DEFAULT_AGENT_TICK_MS: u64 = 500;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Holds the fjall keyspace of the coordinator.
    pub data_dir: PathBuf,
    pub depot: DepotConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Seed of the coordinator's channel picker.
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_agent_tick_ms")]
    pub agent_tick_ms: u64,
}

fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}

fn default_agent_tick_ms() -> u64 {
    DEFAULT_AGENT_TICK_MS
}

impl NodeConfig {
    /// One coordinator and one agent with default settings.
    pub fn single_agent(data_dir: PathBuf, depot: DepotConfig) -> Self {
        Self {
            data_dir,
            depot,
            agents: vec![AgentConfig::new(1, rand::random())],
            seed: 0,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            agent_tick_ms: DEFAULT_AGENT_TICK_MS,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read node config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse node config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.depot.validate()?;
        anyhow::ensure!(self.sweep_interval_ms > 0, "sweep_interval_ms must be positive");
        anyhow::ensure!(self.agent_tick_ms > 0, "agent_tick_ms must be positive");
        let mut seen = HashSet::new();
        for agent in &self.agents {
            anyhow::ensure!(
                seen.insert(agent.node_id),
                "agent node id {} configured twice",
                agent.node_id
            );
            agent.validate()?;
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn agent_tick(&self) -> Duration {
        Duration::from_millis(self.agent_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_applies_defaults_and_rejects_duplicate_agents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "data_dir": "/var/lib/depot",
                "depot": {{"tablet_id": 72, "channels": [
                    {{"channel": 0, "kind": "System", "group_id": 1}},
                    {{"channel": 2, "kind": "Data", "group_id": 7}}
                ]}},
                "agents": [{{"node_id": 1, "instance_id": 5}}]
            }}"#
        )
        .unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.agents[0].id_batch_size, 100);
        assert_eq!(config.depot.resolve_page_size, 10_000);

        let mut twice = config.clone();
        twice.agents.push(AgentConfig::new(1, 6));
        assert!(twice.validate().is_err());
    }

    #[test]
    fn load_rejects_agents_that_cannot_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "data_dir": "/var/lib/depot",
                "depot": {{"tablet_id": 72, "channels": [
                    {{"channel": 0, "kind": "System", "group_id": 1}},
                    {{"channel": 2, "kind": "Data", "group_id": 7}}
                ]}},
                "agents": [{{"node_id": 1, "instance_id": 5, "max_reads_in_flight": 0}}]
            }}"#
        )
        .unwrap();
        let err = NodeConfig::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("no reads in flight"), "{err:#}");
    }
}
