//! Externally supplied coordinator configuration.

use serde::{Deserialize, Serialize};

use super::types::{ChannelKind, GroupId, TabletId};

/// Default number of keys a single resolve reply may carry before `OVERRUN`.
const DEFAULT_RESOLVE_PAGE_SIZE: usize = 10_000;
/// Largest blob the store accepts; also the ceiling for composite blobs.
const DEFAULT_MAX_BLOB_SIZE: u32 = 10 << 20;

/// How committed values are checked against GC fences.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    /// Keys are logical blob ids and commits are checked against barriers.
    #[default]
    VirtualGroup,
    /// Keys are opaque; barriers do not apply.
    KeyValue,
}

/// One channel of the depot tablet and the storage group backing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub channel: u8,
    pub kind: ChannelKind,
    pub group_id: GroupId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotConfig {
    pub tablet_id: TabletId,
    #[serde(default)]
    pub operation_mode: OperationMode,
    #[serde(default)]
    pub channels: Vec<ChannelProfile>,
    /// Legacy group whose contents are being assimilated, if any.
    #[serde(default)]
    pub decommission_group: Option<GroupId>,
    #[serde(default = "default_resolve_page_size")]
    pub resolve_page_size: usize,
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u32,
}

fn default_resolve_page_size() -> usize {
    DEFAULT_RESOLVE_PAGE_SIZE
}

fn default_max_blob_size() -> u32 {
    DEFAULT_MAX_BLOB_SIZE
}

impl DepotConfig {
    pub fn new(tablet_id: TabletId, channels: Vec<ChannelProfile>) -> Self {
        Self {
            tablet_id,
            operation_mode: OperationMode::VirtualGroup,
            channels,
            decommission_group: None,
            resolve_page_size: DEFAULT_RESOLVE_PAGE_SIZE,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
        }
    }

    /// Convenience layout: two system channels on `system_group`, then one
    /// data channel per entry of `data_groups`.
    pub fn with_data_groups(tablet_id: TabletId, system_group: GroupId, data_groups: &[GroupId]) -> Self {
        let mut channels = vec![
            ChannelProfile {
                channel: 0,
                kind: ChannelKind::System,
                group_id: system_group,
            },
            ChannelProfile {
                channel: 1,
                kind: ChannelKind::System,
                group_id: system_group,
            },
        ];
        for (idx, group_id) in data_groups.iter().enumerate() {
            channels.push(ChannelProfile {
                channel: 2 + idx as u8,
                kind: ChannelKind::Data,
                group_id: *group_id,
            });
        }
        Self::new(tablet_id, channels)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.tablet_id != 0, "depot tablet id must be non-zero");
        anyhow::ensure!(self.resolve_page_size > 0, "resolve page size must be positive");
        let mut seen = std::collections::BTreeSet::new();
        for profile in &self.channels {
            anyhow::ensure!(
                seen.insert(profile.channel),
                "channel {} configured twice",
                profile.channel
            );
        }
        Ok(())
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fills_defaults() {
        let cfg = DepotConfig::decode(
            br#"{"tablet_id":72,"channels":[{"channel":2,"kind":"Data","group_id":7}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.operation_mode, OperationMode::VirtualGroup);
        assert_eq!(cfg.decommission_group, None);
        assert_eq!(cfg.resolve_page_size, DEFAULT_RESOLVE_PAGE_SIZE);
        assert_eq!(cfg.channels.len(), 1);
    }

    #[test]
    fn validate_rejects_duplicate_channels() {
        let mut cfg = DepotConfig::with_data_groups(72, 1, &[7]);
        cfg.channels.push(cfg.channels[2]);
        assert!(cfg.validate().is_err());
    }
}
