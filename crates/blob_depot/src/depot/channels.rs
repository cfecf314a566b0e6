//! Per-channel lease state owned by the coordinator.
//!
//! The registry is built once from configuration and then only mutated by the
//! coordinator's event loop. `next_seq` is monotonic for the lifetime of a
//! coordinator generation; a restart rebuilds the registry with a new
//! generation, so old-generation numbers can never collide with new ones.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::{error, warn};

use super::config::ChannelProfile;
use super::given_id_range::GivenIdRange;
use super::types::{
    BlobSeqId, ChannelGroup, ChannelKind, Generation, GivenRange, GroupId, KindLayout,
    FIRST_DATA_CHANNEL,
};

#[derive(Clone, Debug)]
pub struct Channel {
    pub index: u8,
    pub kind: ChannelKind,
    pub group_id: GroupId,
    /// Every number currently leased on this channel, by anyone.
    pub given_id_range: GivenIdRange,
    pub next_seq: u64,
}

impl Channel {
    fn new(profile: &ChannelProfile, generation: Generation) -> Self {
        let kind = if profile.channel < FIRST_DATA_CHANNEL {
            ChannelKind::System
        } else {
            profile.kind
        };
        let first = BlobSeqId {
            channel: profile.channel,
            generation,
            step: 1,
            index: 0,
        };
        Self {
            index: profile.channel,
            kind,
            group_id: profile.group_id,
            given_id_range: GivenIdRange::new(),
            next_seq: first.to_sequential(),
        }
    }

    /// Lowest number that may still turn into live data on this channel.
    pub fn least_expected_seq(&self) -> u64 {
        self.given_id_range
            .first()
            .map_or(self.next_seq, |first| first.min(self.next_seq))
    }
}

#[derive(Clone, Debug)]
pub struct ChannelRegistry {
    generation: Generation,
    channels: BTreeMap<u8, Channel>,
    /// Allocatable channels per kind, grouped by owning storage group.
    kinds: BTreeMap<ChannelKind, BTreeMap<GroupId, Vec<u8>>>,
}

impl ChannelRegistry {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            channels: BTreeMap::new(),
            kinds: BTreeMap::new(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_initialized(&self) -> bool {
        !self.channels.is_empty()
    }

    /// One-time initialization from the channel layout. Later calls are
    /// ignored; returns the number of channels created.
    pub fn initialize(&mut self, profiles: &[ChannelProfile]) -> usize {
        if self.is_initialized() {
            return 0;
        }
        for profile in profiles {
            let channel = Channel::new(profile, self.generation);
            if channel.kind != ChannelKind::System {
                self.kinds
                    .entry(channel.kind)
                    .or_default()
                    .entry(channel.group_id)
                    .or_default()
                    .push(channel.index);
            }
            self.channels.insert(channel.index, channel);
        }
        self.channels.len()
    }

    pub fn channel(&self, index: u8) -> Option<&Channel> {
        self.channels.get(&index)
    }

    pub fn channel_mut(&mut self, index: u8) -> Option<&mut Channel> {
        self.channels.get_mut(&index)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Kind → (channel, group) map handed to agents at registration.
    pub fn kind_layouts(&self) -> Vec<KindLayout> {
        self.kinds
            .iter()
            .map(|(kind, groups)| {
                let mut channels: Vec<ChannelGroup> = groups
                    .iter()
                    .flat_map(|(group_id, indexes)| {
                        indexes.iter().map(move |channel| ChannelGroup {
                            channel: *channel,
                            group_id: *group_id,
                        })
                    })
                    .collect();
                channels.sort_by_key(|c| c.channel);
                KindLayout {
                    kind: *kind,
                    channels,
                }
            })
            .collect()
    }

    /// Lease `count` fresh numbers of `kind`, coalescing consecutive draws on
    /// the same channel into one run. Every run is issued on the channel's
    /// global tracker. An unknown or empty kind yields no runs.
    pub fn allocate<R: Rng + ?Sized>(
        &mut self,
        kind: ChannelKind,
        count: u32,
        rng: &mut R,
    ) -> Vec<GivenRange> {
        let Some(groups) = self.kinds.get(&kind) else {
            return Vec::new();
        };
        let groups: Vec<Vec<u8>> = groups
            .values()
            .filter(|channels| !channels.is_empty())
            .cloned()
            .collect();
        if groups.is_empty() {
            return Vec::new();
        }

        // Uniform weights: allocation is not load-aware.
        let weights = vec![1u32; groups.len()];
        let dist = match WeightedIndex::new(&weights) {
            Ok(dist) => dist,
            Err(err) => {
                error!(error = ?err, ?kind, "channel group weights rejected");
                return Vec::new();
            }
        };

        let mut runs: Vec<GivenRange> = Vec::new();
        for _ in 0..count {
            let group = &groups[dist.sample(rng)];
            let index = group[rng.gen_range(0..group.len())];
            let Some(channel) = self.channels.get_mut(&index) else {
                continue;
            };
            let seq = channel.next_seq;
            if BlobSeqId::from_sequential(index, self.generation, seq).is_none() {
                warn!(channel = index, seq, "channel sequence space exhausted");
                continue;
            }
            channel.next_seq += 1;
            match runs.last_mut() {
                Some(last) if last.channel == index && last.end == seq => last.end += 1,
                _ => runs.push(GivenRange {
                    channel: index,
                    begin: seq,
                    end: seq + 1,
                }),
            }
        }

        for run in &runs {
            if let Some(channel) = self.channels.get_mut(&run.channel) {
                if let Err(err) = channel.given_id_range.issue_new_range(run.begin, run.end) {
                    error!(error = ?err, channel = run.channel, "fresh id range overlaps lease");
                }
            }
        }
        runs
    }

    pub fn least_expected_seq(&self, index: u8) -> Option<u64> {
        self.channels.get(&index).map(Channel::least_expected_seq)
    }
}
