//! Local id caches, one per channel kind.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::depot::{BlobSeqId, ChannelGroup, Generation, GivenIdRange, GivenRange, GroupId};

use super::requests::QueryId;

#[derive(Debug, Default)]
pub(super) struct KindCache {
    pub(super) channels: Vec<ChannelGroup>,
    given: BTreeMap<u8, GivenIdRange>,
    pub(super) alloc_in_flight: bool,
    /// Queries parked until the next refill.
    pub(super) waiters: VecDeque<QueryId>,
    /// Ids handed to writes that are neither committed nor discarded.
    pub(super) writes_in_flight: BTreeSet<BlobSeqId>,
}

impl KindCache {
    pub(super) fn new(channels: Vec<ChannelGroup>) -> Self {
        Self {
            channels,
            ..Self::default()
        }
    }

    pub(super) fn available(&self) -> u64 {
        self.given.values().map(GivenIdRange::num_points).sum()
    }

    pub(super) fn add_ranges(&mut self, ranges: &[GivenRange]) {
        for run in ranges {
            let range = self.given.entry(run.channel).or_default();
            if let Err(err) = range.issue_new_range(run.begin, run.end) {
                tracing::error!(error = ?err, channel = run.channel, "allocated range overlaps cache");
            }
        }
    }

    /// Take the lowest cached id, preferring the channel holding the most.
    pub(super) fn take(&mut self, generation: Generation) -> Option<(BlobSeqId, GroupId)> {
        let (&channel, range) = self
            .given
            .iter_mut()
            .filter(|(_, range)| !range.is_empty())
            .max_by_key(|(channel, range)| (range.num_points(), std::cmp::Reverse(**channel)))?;
        let value = range.allocate()?;
        let seq = BlobSeqId::from_sequential(channel, generation, value)?;
        let group_id = self
            .channels
            .iter()
            .find(|c| c.channel == channel)
            .map(|c| c.group_id)?;
        self.writes_in_flight.insert(seq);
        Some((seq, group_id))
    }

    /// Drop cached ids below `below` on `channel` and report the writes still
    /// holding ids there.
    pub(super) fn invalidate(&mut self, channel: u8, below: u64) -> Vec<BlobSeqId> {
        if let Some(range) = self.given.get_mut(&channel) {
            range.trim_below(below);
        }
        self.writes_in_flight
            .iter()
            .filter(|seq| seq.channel == channel && seq.to_sequential() < below)
            .copied()
            .collect()
    }

    /// Forget every cached id; used when the coordinator generation changes.
    pub(super) fn reset(&mut self, channels: Vec<ChannelGroup>) {
        self.channels = channels;
        self.given.clear();
        self.alloc_in_flight = false;
    }

    pub(super) fn needs_refill(&self, threshold: u32) -> bool {
        !self.alloc_in_flight
            && !self.channels.is_empty()
            && (!self.waiters.is_empty() || self.available() < u64::from(threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> KindCache {
        KindCache::new(vec![
            ChannelGroup {
                channel: 2,
                group_id: 7,
            },
            ChannelGroup {
                channel: 3,
                group_id: 8,
            },
        ])
    }

    #[test]
    fn take_prefers_the_fuller_channel() {
        let mut kind = cache();
        kind.add_ranges(&[
            GivenRange {
                channel: 2,
                begin: 10,
                end: 11,
            },
            GivenRange {
                channel: 3,
                begin: 40,
                end: 43,
            },
        ]);
        assert_eq!(kind.available(), 4);

        let (seq, group) = kind.take(1).unwrap();
        assert_eq!((seq.channel, seq.to_sequential(), group), (3, 40, 8));
        assert!(kind.writes_in_flight.contains(&seq));
        assert_eq!(kind.take(1).unwrap().0.to_sequential(), 41);
        // Ties go to the lower channel.
        assert_eq!(kind.take(1).unwrap().0.channel, 2);
        let (last, group) = kind.take(1).unwrap();
        assert_eq!((last.channel, last.to_sequential(), group), (3, 42, 8));
        assert!(kind.take(1).is_none());
    }

    #[test]
    fn invalidate_trims_cache_and_reports_writes_below_bound() {
        let mut kind = cache();
        kind.add_ranges(&[GivenRange {
            channel: 2,
            begin: 10,
            end: 15,
        }]);
        let (seq, _) = kind.take(1).unwrap();
        assert_eq!(seq.to_sequential(), 10);

        let in_flight = kind.invalidate(2, 13);
        assert_eq!(in_flight, vec![seq]);
        assert_eq!(kind.available(), 2);
        assert!(kind.invalidate(3, 100).is_empty());
    }

    #[test]
    fn refill_needed_for_waiters_or_low_watermark() {
        let mut kind = cache();
        assert!(!kind.needs_refill(0));
        assert!(kind.needs_refill(1));
        kind.alloc_in_flight = true;
        assert!(!kind.needs_refill(1));
        kind.alloc_in_flight = false;
        kind.waiters.push_back(3);
        assert!(kind.needs_refill(0));
        assert!(!KindCache::default().needs_refill(10));
    }
}
