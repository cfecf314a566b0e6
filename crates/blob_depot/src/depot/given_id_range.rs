//! Set of sequential numbers currently on loan.
//!
//! Stored as disjoint half-open intervals keyed by their start. Adjacent
//! intervals are merged on insert so the map stays minimal.

use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GivenIdRange {
    ranges: BTreeMap<u64, u64>,
    num_points: u64,
}

impl GivenIdRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn num_points(&self) -> u64 {
        self.num_points
    }

    /// Lowest issued number, if any.
    pub fn first(&self) -> Option<u64> {
        self.ranges.keys().next().copied()
    }

    pub fn contains(&self, value: u64) -> bool {
        self.ranges
            .range(..=value)
            .next_back()
            .is_some_and(|(_, &end)| value < end)
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&begin, &end)| (begin, end))
    }

    /// Mark `[begin, end)` as issued. The interval must not overlap anything
    /// already issued.
    pub fn issue_new_range(&mut self, begin: u64, end: u64) -> anyhow::Result<()> {
        anyhow::ensure!(begin < end, "empty id range [{begin}, {end})");
        if let Some((&b, &e)) = self.ranges.range(..end).next_back() {
            anyhow::ensure!(
                e <= begin,
                "id range [{begin}, {end}) overlaps issued range [{b}, {e})"
            );
        }

        let mut start = begin;
        let mut stop = end;
        if let Some((&b, &e)) = self.ranges.range(..begin).next_back() {
            if e == begin {
                start = b;
                self.ranges.remove(&b);
            }
        }
        if let Some(next_end) = self.ranges.remove(&end) {
            stop = next_end;
        }
        self.ranges.insert(start, stop);
        self.num_points += end - begin;
        Ok(())
    }

    /// Retire one issued number. Returns `false` when `value` was not issued.
    pub fn remove_point(&mut self, value: u64) -> bool {
        let Some((&begin, &end)) = self.ranges.range(..=value).next_back() else {
            return false;
        };
        if value >= end {
            return false;
        }
        self.ranges.remove(&begin);
        if begin < value {
            self.ranges.insert(begin, value);
        }
        if value + 1 < end {
            self.ranges.insert(value + 1, end);
        }
        self.num_points -= 1;
        true
    }

    /// Remove every point of `other` that is present here.
    pub fn subtract(&mut self, other: &GivenIdRange) {
        for (begin, end) in other.ranges() {
            self.remove_range(begin, end);
        }
    }

    /// Take the lowest issued number.
    pub fn allocate(&mut self) -> Option<u64> {
        let (&begin, &end) = self.ranges.iter().next()?;
        self.ranges.remove(&begin);
        if begin + 1 < end {
            self.ranges.insert(begin + 1, end);
        }
        self.num_points -= 1;
        Some(begin)
    }

    /// Remove and return every point below `bound`.
    pub fn trim_below(&mut self, bound: u64) -> GivenIdRange {
        let mut trimmed = GivenIdRange::new();
        for (begin, end) in self.ranges() {
            if begin >= bound {
                break;
            }
            trimmed.ranges.insert(begin, end.min(bound));
            trimmed.num_points += end.min(bound) - begin;
        }
        self.remove_range(0, bound);
        trimmed
    }

    pub fn intersects(&self, other: &GivenIdRange) -> bool {
        other.ranges().any(|(begin, end)| {
            self.ranges
                .range(..end)
                .next_back()
                .is_some_and(|(_, &e)| e > begin)
        })
    }

    /// True when every point of `self` is also in `other`.
    pub fn is_subset_of(&self, other: &GivenIdRange) -> bool {
        let mut rest = self.clone();
        rest.subtract(other);
        rest.is_empty()
    }

    fn remove_range(&mut self, begin: u64, end: u64) -> u64 {
        if begin >= end {
            return 0;
        }
        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|entry| *entry.1 > begin)
            .map(|(&b, &e)| (b, e))
            .collect();

        let mut removed = 0;
        for (b, e) in overlapping {
            self.ranges.remove(&b);
            if b < begin {
                self.ranges.insert(b, begin);
            }
            if end < e {
                self.ranges.insert(end, e);
            }
            removed += e.min(end) - b.max(begin);
        }
        self.num_points -= removed;
        removed
    }
}
