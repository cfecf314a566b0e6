//! Bounded holding queue for work that arrives before it can be processed.
//!
//! Entries are dropped hard: a push that would exceed the byte cap is
//! refused, and entries older than the expiration are handed back by
//! `expire` so the caller can fail them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default byte cap of the pending queue.
pub const PENDING_QUEUE_MAX_BYTES: usize = 32 << 20;
/// Default lifetime of a pending entry.
pub const PENDING_EXPIRATION: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct PendingEntry<T> {
    item: T,
    size: usize,
    enqueued_at: Instant,
}

#[derive(Debug)]
pub struct PendingEventQueue<T> {
    entries: VecDeque<PendingEntry<T>>,
    bytes: usize,
    max_bytes: usize,
    expiration: Duration,
}

impl<T> PendingEventQueue<T> {
    pub fn new(max_bytes: usize, expiration: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            max_bytes,
            expiration,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Queue `item`, or give it back when the byte cap would be exceeded.
    pub fn push(&mut self, item: T, size: usize, now: Instant) -> Result<(), T> {
        if self.bytes.saturating_add(size) > self.max_bytes {
            return Err(item);
        }
        self.bytes += size;
        self.entries.push_back(PendingEntry {
            item,
            size,
            enqueued_at: now,
        });
        Ok(())
    }

    /// Remove and return every entry that has waited longer than the
    /// expiration.
    pub fn expire(&mut self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.enqueued_at) < self.expiration {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                self.bytes -= entry.size;
                expired.push(entry.item);
            }
        }
        expired
    }

    /// Remove the first entry matching `pred`.
    pub fn remove_first(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let index = self.entries.iter().position(|entry| pred(&entry.item))?;
        let entry = self.entries.remove(index)?;
        self.bytes -= entry.size;
        Some(entry.item)
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.bytes = 0;
        self.entries.drain(..).map(|entry| entry.item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_cap_refuses_new_entries() {
        let now = Instant::now();
        let mut queue = PendingEventQueue::new(100, PENDING_EXPIRATION);
        assert!(queue.push("a", 60, now).is_ok());
        assert_eq!(queue.push("b", 50, now), Err("b"));
        assert!(queue.push("c", 40, now).is_ok());
        assert_eq!(queue.bytes(), 100);
        assert_eq!(queue.drain(), vec!["a", "c"]);
        assert_eq!(queue.bytes(), 0);
    }

    #[test]
    fn entries_expire_in_arrival_order() {
        let start = Instant::now();
        let mut queue = PendingEventQueue::new(PENDING_QUEUE_MAX_BYTES, Duration::from_secs(5));
        queue.push(1, 10, start).unwrap();
        queue.push(2, 10, start + Duration::from_secs(3)).unwrap();

        assert!(queue.expire(start + Duration::from_secs(4)).is_empty());
        assert_eq!(queue.expire(start + Duration::from_secs(5)), vec![1]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.expire(start + Duration::from_secs(9)), vec![2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_first_releases_bytes() {
        let now = Instant::now();
        let mut queue = PendingEventQueue::new(100, PENDING_EXPIRATION);
        queue.push(1, 30, now).unwrap();
        queue.push(2, 30, now).unwrap();
        assert_eq!(queue.remove_first(|item| *item == 2), Some(2));
        assert_eq!(queue.bytes(), 30);
        assert_eq!(queue.remove_first(|item| *item == 5), None);
    }
}
