// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Last-activity bookkeeping for the inactivity reaper.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use telerec_io::ConnectionId;

#[derive(Debug)]
pub struct ActivityTracker<K = ConnectionId> {
    threshold: Duration,
    last_seen: HashMap<K, Instant>,
}

impl<K: Copy + Eq + Hash + Ord> ActivityTracker<K> {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_seen: HashMap::new(),
        }
    }

    pub fn touch(&mut self, key: K, now: Instant) {
        self.last_seen.insert(key, now);
    }

    pub fn forget(&mut self, key: K) {
        self.last_seen.remove(&key);
    }

    /// Remove and return entries idle for longer than the threshold.
    pub fn expired(&mut self, now: Instant) -> Vec<K> {
        let threshold = self.threshold;
        let mut idle: Vec<K> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > threshold)
            .map(|(key, _)| *key)
            .collect();
        idle.sort();

        for key in &idle {
            self.last_seen.remove(key);
        }
        idle
    }

    /// Drop entries for keys that no longer pass `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(K) -> bool) -> usize {
        let before = self.last_seen.len();
        self.last_seen.retain(|key, _| keep(*key));
        before - self.last_seen.len()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_removes_idle_entries() {
        let start = Instant::now();
        let mut tracker = ActivityTracker::new(Duration::from_secs(10));

        tracker.touch(1u32, start);
        tracker.touch(2, start);
        tracker.touch(3, start + Duration::from_secs(8));

        assert!(tracker.expired(start + Duration::from_secs(10)).is_empty());

        let idle = tracker.expired(start + Duration::from_secs(15));
        assert_eq!(idle, vec![1, 2]);
        assert_eq!(tracker.len(), 1);

        // Already reaped
        assert!(tracker.expired(start + Duration::from_secs(15)).is_empty());
    }

    #[test]
    fn test_retain_drops_released_keys() {
        let start = Instant::now();
        let mut tracker = ActivityTracker::new(Duration::from_secs(5));
        for key in 1u32..=4 {
            tracker.touch(key, start);
        }

        // 2 and 4 were released without a disconnect notification
        assert_eq!(tracker.retain(|key| key % 2 == 1), 2);
        assert_eq!(tracker.len(), 2);
        assert_eq!(
            tracker.expired(start + Duration::from_secs(6)),
            vec![1, 3]
        );
    }

    #[test]
    fn test_touch_refreshes() {
        let start = Instant::now();
        let mut tracker = ActivityTracker::new(Duration::from_secs(5));

        tracker.touch(7u32, start);
        tracker.touch(7, start + Duration::from_secs(4));
        assert!(tracker.expired(start + Duration::from_secs(6)).is_empty());

        tracker.forget(7);
        assert!(tracker.is_empty());
    }
}
