// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device sequencing state.
//!
//! # Invariants
//!
//! - `last_committed` never decreases
//! - the holding area only contains counters `> last_committed`
//! - at most `max_placeholders_per_device` placeholders are kept in memory;
//!   the rest stay in the placeholder index until reloaded
//! - in-memory placeholders are always the lowest storage keys of the
//!   device's index entries, so a reload continues after the highest one

use std::collections::BTreeMap;

use serde::Serialize;

use crate::record::{Counter, DeviceId, Record, StorageKey};

/// A missing counter filled with a placeholder row, pending real data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placeholder {
    pub device_id: DeviceId,
    pub counter: Counter,

    /// Key of the placeholder row in the records table
    pub storage_key: StorageKey,

    /// Times this counter was re-requested in an ack
    pub request_count: u32,
}

impl Placeholder {
    pub fn new(device_id: DeviceId, counter: Counter, storage_key: StorageKey) -> Self {
        Self {
            device_id,
            counter,
            storage_key,
            request_count: 0,
        }
    }
}

/// Registry entry as loaded from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,

    /// Highest stored counter, 0 if none
    pub last_counter: Counter,
}

/// Sequencing state of one device.
#[derive(Debug, Default)]
pub struct DeviceState {
    pub(crate) last_committed: Counter,
    pub(crate) holding: BTreeMap<Counter, Record>,
    pub(crate) placeholders: BTreeMap<Counter, Placeholder>,

    /// The index may hold entries not loaded in memory
    pub(crate) backlog: bool,
}

impl DeviceState {
    /// A state whose placeholders still have to be loaded.
    pub fn new(last_committed: Counter) -> Self {
        Self {
            last_committed,
            backlog: true,
            ..Default::default()
        }
    }

    pub fn last_committed(&self) -> Counter {
        self.last_committed
    }

    pub fn holding_len(&self) -> usize {
        self.holding.len()
    }

    pub fn holding_min(&self) -> Option<Counter> {
        self.holding.keys().next().copied()
    }

    pub fn held_counters(&self) -> Vec<Counter> {
        self.holding.keys().copied().collect()
    }

    pub fn placeholder(&self, counter: Counter) -> Option<&Placeholder> {
        self.placeholders.get(&counter)
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.placeholders.values()
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholders.len()
    }

    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    /// Highest storage key among in-memory placeholders, 0 if none.
    pub fn max_placeholder_key(&self) -> StorageKey {
        self.placeholders
            .values()
            .map(|p| p.storage_key)
            .max()
            .unwrap_or(0)
    }

    /// Take the held record for `last_committed + 1`, advancing the counter.
    pub(crate) fn pop_contiguous(&mut self) -> Option<Record> {
        let next = self.last_committed.checked_add(1)?;
        let record = self.holding.remove(&next)?;
        self.last_committed = next;
        Some(record)
    }
}

/// All known devices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a freshly loaded registry.
    pub fn from_records(records: &[DeviceRecord]) -> Self {
        let mut registry = Self::new();
        registry.merge(records);
        registry
    }

    /// Add devices that are not known yet. Known devices are left untouched.
    ///
    /// Returns how many were added.
    pub fn merge(&mut self, records: &[DeviceRecord]) -> usize {
        let mut added = 0;
        for record in records {
            self.devices.entry(record.device_id).or_insert_with(|| {
                added += 1;
                DeviceState::new(record.last_counter)
            });
        }
        added
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceState> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut DeviceState> {
        self.devices.get_mut(&id)
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &DeviceState)> {
        self.devices.iter().map(|(id, state)| (*id, state))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(counter: Counter) -> Record {
        Record::parse(&format!("1,{}", counter))
    }

    #[test]
    fn test_pop_contiguous_stops_at_gap() {
        let mut state = DeviceState::new(2);
        state.holding.insert(3, rec(3));
        state.holding.insert(4, rec(4));
        state.holding.insert(6, rec(6));

        assert_eq!(state.pop_contiguous(), Some(rec(3)));
        assert_eq!(state.pop_contiguous(), Some(rec(4)));
        assert_eq!(state.pop_contiguous(), None);
        assert_eq!(state.last_committed(), 4);
        assert_eq!(state.held_counters(), vec![6]);
    }

    #[test]
    fn test_max_placeholder_key() {
        let mut state = DeviceState::new(10);
        assert_eq!(state.max_placeholder_key(), 0);

        state.placeholders.insert(5, Placeholder::new(1, 5, 40));
        state.placeholders.insert(6, Placeholder::new(1, 6, 41));
        assert_eq!(state.max_placeholder_key(), 41);
    }

    #[test]
    fn test_merge_is_additive() {
        let mut registry = DeviceRegistry::from_records(&[DeviceRecord {
            device_id: 1,
            last_counter: 50,
        }]);
        registry.get_mut(1).unwrap().last_committed = 75;

        let added = registry.merge(&[
            DeviceRecord {
                device_id: 1,
                last_counter: 10,
            },
            DeviceRecord {
                device_id: 2,
                last_counter: 0,
            },
        ]);

        assert_eq!(added, 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().last_committed(), 75);
        assert_eq!(registry.get(2).unwrap().last_committed(), 0);

        // Devices missing from a later load are kept
        registry.merge(&[]);
        assert_eq!(registry.ids(), vec![1, 2]);
    }
}
