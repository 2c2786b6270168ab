// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device record sequencing.
//!
//! Every record is classified against the device's last committed counter
//! `L`:
//!
//! ```text
//!   C == L+1   in order   -> write cache, drain holding area, ack
//!   C >  L+1   future     -> holding area, maybe backfill, ack
//!   C <= L     past       -> replaces a placeholder row, or dropped
//! ```
//!
//! Gaps that stay open are closed by backfill: one placeholder row per
//! missing counter, re-requested in later acks until real data replaces it
//! or the request limit is reached.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use serde::Serialize;

use crate::ack::Ack;
use crate::cache::{CacheEngine, CacheStats, PendingUpdate};
use crate::config::Config;
use crate::device::DeviceRegistry;
use crate::error::Rejection;
use crate::record::{Counter, DeviceId, Record, RecordLayout};
use crate::store::{PlaceholderQuery, RecordStore};

/// Sequencing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerSettings {
    pub layout: RecordLayout,

    /// Held records that trigger a backfill
    pub holding_threshold: usize,

    pub max_placeholders_per_device: usize,

    /// Requests after which a placeholder is abandoned
    pub max_placeholder_requests: u32,
}

impl From<&Config> for SequencerSettings {
    fn from(config: &Config) -> Self {
        Self {
            layout: config.record_layout(),
            holding_threshold: config.sequencing.holding_threshold,
            max_placeholders_per_device: config.sequencing.max_placeholders_per_device,
            max_placeholder_requests: config.sequencing.max_placeholder_requests,
        }
    }
}

/// Outcome of processing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Protocol violation; the connection must be closed.
    Reject(Rejection),

    /// Accepted, nothing to send.
    Accept,

    /// Accepted; send the ack to the device.
    AcceptWithAck(Ack),
}

/// Per-device state in a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub last_committed: Counter,
    pub held: usize,
    pub placeholders: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequencerSnapshot {
    pub devices: Vec<DeviceSnapshot>,
    pub pending_writes: usize,
    pub pending_updates: usize,
    pub pending_deletes: usize,
    pub cache: CacheStats,
}

pub struct Sequencer<S> {
    settings: SequencerSettings,
    devices: DeviceRegistry,
    cache: CacheEngine<S>,
}

impl<S: RecordStore> Sequencer<S> {
    pub fn new(settings: SequencerSettings, cache: CacheEngine<S>) -> Self {
        Self {
            settings,
            devices: DeviceRegistry::new(),
            cache,
        }
    }

    /// Load the device registry and each device's placeholders.
    pub fn initialize(&mut self) -> Result<()> {
        let records = self.cache.store_mut().load_device_registry()?;
        self.devices = DeviceRegistry::from_records(&records);

        let ids = self.devices.ids();
        self.reload_placeholders(&ids);

        let placeholders: usize = self.devices.iter().map(|(_, s)| s.placeholder_count()).sum();
        tracing::info!(
            devices = self.devices.len(),
            placeholders,
            "device registry loaded"
        );
        Ok(())
    }

    /// Merge newly registered devices. Known devices are not touched.
    pub fn reload_devices(&mut self) -> Result<usize> {
        let records = self.cache.store_mut().load_device_registry()?;
        let added = self.devices.merge(&records);

        let backlog: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, state)| state.has_backlog())
            .map(|(id, _)| id)
            .collect();
        self.reload_placeholders(&backlog);

        if added > 0 {
            tracing::info!(added, total = self.devices.len(), "new devices registered");
        }
        Ok(added)
    }

    /// Process one textual record.
    pub fn process(&mut self, line: &str) -> Verdict {
        self.process_record(Record::parse(line))
    }

    pub fn process_record(&mut self, record: Record) -> Verdict {
        let (device_id, counter) = match self.settings.layout.identify(&record) {
            Ok(ids) => ids,
            Err(rejection) => return Verdict::Reject(rejection),
        };

        let Some(state) = self.devices.get(device_id) else {
            return Verdict::Reject(Rejection::UnknownDevice(device_id));
        };

        let last = match state.last_committed() {
            0 => counter.saturating_sub(1),
            last => last,
        };

        // Nothing follows u64::MAX, so once it is committed every counter is past
        let Some(next) = last.checked_add(1) else {
            return self.accept_past(device_id, counter, record);
        };

        match counter.cmp(&next) {
            std::cmp::Ordering::Equal => self.accept_in_order(device_id, counter, record),
            std::cmp::Ordering::Greater => self.accept_future(device_id, counter, record),
            std::cmp::Ordering::Less => self.accept_past(device_id, counter, record),
        }
    }

    fn accept_in_order(&mut self, device_id: DeviceId, counter: Counter, record: Record) -> Verdict {
        let Some(state) = self.devices.get_mut(device_id) else {
            return Verdict::Reject(Rejection::UnknownDevice(device_id));
        };
        let replaying = !state.holding.is_empty();
        state.holding.remove(&counter);
        state.last_committed = counter;

        self.cache.push_write(record);
        if self.cache.write_due() {
            self.cache.flush_writes();
        }
        self.drain_holding(device_id);

        if replaying {
            Verdict::Accept
        } else {
            Verdict::AcceptWithAck(self.compute_ack(device_id))
        }
    }

    fn accept_future(&mut self, device_id: DeviceId, counter: Counter, record: Record) -> Verdict {
        let Some(state) = self.devices.get_mut(device_id) else {
            return Verdict::Reject(Rejection::UnknownDevice(device_id));
        };
        state.holding.insert(counter, record);

        if state.holding.len() >= self.settings.holding_threshold {
            self.backfill(device_id);
        }
        Verdict::AcceptWithAck(self.compute_ack(device_id))
    }

    fn accept_past(&mut self, device_id: DeviceId, counter: Counter, record: Record) -> Verdict {
        let placeholder = self
            .devices
            .get(device_id)
            .and_then(|state| state.placeholder(counter));

        match placeholder {
            Some(p) => {
                let key = p.storage_key;
                self.cache.queue_update(
                    key,
                    PendingUpdate {
                        device_id,
                        counter,
                        record,
                    },
                );
            }
            None => tracing::debug!(device_id, counter, "duplicate record dropped"),
        }
        Verdict::Accept
    }

    /// Move the contiguous prefix of the holding area into the write cache.
    fn drain_holding(&mut self, device_id: DeviceId) -> usize {
        let mut drained = 0;
        while let Some(record) = self
            .devices
            .get_mut(device_id)
            .and_then(|state| state.pop_contiguous())
        {
            self.cache.push_write(record);
            drained += 1;
            if self.cache.write_due() {
                self.cache.flush_writes();
            }
        }
        drained
    }

    /// Ack for the device's current state. Resolves pending placeholder
    /// updates first so resolved counters are not requested again.
    fn compute_ack(&mut self, device_id: DeviceId) -> Ack {
        self.flush_updates();

        let max_requests = self.settings.max_placeholder_requests;
        let Some(state) = self.devices.get_mut(device_id) else {
            return Ack::new(0, 0);
        };

        let mut run: Vec<Counter> = Vec::new();
        for &counter in state.placeholders.keys() {
            match run.last() {
                Some(&prev) if counter != prev + 1 => break,
                _ => run.push(counter),
            }
        }

        let Some(&start) = run.first() else {
            let last = state.last_committed;
            return match state.holding_min() {
                Some(min) => Ack::new(last + 1, min - last - 1),
                None => Ack::new(last, 0),
            };
        };

        let mut abandoned = 0;
        for counter in &run {
            let Some(placeholder) = state.placeholders.get_mut(counter) else {
                continue;
            };
            placeholder.request_count += 1;
            if placeholder.request_count >= max_requests {
                let key = placeholder.storage_key;
                state.placeholders.remove(counter);
                self.cache.queue_delete(key);
                abandoned += 1;
            }
        }

        if abandoned > 0 {
            tracing::info!(device_id, abandoned, "placeholders abandoned after max requests");
            self.cache.flush_deletes();
            self.reload_placeholders(&[device_id]);
        }

        Ack::new(start, run.len() as u64)
    }

    /// Apply queued placeholder updates and retire their index entries.
    fn flush_updates(&mut self) -> bool {
        let Some(applied) = self.cache.flush_updates() else {
            return false;
        };
        if applied.is_empty() {
            return true;
        }

        let mut reload = BTreeSet::new();
        for (key, update) in applied {
            self.cache.queue_delete(key);
            let Some(state) = self.devices.get_mut(update.device_id) else {
                continue;
            };
            if state
                .placeholder(update.counter)
                .is_some_and(|p| p.storage_key == key)
            {
                state.placeholders.remove(&update.counter);
            }
            if state.backlog {
                reload.insert(update.device_id);
            }
        }

        self.cache.flush_deletes();
        if !reload.is_empty() {
            let ids: Vec<DeviceId> = reload.into_iter().collect();
            self.reload_placeholders(&ids);
        }
        true
    }

    /// Top up in-memory placeholders from the index, up to the cap.
    fn reload_placeholders(&mut self, device_ids: &[DeviceId]) {
        let cap = self.settings.max_placeholders_per_device;
        let queries: Vec<PlaceholderQuery> = device_ids
            .iter()
            .filter_map(|&device_id| {
                let state = self.devices.get(device_id)?;
                let room = cap.saturating_sub(state.placeholder_count());
                (room > 0).then(|| PlaceholderQuery {
                    device_id,
                    after_key: state.max_placeholder_key(),
                    limit: room,
                })
            })
            .collect();
        if queries.is_empty() {
            return;
        }

        let entries = match self.cache.store_mut().load_placeholder_index(&queries) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(devices = queries.len(), error = %e, "placeholder reload failed");
                return;
            }
        };

        let mut loaded: HashMap<DeviceId, usize> = HashMap::new();
        for entry in entries {
            *loaded.entry(entry.device_id).or_default() += 1;
            if self.cache.is_delete_pending(entry.storage_key) {
                continue;
            }
            if let Some(state) = self.devices.get_mut(entry.device_id) {
                state.placeholders.entry(entry.counter).or_insert(entry);
            }
        }

        for query in &queries {
            if let Some(state) = self.devices.get_mut(query.device_id) {
                state.backlog = loaded.get(&query.device_id).copied().unwrap_or(0) >= query.limit;
            }
        }
    }

    /// Fill the gap below the holding area's minimum with placeholders,
    /// then drain what became contiguous. Returns placeholders inserted.
    pub fn backfill(&mut self, device_id: DeviceId) -> usize {
        let Some(state) = self.devices.get(device_id) else {
            return 0;
        };
        let Some(min) = state.holding_min() else {
            return 0;
        };
        let first = state.last_committed + 1;

        if !self.cache.flush_writes() {
            tracing::warn!(device_id, "backfill postponed, write cache not flushed");
            return 0;
        }

        let inserted = if first < min {
            match self
                .cache
                .store_mut()
                .insert_placeholder_range(device_id, first..min)
            {
                Ok(inserted) => inserted,
                Err(e) => {
                    tracing::warn!(device_id, first, end = min, error = %e, "placeholder insert failed");
                    return 0;
                }
            }
        } else {
            Vec::new()
        };

        if !inserted.is_empty() {
            if let Err(e) = self
                .cache
                .store_mut()
                .insert_placeholder_index_entries(&inserted)
            {
                tracing::error!(device_id, count = inserted.len(), error = %e, "placeholder index insert failed");
            }
        }

        let count = inserted.len();
        let cap = self.settings.max_placeholders_per_device;
        let mut reload = false;
        if let Some(state) = self.devices.get_mut(device_id) {
            if let Some(last) = inserted.last() {
                state.last_committed = state.last_committed.max(last.counter);
            }
            if state.backlog {
                reload = true;
            } else {
                let room = cap.saturating_sub(state.placeholders.len());
                state.backlog = count > room;
                for placeholder in inserted.into_iter().take(room) {
                    state.placeholders.insert(placeholder.counter, placeholder);
                }
            }
        }
        if reload {
            self.reload_placeholders(&[device_id]);
        }

        let drained = self.drain_holding(device_id);
        tracing::debug!(device_id, placeholders = count, drained, "backfill done");
        count
    }

    /// Backfill every device with held records.
    pub fn backfill_all(&mut self) -> usize {
        let pending: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, state)| state.holding_len() > 0)
            .map(|(id, _)| id)
            .collect();

        pending.into_iter().map(|id| self.backfill(id)).sum()
    }

    /// Flush caches past their threshold, or all of them when `force`.
    pub fn flush_caches(&mut self, force: bool) {
        if force || self.cache.write_due() {
            self.cache.flush_writes();
        }
        if force || self.cache.update_due() {
            self.flush_updates();
        }
        if force || self.cache.delete_due() {
            self.cache.flush_deletes();
        }
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn cache(&self) -> &CacheEngine<S> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CacheEngine<S> {
        &mut self.cache
    }

    pub fn snapshot(&self) -> SequencerSnapshot {
        SequencerSnapshot {
            devices: self
                .devices
                .iter()
                .map(|(device_id, state)| DeviceSnapshot {
                    device_id,
                    last_committed: state.last_committed(),
                    held: state.holding_len(),
                    placeholders: state.placeholder_count(),
                })
                .collect(),
            pending_writes: self.cache.pending_writes(),
            pending_updates: self.cache.pending_updates(),
            pending_deletes: self.cache.pending_deletes(),
            cache: self.cache.stats().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::record::{Column, ColumnKind};
    use crate::store::{FileFallback, MemoryStore};

    fn layout() -> RecordLayout {
        RecordLayout::new(
            0,
            1,
            &[
                Column::new("device_id", ColumnKind::Integer, 0),
                Column::new("counter", ColumnKind::Integer, 1),
            ],
        )
    }

    fn sequencer(store: &MemoryStore) -> Sequencer<MemoryStore> {
        let cache = CacheEngine::new(
            store.clone(),
            FileFallback::new("unused"),
            CacheSettings {
                write_threshold: 1000,
                write_hard_limit: 10_000,
                update_threshold: 1000,
                delete_threshold: 1000,
                write_failure_limit: 3,
            },
        );
        let mut seq = Sequencer::new(
            SequencerSettings {
                layout: layout(),
                holding_threshold: 4,
                max_placeholders_per_device: 10,
                max_placeholder_requests: 3,
            },
            cache,
        );
        seq.initialize().unwrap();
        seq
    }

    fn ack(start: Counter, count: u64) -> Verdict {
        Verdict::AcceptWithAck(Ack::new(start, count))
    }

    fn registered(ids: &[DeviceId]) -> MemoryStore {
        let store = MemoryStore::new(layout());
        for id in ids {
            store.register_device(*id);
        }
        store
    }

    #[test]
    fn test_first_record_is_in_order() {
        let store = registered(&[1]);
        let mut seq = sequencer(&store);

        assert_eq!(seq.process("1,500,x"), ack(500, 0));
        assert_eq!(seq.devices().get(1).unwrap().last_committed(), 500);
    }

    #[test]
    fn test_future_then_fill() {
        let store = registered(&[1]);
        let mut seq = sequencer(&store);

        assert_eq!(seq.process("1,1"), ack(1, 0));
        assert_eq!(seq.process("1,2"), ack(2, 0));
        assert_eq!(seq.process("1,5"), ack(3, 2));
        assert_eq!(seq.process("1,4"), ack(3, 1));
        assert_eq!(seq.process("1,3"), Verdict::Accept);

        let state = seq.devices().get(1).unwrap();
        assert_eq!(state.last_committed(), 5);
        assert_eq!(state.holding_len(), 0);

        seq.flush_caches(true);
        assert_eq!(store.stored_counters(1), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rejections() {
        let store = registered(&[1]);
        let mut seq = sequencer(&store);

        assert_eq!(
            seq.process("9,1"),
            Verdict::Reject(Rejection::UnknownDevice(9))
        );
        assert!(matches!(
            seq.process("1"),
            Verdict::Reject(Rejection::TooFewFields { .. })
        ));
        assert!(matches!(
            seq.process("1,x"),
            Verdict::Reject(Rejection::MalformedCounter(_))
        ));
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let store = registered(&[1]);
        let mut seq = sequencer(&store);

        seq.process("1,1");
        seq.process("1,2");
        assert_eq!(seq.process("1,1"), Verdict::Accept);
        seq.flush_caches(true);
        assert_eq!(store.stored_counters(1), vec![1, 2]);
    }

    #[test]
    fn test_threshold_backfill_requests_placeholders() {
        let store = registered(&[1]);
        let mut seq = sequencer(&store);

        seq.process("1,1");
        seq.process("1,10");
        seq.process("1,11");
        seq.process("1,12");
        // Fourth held record reaches the threshold
        assert_eq!(seq.process("1,13"), ack(2, 8));

        let state = seq.devices().get(1).unwrap();
        assert_eq!(state.last_committed(), 13);
        assert_eq!(state.placeholder_count(), 8);
        assert_eq!(store.placeholder_index().len(), 8);
    }

    #[test]
    fn test_late_record_replaces_placeholder() {
        let store = registered(&[1]);
        let mut seq = sequencer(&store);

        seq.process("1,1");
        seq.process("1,3");
        assert_eq!(seq.backfill(1), 1);
        let key = seq.devices().get(1).unwrap().placeholder(2).unwrap().storage_key;

        assert_eq!(seq.process("1,2,late"), Verdict::Accept);
        assert_eq!(seq.cache().pending_updates(), 1);

        seq.flush_caches(true);
        assert!(seq.devices().get(1).unwrap().placeholder(2).is_none());
        assert!(store.placeholder_index().is_empty());

        let rows = store.rows_for(1);
        let row = rows.iter().find(|(k, _)| *k == key).unwrap();
        assert_eq!(row.1.record, Some(Record::parse("1,2,late")));
    }

    #[test]
    fn test_abandon_after_max_requests() {
        let store = registered(&[1]);
        let mut seq = sequencer(&store);

        seq.process("1,1");
        seq.process("1,4");
        seq.backfill(1);
        assert_eq!(seq.devices().get(1).unwrap().placeholder_count(), 2);

        // Each ack requests the placeholder run again
        assert_eq!(seq.process("1,5"), ack(2, 2));
        assert_eq!(seq.process("1,6"), ack(2, 2));
        assert_eq!(seq.process("1,7"), ack(2, 2));

        let state = seq.devices().get(1).unwrap();
        assert_eq!(state.placeholder_count(), 0);
        assert!(store.placeholder_index().is_empty());
        assert_eq!(seq.process("1,8"), ack(8, 0));
    }

    #[test]
    fn test_initialize_restores_state() {
        let store = registered(&[1]);
        {
            let mut seq = sequencer(&store);
            seq.process("1,1");
            seq.process("1,5");
            seq.backfill(1);
            seq.flush_caches(true);
        }

        let seq = sequencer(&store);
        let state = seq.devices().get(1).unwrap();
        assert_eq!(state.last_committed(), 5);
        assert_eq!(state.placeholder_count(), 3);
        assert!(!state.has_backlog());
    }

    #[test]
    fn test_reload_devices_is_additive() {
        let store = registered(&[1]);
        let mut seq = sequencer(&store);
        seq.process("1,7");

        store.register_device(2);
        assert_eq!(seq.reload_devices().unwrap(), 1);
        assert_eq!(seq.devices().get(1).unwrap().last_committed(), 7);
        assert_eq!(seq.process("2,1"), ack(1, 0));
    }

    #[test]
    fn test_snapshot() {
        let store = registered(&[1, 2]);
        let mut seq = sequencer(&store);
        seq.process("1,1");
        seq.process("1,3");

        let snapshot = seq.snapshot();
        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(snapshot.devices[0].held, 1);
        assert_eq!(snapshot.pending_writes, 1);
    }
}
