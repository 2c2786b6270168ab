// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory store backend
//!
//! Mirrors the SQLite backend's semantics without a database. Handles are
//! cheap clones sharing one state, so a test can keep a handle for
//! inspection and failure injection after handing another to the service.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::rc::Rc;

use anyhow::{bail, Result};

use super::{PlaceholderQuery, RecordStore};
use crate::device::{DeviceRecord, Placeholder};
use crate::record::{Counter, DeviceId, Record, RecordLayout, StorageKey};

/// One row of the records table. `record` is `None` for a placeholder row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub device_id: DeviceId,
    pub counter: Counter,
    pub record: Option<Record>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<StorageKey, StoredRow>,
    index: BTreeMap<StorageKey, Placeholder>,
    devices: BTreeSet<DeviceId>,
    next_key: StorageKey,

    fail_writes: bool,
    fail_updates: bool,
    fail_deletes: bool,

    /// Placeholder rows accepted before inserts start failing
    placeholder_budget: Option<usize>,

    write_attempts: u64,
    reconnects: u64,
}

/// In-memory record store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    layout: RecordLayout,
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryStore {
    pub fn new(layout: RecordLayout) -> Self {
        Self {
            layout,
            state: Rc::new(RefCell::new(MemoryState {
                next_key: 1,
                ..Default::default()
            })),
        }
    }

    pub fn register_device(&self, device_id: DeviceId) {
        self.state.borrow_mut().devices.insert(device_id);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.state.borrow_mut().fail_updates = fail;
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.state.borrow_mut().fail_deletes = fail;
    }

    /// Let only `budget` more placeholder rows succeed. `None` lifts the limit.
    pub fn set_placeholder_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().placeholder_budget = budget;
    }

    /// Rows of one device ordered by storage key.
    pub fn rows_for(&self, device_id: DeviceId) -> Vec<(StorageKey, StoredRow)> {
        self.state
            .borrow()
            .rows
            .iter()
            .filter(|(_, row)| row.device_id == device_id)
            .map(|(key, row)| (*key, row.clone()))
            .collect()
    }

    /// Counters of one device's rows that hold real data, in insertion order.
    pub fn stored_counters(&self, device_id: DeviceId) -> Vec<Counter> {
        self.rows_for(device_id)
            .into_iter()
            .filter(|(_, row)| row.record.is_some())
            .map(|(_, row)| row.counter)
            .collect()
    }

    /// Placeholder index entries ordered by storage key.
    pub fn placeholder_index(&self) -> Vec<Placeholder> {
        self.state.borrow().index.values().cloned().collect()
    }

    pub fn row_count(&self) -> usize {
        self.state.borrow().rows.len()
    }

    pub fn write_attempts(&self) -> u64 {
        self.state.borrow().write_attempts
    }

    pub fn reconnects(&self) -> u64 {
        self.state.borrow().reconnects
    }
}

impl RecordStore for MemoryStore {
    fn write_record_batch(&mut self, records: &[Record]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.write_attempts += 1;
        if state.fail_writes {
            bail!("write failure injected");
        }

        for record in records {
            let (device_id, counter) = self.layout.identify(record)?;
            let key = state.next_key;
            state.next_key += 1;
            state.rows.insert(
                key,
                StoredRow {
                    device_id,
                    counter,
                    record: Some(record.clone()),
                },
            );
        }
        Ok(())
    }

    fn insert_placeholder_range(
        &mut self,
        device_id: DeviceId,
        counters: Range<Counter>,
    ) -> Result<Vec<Placeholder>> {
        let mut state = self.state.borrow_mut();
        let mut inserted = Vec::new();

        for counter in counters {
            match state.placeholder_budget {
                Some(0) if inserted.is_empty() => bail!("placeholder insert failure injected"),
                Some(0) => break,
                Some(ref mut n) => *n -= 1,
                None => {}
            }

            let key = state.next_key;
            state.next_key += 1;
            state.rows.insert(
                key,
                StoredRow {
                    device_id,
                    counter,
                    record: None,
                },
            );
            inserted.push(Placeholder::new(device_id, counter, key));
        }
        Ok(inserted)
    }

    fn insert_placeholder_index_entries(&mut self, entries: &[Placeholder]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for entry in entries {
            state.index.insert(entry.storage_key, entry.clone());
        }
        Ok(())
    }

    fn update_record_batch(&mut self, rows: &[(StorageKey, &Record)]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_updates {
            bail!("update failure injected");
        }

        for (key, record) in rows {
            if let Some(row) = state.rows.get_mut(key) {
                row.record = Some((*record).clone());
            }
        }
        Ok(())
    }

    fn delete_placeholder_index_batch(&mut self, keys: &[StorageKey]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_deletes {
            bail!("delete failure injected");
        }

        for key in keys {
            state.index.remove(key);
        }
        Ok(())
    }

    fn load_placeholder_index(
        &mut self,
        queries: &[PlaceholderQuery],
    ) -> Result<Vec<Placeholder>> {
        let state = self.state.borrow();
        let mut entries = Vec::new();
        for q in queries {
            entries.extend(
                state
                    .index
                    .range(q.after_key.saturating_add(1)..)
                    .map(|(_, p)| p)
                    .filter(|p| p.device_id == q.device_id)
                    .take(q.limit)
                    .cloned(),
            );
        }
        Ok(entries)
    }

    fn load_device_registry(&mut self) -> Result<Vec<DeviceRecord>> {
        let state = self.state.borrow();
        Ok(state
            .devices
            .iter()
            .map(|&device_id| DeviceRecord {
                device_id,
                last_counter: state
                    .rows
                    .values()
                    .filter(|row| row.device_id == device_id)
                    .map(|row| row.counter)
                    .max()
                    .unwrap_or(0),
            })
            .collect())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.state.borrow_mut().reconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Column, ColumnKind};

    fn store() -> MemoryStore {
        MemoryStore::new(RecordLayout::new(
            0,
            1,
            &[
                Column::new("device_id", ColumnKind::Integer, 0),
                Column::new("counter", ColumnKind::Integer, 1),
            ],
        ))
    }

    #[test]
    fn test_shared_handles() {
        let inspect = store();
        let mut handle = inspect.clone();

        handle
            .write_record_batch(&[Record::parse("3,1,a"), Record::parse("3,2,b")])
            .unwrap();

        assert_eq!(inspect.stored_counters(3), vec![1, 2]);
        assert_eq!(inspect.write_attempts(), 1);
    }

    #[test]
    fn test_failure_injection() {
        let mut store = store();
        store.set_fail_writes(true);
        assert!(store.write_record_batch(&[Record::parse("1,1")]).is_err());
        assert_eq!(store.row_count(), 0);

        store.set_fail_writes(false);
        store.write_record_batch(&[Record::parse("1,1")]).unwrap();
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_placeholder_budget_returns_prefix() {
        let mut store = store();
        store.set_placeholder_budget(Some(2));

        let inserted = store.insert_placeholder_range(1, 5..10).unwrap();
        assert_eq!(
            inserted.iter().map(|p| p.counter).collect::<Vec<_>>(),
            vec![5, 6]
        );
        assert!(store.insert_placeholder_range(1, 7..10).is_err());
    }

    #[test]
    fn test_registry_reports_highest_counter() {
        let mut store = store();
        store.register_device(8);
        store.register_device(9);
        store.write_record_batch(&[Record::parse("8,4")]).unwrap();
        store.insert_placeholder_range(8, 1..4).unwrap();

        let registry = store.load_device_registry().unwrap();
        assert_eq!(registry[0].last_counter, 4);
        assert_eq!(registry[1].last_counter, 0);
    }
}
