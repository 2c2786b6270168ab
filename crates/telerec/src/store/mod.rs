// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent store abstraction
//!
//! The sequencer never talks to a database directly; it goes through
//! [`RecordStore`], owned exclusively by the cache engine. Calls are
//! synchronous and run on the reactor thread.
//!
//! # Implementations
//!
//! - `SqliteStore` -- Default, file-backed
//! - `MemoryStore` -- In-process, with failure injection for tests
//!
//! `FileFallback` is not a store: it only receives write batches the store
//! could not take.

pub mod fallback;
pub mod memory;
pub mod sqlite;

use std::ops::Range;

use anyhow::Result;

use crate::device::{DeviceRecord, Placeholder};
use crate::record::{Counter, DeviceId, Record, StorageKey};

pub use fallback::FileFallback;
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, StoreSchema};

/// Request for placeholder index entries of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderQuery {
    pub device_id: DeviceId,

    /// Only entries whose storage key is greater than this
    pub after_key: StorageKey,

    /// Maximum entries to return for this device
    pub limit: usize,
}

/// Persistent store trait
pub trait RecordStore {
    /// Insert in-order records as new rows.
    fn write_record_batch(&mut self, records: &[Record]) -> Result<()>;

    /// Insert one placeholder row per counter in `counters`.
    ///
    /// Rows are inserted in counter order. If an insert fails after some
    /// succeeded, the successful prefix is returned; an error is returned
    /// only when nothing was inserted.
    fn insert_placeholder_range(
        &mut self,
        device_id: DeviceId,
        counters: Range<Counter>,
    ) -> Result<Vec<Placeholder>>;

    /// Record placeholders in the placeholder index.
    fn insert_placeholder_index_entries(&mut self, entries: &[Placeholder]) -> Result<()>;

    /// Replace placeholder rows with real data.
    fn update_record_batch(&mut self, rows: &[(StorageKey, &Record)]) -> Result<()>;

    /// Remove placeholder index entries by storage key.
    fn delete_placeholder_index_batch(&mut self, keys: &[StorageKey]) -> Result<()>;

    /// Load placeholder index entries, oldest first, per query.
    fn load_placeholder_index(&mut self, queries: &[PlaceholderQuery])
        -> Result<Vec<Placeholder>>;

    /// Every registered device with its highest stored counter.
    fn load_device_registry(&mut self) -> Result<Vec<DeviceRecord>>;

    /// Drop and re-establish the underlying connection.
    fn reconnect(&mut self) -> Result<()>;
}

impl<S: RecordStore + ?Sized> RecordStore for Box<S> {
    fn write_record_batch(&mut self, records: &[Record]) -> Result<()> {
        (**self).write_record_batch(records)
    }

    fn insert_placeholder_range(
        &mut self,
        device_id: DeviceId,
        counters: Range<Counter>,
    ) -> Result<Vec<Placeholder>> {
        (**self).insert_placeholder_range(device_id, counters)
    }

    fn insert_placeholder_index_entries(&mut self, entries: &[Placeholder]) -> Result<()> {
        (**self).insert_placeholder_index_entries(entries)
    }

    fn update_record_batch(&mut self, rows: &[(StorageKey, &Record)]) -> Result<()> {
        (**self).update_record_batch(rows)
    }

    fn delete_placeholder_index_batch(&mut self, keys: &[StorageKey]) -> Result<()> {
        (**self).delete_placeholder_index_batch(keys)
    }

    fn load_placeholder_index(
        &mut self,
        queries: &[PlaceholderQuery],
    ) -> Result<Vec<Placeholder>> {
        (**self).load_placeholder_index(queries)
    }

    fn load_device_registry(&mut self) -> Result<Vec<DeviceRecord>> {
        (**self).load_device_registry()
    }

    fn reconnect(&mut self) -> Result<()> {
        (**self).reconnect()
    }
}
