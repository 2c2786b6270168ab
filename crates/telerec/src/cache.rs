// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write, update and delete caches in front of the store.
//!
//! Three queues batch store traffic:
//!
//! - write cache: in-order records waiting for insertion
//! - update cache: late records replacing placeholder rows, keyed by
//!   storage key
//! - delete cache: placeholder index entries to drop
//!
//! Only write failures escalate. After `write_failure_limit` consecutive
//! failures the store connection is re-established, and once the write
//! cache reaches `write_hard_limit` it is spilled to the file fallback and
//! cleared whatever the store's health. Failed updates and deletes stay
//! queued for the next trigger.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::Config;
use crate::record::{Counter, DeviceId, Record, StorageKey};
use crate::store::{FileFallback, RecordStore};

/// Flush thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub write_threshold: usize,
    pub write_hard_limit: usize,
    pub update_threshold: usize,
    pub delete_threshold: usize,
    pub write_failure_limit: u32,
}

impl From<&Config> for CacheSettings {
    fn from(config: &Config) -> Self {
        Self {
            write_threshold: config.cache.write_threshold,
            write_hard_limit: config.cache.write_hard_limit,
            update_threshold: config.cache.update_threshold,
            delete_threshold: config.cache.delete_threshold,
            write_failure_limit: config.cache.write_failure_limit,
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub batches_written: u64,
    pub records_written: u64,
    pub failed_writes: u64,
    pub reconnects: u64,
    pub fallback_spills: u64,
    pub records_spilled: u64,
    pub updates_flushed: u64,
    pub deletes_flushed: u64,
    pub failed_updates: u64,
    pub failed_deletes: u64,
}

/// A late record waiting to overwrite its placeholder row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub device_id: DeviceId,
    pub counter: Counter,
    pub record: Record,
}

/// Owns the store and the three caches.
pub struct CacheEngine<S> {
    store: S,
    fallback: FileFallback,
    settings: CacheSettings,
    writes: Vec<Record>,
    updates: BTreeMap<StorageKey, PendingUpdate>,
    deletes: Vec<StorageKey>,
    consecutive_failures: u32,
    stats: CacheStats,
}

impl<S: RecordStore> CacheEngine<S> {
    pub fn new(store: S, fallback: FileFallback, settings: CacheSettings) -> Self {
        Self {
            store,
            fallback,
            settings,
            writes: Vec::new(),
            updates: BTreeMap::new(),
            deletes: Vec::new(),
            consecutive_failures: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn push_write(&mut self, record: Record) {
        self.writes.push(record);
    }

    pub fn write_due(&self) -> bool {
        self.writes.len() >= self.settings.write_threshold
    }

    /// Insert the write cache as one batch.
    ///
    /// Returns true when the write cache is empty afterwards.
    pub fn flush_writes(&mut self) -> bool {
        if self.writes.is_empty() {
            return true;
        }

        match self.store.write_record_batch(&self.writes) {
            Ok(()) => {
                self.stats.batches_written += 1;
                self.stats.records_written += self.writes.len() as u64;
                tracing::debug!(records = self.writes.len(), "write batch stored");
                self.writes.clear();
                self.consecutive_failures = 0;
                true
            }
            Err(e) => {
                self.stats.failed_writes += 1;
                self.consecutive_failures += 1;
                tracing::warn!(
                    records = self.writes.len(),
                    consecutive = self.consecutive_failures,
                    error = %e,
                    "write batch failed"
                );

                if self.consecutive_failures >= self.settings.write_failure_limit {
                    self.consecutive_failures = 0;
                    self.stats.reconnects += 1;
                    match self.store.reconnect() {
                        Ok(()) => tracing::info!("store reconnected after repeated write failures"),
                        Err(e) => tracing::error!(error = %e, "store reconnect failed"),
                    }
                }

                if self.writes.len() >= self.settings.write_hard_limit {
                    self.spill();
                    return true;
                }
                false
            }
        }
    }

    fn spill(&mut self) {
        let count = self.writes.len();
        match self.fallback.append_batch(&self.writes) {
            Ok(path) => {
                self.stats.fallback_spills += 1;
                self.stats.records_spilled += count as u64;
                tracing::warn!(records = count, path = %path.display(), "write cache spilled to file");
            }
            Err(e) => {
                tracing::error!(records = count, error = %e, "file fallback failed, records dropped");
            }
        }
        self.writes.clear();
    }

    /// Queue a placeholder overwrite. A later record for the same key wins.
    pub fn queue_update(&mut self, key: StorageKey, update: PendingUpdate) {
        self.updates.insert(key, update);
    }

    pub fn update_due(&self) -> bool {
        self.updates.len() >= self.settings.update_threshold
    }

    /// Apply every queued update.
    ///
    /// Returns the applied entries, or `None` if the store refused the batch
    /// (the entries stay queued).
    pub fn flush_updates(&mut self) -> Option<Vec<(StorageKey, PendingUpdate)>> {
        if self.updates.is_empty() {
            return Some(Vec::new());
        }

        let rows: Vec<(StorageKey, &Record)> = self
            .updates
            .iter()
            .map(|(key, update)| (*key, &update.record))
            .collect();

        match self.store.update_record_batch(&rows) {
            Ok(()) => {
                let applied: Vec<_> = std::mem::take(&mut self.updates).into_iter().collect();
                self.stats.updates_flushed += applied.len() as u64;
                tracing::debug!(rows = applied.len(), "placeholder rows replaced");
                Some(applied)
            }
            Err(e) => {
                self.stats.failed_updates += 1;
                tracing::warn!(rows = rows.len(), error = %e, "update batch failed");
                None
            }
        }
    }

    pub fn queue_delete(&mut self, key: StorageKey) {
        if !self.deletes.contains(&key) {
            self.deletes.push(key);
        }
    }

    pub fn delete_due(&self) -> bool {
        self.deletes.len() >= self.settings.delete_threshold
    }

    pub fn is_delete_pending(&self, key: StorageKey) -> bool {
        self.deletes.contains(&key)
    }

    /// Returns true when the delete cache is empty afterwards.
    pub fn flush_deletes(&mut self) -> bool {
        if self.deletes.is_empty() {
            return true;
        }

        match self.store.delete_placeholder_index_batch(&self.deletes) {
            Ok(()) => {
                self.stats.deletes_flushed += self.deletes.len() as u64;
                self.deletes.clear();
                true
            }
            Err(e) => {
                self.stats.failed_deletes += 1;
                tracing::warn!(keys = self.deletes.len(), error = %e, "delete batch failed");
                false
            }
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    pub fn pending_deletes(&self) -> usize {
        self.deletes.len()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}
