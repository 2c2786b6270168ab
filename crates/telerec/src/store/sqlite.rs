// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite persistence backend
//!
//! # Schema
//!
//! Table names come from configuration; the records table carries one
//! column per configured record column.
//!
//! ```sql
//! CREATE TABLE records (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,   -- storage key
//!     device_id INTEGER,
//!     counter INTEGER,
//!     ...                                     -- configured columns
//! );
//! CREATE TABLE devices (device_id INTEGER PRIMARY KEY);
//! CREATE TABLE placeholders (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     device_id INTEGER NOT NULL,
//!     counter INTEGER NOT NULL,
//!     record_id INTEGER NOT NULL UNIQUE,      -- storage key of the placeholder row
//!     request_count INTEGER NOT NULL DEFAULT 0
//! );
//! ```
//!
//! Batch writes, updates and deletes each run in one transaction.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use super::{PlaceholderQuery, RecordStore};
use crate::config::Config;
use crate::device::{DeviceRecord, Placeholder};
use crate::record::{is_null_sentinel, Column, ColumnKind, Counter, DeviceId, Record, StorageKey};

/// Table and column names used by [`SqliteStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSchema {
    pub records_table: String,
    pub devices_table: String,
    pub placeholders_table: String,
    pub columns: Vec<Column>,
    pub device_column: String,
    pub counter_column: String,
}

impl StoreSchema {
    pub fn from_config(config: &Config) -> Result<Self> {
        let device = config
            .device_column()
            .ok_or_else(|| anyhow!("no column mapped at the device id position"))?;
        let counter = config
            .counter_column()
            .ok_or_else(|| anyhow!("no column mapped at the counter position"))?;

        Ok(Self {
            records_table: config.storage.records_table.clone(),
            devices_table: config.storage.devices_table.clone(),
            placeholders_table: config.storage.placeholders_table.clone(),
            columns: config.record.columns.clone(),
            device_column: device.name.clone(),
            counter_column: counter.name.clone(),
        })
    }
}

/// SQLite record store
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    schema: StoreSchema,
}

impl SqliteStore {
    /// Open (or create) a file-based database.
    pub fn open<P: AsRef<Path>>(path: P, schema: StoreSchema) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;

        let store = Self {
            conn,
            path: Some(path),
            schema,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory(schema: StoreSchema) -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;

        let store = Self {
            conn,
            path: None,
            schema,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let s = &self.schema;
        let columns: String = s
            .columns
            .iter()
            .map(|c| format!(",\n    {} {}", c.name, c.kind.sql_type()))
            .collect();

        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {records} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT{columns}
                );
                CREATE INDEX IF NOT EXISTS idx_{records}_device
                    ON {records}({device}, {counter});
                CREATE TABLE IF NOT EXISTS {devices} (
                    device_id INTEGER PRIMARY KEY
                );
                CREATE TABLE IF NOT EXISTS {placeholders} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    device_id INTEGER NOT NULL,
                    counter INTEGER NOT NULL,
                    record_id INTEGER NOT NULL UNIQUE,
                    request_count INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_{placeholders}_device
                    ON {placeholders}(device_id, record_id);",
                records = s.records_table,
                columns = columns,
                device = s.device_column,
                counter = s.counter_column,
                devices = s.devices_table,
                placeholders = s.placeholders_table,
            ))
            .context("Failed to initialize schema")?;

        Ok(())
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Add a device to the registry. Returns false if it was already there.
    pub fn register_device(&self, device_id: DeviceId) -> Result<bool> {
        let changed = self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (device_id) VALUES (?1)",
                self.schema.devices_table
            ),
            params![device_id],
        )?;
        Ok(changed > 0)
    }

    /// Rows in the records table, placeholders included.
    pub fn record_count(&self) -> Result<u64> {
        self.count(&self.schema.records_table)
    }

    /// Entries in the placeholder index.
    pub fn placeholder_count(&self) -> Result<u64> {
        self.count(&self.schema.placeholders_table)
    }

    fn count(&self, table: &str) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?;
        Ok(n as u64)
    }

    fn insert_sql(&self) -> String {
        let names: Vec<&str> = self.schema.columns.iter().map(|c| c.name.as_str()).collect();
        let slots: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.schema.records_table,
            names.join(", "),
            slots.join(", ")
        )
    }

    fn update_sql(&self) -> String {
        let sets: Vec<String> = self
            .schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c.name, i + 1))
            .collect();
        format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            self.schema.records_table,
            sets.join(", "),
            self.schema.columns.len() + 1
        )
    }

    fn row_values<'a>(columns: &'a [Column], record: &'a Record) -> impl Iterator<Item = Value> + 'a {
        columns
            .iter()
            .map(move |c| column_value(c.kind, record.field(c.position)))
    }
}

/// Typed SQLite value for one field.
///
/// Null sentinels and missing fields become NULL. Values that do not parse
/// as the column type are stored as text.
pub(crate) fn column_value(kind: ColumnKind, raw: Option<&str>) -> Value {
    let Some(raw) = raw.filter(|v| !is_null_sentinel(v)) else {
        return Value::Null;
    };
    match kind {
        ColumnKind::Integer => raw
            .parse::<i64>()
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        ColumnKind::Real => raw
            .parse::<f64>()
            .map(Value::Real)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        ColumnKind::Text | ColumnKind::DateTime => Value::Text(raw.to_string()),
    }
}

impl RecordStore for SqliteStore {
    fn write_record_batch(&mut self, records: &[Record]) -> Result<()> {
        let sql = self.insert_sql();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for record in records {
                stmt.execute(params_from_iter(Self::row_values(&self.schema.columns, record)))
                    .with_context(|| format!("Failed to insert record '{}'", record))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_placeholder_range(
        &mut self,
        device_id: DeviceId,
        counters: Range<Counter>,
    ) -> Result<Vec<Placeholder>> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
            self.schema.records_table, self.schema.device_column, self.schema.counter_column
        );

        let mut inserted = Vec::new();
        for counter in counters {
            match self.conn.execute(&sql, params![device_id, counter as i64]) {
                Ok(_) => {
                    let key = self.conn.last_insert_rowid() as StorageKey;
                    inserted.push(Placeholder::new(device_id, counter, key));
                }
                Err(e) if inserted.is_empty() => {
                    return Err(e).with_context(|| {
                        format!(
                            "Failed to insert placeholder row for device {} counter {}",
                            device_id, counter
                        )
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        device_id,
                        counter,
                        inserted = inserted.len(),
                        error = %e,
                        "placeholder range insert stopped early"
                    );
                    break;
                }
            }
        }
        Ok(inserted)
    }

    fn insert_placeholder_index_entries(&mut self, entries: &[Placeholder]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (device_id, counter, record_id, request_count)
             VALUES (?1, ?2, ?3, ?4)",
            self.schema.placeholders_table
        );
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for p in entries {
                stmt.execute(params![
                    p.device_id,
                    p.counter as i64,
                    p.storage_key as i64,
                    p.request_count
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn update_record_batch(&mut self, rows: &[(StorageKey, &Record)]) -> Result<()> {
        let sql = self.update_sql();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for (key, record) in rows {
                let values = Self::row_values(&self.schema.columns, record)
                    .chain(std::iter::once(Value::Integer(*key as i64)));
                stmt.execute(params_from_iter(values))
                    .with_context(|| format!("Failed to update row {}", key))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_placeholder_index_batch(&mut self, keys: &[StorageKey]) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE record_id = ?1",
            self.schema.placeholders_table
        );
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for key in keys {
                stmt.execute(params![*key as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_placeholder_index(
        &mut self,
        queries: &[PlaceholderQuery],
    ) -> Result<Vec<Placeholder>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT device_id, counter, record_id, request_count
             FROM {}
             WHERE device_id = ?1 AND record_id > ?2
             ORDER BY id ASC
             LIMIT ?3",
            self.schema.placeholders_table
        ))?;

        let mut entries = Vec::new();
        for q in queries {
            let rows = stmt.query_map(
                params![q.device_id, q.after_key as i64, q.limit as i64],
                |row| {
                    Ok(Placeholder {
                        device_id: row.get(0)?,
                        counter: row.get::<_, i64>(1)? as Counter,
                        storage_key: row.get::<_, i64>(2)? as StorageKey,
                        request_count: row.get(3)?,
                    })
                },
            )?;
            for entry in rows {
                entries.push(entry?);
            }
        }
        Ok(entries)
    }

    fn load_device_registry(&mut self) -> Result<Vec<DeviceRecord>> {
        let mut devices = BTreeMap::new();

        let mut stmt = self.conn.prepare(&format!(
            "SELECT device_id FROM {} ORDER BY device_id",
            self.schema.devices_table
        ))?;
        for id in stmt.query_map([], |row| row.get::<_, DeviceId>(0))? {
            devices.insert(id?, 0);
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {device}, MAX({counter}) FROM {records}
             WHERE {device} IS NOT NULL
             GROUP BY {device}",
            device = self.schema.device_column,
            counter = self.schema.counter_column,
            records = self.schema.records_table,
        ))?;
        let maxima = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;
        for row in maxima {
            let (device, max) = row?;
            let Ok(device) = DeviceId::try_from(device) else {
                continue;
            };
            if let Some(last) = devices.get_mut(&device) {
                *last = max.unwrap_or(0).max(0) as Counter;
            }
        }

        Ok(devices
            .into_iter()
            .map(|(device_id, last_counter)| DeviceRecord {
                device_id,
                last_counter,
            })
            .collect())
    }

    fn reconnect(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            // An in-memory database cannot be reopened without losing it.
            return Ok(());
        };
        self.conn = Connection::open(path)
            .with_context(|| format!("Failed to reopen SQLite database at {}", path.display()))?;
        self.init_schema()?;
        tracing::info!(path = %path.display(), "SQLite connection re-established");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> StoreSchema {
        StoreSchema {
            records_table: "records".into(),
            devices_table: "devices".into(),
            placeholders_table: "placeholders".into(),
            columns: vec![
                Column::new("device_id", ColumnKind::Integer, 0),
                Column::new("counter", ColumnKind::Integer, 1),
                Column::new("temperature", ColumnKind::Real, 2),
                Column::new("label", ColumnKind::Text, 3),
            ],
            device_column: "device_id".into(),
            counter_column: "counter".into(),
        }
    }

    fn rec(line: &str) -> Record {
        Record::parse(line)
    }

    #[test]
    fn test_schema_from_config() {
        let schema = StoreSchema::from_config(&Config::default()).unwrap();
        assert_eq!(schema.device_column, "device_id");
        assert_eq!(schema.counter_column, "counter");
        assert_eq!(schema.records_table, "records");
    }

    #[test]
    fn test_write_batch_and_typing() {
        let mut store = SqliteStore::open_in_memory(schema()).unwrap();
        store
            .write_record_batch(&[rec("1,1,20.5,a"), rec("1,2,NAN,OVF")])
            .unwrap();
        assert_eq!(store.record_count().unwrap(), 2);

        let (temp, label): (Option<f64>, Option<String>) = store
            .conn
            .query_row(
                "SELECT temperature, label FROM records WHERE counter = 2",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(temp, None);
        assert_eq!(label, None);
    }

    #[test]
    fn test_column_value() {
        assert_eq!(column_value(ColumnKind::Integer, Some("42")), Value::Integer(42));
        assert_eq!(column_value(ColumnKind::Real, Some("1.5")), Value::Real(1.5));
        assert_eq!(column_value(ColumnKind::Real, Some("INF")), Value::Null);
        assert_eq!(column_value(ColumnKind::Text, None), Value::Null);
        assert_eq!(
            column_value(ColumnKind::Integer, Some("n/a")),
            Value::Text("n/a".into())
        );
    }

    #[test]
    fn test_placeholder_lifecycle() {
        let mut store = SqliteStore::open_in_memory(schema()).unwrap();
        store.register_device(4).unwrap();
        store.write_record_batch(&[rec("4,1,1.0,x")]).unwrap();

        let inserted = store.insert_placeholder_range(4, 2..5).unwrap();
        assert_eq!(
            inserted.iter().map(|p| p.counter).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert!(inserted.windows(2).all(|w| w[0].storage_key < w[1].storage_key));
        store.insert_placeholder_index_entries(&inserted).unwrap();
        assert_eq!(store.placeholder_count().unwrap(), 3);

        let loaded = store
            .load_placeholder_index(&[PlaceholderQuery {
                device_id: 4,
                after_key: inserted[0].storage_key,
                limit: 10,
            }])
            .unwrap();
        assert_eq!(loaded, inserted[1..].to_vec());

        // Real data for counter 3 replaces its placeholder row
        let key = inserted[1].storage_key;
        let replacement = rec("4,3,22.0,late");
        store.update_record_batch(&[(key, &replacement)]).unwrap();
        store.delete_placeholder_index_batch(&[key]).unwrap();

        let label: String = store
            .conn
            .query_row(
                "SELECT label FROM records WHERE id = ?1",
                [key as i64],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(label, "late");
        assert_eq!(store.placeholder_count().unwrap(), 2);
        assert_eq!(store.record_count().unwrap(), 4);
    }

    #[test]
    fn test_load_limit_per_device() {
        let mut store = SqliteStore::open_in_memory(schema()).unwrap();
        let a = store.insert_placeholder_range(1, 10..15).unwrap();
        let b = store.insert_placeholder_range(2, 1..3).unwrap();
        store.insert_placeholder_index_entries(&a).unwrap();
        store.insert_placeholder_index_entries(&b).unwrap();

        let loaded = store
            .load_placeholder_index(&[
                PlaceholderQuery {
                    device_id: 1,
                    after_key: 0,
                    limit: 2,
                },
                PlaceholderQuery {
                    device_id: 2,
                    after_key: 0,
                    limit: 5,
                },
            ])
            .unwrap();
        let counters: Vec<_> = loaded.iter().map(|p| (p.device_id, p.counter)).collect();
        assert_eq!(counters, vec![(1, 10), (1, 11), (2, 1), (2, 2)]);
    }

    #[test]
    fn test_device_registry_with_last_counters() {
        let mut store = SqliteStore::open_in_memory(schema()).unwrap();
        assert!(store.register_device(1).unwrap());
        assert!(store.register_device(2).unwrap());
        assert!(!store.register_device(2).unwrap());

        store
            .write_record_batch(&[rec("1,5,0,a"), rec("1,9,0,b"), rec("3,100,0,c")])
            .unwrap();

        let registry = store.load_device_registry().unwrap();
        assert_eq!(
            registry,
            vec![
                DeviceRecord {
                    device_id: 1,
                    last_counter: 9
                },
                DeviceRecord {
                    device_id: 2,
                    last_counter: 0
                },
            ]
        );
    }

    #[test]
    fn test_reconnect_keeps_file_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telerec.db");

        let mut store = SqliteStore::open(&path, schema()).unwrap();
        store.write_record_batch(&[rec("1,1,1.0,a")]).unwrap();
        store.reconnect().unwrap();
        store.write_record_batch(&[rec("1,2,1.0,b")]).unwrap();

        assert_eq!(store.record_count().unwrap(), 2);
    }
}
