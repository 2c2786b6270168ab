// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device records.
//!
//! A record is an ordered list of text fields. Two configured positions
//! carry the device id and the sequence counter; everything else is opaque
//! until it reaches the storage boundary, where [`Column`] gives it a type.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Rejection;

/// Device identifier.
pub type DeviceId = u32;

/// Per-device sequence counter.
pub type Counter = u64;

/// Primary key of a row in the records table.
pub type StorageKey = u64;

/// Field values stored as SQL NULL.
pub const NULL_SENTINELS: [&str; 4] = ["NAN", "NULL", "INF", "OVF"];

/// Returns true if `value` is one of [`NULL_SENTINELS`].
pub fn is_null_sentinel(value: &str) -> bool {
    NULL_SENTINELS.contains(&value)
}

/// One parsed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    fields: Vec<String>,
}

impl Record {
    /// Split a comma-delimited line.
    ///
    /// Fields are trimmed; empty fields are dropped.
    pub fn parse(line: &str) -> Self {
        let fields = line
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        Self { fields }
    }

    pub fn from_fields(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field(&self, position: usize) -> Option<&str> {
        self.fields.get(position).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Comma-joined form, as written to the file fallback.
    pub fn to_line(&self) -> String {
        self.fields.join(",")
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    DateTime,
}

impl ColumnKind {
    /// SQLite declared type.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text | ColumnKind::DateTime => "TEXT",
        }
    }
}

/// Mapping of a record position to a table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name in the records table
    pub name: String,

    /// Storage type
    pub kind: ColumnKind,

    /// Field position in the record
    pub position: usize,
}

impl Column {
    pub fn new(name: &str, kind: ColumnKind, position: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            position,
        }
    }
}

/// Where the identifying fields live and how many fields a record needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    device_id_position: usize,
    counter_position: usize,
    min_fields: usize,
}

impl RecordLayout {
    /// Build a layout. `min_fields` covers the identifying positions and
    /// every mapped column.
    pub fn new(device_id_position: usize, counter_position: usize, columns: &[Column]) -> Self {
        let highest = columns
            .iter()
            .map(|c| c.position)
            .chain([device_id_position, counter_position])
            .max()
            .unwrap_or(0);
        Self {
            device_id_position,
            counter_position,
            min_fields: highest + 1,
        }
    }

    pub fn device_id_position(&self) -> usize {
        self.device_id_position
    }

    pub fn counter_position(&self) -> usize {
        self.counter_position
    }

    pub fn min_fields(&self) -> usize {
        self.min_fields
    }

    /// Extract device id and counter.
    pub fn identify(&self, record: &Record) -> Result<(DeviceId, Counter), Rejection> {
        if record.len() < self.min_fields {
            return Err(Rejection::TooFewFields {
                found: record.len(),
                required: self.min_fields,
            });
        }

        let raw_device = record.field(self.device_id_position).unwrap_or_default();
        let device_id = raw_device
            .parse::<DeviceId>()
            .map_err(|_| Rejection::MalformedDeviceId(raw_device.to_string()))?;

        let raw_counter = record.field(self.counter_position).unwrap_or_default();
        let counter = raw_counter
            .parse::<Counter>()
            .map_err(|_| Rejection::MalformedCounter(raw_counter.to_string()))?;

        Ok((device_id, counter))
    }
}
