// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service configuration.
//!
//! Loaded once from TOML at startup and treated as immutable afterwards.
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! [network]
//! port = 9000
//! record_terminator = "\n"
//!
//! [record]
//! device_id_position = 0
//! counter_position = 1
//! columns = [
//!     { name = "device_id", kind = "integer", position = 0 },
//!     { name = "counter", kind = "integer", position = 1 },
//!     { name = "temperature", kind = "real", position = 2 },
//! ]
//!
//! [storage]
//! database = "telerec.db"
//! ```

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use telerec_io::{BinaryLayout, Framing, ReactorConfig};
use thiserror::Error;

use crate::record::{Column, ColumnKind, RecordLayout};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub record: RecordConfig,

    #[serde(default)]
    pub sequencing: SequencingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub timers: TimerConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// How records are framed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    #[default]
    Delimited,
    Binary,
}

/// Listener, framing and forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub listen_address: IpAddr,

    /// Port to bind.
    pub port: u16,

    /// Record terminator: one character or an escape (`\n`, `\r`, `\t`, `\0`).
    pub record_terminator: String,

    /// Bytes read per `read` call.
    pub receive_buffer_size: usize,

    /// Unterminated bytes kept per connection.
    pub max_buffered_bytes: usize,

    pub framing: FramingMode,

    /// Binary field list, e.g. `"int,int,float,char,end"`.
    pub binary_layout: String,

    /// Append `, <peer ip>, <local date-time>` to each record.
    pub append_origin: bool,

    /// Mirror every record to this address.
    pub forward_address: Option<SocketAddr>,

    /// Outbound connect timeout (milliseconds).
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9000,
            record_terminator: "\n".to_string(),
            receive_buffer_size: 512,
            max_buffered_bytes: 8192,
            framing: FramingMode::Delimited,
            binary_layout: String::new(),
            append_origin: true,
            forward_address: None,
            connect_timeout_ms: 5000,
        }
    }
}

/// Record field positions and storage columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub device_id_position: usize,
    pub counter_position: usize,
    pub columns: Vec<Column>,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            device_id_position: 0,
            counter_position: 1,
            columns: vec![
                Column::new("device_id", ColumnKind::Integer, 0),
                Column::new("counter", ColumnKind::Integer, 1),
            ],
        }
    }
}

/// Holding area and placeholder limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencingConfig {
    /// Holding-area size that triggers an immediate gap backfill.
    pub holding_threshold: usize,

    /// Placeholders kept in memory per device.
    pub max_placeholders_per_device: usize,

    /// Times a placeholder is re-requested before it is abandoned.
    pub max_placeholder_requests: u32,
}

impl Default for SequencingConfig {
    fn default() -> Self {
        Self {
            holding_threshold: 100,
            max_placeholders_per_device: 1000,
            max_placeholder_requests: 5,
        }
    }
}

/// Batch thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub write_threshold: usize,

    /// Write cache size at which a failed flush spills to the file fallback.
    pub write_hard_limit: usize,

    pub update_threshold: usize,
    pub delete_threshold: usize,

    /// Consecutive write failures before the store is reinitialized.
    pub write_failure_limit: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            write_threshold: 100,
            write_hard_limit: 10_000,
            update_threshold: 50,
            delete_threshold: 50,
            write_failure_limit: 10,
        }
    }
}

/// Periodic timer intervals (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub heartbeat_secs: u64,
    pub cache_flush_secs: u64,
    pub device_reload_secs: u64,
    pub backfill_secs: u64,
    pub inactivity_check_secs: u64,

    /// Idle time after which a connection is closed.
    pub inactivity_threshold_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 60,
            cache_flush_secs: 5,
            device_reload_secs: 300,
            backfill_secs: 30,
            inactivity_check_secs: 60,
            inactivity_threshold_secs: 600,
        }
    }
}

/// Database, fallback and status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database: PathBuf,

    pub records_table: String,
    pub devices_table: String,
    pub placeholders_table: String,

    /// File fallback name prefix; files are `<prefix>_<year>_<month>`.
    pub fallback_prefix: String,

    /// Heartbeat status snapshots are appended here when set.
    pub status_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("telerec.db"),
            records_table: "records".to_string(),
            devices_table: "devices".to_string(),
            placeholders_table: "placeholders".to_string(),
            fallback_prefix: "telerec_fallback".to_string(),
            status_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.terminator()?;
        self.framing()?;

        if self.network.receive_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "receive_buffer_size must be positive".into(),
            ));
        }
        if self.network.max_buffered_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_buffered_bytes must be positive".into(),
            ));
        }

        self.validate_columns()?;

        let seq = &self.sequencing;
        if seq.holding_threshold == 0 || seq.max_placeholders_per_device == 0 {
            return Err(ConfigError::Invalid(
                "sequencing thresholds must be positive".into(),
            ));
        }
        if seq.max_placeholder_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_placeholder_requests must be positive".into(),
            ));
        }

        let cache = &self.cache;
        if cache.write_threshold == 0 || cache.update_threshold == 0 || cache.delete_threshold == 0
        {
            return Err(ConfigError::Invalid(
                "cache thresholds must be positive".into(),
            ));
        }
        if cache.write_hard_limit < cache.write_threshold {
            return Err(ConfigError::Invalid(format!(
                "write_hard_limit ({}) is below write_threshold ({})",
                cache.write_hard_limit, cache.write_threshold
            )));
        }
        if cache.write_failure_limit == 0 {
            return Err(ConfigError::Invalid(
                "write_failure_limit must be positive".into(),
            ));
        }

        let t = &self.timers;
        for (name, secs) in [
            ("heartbeat_secs", t.heartbeat_secs),
            ("cache_flush_secs", t.cache_flush_secs),
            ("device_reload_secs", t.device_reload_secs),
            ("backfill_secs", t.backfill_secs),
            ("inactivity_check_secs", t.inactivity_check_secs),
            ("inactivity_threshold_secs", t.inactivity_threshold_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        let s = &self.storage;
        for table in [&s.records_table, &s.devices_table, &s.placeholders_table] {
            if !is_identifier(table) {
                return Err(ConfigError::Invalid(format!(
                    "invalid table name '{}'",
                    table
                )));
            }
        }
        if s.fallback_prefix.is_empty() {
            return Err(ConfigError::Invalid("fallback_prefix is empty".into()));
        }

        Ok(())
    }

    fn validate_columns(&self) -> Result<(), ConfigError> {
        let rec = &self.record;
        if rec.device_id_position == rec.counter_position {
            return Err(ConfigError::Invalid(
                "device id and counter share a position".into(),
            ));
        }

        let mut names = HashSet::new();
        let mut positions = HashSet::new();
        for column in &rec.columns {
            if !is_identifier(&column.name) || column.name.eq_ignore_ascii_case("id") {
                return Err(ConfigError::Invalid(format!(
                    "invalid column name '{}'",
                    column.name
                )));
            }
            if !names.insert(column.name.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
            if !positions.insert(column.position) {
                return Err(ConfigError::Invalid(format!(
                    "position {} mapped twice",
                    column.position
                )));
            }
        }

        for (what, position, column) in [
            ("device id", rec.device_id_position, self.device_column()),
            ("counter", rec.counter_position, self.counter_column()),
        ] {
            match column {
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "no column at {} position {}",
                        what, position
                    )));
                }
                Some(c) if c.kind != ColumnKind::Integer => {
                    return Err(ConfigError::Invalid(format!(
                        "{} column '{}' must be an integer column",
                        what, c.name
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Terminator byte for delimited framing.
    pub fn terminator(&self) -> Result<u8, ConfigError> {
        parse_terminator(&self.network.record_terminator)
    }

    /// Reactor framing for the configured mode.
    pub fn framing(&self) -> Result<Framing, ConfigError> {
        match self.network.framing {
            FramingMode::Delimited => Ok(Framing::Delimited {
                terminator: self.terminator()?,
            }),
            FramingMode::Binary => BinaryLayout::parse(&self.network.binary_layout)
                .map(Framing::Binary)
                .map_err(ConfigError::Invalid),
        }
    }

    pub fn reactor_config(&self) -> Result<ReactorConfig, ConfigError> {
        Ok(ReactorConfig {
            framing: self.framing()?,
            receive_buffer_size: self.network.receive_buffer_size,
            max_buffered_bytes: self.network.max_buffered_bytes,
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            ..Default::default()
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network.listen_address, self.network.port)
    }

    pub fn record_layout(&self) -> RecordLayout {
        RecordLayout::new(
            self.record.device_id_position,
            self.record.counter_position,
            &self.record.columns,
        )
    }

    /// Column holding the device id.
    pub fn device_column(&self) -> Option<&Column> {
        self.column_at(self.record.device_id_position)
    }

    /// Column holding the counter.
    pub fn counter_column(&self) -> Option<&Column> {
        self.column_at(self.record.counter_position)
    }

    fn column_at(&self, position: usize) -> Option<&Column> {
        self.record.columns.iter().find(|c| c.position == position)
    }
}

/// Parse a terminator setting into one byte.
pub fn parse_terminator(value: &str) -> Result<u8, ConfigError> {
    match value {
        "\\n" | "\\r\\n" => Ok(b'\n'),
        "\\r" | "\\n\\r" => Ok(b'\r'),
        "\\t" => Ok(b'\t'),
        "\\0" => Ok(0),
        other if other.len() == 1 => Ok(other.as_bytes()[0]),
        other => Err(ConfigError::Invalid(format!(
            "record_terminator '{}' is not a single byte or known escape",
            other.escape_default()
        ))),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.terminator().unwrap(), b'\n');
        assert_eq!(config.listen_addr().port(), 9000);
        assert_eq!(config.record_layout().min_fields(), 2);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.cache.write_threshold, 100);
        assert_eq!(config.timers.cache_flush_secs, 5);
        assert_eq!(config.storage.records_table, "records");
    }

    #[test]
    fn test_full_toml() {
        let config = Config::from_toml(
            r#"
            [network]
            port = 7100
            record_terminator = '\0'
            append_origin = false
            forward_address = "127.0.0.1:7200"

            [record]
            device_id_position = 1
            counter_position = 0
            columns = [
                { name = "counter", kind = "integer", position = 0 },
                { name = "device", kind = "integer", position = 1 },
                { name = "temp", kind = "real", position = 2 },
                { name = "taken_at", kind = "date_time", position = 3 },
            ]

            [cache]
            write_threshold = 10
            write_hard_limit = 20

            [timers]
            heartbeat_secs = 15
            "#,
        )
        .unwrap();

        assert_eq!(config.network.port, 7100);
        assert_eq!(config.terminator().unwrap(), 0);
        assert!(!config.network.append_origin);
        assert_eq!(
            config.network.forward_address,
            Some("127.0.0.1:7200".parse().unwrap())
        );
        assert_eq!(config.device_column().unwrap().name, "device");
        assert_eq!(config.counter_column().unwrap().name, "counter");
        assert_eq!(config.record_layout().min_fields(), 4);
        assert_eq!(config.timers.heartbeat_secs, 15);
        assert_eq!(config.timers.backfill_secs, 30);
    }

    #[test]
    fn test_terminator_escapes() {
        assert_eq!(parse_terminator("\\n").unwrap(), b'\n');
        assert_eq!(parse_terminator("\\r\\n").unwrap(), b'\n');
        assert_eq!(parse_terminator("\\n\\r").unwrap(), b'\r');
        assert_eq!(parse_terminator("\\t").unwrap(), b'\t');
        assert_eq!(parse_terminator(";").unwrap(), b';');
        assert!(parse_terminator("ab").is_err());
        assert!(parse_terminator("").is_err());
    }

    #[test]
    fn test_binary_framing() {
        let mut config = Config::default();
        config.network.framing = FramingMode::Binary;
        assert!(config.validate().is_err());

        config.network.binary_layout = "int,int,float,end".into();
        match config.framing().unwrap() {
            Framing::Binary(layout) => assert_eq!(layout.record_len(), 15),
            other => panic!("unexpected framing {:?}", other),
        }
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.cache.write_hard_limit = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.timers.backfill_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.records_table = "records; DROP".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.record.columns.retain(|c| c.name != "counter");
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .record
            .columns
            .push(Column::new("device_id", ColumnKind::Text, 5));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.record.counter_position = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sequencing]\nmax_placeholder_requests = 3").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.sequencing.max_placeholder_requests, 3);

        assert!(matches!(
            Config::from_file("/nonexistent/telerec.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_reactor_config() {
        let config = Config::default();
        let reactor = config.reactor_config().unwrap();
        assert_eq!(reactor.receive_buffer_size, 512);
        assert_eq!(reactor.max_buffered_bytes, 8192);
        assert_eq!(reactor.connect_timeout, Duration::from_millis(5000));
    }
}
