// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! SQLite store behind the sequencer, across restarts.

use std::path::Path;

use telerec::{
    Ack, CacheEngine, CacheSettings, Column, ColumnKind, Config, FileFallback, RecordStore,
    Sequencer, SequencerSettings, SqliteStore, StoreSchema, Verdict,
};

fn config() -> Config {
    let mut config = Config::default();
    config.record.columns.push(Column::new("reading", ColumnKind::Real, 2));
    config.sequencing.holding_threshold = 3;
    config.cache.write_threshold = 4;
    config.validate().unwrap();
    config
}

fn open(path: &Path, config: &Config) -> Sequencer<SqliteStore> {
    let store = SqliteStore::open(path, StoreSchema::from_config(config).unwrap()).unwrap();
    let fallback_prefix = path.with_extension("fallback").to_string_lossy().into_owned();
    let cache = CacheEngine::new(
        store,
        FileFallback::new(fallback_prefix),
        CacheSettings::from(config),
    );
    let mut seq = Sequencer::new(SequencerSettings::from(config), cache);
    seq.initialize().unwrap();
    seq
}

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("telerec.db");
    let config = config();

    {
        let store = SqliteStore::open(&path, StoreSchema::from_config(&config).unwrap()).unwrap();
        store.register_device(42).unwrap();
    }

    {
        let mut seq = open(&path, &config);
        assert_eq!(
            seq.process("42,1,1.5"),
            Verdict::AcceptWithAck(Ack::new(1, 0))
        );
        seq.process("42,5,NAN");
        seq.process("42,6,2.0");
        // Threshold reached: placeholders for 2..5
        assert_eq!(
            seq.process("42,7,OVF"),
            Verdict::AcceptWithAck(Ack::new(2, 3))
        );
        seq.flush_caches(true);
    }

    let mut seq = open(&path, &config);
    let state = seq.devices().get(42).unwrap();
    assert_eq!(state.last_committed(), 7);
    let restored: Vec<u64> = state.placeholders().map(|p| p.counter).collect();
    assert_eq!(restored, vec![2, 3, 4]);

    // Late data for 3 replaces its placeholder row
    assert_eq!(seq.process("42,3,9.5"), Verdict::Accept);
    seq.flush_caches(true);

    let store = seq.cache_mut().store_mut();
    assert_eq!(store.record_count().unwrap(), 7);
    assert_eq!(store.placeholder_count().unwrap(), 2);
    assert_eq!(
        store.load_device_registry().unwrap()[0].last_counter,
        7
    );
}

#[test]
fn test_custom_table_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.db");

    let mut config = config();
    config.storage.records_table = "samples".into();
    config.storage.devices_table = "stations".into();
    config.storage.placeholders_table = "gaps".into();
    config.validate().unwrap();

    let store = SqliteStore::open(&path, StoreSchema::from_config(&config).unwrap()).unwrap();
    store.register_device(1).unwrap();
    assert_eq!(store.schema().records_table, "samples");
    drop(store);

    let mut seq = open(&path, &config);
    seq.process("1,1,0.5");
    seq.process("1,2,0.6");
    seq.flush_caches(true);
    assert_eq!(seq.cache().store().record_count().unwrap(), 2);
}
