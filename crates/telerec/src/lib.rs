// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! telerec ingestion service
//!
//! Receives sequenced records from remote devices over TCP, restores
//! per-device order, asks devices to resend what is missing and persists
//! everything in batches.
//!
//! # Features
//!
//! - **Sequencing** -- In-order commit per device with a holding area for
//!   records that arrive early
//! - **Acks** -- `SERVER:<start>,<count>` resend requests
//! - **Backfill** -- Placeholder rows for gaps, replaced when data arrives
//! - **Batched persistence** -- Write, update and delete caches with file
//!   fallback when the store is down
//!
//! # Architecture
//!
//! ```text
//! Reactor (telerec-io)
//! +-- RecorderService       (event handler, timers, reaper, forwarding)
//!     +-- Sequencer         (per-device ordering, acks, backfill)
//!         +-- CacheEngine   (write/update/delete caches)
//!             +-- RecordStore   (SQLite or in-memory)
//!             +-- FileFallback  (monthly spill files)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use telerec::{Config, Recorder, SqliteStore, StoreSchema};
//!
//! let config = Config::from_file("telerec.toml")?;
//! let store = SqliteStore::open(&config.storage.database, StoreSchema::from_config(&config)?)?;
//! Recorder::bind(&config, store)?.run()?;
//! ```

pub mod ack;
pub mod activity;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod forward;
pub mod record;
pub mod sequencer;
pub mod service;
pub mod store;

pub use ack::Ack;
pub use cache::{CacheEngine, CacheSettings, CacheStats};
pub use config::{Config, ConfigError};
pub use device::{DeviceRecord, DeviceRegistry, DeviceState, Placeholder};
pub use error::Rejection;
pub use record::{Column, ColumnKind, Counter, DeviceId, Record, RecordLayout, StorageKey};
pub use sequencer::{Sequencer, SequencerSettings, Verdict};
pub use service::{RecorderService, ServiceSettings, ServiceStats};
pub use store::{FileFallback, MemoryStore, RecordStore, SqliteStore, StoreSchema};

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use telerec_io::Reactor;

/// A bound, initialized service ready to run.
pub struct Recorder<S: RecordStore> {
    reactor: Reactor,
    service: RecorderService<S>,
    local_addr: SocketAddr,
}

impl<S: RecordStore> Recorder<S> {
    /// Validate `config`, listen and load device state from `store`.
    pub fn bind(config: &Config, store: S) -> Result<Self> {
        config.validate()?;

        let mut reactor =
            Reactor::new(config.reactor_config()?).context("Failed to create reactor")?;
        let addr = config.listen_addr();
        let Some(local_addr) = reactor.io().listen(addr) else {
            bail!("Failed to listen on {}", addr);
        };

        let cache = CacheEngine::new(
            store,
            FileFallback::new(config.storage.fallback_prefix.clone()),
            CacheSettings::from(config),
        );
        let mut sequencer = Sequencer::new(SequencerSettings::from(config), cache);
        sequencer
            .initialize()
            .context("Failed to load device registry")?;

        let service = RecorderService::new(ServiceSettings::from_config(config)?, sequencer);
        Ok(Self {
            reactor,
            service,
            local_addr,
        })
    }

    /// Stop [`Recorder::run`] once `flag` is set.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.service = self.service.with_shutdown_flag(flag);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service(&self) -> &RecorderService<S> {
        &self.service
    }

    /// Run until shutdown, then flush every cache.
    pub fn run(mut self) -> Result<()> {
        self.service.install(self.reactor.io())?;
        tracing::info!(addr = %self.local_addr, "telerec running");

        let result = self.reactor.run(&mut self.service);
        self.service.sequencer_mut().flush_caches(true);

        let stats = self.service.sequencer().cache().stats();
        tracing::info!(
            records_written = stats.records_written,
            records_spilled = stats.records_spilled,
            "telerec stopped"
        );
        result?;
        Ok(())
    }
}

/// Bind and run until `shutdown` is set.
pub fn run<S: RecordStore>(
    config: &Config,
    store: S,
    shutdown: Option<Arc<AtomicBool>>,
) -> Result<()> {
    let mut recorder = Recorder::bind(config, store)?;
    if let Some(flag) = shutdown {
        recorder = recorder.with_shutdown_flag(flag);
    }
    recorder.run()
}
