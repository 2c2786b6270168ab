// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactor event handler tying the pieces together.
//!
//! Data events go through origin tagging, forwarding and the sequencer;
//! the verdict decides whether an ack is sent or the connection closed.
//! Periodic timers drive heartbeat, cache flush, device reload, backfill
//! and the inactivity reaper.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::Local;
use serde::Serialize;
use telerec_io::{ConnectionId, Event, EventHandler, Io, TimerId};

use crate::activity::ActivityTracker;
use crate::config::{parse_terminator, Config, ConfigError};
use crate::forward::Forwarder;
use crate::sequencer::{Sequencer, SequencerSnapshot, Verdict};
use crate::store::RecordStore;

/// How often the shutdown flag is polled.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Local time format of the origin suffix.
pub const DATE_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Service-level parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub append_origin: bool,
    pub forward_address: Option<SocketAddr>,

    /// Terminator appended to forwarded records
    pub forward_terminator: u8,

    pub status_file: Option<PathBuf>,
    pub heartbeat: Duration,
    pub cache_flush: Duration,
    pub device_reload: Duration,
    pub backfill: Duration,
    pub inactivity_check: Duration,
    pub inactivity_threshold: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let t = &config.timers;
        Ok(Self {
            append_origin: config.network.append_origin,
            forward_address: config.network.forward_address,
            forward_terminator: parse_terminator(&config.network.record_terminator)?,
            status_file: config.storage.status_file.clone(),
            heartbeat: Duration::from_secs(t.heartbeat_secs),
            cache_flush: Duration::from_secs(t.cache_flush_secs),
            device_reload: Duration::from_secs(t.device_reload_secs),
            backfill: Duration::from_secs(t.backfill_secs),
            inactivity_check: Duration::from_secs(t.inactivity_check_secs),
            inactivity_threshold: Duration::from_secs(t.inactivity_threshold_secs),
        })
    }
}

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRole {
    Heartbeat,
    CacheFlush,
    DeviceReload,
    Backfill,
    InactivityCheck,
    ShutdownCheck,
}

impl TimerRole {
    pub fn name(self) -> &'static str {
        match self {
            TimerRole::Heartbeat => "heartbeat",
            TimerRole::CacheFlush => "cache_flush",
            TimerRole::DeviceReload => "device_reload",
            TimerRole::Backfill => "backfill",
            TimerRole::InactivityCheck => "inactivity_check",
            TimerRole::ShutdownCheck => "shutdown_check",
        }
    }
}

/// Service counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub records_received: u64,
    pub acks_sent: u64,
    pub ack_send_failures: u64,
    pub rejections: u64,
    pub connections_accepted: u64,
    pub connections_reaped: u64,
}

/// Status line written on heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub timestamp: String,
    pub connections: usize,
    pub forwarded: Option<u64>,
    pub service: ServiceStats,
    pub sequencer: SequencerSnapshot,
}

pub struct RecorderService<S> {
    settings: ServiceSettings,
    sequencer: Sequencer<S>,
    activity: ActivityTracker,
    forwarder: Option<Forwarder>,
    timers: HashMap<TimerId, TimerRole>,
    stats: ServiceStats,
    shutdown: Option<Arc<AtomicBool>>,
}

impl<S: RecordStore> RecorderService<S> {
    pub fn new(settings: ServiceSettings, sequencer: Sequencer<S>) -> Self {
        let activity = ActivityTracker::new(settings.inactivity_threshold);
        let forwarder = settings
            .forward_address
            .map(|addr| Forwarder::new(addr, settings.forward_terminator));
        Self {
            settings,
            sequencer,
            activity,
            forwarder,
            timers: HashMap::new(),
            stats: ServiceStats::default(),
            shutdown: None,
        }
    }

    /// Stop the reactor once `flag` is set.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Create the periodic timers and the forwarding connection.
    pub fn install(&mut self, io: &mut Io) -> Result<()> {
        let mut roles = vec![
            (TimerRole::Heartbeat, self.settings.heartbeat),
            (TimerRole::CacheFlush, self.settings.cache_flush),
            (TimerRole::DeviceReload, self.settings.device_reload),
            (TimerRole::Backfill, self.settings.backfill),
            (TimerRole::InactivityCheck, self.settings.inactivity_check),
        ];
        if self.shutdown.is_some() {
            roles.push((TimerRole::ShutdownCheck, SHUTDOWN_POLL_INTERVAL));
        }

        for (role, interval) in roles {
            let Some(id) = io.add_timer(role.name(), interval) else {
                bail!("Failed to create {} timer", role.name());
            };
            self.timers.insert(id, role);
        }

        if let Some(forwarder) = &mut self.forwarder {
            forwarder.connect(io);
        }
        Ok(())
    }

    pub fn sequencer(&self) -> &Sequencer<S> {
        &self.sequencer
    }

    pub fn sequencer_mut(&mut self) -> &mut Sequencer<S> {
        &mut self.sequencer
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub fn snapshot(&self, io: &Io) -> ServiceSnapshot {
        ServiceSnapshot {
            timestamp: Local::now().to_rfc3339(),
            connections: io.connection_count(),
            forwarded: self.forwarder.as_ref().map(Forwarder::forwarded),
            service: self.stats.clone(),
            sequencer: self.sequencer.snapshot(),
        }
    }

    fn on_data(&mut self, io: &mut Io, conn: ConnectionId, peer: SocketAddr, record: &str) {
        if self
            .forwarder
            .as_ref()
            .is_some_and(|f| f.is_connection(conn))
        {
            tracing::debug!(%conn, "data on forwarding connection ignored");
            return;
        }

        self.stats.records_received += 1;
        self.activity.touch(conn, Instant::now());

        let line = if self.settings.append_origin {
            format!(
                "{}, {}, {}",
                record,
                peer.ip(),
                Local::now().format(DATE_TIME_FORMAT)
            )
        } else {
            record.to_string()
        };

        if let Some(forwarder) = &mut self.forwarder {
            forwarder.forward(io, &line);
        }

        match self.sequencer.process(&line) {
            Verdict::Accept => {}
            Verdict::AcceptWithAck(ack) => match io.send(conn, ack.to_wire().as_bytes()) {
                Ok(()) => self.stats.acks_sent += 1,
                Err(e) => {
                    self.stats.ack_send_failures += 1;
                    self.activity.forget(conn);
                    tracing::warn!(%conn, %peer, error = %e, "ack send failed");
                }
            },
            Verdict::Reject(rejection) => {
                self.stats.rejections += 1;
                tracing::warn!(%conn, %peer, %rejection, "record rejected, closing connection");
                io.close(conn);
                self.activity.forget(conn);
            }
        }

        self.sequencer.flush_caches(false);
    }

    fn on_timer(&mut self, io: &mut Io, role: TimerRole) {
        match role {
            TimerRole::Heartbeat => {
                self.prune_released(io);
                self.heartbeat(io);
            }
            TimerRole::CacheFlush => self.sequencer.flush_caches(true),
            TimerRole::DeviceReload => {
                if let Err(e) = self.sequencer.reload_devices() {
                    tracing::error!(error = %e, "device registry reload failed");
                }
            }
            TimerRole::Backfill => {
                let inserted = self.sequencer.backfill_all();
                if inserted > 0 {
                    tracing::info!(placeholders = inserted, "periodic backfill");
                }
            }
            TimerRole::InactivityCheck => self.reap(io),
            TimerRole::ShutdownCheck => {}
        }
    }

    /// Forget connections the reactor released without a disconnect event.
    fn prune_released(&mut self, io: &Io) {
        let pruned = self.activity.retain(|conn| io.is_open(conn));
        if pruned > 0 {
            tracing::debug!(pruned, "released connections dropped from activity tracking");
        }
    }

    fn heartbeat(&self, io: &Io) {
        let snapshot = self.snapshot(io);
        tracing::info!(
            connections = snapshot.connections,
            devices = snapshot.sequencer.devices.len(),
            received = self.stats.records_received,
            acks = self.stats.acks_sent,
            rejections = self.stats.rejections,
            pending_writes = snapshot.sequencer.pending_writes,
            "heartbeat"
        );

        let Some(path) = &self.settings.status_file else {
            return;
        };
        let result = serde_json::to_string(&snapshot)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(file, "{}", json)
            });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "status file write failed");
        }
    }

    fn reap(&mut self, io: &mut Io) {
        for conn in self.activity.expired(Instant::now()) {
            if io.close(conn) {
                self.stats.connections_reaped += 1;
                tracing::info!(%conn, "inactive connection closed");
            }
        }
    }
}

impl<S: RecordStore> EventHandler for RecorderService<S> {
    fn on_event(&mut self, io: &mut Io, event: Event<'_>) {
        match event {
            Event::Connected { conn, peer } => {
                self.stats.connections_accepted += 1;
                self.activity.touch(conn, Instant::now());
                tracing::debug!(%conn, %peer, "peer connected");
            }
            Event::Disconnected { conn, peer, .. } => {
                self.activity.forget(conn);
                if let Some(forwarder) = &mut self.forwarder {
                    forwarder.on_disconnect(conn);
                }
                tracing::debug!(%conn, %peer, "peer disconnected");
            }
            Event::Data { conn, peer, record } => self.on_data(io, conn, peer, record),
            Event::Timer { timer, name, expirations } => {
                if self
                    .shutdown
                    .as_ref()
                    .is_some_and(|flag| flag.load(Ordering::SeqCst))
                {
                    tracing::info!("shutdown requested");
                    io.stop();
                    return;
                }

                match self.timers.get(&timer).copied() {
                    Some(role) => {
                        if expirations > 1 {
                            tracing::debug!(timer = name, expirations, "timer overrun");
                        }
                        self.on_timer(io, role);
                    }
                    None => tracing::warn!(timer = name, "unknown timer"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.timers.cache_flush_secs = 2;
        config.network.forward_address = Some("127.0.0.1:7000".parse().unwrap());

        let settings = ServiceSettings::from_config(&config).unwrap();
        assert_eq!(settings.cache_flush, Duration::from_secs(2));
        assert_eq!(settings.forward_terminator, b'\n');
        assert!(settings.append_origin);
        assert_eq!(settings.forward_address.unwrap().port(), 7000);
    }

    #[test]
    fn test_timer_names_are_distinct() {
        let roles = [
            TimerRole::Heartbeat,
            TimerRole::CacheFlush,
            TimerRole::DeviceReload,
            TimerRole::Backfill,
            TimerRole::InactivityCheck,
            TimerRole::ShutdownCheck,
        ];
        let names: std::collections::HashSet<_> = roles.iter().map(|r| r.name()).collect();
        assert_eq!(names.len(), roles.len());
    }
}
