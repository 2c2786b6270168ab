// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mirror received records to a downstream endpoint.
//!
//! The outbound connection is owned by the reactor like any other. When it
//! drops or a send fails, the next record triggers a reconnect, at most
//! once per `retry_after`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use telerec_io::{ConnectionId, Io};

/// Minimum delay between two connection attempts.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Forwarder {
    addr: SocketAddr,
    terminator: u8,
    conn: Option<ConnectionId>,
    last_attempt: Option<Instant>,
    retry_after: Duration,
    forwarded: u64,
}

impl Forwarder {
    pub fn new(addr: SocketAddr, terminator: u8) -> Self {
        Self {
            addr,
            terminator,
            conn: None,
            last_attempt: None,
            retry_after: DEFAULT_RETRY_AFTER,
            forwarded: 0,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Open the outbound connection. Returns true if connected.
    pub fn connect(&mut self, io: &mut Io) -> bool {
        self.last_attempt = Some(Instant::now());
        self.conn = io.connect(self.addr);
        match self.conn {
            Some(conn) => {
                tracing::info!(addr = %self.addr, %conn, "forwarding connection open");
                true
            }
            None => {
                tracing::warn!(addr = %self.addr, "forwarding connection failed");
                false
            }
        }
    }

    /// Send one record followed by the terminator.
    pub fn forward(&mut self, io: &mut Io, record: &str) {
        let conn = match self.conn.filter(|c| io.is_open(*c)) {
            Some(conn) => conn,
            None => {
                self.conn = None;
                let due = self
                    .last_attempt
                    .map_or(true, |at| at.elapsed() >= self.retry_after);
                if !due || !self.connect(io) {
                    return;
                }
                match self.conn {
                    Some(conn) => conn,
                    None => return,
                }
            }
        };

        let mut line = Vec::with_capacity(record.len() + 1);
        line.extend_from_slice(record.as_bytes());
        line.push(self.terminator);

        match io.send(conn, &line) {
            Ok(()) => self.forwarded += 1,
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "forwarding send failed");
                io.close(conn);
                self.conn = None;
            }
        }
    }

    pub fn is_connection(&self, conn: ConnectionId) -> bool {
        self.conn == Some(conn)
    }

    pub fn on_disconnect(&mut self, conn: ConnectionId) {
        if self.is_connection(conn) {
            tracing::warn!(addr = %self.addr, "forwarding connection closed by peer");
            self.conn = None;
        }
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
