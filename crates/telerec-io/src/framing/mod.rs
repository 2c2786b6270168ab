// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Record framing.
//!
//! Both encodings produce the same thing: one comma-delimited text record
//! per complete frame, in arrival order.
//!
//! - [`Framing::Delimited`]: text records closed by one terminator byte
//! - [`Framing::Binary`]: fixed-layout records with checksum trailer
//!
//! [`Framer`] owns the per-connection accumulation buffer and enforces the
//! buffered-bytes limit; the decoders themselves are pure functions.

pub mod binary;
pub mod delimited;

pub use binary::{BinaryLayout, FieldKind};

/// Default receive buffer limit per connection.
pub const DEFAULT_MAX_BUFFERED: usize = 8192;

/// Record encoding on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Text records closed by `terminator`
    Delimited { terminator: u8 },
    /// Fixed-layout binary records
    Binary(BinaryLayout),
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Delimited { terminator: b'\n' }
    }
}

/// Per-connection accumulation buffer.
#[derive(Debug)]
pub struct Framer {
    framing: Framing,
    buffer: Vec<u8>,
    max_buffered: usize,

    /// Statistics: records emitted
    records_emitted: u64,

    /// Statistics: bytes skipped by binary resync
    bytes_skipped: u64,

    /// Statistics: buffer overflows (unterminated data discarded)
    overflows: u64,
}

impl Framer {
    /// Create a framer with the given encoding and buffered-bytes limit.
    pub fn new(framing: Framing, max_buffered: usize) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            max_buffered,
            records_emitted: 0,
            bytes_skipped: 0,
            overflows: 0,
        }
    }

    /// Append received bytes and return every complete record.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let (records, consumed) = match &self.framing {
            Framing::Delimited { terminator } => {
                delimited::split_records(&self.buffer, *terminator)
            }
            Framing::Binary(layout) => {
                let out = binary::decode(&self.buffer, layout);
                if out.skipped > 0 {
                    log::debug!(
                        "[framer] skipped {} bytes while resyncing binary records",
                        out.skipped
                    );
                    self.bytes_skipped += out.skipped as u64;
                }
                (out.records, out.consumed)
            }
        };
        self.buffer.drain(..consumed);
        self.records_emitted += records.len() as u64;

        if self.buffer.len() > self.max_buffered {
            log::warn!(
                "[framer] {} buffered bytes without a complete record (limit {}), discarding",
                self.buffer.len(),
                self.max_buffered
            );
            self.buffer.clear();
            self.overflows += 1;
        }

        records
    }

    /// Bytes currently waiting for a record boundary.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn records_emitted(&self) -> u64 {
        self.records_emitted
    }

    pub fn bytes_skipped(&self) -> u64 {
        self.bytes_skipped
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}
