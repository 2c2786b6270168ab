// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-layout binary records.
//!
//! # Wire Format
//!
//! ```text
//! +---------------------------+----------+----------+
//! | Body (layout fields)      | Checksum | Sentinel |
//! +---------------------------+----------+----------+
//!   sum(field widths) bytes     1 byte     1 byte (0xFF)
//! ```
//!
//! - **Body**: fields in layout order, multi-byte values little-endian
//! - **Checksum**: XOR of every body byte
//! - **Sentinel**: always `0xFF`
//!
//! A candidate that fails either trailer check is dropped and the scan
//! resumes one byte later, so a stream that lost bytes re-synchronizes on
//! the next valid record. Decoding is pure: the caller decides what to log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};

/// Trailer sentinel byte.
pub const RECORD_SENTINEL: u8 = 0xFF;

/// Checksum byte + sentinel byte.
pub const TRAILER_LEN: usize = 2;

/// One field of a binary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `i32` little-endian
    Int,
    /// `f32` little-endian; NaN renders `NAN`, infinities `INF`
    Float,
    /// Single unsigned byte rendered as an integer
    Char,
    /// `i32` little-endian Unix seconds, rendered in local time
    DateTime,
    /// 4-byte escape marker, skipped
    Escape,
    /// 1-byte end marker, skipped
    End,
}

impl FieldKind {
    /// Bytes occupied on the wire.
    pub fn width(self) -> usize {
        match self {
            FieldKind::Int | FieldKind::Float | FieldKind::DateTime | FieldKind::Escape => 4,
            FieldKind::Char | FieldKind::End => 1,
        }
    }

    /// Whether the field produces a text column.
    pub fn is_rendered(self) -> bool {
        !matches!(self, FieldKind::Escape | FieldKind::End)
    }
}

impl FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "int" => Ok(FieldKind::Int),
            "float" => Ok(FieldKind::Float),
            "char" => Ok(FieldKind::Char),
            "date_time" => Ok(FieldKind::DateTime),
            "esc" => Ok(FieldKind::Escape),
            "end" => Ok(FieldKind::End),
            other => Err(format!("unknown binary field type '{}'", other)),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Char => "char",
            FieldKind::DateTime => "date_time",
            FieldKind::Escape => "esc",
            FieldKind::End => "end",
        };
        f.write_str(name)
    }
}

/// Ordered field list describing one record body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLayout {
    fields: Vec<FieldKind>,
    body_len: usize,
}

impl BinaryLayout {
    /// Build a layout. Returns `None` when `fields` is empty.
    pub fn new(fields: Vec<FieldKind>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let body_len = fields.iter().map(|f| f.width()).sum();
        Some(Self { fields, body_len })
    }

    /// Parse a comma-separated list such as `"int,int,float,char,end"`.
    pub fn parse(list: &str) -> Result<Self, String> {
        let fields = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(FieldKind::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(fields).ok_or_else(|| "binary layout has no fields".to_string())
    }

    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    /// Body length without trailer.
    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// Full record length including trailer.
    pub fn record_len(&self) -> usize {
        self.body_len + TRAILER_LEN
    }
}

/// Result of one [`decode`] pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BinaryDecode {
    /// Accepted records rendered as comma-delimited text
    pub records: Vec<String>,
    /// Bytes that may be dropped from the front of the buffer
    pub consumed: usize,
    /// Bytes skipped while looking for a valid record
    pub skipped: usize,
}

/// Decode every complete record at the front of `buf`.
pub fn decode(buf: &[u8], layout: &BinaryLayout) -> BinaryDecode {
    let record_len = layout.record_len();
    let body_len = layout.body_len();
    let mut out = BinaryDecode::default();
    let mut pos = 0;

    while buf.len() - pos >= record_len {
        let candidate = &buf[pos..pos + record_len];
        let body = &candidate[..body_len];

        if candidate[body_len + 1] == RECORD_SENTINEL && checksum(body) == candidate[body_len] {
            out.records.push(render(body, layout));
            pos += record_len;
        } else {
            out.skipped += 1;
            pos += 1;
        }
    }

    out.consumed = pos;
    out
}

/// XOR of all bytes.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc ^ b)
}

fn render(body: &[u8], layout: &BinaryLayout) -> String {
    let mut columns = Vec::with_capacity(layout.fields.len());
    let mut offset = 0;

    for &kind in &layout.fields {
        let bytes = &body[offset..offset + kind.width()];
        offset += kind.width();

        match kind {
            FieldKind::Int => columns.push(le_i32(bytes).to_string()),
            FieldKind::Float => {
                let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                columns.push(render_float(value));
            }
            FieldKind::Char => columns.push(bytes[0].to_string()),
            FieldKind::DateTime => columns.push(render_timestamp(le_i32(bytes))),
            FieldKind::Escape | FieldKind::End => {}
        }
    }

    columns.join(",")
}

fn le_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn render_float(value: f32) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        "INF".to_string()
    } else {
        value.to_string()
    }
}

fn render_timestamp(secs: i32) -> String {
    match DateTime::from_timestamp(i64::from(secs), 0) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y/%m/%d %H:%M:%S")
            .to_string(),
        None => "NULL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(body: &[u8]) -> Vec<u8> {
        let mut out = body.to_vec();
        out.push(checksum(body));
        out.push(RECORD_SENTINEL);
        out
    }

    fn int_float_char() -> BinaryLayout {
        BinaryLayout::parse("int,int,float,char").unwrap()
    }

    fn body(device: i32, counter: i32, value: f32, flag: u8) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&device.to_le_bytes());
        b.extend_from_slice(&counter.to_le_bytes());
        b.extend_from_slice(&value.to_le_bytes());
        b.push(flag);
        b
    }

    #[test]
    fn test_layout_parse() {
        let layout = BinaryLayout::parse("int, float,char,esc,end").unwrap();
        assert_eq!(
            layout.fields(),
            &[
                FieldKind::Int,
                FieldKind::Float,
                FieldKind::Char,
                FieldKind::Escape,
                FieldKind::End
            ]
        );
        assert_eq!(layout.body_len(), 14);
        assert_eq!(layout.record_len(), 16);
    }

    #[test]
    fn test_layout_parse_errors() {
        assert!(BinaryLayout::parse("int,double").is_err());
        assert!(BinaryLayout::parse("").is_err());
    }

    #[test]
    fn test_decode_valid_record() {
        let layout = int_float_char();
        let buf = encode(&body(7, 42, 2.5, 3));

        let out = decode(&buf, &layout);
        assert_eq!(out.records, vec!["7,42,2.5,3"]);
        assert_eq!(out.consumed, buf.len());
        assert_eq!(out.skipped, 0);
    }

    #[test]
    fn test_decode_keeps_partial_record() {
        let layout = int_float_char();
        let mut buf = encode(&body(1, 1, 0.0, 0));
        let second = encode(&body(1, 2, 0.0, 0));
        buf.extend_from_slice(&second[..5]);

        let out = decode(&buf, &layout);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.consumed, layout.record_len());
    }

    #[test]
    fn test_bad_checksum_dropped_and_resynced() {
        let layout = int_float_char();
        let mut corrupt = encode(&body(1, 1, 1.0, 1));
        let body_len = layout.body_len();
        corrupt[body_len] ^= 0x55;

        let good = encode(&body(1, 2, 1.0, 1));
        let mut buf = corrupt.clone();
        buf.extend_from_slice(&good);

        let out = decode(&buf, &layout);
        assert_eq!(out.records, vec!["1,2,1,1"]);
        assert_eq!(out.skipped, corrupt.len());
        assert_eq!(out.consumed, buf.len());
    }

    #[test]
    fn test_bad_sentinel_dropped() {
        let layout = int_float_char();
        let mut buf = encode(&body(1, 1, 1.0, 1));
        let last = buf.len() - 1;
        buf[last] = 0xFE;

        let out = decode(&buf, &layout);
        assert!(out.records.is_empty());
        assert_eq!(out.skipped, 1);
        assert_eq!(out.consumed, 1);
    }

    #[test]
    fn test_resync_after_garbage_prefix() {
        let layout = int_float_char();
        let mut buf = vec![0x13, 0x37, 0x00];
        buf.extend_from_slice(&encode(&body(9, 100, -1.5, 255)));

        let out = decode(&buf, &layout);
        assert_eq!(out.records, vec!["9,100,-1.5,255"]);
        assert_eq!(out.skipped, 3);
    }

    #[test]
    fn test_float_sentinels() {
        let layout = BinaryLayout::parse("float,float").unwrap();
        let mut b = Vec::new();
        b.extend_from_slice(&f32::NAN.to_le_bytes());
        b.extend_from_slice(&f32::INFINITY.to_le_bytes());

        let out = decode(&encode(&b), &layout);
        assert_eq!(out.records, vec!["NAN,INF"]);
    }

    #[test]
    fn test_skipped_fields_not_rendered() {
        let layout = BinaryLayout::parse("esc,int,end").unwrap();
        let mut b = vec![0xAA; 4];
        b.extend_from_slice(&5i32.to_le_bytes());
        b.push(0x0D);

        let out = decode(&encode(&b), &layout);
        assert_eq!(out.records, vec!["5"]);
    }

    #[test]
    fn test_date_time_rendering_shape() {
        let layout = BinaryLayout::parse("date_time").unwrap();
        let out = decode(&encode(&1_700_000_000i32.to_le_bytes()), &layout);

        let rendered = &out.records[0];
        assert_eq!(rendered.len(), "2023/11/14 22:13:20".len());
        assert_eq!(&rendered[4..5], "/");
        assert_eq!(&rendered[13..14], ":");
    }

    #[test]
    fn test_random_noise_never_panics() {
        let layout = int_float_char();
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..200 {
            let len = rng.usize(0..64);
            let buf: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();
            let out = decode(&buf, &layout);
            assert!(out.consumed <= buf.len());
        }
    }
}
