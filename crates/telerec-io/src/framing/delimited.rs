// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Terminator-delimited text records.

/// Split every complete record out of `buf`.
///
/// Returns the records in arrival order and the number of bytes consumed,
/// terminators included. Bytes after the last terminator are left for the
/// next call. Non-UTF-8 bytes are replaced rather than rejected.
pub fn split_records(buf: &[u8], terminator: u8) -> (Vec<String>, usize) {
    let mut records = Vec::new();
    let mut consumed = 0;

    while let Some(pos) = buf[consumed..].iter().position(|&b| b == terminator) {
        let body = &buf[consumed..consumed + pos];
        records.push(String::from_utf8_lossy(body).into_owned());
        consumed += pos + 1;
    }

    (records, consumed)
}
