// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Acknowledgment payloads.

use std::fmt;

use serde::Serialize;

use crate::record::Counter;

/// Resend request sent back to a device.
///
/// `count == 0` confirms the device is current: nothing to resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub start: Counter,
    pub count: u64,
}

impl Ack {
    pub fn new(start: Counter, count: u64) -> Self {
        Self { start, count }
    }

    /// Wire form: `SERVER:<start>,<count>\r\n`.
    pub fn to_wire(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SERVER:{},{}", self.start, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(Ack::new(3, 2).to_wire(), "SERVER:3,2\r\n");
        assert_eq!(Ack::new(41, 0).to_string(), "SERVER:41,0");
    }
}
