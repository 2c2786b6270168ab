// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol violations.
//!
//! A rejected record closes its connection. Store failures are not errors
//! of this kind: they are retried by the cache engine.

use thiserror::Error;

use crate::record::DeviceId;

/// Why a record was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("record has {found} fields, at least {required} required")]
    TooFewFields { found: usize, required: usize },

    #[error("malformed device id '{0}'")]
    MalformedDeviceId(String),

    #[error("malformed counter '{0}'")]
    MalformedCounter(String),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
}
