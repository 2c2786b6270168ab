// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactor errors.

use std::io;
use thiserror::Error;

/// Errors that stop the reactor loop.
///
/// Connection-level failures never surface here; they are logged and the
/// connection is released.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The readiness wait itself failed.
    #[error("poll error: {0}")]
    Poll(#[source] io::Error),

    /// A timer read failed with something other than `WouldBlock`. Fatal.
    #[error("timer '{name}' read failed: {source}")]
    TimerFailure {
        /// Timer name given at creation
        name: String,
        #[source]
        source: io::Error,
    },
}
