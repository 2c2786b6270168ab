// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! telerec I/O layer
//!
//! Single-threaded readiness reactor used by the telerec ingestion service.
//!
//! # Architecture
//!
//! ```text
//! +-----------------------------------------------------------+
//! |                         Reactor                           |
//! |  +-----------------------------------------------------+  |
//! |  |                     mio::Poll                       |  |
//! |  |  - TCP listener (accept peers)                      |  |
//! |  |  - TCP streams (peers + outbound connections)       |  |
//! |  |  - timerfd timers (periodic)                        |  |
//! |  +-----------------------------------------------------+  |
//! |                           |                               |
//! |                           v                               |
//! |  +-------------+   +-------------+   +-----------------+  |
//! |  |   Accept    |   |  Read +     |   |   Timer fire    |  |
//! |  |  new conn   |   |  Framer     |   |   count         |  |
//! |  +-------------+   +-------------+   +-----------------+  |
//! |                           |                               |
//! |                           v                               |
//! |  +-----------------------------------------------------+  |
//! |  |        EventHandler::on_event(&mut Io, Event)       |  |
//! |  +-----------------------------------------------------+  |
//! +-----------------------------------------------------------+
//! ```
//!
//! Everything runs on the thread that calls [`Reactor::run`]. Handlers get a
//! `&mut Io` for the duration of the callback and use it to send, close,
//! connect or add timers.
//!
//! Timers use Linux `timerfd`, so this crate targets Linux.

pub mod connection;
pub mod error;
pub mod event;
pub mod framing;
pub mod reactor;
pub mod timer;

pub use connection::{ConnectionId, ConnectionKind};
pub use error::ReactorError;
pub use event::{Event, EventHandler};
pub use framing::{BinaryLayout, FieldKind, Framer, Framing};
pub use reactor::{Io, Reactor, ReactorConfig};
pub use timer::TimerId;
