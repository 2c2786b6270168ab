// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Events dispatched by the reactor.

use std::net::SocketAddr;

use crate::connection::{ConnectionId, ConnectionKind};
use crate::reactor::Io;
use crate::timer::TimerId;

/// Something happened on a reactor-owned resource.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// A peer was accepted on the listening endpoint.
    Connected {
        /// New connection
        conn: ConnectionId,
        /// Remote address
        peer: SocketAddr,
    },

    /// The remote side closed the connection in an orderly way.
    ///
    /// Delivered before the connection is released, so `Io` still knows it.
    Disconnected {
        /// Closing connection
        conn: ConnectionId,
        /// Remote address
        peer: SocketAddr,
        /// Peer or outbound
        kind: ConnectionKind,
    },

    /// One complete record arrived.
    Data {
        /// Source connection
        conn: ConnectionId,
        /// Remote address
        peer: SocketAddr,
        /// Record text without terminator
        record: &'a str,
    },

    /// A periodic timer fired.
    Timer {
        /// Timer handle
        timer: TimerId,
        /// Name given at creation
        name: &'a str,
        /// Expirations since the previous event (usually 1)
        expirations: u64,
    },
}

/// Consumer of reactor events.
///
/// Called on the reactor thread; the `Io` borrow is valid only for the
/// duration of the call.
pub trait EventHandler {
    fn on_event(&mut self, io: &mut Io, event: Event<'_>);
}
