// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Readiness reactor.
//!
//! One `mio::Poll` multiplexes the listening socket, every accepted and
//! outbound connection, and the periodic timers. [`Reactor::run`] blocks in
//! the readiness wait, then walks the ready set and dispatches
//! [`Event`]s to a single [`EventHandler`].
//!
//! Reads are edge-triggered: a readable connection is drained until
//! `WouldBlock`, feeding every chunk through the connection's [`Framer`] in
//! arrival order. Writes go through a per-connection queue flushed
//! immediately and again on writable events.
//!
//! Failure policy:
//!
//! - bind, connect and accept failures are logged and yield `None`
//! - connection read/write errors release the connection without a
//!   `Disconnected` event
//! - a timer read failure other than `WouldBlock` ends [`Reactor::run`] with
//!   [`ReactorError::TimerFailure`]

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};

use crate::connection::{Arena, Connection, ConnectionId, ConnectionKind};
use crate::error::ReactorError;
use crate::event::{Event, EventHandler};
use crate::framing::{Framer, Framing, DEFAULT_MAX_BUFFERED};
use crate::timer::{Timer, TimerId};

// ============================================================================
// Constants
// ============================================================================

/// Token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// First timer token
const TIMER_TOKEN_START: usize = 1;

/// Maximum number of timers per reactor
const MAX_TIMERS: usize = 1023;

/// First connection token
const CONNECTION_TOKEN_START: usize = TIMER_TOKEN_START + MAX_TIMERS;

/// Default per-read buffer size
pub const DEFAULT_RECEIVE_BUFFER: usize = 512;

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default events processed per poll
const DEFAULT_MAX_EVENTS: usize = 128;

// ============================================================================
// Configuration
// ============================================================================

/// Reactor settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Record encoding for every connection
    pub framing: Framing,

    /// Bytes read per `read` call
    pub receive_buffer_size: usize,

    /// Unterminated bytes kept per connection before discarding
    pub max_buffered_bytes: usize,

    /// TCP_NODELAY on accepted and outbound streams
    pub nodelay: bool,

    /// Timeout for [`Io::connect`]
    pub connect_timeout: Duration,

    /// Capacity of the poll event buffer
    pub max_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED,
            nodelay: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

// ============================================================================
// Reactor
// ============================================================================

/// Owns the poll instance and drives the event loop.
pub struct Reactor {
    poll: Poll,
    events: Events,
    io: Io,
}

/// Reactor resources, handed to event handlers.
pub struct Io {
    registry: Registry,
    config: ReactorConfig,
    listener: Option<TcpListener>,
    connections: Arena<Connection>,
    timers: Vec<Timer>,
    read_buf: Vec<u8>,
    running: bool,
}

impl Reactor {
    /// Create a reactor with no listener, connections or timers.
    pub fn new(config: ReactorConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let events = Events::with_capacity(config.max_events.max(1));
        let read_buf = vec![0u8; config.receive_buffer_size.max(1)];

        Ok(Self {
            poll,
            events,
            io: Io {
                registry,
                config,
                listener: None,
                connections: Arena::new(),
                timers: Vec::new(),
                read_buf,
                running: false,
            },
        })
    }

    /// Resource access outside of event handling (setup, tests).
    pub fn io(&mut self) -> &mut Io {
        &mut self.io
    }

    /// Run until a handler calls [`Io::stop`] or a fatal error occurs.
    ///
    /// All connections are released when the loop exits.
    pub fn run<H: EventHandler>(&mut self, handler: &mut H) -> Result<(), ReactorError> {
        self.io.running = true;
        let result = self.run_loop(handler);
        self.io.shutdown();
        result
    }

    fn run_loop<H: EventHandler>(&mut self, handler: &mut H) -> Result<(), ReactorError> {
        while self.io.running {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ReactorError::Poll(e));
            }

            for event in self.events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.io.accept_all(handler),
                    Token(t) if t < CONNECTION_TOKEN_START => {
                        self.io.fire_timer(t - TIMER_TOKEN_START, handler)?;
                    }
                    Token(t) => {
                        let Some(id) = self.io.connections.id_at(t - CONNECTION_TOKEN_START)
                        else {
                            continue;
                        };
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.io.handle_readable(id, handler);
                        }
                        if event.is_writable() && self.io.connections.contains(id) {
                            self.io.handle_writable(id);
                        }
                    }
                }
            }

            self.io.connections.recycle();
        }
        Ok(())
    }
}

impl Io {
    // ------------------------------------------------------------------------
    // Resource creation
    // ------------------------------------------------------------------------

    /// Start listening on `addr`. Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr) -> Option<SocketAddr> {
        if self.listener.is_some() {
            log::error!("[reactor] already listening, ignoring {}", addr);
            return None;
        }

        let mut listener = match TcpListener::bind(addr) {
            Ok(l) => l,
            Err(e) => {
                log::error!("[reactor] bind {} failed: {}", addr, e);
                return None;
            }
        };
        if let Err(e) = self
            .registry
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        {
            log::error!("[reactor] listener registration failed: {}", e);
            return None;
        }

        let local = listener.local_addr().ok();
        log::info!("[reactor] listening on {}", local.unwrap_or(addr));
        self.listener = Some(listener);
        local
    }

    /// Bound listener address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Open an outbound connection.
    ///
    /// The connect itself is blocking, bounded by `connect_timeout`.
    pub fn connect(&mut self, addr: SocketAddr) -> Option<ConnectionId> {
        let stream = match std::net::TcpStream::connect_timeout(&addr, self.config.connect_timeout)
        {
            Ok(s) => s,
            Err(e) => {
                log::error!("[reactor] connect {} failed: {}", addr, e);
                return None;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            log::error!("[reactor] set_nonblocking on {} failed: {}", addr, e);
            return None;
        }

        let id = self.adopt(TcpStream::from_std(stream), addr, ConnectionKind::Outbound)?;
        log::debug!("[reactor] {} connected to {}", id, addr);
        Some(id)
    }

    /// Add a periodic timer firing every `interval`.
    pub fn add_timer(&mut self, name: &str, interval: Duration) -> Option<TimerId> {
        if self.timers.len() >= MAX_TIMERS {
            log::error!("[reactor] timer limit ({}) reached", MAX_TIMERS);
            return None;
        }

        let mut timer = match Timer::new(name, interval) {
            Ok(t) => t,
            Err(e) => {
                log::error!("[reactor] timer '{}' creation failed: {}", name, e);
                return None;
            }
        };

        let id = TimerId(self.timers.len());
        let token = Token(TIMER_TOKEN_START + id.0);
        if let Err(e) = self.registry.register(&mut timer, token, Interest::READABLE) {
            log::error!("[reactor] timer '{}' registration failed: {}", name, e);
            return None;
        }

        log::debug!(
            "[reactor] timer '{}' every {:?}",
            timer.name(),
            timer.interval()
        );
        self.timers.push(timer);
        Some(id)
    }

    // ------------------------------------------------------------------------
    // Connection operations
    // ------------------------------------------------------------------------

    /// Queue `data` and write as much as the socket accepts now.
    ///
    /// On a write error the connection is released and the error returned.
    pub fn send(&mut self, conn: ConnectionId, data: &[u8]) -> io::Result<()> {
        let Some(c) = self.connections.get_mut(conn) else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is not open", conn),
            ));
        };
        c.send_queue.extend_from_slice(data);

        if let Err(e) = self.flush(conn) {
            log::warn!("[reactor] write error on {}: {}", conn, e);
            self.release(conn);
            return Err(e);
        }
        Ok(())
    }

    /// Close and release a connection. No `Disconnected` event is emitted.
    pub fn close(&mut self, conn: ConnectionId) -> bool {
        let released = self.release(conn);
        if released {
            log::debug!("[reactor] {} closed locally", conn);
        }
        released
    }

    pub fn is_open(&self, conn: ConnectionId) -> bool {
        self.connections.contains(conn)
    }

    pub fn peer_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(conn).map(|c| c.peer_addr)
    }

    pub fn kind(&self, conn: ConnectionId) -> Option<ConnectionKind> {
        self.connections.get(conn).map(|c| c.kind)
    }

    /// Open connections of both kinds.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Ids of open connections.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.ids()
    }

    /// Leave [`Reactor::run`] after the current sweep.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Release every connection and the listener.
    pub fn shutdown(&mut self) {
        for id in self.connections.ids() {
            self.release(id);
        }
        self.connections.recycle();
        if let Some(mut listener) = self.listener.take() {
            let _ = self.registry.deregister(&mut listener);
        }
    }

    // ------------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------------

    fn accept_all<H: EventHandler>(&mut self, handler: &mut H) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    let Some(id) = self.adopt(stream, peer, ConnectionKind::Peer) else {
                        continue;
                    };
                    log::debug!("[reactor] accepted {} from {}", id, peer);
                    handler.on_event(self, Event::Connected { conn: id, peer });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("[reactor] accept error: {}", e);
                    return;
                }
            }
        }
    }

    fn fire_timer<H: EventHandler>(
        &mut self,
        index: usize,
        handler: &mut H,
    ) -> Result<(), ReactorError> {
        let Some(timer) = self.timers.get(index) else {
            return Ok(());
        };

        match timer.read_expirations() {
            Ok(expirations) => {
                let name = timer.name().to_string();
                handler.on_event(
                    self,
                    Event::Timer {
                        timer: TimerId(index),
                        name: &name,
                        expirations,
                    },
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::warn!("[reactor] timer '{}' read would block", timer.name());
                Ok(())
            }
            Err(source) => {
                log::error!("[reactor] timer '{}' read failed: {}", timer.name(), source);
                Err(ReactorError::TimerFailure {
                    name: timer.name().to_string(),
                    source,
                })
            }
        }
    }

    fn handle_readable<H: EventHandler>(&mut self, id: ConnectionId, handler: &mut H) {
        let mut buf = std::mem::take(&mut self.read_buf);

        loop {
            let Some(conn) = self.connections.get_mut(id) else {
                break;
            };
            let peer = conn.peer_addr;

            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    let kind = conn.kind;
                    log::debug!("[reactor] {} ({}) closed by peer", id, peer);
                    handler.on_event(
                        self,
                        Event::Disconnected {
                            conn: id,
                            peer,
                            kind,
                        },
                    );
                    self.release(id);
                    break;
                }
                Ok(n) => {
                    let records = conn.framer.push(&buf[..n]);
                    for record in &records {
                        // Handler may have closed it on a previous record.
                        if !self.connections.contains(id) {
                            break;
                        }
                        handler.on_event(
                            self,
                            Event::Data {
                                conn: id,
                                peer,
                                record: record.as_str(),
                            },
                        );
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("[reactor] read error on {} ({}): {}", id, peer, e);
                    self.release(id);
                    break;
                }
            }
        }

        self.read_buf = buf;
    }

    fn handle_writable(&mut self, id: ConnectionId) {
        if let Err(e) = self.flush(id) {
            log::warn!("[reactor] write error on {}: {}", id, e);
            self.release(id);
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn adopt(
        &mut self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        kind: ConnectionKind,
    ) -> Option<ConnectionId> {
        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            log::debug!("[reactor] set_nodelay for {} failed: {}", peer_addr, e);
        }

        let framer = Framer::new(self.config.framing.clone(), self.config.max_buffered_bytes);
        let id = self.connections.insert(Connection {
            stream,
            peer_addr,
            kind,
            framer,
            send_queue: Vec::new(),
            send_offset: 0,
        });

        let token = Token(CONNECTION_TOKEN_START + id.index() as usize);
        let conn = self.connections.get_mut(id)?;
        if let Err(e) = self.registry.register(
            &mut conn.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            log::error!("[reactor] registering {} failed: {}", peer_addr, e);
            self.connections.remove(id);
            return None;
        }
        Some(id)
    }

    fn flush(&mut self, id: ConnectionId) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(id) else {
            return Ok(());
        };

        while conn.send_offset < conn.send_queue.len() {
            match conn.stream.write(&conn.send_queue[conn.send_offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed during write",
                    ));
                }
                Ok(n) => conn.send_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        conn.send_queue.clear();
        conn.send_offset = 0;
        Ok(())
    }

    fn release(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(id) {
            Some(mut conn) => {
                let _ = self.registry.deregister(&mut conn.stream);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
