// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection handles and the generation-checked slot arena.
//!
//! Connections are addressed by [`ConnectionId`], a slot index plus the
//! slot's generation at insertion time. Removing a connection bumps the
//! generation, so an id held by a handler after the connection is gone
//! resolves to nothing instead of aliasing a newer connection in the same
//! slot.
//!
//! Freed slots are parked until [`Arena::recycle`] is called at the end of a
//! poll sweep. Readiness events still queued for a slot released earlier in
//! the same sweep therefore find the slot empty.

use std::fmt;
use std::net::SocketAddr;

use mio::net::TcpStream;

use crate::framing::Framer;

/// Stable handle to a reactor-owned connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    /// Slot index inside the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this connection was inserted.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

/// How the connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Accepted on the listening endpoint
    Peer,
    /// Opened by [`crate::Io::connect`]
    Outbound,
}

/// Reactor-side connection state.
#[derive(Debug)]
pub(crate) struct Connection {
    /// Non-blocking stream
    pub(crate) stream: TcpStream,

    /// Remote address
    pub(crate) peer_addr: SocketAddr,

    /// Peer or outbound
    pub(crate) kind: ConnectionKind,

    /// Record extraction state
    pub(crate) framer: Framer,

    /// Bytes waiting for a writable event
    pub(crate) send_queue: Vec<u8>,

    /// Offset of the first unsent byte in `send_queue`
    pub(crate) send_offset: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena with generation-checked ids.
#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    released: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            released: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a value and return its id.
    pub(crate) fn insert(&mut self, value: T) -> ConnectionId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ConnectionId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ConnectionId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Id of the current occupant of `index`, if any.
    pub(crate) fn id_at(&self, index: usize) -> Option<ConnectionId> {
        let slot = self.slots.get(index)?;
        slot.value.as_ref().map(|_| ConnectionId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    /// Remove a value. The slot stays parked until [`Arena::recycle`].
    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.released.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Make slots released since the last call available again.
    pub(crate) fn recycle(&mut self) {
        self.free.append(&mut self.released);
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        (0..self.slots.len())
            .filter_map(|index| self.id_at(index))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_ne!(a, b);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_id_after_remove() {
        let mut arena = Arena::new();
        let a = arena.insert(1u32);

        assert_eq!(arena.remove(a), Some(1));
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_released_slot_not_reused_before_recycle() {
        let mut arena = Arena::new();
        let a = arena.insert(1u32);
        arena.remove(a);

        let b = arena.insert(2u32);
        assert_ne!(a.index(), b.index());
        assert!(arena.id_at(a.index() as usize).is_none());
    }

    #[test]
    fn test_recycled_slot_gets_new_generation() {
        let mut arena = Arena::new();
        let a = arena.insert(1u32);
        arena.remove(a);
        arena.recycle();

        let b = arena.insert(2u32);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.id_at(b.index() as usize), Some(b));
    }

    #[test]
    fn test_ids_lists_live_slots() {
        let mut arena = Arena::new();
        let a = arena.insert('a');
        let b = arena.insert('b');
        let c = arena.insert('c');
        arena.remove(b);

        assert_eq!(arena.ids(), vec![a, c]);
    }

    #[test]
    fn test_display() {
        let mut arena = Arena::new();
        let a = arena.insert(());
        assert_eq!(a.to_string(), "conn#0.0");
    }
}
