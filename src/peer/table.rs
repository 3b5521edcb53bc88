//! Handle-based connection registry.
//!
//! Asynchronous work (disk jobs, broadcasts) never holds a connection
//! directly. It holds a [`ConnectionHandle`] and delivers its result through
//! the [`EventRouter`]. Once a connection is removed its slot's generation
//! moves on, so stale handles simply miss.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::piece::PeerRequest;
use crate::settings::PeerSettings;
use crate::torrent::DiskError;

/// Stable reference to a slot in a [`ConnectionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena with generation-checked handles.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> ConnectionTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> ConnectionHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ConnectionHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ConnectionHandle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    ConnectionHandle {
                        index: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }
}

/// Work delivered to a connection from outside its own task.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A block write finished.
    DiskWrite {
        request: PeerRequest,
        result: Result<(), DiskError>,
    },
    /// A block read for upload finished.
    DiskRead {
        request: PeerRequest,
        result: Result<Bytes, DiskError>,
    },
    /// The torrent verified a new piece.
    WeHave(u32),
    /// The choker decided to stop serving the peer.
    Choke,
    /// The choker decided to serve the peer.
    Unchoke,
    /// New settings snapshot.
    Reconfigure(Arc<PeerSettings>),
    /// Close the connection.
    Shutdown,
}

/// Routes [`ConnectionEvent`]s to live connections by handle.
#[derive(Debug, Default)]
pub struct EventRouter {
    table: Mutex<ConnectionTable<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns its handle and event receiver.
    pub fn register(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.table.lock().insert(tx);
        (handle, rx)
    }

    pub fn unregister(&self, handle: ConnectionHandle) {
        self.table.lock().remove(handle);
    }

    /// Delivers an event. Returns `false` if the connection is gone.
    pub fn post(&self, handle: ConnectionHandle, event: ConnectionEvent) -> bool {
        let table = self.table.lock();
        match table.get(handle) {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                trace!(?handle, "event for removed connection dropped");
                false
            }
        }
    }

    /// Delivers an event to every live connection.
    pub fn broadcast(&self, event: ConnectionEvent) {
        let table = self.table.lock();
        for (_, tx) in table.iter() {
            let _ = tx.send(event.clone());
        }
    }

    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.table.lock().contains(handle)
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
