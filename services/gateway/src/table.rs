//! Slab session table with generation handles.
//!
//! Channels and the user map hold [`SessionId`] values instead of owning
//! references; a lookup compares generations and returns nothing once the
//! slot was removed or reused.  This invalidates every outstanding handle
//! to a session at once, with no reference-counting cycles.

use std::fmt;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::filter::SubscriptionFilter;
use crate::session::Outbound;

/// Packed (index, generation) handle to a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn new(index: usize, generation: u32) -> Self {
        SessionId(u64::from(generation) << 32 | index as u64)
    }

    fn index(self) -> usize {
        (self.0 & u64::from(u32::MAX)) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}.{}", self.index(), self.generation())
    }
}

/// Worker-side state of one live session.
pub struct Slot {
    generation: u32,
    tx: mpsc::UnboundedSender<Outbound>,
    /// Set on login/register; `None` means unauthenticated (or a kicked
    /// session whose identity was cleared).
    pub user_id: Option<String>,
    pub remaining_posts: i64,
    pub filter: SubscriptionFilter,
}

impl Slot {
    pub fn send_frame(&self, payload: Utf8Bytes, persist: bool) {
        let _ = self.tx.send(Outbound::Frame { payload, persist });
    }

    pub fn notify_logged_in(&self) {
        let _ = self.tx.send(Outbound::LoggedIn);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown);
    }

    /// True once the session task has torn down its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
pub struct SessionTable {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    next_generation: u32,
    live: usize,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            slots: Vec::new(),
            free: Vec::new(),
            next_generation: 0,
            live: 0,
        }
    }

    pub fn insert(&mut self, tx: mpsc::UnboundedSender<Outbound>) -> SessionId {
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        let slot = Slot {
            generation: self.next_generation,
            tx,
            user_id: None,
            remaining_posts: 0,
            filter: SubscriptionFilter::default(),
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.live += 1;
        SessionId::new(index, self.next_generation)
    }

    pub fn get(&self, id: SessionId) -> Option<&Slot> {
        self.slots
            .get(id.index())?
            .as_ref()
            .filter(|slot| slot.generation == id.generation())
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index())?
            .as_mut()
            .filter(|slot| slot.generation == id.generation())
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Slot> {
        let entry = self.slots.get_mut(id.index())?;
        if entry.as_ref()?.generation != id.generation() {
            return None;
        }
        let slot = entry.take();
        self.free.push(id.index());
        self.live -= 1;
        slot
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &Slot)> {
        self.slots.iter().enumerate().filter_map(|(index, entry)| {
            entry
                .as_ref()
                .map(|slot| (SessionId::new(index, slot.generation), slot))
        })
    }
}
