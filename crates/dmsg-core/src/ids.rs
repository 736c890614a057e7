//! Stream ID arena
//!
//! IDs are handed out in two steps: [`IdManager::reserve`] claims a slot and
//! returns a [`Reservation`]; the caller either commits a value into it once
//! setup succeeded or lets it roll back. A reservation that is dropped
//! without commit rolls back, so failed setups never leak IDs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which IDs an allocator hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// 2, 4, 6, ...
    Even,
    /// 1, 3, 5, ...
    Odd,
}

enum Slot<V> {
    Reserved,
    Live(V),
}

struct IdState<V> {
    slots: HashMap<u16, Slot<V>>,
    last: u16,
    parity: Parity,
}

impl<V> IdState<V> {
    fn next_candidate(&self, id: u16) -> u16 {
        let next = id.wrapping_add(2);
        match self.parity {
            Parity::Even if next == 0 => 2,
            _ => next,
        }
    }

    fn capacity(&self) -> usize {
        match self.parity {
            Parity::Even => (u16::MAX / 2) as usize,
            Parity::Odd => (u16::MAX / 2) as usize + 1,
        }
    }
}

/// Arena of values indexed by session-scoped IDs
pub struct IdManager<V> {
    state: Arc<Mutex<IdState<V>>>,
}

impl<V> Clone for IdManager<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V: Clone> IdManager<V> {
    pub fn new(parity: Parity) -> Self {
        let last = match parity {
            Parity::Even => 0,
            Parity::Odd => u16::MAX,
        };
        Self {
            state: Arc::new(Mutex::new(IdState {
                slots: HashMap::new(),
                last,
                parity,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IdState<V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the next free ID after the last one handed out
    ///
    /// Returns None when every ID of this parity is in use.
    pub fn reserve(&self) -> Option<Reservation<V>> {
        let mut state = self.lock();
        if state.slots.len() >= state.capacity() {
            return None;
        }
        let mut id = state.last;
        loop {
            id = state.next_candidate(id);
            if id != 0 && !state.slots.contains_key(&id) {
                break;
            }
        }
        state.last = id;
        state.slots.insert(id, Slot::Reserved);
        Some(Reservation {
            id,
            manager: self.clone(),
            done: false,
        })
    }

    /// Store a value under an ID chosen by the peer
    ///
    /// Returns false, leaving the arena untouched, when the ID is taken.
    pub fn insert_at(&self, id: u16, value: V) -> bool {
        let mut state = self.lock();
        if id == 0 || state.slots.contains_key(&id) {
            return false;
        }
        state.slots.insert(id, Slot::Live(value));
        true
    }

    /// Live value of `id`
    pub fn get(&self, id: u16) -> Option<V> {
        match self.lock().slots.get(&id) {
            Some(Slot::Live(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Remove `id` if it holds a live value
    pub fn remove(&self, id: u16) -> Option<V> {
        let mut state = self.lock();
        match state.slots.get(&id) {
            Some(Slot::Live(_)) => match state.slots.remove(&id) {
                Some(Slot::Live(v)) => Some(v),
                _ => None,
            },
            _ => None,
        }
    }

    /// Remove `id` only if `pred` holds for its value
    pub fn remove_if(&self, id: u16, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut state = self.lock();
        match state.slots.get(&id) {
            Some(Slot::Live(v)) if pred(v) => match state.slots.remove(&id) {
                Some(Slot::Live(v)) => Some(v),
                _ => None,
            },
            _ => None,
        }
    }

    /// Remove every live value; reserved slots stay with their owners
    pub fn drain(&self) -> Vec<(u16, V)> {
        let mut state = self.lock();
        let live: Vec<u16> = state
            .slots
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Live(_)))
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::with_capacity(live.len());
        for id in live {
            if let Some(Slot::Live(v)) = state.slots.remove(&id) {
                out.push((id, v));
            }
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Number of occupied slots, reserved or live
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    fn commit(&self, id: u16, value: V) {
        self.lock().slots.insert(id, Slot::Live(value));
    }

    fn rollback(&self, id: u16) {
        let mut state = self.lock();
        if matches!(state.slots.get(&id), Some(Slot::Reserved)) {
            state.slots.remove(&id);
        }
    }
}

/// A tentatively claimed ID
///
/// Dropping it without [`Reservation::commit`] frees the ID.
pub struct Reservation<V: Clone> {
    id: u16,
    manager: IdManager<V>,
    done: bool,
}

impl<V: Clone> Reservation<V> {
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Store `value` under the reserved ID
    pub fn commit(mut self, value: V) -> u16 {
        self.done = true;
        self.manager.commit(self.id, value);
        self.id
    }

    /// Give the ID back
    pub fn rollback(mut self) {
        self.done = true;
        self.manager.rollback(self.id);
    }
}

impl<V: Clone> Drop for Reservation<V> {
    fn drop(&mut self) {
        if !self.done {
            self.manager.rollback(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity() {
        let even: IdManager<()> = IdManager::new(Parity::Even);
        let odd: IdManager<()> = IdManager::new(Parity::Odd);
        let a = even.reserve().unwrap();
        let b = even.reserve().unwrap();
        assert_eq!((a.id(), b.id()), (2, 4));
        assert_eq!(odd.reserve().unwrap().id(), 1);
    }

    #[test]
    fn test_reserve_n_fail_m() {
        let ids: IdManager<u32> = IdManager::new(Parity::Even);

        let reservations: Vec<_> = (0..10).map(|_| ids.reserve().unwrap()).collect();
        assert_eq!(ids.len(), 10);

        let mut failed = Vec::new();
        for (i, r) in reservations.into_iter().enumerate() {
            if i % 3 == 0 {
                failed.push(r.id());
                r.rollback();
            } else {
                r.commit(i as u32);
            }
        }

        assert_eq!(ids.len(), 10 - failed.len());
        for id in &failed {
            assert!(ids.get(*id).is_none());
            assert!(ids.insert_at(*id, 99), "id {} should be free again", id);
        }
    }

    #[test]
    fn test_dropped_reservation_rolls_back() {
        let ids: IdManager<u32> = IdManager::new(Parity::Even);
        let id = {
            let r = ids.reserve().unwrap();
            r.id()
        };
        assert!(ids.is_empty());
        assert!(ids.insert_at(id, 1));
    }

    #[test]
    fn test_reserved_slot_is_not_live() {
        let ids: IdManager<u32> = IdManager::new(Parity::Even);
        let r = ids.reserve().unwrap();
        assert!(ids.get(r.id()).is_none());
        assert!(!ids.insert_at(r.id(), 5));
        assert!(ids.remove(r.id()).is_none());
        let id = r.commit(7);
        assert_eq!(ids.get(id), Some(7));
        assert_eq!(ids.remove(id), Some(7));
    }

    #[test]
    fn test_cycles_past_last_id() {
        let ids: IdManager<()> = IdManager::new(Parity::Even);
        let first = ids.reserve().unwrap().commit(());
        ids.remove(first);
        let second = ids.reserve().unwrap().id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_exhaustion() {
        let ids: IdManager<()> = IdManager::new(Parity::Odd);
        let mut count = 0;
        while let Some(r) = ids.reserve() {
            r.commit(());
            count += 1;
        }
        assert_eq!(count, 32768);
        ids.remove(101);
        assert_eq!(ids.reserve().unwrap().id(), 101);
    }

    #[test]
    fn test_drain_keeps_reservations() {
        let ids: IdManager<u8> = IdManager::new(Parity::Even);
        let pending = ids.reserve().unwrap();
        ids.reserve().unwrap().commit(1);
        let drained = ids.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(ids.len(), 1);
        drop(pending);
        assert!(ids.is_empty());
    }
}
