//! Local port allocation
//!
//! A [`Porter`] maps 16-bit ports to values (listeners, connections) and
//! hands out a [`PortGuard`] per reservation. Releasing a guard is
//! idempotent and only ever frees the reservation it was created for.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

/// First port handed out by [`Porter::reserve_ephemeral`]
pub const MIN_EPHEMERAL: u16 = 49152;

struct PortState<V> {
    ports: HashMap<u16, (u64, V)>,
    next_ephemeral: u16,
    next_token: u64,
}

/// Port-to-value table with reservation guards
pub struct Porter<V> {
    state: Arc<RwLock<PortState<V>>>,
}

impl<V> Clone for Porter<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Porter<V> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(PortState {
                ports: HashMap::new(),
                next_ephemeral: MIN_EPHEMERAL,
                next_token: 0,
            })),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PortState<V>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PortState<V>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, state: &mut PortState<V>, port: u16, value: V) -> PortGuard {
        let token = state.next_token;
        state.next_token += 1;
        state.ports.insert(port, (token, value));

        let weak = Arc::downgrade(&self.state);
        PortGuard::new(port, move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.write().unwrap_or_else(|e| e.into_inner());
                if state.ports.get(&port).is_some_and(|(t, _)| *t == token) {
                    let removed = state.ports.remove(&port);
                    drop(state);
                    drop(removed);
                }
            }
        })
    }

    /// Reserve `port`, returning None when it is 0 or already taken
    pub fn reserve(&self, port: u16, value: V) -> Option<PortGuard> {
        if port == 0 {
            return None;
        }
        let mut state = self.write();
        if state.ports.contains_key(&port) {
            return None;
        }
        Some(self.insert(&mut state, port, value))
    }

    /// Reserve the next free port at or above [`MIN_EPHEMERAL`]
    ///
    /// Allocation cycles through the ephemeral range; None means every
    /// ephemeral port is taken.
    pub fn reserve_ephemeral(&self, value: V) -> Option<(u16, PortGuard)> {
        let mut state = self.write();
        let span = (u16::MAX - MIN_EPHEMERAL) as u32 + 1;
        let mut port = state.next_ephemeral;
        for _ in 0..span {
            let candidate = port;
            port = if port == u16::MAX {
                MIN_EPHEMERAL
            } else {
                port + 1
            };
            if !state.ports.contains_key(&candidate) {
                state.next_ephemeral = port;
                let guard = self.insert(&mut state, candidate, value);
                return Some((candidate, guard));
            }
        }
        None
    }

    /// Value bound to `port`
    pub fn port_value(&self, port: u16) -> Option<V> {
        self.read().ports.get(&port).map(|(_, v)| v.clone())
    }

    /// Snapshot of every reserved port and its value
    pub fn port_values(&self) -> Vec<(u16, V)> {
        let mut values: Vec<(u16, V)> = self
            .read()
            .ports
            .iter()
            .map(|(port, (_, v))| (*port, v.clone()))
            .collect();
        values.sort_by_key(|(port, _)| *port);
        values
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.read().ports.contains_key(&port)
    }

    /// Number of reserved ports
    pub fn len(&self) -> usize {
        self.read().ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().ports.is_empty()
    }

    /// Drop every reservation, returning the values that were bound
    ///
    /// Outstanding guards become no-ops.
    pub fn drain(&self) -> Vec<(u16, V)> {
        let mut state = self.write();
        let mut values: Vec<(u16, V)> = state.ports.drain().map(|(p, (_, v))| (p, v)).collect();
        values.sort_by_key(|(port, _)| *port);
        values
    }
}

impl<V: Clone + Send + Sync + 'static> Default for Porter<V> {
    fn default() -> Self {
        Self::new()
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Reservation of a single port
///
/// The port is released by [`PortGuard::release`] or on drop, whichever
/// comes first; later calls do nothing.
pub struct PortGuard {
    port: u16,
    release: Mutex<Option<ReleaseFn>>,
}

impl PortGuard {
    fn new(port: u16, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            port,
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Release the port; returns whether this call released it
    pub fn release(&self) -> bool {
        let release = self
            .release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match release {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PortGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortGuard")
            .field("port", &self.port)
            .field("released", &self.is_released())
            .finish()
    }
}
