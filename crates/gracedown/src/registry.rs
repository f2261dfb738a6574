//! Registry of the listeners a server is currently serving.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::listener::{ListenerHandle, ListenerId};

/// The set of active listeners of one server instance.
///
/// Once [`close_all`](Self::close_all) has run the registry stays closed:
/// later registrations close their listener straight away, so every listener
/// is either closed by `close_all` or never visible to it.
#[derive(Default)]
pub struct ListenerRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    listeners: HashMap<ListenerId, ListenerHandle>,
    closed: bool,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener to the active set.
    ///
    /// Returns `false`, after closing the listener, if the registry has
    /// already been closed.
    pub fn register(&self, listener: ListenerHandle) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            listener.close();
            return false;
        }
        state.listeners.insert(listener.id(), listener);
        true
    }

    /// Removes a listener from the active set.
    pub fn unregister(&self, id: ListenerId) {
        self.state.lock().listeners.remove(&id);
    }

    /// Detaches every registered listener and closes it.
    ///
    /// Returns the number of listeners closed by this call.
    pub fn close_all(&self) -> usize {
        let listeners = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.listeners)
        };

        listeners
            .into_values()
            .filter(|listener| listener.close())
            .count()
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Returns `true` if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once [`close_all`](Self::close_all) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &state.listeners.len())
            .field("closed", &state.closed)
            .finish()
    }
}
