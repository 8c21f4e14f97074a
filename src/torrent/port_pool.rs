use std::collections::HashSet;
use std::sync::Mutex;

/// The pool of torrent listen ports available within a session.
/// The pool and the ports currently assigned to torrents always partition the configured range.
#[derive(Debug)]
pub struct PortPool {
    ports: Mutex<HashSet<u16>>,
}

impl PortPool {
    /// Create a new port pool holding the full `[begin, end)` range.
    pub fn new(begin: u16, end: u16) -> Self {
        Self {
            ports: Mutex::new((begin..end).collect()),
        }
    }

    /// Take an arbitrary free port from the pool.
    ///
    /// # Returns
    ///
    /// It returns [None] when the pool is exhausted.
    pub fn acquire(&self) -> Option<u16> {
        let mut ports = self.ports.lock().expect("port pool lock poisoned");
        let port = ports.iter().next().copied()?;
        ports.remove(&port);
        Some(port)
    }

    /// Return the given port to the pool.
    pub fn release(&self, port: u16) {
        self.ports
            .lock()
            .expect("port pool lock poisoned")
            .insert(port);
    }

    /// Remove the given port from the pool.
    /// Used during restoration when a torrent already owns its persisted port.
    pub fn remove(&self, port: u16) -> bool {
        self.ports
            .lock()
            .expect("port pool lock poisoned")
            .remove(&port)
    }

    /// Get the number of free ports within the pool.
    pub fn len(&self) -> usize {
        self.ports.lock().expect("port pool lock poisoned").len()
    }
}
