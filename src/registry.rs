//! Process-wide map from connection fingerprint to live handler
//!
//! The registry is the sole owner of handlers; handlers refer back only by
//! fingerprint key. At most one live handler exists per fingerprint. Entries
//! are installed before the dial completes so concurrent subscribers join
//! the in-flight connection instead of racing their own.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::fingerprint::ConnectionKey;
use crate::handler::ConnectionHandler;

/// Registry of live connection handlers keyed by fingerprint.
pub(crate) struct HandlerRegistry {
    handlers: Mutex<AHashMap<ConnectionKey, Arc<ConnectionHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Mutex::new(AHashMap::new()),
        }
    }

    /// Return the live handler for `key`, or install the one produced by
    /// `factory`. The boolean is `true` when a new handler was installed;
    /// the caller then runs its dial-and-serve task outside this lock. A
    /// stored handler that already stopped accepting is replaced, not
    /// returned; its own release later no-ops on the pointer comparison.
    pub(crate) fn acquire_or_create(
        &self,
        key: &ConnectionKey,
        factory: impl FnOnce() -> Arc<ConnectionHandler>,
    ) -> (Arc<ConnectionHandler>, bool) {
        let mut handlers = self.handlers.lock();
        if let Some(existing) = handlers.get(key) {
            if existing.is_live() {
                return (existing.clone(), false);
            }
        }
        let handler = factory();
        handlers.insert(key.clone(), handler.clone());
        (handler, true)
    }

    /// Remove the entry for `key` only while it still holds `handler`.
    /// Returns whether an entry was removed.
    pub(crate) fn release(&self, key: &ConnectionKey, handler: &Arc<ConnectionHandler>) -> bool {
        let mut handlers = self.handlers.lock();
        match handlers.get(key) {
            Some(stored) if Arc::ptr_eq(stored, handler) => {
                handlers.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Number of registered handlers.
    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().len()
    }
}
