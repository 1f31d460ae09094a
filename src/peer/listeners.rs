use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use log::debug;

/// Handle returned by `add_*_listener`, unique for the manager's lifetime
pub type ListenerId = u64;

struct RegistryInner<F: ?Sized> {
    active: HashMap<ListenerId, Arc<F>>,
    pending_add: Vec<(ListenerId, Arc<F>)>,
    pending_remove: Vec<ListenerId>,
}

/// One callback registry (connection, disconnection, or data)
///
/// Adds and removes issued while an event is being dispatched are buffered
/// and applied at the entry of the next dispatch, so a listener may mutate
/// the registry without invalidating the traversal it is part of.
pub struct ListenerRegistry<F: ?Sized> {
    inner: Mutex<RegistryInner<F>>,
}

impl<F: ?Sized> ListenerRegistry<F> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                active: HashMap::new(),
                pending_add: Vec::new(),
                pending_remove: Vec::new(),
            }),
        }
    }

    /// Register a callback under a caller-allocated id
    pub fn add(&self, id: ListenerId, listener: Arc<F>) {
        let mut inner = self.inner.lock().unwrap();
        debug!("Adding listener (id: {})", id);
        inner.pending_add.push((id, listener));
    }

    /// Remove a callback; `true` at most once per id
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.active.contains_key(&id) {
            if inner.pending_remove.contains(&id) {
                return false;
            }
            debug!("Removing listener (id: {})", id);
            inner.pending_remove.push(id);
            return true;
        }

        // Not yet applied; retract the pending addition
        if let Some(pos) = inner.pending_add.iter().position(|(other, _)| *other == id) {
            debug!("Removing pending listener (id: {})", id);
            inner.pending_add.swap_remove(pos);
            return true;
        }

        false
    }

    /// Drop every callback, applied and pending
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.clear();
        inner.pending_add.clear();
        inner.pending_remove.clear();
    }

    /// Apply pending mutations, then hand out the callbacks to invoke
    ///
    /// The lock is released before the caller runs any of them.
    pub fn snapshot(&self) -> Vec<(ListenerId, Arc<F>)> {
        let mut inner = self.inner.lock().unwrap();

        let added: Vec<_> = inner.pending_add.drain(..).collect();
        for (id, listener) in added {
            inner.active.insert(id, listener);
        }
        let removed: Vec<_> = inner.pending_remove.drain(..).collect();
        for id in removed {
            inner.active.remove(&id);
        }

        let mut snapshot: Vec<(ListenerId, Arc<F>)> = inner
            .active
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);
        snapshot
    }

    /// Number of callbacks, counting pending mutations
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.active.len() + inner.pending_add.len() - inner.pending_remove.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ?Sized> Default for ListenerRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = dyn Fn(u32) + Send + Sync;

    fn noop() -> Arc<Callback> {
        Arc::new(|_| {})
    }

    #[test]
    fn test_add_then_remove_restores_empty() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        assert!(registry.is_empty());

        registry.add(1, noop());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(1));
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_remove_unknown_returns_false() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        assert!(!registry.remove(42));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        registry.add(1, noop());
        let _ = registry.snapshot();

        assert!(registry.remove(1));
        assert!(!registry.remove(1));
    }

    #[test]
    fn test_mutations_apply_at_next_snapshot() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();

        registry.add(1, noop());
        registry.add(2, noop());
        let first: Vec<_> = registry.snapshot().iter().map(|(id, _)| *id).collect();
        assert_eq!(first, vec![1, 2]);

        registry.remove(1);
        registry.add(3, noop());
        let second: Vec<_> = registry.snapshot().iter().map(|(id, _)| *id).collect();
        assert_eq!(second, vec![2, 3]);
    }

    #[test]
    fn test_clear_drops_pending_too() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        registry.add(1, noop());
        let _ = registry.snapshot();
        registry.add(2, noop());

        registry.clear();
        assert!(registry.snapshot().is_empty());
        assert!(!registry.remove(1));
        assert!(!registry.remove(2));
    }

    #[test]
    fn test_callbacks_fire_outside_lock() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let registry: Arc<ListenerRegistry<Callback>> = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicU32::new(0));

        let registry_in_cb = Arc::clone(&registry);
        let hits_in_cb = Arc::clone(&hits);
        registry.add(
            1,
            Arc::new(move |value| {
                hits_in_cb.fetch_add(value, Ordering::SeqCst);
                // Mutating from inside a callback must not deadlock
                registry_in_cb.remove(1);
            }),
        );

        for (_, listener) in registry.snapshot() {
            listener(5);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert!(registry.snapshot().is_empty());
    }
}
