//! Observable state container.
//!
//! A [`StateStore`] holds one immutable snapshot behind an `Arc`. Updates
//! replace the snapshot wholesale and notify listeners with the new and
//! previous values; an update that produces an equal value is dropped
//! without notification. Selector subscriptions only fire when their
//! projection changes.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Listener<T> = Arc<dyn Fn(&Arc<T>, &Arc<T>) + Send + Sync>;

struct StoreInner<T> {
    value: RwLock<Arc<T>>,
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

/// Snapshot holder with change notification.
pub struct StateStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for StateStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for StateStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("value", &*self.inner.value.read())
            .field("listeners", &self.inner.listeners.read().len())
            .finish()
    }
}

/// Handle returned by the `subscribe` methods.
pub struct StoreSubscription<T> {
    id: u64,
    store: Weak<StoreInner<T>>,
}

impl<T> StoreSubscription<T> {
    /// Stop receiving changes. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.store.upgrade() {
            inner.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl<T> StateStore<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    /// Create a store holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                value: RwLock::new(Arc::new(initial)),
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The latest snapshot.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner.value.read())
    }

    /// Replace the snapshot. Returns whether anything changed.
    pub fn next(&self, value: T) -> bool {
        self.update(|_| Some(value))
    }

    /// Derive the next snapshot from the current one.
    ///
    /// `f` returns `None` to leave the snapshot untouched. The read and the
    /// replacement happen under one lock, so concurrent updates never lose
    /// each other's changes.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let (next, previous) = {
            let mut current = self.inner.value.write();
            let Some(value) = f(&current) else {
                return false;
            };
            if value == **current {
                return false;
            }
            let previous = std::mem::replace(&mut *current, Arc::new(value));
            (Arc::clone(&current), previous)
        };
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&next, &previous);
        }
        true
    }

    /// Listen for every change, receiving `(next, previous)`.
    pub fn subscribe<F>(&self, listener: F) -> StoreSubscription<T>
    where
        F: Fn(&Arc<T>, &Arc<T>) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(listener)));
        StoreSubscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    /// Listen for changes to a projection of the snapshot.
    ///
    /// The handler receives `(next, previous)` projections and only runs
    /// when they differ.
    pub fn subscribe_with_selector<S, Sel, F>(&self, selector: Sel, handler: F) -> StoreSubscription<T>
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&T) -> S + Send + Sync + 'static,
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        let last = Mutex::new(selector(&self.get()));
        self.subscribe(move |next, _| {
            let projected = selector(next);
            let previous = {
                let mut last = last.lock();
                if *last == projected {
                    return;
                }
                std::mem::replace(&mut *last, projected)
            };
            let current = last.lock();
            handler(&current, &previous);
        })
    }

    /// Number of active listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}
