//! Copy-on-write array with wait-free readers.
//!
//! Readers load the current snapshot and iterate it without blocking. Writers
//! build a new vector and swap it in, so a reader never observes a torn array;
//! it sees either the old or the new contents. The client keeps one writer (the
//! admin coordinator) per array, but concurrent writers are still correct since
//! updates go through `rcu`.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// Concurrent registry of shared elements.
pub struct AtomicArray<T> {
    inner: ArcSwap<Vec<Arc<T>>>,
}

impl<T> AtomicArray<T> {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Appends `element`; it becomes visible to readers that load after the swap.
    pub fn add(&self, element: Arc<T>) {
        self.inner.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&element));
            next
        });
    }

    /// Removes `element` by identity. Returns `false` when it was not present.
    pub fn remove(&self, element: &Arc<T>) -> bool {
        let mut removed = false;
        self.inner.rcu(|current| {
            removed = false;
            current
                .iter()
                .filter(|candidate| {
                    let hit = Arc::ptr_eq(candidate, element);
                    removed |= hit;
                    !hit
                })
                .cloned()
                .collect::<Vec<_>>()
        });
        removed
    }

    /// Removes every element matching `pred` and returns them.
    pub fn remove_where<P>(&self, mut pred: P) -> Vec<Arc<T>>
    where
        P: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        self.inner.rcu(|current| {
            removed.clear();
            let mut kept = Vec::with_capacity(current.len());
            for element in current.iter() {
                if pred(element) {
                    removed.push(Arc::clone(element));
                } else {
                    kept.push(Arc::clone(element));
                }
            }
            kept
        });
        removed
    }

    /// Visits every element of the current snapshot.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<T>),
    {
        let snapshot = self.inner.load();
        for element in snapshot.iter() {
            f(element);
        }
    }

    pub fn find<P>(&self, mut pred: P) -> Option<Arc<T>>
    where
        P: FnMut(&T) -> bool,
    {
        self.inner
            .load()
            .iter()
            .find(|element| pred(element))
            .cloned()
    }

    pub fn any<P>(&self, mut pred: P) -> bool
    where
        P: FnMut(&T) -> bool,
    {
        self.inner.load().iter().any(|element| pred(element))
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    /// Full snapshot, kept alive independently of later writes.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.inner.load_full()
    }
}

impl<T> Default for AtomicArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for AtomicArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.inner.load().iter()).finish()
    }
}
