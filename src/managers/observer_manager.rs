// ObserverRegistry: ordered callback registries for tick and state observers
// Single Responsibility: subscription bookkeeping and snapshot dispatch

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

/// Callback invoked with an immutable view of the notified value
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Liveness of one registration plus the threads currently inside its callback
#[derive(Default)]
struct Dispatch {
    retired: bool,
    running_on: Vec<ThreadId>,
}

struct Entry<T> {
    callback: Callback<T>,
    dispatch: Mutex<Dispatch>,
    idle: Condvar,
}

impl<T> Entry<T> {
    /// Invoke the callback unless the entry was retired.
    fn invoke(&self, value: &T) {
        let current = thread::current().id();
        {
            let mut dispatch = lock(&self.dispatch);
            if dispatch.retired {
                return;
            }
            dispatch.running_on.push(current);
        }

        (self.callback)(value);

        let mut dispatch = lock(&self.dispatch);
        if let Some(pos) = dispatch.running_on.iter().position(|id| *id == current) {
            dispatch.running_on.swap_remove(pos);
        }
        self.idle.notify_all();
    }

    /// Mark retired and wait out calls running on other threads.
    ///
    /// A call running on the current thread (a callback removing itself or a
    /// sibling) is not waited for.
    fn retire(&self) {
        let current = thread::current().id();
        let mut dispatch = lock(&self.dispatch);
        dispatch.retired = true;
        while dispatch.running_on.iter().any(|id| *id != current) {
            dispatch = self
                .idle
                .wait(dispatch)
                .unwrap_or_else(|err| err.into_inner());
        }
    }
}

struct Registry<T> {
    next_id: u64,
    entries: BTreeMap<u64, Arc<Entry<T>>>,
}

/// Ordered mapping of subscription id to callback
///
/// Ids are handed out monotonically, so iterating the map visits callbacks
/// in registration order.
///
/// # Dispatch
/// `notify` iterates over a snapshot taken before the first callback runs,
/// so a callback may subscribe or unsubscribe (itself or others) without
/// corrupting the pass. Each entry carries a retired flag checked right
/// before its callback runs: a callback removed mid-pass is skipped for the
/// rest of that pass and never invoked again.
///
/// When `unsubscribe` is called from another thread while the callback is
/// running, it blocks until that call returns, so no invocation is observed
/// after `unsubscribe` returns. Callbacks must therefore not wait on a
/// thread that is unsubscribing them.
pub struct ObserverRegistry<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        lock(&self.inner)
    }

    /// Register `callback`, returning the handle that removes it.
    pub fn subscribe(&self, callback: Callback<T>) -> Subscription {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(
            id,
            Arc::new(Entry {
                callback,
                dispatch: Mutex::new(Dispatch::default()),
                idle: Condvar::new(),
            }),
        );

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remove: Arc::new(move |id| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let removed = lock(&inner).entries.remove(&id);
                if let Some(entry) = removed {
                    entry.retire();
                }
            }),
        }
    }

    pub fn is_subscribed(&self, id: u64) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every callback, waiting out calls running on other threads.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut self.lock().entries);
        for entry in removed.values() {
            entry.retire();
        }
    }

    /// Invoke every live callback with `value`, in registration order.
    ///
    /// No registry lock is held while a callback runs.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Arc<Entry<T>>> = self.lock().entries.values().cloned().collect();

        for entry in snapshot {
            entry.invoke(value);
        }
    }
}

impl<T: 'static> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by a subscription.
///
/// Dropping it does *not* unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    remove: Arc<dyn Fn(u64) + Send + Sync>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback. Idempotent; a no-op once the registry is gone.
    ///
    /// Returns only after any call of the callback running on another thread
    /// has finished.
    pub fn unsubscribe(&self) {
        (self.remove)(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
