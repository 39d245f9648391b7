//! Guarded mutable state with a synchronous did-change hook.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

type ChangeHook<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A value behind a lock, readable by snapshot and mutated through closures.
/// An optional observer hook runs after every mutation, outside the value
/// lock, with the old and new values. The hook is for notification only;
/// mutating the same `Watchable` from inside it deadlocks.
pub struct Watchable<T> {
    value: RwLock<T>,
    hook: Mutex<Option<ChangeHook<T>>>,
}

impl<T: Clone> Watchable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: RwLock::new(initial),
            hook: Mutex::new(None),
        }
    }

    /// Snapshot of the current value.
    pub fn read(&self) -> T {
        self.value.read().clone()
    }

    /// Read through a closure without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    /// Mutate the value and return the closure's result. The did-change hook
    /// observes the transition after the value lock is released.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let (result, old, new) = {
            let mut guard = self.value.write();
            let old = guard.clone();
            let result = f(&mut guard);
            (result, old, guard.clone())
        };
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(&old, &new);
        }
        result
    }

    /// Replace the value outright.
    pub fn set(&self, value: T) {
        self.mutate(|current| *current = value);
    }

    /// Install the did-change observer, replacing any previous one.
    pub fn on_change(&self, hook: impl Fn(&T, &T) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }
}

impl<T: Clone + Default> Default for Watchable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn mutate_returns_closure_result_and_updates() {
        let state = Watchable::new(10_u32);
        let previous = state.mutate(|v| {
            let old = *v;
            *v += 5;
            old
        });
        assert_eq!(previous, 10);
        assert_eq!(state.read(), 15);
    }

    #[test]
    fn hook_observes_old_and_new() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        let state = Watchable::new(1_u32);
        state.on_change(move |old, new| log.lock().push((*old, *new)));

        state.set(2);
        state.mutate(|v| *v *= 10);

        assert_eq!(*seen.lock(), vec![(1, 2), (2, 20)]);
    }

    #[test]
    fn with_reads_without_clone() {
        let state = Watchable::new(String::from("abc"));
        let len = state.with(|s| s.len());
        assert_eq!(len, 3);
    }
}
