//! Change-notifying values.
//!
//! UI shells read state through `snapshot()` and register listeners with
//! `subscribe()`; listeners run synchronously on the thread that performed
//! the mutation, which by construction is the owning (logical UI) thread.

use std::sync::Mutex;

type Listener<T> = Box<dyn Fn(&T) + Send>;

/// A value whose changes notify registered listeners.
pub struct Observable<T: Clone> {
    value: Mutex<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_token: Mutex<u64>,
}

impl<T: Clone> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_token: Mutex::new(1),
        }
    }

    /// Current value, by clone.
    pub fn snapshot(&self) -> T {
        self.lock_value().clone()
    }

    /// Register a listener; returns a token for [`Observable::unsubscribe`].
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + 'static) -> u64 {
        let token = {
            let mut next = self
                .next_token
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let t = *next;
            *next += 1;
            t
        };
        self.lock_listeners().push((token, Box::new(listener)));
        token
    }

    pub fn unsubscribe(&self, token: u64) {
        self.lock_listeners().retain(|(t, _)| *t != token);
    }

    /// Replace the value and notify.
    pub fn set(&self, value: T) {
        {
            *self.lock_value() = value;
        }
        self.notify();
    }

    /// Mutate in place and notify.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        {
            f(&mut self.lock_value());
        }
        self.notify();
    }

    fn notify(&self) {
        let value = self.snapshot();
        for (_, listener) in self.lock_listeners().iter() {
            listener(&value);
        }
    }

    fn lock_value(&self) -> std::sync::MutexGuard<'_, T> {
        self.value
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener<T>)>> {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listeners_see_every_set() {
        let observable = Observable::new(0u32);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        observable.subscribe(move |v| {
            seen_clone.store(*v as usize, Ordering::SeqCst);
        });
        observable.set(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(observable.snapshot(), 7);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let observable = Observable::new(0u32);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let token = observable.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        observable.set(1);
        observable.unsubscribe(token);
        observable.set(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_mutates_in_place() {
        let observable = Observable::new(vec![1u32]);
        observable.update(|v| v.push(2));
        assert_eq!(observable.snapshot(), vec![1, 2]);
    }
}
