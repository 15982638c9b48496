//! The joiner registry: who hears about a fiber's terminal outcome.
//!
//! A fiber can have zero, one, or many joiners. The slot starts `Empty`,
//! upgrades to `Single` on the first registration and to `Many` on the
//! second, and drains exactly once when the outcome is published. The
//! single-to-many upgrade happens under the slot's lock, so concurrent
//! registrations cannot lose a listener.
//!
//! Delivery itself happens outside this module: the registry only hands the
//! listeners back to the publisher, which invokes them with the terminal
//! outcome.

use parking_lot::Mutex;

use crate::outcome::Outcome;

/// A one-shot observer of a fiber's terminal outcome.
pub(crate) type Listener = Box<dyn FnOnce(Outcome) + Send>;

enum Slot {
    Empty,
    Single(Listener),
    Many(Vec<Listener>),
    Drained,
}

/// The callback slot publishing a fiber's outcome to its joiners.
pub(crate) struct JoinerRegistry {
    slot: Mutex<Slot>,
}

impl JoinerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Installs a listener, or returns it if the registry already drained.
    ///
    /// A returned listener must be invoked by the caller with the published
    /// outcome (registration after termination delivers immediately).
    pub(crate) fn register(&self, listener: Listener) -> Result<(), Listener> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Empty => {
                *slot = Slot::Single(listener);
                Ok(())
            }
            Slot::Single(existing) => {
                *slot = Slot::Many(vec![existing, listener]);
                Ok(())
            }
            Slot::Many(mut listeners) => {
                listeners.push(listener);
                *slot = Slot::Many(listeners);
                Ok(())
            }
            Slot::Drained => {
                *slot = Slot::Drained;
                Err(listener)
            }
        }
    }

    /// Takes every installed listener, leaving the registry drained.
    ///
    /// Called exactly once, by whichever party publishes the outcome.
    pub(crate) fn drain(&self) -> Vec<Listener> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Drained) {
            Slot::Empty | Slot::Drained => Vec::new(),
            Slot::Single(listener) => vec![listener],
            Slot::Many(listeners) => listeners,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn drain_returns_all_registered() {
        let registry = JoinerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            if registry.register(counting_listener(&counter)).is_err() {
                panic!("registry open");
            }
        }

        for listener in registry.drain() {
            listener(Outcome::Canceled);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn register_after_drain_hands_the_listener_back() {
        let registry = JoinerRegistry::new();
        assert!(registry.drain().is_empty());

        let counter = Arc::new(AtomicUsize::new(0));
        let rejected = registry
            .register(counting_listener(&counter))
            .expect_err("drained registry rejects");
        rejected(Outcome::Canceled);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_is_one_shot() {
        let registry = JoinerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        if registry.register(counting_listener(&counter)).is_err() {
            panic!("registry open");
        }

        assert_eq!(registry.drain().len(), 1);
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn concurrent_registration_loses_no_listener() {
        let registry = Arc::new(JoinerRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    if let Err(listener) = registry.register(counting_listener(&counter)) {
                        listener(Outcome::Canceled);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("registration thread");
        }

        for listener in registry.drain() {
            listener(Outcome::Canceled);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
