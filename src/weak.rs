//! Shared invalidation flags for cancelling work that is already in flight.
//!
//! A [`WeakFactory`] owns a flag; the [`WeakHandle`]s it hands out observe
//! it. Invalidation is one-way: once the factory invalidates (explicitly or
//! by being dropped), every handle reports invalid forever. Posted tasks,
//! quit closures and event watchers consult the flag immediately before
//! delivering, so invalidation cancels everything that has not started yet
//! while work that is already executing runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owner side of an invalidation flag.
///
/// Dropping the factory invalidates all outstanding handles, so embedding a
/// `WeakFactory` as the *last* field of a struct gives its tasks the usual
/// "cancelled on destruction" behavior.
#[derive(Debug)]
pub struct WeakFactory {
    flag: Arc<AtomicBool>,
}

impl WeakFactory {
    pub fn new() -> WeakFactory {
        WeakFactory {
            flag: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns a new handle observing this factory's flag.
    pub fn handle(&self) -> WeakHandle {
        WeakHandle {
            flag: self.flag.clone(),
        }
    }

    /// Invalidates every handle created so far and every handle created in
    /// the future. Idempotent.
    pub fn invalidate_all(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Default for WeakFactory {
    fn default() -> WeakFactory {
        WeakFactory::new()
    }
}

impl Drop for WeakFactory {
    fn drop(&mut self) {
        self.invalidate_all();
    }
}

/// Observer side of an invalidation flag. Clonable and thread-safe; holds no
/// ownership of the referent.
#[derive(Clone, Debug)]
pub struct WeakHandle {
    flag: Arc<AtomicBool>,
}

impl WeakHandle {
    pub fn is_valid(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_until_invalidated() {
        let factory = WeakFactory::new();
        let handle = factory.handle();
        assert!(handle.is_valid());

        factory.invalidate_all();
        assert!(!handle.is_valid());

        // Handles created after invalidation are dead on arrival.
        assert!(!factory.handle().is_valid());
    }

    #[test]
    fn drop_invalidates() {
        let factory = WeakFactory::new();
        let handle = factory.handle();
        drop(factory);
        assert!(!handle.is_valid());
    }
}
