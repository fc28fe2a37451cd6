//! The global synchronization point redefinitions install at.

use parking_lot::{RwLock, RwLockReadGuard};

/// Runs an operation while no mutator is executing bytecode.
/// Everything done inside `synchronize` must be infallible; by the time it is called every
/// fallible step of a redefinition has already succeeded.
pub trait Safepoint: Send + Sync {
    fn synchronize(&self, op: &mut dyn FnMut());
}

/// A safepoint built on a reader-writer lock.
/// Mutators hold a [`WorldLock::enter`] guard while they run bytecode, and synchronizing takes
/// the lock exclusively, so it waits for every one of them to step out.
#[derive(Debug, Default)]
pub struct WorldLock {
    lock: RwLock<()>,
}
impl WorldLock {
    #[must_use]
    pub fn new() -> WorldLock {
        WorldLock::default()
    }

    /// Mark the current thread as running bytecode until the guard is dropped
    pub fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }
}
impl Safepoint for WorldLock {
    fn synchronize(&self, op: &mut dyn FnMut()) {
        let _stopped = self.lock.write();
        tracing::trace!("Reached safepoint");
        op();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Barrier,
        },
        time::Duration,
    };

    use super::{Safepoint, WorldLock};

    #[test]
    fn test_synchronize_waits_for_mutators() {
        let world = WorldLock::new();
        let mutator_done = AtomicBool::new(false);
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                let _running = world.enter();
                barrier.wait();
                std::thread::sleep(Duration::from_millis(20));
                mutator_done.store(true, Ordering::SeqCst);
            });

            barrier.wait();
            let mut saw_done = false;
            world.synchronize(&mut || saw_done = mutator_done.load(Ordering::SeqCst));
            assert!(saw_done);
        });
    }
}
