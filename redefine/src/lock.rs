//! Per-class "being redefined" marks, so that redefinitions of the same class run one after the
//! other while unrelated classes proceed independently.

use parking_lot::{Condvar, Mutex};
use redefine_base::{ClassId, IdSet};

#[derive(Debug, Default)]
pub struct RedefinitionLocks {
    busy: Mutex<IdSet<ClassId>>,
    released: Condvar,
}
impl RedefinitionLocks {
    #[must_use]
    pub fn new() -> RedefinitionLocks {
        RedefinitionLocks::default()
    }

    /// Mark every class in `classes` as being redefined, waiting until none of them are.
    /// All of them are taken at once, so two batches over overlapping classes can't deadlock.
    pub fn acquire(&self, classes: &[ClassId]) -> RedefinitionGuard<'_> {
        let mut busy = self.busy.lock();
        while classes.iter().any(|class| busy.contains(class)) {
            tracing::debug!("Waiting for another redefinition of {:?}", classes);
            self.released.wait(&mut busy);
        }
        busy.extend(classes.iter().copied());

        RedefinitionGuard {
            locks: self,
            classes: classes.to_vec(),
        }
    }

    #[must_use]
    pub fn is_busy(&self, class: ClassId) -> bool {
        self.busy.lock().contains(&class)
    }
}

#[derive(Debug)]
pub struct RedefinitionGuard<'a> {
    locks: &'a RedefinitionLocks,
    classes: Vec<ClassId>,
}
impl<'a> Drop for RedefinitionGuard<'a> {
    fn drop(&mut self) {
        let mut busy = self.locks.busy.lock();
        for class in &self.classes {
            busy.remove(class);
        }
        drop(busy);
        self.locks.released.notify_all();
    }
}
