//! Tracking which methods have live activations, so that old versions of a class are only
//! dropped once nothing is running them.

use std::sync::Arc;

use parking_lot::Mutex;
use redefine_base::{code::Code, id::MethodKey, ConstantPool, IdMap};

use crate::{cpcache::CallSiteCache, method::Method};

/// Answers whether some thread may still be executing a method.
/// A conservative answer (saying yes when unsure) only delays reclaiming old versions.
pub trait FrameOracle: Send + Sync {
    fn is_executing(&self, method: MethodKey) -> bool;
}

/// Never sees a live frame
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFrames;
impl FrameOracle for NoFrames {
    fn is_executing(&self, _method: MethodKey) -> bool {
        false
    }
}

/// Counts the activations entered through it
#[derive(Debug, Default)]
pub struct FrameRegistry {
    live: Mutex<IdMap<MethodKey, usize>>,
}
impl FrameRegistry {
    #[must_use]
    pub fn new() -> FrameRegistry {
        FrameRegistry::default()
    }

    /// Start executing `method`. It stays live until the returned frame is dropped.
    pub fn enter(&self, method: Arc<Method>) -> Frame<'_> {
        *self.live.lock().entry(method.key()).or_insert(0) += 1;
        Frame {
            registry: self,
            method,
        }
    }

    #[must_use]
    pub fn live_count(&self, method: MethodKey) -> usize {
        self.live.lock().get(&method).copied().unwrap_or(0)
    }

    fn exit(&self, method: MethodKey) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&method) {
            *count -= 1;
            if *count == 0 {
                live.remove(&method);
            }
        }
    }
}
impl FrameOracle for FrameRegistry {
    fn is_executing(&self, method: MethodKey) -> bool {
        self.live_count(method) != 0
    }
}

/// An activation of a method.
/// It owns the method, and so the pool and cache that method's code was linked against, no
/// matter what happens to the class in the meantime.
#[derive(Debug)]
pub struct Frame<'r> {
    registry: &'r FrameRegistry,
    method: Arc<Method>,
}
impl<'r> Frame<'r> {
    #[must_use]
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[must_use]
    pub fn code(&self) -> Option<&Code> {
        self.method.code()
    }

    #[must_use]
    pub fn pool(&self) -> &ConstantPool {
        self.method.pool()
    }

    #[must_use]
    pub fn cache(&self) -> &CallSiteCache {
        self.method.cache()
    }
}
impl<'r> Drop for Frame<'r> {
    fn drop(&mut self) {
        self.registry.exit(self.method.key());
    }
}
