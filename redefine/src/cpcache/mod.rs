//! The per-class cache of resolved field, method and dynamic call site references, which linked
//! bytecode indexes instead of the constant pool.

use parking_lot::Mutex;
use redefine_base::{code::op::Opcode, id::MethodKey, IdMap, PoolIndex};

use crate::error::{LinkageError, RedefineError};

mod entry;

pub use entry::{CacheEntry, CacheFlags, CacheKind, Publish, Resolution, ResolvedTarget};

/// A fixed array of [`CacheEntry`].
/// The first entries are shared by every instruction naming the same pool entry. After them
/// come the `invokedynamic` entries, one for each call site.
#[derive(Debug)]
pub struct CallSiteCache {
    entries: Box<[CacheEntry]>,
    ordinary_len: usize,
    /// Serializes running bootstrap methods, which may have side effects
    indy_lock: Mutex<()>,
}
impl CallSiteCache {
    #[must_use]
    pub fn new(ordinary: &[(PoolIndex, CacheKind)], dynamic: &[PoolIndex]) -> CallSiteCache {
        let entries = ordinary
            .iter()
            .map(|&(cp_index, kind)| CacheEntry::new(cp_index, kind))
            .chain(
                dynamic
                    .iter()
                    .map(|&cp_index| CacheEntry::new(cp_index, CacheKind::Dynamic)),
            )
            .collect();
        CallSiteCache {
            entries,
            ordinary_len: ordinary.len(),
            indy_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn empty() -> CallSiteCache {
        CallSiteCache::new(&[], &[])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of shared field and method entries
    #[must_use]
    pub fn ordinary_len(&self) -> usize {
        self.ordinary_len
    }

    #[must_use]
    pub fn dynamic_len(&self) -> usize {
        self.entries.len() - self.ordinary_len
    }

    #[must_use]
    pub fn entry(&self, index: usize) -> Option<&CacheEntry> {
        self.entries.get(index)
    }

    #[must_use]
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn resolve_virtual(
        &self,
        index: usize,
        resolve: impl FnOnce(&CacheEntry) -> Result<Resolution, LinkageError>,
    ) -> Result<Resolution, RedefineError> {
        self.resolve_member(index, Opcode::InvokeVirtual, &[CacheKind::Method], resolve)
    }

    /// `invokestatic`, which may name an interface's static method
    pub fn resolve_static(
        &self,
        index: usize,
        resolve: impl FnOnce(&CacheEntry) -> Result<Resolution, LinkageError>,
    ) -> Result<Resolution, RedefineError> {
        self.resolve_member(
            index,
            Opcode::InvokeStatic,
            &[CacheKind::Method, CacheKind::InterfaceMethod],
            resolve,
        )
    }

    pub fn resolve_special(
        &self,
        index: usize,
        resolve: impl FnOnce(&CacheEntry) -> Result<Resolution, LinkageError>,
    ) -> Result<Resolution, RedefineError> {
        self.resolve_member(
            index,
            Opcode::InvokeSpecial,
            &[CacheKind::Method, CacheKind::InterfaceMethod],
            resolve,
        )
    }

    pub fn resolve_interface(
        &self,
        index: usize,
        resolve: impl FnOnce(&CacheEntry) -> Result<Resolution, LinkageError>,
    ) -> Result<Resolution, RedefineError> {
        self.resolve_member(
            index,
            Opcode::InvokeInterface,
            &[CacheKind::InterfaceMethod],
            resolve,
        )
    }

    /// Resolve a field access. `opcode` is one of the four field instructions.
    pub fn resolve_field(
        &self,
        index: usize,
        opcode: Opcode,
        resolve: impl FnOnce(&CacheEntry) -> Result<Resolution, LinkageError>,
    ) -> Result<Resolution, RedefineError> {
        if !matches!(
            opcode,
            Opcode::GetField | Opcode::PutField | Opcode::GetStatic | Opcode::PutStatic
        ) {
            return Err(LinkageError::BadCallSite(format!("{} is not a field access", opcode)).into());
        }
        self.resolve_member(index, opcode, &[CacheKind::Field], resolve)
    }

    /// Resolution of a shared entry. Racing threads may each run `resolve`, but only the
    /// first to publish is kept.
    fn resolve_member(
        &self,
        index: usize,
        opcode: Opcode,
        expected: &[CacheKind],
        resolve: impl FnOnce(&CacheEntry) -> Result<Resolution, LinkageError>,
    ) -> Result<Resolution, RedefineError> {
        let entry = self
            .entries
            .get(..self.ordinary_len)
            .and_then(|ordinary| ordinary.get(index))
            .ok_or_else(|| {
                LinkageError::BadCallSite(format!("no {} cache entry {}", opcode, index))
            })?;
        if !expected.contains(&entry.kind()) {
            return Err(LinkageError::BadCallSite(format!(
                "{} used with a {:?} cache entry",
                opcode,
                entry.kind()
            ))
            .into());
        }

        if let Some(resolution) = entry.resolved_for(opcode) {
            return Ok(resolution);
        }

        let resolution = resolve(entry)?;
        let published = entry.publish(opcode, resolution);
        if !published.won() {
            tracing::trace!("Lost the race to resolve cache entry {}", index);
        }
        Ok(published.resolution())
    }

    /// Resolve an `invokedynamic` site, running its bootstrap at most once.
    /// A failed bootstrap is remembered, and every later attempt fails the same way without
    /// running it again.
    pub fn resolve_dynamic(
        &self,
        index: usize,
        bootstrap: impl FnOnce(&CacheEntry) -> Result<Resolution, LinkageError>,
    ) -> Result<Resolution, RedefineError> {
        let entry = self
            .entries
            .get(self.ordinary_len..)
            .and_then(|dynamic| dynamic.get(index.checked_sub(self.ordinary_len)?))
            .ok_or_else(|| LinkageError::BadCallSite(format!("no dynamic cache entry {}", index)))?;

        if let Some(resolution) = entry.resolved() {
            return Ok(resolution);
        }

        let _guard = self.indy_lock.lock();
        // Someone else may have finished while we waited
        if let Some(resolution) = entry.resolved() {
            return Ok(resolution);
        }
        if let Some(err) = entry.failure() {
            return Err(RedefineError::LinkageFailureSticky(err));
        }

        match bootstrap(entry) {
            Ok(resolution) => Ok(entry
                .publish(Opcode::InvokeDynamic, resolution)
                .resolution()),
            Err(err) => {
                tracing::warn!("Bootstrap for dynamic cache entry {} failed: {}", index, err);
                entry.record_failure(err.clone());
                Err(RedefineError::Linkage(err))
            }
        }
    }

    /// Point resolved method entries at their replacements.
    /// Returns how many resolutions changed.
    pub(crate) fn retarget_methods(&self, replacements: &IdMap<MethodKey, MethodKey>) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.retarget_methods(replacements))
            .sum()
    }

    /// Every method some entry has resolved to
    pub fn referenced_methods(&self) -> impl Iterator<Item = MethodKey> + '_ {
        self.entries
            .iter()
            .flat_map(|entry| entry.resolutions())
            .filter_map(|resolution| match resolution.target {
                ResolvedTarget::Method(key) => Some(key),
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Barrier,
    };

    use redefine_base::{code::op::Opcode, id::MethodKey, IdMap};

    use super::{CacheEntry, CacheFlags, CacheKind, CallSiteCache, Resolution, ResolvedTarget};
    use crate::error::{LinkageError, RedefineError};

    fn method_resolution(key: u32) -> Resolution {
        Resolution {
            target: ResolvedTarget::Method(MethodKey::new_unchecked(key)),
            aux: u64::from(key) * 10,
            flags: CacheFlags::STATIC,
        }
    }

    #[test]
    fn test_concurrent_resolution_agrees() {
        for _ in 0..50 {
            let cache = CallSiteCache::new(&[(3, CacheKind::Method)], &[]);
            let barrier = Barrier::new(4);

            let results: Vec<Resolution> = std::thread::scope(|scope| {
                let handles: Vec<_> = (1..=4)
                    .map(|key| {
                        let cache = &cache;
                        let barrier = &barrier;
                        scope.spawn(move || {
                            barrier.wait();
                            cache
                                .resolve_static(0, |_| Ok(method_resolution(key)))
                                .unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let published = cache.entry(0).unwrap().resolved().unwrap();
            for result in results {
                assert_eq!(result, published);
            }
            // The auxiliary word always belongs to the published target
            if let ResolvedTarget::Method(key) = published.target {
                assert_eq!(published.aux, u64::from(key.get()) * 10);
            } else {
                panic!("resolved to {:?}", published.target);
            }
        }
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let cache = CallSiteCache::new(&[(3, CacheKind::Field), (4, CacheKind::Method)], &[9]);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.dynamic_len(), 1);

        let err = cache
            .resolve_virtual(0, |_| Ok(method_resolution(1)))
            .unwrap_err();
        assert!(matches!(err, RedefineError::Linkage(LinkageError::BadCallSite(_))));

        let err = cache
            .resolve_field(0, Opcode::InvokeStatic, |_| Ok(method_resolution(1)))
            .unwrap_err();
        assert!(matches!(err, RedefineError::Linkage(LinkageError::BadCallSite(_))));

        // Dynamic entries are not reachable as ordinary ones, and the reverse
        assert!(cache.resolve_static(2, |_| Ok(method_resolution(1))).is_err());
        assert!(cache.resolve_dynamic(1, |_| Ok(method_resolution(1))).is_err());
    }

    #[test]
    fn test_bootstrap_failure_is_sticky() {
        let cache = CallSiteCache::new(&[], &[7]);
        let runs = AtomicUsize::new(0);
        let bootstrap = |_: &CacheEntry| {
            runs.fetch_add(1, Ordering::SeqCst);
            Err(LinkageError::Bootstrap(String::from("no call site")))
        };

        let first = cache.resolve_dynamic(0, bootstrap).unwrap_err();
        assert_eq!(
            first,
            RedefineError::Linkage(LinkageError::Bootstrap(String::from("no call site")))
        );
        let second = cache.resolve_dynamic(0, bootstrap).unwrap_err();
        assert_eq!(
            second,
            RedefineError::LinkageFailureSticky(LinkageError::Bootstrap(String::from(
                "no call site"
            )))
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(cache.entry(0).unwrap().has_failed());
    }

    #[test]
    fn test_bootstrap_runs_once() {
        let cache = CallSiteCache::new(&[], &[7]);
        let runs = AtomicUsize::new(0);
        let barrier = Barrier::new(4);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    barrier.wait();
                    let resolution = cache
                        .resolve_dynamic(0, |_| {
                            let id = runs.fetch_add(1, Ordering::SeqCst) as u32;
                            Ok(Resolution {
                                target: ResolvedTarget::CallSite(id),
                                aux: 0,
                                flags: CacheFlags::HAS_APPENDIX,
                            })
                        })
                        .unwrap();
                    assert_eq!(resolution.target, ResolvedTarget::CallSite(0));
                });
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retarget_methods() {
        let cache = CallSiteCache::new(&[(1, CacheKind::Method), (2, CacheKind::Method)], &[]);
        cache.resolve_static(0, |_| Ok(method_resolution(10))).unwrap();
        cache.resolve_static(1, |_| Ok(method_resolution(11))).unwrap();

        let mut replacements = IdMap::default();
        replacements.insert(MethodKey::new_unchecked(10), MethodKey::new_unchecked(20));
        assert_eq!(cache.retarget_methods(&replacements), 1);

        let mut referenced: Vec<_> = cache.referenced_methods().map(MethodKey::get).collect();
        referenced.sort_unstable();
        assert_eq!(referenced, vec![11, 20]);
        // Retargeting keeps the rest of the entry
        let entry = cache.entry(0).unwrap().resolved().unwrap();
        assert_eq!(entry.aux, 100);
    }
}
