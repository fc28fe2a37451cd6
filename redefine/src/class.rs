use std::sync::{
    atomic::{AtomicU16, AtomicU32, Ordering},
    Arc,
};

use parking_lot::{Mutex, MutexGuard, RwLock};
use redefine_base::{
    id::MethodKey, ClassData, ClassId, ConstantPool, IdMap, MethodIdnum, Symbol,
};

use crate::{cpcache::CallSiteCache, frames::FrameOracle, method::Method};

/// One version of a class: its pool, cache and methods, which only ever change together.
/// Never mutated once installed.
#[derive(Debug)]
pub struct ClassVersion {
    number: u32,
    /// The class as parsed and rewritten, without its methods
    data: ClassData,
    pool: Arc<ConstantPool>,
    cache: Arc<CallSiteCache>,
    /// Sorted by name and then descriptor
    methods: Vec<Arc<Method>>,
    /// The class file position of each method in `methods`
    method_ordering: Vec<u16>,
}
impl ClassVersion {
    pub(crate) fn new(
        number: u32,
        data: ClassData,
        pool: Arc<ConstantPool>,
        cache: Arc<CallSiteCache>,
        methods: Vec<Arc<Method>>,
        method_ordering: Vec<u16>,
    ) -> ClassVersion {
        debug_assert!(data.methods.is_empty());
        debug_assert_eq!(methods.len(), method_ordering.len());
        ClassVersion {
            number,
            data,
            pool,
            cache,
            methods,
            method_ordering,
        }
    }

    /// 0 for the version the class was defined with, counting up with each redefinition
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[must_use]
    pub fn data(&self) -> &ClassData {
        &self.data
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConstantPool> {
        &self.pool
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CallSiteCache> {
        &self.cache
    }

    #[must_use]
    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    #[must_use]
    pub fn method_ordering(&self) -> &[u16] {
        &self.method_ordering
    }

    /// The methods in the order the class file declared them
    pub fn methods_in_original_order(&self) -> impl Iterator<Item = &Arc<Method>> {
        let mut order: Vec<(u16, &Arc<Method>)> = self
            .method_ordering
            .iter()
            .copied()
            .zip(self.methods.iter())
            .collect();
        order.sort_by_key(|(position, _)| *position);
        order.into_iter().map(|(_, method)| method)
    }

    #[must_use]
    pub fn find_method(&self, name: &[u8], descriptor: &[u8]) -> Option<&Arc<Method>> {
        self.methods
            .binary_search_by(|method| {
                (method.name().as_bytes(), method.descriptor().as_bytes()).cmp(&(name, descriptor))
            })
            .ok()
            .map(|i| &self.methods[i])
    }

    #[must_use]
    pub fn method_by_idnum(&self, idnum: MethodIdnum) -> Option<&Arc<Method>> {
        self.methods.iter().find(|method| method.idnum() == idnum)
    }
}

/// The superseded versions of a class that may still be running somewhere
#[derive(Debug, Default)]
pub struct VersionHistory {
    versions: Vec<Arc<ClassVersion>>,
}
impl VersionHistory {
    pub(crate) fn push(&mut self, version: Arc<ClassVersion>) {
        self.versions.push(version);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClassVersion>> {
        self.versions.iter()
    }

    /// Drop every version none of whose methods are executing.
    /// Returns how many were dropped.
    pub fn purge(&mut self, frames: &dyn FrameOracle) -> usize {
        let before = self.versions.len();
        self.versions.retain(|version| {
            version
                .methods()
                .iter()
                .any(|method| frames.is_executing(method.key()))
        });
        let purged = before - self.versions.len();
        if purged != 0 {
            tracing::debug!("Purged {} previous version(s)", purged);
        }
        purged
    }
}

/// A loaded class. Its id, name and hierarchy are fixed; everything else is a
/// [`ClassVersion`] which redefinition replaces.
#[derive(Debug)]
pub struct LoadedClass {
    id: ClassId,
    name: Symbol,
    super_class: Option<ClassId>,
    interfaces: Vec<ClassId>,
    current: RwLock<Arc<ClassVersion>>,
    history: Mutex<VersionHistory>,
    /// Dispatch table of virtual methods, the super class's entries first
    vtable: RwLock<Vec<MethodKey>>,
    /// For each implemented interface, the implementation of each of its methods
    itable: RwLock<IdMap<ClassId, Vec<Option<MethodKey>>>>,
    redefinition_count: AtomicU32,
    next_method_idnum: AtomicU16,
}
impl LoadedClass {
    pub(crate) fn new(
        id: ClassId,
        name: Symbol,
        super_class: Option<ClassId>,
        interfaces: Vec<ClassId>,
        version: Arc<ClassVersion>,
        vtable: Vec<MethodKey>,
        itable: IdMap<ClassId, Vec<Option<MethodKey>>>,
    ) -> LoadedClass {
        let next_method_idnum = version.methods().len() as u16;
        LoadedClass {
            id,
            name,
            super_class,
            interfaces,
            current: RwLock::new(version),
            history: Mutex::new(VersionHistory::default()),
            vtable: RwLock::new(vtable),
            itable: RwLock::new(itable),
            redefinition_count: AtomicU32::new(0),
            next_method_idnum: AtomicU16::new(next_method_idnum),
        }
    }

    #[must_use]
    pub fn id(&self) -> ClassId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    #[must_use]
    pub fn super_class(&self) -> Option<ClassId> {
        self.super_class
    }

    #[must_use]
    pub fn interfaces(&self) -> &[ClassId] {
        &self.interfaces
    }

    /// The installed version
    #[must_use]
    pub fn current(&self) -> Arc<ClassVersion> {
        Arc::clone(&self.current.read())
    }

    /// Replace the installed version, returning the one it replaced
    pub(crate) fn swap_current(&self, version: Arc<ClassVersion>) -> Arc<ClassVersion> {
        std::mem::replace(&mut *self.current.write(), version)
    }

    pub fn history(&self) -> MutexGuard<'_, VersionHistory> {
        self.history.lock()
    }

    /// Drop previous versions that nothing is executing anymore
    pub fn purge_previous_versions(&self, frames: &dyn FrameOracle) -> usize {
        self.history.lock().purge(frames)
    }

    #[must_use]
    pub fn vtable(&self) -> Vec<MethodKey> {
        self.vtable.read().clone()
    }

    #[must_use]
    pub fn vtable_entry(&self, index: usize) -> Option<MethodKey> {
        self.vtable.read().get(index).copied()
    }

    #[must_use]
    pub fn itable_entry(&self, interface: ClassId, index: usize) -> Option<MethodKey> {
        self.itable
            .read()
            .get(&interface)
            .and_then(|methods| methods.get(index).copied().flatten())
    }

    /// Every method key in the vtable and itable
    #[must_use]
    pub fn dispatch_targets(&self) -> Vec<MethodKey> {
        let mut targets = self.vtable.read().clone();
        for methods in self.itable.read().values() {
            targets.extend(methods.iter().flatten().copied());
        }
        targets
    }

    /// Swap replaced methods in the vtable and itable.
    /// Returns how many slots changed.
    pub(crate) fn retarget_dispatch(&self, replacements: &IdMap<MethodKey, MethodKey>) -> usize {
        let mut changed = 0;
        for slot in self.vtable.write().iter_mut() {
            if let Some(&new) = replacements.get(slot) {
                *slot = new;
                changed += 1;
            }
        }
        for methods in self.itable.write().values_mut() {
            for slot in methods.iter_mut().flatten() {
                if let Some(&new) = replacements.get(slot) {
                    *slot = new;
                    changed += 1;
                }
            }
        }
        changed
    }

    #[must_use]
    pub fn redefinition_count(&self) -> u32 {
        self.redefinition_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_redefinition_count(&self) -> u32 {
        self.redefinition_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The idnum the next added method will get, without claiming it
    #[must_use]
    pub fn peek_method_idnum(&self) -> MethodIdnum {
        MethodIdnum::new(self.next_method_idnum.load(Ordering::Acquire))
    }

    /// Claim `count` fresh idnums, returning the first. `None` once they have run out.
    /// Claimed idnums are never handed out again, even if whatever claimed them fails.
    pub(crate) fn reserve_method_idnums(&self, count: u16) -> Option<MethodIdnum> {
        self.next_method_idnum
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(count)
            })
            .ok()
            .map(MethodIdnum::new)
    }
}
