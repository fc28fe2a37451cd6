use std::sync::{
    atomic::{AtomicU16, AtomicU8, Ordering},
    Arc,
};

use parking_lot::{Mutex, MutexGuard};
use redefine_base::{
    code::Code, id::MethodKey, ClassId, ConstantPool, MethodAccessFlags, MethodIdnum, MethodInfo,
    Symbol,
};

use crate::cpcache::CallSiteCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MethodState {
    /// Part of the class's installed version
    Current = 0,
    /// Replaced by a method which differs only in constant pool indices
    OldEmcp = 1,
    /// Replaced by a method which behaves differently
    OldObsolete = 2,
    /// Not present in the class's installed version
    Deleted = 3,
}
impl MethodState {
    fn from_raw(raw: u8) -> MethodState {
        match raw {
            1 => MethodState::OldEmcp,
            2 => MethodState::OldObsolete,
            3 => MethodState::Deleted,
            _ => MethodState::Current,
        }
    }

    #[must_use]
    pub fn is_old(self) -> bool {
        self != MethodState::Current
    }
}

/// An opaque handle to the native code a native method is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBinding(pub usize);

/// One row of a method's type profile at a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileRow {
    pub bci: u16,
    pub receiver: Option<ClassId>,
    pub target: Option<MethodKey>,
    pub count: u32,
}

/// Receiver and target counts gathered while a method runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileData {
    rows: Vec<ProfileRow>,
}
impl ProfileData {
    pub fn record(&mut self, bci: u16, receiver: Option<ClassId>, target: Option<MethodKey>) {
        let existing = self
            .rows
            .iter_mut()
            .find(|row| row.bci == bci && row.receiver == receiver && row.target == target);
        match existing {
            Some(row) => row.count = row.count.saturating_add(1),
            None => self.rows.push(ProfileRow {
                bci,
                receiver,
                target,
                count: 1,
            }),
        }
    }

    #[must_use]
    pub fn rows(&self) -> &[ProfileRow] {
        &self.rows
    }

    /// Drop every row whose target is stale.
    /// Returns how many were dropped.
    pub fn clean(&mut self, is_stale: impl Fn(MethodKey) -> bool) -> usize {
        let before = self.rows.len();
        self.rows
            .retain(|row| !row.target.map_or(false, |target| is_stale(target)));
        before - self.rows.len()
    }
}

/// A method of some version of a class.
/// It keeps the pool and cache of that version alive for as long as it is around, which is
/// what lets a frame keep running old code after its class has been redefined.
#[derive(Debug)]
pub struct Method {
    key: MethodKey,
    holder: ClassId,
    name: Symbol,
    descriptor: Symbol,
    /// With linked code
    info: MethodInfo,
    pool: Arc<ConstantPool>,
    cache: Arc<CallSiteCache>,
    idnum: AtomicU16,
    state: AtomicU8,
    native: Mutex<Option<NativeBinding>>,
    profile: Mutex<ProfileData>,
}
impl Method {
    pub(crate) fn new(
        key: MethodKey,
        holder: ClassId,
        info: MethodInfo,
        pool: Arc<ConstantPool>,
        cache: Arc<CallSiteCache>,
        idnum: MethodIdnum,
        name: Symbol,
        descriptor: Symbol,
    ) -> Method {
        Method {
            key,
            holder,
            name,
            descriptor,
            info,
            pool,
            cache,
            idnum: AtomicU16::new(idnum.get()),
            state: AtomicU8::new(MethodState::Current as u8),
            native: Mutex::new(None),
            profile: Mutex::new(ProfileData::default()),
        }
    }

    #[must_use]
    pub fn key(&self) -> MethodKey {
        self.key
    }

    #[must_use]
    pub fn holder(&self) -> ClassId {
        self.holder
    }

    #[must_use]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    #[must_use]
    pub fn descriptor(&self) -> &Symbol {
        &self.descriptor
    }

    #[must_use]
    pub fn access_flags(&self) -> MethodAccessFlags {
        self.info.access_flags
    }

    #[must_use]
    pub fn info(&self) -> &MethodInfo {
        &self.info
    }

    /// The method's code, linked to its cache
    #[must_use]
    pub fn code(&self) -> Option<&Code> {
        self.info.code.as_ref()
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
    pub fn idnum(&self) -> MethodIdnum {
        MethodIdnum::new(self.idnum.load(Ordering::Acquire))
    }

    pub(crate) fn set_idnum(&self, idnum: MethodIdnum) {
        self.idnum.store(idnum.get(), Ordering::Release);
    }

    #[must_use]
    pub fn state(&self) -> MethodState {
        MethodState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: MethodState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether a virtual call could dispatch to this method
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        !self
            .info
            .access_flags
            .intersects(MethodAccessFlags::STATIC | MethodAccessFlags::PRIVATE)
            && self.name.as_bytes() != b"<init>"
            && self.name.as_bytes() != b"<clinit>"
    }

    #[must_use]
    pub fn native_binding(&self) -> Option<NativeBinding> {
        *self.native.lock()
    }

    pub fn bind_native(&self, binding: Option<NativeBinding>) {
        *self.native.lock() = binding;
    }

    pub fn profile(&self) -> MutexGuard<'_, ProfileData> {
        self.profile.lock()
    }

    /// `Name.name(descriptor)` for logs
    #[must_use]
    pub fn display_name(&self) -> String {
        format!(
            "{}{}",
            self.name.as_lossy_str(),
            self.descriptor.as_lossy_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use redefine_base::{id::MethodKey, ClassId};

    use super::ProfileData;

    #[test]
    fn test_profile_clean() {
        let old = MethodKey::new_unchecked(1);
        let new = MethodKey::new_unchecked(2);
        let receiver = Some(ClassId::new_unchecked(5));

        let mut profile = ProfileData::default();
        profile.record(4, receiver, Some(old));
        profile.record(4, receiver, Some(old));
        profile.record(4, receiver, Some(new));
        profile.record(9, None, None);
        assert_eq!(profile.rows()[0].count, 2);

        assert_eq!(profile.clean(|key| key == old), 1);
        assert_eq!(profile.rows().len(), 2);
        assert!(profile.rows().iter().all(|row| row.target != Some(old)));
    }
}
