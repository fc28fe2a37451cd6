use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;
use redefine_base::{code::op::Opcode, id::MethodKey, ClassId, IdMap, PoolIndex};

use crate::error::LinkageError;

bitflags! {
    pub struct CacheFlags: u32 {
        const STATIC = 1 << 0;
        const FINAL = 1 << 1;
        const VOLATILE = 1 << 2;
        /// The auxiliary word holds a vtable index
        const VTABLE = 1 << 3;
        /// The auxiliary word holds an itable index
        const ITABLE = 1 << 4;
        /// The call site passes an extra argument produced by its bootstrap
        const HAS_APPENDIX = 1 << 5;
        /// Resolution failed, and will keep failing the same way
        const FAILED = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Field,
    Method,
    InterfaceMethod,
    Dynamic,
}

/// What a cache entry resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedTarget {
    Method(MethodKey),
    /// A field, by the class that declares it and its position there
    Field { holder: ClassId, slot: u16 },
    /// The call site object a bootstrap method produced
    CallSite(u32),
}

const UNRESOLVED: u64 = 0;
/// A thread has won the right to publish and is writing the other fields
const CLAIMED: u64 = u64::MAX;

const TAG_SHIFT: u32 = 56;
const TAG_METHOD: u64 = 1;
const TAG_FIELD: u64 = 2;
const TAG_CALL_SITE: u64 = 3;

impl ResolvedTarget {
    fn encode(self) -> u64 {
        match self {
            ResolvedTarget::Method(key) => (TAG_METHOD << TAG_SHIFT) | u64::from(key.get()),
            ResolvedTarget::Field { holder, slot } => {
                (TAG_FIELD << TAG_SHIFT) | (u64::from(slot) << 32) | u64::from(holder.get())
            }
            ResolvedTarget::CallSite(id) => (TAG_CALL_SITE << TAG_SHIFT) | u64::from(id),
        }
    }

    fn decode(value: u64) -> Option<ResolvedTarget> {
        let low = (value & 0xFFFF_FFFF) as u32;
        match value >> TAG_SHIFT {
            TAG_METHOD => Some(ResolvedTarget::Method(MethodKey::new_unchecked(low))),
            TAG_FIELD => Some(ResolvedTarget::Field {
                holder: ClassId::new_unchecked(low),
                slot: ((value >> 32) & 0xFFFF) as u16,
            }),
            TAG_CALL_SITE => Some(ResolvedTarget::CallSite(low)),
            _ => None,
        }
    }
}

/// Everything a resolution produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub target: ResolvedTarget,
    /// Dispatch index, field type, or appendix, depending on the kind of entry
    pub aux: u64,
    pub flags: CacheFlags,
}

/// The outcome of publishing a resolution to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// Ours is the resolution every thread will see
    Won(Resolution),
    /// Another thread published first; its resolution is given and ours was discarded
    Lost(Resolution),
}
impl Publish {
    #[must_use]
    pub fn resolution(self) -> Resolution {
        match self {
            Publish::Won(resolution) | Publish::Lost(resolution) => resolution,
        }
    }

    #[must_use]
    pub fn won(self) -> bool {
        matches!(self, Publish::Won(_))
    }
}

/// One published resolution. The target word is authoritative. It is written last with release
/// ordering, so a thread that reads a resolved target with acquire ordering also sees the
/// auxiliary word and flags that go with it.
#[derive(Debug)]
struct ResolutionSlot {
    target: AtomicU64,
    aux: AtomicU64,
    flags: AtomicU32,
}
impl ResolutionSlot {
    fn new() -> ResolutionSlot {
        ResolutionSlot {
            target: AtomicU64::new(UNRESOLVED),
            aux: AtomicU64::new(0),
            flags: AtomicU32::new(0),
        }
    }

    fn load(&self) -> Option<Resolution> {
        let target = self.target.load(Ordering::Acquire);
        if target == UNRESOLVED || target == CLAIMED {
            return None;
        }

        let target = ResolvedTarget::decode(target)?;
        Some(Resolution {
            target,
            aux: self.aux.load(Ordering::Relaxed),
            flags: CacheFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
                - CacheFlags::FAILED,
        })
    }

    /// Claim the slot and write `resolution` to it, or return false if it was already claimed
    fn try_publish(&self, resolution: Resolution) -> bool {
        let claim = self.target.compare_exchange(
            UNRESOLVED,
            CLAIMED,
            Ordering::Acquire,
            Ordering::Acquire,
        );
        if claim.is_err() {
            return false;
        }
        self.aux.store(resolution.aux, Ordering::Relaxed);
        self.flags.fetch_or(resolution.flags.bits(), Ordering::Relaxed);
        self.target
            .store(resolution.target.encode(), Ordering::Release);
        true
    }

    fn wait_resolved(&self) -> Resolution {
        loop {
            if let Some(resolution) = self.load() {
                return resolution;
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    fn retarget(&self, replacements: &IdMap<MethodKey, MethodKey>) -> bool {
        if let Some(Resolution {
            target: ResolvedTarget::Method(old),
            ..
        }) = self.load()
        {
            if let Some(&new) = replacements.get(&old) {
                self.target
                    .store(ResolvedTarget::Method(new).encode(), Ordering::Release);
                return true;
            }
        }
        false
    }
}

/// One slot of a [`super::CallSiteCache`].
///
/// An entry holds two resolutions which are published separately. The direct half names the
/// method or field itself, and is used by field access, `invokestatic`, `invokespecial` and
/// `invokedynamic`. The dispatch half carries a table index for `invokevirtual` and
/// `invokeinterface`. A `super.run()` and a `this.run()` naming the same pool entry would
/// otherwise see each other's dispatch mode.
#[derive(Debug)]
pub struct CacheEntry {
    cp_index: PoolIndex,
    kind: CacheKind,
    direct: ResolutionSlot,
    dispatch: ResolutionSlot,
    /// The get, static, special or dynamic instruction which has resolved this entry
    bytecode1: AtomicU8,
    /// The put style instruction, `invokevirtual` or `invokeinterface`, which has resolved this
    /// entry
    bytecode2: AtomicU8,
    failure: Mutex<Option<LinkageError>>,
}
impl CacheEntry {
    pub(crate) fn new(cp_index: PoolIndex, kind: CacheKind) -> CacheEntry {
        CacheEntry {
            cp_index,
            kind,
            direct: ResolutionSlot::new(),
            dispatch: ResolutionSlot::new(),
            bytecode1: AtomicU8::new(0),
            bytecode2: AtomicU8::new(0),
            failure: Mutex::new(None),
        }
    }

    /// The pool index of the reference this entry caches
    #[must_use]
    pub fn cp_index(&self) -> PoolIndex {
        self.cp_index
    }

    #[must_use]
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    /// The published direct resolution, if there is one
    #[must_use]
    pub fn resolved(&self) -> Option<Resolution> {
        self.direct.load()
    }

    /// The published resolution in the half that `opcode` uses, whichever instruction
    /// published it
    #[must_use]
    pub fn resolved_by(&self, opcode: Opcode) -> Option<Resolution> {
        self.half(opcode).load()
    }

    /// The published resolution, if `opcode` has already used it
    #[must_use]
    pub fn resolved_for(&self, opcode: Opcode) -> Option<Resolution> {
        let resolution = self.half(opcode).load()?;
        let slot = self.bytecode_slot(opcode);
        (slot.load(Ordering::Acquire) == opcode.raw()).then(|| resolution)
    }

    /// Both halves' resolutions, direct first
    pub fn resolutions(&self) -> impl Iterator<Item = Resolution> + '_ {
        self.direct.load().into_iter().chain(self.dispatch.load())
    }

    #[must_use]
    pub fn bytecode1(&self) -> Option<Opcode> {
        Opcode::from_raw(self.bytecode1.load(Ordering::Acquire)).filter(|op| *op != Opcode::Nop)
    }

    #[must_use]
    pub fn bytecode2(&self) -> Option<Opcode> {
        Opcode::from_raw(self.bytecode2.load(Ordering::Acquire)).filter(|op| *op != Opcode::Nop)
    }

    fn half(&self, opcode: Opcode) -> &ResolutionSlot {
        match opcode {
            Opcode::InvokeVirtual | Opcode::InvokeInterface => &self.dispatch,
            _ => &self.direct,
        }
    }

    fn bytecode_slot(&self, opcode: Opcode) -> &AtomicU8 {
        match opcode {
            Opcode::PutField
            | Opcode::PutStatic
            | Opcode::InvokeVirtual
            | Opcode::InvokeInterface => &self.bytecode2,
            _ => &self.bytecode1,
        }
    }

    /// Publish a resolution on behalf of `opcode`.
    /// Only the first publication to each half takes effect. A thread that loses waits for the
    /// winner's resolution to become visible and returns that instead.
    pub(crate) fn publish(&self, opcode: Opcode, resolution: Resolution) -> Publish {
        let half = self.half(opcode);
        let published = if half.try_publish(resolution) {
            Publish::Won(resolution)
        } else {
            Publish::Lost(half.wait_resolved())
        };
        // The target is already visible, so this only widens which instructions may use it
        self.bytecode_slot(opcode)
            .store(opcode.raw(), Ordering::Release);
        published
    }

    /// Point resolved method targets in either half at their replacements.
    /// Only done while every mutator is stopped. Returns how many halves changed.
    pub(crate) fn retarget_methods(&self, replacements: &IdMap<MethodKey, MethodKey>) -> usize {
        usize::from(self.direct.retarget(replacements))
            + usize::from(self.dispatch.retarget(replacements))
    }

    pub(crate) fn failure(&self) -> Option<LinkageError> {
        self.failure.lock().clone()
    }

    pub(crate) fn record_failure(&self, err: LinkageError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
            self.direct
                .flags
                .fetch_or(CacheFlags::FAILED.bits(), Ordering::Release);
        }
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        CacheFlags::from_bits_truncate(self.direct.flags.load(Ordering::Acquire))
            .contains(CacheFlags::FAILED)
    }
}

#[cfg(test)]
mod tests {
    use redefine_base::{code::op::Opcode, id::MethodKey, ClassId, IdMap};

    use super::{CacheEntry, CacheFlags, CacheKind, Publish, Resolution, ResolvedTarget};

    #[test]
    fn test_target_encoding() {
        let targets = [
            ResolvedTarget::Method(MethodKey::new_unchecked(77)),
            ResolvedTarget::Field {
                holder: ClassId::new_unchecked(u32::MAX - 1),
                slot: 9,
            },
            ResolvedTarget::CallSite(0),
        ];
        for target in targets {
            assert_eq!(ResolvedTarget::decode(target.encode()), Some(target));
        }
    }

    #[test]
    fn test_first_publish_wins() {
        let entry = CacheEntry::new(5, CacheKind::Field);
        assert_eq!(entry.resolved(), None);

        let first = Resolution {
            target: ResolvedTarget::Field {
                holder: ClassId::new_unchecked(1),
                slot: 0,
            },
            aux: 1,
            flags: CacheFlags::VOLATILE,
        };
        let second = Resolution {
            aux: 2,
            flags: CacheFlags::empty(),
            ..first
        };

        assert_eq!(entry.publish(Opcode::GetField, first), Publish::Won(first));
        assert_eq!(entry.resolved_for(Opcode::GetField), Some(first));
        assert_eq!(entry.resolved_for(Opcode::PutField), None);

        assert_eq!(entry.publish(Opcode::PutField, second), Publish::Lost(first));
        assert_eq!(entry.resolved_for(Opcode::PutField), Some(first));
        assert_eq!(entry.bytecode1(), Some(Opcode::GetField));
        assert_eq!(entry.bytecode2(), Some(Opcode::PutField));
    }

    #[test]
    fn test_direct_and_dispatch_publish_separately() {
        let entry = CacheEntry::new(4, CacheKind::Method);
        let direct = Resolution {
            target: ResolvedTarget::Method(MethodKey::new_unchecked(3)),
            aux: 0,
            flags: CacheFlags::FINAL,
        };
        let dispatch = Resolution {
            aux: 1,
            flags: CacheFlags::VTABLE,
            ..direct
        };

        assert_eq!(entry.publish(Opcode::InvokeSpecial, direct), Publish::Won(direct));
        assert_eq!(entry.resolved_by(Opcode::InvokeVirtual), None);
        assert_eq!(entry.publish(Opcode::InvokeVirtual, dispatch), Publish::Won(dispatch));

        assert_eq!(entry.resolved_for(Opcode::InvokeSpecial), Some(direct));
        assert_eq!(entry.resolved_for(Opcode::InvokeVirtual), Some(dispatch));
        assert_eq!(entry.resolutions().count(), 2);

        // A static call shares the direct half with the special call
        assert_eq!(entry.resolved_for(Opcode::InvokeStatic), None);
        assert_eq!(entry.resolved_by(Opcode::InvokeStatic), Some(direct));

        let mut replacements = IdMap::default();
        replacements.insert(MethodKey::new_unchecked(3), MethodKey::new_unchecked(8));
        assert_eq!(entry.retarget_methods(&replacements), 2);
        let moved = ResolvedTarget::Method(MethodKey::new_unchecked(8));
        assert_eq!(entry.resolved_for(Opcode::InvokeSpecial).unwrap().target, moved);
        let virtual_call = entry.resolved_for(Opcode::InvokeVirtual).unwrap();
        assert_eq!(virtual_call.target, moved);
        assert_eq!(virtual_call.aux, 1);
    }
}
