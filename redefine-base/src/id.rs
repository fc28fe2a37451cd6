use std::hash::{Hash, Hasher};

/// Identifies a loaded class. Stable across redefinitions of that class.
#[derive(Debug, Copy, Clone, PartialOrd, Ord)]
pub struct ClassId(u32);
impl ClassId {
    #[must_use]
    pub fn new_unchecked(id: u32) -> ClassId {
        ClassId(id)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

// This only really holds true if they're from the same registry instance
impl PartialEq for ClassId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ClassId {}
impl Hash for ClassId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0);
    }
}
#[cfg(feature = "implementation-cheaper-map-hashing")]
impl nohash_hasher::IsEnabled for ClassId {}

/// The small integer identity of a method within its class.
/// Methods judged equivalent across a redefinition keep the same idnum, so that breakpoints and
/// other external trackers stay valid. Obsolete methods are given a fresh one which is never
/// reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MethodIdnum(u16);
impl MethodIdnum {
    #[must_use]
    pub fn new(idnum: u16) -> MethodIdnum {
        MethodIdnum(idnum)
    }

    #[must_use]
    pub fn get(self) -> u16 {
        self.0
    }
}
impl Hash for MethodIdnum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u16(self.0);
    }
}
#[cfg(feature = "implementation-cheaper-map-hashing")]
impl nohash_hasher::IsEnabled for MethodIdnum {}

/// An index into the runtime's method arena.
/// Unlike an idnum this names one specific method body; every version of a method has its own.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MethodKey(u32);
impl MethodKey {
    #[must_use]
    pub fn new_unchecked(key: u32) -> MethodKey {
        MethodKey(key)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}
impl Hash for MethodKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0);
    }
}
#[cfg(feature = "implementation-cheaper-map-hashing")]
impl nohash_hasher::IsEnabled for MethodKey {}
