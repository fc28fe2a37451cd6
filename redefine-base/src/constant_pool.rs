use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use itertools::Itertools;
use smallvec::SmallVec;

use crate::{id::ClassId, symbol::Symbol};

/// A 1-based index into a [`ConstantPool`]. Zero is never a valid entry.
pub type PoolIndex = u16;

/// How deep comparisons may recurse through bootstrap arguments before giving up.
/// Well formed class files never get close to this. Cycles are caught before it, see
/// [`ConstantPool::compare_entry_to`].
const MAX_COMPARE_DEPTH: u32 = 32;

/// Pairs of dynamic entries whose comparison is in progress
type DynamicPairs = SmallVec<[(PoolIndex, PoolIndex); 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantTag {
    Utf8,
    Integer,
    Float,
    Long,
    Double,
    Class,
    String,
    FieldRef,
    MethodRef,
    InterfaceMethodRef,
    NameAndType,
    MethodHandle,
    MethodType,
    Dynamic,
    InvokeDynamic,
}
impl ConstantTag {
    #[must_use]
    pub fn from_raw(tag: u8) -> Option<ConstantTag> {
        Some(match tag {
            1 => ConstantTag::Utf8,
            3 => ConstantTag::Integer,
            4 => ConstantTag::Float,
            5 => ConstantTag::Long,
            6 => ConstantTag::Double,
            7 => ConstantTag::Class,
            8 => ConstantTag::String,
            9 => ConstantTag::FieldRef,
            10 => ConstantTag::MethodRef,
            11 => ConstantTag::InterfaceMethodRef,
            12 => ConstantTag::NameAndType,
            15 => ConstantTag::MethodHandle,
            16 => ConstantTag::MethodType,
            17 => ConstantTag::Dynamic,
            18 => ConstantTag::InvokeDynamic,
            _ => return None,
        })
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            ConstantTag::Utf8 => 1,
            ConstantTag::Integer => 3,
            ConstantTag::Float => 4,
            ConstantTag::Long => 5,
            ConstantTag::Double => 6,
            ConstantTag::Class => 7,
            ConstantTag::String => 8,
            ConstantTag::FieldRef => 9,
            ConstantTag::MethodRef => 10,
            ConstantTag::InterfaceMethodRef => 11,
            ConstantTag::NameAndType => 12,
            ConstantTag::MethodHandle => 15,
            ConstantTag::MethodType => 16,
            ConstantTag::Dynamic => 17,
            ConstantTag::InvokeDynamic => 18,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ConstantTag::Utf8 => "Utf8",
            ConstantTag::Integer => "Integer",
            ConstantTag::Float => "Float",
            ConstantTag::Long => "Long",
            ConstantTag::Double => "Double",
            ConstantTag::Class => "Class",
            ConstantTag::String => "String",
            ConstantTag::FieldRef => "Fieldref",
            ConstantTag::MethodRef => "Methodref",
            ConstantTag::InterfaceMethodRef => "InterfaceMethodref",
            ConstantTag::NameAndType => "NameAndType",
            ConstantTag::MethodHandle => "MethodHandle",
            ConstantTag::MethodType => "MethodType",
            ConstantTag::Dynamic => "Dynamic",
            ConstantTag::InvokeDynamic => "InvokeDynamic",
        }
    }

    /// Whether `ldc`-family instructions or bootstrap arguments may refer to this tag
    #[must_use]
    pub fn is_loadable(self) -> bool {
        matches!(
            self,
            ConstantTag::Integer
                | ConstantTag::Float
                | ConstantTag::Long
                | ConstantTag::Double
                | ConstantTag::Class
                | ConstantTag::String
                | ConstantTag::MethodHandle
                | ConstantTag::MethodType
                | ConstantTag::Dynamic
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}
impl ReferenceKind {
    #[must_use]
    pub fn from_raw(kind: u8) -> Option<ReferenceKind> {
        Some(match kind {
            1 => ReferenceKind::GetField,
            2 => ReferenceKind::GetStatic,
            3 => ReferenceKind::PutField,
            4 => ReferenceKind::PutStatic,
            5 => ReferenceKind::InvokeVirtual,
            6 => ReferenceKind::InvokeStatic,
            7 => ReferenceKind::InvokeSpecial,
            8 => ReferenceKind::NewInvokeSpecial,
            9 => ReferenceKind::InvokeInterface,
            _ => return None,
        })
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            ReferenceKind::GetField => 1,
            ReferenceKind::GetStatic => 2,
            ReferenceKind::PutField => 3,
            ReferenceKind::PutStatic => 4,
            ReferenceKind::InvokeVirtual => 5,
            ReferenceKind::InvokeStatic => 6,
            ReferenceKind::InvokeSpecial => 7,
            ReferenceKind::NewInvokeSpecial => 8,
            ReferenceKind::InvokeInterface => 9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub class_index: PoolIndex,
    pub name_and_type_index: PoolIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicRef {
    /// Index into the pool's operands (the `BootstrapMethods` attribute)
    pub bootstrap_index: u16,
    pub name_and_type_index: PoolIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantEntry {
    /// Index zero, and the unaddressable second slot of a long or double.
    Invalid,
    Utf8(Symbol),
    Integer(i32),
    /// The raw bits, so that distinct NaN payloads are kept distinct
    Float(u32),
    Long(i64),
    /// The raw bits, so that distinct NaN payloads are kept distinct
    Double(u64),
    /// Whether the class has been resolved is tracked by the pool, not the entry.
    Class {
        name_index: PoolIndex,
    },
    String {
        string_index: PoolIndex,
    },
    FieldRef(MemberRef),
    MethodRef(MemberRef),
    InterfaceMethodRef(MemberRef),
    NameAndType {
        name_index: PoolIndex,
        descriptor_index: PoolIndex,
    },
    MethodHandle {
        kind: ReferenceKind,
        reference_index: PoolIndex,
    },
    MethodType {
        descriptor_index: PoolIndex,
    },
    Dynamic(DynamicRef),
    InvokeDynamic(DynamicRef),
}
impl ConstantEntry {
    #[must_use]
    pub fn tag(&self) -> Option<ConstantTag> {
        Some(match self {
            ConstantEntry::Invalid => return None,
            ConstantEntry::Utf8(_) => ConstantTag::Utf8,
            ConstantEntry::Integer(_) => ConstantTag::Integer,
            ConstantEntry::Float(_) => ConstantTag::Float,
            ConstantEntry::Long(_) => ConstantTag::Long,
            ConstantEntry::Double(_) => ConstantTag::Double,
            ConstantEntry::Class { .. } => ConstantTag::Class,
            ConstantEntry::String { .. } => ConstantTag::String,
            ConstantEntry::FieldRef(_) => ConstantTag::FieldRef,
            ConstantEntry::MethodRef(_) => ConstantTag::MethodRef,
            ConstantEntry::InterfaceMethodRef(_) => ConstantTag::InterfaceMethodRef,
            ConstantEntry::NameAndType { .. } => ConstantTag::NameAndType,
            ConstantEntry::MethodHandle { .. } => ConstantTag::MethodHandle,
            ConstantEntry::MethodType { .. } => ConstantTag::MethodType,
            ConstantEntry::Dynamic(_) => ConstantTag::Dynamic,
            ConstantEntry::InvokeDynamic(_) => ConstantTag::InvokeDynamic,
        })
    }

    /// Longs and doubles take up two slots in the pool
    #[must_use]
    pub fn is_wide(&self) -> bool {
        matches!(self, ConstantEntry::Long(_) | ConstantEntry::Double(_))
    }

    #[must_use]
    pub fn width(&self) -> u16 {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    #[must_use]
    pub fn as_member_ref(&self) -> Option<&MemberRef> {
        match self {
            ConstantEntry::FieldRef(member)
            | ConstantEntry::MethodRef(member)
            | ConstantEntry::InterfaceMethodRef(member) => Some(member),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dynamic(&self) -> Option<&DynamicRef> {
        match self {
            ConstantEntry::Dynamic(dynamic) | ConstantEntry::InvokeDynamic(dynamic) => {
                Some(dynamic)
            }
            _ => None,
        }
    }
}

/// An entry in the operands side-table: the bootstrap method handle and its static arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapSpecifier {
    pub method_handle_index: PoolIndex,
    pub arguments: SmallVec<[PoolIndex; 4]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConstantPoolError {
    /// Index zero, the second slot of a long/double, or past the end of the pool
    InvalidIndex { index: PoolIndex },
    /// The entry at the index was not of the kind that was required
    BadTag {
        index: PoolIndex,
        expected: &'static str,
        found: Option<ConstantTag>,
    },
    /// A long or double was the last entry, so it had no room for its second slot
    MissingWideSlot { index: PoolIndex },
    /// There was no bootstrap specifier at that index
    InvalidOperandIndex { index: u16 },
    /// The pool would need more slots than a u16 index can address
    Overflow,
}
impl fmt::Display for ConstantPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantPoolError::InvalidIndex { index } => {
                write!(f, "invalid constant pool index #{}", index)
            }
            ConstantPoolError::BadTag {
                index,
                expected,
                found,
            } => write!(
                f,
                "expected {} at #{} but found {}",
                expected,
                index,
                found.map_or("nothing", ConstantTag::name)
            ),
            ConstantPoolError::MissingWideSlot { index } => {
                write!(f, "wide constant at #{} has no second slot", index)
            }
            ConstantPoolError::InvalidOperandIndex { index } => {
                write!(f, "invalid bootstrap specifier index {}", index)
            }
            ConstantPoolError::Overflow => f.write_str("constant pool index space exhausted"),
        }
    }
}
impl std::error::Error for ConstantPoolError {}

/// A symbolic member reference, with every indirection followed.
#[derive(Debug, Clone, Copy)]
pub struct MemberRefInfo<'a> {
    pub tag: ConstantTag,
    pub class_name: &'a Symbol,
    pub name: &'a Symbol,
    pub descriptor: &'a Symbol,
}

/// The constant pool of one class version, plus its operands side-table.
///
/// A pool only grows while it is exclusively owned (parsing, merging). Once it is shared it is
/// never mutated, with the exception of class entries moving from unresolved to resolved, which
/// is tracked atomically beside the entries.
pub struct ConstantPool {
    /// Index zero is always [`ConstantEntry::Invalid`]
    entries: Vec<ConstantEntry>,
    operands: Vec<BootstrapSpecifier>,
    /// The resolved class of each class entry, stored as the id plus one so that zero means
    /// unresolved.
    resolved_classes: Vec<AtomicU32>,
}
impl ConstantPool {
    /// A pool holding only the unused zero slot
    #[must_use]
    pub fn empty() -> ConstantPool {
        ConstantPool {
            entries: vec![ConstantEntry::Invalid],
            operands: Vec::new(),
            resolved_classes: vec![AtomicU32::new(0)],
        }
    }

    /// Construct a pool from entries (which must include the leading invalid slot) and the
    /// bootstrap specifiers, checking that every reference is to an entry of the right kind.
    pub fn from_parts(
        entries: Vec<ConstantEntry>,
        operands: Vec<BootstrapSpecifier>,
    ) -> Result<ConstantPool, ConstantPoolError> {
        if entries.len() > usize::from(u16::MAX) {
            return Err(ConstantPoolError::Overflow);
        }
        if entries.first() != Some(&ConstantEntry::Invalid) {
            return Err(ConstantPoolError::InvalidIndex { index: 0 });
        }

        let resolved_classes = entries.iter().map(|_| AtomicU32::new(0)).collect();
        let pool = ConstantPool {
            entries,
            operands,
            resolved_classes,
        };
        pool.validate()?;
        Ok(pool)
    }

    /// Check that every entry refers to entries of the kind the class file format requires,
    /// and that wide entries are followed by their placeholder slot.
    pub fn validate(&self) -> Result<(), ConstantPoolError> {
        let mut index = 1;
        while index < self.entries.len() {
            let pool_index = index as PoolIndex;
            let entry = &self.entries[index];
            match entry {
                ConstantEntry::Invalid => {
                    return Err(ConstantPoolError::InvalidIndex { index: pool_index })
                }
                ConstantEntry::Long(_) | ConstantEntry::Double(_) => {
                    if self.entries.get(index + 1) != Some(&ConstantEntry::Invalid) {
                        return Err(ConstantPoolError::MissingWideSlot { index: pool_index });
                    }
                }
                ConstantEntry::Utf8(_) | ConstantEntry::Integer(_) | ConstantEntry::Float(_) => {}
                ConstantEntry::Class { name_index } => {
                    self.expect_tag(*name_index, ConstantTag::Utf8)?;
                }
                ConstantEntry::String { string_index } => {
                    self.expect_tag(*string_index, ConstantTag::Utf8)?;
                }
                ConstantEntry::FieldRef(member)
                | ConstantEntry::MethodRef(member)
                | ConstantEntry::InterfaceMethodRef(member) => {
                    self.expect_tag(member.class_index, ConstantTag::Class)?;
                    self.expect_tag(member.name_and_type_index, ConstantTag::NameAndType)?;
                }
                ConstantEntry::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    self.expect_tag(*name_index, ConstantTag::Utf8)?;
                    self.expect_tag(*descriptor_index, ConstantTag::Utf8)?;
                }
                ConstantEntry::MethodHandle {
                    kind,
                    reference_index,
                } => {
                    let found = self.tag_at(*reference_index);
                    let valid = match kind {
                        ReferenceKind::GetField
                        | ReferenceKind::GetStatic
                        | ReferenceKind::PutField
                        | ReferenceKind::PutStatic => found == Some(ConstantTag::FieldRef),
                        ReferenceKind::InvokeVirtual | ReferenceKind::NewInvokeSpecial => {
                            found == Some(ConstantTag::MethodRef)
                        }
                        ReferenceKind::InvokeStatic | ReferenceKind::InvokeSpecial => matches!(
                            found,
                            Some(ConstantTag::MethodRef | ConstantTag::InterfaceMethodRef)
                        ),
                        ReferenceKind::InvokeInterface => {
                            found == Some(ConstantTag::InterfaceMethodRef)
                        }
                    };
                    if !valid {
                        return Err(ConstantPoolError::BadTag {
                            index: *reference_index,
                            expected: "member reference matching the handle kind",
                            found,
                        });
                    }
                }
                ConstantEntry::MethodType { descriptor_index } => {
                    self.expect_tag(*descriptor_index, ConstantTag::Utf8)?;
                }
                ConstantEntry::Dynamic(dynamic) | ConstantEntry::InvokeDynamic(dynamic) => {
                    self.expect_tag(dynamic.name_and_type_index, ConstantTag::NameAndType)?;
                    self.operand(dynamic.bootstrap_index)?;
                }
            }
            index += usize::from(entry.width());
        }

        for specifier in &self.operands {
            self.expect_tag(specifier.method_handle_index, ConstantTag::MethodHandle)?;
            for &argument in &specifier.arguments {
                let found = self.tag_at(argument);
                if !found.map_or(false, ConstantTag::is_loadable) {
                    return Err(ConstantPoolError::BadTag {
                        index: argument,
                        expected: "loadable constant",
                        found,
                    });
                }
            }
        }

        Ok(())
    }

    fn expect_tag(&self, index: PoolIndex, expected: ConstantTag) -> Result<(), ConstantPoolError> {
        let found = self.tag_at(index);
        if found == Some(expected) {
            Ok(())
        } else {
            Err(ConstantPoolError::BadTag {
                index,
                expected: expected.name(),
                found,
            })
        }
    }

    /// The class file's `constant_pool_count`: one more than the largest valid index
    #[must_use]
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    /// The index that the next pushed entry will receive
    #[must_use]
    pub fn next_index(&self) -> PoolIndex {
        self.count()
    }

    /// Append an entry, returning its index. Wide entries also receive their placeholder slot.
    /// The caller is responsible for the entry's references being valid.
    pub fn push(&mut self, entry: ConstantEntry) -> Result<PoolIndex, ConstantPoolError> {
        let width = usize::from(entry.width());
        if self.entries.len() + width > usize::from(u16::MAX) {
            return Err(ConstantPoolError::Overflow);
        }

        let index = self.entries.len() as PoolIndex;
        let wide = entry.is_wide();
        self.entries.push(entry);
        self.resolved_classes.push(AtomicU32::new(0));
        if wide {
            self.entries.push(ConstantEntry::Invalid);
            self.resolved_classes.push(AtomicU32::new(0));
        }
        Ok(index)
    }

    /// Append a bootstrap specifier, returning its operand index
    pub fn push_operand(&mut self, specifier: BootstrapSpecifier) -> Result<u16, ConstantPoolError> {
        let index = u16::try_from(self.operands.len()).map_err(|_| ConstantPoolError::Overflow)?;
        self.operands.push(specifier);
        Ok(index)
    }

    #[must_use]
    pub fn entries(&self) -> &[ConstantEntry] {
        &self.entries
    }

    /// Iterate over every addressable entry, skipping placeholder slots
    pub fn iter(&self) -> impl Iterator<Item = (PoolIndex, &ConstantEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !matches!(entry, ConstantEntry::Invalid))
            .map(|(index, entry)| (index as PoolIndex, entry))
    }

    /// Get the raw slot at an index, including placeholder slots
    #[must_use]
    pub fn entry(&self, index: PoolIndex) -> Option<&ConstantEntry> {
        self.entries.get(usize::from(index))
    }

    /// Get the entry at an index, failing on placeholders
    pub fn get(&self, index: PoolIndex) -> Result<&ConstantEntry, ConstantPoolError> {
        match self.entry(index) {
            Some(ConstantEntry::Invalid) | None => Err(ConstantPoolError::InvalidIndex { index }),
            Some(entry) => Ok(entry),
        }
    }

    #[must_use]
    pub fn tag_at(&self, index: PoolIndex) -> Option<ConstantTag> {
        self.entry(index).and_then(ConstantEntry::tag)
    }

    #[must_use]
    pub fn operands(&self) -> &[BootstrapSpecifier] {
        &self.operands
    }

    pub fn operand(&self, index: u16) -> Result<&BootstrapSpecifier, ConstantPoolError> {
        self.operands
            .get(usize::from(index))
            .ok_or(ConstantPoolError::InvalidOperandIndex { index })
    }

    pub fn utf8_at(&self, index: PoolIndex) -> Result<&Symbol, ConstantPoolError> {
        match self.get(index)? {
            ConstantEntry::Utf8(symbol) => Ok(symbol),
            entry => Err(bad_tag(index, "Utf8", entry)),
        }
    }

    pub fn class_name_index_at(&self, index: PoolIndex) -> Result<PoolIndex, ConstantPoolError> {
        match self.get(index)? {
            ConstantEntry::Class { name_index } => Ok(*name_index),
            entry => Err(bad_tag(index, "Class", entry)),
        }
    }

    pub fn class_name_at(&self, index: PoolIndex) -> Result<&Symbol, ConstantPoolError> {
        self.utf8_at(self.class_name_index_at(index)?)
    }

    pub fn string_at(&self, index: PoolIndex) -> Result<&Symbol, ConstantPoolError> {
        match self.get(index)? {
            ConstantEntry::String { string_index } => self.utf8_at(*string_index),
            entry => Err(bad_tag(index, "String", entry)),
        }
    }

    /// Returns the name and descriptor of a name-and-type entry
    pub fn name_and_type_at(&self, index: PoolIndex) -> Result<(&Symbol, &Symbol), ConstantPoolError> {
        match self.get(index)? {
            ConstantEntry::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8_at(*name_index)?, self.utf8_at(*descriptor_index)?)),
            entry => Err(bad_tag(index, "NameAndType", entry)),
        }
    }

    /// Follow every indirection of a field/method/interface-method reference
    pub fn member_ref_at(&self, index: PoolIndex) -> Result<MemberRefInfo<'_>, ConstantPoolError> {
        let entry = self.get(index)?;
        let member = entry
            .as_member_ref()
            .ok_or_else(|| bad_tag(index, "member reference", entry))?;
        let class_name = self.class_name_at(member.class_index)?;
        let (name, descriptor) = self.name_and_type_at(member.name_and_type_index)?;
        Ok(MemberRefInfo {
            // as_member_ref only succeeds for tagged entries
            tag: entry.tag().unwrap_or(ConstantTag::MethodRef),
            class_name,
            name,
            descriptor,
        })
    }

    pub fn dynamic_at(&self, index: PoolIndex) -> Result<&DynamicRef, ConstantPoolError> {
        let entry = self.get(index)?;
        entry
            .as_dynamic()
            .ok_or_else(|| bad_tag(index, "Dynamic or InvokeDynamic", entry))
    }

    /// The class that a class entry has been resolved to, if it has been
    #[must_use]
    pub fn resolved_class_at(&self, index: PoolIndex) -> Option<ClassId> {
        if !matches!(self.entry(index), Some(ConstantEntry::Class { .. })) {
            return None;
        }

        let raw = self.resolved_classes[usize::from(index)].load(Ordering::Acquire);
        raw.checked_sub(1).map(ClassId::new_unchecked)
    }

    #[must_use]
    pub fn is_resolved_class(&self, index: PoolIndex) -> bool {
        self.resolved_class_at(index).is_some()
    }

    /// Resolve a class entry. If another thread got there first, their result is kept and
    /// returned.
    pub fn resolve_class_at(
        &self,
        index: PoolIndex,
        class_id: ClassId,
    ) -> Result<ClassId, ConstantPoolError> {
        self.class_name_index_at(index)?;
        let raw = class_id.get().checked_add(1).ok_or(ConstantPoolError::Overflow)?;
        match self.resolved_classes[usize::from(index)].compare_exchange(
            0,
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(class_id),
            Err(existing) => Ok(ClassId::new_unchecked(existing - 1)),
        }
    }

    /// A copy of the pool with every class entry reverted to its unresolved form, which is
    /// what verification of a pool expects.
    #[must_use]
    pub fn unresolved_copy(&self) -> ConstantPool {
        ConstantPool {
            entries: self.entries.clone(),
            operands: self.operands.clone(),
            resolved_classes: self.entries.iter().map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Compare the entry at `index1` in this pool to the entry at `index2` in `other`,
    /// following indirections so that entries which refer to equal content are equal even if
    /// their indices differ.
    /// A resolved class entry never equals an unresolved one here, see
    /// [`ConstantPool::is_unresolved_class_mismatch`].
    /// Dynamic constants may name themselves as bootstrap arguments. A pair of dynamic entries
    /// met again while it is still being compared is taken as equal, so a cyclic constant
    /// equals itself and anything shaped the same.
    #[must_use]
    pub fn compare_entry_to(&self, index1: PoolIndex, other: &ConstantPool, index2: PoolIndex) -> bool {
        self.compare_entry_depth(index1, other, index2, 0, &mut DynamicPairs::new())
    }

    fn compare_entry_depth(
        &self,
        index1: PoolIndex,
        other: &ConstantPool,
        index2: PoolIndex,
        depth: u32,
        visiting: &mut DynamicPairs,
    ) -> bool {
        if depth > MAX_COMPARE_DEPTH {
            return false;
        }
        let (entry1, entry2) = match (self.entry(index1), other.entry(index2)) {
            (Some(entry1), Some(entry2)) => (entry1, entry2),
            _ => return false,
        };

        let depth = depth + 1;
        match (entry1, entry2) {
            (ConstantEntry::Utf8(a), ConstantEntry::Utf8(b)) => a == b,
            (ConstantEntry::Integer(a), ConstantEntry::Integer(b)) => a == b,
            (ConstantEntry::Float(a), ConstantEntry::Float(b)) => a == b,
            (ConstantEntry::Long(a), ConstantEntry::Long(b)) => a == b,
            (ConstantEntry::Double(a), ConstantEntry::Double(b)) => a == b,
            (ConstantEntry::Class { name_index: n1 }, ConstantEntry::Class { name_index: n2 }) => {
                match (self.resolved_class_at(index1), other.resolved_class_at(index2)) {
                    (Some(k1), Some(k2)) => k1 == k2,
                    (None, None) => self.compare_entry_depth(*n1, other, *n2, depth, visiting),
                    _ => false,
                }
            }
            (
                ConstantEntry::String { string_index: s1 },
                ConstantEntry::String { string_index: s2 },
            ) => self.compare_entry_depth(*s1, other, *s2, depth, visiting),
            (ConstantEntry::FieldRef(a), ConstantEntry::FieldRef(b))
            | (ConstantEntry::MethodRef(a), ConstantEntry::MethodRef(b))
            | (ConstantEntry::InterfaceMethodRef(a), ConstantEntry::InterfaceMethodRef(b)) => {
                self.compare_entry_depth(a.class_index, other, b.class_index, depth, visiting)
                    && self.compare_entry_depth(
                        a.name_and_type_index,
                        other,
                        b.name_and_type_index,
                        depth,
                        visiting,
                    )
            }
            (
                ConstantEntry::NameAndType {
                    name_index: n1,
                    descriptor_index: d1,
                },
                ConstantEntry::NameAndType {
                    name_index: n2,
                    descriptor_index: d2,
                },
            ) => {
                self.compare_entry_depth(*n1, other, *n2, depth, visiting)
                    && self.compare_entry_depth(*d1, other, *d2, depth, visiting)
            }
            (
                ConstantEntry::MethodHandle {
                    kind: k1,
                    reference_index: r1,
                },
                ConstantEntry::MethodHandle {
                    kind: k2,
                    reference_index: r2,
                },
            ) => k1 == k2 && self.compare_entry_depth(*r1, other, *r2, depth, visiting),
            (
                ConstantEntry::MethodType {
                    descriptor_index: d1,
                },
                ConstantEntry::MethodType {
                    descriptor_index: d2,
                },
            ) => self.compare_entry_depth(*d1, other, *d2, depth, visiting),
            (ConstantEntry::Dynamic(a), ConstantEntry::Dynamic(b))
            | (ConstantEntry::InvokeDynamic(a), ConstantEntry::InvokeDynamic(b)) => {
                if visiting.contains(&(index1, index2)) {
                    return true;
                }
                visiting.push((index1, index2));
                let equal = self.compare_entry_depth(
                    a.name_and_type_index,
                    other,
                    b.name_and_type_index,
                    depth,
                    visiting,
                ) && self.compare_operand_depth(
                    a.bootstrap_index,
                    other,
                    b.bootstrap_index,
                    depth,
                    visiting,
                );
                visiting.pop();
                equal
            }
            _ => false,
        }
    }

    /// Compare two bootstrap specifiers by content
    #[must_use]
    pub fn compare_operand_to(&self, index1: u16, other: &ConstantPool, index2: u16) -> bool {
        self.compare_operand_depth(index1, other, index2, 0, &mut DynamicPairs::new())
    }

    fn compare_operand_depth(
        &self,
        index1: u16,
        other: &ConstantPool,
        index2: u16,
        depth: u32,
        visiting: &mut DynamicPairs,
    ) -> bool {
        let (spec1, spec2) = match (self.operand(index1), other.operand(index2)) {
            (Ok(spec1), Ok(spec2)) => (spec1, spec2),
            _ => return false,
        };

        spec1.arguments.len() == spec2.arguments.len()
            && self.compare_entry_depth(
                spec1.method_handle_index,
                other,
                spec2.method_handle_index,
                depth,
                visiting,
            )
            && spec1
                .arguments
                .iter()
                .zip(spec2.arguments.iter())
                .all(|(&a, &b)| self.compare_entry_depth(a, other, b, depth, visiting))
    }

    /// Search all of `search` for an entry equal to the entry at `pattern_index` in this pool.
    /// Returns the first matching index.
    #[must_use]
    pub fn find_matching_entry(&self, pattern_index: PoolIndex, search: &ConstantPool) -> Option<PoolIndex> {
        (1..search.count()).find(|&index| self.compare_entry_to(pattern_index, search, index))
    }

    /// Search the first `search_len` bootstrap specifiers of `search` for one equal to the
    /// specifier at `pattern_index` in this pool.
    #[must_use]
    pub fn find_matching_operand(
        &self,
        pattern_index: u16,
        search: &ConstantPool,
        search_len: u16,
    ) -> Option<u16> {
        let search_len = search_len.min(search.operands.len() as u16);
        (0..search_len).find(|&index| self.compare_operand_to(pattern_index, search, index))
    }

    /// Whether the two entries are class entries naming the same class, where one is resolved
    /// and the other is not. [`ConstantPool::compare_entry_to`] considers these different.
    #[must_use]
    pub fn is_unresolved_class_mismatch(
        &self,
        index1: PoolIndex,
        other: &ConstantPool,
        index2: PoolIndex,
    ) -> bool {
        let (name1, name2) = match (self.class_name_at(index1), other.class_name_at(index2)) {
            (Ok(name1), Ok(name2)) => (name1, name2),
            _ => return false,
        };

        self.is_resolved_class(index1) != other.is_resolved_class(index2) && name1 == name2
    }

    /// A short human readable rendering of an entry, following indirections
    #[must_use]
    pub fn describe(&self, index: PoolIndex) -> String {
        let entry = match self.get(index) {
            Ok(entry) => entry,
            Err(_) => return format!("<invalid #{}>", index),
        };
        match entry {
            ConstantEntry::Invalid => String::from("<invalid>"),
            ConstantEntry::Utf8(symbol) => format!("Utf8 {:?}", symbol.as_lossy_str()),
            ConstantEntry::Integer(value) => format!("Integer {}", value),
            ConstantEntry::Float(bits) => format!("Float {}", f32::from_bits(*bits)),
            ConstantEntry::Long(value) => format!("Long {}", value),
            ConstantEntry::Double(bits) => format!("Double {}", f64::from_bits(*bits)),
            ConstantEntry::Class { name_index } => match self.resolved_class_at(index) {
                Some(class_id) => format!(
                    "Class {} (resolved {})",
                    self.describe_utf8(*name_index),
                    class_id.get()
                ),
                None => format!("Class {}", self.describe_utf8(*name_index)),
            },
            ConstantEntry::String { string_index } => {
                format!("String {:?}", self.describe_utf8(*string_index))
            }
            ConstantEntry::FieldRef(_)
            | ConstantEntry::MethodRef(_)
            | ConstantEntry::InterfaceMethodRef(_) => match self.member_ref_at(index) {
                Ok(info) => format!(
                    "{} {}.{}:{}",
                    info.tag.name(),
                    info.class_name,
                    info.name,
                    info.descriptor
                ),
                Err(err) => format!("<{}>", err),
            },
            ConstantEntry::NameAndType { .. } => match self.name_and_type_at(index) {
                Ok((name, descriptor)) => format!("NameAndType {}:{}", name, descriptor),
                Err(err) => format!("<{}>", err),
            },
            ConstantEntry::MethodHandle {
                kind,
                reference_index,
            } => format!("MethodHandle {:?} #{}", kind, reference_index),
            ConstantEntry::MethodType { descriptor_index } => {
                format!("MethodType {}", self.describe_utf8(*descriptor_index))
            }
            ConstantEntry::Dynamic(dynamic) | ConstantEntry::InvokeDynamic(dynamic) => {
                let arguments = match self.operand(dynamic.bootstrap_index) {
                    Ok(specifier) => specifier
                        .arguments
                        .iter()
                        .map(|argument| format!("#{}", argument))
                        .join(", "),
                    Err(_) => String::from("?"),
                };
                format!(
                    "{} bsm={} [{}] #{}",
                    entry.tag().map_or("?", ConstantTag::name),
                    dynamic.bootstrap_index,
                    arguments,
                    dynamic.name_and_type_index
                )
            }
        }
    }

    fn describe_utf8(&self, index: PoolIndex) -> String {
        self.utf8_at(index)
            .map_or_else(|_| format!("<invalid #{}>", index), ToString::to_string)
    }
}
impl Clone for ConstantPool {
    fn clone(&self) -> Self {
        ConstantPool {
            entries: self.entries.clone(),
            operands: self.operands.clone(),
            resolved_classes: self
                .resolved_classes
                .iter()
                .map(|raw| AtomicU32::new(raw.load(Ordering::Acquire)))
                .collect(),
        }
    }
}
impl fmt::Debug for ConstantPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantPool")
            .field("count", &self.count())
            .field("operands", &self.operands.len())
            .finish()
    }
}

fn bad_tag(index: PoolIndex, expected: &'static str, found: &ConstantEntry) -> ConstantPoolError {
    ConstantPoolError::BadTag {
        index,
        expected,
        found: found.tag(),
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::{
        BootstrapSpecifier, ConstantEntry, ConstantPool, ConstantPoolError, PoolIndex, ReferenceKind,
    };
    use crate::{builder::ConstantPoolBuilder, id::ClassId, symbol::SymbolTable};

    #[test]
    fn test_wide_entries_take_two_slots() {
        let symbols = SymbolTable::new();
        let mut builder = ConstantPoolBuilder::new(&symbols);
        let long = builder.long(5);
        let after = builder.integer(3);
        let pool = builder.build();

        assert_eq!(long, 1);
        assert_eq!(after, 3);
        assert_eq!(pool.count(), 4);
        assert_eq!(pool.get(2), Err(ConstantPoolError::InvalidIndex { index: 2 }));
        assert_eq!(pool.iter().count(), 2);
    }

    #[test]
    fn test_compare_across_pools() {
        let symbols = SymbolTable::new();
        let mut a = ConstantPoolBuilder::new(&symbols);
        let a_ref = a.method_ref("java/lang/Object", "<init>", "()V");
        let a = a.build();

        let mut b = ConstantPoolBuilder::new(&symbols);
        b.utf8("padding");
        b.integer(4);
        let b_ref = b.method_ref("java/lang/Object", "<init>", "()V");
        let b_other = b.method_ref("java/lang/Object", "hashCode", "()I");
        let b = b.build();

        assert_ne!(a_ref, b_ref);
        assert!(a.compare_entry_to(a_ref, &b, b_ref));
        assert!(!a.compare_entry_to(a_ref, &b, b_other));
        assert_eq!(a.find_matching_entry(a_ref, &b), Some(b_ref));
    }

    #[test]
    fn test_float_bits_compare() {
        let symbols = SymbolTable::new();
        let mut builder = ConstantPoolBuilder::new(&symbols);
        let nan_a = builder.push(ConstantEntry::Double(0x7FF8_0000_0000_0001));
        let nan_b = builder.push(ConstantEntry::Double(0x7FF8_0000_0000_0002));
        let zero = builder.push(ConstantEntry::Float(0.0f32.to_bits()));
        let neg_zero = builder.push(ConstantEntry::Float((-0.0f32).to_bits()));
        let pool = builder.build();

        assert!(pool.compare_entry_to(nan_a, &pool, nan_a));
        assert!(!pool.compare_entry_to(nan_a, &pool, nan_b));
        assert!(!pool.compare_entry_to(zero, &pool, neg_zero));
    }

    #[test]
    fn test_resolved_class_mismatch() {
        let symbols = SymbolTable::new();
        let mut builder = ConstantPoolBuilder::new(&symbols);
        let class = builder.class("Foo");
        let resolved = builder.build();
        let unresolved = resolved.unresolved_copy();

        assert_eq!(
            resolved.resolve_class_at(class, ClassId::new_unchecked(7)),
            Ok(ClassId::new_unchecked(7))
        );
        // A second resolution keeps the first result
        assert_eq!(
            resolved.resolve_class_at(class, ClassId::new_unchecked(9)),
            Ok(ClassId::new_unchecked(7))
        );

        assert!(!resolved.compare_entry_to(class, &unresolved, class));
        assert!(resolved.is_unresolved_class_mismatch(class, &unresolved, class));
        assert!(!unresolved.is_unresolved_class_mismatch(class, &unresolved, class));
        assert!(unresolved.compare_entry_to(class, &unresolved.clone(), class));
    }

    #[test]
    fn test_validate_rejects_bad_references() {
        let symbols = SymbolTable::new();
        let entries = vec![
            ConstantEntry::Invalid,
            ConstantEntry::Integer(3),
            ConstantEntry::Class { name_index: 1 },
        ];
        assert!(matches!(
            ConstantPool::from_parts(entries, Vec::new()),
            Err(ConstantPoolError::BadTag { index: 1, .. })
        ));

        let entries = vec![ConstantEntry::Invalid, ConstantEntry::Long(1)];
        assert_eq!(
            ConstantPool::from_parts(entries, Vec::new()).err(),
            Some(ConstantPoolError::MissingWideSlot { index: 1 })
        );

        let mut builder = ConstantPoolBuilder::new(&symbols);
        let handle = builder.method_handle(
            ReferenceKind::InvokeStatic,
            "Boot",
            "bsm",
            "()Ljava/lang/invoke/CallSite;",
        );
        let number = builder.integer(1);
        let boot = builder.operand(BootstrapSpecifier {
            method_handle_index: handle,
            arguments: smallvec![number],
        });
        let indy = builder.invoke_dynamic(boot, "run", "()V");
        let pool = builder.build();
        assert!(pool.validate().is_ok());
        assert_eq!(pool.dynamic_at(indy).map(|d| d.bootstrap_index), Ok(0));
    }

    #[test]
    fn test_cyclic_dynamic_compare() {
        // Dynamic constant whose bootstrap argument is itself
        fn cyclic(symbols: &SymbolTable, name: &str) -> (ConstantPool, PoolIndex) {
            let mut builder = ConstantPoolBuilder::new(symbols);
            let handle = builder.method_handle(ReferenceKind::InvokeStatic, "Boot", "bsm", "()V");
            let nat = builder.name_and_type(name, "I");
            let dynamic_index = builder.peek_next();
            builder.operand(BootstrapSpecifier {
                method_handle_index: handle,
                arguments: smallvec![dynamic_index],
            });
            builder.push(ConstantEntry::Dynamic(super::DynamicRef {
                bootstrap_index: 0,
                name_and_type_index: nat,
            }));
            (builder.build(), dynamic_index)
        }

        let symbols = SymbolTable::new();
        let (pool, index) = cyclic(&symbols, "x");
        assert!(pool.compare_entry_to(index, &pool, index));
        assert!(pool.compare_operand_to(0, &pool, 0));

        let (same, same_index) = cyclic(&symbols, "x");
        assert!(pool.compare_entry_to(index, &same, same_index));
        let (other, other_index) = cyclic(&symbols, "y");
        assert!(!pool.compare_entry_to(index, &other, other_index));
        assert!(!pool.compare_operand_to(0, &other, 0));
    }
}
