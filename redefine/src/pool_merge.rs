//! Merging the constant pool of a class's current version with the pool of its replacement.
//!
//! The merged pool starts as a copy of the old pool, so every index that old code uses keeps
//! meaning the same thing. Each entry of the candidate's pool is then found in the merged pool
//! or appended to it, and wherever an entry ended up somewhere other than its original index the
//! move is recorded in a [`TranslationMap`] for the bytecode rewriter.

use redefine_base::{
    constant_pool::{BootstrapSpecifier, ConstantEntry, ConstantPoolError, DynamicRef, MemberRef},
    ConstantPool, PoolIndex,
};
use smallvec::SmallVec;

use crate::{error::RedefineError, translation::TranslationMap};

#[derive(Debug)]
pub struct MergeResult {
    pub pool: ConstantPool,
    pub map: TranslationMap,
    /// How many entries were appended past the end of the old pool
    pub appended: usize,
}

/// Merge `scratch`, the pool of a candidate class, into `old`, the pool of the version it
/// replaces.
///
/// Class entries are normalized to their unresolved form in the merged pool, since it will be
/// verified again before use.
pub fn merge_constant_pools(
    old: &ConstantPool,
    scratch: &ConstantPool,
) -> Result<MergeResult, RedefineError> {
    let old_count = old.count();
    // The merged pool can never need more than both pools side by side
    let limit = usize::from(old_count) + usize::from(scratch.count());
    let operand_limit = old.operands().len() + scratch.operands().len();

    let mut context = MergeContext {
        scratch,
        merged: old.unresolved_copy(),
        map: TranslationMap::new(),
        appended: 0,
        in_progress: SmallVec::new(),
    };

    for (index, _) in scratch.iter() {
        if index < old_count {
            context.reconcile(index)?;
        } else {
            context.find_or_append(index)?;
        }
    }

    let MergeContext {
        merged,
        map,
        appended,
        ..
    } = context;
    if usize::from(merged.count()) > limit || merged.operands().len() > operand_limit {
        tracing::error!(
            "Merged pool has {} entries and {} operands, more than the possible {} and {}",
            merged.count(),
            merged.operands().len(),
            limit,
            operand_limit
        );
        return Err(RedefineError::InternalInvariantViolation(String::from(
            "merged constant pool exceeded its worst case length",
        )));
    }

    tracing::info!(
        "Merged pool of {} entries with candidate pool of {}: {} appended, {} moved",
        old_count,
        scratch.count(),
        appended,
        map.len()
    );

    Ok(MergeResult {
        pool: merged,
        map,
        appended,
    })
}

struct MergeContext<'a> {
    scratch: &'a ConstantPool,
    merged: ConstantPool,
    map: TranslationMap,
    appended: usize,
    /// Entries currently being appended, to catch entries which refer to themselves
    in_progress: SmallVec<[PoolIndex; 8]>,
}
impl<'a> MergeContext<'a> {
    /// Handle a candidate entry whose index also exists in the old pool
    fn reconcile(&mut self, index: PoolIndex) -> Result<(), RedefineError> {
        let scratch = self.scratch;
        if scratch.compare_entry_to(index, &self.merged, index)
            || scratch.is_unresolved_class_mismatch(index, &self.merged, index)
        {
            // Same index, same meaning
            return Ok(());
        }

        match scratch.find_matching_entry(index, &self.merged) {
            Some(found) if found == index => Err(same_index_violation(scratch, index)),
            Some(found) => {
                self.map.map_index(index, found);
                Ok(())
            }
            None => self.append_entry(index).map(|_| ()),
        }
    }

    /// Handle a candidate entry past the end of the old pool
    fn find_or_append(&mut self, index: PoolIndex) -> Result<(), RedefineError> {
        match self.scratch.find_matching_entry(index, &self.merged) {
            Some(found) => {
                self.map.map_index(index, found);
                Ok(())
            }
            None => self.append_entry(index).map(|_| ()),
        }
    }

    /// Find the merged index of an entry that another entry refers to, appending it if there is
    /// none
    fn find_or_append_indirect(&mut self, index: PoolIndex) -> Result<PoolIndex, RedefineError> {
        let scratch = self.scratch;
        if scratch.compare_entry_to(index, &self.merged, index) {
            return Ok(index);
        }

        match scratch.find_matching_entry(index, &self.merged) {
            Some(found) if found == index => Err(same_index_violation(scratch, index)),
            Some(found) => Ok(found),
            None => self.append_entry(index),
        }
    }

    fn find_or_append_operand(&mut self, index: u16) -> Result<u16, RedefineError> {
        let scratch = self.scratch;
        let merged_len = u16::try_from(self.merged.operands().len())
            .map_err(|_| ConstantPoolError::Overflow)?;
        if index < merged_len && scratch.compare_operand_to(index, &self.merged, index) {
            return Ok(index);
        }

        if let Some(found) = scratch.find_matching_operand(index, &self.merged, merged_len) {
            self.map.map_operand(index, found);
            return Ok(found);
        }

        let specifier = scratch.operand(index)?;
        let method_handle_index = self.find_or_append_indirect(specifier.method_handle_index)?;
        let arguments = specifier
            .arguments
            .iter()
            .map(|&argument| self.find_or_append_indirect(argument))
            .collect::<Result<SmallVec<_>, _>>()?;

        let new_index = self.merged.push_operand(BootstrapSpecifier {
            method_handle_index,
            arguments,
        })?;
        self.map.map_operand(index, new_index);
        Ok(new_index)
    }

    /// Append a candidate entry, first finding or appending everything it refers to
    fn append_entry(&mut self, index: PoolIndex) -> Result<PoolIndex, RedefineError> {
        if self.in_progress.contains(&index) {
            return Err(RedefineError::InternalInvariantViolation(format!(
                "constant #{} refers to itself",
                index
            )));
        }
        self.in_progress.push(index);

        let scratch = self.scratch;
        let entry = match scratch.get(index)? {
            ConstantEntry::Invalid => {
                return Err(RedefineError::InternalInvariantViolation(format!(
                    "tried to append the unusable slot #{}",
                    index
                )))
            }
            entry @ (ConstantEntry::Utf8(_)
            | ConstantEntry::Integer(_)
            | ConstantEntry::Float(_)
            | ConstantEntry::Long(_)
            | ConstantEntry::Double(_)) => entry.clone(),
            ConstantEntry::Class { name_index } => ConstantEntry::Class {
                name_index: self.find_or_append_indirect(*name_index)?,
            },
            ConstantEntry::String { string_index } => ConstantEntry::String {
                string_index: self.find_or_append_indirect(*string_index)?,
            },
            ConstantEntry::NameAndType {
                name_index,
                descriptor_index,
            } => ConstantEntry::NameAndType {
                name_index: self.find_or_append_indirect(*name_index)?,
                descriptor_index: self.find_or_append_indirect(*descriptor_index)?,
            },
            ConstantEntry::FieldRef(member) => ConstantEntry::FieldRef(self.append_member(member)?),
            ConstantEntry::MethodRef(member) => {
                ConstantEntry::MethodRef(self.append_member(member)?)
            }
            ConstantEntry::InterfaceMethodRef(member) => {
                ConstantEntry::InterfaceMethodRef(self.append_member(member)?)
            }
            ConstantEntry::MethodHandle {
                kind,
                reference_index,
            } => ConstantEntry::MethodHandle {
                kind: *kind,
                reference_index: self.find_or_append_indirect(*reference_index)?,
            },
            ConstantEntry::MethodType { descriptor_index } => ConstantEntry::MethodType {
                descriptor_index: self.find_or_append_indirect(*descriptor_index)?,
            },
            ConstantEntry::Dynamic(dynamic) => ConstantEntry::Dynamic(self.append_dynamic(dynamic)?),
            ConstantEntry::InvokeDynamic(dynamic) => {
                ConstantEntry::InvokeDynamic(self.append_dynamic(dynamic)?)
            }
        };

        let new_index = self.merged.push(entry)?;
        tracing::trace!(
            "appended candidate #{} ({}) as merged #{}",
            index,
            scratch.describe(index),
            new_index
        );
        self.map.map_index(index, new_index);
        self.appended += 1;
        self.in_progress.pop();
        Ok(new_index)
    }

    fn append_member(&mut self, member: &MemberRef) -> Result<MemberRef, RedefineError> {
        Ok(MemberRef {
            class_index: self.find_or_append_indirect(member.class_index)?,
            name_and_type_index: self.find_or_append_indirect(member.name_and_type_index)?,
        })
    }

    fn append_dynamic(&mut self, dynamic: &DynamicRef) -> Result<DynamicRef, RedefineError> {
        Ok(DynamicRef {
            bootstrap_index: self.find_or_append_operand(dynamic.bootstrap_index)?,
            name_and_type_index: self.find_or_append_indirect(dynamic.name_and_type_index)?,
        })
    }
}

fn same_index_violation(scratch: &ConstantPool, index: PoolIndex) -> RedefineError {
    tracing::error!(
        "Candidate #{} ({}) did not compare equal at its own index, but the search found it there",
        index,
        scratch.describe(index)
    );
    RedefineError::InternalInvariantViolation(format!(
        "search and comparison disagree about #{}",
        index
    ))
}

#[cfg(test)]
mod tests {
    use redefine_base::{
        builder::ConstantPoolBuilder,
        constant_pool::{BootstrapSpecifier, ConstantEntry, DynamicRef, ReferenceKind},
        ClassId, ConstantPool, SymbolTable,
    };
    use smallvec::smallvec;

    use super::merge_constant_pools;
    use crate::error::RedefineError;

    /// Every old index means the same thing, and every candidate entry appears exactly once
    fn check_merge_properties(old: &ConstantPool, scratch: &ConstantPool) {
        let result = merge_constant_pools(old, scratch).unwrap();
        let merged = &result.pool;
        let old = old.unresolved_copy();

        for (index, _) in old.iter() {
            assert!(
                old.compare_entry_to(index, merged, index),
                "old #{} changed",
                index
            );
        }

        for (index, _) in scratch.iter() {
            let new_index = result.map.find_new_index(index);
            assert!(
                scratch.compare_entry_to(index, merged, new_index),
                "candidate #{} is not at merged #{}",
                index,
                new_index
            );
            let copies = merged
                .iter()
                .filter(|(merged_index, _)| scratch.compare_entry_to(index, merged, *merged_index))
                .count();
            assert_eq!(copies, 1, "candidate #{} appears {} times", index, copies);
        }
    }

    #[test]
    fn test_appended_entry_keeps_position() {
        let symbols = SymbolTable::new();
        let mut old = ConstantPoolBuilder::new(&symbols);
        old.class("foo");
        let old = old.build();

        let mut scratch = ConstantPoolBuilder::new(&symbols);
        scratch.class("foo");
        let bar = scratch.utf8("bar");
        let scratch = scratch.build();

        let result = merge_constant_pools(&old, &scratch).unwrap();
        assert_eq!(result.pool.count(), 4);
        assert!(result.map.is_empty());
        assert_eq!(result.map.find_new_index(bar), 3);
        assert_eq!(result.appended, 1);
        check_merge_properties(&old, &scratch);
    }

    #[test]
    fn test_changed_entry_is_appended() {
        let symbols = SymbolTable::new();
        let mut old = ConstantPoolBuilder::new(&symbols);
        old.utf8("foo");
        old.utf8("qux");
        let old = old.build();

        let mut scratch = ConstantPoolBuilder::new(&symbols);
        scratch.utf8("bar");
        scratch.utf8("qux");
        let scratch = scratch.build();

        let result = merge_constant_pools(&old, &scratch).unwrap();
        assert_eq!(result.pool.count(), 4);
        assert_eq!(result.pool.utf8_at(1).unwrap().as_bytes(), b"foo");
        assert_eq!(result.pool.utf8_at(2).unwrap().as_bytes(), b"qux");
        assert_eq!(result.pool.utf8_at(3).unwrap().as_bytes(), b"bar");
        assert_eq!(result.map.sorted_indices(), vec![(1, 3)]);
        check_merge_properties(&old, &scratch);
    }

    #[test]
    fn test_moved_entry_is_found() {
        let symbols = SymbolTable::new();
        let mut old = ConstantPoolBuilder::new(&symbols);
        old.utf8("a");
        old.utf8("b");
        let old = old.build();

        let mut scratch = ConstantPoolBuilder::new(&symbols);
        scratch.utf8("b");
        scratch.utf8("a");
        let scratch = scratch.build();

        let result = merge_constant_pools(&old, &scratch).unwrap();
        assert_eq!(result.pool.count(), 3);
        assert_eq!(result.map.sorted_indices(), vec![(1, 2), (2, 1)]);
        assert_eq!(result.appended, 0);
    }

    #[test]
    fn test_indirect_entries_and_wide_slots() {
        let symbols = SymbolTable::new();
        let mut old = ConstantPoolBuilder::new(&symbols);
        old.long(7);
        old.method_ref("demo/A", "run", "()V");
        old.string("hello");
        let old = old.build();

        let mut scratch = ConstantPoolBuilder::new(&symbols);
        scratch.integer(1);
        scratch.double(2.5);
        let field = scratch.field_ref("demo/A", "count", "I");
        scratch.method_ref("demo/A", "run", "()V");
        scratch.long(7);
        let scratch = scratch.build();

        let result = merge_constant_pools(&old, &scratch).unwrap();
        // The field reference reuses the old class entry
        let field_index = result.map.find_new_index(field);
        let info = result.pool.member_ref_at(field_index).unwrap();
        assert_eq!(info.class_name.as_bytes(), b"demo/A");
        assert_eq!(info.name.as_bytes(), b"count");
        // The double and long are never split
        for (_, entry) in result.pool.iter() {
            assert_ne!(entry, &ConstantEntry::Invalid);
        }
        check_merge_properties(&old, &scratch);
    }

    #[test]
    fn test_resolved_classes_are_normalized() {
        let symbols = SymbolTable::new();
        let mut old = ConstantPoolBuilder::new(&symbols);
        let class = old.class("demo/A");
        let old = old.build();
        old.resolve_class_at(class, ClassId::new_unchecked(4)).unwrap();

        let mut scratch = ConstantPoolBuilder::new(&symbols);
        scratch.class("demo/A");
        let scratch = scratch.build();

        let result = merge_constant_pools(&old, &scratch).unwrap();
        assert!(!result.pool.is_resolved_class(class));
        assert!(result.map.is_empty());
        assert_eq!(result.pool.count(), old.count());
        // The old pool itself is left alone
        assert!(old.is_resolved_class(class));
    }

    #[test]
    fn test_bootstrap_specifiers_merge() {
        let symbols = SymbolTable::new();
        let mut old = ConstantPoolBuilder::new(&symbols);
        let handle = old.method_handle(ReferenceKind::InvokeStatic, "demo/Boot", "a", "()V");
        let boot = old.bootstrap(handle, &[]);
        old.invoke_dynamic(boot, "run", "()V");
        let old = old.build();

        let mut scratch = ConstantPoolBuilder::new(&symbols);
        let other = scratch.method_handle(ReferenceKind::InvokeStatic, "demo/Boot", "b", "()V");
        let handle = scratch.method_handle(ReferenceKind::InvokeStatic, "demo/Boot", "a", "()V");
        let arg = scratch.integer(3);
        let first = scratch.bootstrap(other, &[arg]);
        let second = scratch.bootstrap(handle, &[]);
        let indy_b = scratch.invoke_dynamic(first, "run", "()V");
        let indy_a = scratch.invoke_dynamic(second, "run", "()V");
        let scratch = scratch.build();

        let result = merge_constant_pools(&old, &scratch).unwrap();
        // The specifier that already existed is reused, the other is appended after it
        assert_eq!(result.pool.operands().len(), 2);
        assert_eq!(result.map.sorted_operands(), vec![(0, 1)]);
        let merged_a = result.pool.dynamic_at(result.map.find_new_index(indy_a)).unwrap();
        assert_eq!(merged_a.bootstrap_index, 0);
        let merged_b = result.pool.dynamic_at(result.map.find_new_index(indy_b)).unwrap();
        assert_eq!(merged_b.bootstrap_index, 1);
        check_merge_properties(&old, &scratch);
    }

    #[test]
    fn test_merge_with_itself_is_identity() {
        let symbols = SymbolTable::new();
        let mut pool = ConstantPoolBuilder::new(&symbols);
        pool.method_ref("demo/A", "run", "()V");
        pool.double(-0.0);
        pool.field_ref("demo/A", "count", "I");
        let handle = pool.method_handle(ReferenceKind::InvokeStatic, "demo/Boot", "a", "()V");
        let boot = pool.bootstrap(handle, &[]);
        pool.dynamic(boot, "value", "I");
        let pool = pool.build();

        let result = merge_constant_pools(&pool, &pool).unwrap();
        assert!(result.map.is_empty());
        assert_eq!(result.appended, 0);
        assert_eq!(result.pool.count(), pool.count());
    }

    #[test]
    fn test_self_referential_dynamic_is_rejected() {
        let symbols = SymbolTable::new();
        let old = ConstantPoolBuilder::new(&symbols).build();

        let mut scratch = ConstantPoolBuilder::new(&symbols);
        let handle = scratch.method_handle(ReferenceKind::InvokeStatic, "Boot", "bsm", "()V");
        let nat = scratch.name_and_type("x", "I");
        let dynamic = scratch.peek_next();
        scratch.operand(BootstrapSpecifier {
            method_handle_index: handle,
            arguments: smallvec![dynamic],
        });
        scratch.push(ConstantEntry::Dynamic(DynamicRef {
            bootstrap_index: 0,
            name_and_type_index: nat,
        }));
        let scratch = scratch.build();

        assert!(matches!(
            merge_constant_pools(&old, &scratch),
            Err(RedefineError::InternalInvariantViolation(_))
        ));
    }

    #[test]
    fn test_cyclic_dynamic_merges_with_itself() {
        let symbols = SymbolTable::new();
        let mut pool = ConstantPoolBuilder::new(&symbols);
        let handle = pool.method_handle(ReferenceKind::InvokeStatic, "Boot", "bsm", "()V");
        let nat = pool.name_and_type("x", "I");
        let dynamic = pool.peek_next();
        pool.operand(BootstrapSpecifier {
            method_handle_index: handle,
            arguments: smallvec![dynamic],
        });
        pool.push(ConstantEntry::Dynamic(DynamicRef {
            bootstrap_index: 0,
            name_and_type_index: nat,
        }));
        let pool = pool.build();

        let result = merge_constant_pools(&pool, &pool).unwrap();
        assert!(result.map.is_empty());
        assert_eq!(result.appended, 0);
        assert_eq!(result.pool.count(), pool.count());
        assert_eq!(result.pool.operands().len(), 1);
    }

    #[test]
    fn test_full_bootstrap_table_is_exhaustion() {
        let symbols = SymbolTable::new();
        let mut old = ConstantPoolBuilder::new(&symbols);
        let handle = old.method_handle(ReferenceKind::InvokeStatic, "demo/Boot", "a", "()V");
        for _ in 0..=u16::MAX {
            old.operand(BootstrapSpecifier {
                method_handle_index: handle,
                arguments: smallvec![handle],
            });
        }
        let old = old.build();
        assert_eq!(old.operands().len(), usize::from(u16::MAX) + 1);

        let mut scratch = ConstantPoolBuilder::new(&symbols);
        let handle = scratch.method_handle(ReferenceKind::InvokeStatic, "demo/Boot", "a", "()V");
        let boot = scratch.bootstrap(handle, &[]);
        scratch.invoke_dynamic(boot, "run", "()V");
        let scratch = scratch.build();

        assert!(matches!(
            merge_constant_pools(&old, &scratch),
            Err(RedefineError::ResourceExhaustion(_))
        ));
    }
}
