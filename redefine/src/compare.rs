//! Checks that a replacement class keeps the shape of the class it replaces, and pairs up their
//! methods.

use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};
use redefine_base::{
    ClassAccessFlags, ClassData, ConstantPool, MethodAccessFlags, PoolIndex, Symbol,
};

use crate::{
    config::MethodChangePolicy,
    error::{MethodChange, RedefineError, SchemaChange},
    method::Method,
};

/// Class flags which don't take part in the comparison
const IGNORED_CLASS_FLAGS: ClassAccessFlags = ClassAccessFlags::SUPER;

fn class_names<'a>(
    pool: &'a ConstantPool,
    indices: &[PoolIndex],
) -> Result<Vec<&'a Symbol>, RedefineError> {
    indices
        .iter()
        .map(|&index| pool.class_name_at(index).map_err(RedefineError::from))
        .collect()
}

fn lossy(names: &[&Symbol]) -> String {
    names.iter().map(|name| name.as_lossy_str()).join(", ")
}

/// Compare the parts of a class which a redefinition may not change.
/// Class names are compared by name alone, since the classes they name may be mid-redefinition
/// themselves.
pub fn check_compatibility(
    old: &ClassData,
    old_pool: &ConstantPool,
    new: &ClassData,
    new_pool: &ConstantPool,
) -> Result<(), RedefineError> {
    let old_name = old.name(old_pool)?;
    let new_name = new.name(new_pool)?;
    if old_name != new_name {
        return Err(SchemaChange::Hierarchy(format!(
            "class name changed from {} to {}",
            old_name, new_name
        ))
        .into());
    }

    let old_super = old.super_name(old_pool)?;
    let new_super = new.super_name(new_pool)?;
    if old_super != new_super {
        return Err(SchemaChange::Hierarchy(format!(
            "super class changed from {:?} to {:?}",
            old_super, new_super
        ))
        .into());
    }

    let old_interfaces = class_names(old_pool, &old.interfaces)?;
    let new_interfaces = class_names(new_pool, &new.interfaces)?;
    if old_interfaces != new_interfaces {
        return Err(SchemaChange::Hierarchy(format!(
            "interfaces changed from [{}] to [{}]",
            lossy(&old_interfaces),
            lossy(&new_interfaces)
        ))
        .into());
    }

    let old_flags = old.access_flags - IGNORED_CLASS_FLAGS;
    let new_flags = new.access_flags - IGNORED_CLASS_FLAGS;
    if old_flags != new_flags {
        return Err(SchemaChange::Modifiers {
            old: old_flags,
            new: new_flags,
        }
        .into());
    }

    check_fields(old, old_pool, new, new_pool)?;
    check_attributes(old, old_pool, new, new_pool)
}

fn check_fields(
    old: &ClassData,
    old_pool: &ConstantPool,
    new: &ClassData,
    new_pool: &ConstantPool,
) -> Result<(), RedefineError> {
    if old.fields.len() != new.fields.len() {
        return Err(SchemaChange::Fields(format!(
            "field count changed from {} to {}",
            old.fields.len(),
            new.fields.len()
        ))
        .into());
    }

    // Field positions are their layout, so they are compared in order
    for (position, (old_field, new_field)) in old.fields.iter().zip(&new.fields).enumerate() {
        let old_name = old_pool.utf8_at(old_field.name_index)?;
        let new_name = new_pool.utf8_at(new_field.name_index)?;
        if old_name != new_name {
            return Err(SchemaChange::Fields(format!(
                "field {} was {} and is now {}",
                position, old_name, new_name
            ))
            .into());
        }

        let old_desc = old_pool.utf8_at(old_field.descriptor_index)?;
        let new_desc = new_pool.utf8_at(new_field.descriptor_index)?;
        if old_desc != new_desc {
            return Err(SchemaChange::Fields(format!(
                "type of field {} changed from {} to {}",
                old_name, old_desc, new_desc
            ))
            .into());
        }

        if old_field.access_flags != new_field.access_flags {
            return Err(SchemaChange::Fields(format!(
                "modifiers of field {} changed from {:?} to {:?}",
                old_name, old_field.access_flags, new_field.access_flags
            ))
            .into());
        }
    }

    Ok(())
}

/// Compare as sets of class names
fn same_class_set(
    old_pool: &ConstantPool,
    old: Option<&Vec<PoolIndex>>,
    new_pool: &ConstantPool,
    new: Option<&Vec<PoolIndex>>,
) -> Result<bool, RedefineError> {
    let mut old = class_names(old_pool, old.map_or(&[][..], Vec::as_slice))?;
    let mut new = class_names(new_pool, new.map_or(&[][..], Vec::as_slice))?;
    old.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
    new.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
    Ok(old == new)
}

fn check_attributes(
    old: &ClassData,
    old_pool: &ConstantPool,
    new: &ClassData,
    new_pool: &ConstantPool,
) -> Result<(), RedefineError> {
    let old_attrs = &old.attributes;
    let new_attrs = &new.attributes;

    let old_host = old_attrs
        .nest_host
        .map(|index| old_pool.class_name_at(index))
        .transpose()?;
    let new_host = new_attrs
        .nest_host
        .map(|index| new_pool.class_name_at(index))
        .transpose()?;
    if old_host != new_host {
        return Err(SchemaChange::Attribute { name: "NestHost" }.into());
    }

    if !same_class_set(
        old_pool,
        old_attrs.nest_members.as_ref(),
        new_pool,
        new_attrs.nest_members.as_ref(),
    )? {
        return Err(SchemaChange::Attribute {
            name: "NestMembers",
        }
        .into());
    }

    if !same_class_set(
        old_pool,
        old_attrs.permitted_subclasses.as_ref(),
        new_pool,
        new_attrs.permitted_subclasses.as_ref(),
    )? {
        return Err(SchemaChange::Attribute {
            name: "PermittedSubclasses",
        }
        .into());
    }

    // Record components are compared in order, but their annotations and signatures may change
    let same_record = match (&old_attrs.record, &new_attrs.record) {
        (None, None) => true,
        (Some(old_record), Some(new_record)) if old_record.len() == new_record.len() => {
            let mut same = true;
            for (a, b) in old_record.iter().zip(new_record) {
                same &= old_pool.utf8_at(a.name_index)? == new_pool.utf8_at(b.name_index)?
                    && old_pool.utf8_at(a.descriptor_index)?
                        == new_pool.utf8_at(b.descriptor_index)?;
            }
            same
        }
        _ => false,
    };
    if !same_record {
        return Err(SchemaChange::Attribute { name: "Record" }.into());
    }

    Ok(())
}

/// How the methods of the old and new versions correspond
#[derive(Debug, Default)]
pub struct MethodMatches {
    /// An old method and the class file position of its replacement
    pub matched: Vec<(Arc<Method>, usize)>,
    /// Class file positions of methods only in the new version
    pub added: Vec<usize>,
    /// Methods only in the old version
    pub deleted: Vec<Arc<Method>>,
}

/// Pair the methods of the installed version, which are sorted by name and descriptor, with
/// those of its replacement.
pub fn reconcile_methods(
    old: &[Arc<Method>],
    new: &ClassData,
    new_pool: &ConstantPool,
    policy: MethodChangePolicy,
) -> Result<MethodMatches, RedefineError> {
    let mut new_sorted = Vec::with_capacity(new.methods.len());
    for (position, method) in new.methods.iter().enumerate() {
        let name = method.name(new_pool)?;
        let descriptor = method.descriptor(new_pool)?;
        new_sorted.push((name.as_bytes(), descriptor.as_bytes(), position));
    }
    new_sorted.sort_unstable();

    let mut matches = MethodMatches::default();
    let pairs = old.iter().merge_join_by(new_sorted, |old, (name, descriptor, _)| {
        (old.name().as_bytes(), old.descriptor().as_bytes()).cmp(&(*name, *descriptor))
    });
    for pair in pairs {
        match pair {
            EitherOrBoth::Both(old_method, (_, _, position)) => {
                let old_flags = old_method.access_flags();
                let new_flags = new.methods[position].access_flags;
                // Binding a method to native code or back is allowed
                if !((old_flags ^ new_flags) - MethodAccessFlags::NATIVE).is_empty() {
                    tracing::info!(
                        "Modifiers of {} changed from {:?} to {:?}",
                        old_method.display_name(),
                        old_flags,
                        new_flags
                    );
                    return Err(MethodChange::ModifiersChanged {
                        name: old_method.name().to_string(),
                        descriptor: old_method.descriptor().to_string(),
                    }
                    .into());
                }
                tracing::trace!("Matched {}", old_method.display_name());
                matches.matched.push((Arc::clone(old_method), position));
            }
            EitherOrBoth::Left(old_method) => {
                if !policy.allows(old_method.access_flags()) {
                    return Err(MethodChange::Deleted {
                        name: old_method.name().to_string(),
                        descriptor: old_method.descriptor().to_string(),
                    }
                    .into());
                }
                tracing::trace!("Deleted {}", old_method.display_name());
                matches.deleted.push(Arc::clone(old_method));
            }
            EitherOrBoth::Right((name, descriptor, position)) => {
                if !policy.allows(new.methods[position].access_flags) {
                    return Err(MethodChange::Added {
                        name: String::from_utf8_lossy(name).into_owned(),
                        descriptor: String::from_utf8_lossy(descriptor).into_owned(),
                    }
                    .into());
                }
                tracing::trace!(
                    "Added {}{}",
                    String::from_utf8_lossy(name),
                    String::from_utf8_lossy(descriptor)
                );
                matches.added.push(position);
            }
        }
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use redefine_base::{
        builder::ClassBuilder, id::MethodKey, ClassAccessFlags, ClassData, ClassId, ConstantPool,
        FieldAccessFlags, MethodAccessFlags, MethodIdnum, MethodInfo, SymbolTable,
    };

    use super::{check_compatibility, reconcile_methods};
    use crate::{
        config::MethodChangePolicy,
        cpcache::CallSiteCache,
        error::{MethodChange, RedefineError, SchemaChange},
        method::Method,
    };

    fn class(
        symbols: &SymbolTable,
        configure: impl FnOnce(&mut ClassBuilder),
    ) -> (ClassData, ConstantPool) {
        let mut builder = ClassBuilder::new(symbols, "demo/C", Some("java/lang/Object"));
        configure(&mut builder);
        builder.build()
    }

    #[test]
    fn test_compatible_changes() {
        let symbols = SymbolTable::new();
        let (old, old_pool) = class(&symbols, |c| {
            c.field(FieldAccessFlags::PRIVATE, "x", "I");
        });
        // Different pool layout, and the ignored super flag
        let (new, new_pool) = class(&symbols, |c| {
            c.pool().utf8("padding");
            c.access(ClassAccessFlags::PUBLIC);
            c.field(FieldAccessFlags::PRIVATE, "x", "I");
        });
        let mut old = old;
        old.access_flags = ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER;
        check_compatibility(&old, &old_pool, &new, &new_pool).unwrap();
    }

    #[test]
    fn test_incompatible_changes() {
        let symbols = SymbolTable::new();
        let (old, old_pool) = class(&symbols, |c| {
            c.field(FieldAccessFlags::PRIVATE, "x", "I");
        });

        let (renamed, pool) = class(&symbols, |c| {
            c.field(FieldAccessFlags::PRIVATE, "y", "I");
        });
        assert!(matches!(
            check_compatibility(&old, &old_pool, &renamed, &pool),
            Err(RedefineError::IncompatibleSchema(SchemaChange::Fields(_)))
        ));

        let (interface, pool) = class(&symbols, |c| {
            c.interface("demo/I");
            c.field(FieldAccessFlags::PRIVATE, "x", "I");
        });
        assert!(matches!(
            check_compatibility(&old, &old_pool, &interface, &pool),
            Err(RedefineError::IncompatibleSchema(SchemaChange::Hierarchy(_)))
        ));

        let (abstracted, pool) = class(&symbols, |c| {
            c.access(ClassAccessFlags::PUBLIC | ClassAccessFlags::ABSTRACT);
            c.field(FieldAccessFlags::PRIVATE, "x", "I");
        });
        let mut public_old = old.clone();
        public_old.access_flags = ClassAccessFlags::PUBLIC;
        assert!(matches!(
            check_compatibility(&public_old, &old_pool, &abstracted, &pool),
            Err(RedefineError::IncompatibleSchema(SchemaChange::Modifiers { .. }))
        ));
    }

    #[test]
    fn test_nest_members_compare_as_sets() {
        let symbols = SymbolTable::new();
        let nest = |names: &'static [&'static str]| {
            class(&symbols, move |c| {
                let members = names.iter().map(|name| c.pool().class(name)).collect();
                c.attributes_mut().nest_members = Some(members);
            })
        };
        let (old, old_pool) = nest(&["demo/C$A", "demo/C$B"]);
        let (reordered, pool) = nest(&["demo/C$B", "demo/C$A"]);
        check_compatibility(&old, &old_pool, &reordered, &pool).unwrap();

        let (fewer, pool) = nest(&["demo/C$A"]);
        assert_eq!(
            check_compatibility(&old, &old_pool, &fewer, &pool),
            Err(SchemaChange::Attribute {
                name: "NestMembers"
            }
            .into())
        );
    }

    fn installed(
        symbols: &SymbolTable,
        methods: &[(MethodAccessFlags, &str, &str)],
    ) -> Vec<Arc<Method>> {
        let pool = Arc::new(ConstantPool::empty());
        let cache = Arc::new(CallSiteCache::empty());
        let mut installed: Vec<_> = methods
            .iter()
            .enumerate()
            .map(|(i, &(flags, name, descriptor))| {
                Arc::new(Method::new(
                    MethodKey::new_unchecked(i as u32),
                    ClassId::new_unchecked(1),
                    MethodInfo::new(flags, 0, 0, None),
                    Arc::clone(&pool),
                    Arc::clone(&cache),
                    MethodIdnum::new(i as u16),
                    symbols.intern_str(name),
                    symbols.intern_str(descriptor),
                ))
            })
            .collect();
        installed.sort_by(|a, b| {
            (a.name().as_bytes(), a.descriptor().as_bytes())
                .cmp(&(b.name().as_bytes(), b.descriptor().as_bytes()))
        });
        installed
    }

    #[test]
    fn test_reconcile_overloads() {
        let symbols = SymbolTable::new();
        let public = MethodAccessFlags::PUBLIC;
        let helper = MethodAccessFlags::PRIVATE | MethodAccessFlags::STATIC;
        let old = installed(
            &symbols,
            &[
                (public, "run", "(I)V"),
                (public, "run", "()V"),
                (helper, "gone", "()V"),
            ],
        );
        let (new, pool) = class(&symbols, |c| {
            c.method(public, "run", "()V", None);
            c.method(helper, "added", "()V", None);
            c.method(public, "run", "(I)V", None);
        });

        let matches =
            reconcile_methods(&old, &new, &pool, MethodChangePolicy::PrivateStaticOrFinal).unwrap();
        let matched: Vec<_> = matches
            .matched
            .iter()
            .map(|(old, position)| (old.descriptor().to_string(), *position))
            .collect();
        assert_eq!(matched, [("()V".to_owned(), 0), ("(I)V".to_owned(), 2)]);
        assert_eq!(matches.added, [1]);
        assert_eq!(matches.deleted.len(), 1);
        assert_eq!(matches.deleted[0].name().as_bytes(), b"gone");
    }

    #[test]
    fn test_reconcile_rejects() {
        let symbols = SymbolTable::new();
        let public = MethodAccessFlags::PUBLIC;
        let old = installed(&symbols, &[(public, "run", "()V")]);

        let (deleted, pool) = class(&symbols, |_| {});
        assert!(matches!(
            reconcile_methods(&old, &deleted, &pool, MethodChangePolicy::Private),
            Err(RedefineError::UnsupportedMethodChange(MethodChange::Deleted { .. }))
        ));

        let (synchronized, pool) = class(&symbols, |c| {
            c.method(public | MethodAccessFlags::SYNCHRONIZED, "run", "()V", None);
        });
        assert!(matches!(
            reconcile_methods(&old, &synchronized, &pool, MethodChangePolicy::Private),
            Err(RedefineError::UnsupportedMethodChange(
                MethodChange::ModifiersChanged { .. }
            ))
        ));

        let (native, pool) = class(&symbols, |c| {
            c.method(public | MethodAccessFlags::NATIVE, "run", "()V", None);
        });
        reconcile_methods(&old, &native, &pool, MethodChangePolicy::Disallow).unwrap();

        let (added, pool) = class(&symbols, |c| {
            c.method(public, "run", "()V", None);
            c.method(MethodAccessFlags::PRIVATE, "extra", "()V", None);
        });
        assert!(matches!(
            reconcile_methods(&old, &added, &pool, MethodChangePolicy::PrivateStaticOrFinal),
            Err(RedefineError::UnsupportedMethodChange(MethodChange::Added { .. }))
        ));
        reconcile_methods(&old, &added, &pool, MethodChangePolicy::Private).unwrap();
    }
}
