//! Linking: replacing the pool indices of field, invoke and `invokedynamic` instructions with
//! native-order indices into a [`CallSiteCache`], and undoing that.

use byteorder::{BigEndian, ByteOrder, NativeEndian};
use indexmap::IndexMap;
use redefine_base::{
    code::{op::OperandKind, stream::Instruction, Code},
    constant_pool::ConstantTag,
    ConstantPool, MethodInfo, PoolIndex,
};
use usize_cast::IntoUsize;

use super::decode;
use crate::{
    config::{RedefineConfig, MAX_CACHE_INDEX_BITS},
    cpcache::{CacheKind, CallSiteCache},
    error::{MethodChange, RedefineError},
};

fn cache_kind(pool: &ConstantPool, inst: &Instruction, cp_index: PoolIndex) -> Result<CacheKind, RedefineError> {
    match pool.tag_at(cp_index) {
        Some(ConstantTag::FieldRef) => Ok(CacheKind::Field),
        Some(ConstantTag::MethodRef) => Ok(CacheKind::Method),
        Some(ConstantTag::InterfaceMethodRef) => Ok(CacheKind::InterfaceMethod),
        Some(ConstantTag::InvokeDynamic) => Ok(CacheKind::Dynamic),
        tag => Err(RedefineError::InternalInvariantViolation(format!(
            "{} at {} refers to #{} which is {:?}",
            inst.opcode, inst.bci, cp_index, tag
        ))),
    }
}

/// Build the call site cache for a class's methods and link their code to it.
/// Each distinct field or method reference gets one shared entry, and each `invokedynamic`
/// instruction gets its own.
pub fn link_methods(
    methods: &mut [MethodInfo],
    pool: &ConstantPool,
    conf: &RedefineConfig,
) -> Result<CallSiteCache, RedefineError> {
    let mut ordinary: IndexMap<PoolIndex, CacheKind> = IndexMap::new();
    let mut dynamic: Vec<PoolIndex> = Vec::new();

    let mut decoded = Vec::with_capacity(methods.len());
    for method in methods.iter() {
        let insts = match &method.code {
            Some(code) => decode(code)?,
            None => Vec::new(),
        };

        for inst in &insts {
            if !inst.opcode.operand().is_cache_indexed() {
                continue;
            }
            let code = method.code.as_ref().map_or(&[][..], |code| &code.bytecode[..]);
            let cp_index = inst.pool_index(code).unwrap_or(0);
            let kind = cache_kind(pool, inst, cp_index)?;
            if kind == CacheKind::Dynamic {
                dynamic.push(cp_index);
            } else {
                ordinary.entry(cp_index).or_insert(kind);
            }
        }
        decoded.push(insts);
    }

    let needed = ordinary.len() + dynamic.len();
    if needed > conf.cache_capacity() {
        return Err(MethodChange::CacheIndexOverflow {
            needed,
            bits: conf.cache_index_bits.clamp(1, MAX_CACHE_INDEX_BITS),
        }
        .into());
    }

    let mut next_dynamic = ordinary.len();
    for (method, insts) in methods.iter_mut().zip(decoded) {
        let code = match &mut method.code {
            Some(code) => code,
            None => continue,
        };

        for inst in insts {
            let kind = inst.opcode.operand();
            if !kind.is_cache_indexed() {
                continue;
            }

            let at = inst.operand_start();
            if kind == OperandKind::Dynamic {
                let index = next_dynamic as u32;
                next_dynamic += 1;
                NativeEndian::write_u32(&mut code.bytecode[at..at + 4], index);
            } else {
                let cp_index = inst.pool_index(&code.bytecode).unwrap_or(0);
                let index = ordinary.get_index_of(&cp_index).ok_or_else(|| {
                    RedefineError::InternalInvariantViolation(format!(
                        "#{} was not given a cache entry",
                        cp_index
                    ))
                })? as u16;
                NativeEndian::write_u16(&mut code.bytecode[at..at + 2], index);
            }
        }
    }

    let ordinary: Vec<_> = ordinary.into_iter().collect();
    tracing::trace!(
        "Linked to a cache of {} shared and {} dynamic entries",
        ordinary.len(),
        dynamic.len()
    );
    Ok(CallSiteCache::new(&ordinary, &dynamic))
}

/// A copy of linked code with its pool indices restored
pub fn unlink_code(code: &Code, cache: &CallSiteCache) -> Result<Code, RedefineError> {
    let mut unlinked = code.clone();
    for inst in decode(code)? {
        let kind = inst.opcode.operand();
        if !kind.is_cache_indexed() {
            continue;
        }

        let at = inst.operand_start();
        let bytecode = &mut unlinked.bytecode;
        let index = if kind == OperandKind::Dynamic {
            NativeEndian::read_u32(&bytecode[at..at + 4]).into_usize()
        } else {
            usize::from(NativeEndian::read_u16(&bytecode[at..at + 2]))
        };

        let entry = cache.entry(index).ok_or_else(|| {
            RedefineError::InternalInvariantViolation(format!(
                "{} at {} uses missing cache entry {}",
                inst.opcode, inst.bci, index
            ))
        })?;
        BigEndian::write_u16(&mut bytecode[at..at + 2], entry.cp_index());
        if kind == OperandKind::Dynamic {
            bytecode[at + 2] = 0;
            bytecode[at + 3] = 0;
        }
    }
    Ok(unlinked)
}

#[cfg(test)]
mod tests {
    use redefine_base::{
        builder::{ClassBuilder, CodeBuilder},
        constant_pool::ReferenceKind,
        MethodAccessFlags, SymbolTable,
    };

    use super::{link_methods, unlink_code};
    use crate::{
        config::RedefineConfig,
        cpcache::CacheKind,
        error::{MethodChange, RedefineError},
    };

    #[test]
    fn test_link_shares_ordinary_entries() {
        let symbols = SymbolTable::new();
        let mut class = ClassBuilder::new(&symbols, "demo/L", Some("java/lang/Object"));
        let run = class.pool().method_ref("demo/L", "run", "()V");
        let count = class.pool().field_ref("demo/L", "count", "I");
        let handle =
            class
                .pool()
                .method_handle(ReferenceKind::InvokeStatic, "demo/Boot", "bsm", "()V");
        let boot = class.pool().bootstrap(handle, &[]);
        let indy = class.pool().invoke_dynamic(boot, "make", "()Ljava/lang/Object;");

        let mut first = CodeBuilder::new();
        first
            .invokestatic(run)
            .getstatic(count)
            .pop()
            .invokedynamic(indy)
            .pop()
            .ret();
        let mut second = CodeBuilder::new();
        second.invokestatic(run).invokedynamic(indy).pop().ret();

        let flags = MethodAccessFlags::STATIC;
        class.method(flags, "a", "()V", Some(first.build(1, 0)));
        class.method(flags, "b", "()V", Some(second.build(1, 0)));
        let (mut class, pool) = class.build();
        let original = class.clone();

        let cache = link_methods(&mut class.methods, &pool, &RedefineConfig::new()).unwrap();
        assert_eq!(cache.ordinary_len(), 2);
        assert_eq!(cache.dynamic_len(), 2);
        assert_eq!(cache.entry(0).unwrap().cp_index(), run);
        assert_eq!(cache.entry(0).unwrap().kind(), CacheKind::Method);
        assert_eq!(cache.entry(1).unwrap().kind(), CacheKind::Field);
        assert_eq!(cache.entry(2).unwrap().cp_index(), indy);

        let code = class.methods[1].code.as_ref().unwrap();
        assert_eq!(&code.bytecode[1..3], &0u16.to_ne_bytes());
        assert_eq!(&code.bytecode[4..8], &3u32.to_ne_bytes());

        for (linked, original) in class.methods.iter().zip(&original.methods) {
            let unlinked = unlink_code(linked.code.as_ref().unwrap(), &cache).unwrap();
            assert_eq!(Some(&unlinked), original.code.as_ref());
        }
    }

    #[test]
    fn test_cache_index_overflow() {
        let symbols = SymbolTable::new();
        let mut class = ClassBuilder::new(&symbols, "demo/O", Some("java/lang/Object"));
        let mut code = CodeBuilder::new();
        for name in ["a", "b", "c"] {
            let method = class.pool().method_ref("demo/O", name, "()V");
            code.invokestatic(method);
        }
        code.ret();
        class.method(MethodAccessFlags::STATIC, "all", "()V", Some(code.build(0, 0)));
        let (mut class, pool) = class.build();

        let mut conf = RedefineConfig::new();
        conf.cache_index_bits = 1;
        let err = link_methods(&mut class.methods, &pool, &conf).unwrap_err();
        assert_eq!(
            err,
            RedefineError::UnsupportedMethodChange(MethodChange::CacheIndexOverflow {
                needed: 3,
                bits: 1
            })
        );
    }
}
