//! Deciding whether two methods are equivalent modulo constant pool: identical apart from which
//! pool indices their instructions use.

use redefine_base::{
    code::{op::OperandKind, Code},
    ConstantPool, MethodInfo, PoolIndex,
};

use crate::{error::RedefineError, rewrite::decode};

fn same_constant(
    old_pool: &ConstantPool,
    old: PoolIndex,
    new_pool: &ConstantPool,
    new: PoolIndex,
) -> bool {
    if old == 0 || new == 0 {
        return old == new;
    }
    old_pool.compare_entry_to(old, new_pool, new)
}

/// Compare two methods' code.
/// `old_pool` and `new_pool` must be the pools each was written against, with classes
/// unresolved. `old` must not be linked to a cache.
pub fn code_emcp(
    old: &Code,
    old_pool: &ConstantPool,
    new: &Code,
    new_pool: &ConstantPool,
) -> Result<bool, RedefineError> {
    if old.bytecode.len() != new.bytecode.len()
        || old.max_stack != new.max_stack
        || old.max_locals != new.max_locals
        || old.exception_table.len() != new.exception_table.len()
    {
        return Ok(false);
    }

    let old_insts = decode(old)?;
    let new_insts = decode(new)?;
    if old_insts.len() != new_insts.len() {
        return Ok(false);
    }

    for (a, b) in old_insts.iter().zip(&new_insts) {
        if a.opcode != b.opcode || a.wide != b.wide || a.len != b.len {
            return Ok(false);
        }

        let old_bytes = &old.bytecode[a.bci..a.next_bci()];
        let new_bytes = &new.bytecode[b.bci..b.next_bci()];
        let operand = a.opcode.operand();
        if !operand.has_pool_index() {
            if old_bytes != new_bytes {
                return Ok(false);
            }
            continue;
        }

        let (old_index, new_index) =
            match (a.pool_index(&old.bytecode), b.pool_index(&new.bytecode)) {
                (Some(old_index), Some(new_index)) => (old_index, new_index),
                _ => return Ok(false),
            };
        if !same_constant(old_pool, old_index, new_pool, new_index) {
            return Ok(false);
        }

        // Anything after the index, like an interface call's argument count
        let index_width = if operand == OperandKind::ConstantByte { 1 } else { 2 };
        let rest = a.operand_start() - a.bci + index_width;
        if old_bytes.get(rest..) != new_bytes.get(rest..) {
            return Ok(false);
        }
    }

    for (a, b) in old.exception_table.iter().zip(&new.exception_table) {
        if a.start_pc != b.start_pc || a.end_pc != b.end_pc || a.handler_pc != b.handler_pc {
            return Ok(false);
        }
        if !same_constant(old_pool, a.catch_type, new_pool, b.catch_type) {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Compare an old method's unlinked code with its replacement.
/// Methods without code are equivalent to each other.
pub fn methods_emcp(
    old_code: Option<&Code>,
    old_pool: &ConstantPool,
    new: &MethodInfo,
    new_pool: &ConstantPool,
) -> Result<bool, RedefineError> {
    match (old_code, new.code.as_ref()) {
        (None, None) => Ok(true),
        (Some(old_code), Some(new_code)) => code_emcp(old_code, old_pool, new_code, new_pool),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use redefine_base::{
        builder::{ClassBuilder, CodeBuilder},
        code::{op::Opcode, Code, ExceptionHandler},
        ConstantPool, SymbolTable,
    };

    use super::code_emcp;

    fn pools(symbols: &SymbolTable, padding: &[&str]) -> (ConstantPool, u16, u16, u16) {
        let mut class = ClassBuilder::new(symbols, "demo/E", Some("java/lang/Object"));
        for text in padding {
            class.pool().utf8(text);
        }
        let greeting = class.pool().string("hello");
        let call = class.pool().method_ref("demo/E", "run", "(I)V");
        let error = class.pool().class("java/lang/Error");
        let (_, pool) = class.build();
        (pool, greeting, call, error)
    }

    fn code(greeting: u16, call: u16, error: u16) -> Code {
        let mut code = CodeBuilder::new();
        code.ldc_w(greeting).pop().iconst(1).invokestatic(call).ret();
        let mut code = code.build(1, 0);
        code.exception_table.push(ExceptionHandler {
            start_pc: 0,
            end_pc: 8,
            handler_pc: 8,
            catch_type: error,
        });
        code
    }

    #[test]
    fn test_equivalent_modulo_pool() {
        let symbols = SymbolTable::new();
        let (old_pool, g1, c1, e1) = pools(&symbols, &[]);
        let (new_pool, g2, c2, e2) = pools(&symbols, &["a", "b", "c"]);
        assert_ne!(g1, g2);

        let old = code(g1, c1, e1);
        let new = code(g2, c2, e2);
        assert!(code_emcp(&old, &old_pool, &new, &new_pool).unwrap());
        assert!(code_emcp(&old, &old_pool, &old, &old_pool).unwrap());
    }

    #[test]
    fn test_differences() {
        let symbols = SymbolTable::new();
        let (pool, greeting, call, error) = pools(&symbols, &[]);
        let old = code(greeting, call, error);

        // Loading a different constant
        let other = code(call, call, error);
        assert!(!code_emcp(&old, &pool, &other, &pool).unwrap());

        // A different immediate
        let mut changed = old.clone();
        changed.bytecode[4] = Opcode::Iconst2.raw();
        assert!(!code_emcp(&old, &pool, &changed, &pool).unwrap());

        let mut deeper = old.clone();
        deeper.max_stack += 1;
        assert!(!code_emcp(&old, &pool, &deeper, &pool).unwrap());

        let mut catch_all = old.clone();
        catch_all.exception_table[0].catch_type = 0;
        assert!(!code_emcp(&old, &pool, &catch_all, &pool).unwrap());
    }
}
