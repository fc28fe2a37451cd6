#![warn(clippy::pedantic)]
// Clippy just isn't smart enough.
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

//! A structural bytecode verifier.
//!
//! This checks everything that can be checked without loading other classes: that every
//! instruction decodes, that operands refer to pool entries of the right kind, that branches and
//! exception handlers land on instruction boundaries, that locals stay within `max_locals`, and
//! that the operand stack depth is consistent and within `max_stack` along every path.
//! It does not type-check values; that needs the class hierarchy.

use redefine_base::{
    class::{ClassData, ClassFileVersion},
    code::{
        op::{Opcode, OperandKind},
        stack_map::VerificationType,
        stream::Instruction,
        Code,
    },
    constant_pool::{ConstantEntry, ConstantPool, ConstantTag, PoolIndex},
    descriptor::MethodDescriptor,
    verify::{MethodVerifyError, VerifyError, VerifyTarget, Verifier},
    MethodAccessFlags, MethodInfo,
};

use crate::effect::{local_access, stack_effect};

mod effect;

/// The default [`Verifier`]
#[derive(Debug, Clone, Copy)]
pub struct StructuralVerifier {
    /// Whether to run the stack depth dataflow, which is the costly part
    pub check_stack_depth: bool,
}
impl Default for StructuralVerifier {
    fn default() -> Self {
        StructuralVerifier {
            check_stack_depth: true,
        }
    }
}
impl Verifier for StructuralVerifier {
    fn verify(&self, target: &VerifyTarget<'_>) -> Result<(), VerifyError> {
        let pool = target.pool;
        pool.validate()?;

        for (index, entry) in pool.iter() {
            if matches!(entry, ConstantEntry::Class { .. }) && pool.is_resolved_class(index) {
                return Err(VerifyError::PreResolvedClass { index });
            }
        }

        tracing::trace!(
            "Verifying {} as {}",
            target
                .class
                .name(pool)
                .map_or_else(|_| String::from("?"), ToString::to_string),
            target
                .class_name()
                .map_or_else(|_| String::from("?"), ToString::to_string),
        );

        for method in &target.class.methods {
            let name = method.name(pool)?;
            let descriptor = method.descriptor(pool)?;
            self.verify_method(target, method, descriptor.as_bytes())
                .map_err(|error| VerifyError::Method {
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    error,
                })?;
        }

        Ok(())
    }
}
impl StructuralVerifier {
    fn verify_method(
        &self,
        target: &VerifyTarget<'_>,
        method: &MethodInfo,
        descriptor: &[u8],
    ) -> Result<(), MethodVerifyError> {
        let descriptor = MethodDescriptor::parse(descriptor)?;

        let bodiless = method
            .access_flags
            .intersects(MethodAccessFlags::ABSTRACT | MethodAccessFlags::NATIVE);
        let code = match (&method.code, bodiless) {
            (Some(code), false) => code,
            (None, true) => return Ok(()),
            (_, bodiless) => return Err(MethodVerifyError::CodePresence { expected: !bodiless }),
        };

        let needed = descriptor.parameter_slots() + u16::from(!method.is_static());
        if needed > code.max_locals {
            return Err(MethodVerifyError::TooFewLocals {
                needed,
                max_locals: code.max_locals,
            });
        }

        let instructions = code.decode()?;
        let starts = code.instruction_starts()?;
        let is_start = |target: isize| {
            usize::try_from(target)
                .ok()
                .and_then(|target| starts.get(target).copied())
                .unwrap_or(false)
        };

        let mut has_branches = false;
        for inst in &instructions {
            check_operand(target, code, inst)?;
            check_local(code, inst)?;

            if inst.opcode.operand().is_branch() {
                has_branches = true;
                for branch_target in inst.branch_targets(&code.bytecode)? {
                    if !is_start(branch_target) {
                        return Err(MethodVerifyError::BadBranchTarget {
                            bci: inst.bci,
                            target: branch_target,
                        });
                    }
                }
            }
        }

        match instructions.last() {
            Some(last) if !last.opcode.falls_through() => {}
            _ => return Err(MethodVerifyError::FallsOffEnd),
        }

        let len = code.bytecode.len();
        for (index, handler) in code.exception_table.iter().enumerate() {
            let start = usize::from(handler.start_pc);
            let end = usize::from(handler.end_pc);
            let valid = start < end
                && is_start(start as isize)
                && (end == len || is_start(end as isize))
                && is_start(handler.handler_pc as isize)
                && (handler.catch_type == 0
                    || target.pool.tag_at(handler.catch_type) == Some(ConstantTag::Class));
            if !valid {
                return Err(MethodVerifyError::BadExceptionHandler { index });
            }
        }

        self.check_stack_map(target, code, &instructions, &starts)?;
        if code.stack_map.is_none()
            && target.class.version.major >= ClassFileVersion::STACK_MAP_REQUIRED
            && (has_branches || !code.exception_table.is_empty())
        {
            return Err(MethodVerifyError::MissingStackMap);
        }

        if self.check_stack_depth {
            check_stack_depth(target.pool, code, &instructions)?;
        }

        Ok(())
    }

    fn check_stack_map(
        &self,
        target: &VerifyTarget<'_>,
        code: &Code,
        instructions: &[Instruction],
        starts: &[bool],
    ) -> Result<(), MethodVerifyError> {
        let table = match &code.stack_map {
            Some(table) => table,
            None => return Ok(()),
        };

        for offset in table.frame_offsets() {
            if !starts.get(offset).copied().unwrap_or(false) {
                return Err(MethodVerifyError::StackMapFrameNotAtInstruction { offset });
            }
        }

        // Only the types are inspected, but they are only reachable mutably
        let mut table = table.clone();
        for ty in table.types_mut() {
            match *ty {
                VerificationType::Object(index) => {
                    if target.pool.tag_at(index) != Some(ConstantTag::Class) {
                        return Err(MethodVerifyError::BadOperandTag {
                            bci: 0,
                            index,
                            expected: "Class",
                        });
                    }
                }
                VerificationType::Uninitialized(offset) => {
                    let offset = usize::from(offset);
                    let is_new = instructions
                        .iter()
                        .any(|inst| inst.bci == offset && inst.opcode == Opcode::New);
                    if !is_new {
                        return Err(MethodVerifyError::BadOperand { bci: offset });
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn expect_tag(
    pool: &ConstantPool,
    bci: usize,
    index: PoolIndex,
    expected: &'static str,
    accept: impl Fn(ConstantTag) -> bool,
) -> Result<(), MethodVerifyError> {
    match pool.tag_at(index) {
        Some(tag) if accept(tag) => Ok(()),
        _ => Err(MethodVerifyError::BadOperandTag {
            bci,
            index,
            expected,
        }),
    }
}

fn check_operand(
    target: &VerifyTarget<'_>,
    code: &Code,
    inst: &Instruction,
) -> Result<(), MethodVerifyError> {
    let pool = target.pool;
    let bytes = &code.bytecode;
    let bci = inst.bci;
    let kind = inst.opcode.operand();
    let index = match inst.pool_index(bytes) {
        Some(index) => index,
        None if kind.has_pool_index() => return Err(MethodVerifyError::BadOperand { bci }),
        None => return Ok(()),
    };
    let at = inst.operand_start();

    match kind {
        OperandKind::ConstantByte | OperandKind::Constant => {
            expect_tag(pool, bci, index, "loadable constant", |tag| {
                tag.is_loadable() && !matches!(tag, ConstantTag::Long | ConstantTag::Double)
            })
        }
        OperandKind::WideConstant => expect_tag(pool, bci, index, "Long or Double", |tag| {
            matches!(tag, ConstantTag::Long | ConstantTag::Double)
        }),
        OperandKind::Class => expect_tag(pool, bci, index, "Class", |tag| tag == ConstantTag::Class),
        OperandKind::MultiANewArray => {
            expect_tag(pool, bci, index, "Class", |tag| tag == ConstantTag::Class)?;
            match bytes.get(at + 2) {
                Some(dimensions) if *dimensions > 0 => Ok(()),
                _ => Err(MethodVerifyError::BadOperand { bci }),
            }
        }
        OperandKind::Field => {
            expect_tag(pool, bci, index, "Fieldref", |tag| tag == ConstantTag::FieldRef)
        }
        OperandKind::Method => {
            let allow_interface = matches!(inst.opcode, Opcode::InvokeSpecial | Opcode::InvokeStatic);
            expect_tag(pool, bci, index, "Methodref", |tag| {
                tag == ConstantTag::MethodRef
                    || (allow_interface && tag == ConstantTag::InterfaceMethodRef)
            })?;
            if inst.opcode == Opcode::InvokeSpecial {
                check_invoke_special(target, bci, index)?;
            }
            Ok(())
        }
        OperandKind::InterfaceMethod => {
            expect_tag(pool, bci, index, "InterfaceMethodref", |tag| {
                tag == ConstantTag::InterfaceMethodRef
            })?;
            match (bytes.get(at + 2), bytes.get(at + 3)) {
                (Some(count), Some(0)) if *count > 0 => Ok(()),
                _ => Err(MethodVerifyError::BadOperand { bci }),
            }
        }
        OperandKind::Dynamic => {
            expect_tag(pool, bci, index, "InvokeDynamic", |tag| {
                tag == ConstantTag::InvokeDynamic
            })?;
            match (bytes.get(at + 2), bytes.get(at + 3)) {
                (Some(0), Some(0)) => Ok(()),
                _ => Err(MethodVerifyError::BadOperand { bci }),
            }
        }
        _ => Ok(()),
    }
}

/// `invokespecial` of anything but a constructor must name this class, its superclass, or one of
/// its direct interfaces
fn check_invoke_special(
    target: &VerifyTarget<'_>,
    bci: usize,
    index: PoolIndex,
) -> Result<(), MethodVerifyError> {
    let pool = target.pool;
    let bad = || MethodVerifyError::BadOperand { bci };
    let member = pool.member_ref_at(index).map_err(|_| bad())?;
    if member.name.as_bytes() == b"<init>" {
        return Ok(());
    }

    let class_index = pool
        .get(index)
        .ok()
        .and_then(ConstantEntry::as_member_ref)
        .map(|member| member.class_index)
        .ok_or_else(bad)?;
    if target.is_own_class(class_index) {
        return Ok(());
    }

    let class: &ClassData = target.class;
    let allowed = class
        .super_class
        .iter()
        .chain(class.interfaces.iter())
        .filter_map(|&index| pool.class_name_at(index).ok())
        .any(|name| name == member.class_name);
    if allowed {
        Ok(())
    } else {
        Err(bad())
    }
}

fn check_local(code: &Code, inst: &Instruction) -> Result<(), MethodVerifyError> {
    let access = match local_access(inst, &code.bytecode) {
        Some(access) => access,
        None => return Ok(()),
    };
    if u32::from(access.index) + u32::from(access.width) > u32::from(code.max_locals) {
        return Err(MethodVerifyError::BadLocal {
            bci: inst.bci,
            index: access.index,
            max_locals: code.max_locals,
        });
    }
    Ok(())
}

/// Walk every path through the method, tracking only how deep the operand stack is
fn check_stack_depth(
    pool: &ConstantPool,
    code: &Code,
    instructions: &[Instruction],
) -> Result<(), MethodVerifyError> {
    let len = code.bytecode.len();
    // Position of the instruction starting at each bci
    let mut position = vec![usize::MAX; len];
    for (i, inst) in instructions.iter().enumerate() {
        position[inst.bci] = i;
    }

    let mut depths: Vec<Option<u16>> = vec![None; instructions.len()];
    let mut work = Vec::new();

    let reach = |depths: &mut Vec<Option<u16>>,
                     work: &mut Vec<usize>,
                     bci: usize,
                     depth: u16|
     -> Result<(), MethodVerifyError> {
        let at = position[bci];
        match depths[at] {
            Some(existing) if existing != depth => Err(MethodVerifyError::InconsistentStackDepth {
                bci,
                first: existing,
                second: depth,
            }),
            Some(_) => Ok(()),
            None => {
                depths[at] = Some(depth);
                work.push(at);
                Ok(())
            }
        }
    };

    reach(&mut depths, &mut work, 0, 0)?;
    for handler in &code.exception_table {
        reach(&mut depths, &mut work, usize::from(handler.handler_pc), 1)?;
    }

    while let Some(at) = work.pop() {
        let inst = &instructions[at];
        let depth = depths[at].unwrap_or(0);
        let effect = stack_effect(inst, &code.bytecode, pool)?;

        let remaining = depth
            .checked_sub(effect.pop)
            .ok_or(MethodVerifyError::StackUnderflow { bci: inst.bci })?;
        let after = remaining + effect.push;
        if after > code.max_stack {
            return Err(MethodVerifyError::StackOverflow {
                bci: inst.bci,
                max_stack: code.max_stack,
            });
        }

        match inst.opcode {
            // The subroutine sees the return address, the code after it does not
            Opcode::Jsr | Opcode::JsrW => {
                for target in inst.branch_targets(&code.bytecode)? {
                    reach(&mut depths, &mut work, target as usize, after)?;
                }
                if inst.next_bci() < len {
                    reach(&mut depths, &mut work, inst.next_bci(), depth)?;
                }
                continue;
            }
            _ => {}
        }

        if inst.opcode.operand().is_branch() {
            for target in inst.branch_targets(&code.bytecode)? {
                reach(&mut depths, &mut work, target as usize, after)?;
            }
        }
        if inst.opcode.falls_through() && inst.next_bci() < len {
            reach(&mut depths, &mut work, inst.next_bci(), after)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use redefine_base::{
        builder::{ClassBuilder, CodeBuilder},
        code::{op::Opcode, ExceptionHandler},
        id::ClassId,
        verify::{MethodVerifyError, VerifyError, VerifyTarget, Verifier},
        MethodAccessFlags, SymbolTable,
    };

    use crate::StructuralVerifier;

    fn method_error(err: VerifyError) -> MethodVerifyError {
        match err {
            VerifyError::Method { error, .. } => error,
            err => panic!("expected a method error, got {:?}", err),
        }
    }

    #[test]
    fn test_accepts_well_formed() {
        let symbols = SymbolTable::new();
        let mut class = ClassBuilder::new(&symbols, "demo/Counter", Some("java/lang/Object"));
        class.field(redefine_base::FieldAccessFlags::PRIVATE, "count", "I");
        let init = class.pool().method_ref("java/lang/Object", "<init>", "()V");
        let count = class.pool().field_ref("demo/Counter", "count", "I");

        let mut code = CodeBuilder::new();
        code.aload(0).invokespecial(init).ret();
        class.method(MethodAccessFlags::PUBLIC, "<init>", "()V", Some(code.build(1, 1)));

        // if (count == 0) return 1; else return count;
        let mut code = CodeBuilder::new();
        code.aload(0).getfield(count).branch(Opcode::Ifne, 5).iconst(1).ireturn();
        code.aload(0).getfield(count).ireturn();
        class.method(MethodAccessFlags::PUBLIC, "get", "()I", Some(code.build(2, 1)));
        class.method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::NATIVE,
            "poke",
            "(J)V",
            None,
        );

        let (data, pool) = class.build();
        StructuralVerifier::default()
            .verify(&VerifyTarget::new(&data, &pool))
            .unwrap();
    }

    #[test]
    fn test_rejects_pre_resolved_class() {
        let symbols = SymbolTable::new();
        let class = ClassBuilder::new(&symbols, "demo/A", Some("java/lang/Object"));
        let (data, pool) = class.build();
        pool.resolve_class_at(data.this_class, ClassId::new_unchecked(3))
            .unwrap();

        assert_eq!(
            StructuralVerifier::default().verify(&VerifyTarget::new(&data, &pool)),
            Err(VerifyError::PreResolvedClass {
                index: data.this_class
            })
        );
    }

    #[test]
    fn test_rejects_bad_code() {
        let symbols = SymbolTable::new();
        let verify = |code: CodeBuilder, max_stack: u16| {
            let mut class = ClassBuilder::new(&symbols, "demo/A", Some("java/lang/Object"));
            class.method(
                MethodAccessFlags::STATIC,
                "run",
                "()V",
                Some(code.build(max_stack, 1)),
            );
            let (data, pool) = class.build();
            StructuralVerifier::default()
                .verify(&VerifyTarget::new(&data, &pool))
                .map_err(method_error)
        };

        let mut code = CodeBuilder::new();
        code.pop().ret();
        assert_eq!(
            verify(code, 1),
            Err(MethodVerifyError::StackUnderflow { bci: 0 })
        );

        let mut code = CodeBuilder::new();
        code.iconst(1).iconst(2).op(Opcode::Iadd.raw()).pop().ret();
        assert_eq!(
            verify(code, 1),
            Err(MethodVerifyError::StackOverflow {
                bci: 1,
                max_stack: 1
            })
        );

        let mut code = CodeBuilder::new();
        code.goto(2).ret();
        assert_eq!(
            verify(code, 1),
            Err(MethodVerifyError::BadBranchTarget { bci: 0, target: 2 })
        );

        let mut code = CodeBuilder::new();
        code.iconst(1).pop();
        assert_eq!(verify(code, 1), Err(MethodVerifyError::FallsOffEnd));

        let mut code = CodeBuilder::new();
        code.aload(1).pop().ret();
        assert_eq!(
            verify(code, 1),
            Err(MethodVerifyError::BadLocal {
                bci: 0,
                index: 1,
                max_locals: 1
            })
        );

        // One path reaches the return with an int left on the stack, the other without
        let mut code = CodeBuilder::new();
        code.iconst(0).branch(Opcode::Ifeq, 4).iconst(1).ret();
        assert!(matches!(
            verify(code, 1),
            Err(MethodVerifyError::InconsistentStackDepth { bci: 5, .. })
        ));
    }

    #[test]
    fn test_rejects_wrong_operand_kind() {
        let symbols = SymbolTable::new();
        let mut class = ClassBuilder::new(&symbols, "demo/A", Some("java/lang/Object"));
        let method = class.pool().method_ref("demo/A", "run", "()V");
        let mut code = CodeBuilder::new();
        code.getstatic(method).pop().ret();
        class.method(MethodAccessFlags::STATIC, "run", "()V", Some(code.build(1, 0)));
        let (data, pool) = class.build();

        assert_eq!(
            StructuralVerifier::default()
                .verify(&VerifyTarget::new(&data, &pool))
                .map_err(method_error),
            Err(MethodVerifyError::BadOperandTag {
                bci: 0,
                index: method,
                expected: "Fieldref"
            })
        );
    }

    #[test]
    fn test_invoke_special_uses_host_name() {
        let symbols = SymbolTable::new();
        let mut class = ClassBuilder::new(&symbols, "demo/A$New", Some("java/lang/Object"));
        let helper = class.pool().method_ref("demo/A", "helper", "()V");
        let mut code = CodeBuilder::new();
        code.aload(0).invokespecial(helper).ret();
        class.method(MethodAccessFlags::PUBLIC, "run", "()V", Some(code.build(1, 1)));
        let (data, pool) = class.build();

        let verifier = StructuralVerifier::default();
        assert!(matches!(
            verifier.verify(&VerifyTarget::new(&data, &pool)).map_err(method_error),
            Err(MethodVerifyError::BadOperand { bci: 1 })
        ));

        let host = symbols.intern_str("demo/A");
        verifier
            .verify(&VerifyTarget::new(&data, &pool).with_host_name(&host))
            .unwrap();
    }

    #[test]
    fn test_version_and_structure_rules() {
        let symbols = SymbolTable::new();

        // Newer classes must carry stack maps once there is control flow
        let mut class = ClassBuilder::new(&symbols, "demo/A", Some("java/lang/Object"));
        class.version(52);
        let mut code = CodeBuilder::new();
        code.iconst(0).branch(Opcode::Ifeq, 3).ret();
        class.method(MethodAccessFlags::STATIC, "run", "()V", Some(code.build(1, 0)));
        let (data, pool) = class.build();
        assert_eq!(
            StructuralVerifier::default()
                .verify(&VerifyTarget::new(&data, &pool))
                .map_err(method_error),
            Err(MethodVerifyError::MissingStackMap)
        );

        // Abstract methods cannot have code
        let mut class = ClassBuilder::new(&symbols, "demo/B", Some("java/lang/Object"));
        let mut code = CodeBuilder::new();
        code.ret();
        class.method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT,
            "run",
            "()V",
            Some(code.build(0, 1)),
        );
        let (data, pool) = class.build();
        assert_eq!(
            StructuralVerifier::default()
                .verify(&VerifyTarget::new(&data, &pool))
                .map_err(method_error),
            Err(MethodVerifyError::CodePresence { expected: false })
        );

        // A handler whose range is empty
        let mut class = ClassBuilder::new(&symbols, "demo/C", Some("java/lang/Object"));
        let mut code = CodeBuilder::new();
        code.ret().athrow();
        let mut code = code.build(1, 0);
        code.exception_table.push(ExceptionHandler {
            start_pc: 0,
            end_pc: 0,
            handler_pc: 1,
            catch_type: 0,
        });
        class.method(MethodAccessFlags::STATIC, "run", "()V", Some(code));
        let (data, pool) = class.build();
        assert_eq!(
            StructuralVerifier::default()
                .verify(&VerifyTarget::new(&data, &pool))
                .map_err(method_error),
            Err(MethodVerifyError::BadExceptionHandler { index: 0 })
        );
    }
}
