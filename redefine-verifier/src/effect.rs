use redefine_base::{
    code::{op::Opcode, stream::Instruction},
    constant_pool::{ConstantPool, PoolIndex},
    descriptor::{DescriptorType, MethodDescriptor},
    verify::MethodVerifyError,
};

/// How many stack slots an instruction pops and then pushes.
/// Longs and doubles count as two slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackEffect {
    pub pop: u16,
    pub push: u16,
}
impl StackEffect {
    const fn new(pop: u16, push: u16) -> StackEffect {
        StackEffect { pop, push }
    }
}

/// The local variable an instruction loads or stores, and how many slots it takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LocalAccess {
    pub index: u16,
    pub width: u16,
}

/// Types in the order the implicit `xload_n` and `xstore_n` forms group them
const IMPLICIT_WIDTHS: [u16; 5] = [1, 2, 1, 2, 1];

pub(crate) fn local_access(inst: &Instruction, code: &[u8]) -> Option<LocalAccess> {
    let raw = inst.opcode.raw();
    let implicit = |offset: u8| LocalAccess {
        index: u16::from(offset % 4),
        width: IMPLICIT_WIDTHS[usize::from(offset / 4)],
    };
    if (Opcode::Iload0.raw()..=Opcode::Aload3.raw()).contains(&raw) {
        return Some(implicit(raw - Opcode::Iload0.raw()));
    } else if (Opcode::Istore0.raw()..=Opcode::Astore3.raw()).contains(&raw) {
        return Some(implicit(raw - Opcode::Istore0.raw()));
    }

    match inst.opcode {
        Opcode::Iload
        | Opcode::Fload
        | Opcode::Aload
        | Opcode::Istore
        | Opcode::Fstore
        | Opcode::Astore
        | Opcode::Ret
        | Opcode::Iinc => explicit_local(inst, code, 1),
        Opcode::Lload | Opcode::Dload | Opcode::Lstore | Opcode::Dstore => {
            explicit_local(inst, code, 2)
        }
        _ => None,
    }
}

fn explicit_local(inst: &Instruction, code: &[u8], width: u16) -> Option<LocalAccess> {
    let at = inst.operand_start();
    let index = if inst.wide {
        u16::from_be_bytes([*code.get(at)?, *code.get(at + 1)?])
    } else {
        u16::from(*code.get(at)?)
    };
    Some(LocalAccess { index, width })
}

fn descriptor_slots(descriptor: &[u8]) -> Result<u16, MethodVerifyError> {
    Ok(DescriptorType::parse(descriptor)?.slot_size())
}

fn member_descriptor(
    pool: &ConstantPool,
    bci: usize,
    index: PoolIndex,
) -> Result<&[u8], MethodVerifyError> {
    pool.member_ref_at(index)
        .map(|info| info.descriptor.as_bytes())
        .map_err(|_| MethodVerifyError::BadOperandTag {
            bci,
            index,
            expected: "member reference",
        })
}

fn invoke_effect(descriptor: &[u8], receiver: bool) -> Result<StackEffect, MethodVerifyError> {
    let descriptor = MethodDescriptor::parse(descriptor)?;
    let pop = descriptor.parameter_slots() + u16::from(receiver);
    let push = descriptor.return_type().map_or(0, DescriptorType::slot_size);
    Ok(StackEffect::new(pop, push))
}

/// The stack effect of an instruction whose operands have already been checked
pub(crate) fn stack_effect(
    inst: &Instruction,
    code: &[u8],
    pool: &ConstantPool,
) -> Result<StackEffect, MethodVerifyError> {
    let bci = inst.bci;
    let index = || inst.pool_index(code).ok_or(MethodVerifyError::BadOperand { bci });
    Ok(match inst.opcode {
        Opcode::Nop | Opcode::Iinc | Opcode::Goto | Opcode::GotoW | Opcode::Ret | Opcode::Return => {
            StackEffect::new(0, 0)
        }
        Opcode::AConstNull
        | Opcode::IconstM1
        | Opcode::Iconst0
        | Opcode::Iconst1
        | Opcode::Iconst2
        | Opcode::Iconst3
        | Opcode::Iconst4
        | Opcode::Iconst5
        | Opcode::Fconst0
        | Opcode::Fconst1
        | Opcode::Fconst2
        | Opcode::Bipush
        | Opcode::Sipush
        | Opcode::Ldc
        | Opcode::LdcW
        | Opcode::New
        | Opcode::Jsr
        | Opcode::JsrW => StackEffect::new(0, 1),
        Opcode::Lconst0 | Opcode::Lconst1 | Opcode::Dconst0 | Opcode::Dconst1 | Opcode::Ldc2W => {
            StackEffect::new(0, 2)
        }
        Opcode::Iload
        | Opcode::Fload
        | Opcode::Aload
        | Opcode::Lload
        | Opcode::Dload
        | Opcode::Iload0
        | Opcode::Iload1
        | Opcode::Iload2
        | Opcode::Iload3
        | Opcode::Lload0
        | Opcode::Lload1
        | Opcode::Lload2
        | Opcode::Lload3
        | Opcode::Fload0
        | Opcode::Fload1
        | Opcode::Fload2
        | Opcode::Fload3
        | Opcode::Dload0
        | Opcode::Dload1
        | Opcode::Dload2
        | Opcode::Dload3
        | Opcode::Aload0
        | Opcode::Aload1
        | Opcode::Aload2
        | Opcode::Aload3 => {
            let width = local_access(inst, code).map_or(1, |access| access.width);
            StackEffect::new(0, width)
        }
        Opcode::Istore
        | Opcode::Fstore
        | Opcode::Astore
        | Opcode::Lstore
        | Opcode::Dstore
        | Opcode::Istore0
        | Opcode::Istore1
        | Opcode::Istore2
        | Opcode::Istore3
        | Opcode::Lstore0
        | Opcode::Lstore1
        | Opcode::Lstore2
        | Opcode::Lstore3
        | Opcode::Fstore0
        | Opcode::Fstore1
        | Opcode::Fstore2
        | Opcode::Fstore3
        | Opcode::Dstore0
        | Opcode::Dstore1
        | Opcode::Dstore2
        | Opcode::Dstore3
        | Opcode::Astore0
        | Opcode::Astore1
        | Opcode::Astore2
        | Opcode::Astore3 => {
            let width = local_access(inst, code).map_or(1, |access| access.width);
            StackEffect::new(width, 0)
        }
        Opcode::Iaload
        | Opcode::Faload
        | Opcode::Aaload
        | Opcode::Baload
        | Opcode::Caload
        | Opcode::Saload => StackEffect::new(2, 1),
        Opcode::Laload | Opcode::Daload => StackEffect::new(2, 2),
        Opcode::Iastore
        | Opcode::Fastore
        | Opcode::Aastore
        | Opcode::Bastore
        | Opcode::Castore
        | Opcode::Sastore => StackEffect::new(3, 0),
        Opcode::Lastore | Opcode::Dastore => StackEffect::new(4, 0),
        Opcode::Pop => StackEffect::new(1, 0),
        Opcode::Pop2 => StackEffect::new(2, 0),
        Opcode::Dup => StackEffect::new(1, 2),
        Opcode::DupX1 => StackEffect::new(2, 3),
        Opcode::DupX2 => StackEffect::new(3, 4),
        Opcode::Dup2 => StackEffect::new(2, 4),
        Opcode::Dup2X1 => StackEffect::new(3, 5),
        Opcode::Dup2X2 => StackEffect::new(4, 6),
        Opcode::Swap => StackEffect::new(2, 2),
        Opcode::Iadd
        | Opcode::Isub
        | Opcode::Imul
        | Opcode::Idiv
        | Opcode::Irem
        | Opcode::Ishl
        | Opcode::Ishr
        | Opcode::Iushr
        | Opcode::Iand
        | Opcode::Ior
        | Opcode::Ixor
        | Opcode::Fadd
        | Opcode::Fsub
        | Opcode::Fmul
        | Opcode::Fdiv
        | Opcode::Frem
        | Opcode::Fcmpl
        | Opcode::Fcmpg => StackEffect::new(2, 1),
        Opcode::Ladd
        | Opcode::Lsub
        | Opcode::Lmul
        | Opcode::Ldiv
        | Opcode::Lrem
        | Opcode::Land
        | Opcode::Lor
        | Opcode::Lxor
        | Opcode::Dadd
        | Opcode::Dsub
        | Opcode::Dmul
        | Opcode::Ddiv
        | Opcode::Drem => StackEffect::new(4, 2),
        Opcode::Lshl | Opcode::Lshr | Opcode::Lushr => StackEffect::new(3, 2),
        Opcode::Ineg
        | Opcode::Fneg
        | Opcode::I2f
        | Opcode::F2i
        | Opcode::I2b
        | Opcode::I2c
        | Opcode::I2s
        | Opcode::NewArray
        | Opcode::ANewArray
        | Opcode::ArrayLength
        | Opcode::CheckCast
        | Opcode::InstanceOf => StackEffect::new(1, 1),
        Opcode::Lneg | Opcode::Dneg | Opcode::L2d | Opcode::D2l => StackEffect::new(2, 2),
        Opcode::I2l | Opcode::I2d | Opcode::F2l | Opcode::F2d => StackEffect::new(1, 2),
        Opcode::L2i | Opcode::L2f | Opcode::D2i | Opcode::D2f => StackEffect::new(2, 1),
        Opcode::Lcmp | Opcode::Dcmpl | Opcode::Dcmpg => StackEffect::new(4, 1),
        Opcode::Ifeq
        | Opcode::Ifne
        | Opcode::Iflt
        | Opcode::Ifge
        | Opcode::Ifgt
        | Opcode::Ifle
        | Opcode::IfNull
        | Opcode::IfNonNull
        | Opcode::TableSwitch
        | Opcode::LookupSwitch
        | Opcode::Ireturn
        | Opcode::Freturn
        | Opcode::Areturn
        | Opcode::AThrow
        | Opcode::MonitorEnter
        | Opcode::MonitorExit => StackEffect::new(1, 0),
        Opcode::IfIcmpeq
        | Opcode::IfIcmpne
        | Opcode::IfIcmplt
        | Opcode::IfIcmpge
        | Opcode::IfIcmpgt
        | Opcode::IfIcmple
        | Opcode::IfAcmpeq
        | Opcode::IfAcmpne
        | Opcode::Lreturn
        | Opcode::Dreturn => StackEffect::new(2, 0),
        Opcode::GetStatic => {
            let index = index()?;
            StackEffect::new(0, descriptor_slots(member_descriptor(pool, bci, index)?)?)
        }
        Opcode::PutStatic => {
            let index = index()?;
            StackEffect::new(descriptor_slots(member_descriptor(pool, bci, index)?)?, 0)
        }
        Opcode::GetField => {
            let index = index()?;
            StackEffect::new(1, descriptor_slots(member_descriptor(pool, bci, index)?)?)
        }
        Opcode::PutField => {
            let index = index()?;
            StackEffect::new(1 + descriptor_slots(member_descriptor(pool, bci, index)?)?, 0)
        }
        Opcode::InvokeVirtual | Opcode::InvokeSpecial | Opcode::InvokeInterface => {
            let index = index()?;
            invoke_effect(member_descriptor(pool, bci, index)?, true)?
        }
        Opcode::InvokeStatic => {
            let index = index()?;
            invoke_effect(member_descriptor(pool, bci, index)?, false)?
        }
        Opcode::InvokeDynamic => {
            let index = index()?;
            let descriptor = pool
                .dynamic_at(index)
                .and_then(|dynamic| pool.name_and_type_at(dynamic.name_and_type_index))
                .map_err(|_| MethodVerifyError::BadOperandTag {
                    bci,
                    index,
                    expected: "InvokeDynamic",
                })?
                .1;
            invoke_effect(descriptor.as_bytes(), false)?
        }
        Opcode::MultiANewArray => {
            let dimensions = code
                .get(inst.operand_start() + 2)
                .ok_or(MethodVerifyError::BadOperand { bci })?;
            StackEffect::new(u16::from(*dimensions), 1)
        }
        Opcode::Wide => return Err(MethodVerifyError::BadOperand { bci }),
    })
}
