//! The bytecode instruction set.
//! Only what rewriting and verification need is tracked per opcode: its length (when it is
//! fixed) and the kind of operand it carries.

pub type RawOpcode = u8;

/// What an instruction's operand bytes mean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// `bipush`
    Byte,
    /// `sipush`
    Short,
    /// A one byte local variable index, two bytes under `wide`
    Local,
    /// `iinc`: local variable index and signed increment, both widened under `wide`
    Increment,
    /// `newarray`: primitive array type code
    ArrayType,
    /// `ldc`: one byte pool index of a loadable constant
    ConstantByte,
    /// `ldc_w`: two byte pool index of a single-slot loadable constant
    Constant,
    /// `ldc2_w`: two byte pool index of a long or double
    WideConstant,
    /// Two byte pool index of a class
    Class,
    /// `multianewarray`: two byte pool index of a class and a dimension count
    MultiANewArray,
    /// Two byte pool index of a field reference
    Field,
    /// Two byte pool index of a method or interface method reference
    Method,
    /// `invokeinterface`: two byte pool index, argument count, zero
    InterfaceMethod,
    /// `invokedynamic`: two byte pool index, two zero bytes
    Dynamic,
    /// Signed two byte branch offset
    Branch,
    /// Signed four byte branch offset
    WideBranch,
    TableSwitch,
    LookupSwitch,
    Wide,
}
impl OperandKind {
    /// Whether the operand starts with a constant pool index
    #[must_use]
    pub fn has_pool_index(self) -> bool {
        matches!(
            self,
            OperandKind::ConstantByte
                | OperandKind::Constant
                | OperandKind::WideConstant
                | OperandKind::Class
                | OperandKind::MultiANewArray
                | OperandKind::Field
                | OperandKind::Method
                | OperandKind::InterfaceMethod
                | OperandKind::Dynamic
        )
    }

    /// Whether linking replaces the pool index with an index into the call site cache
    #[must_use]
    pub fn is_cache_indexed(self) -> bool {
        matches!(
            self,
            OperandKind::Field
                | OperandKind::Method
                | OperandKind::InterfaceMethod
                | OperandKind::Dynamic
        )
    }

    #[must_use]
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            OperandKind::Branch
                | OperandKind::WideBranch
                | OperandKind::TableSwitch
                | OperandKind::LookupSwitch
        )
    }
}

macro_rules! define_opcodes {
    ($(
        $name:ident = $code:literal, $mnemonic:literal, $len:literal, $operand:ident;
    )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $code,)*
        }
        impl Opcode {
            #[must_use]
            pub fn from_raw(raw: RawOpcode) -> Option<Opcode> {
                match raw {
                    $($code => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            #[must_use]
            pub fn raw(self) -> RawOpcode {
                self as RawOpcode
            }

            #[must_use]
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            /// The length of the instruction including the opcode byte, or `None` for the
            /// switches and `wide` whose length depends on their position or operands.
            #[must_use]
            pub fn fixed_length(self) -> Option<usize> {
                let len: usize = match self {
                    $(Opcode::$name => $len,)*
                };
                if len == 0 {
                    None
                } else {
                    Some(len)
                }
            }

            #[must_use]
            pub fn operand(self) -> OperandKind {
                match self {
                    $(Opcode::$name => OperandKind::$operand,)*
                }
            }
        }

        #[cfg(test)]
        pub(crate) const ALL_OPCODES: &[Opcode] = &[$(Opcode::$name,)*];
    };
}

define_opcodes! {
    Nop = 0x00, "nop", 1, None;
    AConstNull = 0x01, "aconst_null", 1, None;
    IconstM1 = 0x02, "iconst_m1", 1, None;
    Iconst0 = 0x03, "iconst_0", 1, None;
    Iconst1 = 0x04, "iconst_1", 1, None;
    Iconst2 = 0x05, "iconst_2", 1, None;
    Iconst3 = 0x06, "iconst_3", 1, None;
    Iconst4 = 0x07, "iconst_4", 1, None;
    Iconst5 = 0x08, "iconst_5", 1, None;
    Lconst0 = 0x09, "lconst_0", 1, None;
    Lconst1 = 0x0A, "lconst_1", 1, None;
    Fconst0 = 0x0B, "fconst_0", 1, None;
    Fconst1 = 0x0C, "fconst_1", 1, None;
    Fconst2 = 0x0D, "fconst_2", 1, None;
    Dconst0 = 0x0E, "dconst_0", 1, None;
    Dconst1 = 0x0F, "dconst_1", 1, None;
    Bipush = 0x10, "bipush", 2, Byte;
    Sipush = 0x11, "sipush", 3, Short;
    Ldc = 0x12, "ldc", 2, ConstantByte;
    LdcW = 0x13, "ldc_w", 3, Constant;
    Ldc2W = 0x14, "ldc2_w", 3, WideConstant;
    Iload = 0x15, "iload", 2, Local;
    Lload = 0x16, "lload", 2, Local;
    Fload = 0x17, "fload", 2, Local;
    Dload = 0x18, "dload", 2, Local;
    Aload = 0x19, "aload", 2, Local;
    Iload0 = 0x1A, "iload_0", 1, None;
    Iload1 = 0x1B, "iload_1", 1, None;
    Iload2 = 0x1C, "iload_2", 1, None;
    Iload3 = 0x1D, "iload_3", 1, None;
    Lload0 = 0x1E, "lload_0", 1, None;
    Lload1 = 0x1F, "lload_1", 1, None;
    Lload2 = 0x20, "lload_2", 1, None;
    Lload3 = 0x21, "lload_3", 1, None;
    Fload0 = 0x22, "fload_0", 1, None;
    Fload1 = 0x23, "fload_1", 1, None;
    Fload2 = 0x24, "fload_2", 1, None;
    Fload3 = 0x25, "fload_3", 1, None;
    Dload0 = 0x26, "dload_0", 1, None;
    Dload1 = 0x27, "dload_1", 1, None;
    Dload2 = 0x28, "dload_2", 1, None;
    Dload3 = 0x29, "dload_3", 1, None;
    Aload0 = 0x2A, "aload_0", 1, None;
    Aload1 = 0x2B, "aload_1", 1, None;
    Aload2 = 0x2C, "aload_2", 1, None;
    Aload3 = 0x2D, "aload_3", 1, None;
    Iaload = 0x2E, "iaload", 1, None;
    Laload = 0x2F, "laload", 1, None;
    Faload = 0x30, "faload", 1, None;
    Daload = 0x31, "daload", 1, None;
    Aaload = 0x32, "aaload", 1, None;
    Baload = 0x33, "baload", 1, None;
    Caload = 0x34, "caload", 1, None;
    Saload = 0x35, "saload", 1, None;
    Istore = 0x36, "istore", 2, Local;
    Lstore = 0x37, "lstore", 2, Local;
    Fstore = 0x38, "fstore", 2, Local;
    Dstore = 0x39, "dstore", 2, Local;
    Astore = 0x3A, "astore", 2, Local;
    Istore0 = 0x3B, "istore_0", 1, None;
    Istore1 = 0x3C, "istore_1", 1, None;
    Istore2 = 0x3D, "istore_2", 1, None;
    Istore3 = 0x3E, "istore_3", 1, None;
    Lstore0 = 0x3F, "lstore_0", 1, None;
    Lstore1 = 0x40, "lstore_1", 1, None;
    Lstore2 = 0x41, "lstore_2", 1, None;
    Lstore3 = 0x42, "lstore_3", 1, None;
    Fstore0 = 0x43, "fstore_0", 1, None;
    Fstore1 = 0x44, "fstore_1", 1, None;
    Fstore2 = 0x45, "fstore_2", 1, None;
    Fstore3 = 0x46, "fstore_3", 1, None;
    Dstore0 = 0x47, "dstore_0", 1, None;
    Dstore1 = 0x48, "dstore_1", 1, None;
    Dstore2 = 0x49, "dstore_2", 1, None;
    Dstore3 = 0x4A, "dstore_3", 1, None;
    Astore0 = 0x4B, "astore_0", 1, None;
    Astore1 = 0x4C, "astore_1", 1, None;
    Astore2 = 0x4D, "astore_2", 1, None;
    Astore3 = 0x4E, "astore_3", 1, None;
    Iastore = 0x4F, "iastore", 1, None;
    Lastore = 0x50, "lastore", 1, None;
    Fastore = 0x51, "fastore", 1, None;
    Dastore = 0x52, "dastore", 1, None;
    Aastore = 0x53, "aastore", 1, None;
    Bastore = 0x54, "bastore", 1, None;
    Castore = 0x55, "castore", 1, None;
    Sastore = 0x56, "sastore", 1, None;
    Pop = 0x57, "pop", 1, None;
    Pop2 = 0x58, "pop2", 1, None;
    Dup = 0x59, "dup", 1, None;
    DupX1 = 0x5A, "dup_x1", 1, None;
    DupX2 = 0x5B, "dup_x2", 1, None;
    Dup2 = 0x5C, "dup2", 1, None;
    Dup2X1 = 0x5D, "dup2_x1", 1, None;
    Dup2X2 = 0x5E, "dup2_x2", 1, None;
    Swap = 0x5F, "swap", 1, None;
    Iadd = 0x60, "iadd", 1, None;
    Ladd = 0x61, "ladd", 1, None;
    Fadd = 0x62, "fadd", 1, None;
    Dadd = 0x63, "dadd", 1, None;
    Isub = 0x64, "isub", 1, None;
    Lsub = 0x65, "lsub", 1, None;
    Fsub = 0x66, "fsub", 1, None;
    Dsub = 0x67, "dsub", 1, None;
    Imul = 0x68, "imul", 1, None;
    Lmul = 0x69, "lmul", 1, None;
    Fmul = 0x6A, "fmul", 1, None;
    Dmul = 0x6B, "dmul", 1, None;
    Idiv = 0x6C, "idiv", 1, None;
    Ldiv = 0x6D, "ldiv", 1, None;
    Fdiv = 0x6E, "fdiv", 1, None;
    Ddiv = 0x6F, "ddiv", 1, None;
    Irem = 0x70, "irem", 1, None;
    Lrem = 0x71, "lrem", 1, None;
    Frem = 0x72, "frem", 1, None;
    Drem = 0x73, "drem", 1, None;
    Ineg = 0x74, "ineg", 1, None;
    Lneg = 0x75, "lneg", 1, None;
    Fneg = 0x76, "fneg", 1, None;
    Dneg = 0x77, "dneg", 1, None;
    Ishl = 0x78, "ishl", 1, None;
    Lshl = 0x79, "lshl", 1, None;
    Ishr = 0x7A, "ishr", 1, None;
    Lshr = 0x7B, "lshr", 1, None;
    Iushr = 0x7C, "iushr", 1, None;
    Lushr = 0x7D, "lushr", 1, None;
    Iand = 0x7E, "iand", 1, None;
    Land = 0x7F, "land", 1, None;
    Ior = 0x80, "ior", 1, None;
    Lor = 0x81, "lor", 1, None;
    Ixor = 0x82, "ixor", 1, None;
    Lxor = 0x83, "lxor", 1, None;
    Iinc = 0x84, "iinc", 3, Increment;
    I2l = 0x85, "i2l", 1, None;
    I2f = 0x86, "i2f", 1, None;
    I2d = 0x87, "i2d", 1, None;
    L2i = 0x88, "l2i", 1, None;
    L2f = 0x89, "l2f", 1, None;
    L2d = 0x8A, "l2d", 1, None;
    F2i = 0x8B, "f2i", 1, None;
    F2l = 0x8C, "f2l", 1, None;
    F2d = 0x8D, "f2d", 1, None;
    D2i = 0x8E, "d2i", 1, None;
    D2l = 0x8F, "d2l", 1, None;
    D2f = 0x90, "d2f", 1, None;
    I2b = 0x91, "i2b", 1, None;
    I2c = 0x92, "i2c", 1, None;
    I2s = 0x93, "i2s", 1, None;
    Lcmp = 0x94, "lcmp", 1, None;
    Fcmpl = 0x95, "fcmpl", 1, None;
    Fcmpg = 0x96, "fcmpg", 1, None;
    Dcmpl = 0x97, "dcmpl", 1, None;
    Dcmpg = 0x98, "dcmpg", 1, None;
    Ifeq = 0x99, "ifeq", 3, Branch;
    Ifne = 0x9A, "ifne", 3, Branch;
    Iflt = 0x9B, "iflt", 3, Branch;
    Ifge = 0x9C, "ifge", 3, Branch;
    Ifgt = 0x9D, "ifgt", 3, Branch;
    Ifle = 0x9E, "ifle", 3, Branch;
    IfIcmpeq = 0x9F, "if_icmpeq", 3, Branch;
    IfIcmpne = 0xA0, "if_icmpne", 3, Branch;
    IfIcmplt = 0xA1, "if_icmplt", 3, Branch;
    IfIcmpge = 0xA2, "if_icmpge", 3, Branch;
    IfIcmpgt = 0xA3, "if_icmpgt", 3, Branch;
    IfIcmple = 0xA4, "if_icmple", 3, Branch;
    IfAcmpeq = 0xA5, "if_acmpeq", 3, Branch;
    IfAcmpne = 0xA6, "if_acmpne", 3, Branch;
    Goto = 0xA7, "goto", 3, Branch;
    Jsr = 0xA8, "jsr", 3, Branch;
    Ret = 0xA9, "ret", 2, Local;
    TableSwitch = 0xAA, "tableswitch", 0, TableSwitch;
    LookupSwitch = 0xAB, "lookupswitch", 0, LookupSwitch;
    Ireturn = 0xAC, "ireturn", 1, None;
    Lreturn = 0xAD, "lreturn", 1, None;
    Freturn = 0xAE, "freturn", 1, None;
    Dreturn = 0xAF, "dreturn", 1, None;
    Areturn = 0xB0, "areturn", 1, None;
    Return = 0xB1, "return", 1, None;
    GetStatic = 0xB2, "getstatic", 3, Field;
    PutStatic = 0xB3, "putstatic", 3, Field;
    GetField = 0xB4, "getfield", 3, Field;
    PutField = 0xB5, "putfield", 3, Field;
    InvokeVirtual = 0xB6, "invokevirtual", 3, Method;
    InvokeSpecial = 0xB7, "invokespecial", 3, Method;
    InvokeStatic = 0xB8, "invokestatic", 3, Method;
    InvokeInterface = 0xB9, "invokeinterface", 5, InterfaceMethod;
    InvokeDynamic = 0xBA, "invokedynamic", 5, Dynamic;
    New = 0xBB, "new", 3, Class;
    NewArray = 0xBC, "newarray", 2, ArrayType;
    ANewArray = 0xBD, "anewarray", 3, Class;
    ArrayLength = 0xBE, "arraylength", 1, None;
    AThrow = 0xBF, "athrow", 1, None;
    CheckCast = 0xC0, "checkcast", 3, Class;
    InstanceOf = 0xC1, "instanceof", 3, Class;
    MonitorEnter = 0xC2, "monitorenter", 1, None;
    MonitorExit = 0xC3, "monitorexit", 1, None;
    Wide = 0xC4, "wide", 0, Wide;
    MultiANewArray = 0xC5, "multianewarray", 4, MultiANewArray;
    IfNull = 0xC6, "ifnull", 3, Branch;
    IfNonNull = 0xC7, "ifnonnull", 3, Branch;
    GotoW = 0xC8, "goto_w", 5, WideBranch;
    JsrW = 0xC9, "jsr_w", 5, WideBranch;
}

impl Opcode {
    /// Whether execution can fall through to the following instruction
    #[must_use]
    pub fn falls_through(self) -> bool {
        !matches!(
            self,
            Opcode::Goto
                | Opcode::GotoW
                | Opcode::Ret
                | Opcode::TableSwitch
                | Opcode::LookupSwitch
                | Opcode::Ireturn
                | Opcode::Lreturn
                | Opcode::Freturn
                | Opcode::Dreturn
                | Opcode::Areturn
                | Opcode::Return
                | Opcode::AThrow
        )
    }

    /// Whether `wide` may modify this opcode
    #[must_use]
    pub fn is_widenable(self) -> bool {
        matches!(self.operand(), OperandKind::Local | OperandKind::Increment)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::{Opcode, OperandKind, ALL_OPCODES};

    #[test]
    fn test_opcode_table() {
        assert_eq!(ALL_OPCODES.len(), 202);
        for &opcode in ALL_OPCODES {
            assert_eq!(Opcode::from_raw(opcode.raw()), Some(opcode));
        }
        // Reserved and unassigned opcodes
        assert_eq!(Opcode::from_raw(0xCA), None);
        assert_eq!(Opcode::from_raw(0xFF), None);

        assert_eq!(Opcode::InvokeInterface.fixed_length(), Some(5));
        assert_eq!(Opcode::TableSwitch.fixed_length(), None);
        assert_eq!(Opcode::Ldc.operand(), OperandKind::ConstantByte);
        assert_eq!(Opcode::Iinc.name(), "iinc");
        assert!(Opcode::Ret.is_widenable());
        assert!(!Opcode::Goto.falls_through());
    }
}
