//! Programmatic construction of classes, for fixtures and tools that need a class without a
//! class file on hand.
//!
//! # Panics
//! The builders panic if the pool runs out of indices, since they are meant for small,
//! hand-written classes.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::{
    access::{ClassAccessFlags, FieldAccessFlags, MethodAccessFlags},
    class::{ClassAttributes, ClassData, ClassFileVersion, FieldInfo, MethodInfo, Annotations},
    code::{op::Opcode, Code},
    constant_pool::{
        BootstrapSpecifier, ConstantEntry, ConstantPool, DynamicRef, MemberRef, PoolIndex,
        ReferenceKind,
    },
    symbol::SymbolTable,
};

/// Builds a constant pool, reusing an existing entry whenever an equal one is requested.
/// [`ConstantPoolBuilder::push`] bypasses this.
pub struct ConstantPoolBuilder<'s> {
    symbols: &'s SymbolTable,
    pool: ConstantPool,
    existing: HashMap<ConstantEntry, PoolIndex>,
}
impl<'s> ConstantPoolBuilder<'s> {
    #[must_use]
    pub fn new(symbols: &'s SymbolTable) -> ConstantPoolBuilder<'s> {
        ConstantPoolBuilder {
            symbols,
            pool: ConstantPool::empty(),
            existing: HashMap::new(),
        }
    }

    #[must_use]
    pub fn symbols(&self) -> &'s SymbolTable {
        self.symbols
    }

    /// Append an entry even if an equal one exists
    pub fn push(&mut self, entry: ConstantEntry) -> PoolIndex {
        let index = self
            .pool
            .push(entry.clone())
            .expect("fixture constant pool overflowed");
        self.existing.entry(entry).or_insert(index);
        index
    }

    fn intern(&mut self, entry: ConstantEntry) -> PoolIndex {
        match self.existing.get(&entry) {
            Some(index) => *index,
            None => self.push(entry),
        }
    }

    /// The index the next new entry will receive
    #[must_use]
    pub fn peek_next(&self) -> PoolIndex {
        self.pool.next_index()
    }

    pub fn utf8(&mut self, text: &str) -> PoolIndex {
        let symbol = self.symbols.intern_str(text);
        self.intern(ConstantEntry::Utf8(symbol))
    }

    pub fn integer(&mut self, value: i32) -> PoolIndex {
        self.intern(ConstantEntry::Integer(value))
    }

    pub fn float(&mut self, value: f32) -> PoolIndex {
        self.intern(ConstantEntry::Float(value.to_bits()))
    }

    pub fn long(&mut self, value: i64) -> PoolIndex {
        self.intern(ConstantEntry::Long(value))
    }

    pub fn double(&mut self, value: f64) -> PoolIndex {
        self.intern(ConstantEntry::Double(value.to_bits()))
    }

    pub fn class(&mut self, name: &str) -> PoolIndex {
        let name_index = self.utf8(name);
        self.intern(ConstantEntry::Class { name_index })
    }

    pub fn string(&mut self, text: &str) -> PoolIndex {
        let string_index = self.utf8(text);
        self.intern(ConstantEntry::String { string_index })
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> PoolIndex {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.intern(ConstantEntry::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    fn member(&mut self, class: &str, name: &str, descriptor: &str) -> MemberRef {
        MemberRef {
            class_index: self.class(class),
            name_and_type_index: self.name_and_type(name, descriptor),
        }
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> PoolIndex {
        let member = self.member(class, name, descriptor);
        self.intern(ConstantEntry::FieldRef(member))
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> PoolIndex {
        let member = self.member(class, name, descriptor);
        self.intern(ConstantEntry::MethodRef(member))
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> PoolIndex {
        let member = self.member(class, name, descriptor);
        self.intern(ConstantEntry::InterfaceMethodRef(member))
    }

    /// A method handle, along with the field or method reference its kind requires
    pub fn method_handle(
        &mut self,
        kind: ReferenceKind,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> PoolIndex {
        let reference_index = match kind {
            ReferenceKind::GetField
            | ReferenceKind::GetStatic
            | ReferenceKind::PutField
            | ReferenceKind::PutStatic => self.field_ref(class, name, descriptor),
            ReferenceKind::InvokeInterface => self.interface_method_ref(class, name, descriptor),
            _ => self.method_ref(class, name, descriptor),
        };
        self.intern(ConstantEntry::MethodHandle {
            kind,
            reference_index,
        })
    }

    pub fn method_type(&mut self, descriptor: &str) -> PoolIndex {
        let descriptor_index = self.utf8(descriptor);
        self.intern(ConstantEntry::MethodType { descriptor_index })
    }

    /// Append a bootstrap specifier, returning its operand index
    pub fn operand(&mut self, specifier: BootstrapSpecifier) -> u16 {
        self.pool
            .push_operand(specifier)
            .expect("fixture operands overflowed")
    }

    /// Find or append a bootstrap specifier
    pub fn bootstrap(&mut self, method_handle_index: PoolIndex, arguments: &[PoolIndex]) -> u16 {
        let specifier = BootstrapSpecifier {
            method_handle_index,
            arguments: SmallVec::from_slice(arguments),
        };
        match self.pool.operands().iter().position(|op| *op == specifier) {
            Some(index) => index as u16,
            None => self.operand(specifier),
        }
    }

    pub fn invoke_dynamic(&mut self, bootstrap_index: u16, name: &str, descriptor: &str) -> PoolIndex {
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.intern(ConstantEntry::InvokeDynamic(DynamicRef {
            bootstrap_index,
            name_and_type_index,
        }))
    }

    pub fn dynamic(&mut self, bootstrap_index: u16, name: &str, descriptor: &str) -> PoolIndex {
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.intern(ConstantEntry::Dynamic(DynamicRef {
            bootstrap_index,
            name_and_type_index,
        }))
    }

    #[must_use]
    pub fn pool(&self) -> &ConstantPool {
        &self.pool
    }

    /// Finish the pool. It is not validated, so that malformed pools can be built.
    #[must_use]
    pub fn build(self) -> ConstantPool {
        self.pool
    }
}

/// Builds a class along with its pool
pub struct ClassBuilder<'s> {
    pool: ConstantPoolBuilder<'s>,
    class: ClassData,
}
impl<'s> ClassBuilder<'s> {
    /// A public class of version 49, which does not require stack maps
    #[must_use]
    pub fn new(symbols: &'s SymbolTable, name: &str, super_name: Option<&str>) -> ClassBuilder<'s> {
        let mut pool = ConstantPoolBuilder::new(symbols);
        let this_class = pool.class(name);
        let super_class = super_name.map(|super_name| pool.class(super_name));
        ClassBuilder {
            pool,
            class: ClassData {
                version: ClassFileVersion {
                    major: 49,
                    minor: 0,
                },
                access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
                this_class,
                super_class,
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                attributes: ClassAttributes::default(),
            },
        }
    }

    pub fn pool(&mut self) -> &mut ConstantPoolBuilder<'s> {
        &mut self.pool
    }

    pub fn version(&mut self, major: u16) -> &mut Self {
        self.class.version.major = major;
        self
    }

    pub fn access(&mut self, access_flags: ClassAccessFlags) -> &mut Self {
        self.class.access_flags = access_flags;
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        let index = self.pool.class(name);
        self.class.interfaces.push(index);
        self
    }

    /// Add a field, returning its position
    pub fn field(&mut self, access_flags: FieldAccessFlags, name: &str, descriptor: &str) -> usize {
        let name_index = self.pool.utf8(name);
        let descriptor_index = self.pool.utf8(descriptor);
        self.class.fields.push(FieldInfo {
            access_flags,
            name_index,
            descriptor_index,
            constant_value: None,
            signature: None,
            annotations: Annotations::default(),
            synthetic: false,
            deprecated: false,
        });
        self.class.fields.len() - 1
    }

    /// Add a method, returning its position
    pub fn method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        code: Option<Code>,
    ) -> usize {
        let name_index = self.pool.utf8(name);
        let descriptor_index = self.pool.utf8(descriptor);
        self.class
            .methods
            .push(MethodInfo::new(access_flags, name_index, descriptor_index, code));
        self.class.methods.len() - 1
    }

    pub fn method_mut(&mut self, index: usize) -> Option<&mut MethodInfo> {
        self.class.methods.get_mut(index)
    }

    pub fn source_file(&mut self, name: &str) -> &mut Self {
        let index = self.pool.utf8(name);
        self.class.attributes.source_file = Some(index);
        self
    }

    pub fn attributes_mut(&mut self) -> &mut ClassAttributes {
        &mut self.class.attributes
    }

    #[must_use]
    pub fn build(self) -> (ClassData, ConstantPool) {
        (self.class, self.pool.build())
    }
}

/// Emits bytecode. Branch offsets are given relative to the branch instruction.
#[derive(Debug, Default, Clone)]
pub struct CodeBuilder {
    code: Vec<u8>,
}
impl CodeBuilder {
    #[must_use]
    pub fn new() -> CodeBuilder {
        CodeBuilder::default()
    }

    /// The bci the next instruction will be at
    #[must_use]
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.code.push(opcode);
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    fn op_u16(&mut self, opcode: Opcode, operand: u16) -> &mut Self {
        self.code.push(opcode.raw());
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }

    fn local(&mut self, short: [Opcode; 4], long: Opcode, index: u8) -> &mut Self {
        match short.get(usize::from(index)) {
            Some(short) => self.op(short.raw()),
            None => self.op(long.raw()).op(index),
        }
    }

    pub fn aload(&mut self, index: u8) -> &mut Self {
        self.local(
            [Opcode::Aload0, Opcode::Aload1, Opcode::Aload2, Opcode::Aload3],
            Opcode::Aload,
            index,
        )
    }

    pub fn iload(&mut self, index: u8) -> &mut Self {
        self.local(
            [Opcode::Iload0, Opcode::Iload1, Opcode::Iload2, Opcode::Iload3],
            Opcode::Iload,
            index,
        )
    }

    pub fn astore(&mut self, index: u8) -> &mut Self {
        self.local(
            [Opcode::Astore0, Opcode::Astore1, Opcode::Astore2, Opcode::Astore3],
            Opcode::Astore,
            index,
        )
    }

    pub fn istore(&mut self, index: u8) -> &mut Self {
        self.local(
            [Opcode::Istore0, Opcode::Istore1, Opcode::Istore2, Opcode::Istore3],
            Opcode::Istore,
            index,
        )
    }

    /// Push an int using the shortest encoding that holds it without the pool
    ///
    /// # Panics
    /// If the value does not fit in a `sipush`
    pub fn iconst(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.op((i32::from(Opcode::Iconst0.raw()) + value) as u8),
            -128..=127 => self.op(Opcode::Bipush.raw()).op(value as i8 as u8),
            _ => {
                let value = i16::try_from(value).expect("iconst value too large for sipush");
                self.op_u16(Opcode::Sipush, value as u16)
            }
        }
    }

    /// `ldc`, or `ldc_w` if the index does not fit in a byte
    pub fn ldc(&mut self, index: PoolIndex) -> &mut Self {
        match u8::try_from(index) {
            Ok(index) => self.op(Opcode::Ldc.raw()).op(index),
            Err(_) => self.ldc_w(index),
        }
    }

    pub fn ldc_w(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::LdcW, index)
    }

    pub fn ldc2_w(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::Ldc2W, index)
    }

    pub fn getstatic(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::GetStatic, index)
    }

    pub fn putstatic(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::PutStatic, index)
    }

    pub fn getfield(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::GetField, index)
    }

    pub fn putfield(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::PutField, index)
    }

    pub fn invokevirtual(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::InvokeVirtual, index)
    }

    pub fn invokespecial(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::InvokeSpecial, index)
    }

    pub fn invokestatic(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::InvokeStatic, index)
    }

    /// `count` is the number of argument slots including the receiver
    pub fn invokeinterface(&mut self, index: PoolIndex, count: u8) -> &mut Self {
        self.op_u16(Opcode::InvokeInterface, index).op(count).op(0)
    }

    pub fn invokedynamic(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::InvokeDynamic, index).op(0).op(0)
    }

    pub fn new_object(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::New, index)
    }

    pub fn checkcast(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::CheckCast, index)
    }

    pub fn instanceof(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::InstanceOf, index)
    }

    pub fn anewarray(&mut self, index: PoolIndex) -> &mut Self {
        self.op_u16(Opcode::ANewArray, index)
    }

    pub fn multianewarray(&mut self, index: PoolIndex, dimensions: u8) -> &mut Self {
        self.op_u16(Opcode::MultiANewArray, index).op(dimensions)
    }

    /// Any two byte branch, such as `goto` or `ifeq`
    pub fn branch(&mut self, opcode: Opcode, offset: i16) -> &mut Self {
        self.op_u16(opcode, offset as u16)
    }

    pub fn goto(&mut self, offset: i16) -> &mut Self {
        self.branch(Opcode::Goto, offset)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.op(Opcode::Dup.raw())
    }

    pub fn pop(&mut self) -> &mut Self {
        self.op(Opcode::Pop.raw())
    }

    pub fn athrow(&mut self) -> &mut Self {
        self.op(Opcode::AThrow.raw())
    }

    pub fn ireturn(&mut self) -> &mut Self {
        self.op(Opcode::Ireturn.raw())
    }

    pub fn areturn(&mut self) -> &mut Self {
        self.op(Opcode::Areturn.raw())
    }

    /// `return`
    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Return.raw())
    }

    #[must_use]
    pub fn build(&self, max_stack: u16, max_locals: u16) -> Code {
        Code::new(max_stack, max_locals, self.code.clone())
    }
}
