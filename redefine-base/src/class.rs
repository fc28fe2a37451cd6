use crate::{
    access::{ClassAccessFlags, FieldAccessFlags, InnerClassAccessFlags, MethodAccessFlags},
    code::Code,
    constant_pool::{ConstantPool, ConstantPoolError, PoolIndex},
    symbol::Symbol,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClassFileVersion {
    pub major: u16,
    pub minor: u16,
}
impl ClassFileVersion {
    /// The first version which requires stack map tables
    pub const STACK_MAP_REQUIRED: u16 = 50;
}

/// The raw bodies of the annotation attributes. They hold pool indices throughout, so they are
/// kept as bytes and walked whenever they need remapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    pub visible: Option<Vec<u8>>,
    pub invisible: Option<Vec<u8>>,
    pub visible_type: Option<Vec<u8>>,
    pub invisible_type: Option<Vec<u8>>,
}
impl Annotations {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.visible.is_none()
            && self.invisible.is_none()
            && self.visible_type.is_none()
            && self.invisible_type.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerClassEntry {
    pub inner_class_info_index: PoolIndex,
    /// Zero if the class is not a member
    pub outer_class_info_index: PoolIndex,
    /// Zero if anonymous
    pub inner_name_index: PoolIndex,
    pub access_flags: InnerClassAccessFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosingMethod {
    pub class_index: PoolIndex,
    /// Zero if not enclosed by a method
    pub method_index: PoolIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordComponent {
    pub name_index: PoolIndex,
    pub descriptor_index: PoolIndex,
    pub signature: Option<PoolIndex>,
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassAttributes {
    pub source_file: Option<PoolIndex>,
    pub source_debug_extension: Option<Vec<u8>>,
    pub signature: Option<PoolIndex>,
    pub inner_classes: Option<Vec<InnerClassEntry>>,
    pub enclosing_method: Option<EnclosingMethod>,
    pub nest_host: Option<PoolIndex>,
    pub nest_members: Option<Vec<PoolIndex>>,
    pub permitted_subclasses: Option<Vec<PoolIndex>>,
    pub record: Option<Vec<RecordComponent>>,
    pub annotations: Annotations,
    pub synthetic: bool,
    pub deprecated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub access_flags: FieldAccessFlags,
    pub name_index: PoolIndex,
    pub descriptor_index: PoolIndex,
    pub constant_value: Option<PoolIndex>,
    pub signature: Option<PoolIndex>,
    pub annotations: Annotations,
    pub synthetic: bool,
    pub deprecated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodParameter {
    /// Zero if the parameter is unnamed
    pub name_index: PoolIndex,
    pub access_flags: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub access_flags: MethodAccessFlags,
    pub name_index: PoolIndex,
    pub descriptor_index: PoolIndex,
    pub code: Option<Code>,
    pub exceptions: Option<Vec<PoolIndex>>,
    pub signature: Option<PoolIndex>,
    pub method_parameters: Option<Vec<MethodParameter>>,
    pub annotations: Annotations,
    pub parameter_annotations_visible: Option<Vec<u8>>,
    pub parameter_annotations_invisible: Option<Vec<u8>>,
    pub annotation_default: Option<Vec<u8>>,
    pub synthetic: bool,
    pub deprecated: bool,
}
impl MethodInfo {
    #[must_use]
    pub fn new(
        access_flags: MethodAccessFlags,
        name_index: PoolIndex,
        descriptor_index: PoolIndex,
        code: Option<Code>,
    ) -> MethodInfo {
        MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            code,
            exceptions: None,
            signature: None,
            method_parameters: None,
            annotations: Annotations::default(),
            parameter_annotations_visible: None,
            parameter_annotations_invisible: None,
            annotation_default: None,
            synthetic: false,
            deprecated: false,
        }
    }

    pub fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a Symbol, ConstantPoolError> {
        pool.utf8_at(self.name_index)
    }

    pub fn descriptor<'a>(&self, pool: &'a ConstantPool) -> Result<&'a Symbol, ConstantPoolError> {
        pool.utf8_at(self.descriptor_index)
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::NATIVE)
    }
}

/// A parsed class, whose indices refer to the constant pool it was parsed alongside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassData {
    pub version: ClassFileVersion,
    pub access_flags: ClassAccessFlags,
    pub this_class: PoolIndex,
    /// `None` only for the root object class
    pub super_class: Option<PoolIndex>,
    pub interfaces: Vec<PoolIndex>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: ClassAttributes,
}
impl ClassData {
    pub fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a Symbol, ConstantPoolError> {
        pool.class_name_at(self.this_class)
    }

    pub fn super_name<'a>(
        &self,
        pool: &'a ConstantPool,
    ) -> Result<Option<&'a Symbol>, ConstantPoolError> {
        self.super_class
            .map(|index| pool.class_name_at(index))
            .transpose()
    }

    /// Find a method by name and descriptor
    #[must_use]
    pub fn find_method(&self, pool: &ConstantPool, name: &Symbol, descriptor: &Symbol) -> Option<usize> {
        self.methods.iter().position(|method| {
            method.name(pool).ok() == Some(name) && method.descriptor(pool).ok() == Some(descriptor)
        })
    }

    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(ClassAccessFlags::INTERFACE)
    }
}
