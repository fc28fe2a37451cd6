use std::{collections::HashMap, io::Write};

use byteorder::{BigEndian, WriteBytesExt};

use super::{attribute, ClassFileError, MAGIC};
use crate::{
    class::{Annotations, ClassData, FieldInfo, MethodInfo, RecordComponent},
    code::{Code, LocalVariable},
    constant_pool::{ConstantEntry, ConstantPool, ConstantPoolError, PoolIndex},
    symbol::SymbolTable,
};

type Result<T> = std::io::Result<T>;

/// Serializing data inside class files: tags are `u8`, and sequences are almost always prefixed
/// by a `u16` length.
trait Serialize {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;
}

impl Serialize for u16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(*self)
    }
}

impl<A: Serialize> Serialize for [A] {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u16).serialize(writer)?;
        for elem in self {
            elem.serialize(writer)?;
        }
        Ok(())
    }
}

impl Serialize for ConstantEntry {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        let tag = match self.tag() {
            Some(tag) => tag.raw(),
            // Placeholder slots are not written
            None => return Ok(()),
        };
        writer.write_u8(tag)?;
        match self {
            ConstantEntry::Invalid => {}
            ConstantEntry::Utf8(symbol) => {
                (symbol.len() as u16).serialize(writer)?;
                writer.write_all(symbol.as_bytes())?;
            }
            ConstantEntry::Integer(value) => writer.write_i32::<BigEndian>(*value)?,
            ConstantEntry::Float(bits) => writer.write_u32::<BigEndian>(*bits)?,
            ConstantEntry::Long(value) => writer.write_i64::<BigEndian>(*value)?,
            ConstantEntry::Double(bits) => writer.write_u64::<BigEndian>(*bits)?,
            ConstantEntry::Class { name_index } => name_index.serialize(writer)?,
            ConstantEntry::String { string_index } => string_index.serialize(writer)?,
            ConstantEntry::FieldRef(member)
            | ConstantEntry::MethodRef(member)
            | ConstantEntry::InterfaceMethodRef(member) => {
                member.class_index.serialize(writer)?;
                member.name_and_type_index.serialize(writer)?;
            }
            ConstantEntry::NameAndType {
                name_index,
                descriptor_index,
            } => {
                name_index.serialize(writer)?;
                descriptor_index.serialize(writer)?;
            }
            ConstantEntry::MethodHandle {
                kind,
                reference_index,
            } => {
                writer.write_u8(kind.raw())?;
                reference_index.serialize(writer)?;
            }
            ConstantEntry::MethodType { descriptor_index } => descriptor_index.serialize(writer)?,
            ConstantEntry::Dynamic(dynamic) | ConstantEntry::InvokeDynamic(dynamic) => {
                dynamic.bootstrap_index.serialize(writer)?;
                dynamic.name_and_type_index.serialize(writer)?;
            }
        }
        Ok(())
    }
}

impl Serialize for LocalVariable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.start_pc.serialize(writer)?;
        self.length.serialize(writer)?;
        self.name_index.serialize(writer)?;
        self.descriptor_index.serialize(writer)?;
        self.index.serialize(writer)
    }
}

/// Finds or adds the Utf8 entries naming each attribute
struct AttributeNames<'a> {
    pool: &'a mut ConstantPool,
    symbols: &'a SymbolTable,
    cache: HashMap<&'static str, PoolIndex>,
}
impl<'a> AttributeNames<'a> {
    fn get(&mut self, name: &'static str) -> std::result::Result<PoolIndex, ConstantPoolError> {
        if let Some(index) = self.cache.get(name) {
            return Ok(*index);
        }

        let existing = self.pool.iter().find_map(|(index, entry)| match entry {
            ConstantEntry::Utf8(symbol) if symbol.as_bytes() == name.as_bytes() => Some(index),
            _ => None,
        });
        let index = match existing {
            Some(index) => index,
            None => self
                .pool
                .push(ConstantEntry::Utf8(self.symbols.intern_str(name)))?,
        };
        self.cache.insert(name, index);
        Ok(index)
    }
}

/// An attribute table being built up
#[derive(Default)]
struct Attributes {
    count: u16,
    data: Vec<u8>,
}
impl Attributes {
    fn push(&mut self, name_index: PoolIndex, body: &[u8]) -> Result<()> {
        self.count += 1;
        name_index.serialize(&mut self.data)?;
        self.data.write_u32::<BigEndian>(body.len() as u32)?;
        self.data.write_all(body)
    }

    fn finish<W: WriteBytesExt>(self, writer: &mut W) -> Result<()> {
        self.count.serialize(writer)?;
        writer.write_all(&self.data)
    }
}

/// Writes class files. Attribute names missing from the pool are appended to a copy of it.
pub struct ClassFileWriter<'s> {
    symbols: &'s SymbolTable,
}
impl<'s> ClassFileWriter<'s> {
    #[must_use]
    pub fn new(symbols: &'s SymbolTable) -> ClassFileWriter<'s> {
        ClassFileWriter { symbols }
    }

    pub fn write(
        &self,
        class: &ClassData,
        pool: &ConstantPool,
    ) -> std::result::Result<Vec<u8>, ClassFileError> {
        let mut pool = pool.clone();
        let mut names = AttributeNames {
            pool: &mut pool,
            symbols: self.symbols,
            cache: HashMap::new(),
        };

        // Everything after the pool is written first, since it may add entries to the pool
        let mut body = Vec::new();
        class.access_flags.bits().serialize(&mut body)?;
        class.this_class.serialize(&mut body)?;
        class.super_class.unwrap_or(0).serialize(&mut body)?;
        class.interfaces.serialize(&mut body)?;

        (class.fields.len() as u16).serialize(&mut body)?;
        for field in &class.fields {
            write_field(&mut body, field, &mut names)?;
        }

        (class.methods.len() as u16).serialize(&mut body)?;
        for method in &class.methods {
            write_method(&mut body, method, &mut names)?;
        }

        write_class_attributes(&mut body, class, &mut names)?;

        let mut out = Vec::with_capacity(body.len() + 1024);
        out.write_u32::<BigEndian>(MAGIC)?;
        class.version.minor.serialize(&mut out)?;
        class.version.major.serialize(&mut out)?;
        pool.count().serialize(&mut out)?;
        for entry in pool.entries().iter().skip(1) {
            entry.serialize(&mut out)?;
        }
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn index_body(index: PoolIndex) -> Vec<u8> {
    index.to_be_bytes().to_vec()
}

fn list_body(indices: &[PoolIndex]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(2 + indices.len() * 2);
    indices.serialize(&mut body)?;
    Ok(body)
}

fn push_annotations(
    attributes: &mut Attributes,
    annotations: &Annotations,
    names: &mut AttributeNames<'_>,
) -> std::result::Result<(), ClassFileError> {
    let all = [
        (attribute::RUNTIME_VISIBLE_ANNOTATIONS, &annotations.visible),
        (attribute::RUNTIME_INVISIBLE_ANNOTATIONS, &annotations.invisible),
        (
            attribute::RUNTIME_VISIBLE_TYPE_ANNOTATIONS,
            &annotations.visible_type,
        ),
        (
            attribute::RUNTIME_INVISIBLE_TYPE_ANNOTATIONS,
            &annotations.invisible_type,
        ),
    ];
    for (name, body) in all {
        if let Some(body) = body {
            attributes.push(names.get(name)?, body)?;
        }
    }
    Ok(())
}

fn push_flags(
    attributes: &mut Attributes,
    synthetic: bool,
    deprecated: bool,
    names: &mut AttributeNames<'_>,
) -> std::result::Result<(), ClassFileError> {
    if synthetic {
        attributes.push(names.get(attribute::SYNTHETIC)?, &[])?;
    }
    if deprecated {
        attributes.push(names.get(attribute::DEPRECATED)?, &[])?;
    }
    Ok(())
}

fn write_field(
    out: &mut Vec<u8>,
    field: &FieldInfo,
    names: &mut AttributeNames<'_>,
) -> std::result::Result<(), ClassFileError> {
    field.access_flags.bits().serialize(out)?;
    field.name_index.serialize(out)?;
    field.descriptor_index.serialize(out)?;

    let mut attributes = Attributes::default();
    if let Some(value) = field.constant_value {
        attributes.push(names.get(attribute::CONSTANT_VALUE)?, &index_body(value))?;
    }
    if let Some(signature) = field.signature {
        attributes.push(names.get(attribute::SIGNATURE)?, &index_body(signature))?;
    }
    push_flags(&mut attributes, field.synthetic, field.deprecated, names)?;
    push_annotations(&mut attributes, &field.annotations, names)?;
    attributes.finish(out)?;
    Ok(())
}

fn write_code(
    code: &Code,
    names: &mut AttributeNames<'_>,
) -> std::result::Result<Vec<u8>, ClassFileError> {
    let mut body = Vec::with_capacity(code.bytecode.len() + 32);
    code.max_stack.serialize(&mut body)?;
    code.max_locals.serialize(&mut body)?;
    body.write_u32::<BigEndian>(code.bytecode.len() as u32)?;
    body.write_all(&code.bytecode)?;

    (code.exception_table.len() as u16).serialize(&mut body)?;
    for handler in &code.exception_table {
        handler.start_pc.serialize(&mut body)?;
        handler.end_pc.serialize(&mut body)?;
        handler.handler_pc.serialize(&mut body)?;
        handler.catch_type.serialize(&mut body)?;
    }

    let mut attributes = Attributes::default();
    if let Some(stack_map) = &code.stack_map {
        attributes.push(
            names.get(attribute::STACK_MAP_TABLE)?,
            &stack_map.serialize(),
        )?;
    }
    if let Some(lines) = &code.line_numbers {
        let mut table = Vec::with_capacity(2 + lines.len() * 4);
        (lines.len() as u16).serialize(&mut table)?;
        for line in lines {
            line.start_pc.serialize(&mut table)?;
            line.line_number.serialize(&mut table)?;
        }
        attributes.push(names.get(attribute::LINE_NUMBER_TABLE)?, &table)?;
    }
    for (name, vars) in [
        (attribute::LOCAL_VARIABLE_TABLE, &code.local_variables),
        (
            attribute::LOCAL_VARIABLE_TYPE_TABLE,
            &code.local_variable_types,
        ),
    ] {
        if let Some(vars) = vars {
            let mut table = Vec::with_capacity(2 + vars.len() * 10);
            vars.serialize(&mut table)?;
            attributes.push(names.get(name)?, &table)?;
        }
    }
    attributes.finish(&mut body)?;

    Ok(body)
}

fn write_method(
    out: &mut Vec<u8>,
    method: &MethodInfo,
    names: &mut AttributeNames<'_>,
) -> std::result::Result<(), ClassFileError> {
    method.access_flags.bits().serialize(out)?;
    method.name_index.serialize(out)?;
    method.descriptor_index.serialize(out)?;

    let mut attributes = Attributes::default();
    if let Some(code) = &method.code {
        let body = write_code(code, names)?;
        attributes.push(names.get(attribute::CODE)?, &body)?;
    }
    if let Some(exceptions) = &method.exceptions {
        attributes.push(names.get(attribute::EXCEPTIONS)?, &list_body(exceptions)?)?;
    }
    if let Some(signature) = method.signature {
        attributes.push(names.get(attribute::SIGNATURE)?, &index_body(signature))?;
    }
    if let Some(parameters) = &method.method_parameters {
        let mut body = vec![parameters.len() as u8];
        for parameter in parameters {
            parameter.name_index.serialize(&mut body)?;
            parameter.access_flags.serialize(&mut body)?;
        }
        attributes.push(names.get(attribute::METHOD_PARAMETERS)?, &body)?;
    }
    push_flags(&mut attributes, method.synthetic, method.deprecated, names)?;
    push_annotations(&mut attributes, &method.annotations, names)?;
    for (name, body) in [
        (
            attribute::RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS,
            &method.parameter_annotations_visible,
        ),
        (
            attribute::RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS,
            &method.parameter_annotations_invisible,
        ),
        (attribute::ANNOTATION_DEFAULT, &method.annotation_default),
    ] {
        if let Some(body) = body {
            attributes.push(names.get(name)?, body)?;
        }
    }
    attributes.finish(out)?;
    Ok(())
}

fn write_record_component(
    out: &mut Vec<u8>,
    component: &RecordComponent,
    names: &mut AttributeNames<'_>,
) -> std::result::Result<(), ClassFileError> {
    component.name_index.serialize(out)?;
    component.descriptor_index.serialize(out)?;
    let mut attributes = Attributes::default();
    if let Some(signature) = component.signature {
        attributes.push(names.get(attribute::SIGNATURE)?, &index_body(signature))?;
    }
    push_annotations(&mut attributes, &component.annotations, names)?;
    attributes.finish(out)?;
    Ok(())
}

fn write_class_attributes(
    out: &mut Vec<u8>,
    class: &ClassData,
    names: &mut AttributeNames<'_>,
) -> std::result::Result<(), ClassFileError> {
    let attrs = &class.attributes;
    let mut attributes = Attributes::default();

    if let Some(source_file) = attrs.source_file {
        attributes.push(names.get(attribute::SOURCE_FILE)?, &index_body(source_file))?;
    }
    if let Some(extension) = &attrs.source_debug_extension {
        attributes.push(names.get(attribute::SOURCE_DEBUG_EXTENSION)?, extension)?;
    }
    if let Some(signature) = attrs.signature {
        attributes.push(names.get(attribute::SIGNATURE)?, &index_body(signature))?;
    }
    if let Some(inner_classes) = &attrs.inner_classes {
        let mut body = Vec::with_capacity(2 + inner_classes.len() * 8);
        (inner_classes.len() as u16).serialize(&mut body)?;
        for entry in inner_classes {
            entry.inner_class_info_index.serialize(&mut body)?;
            entry.outer_class_info_index.serialize(&mut body)?;
            entry.inner_name_index.serialize(&mut body)?;
            entry.access_flags.bits().serialize(&mut body)?;
        }
        attributes.push(names.get(attribute::INNER_CLASSES)?, &body)?;
    }
    if let Some(enclosing) = attrs.enclosing_method {
        let mut body = Vec::with_capacity(4);
        enclosing.class_index.serialize(&mut body)?;
        enclosing.method_index.serialize(&mut body)?;
        attributes.push(names.get(attribute::ENCLOSING_METHOD)?, &body)?;
    }
    if let Some(host) = attrs.nest_host {
        attributes.push(names.get(attribute::NEST_HOST)?, &index_body(host))?;
    }
    if let Some(members) = &attrs.nest_members {
        attributes.push(names.get(attribute::NEST_MEMBERS)?, &list_body(members)?)?;
    }
    if let Some(permitted) = &attrs.permitted_subclasses {
        attributes.push(
            names.get(attribute::PERMITTED_SUBCLASSES)?,
            &list_body(permitted)?,
        )?;
    }
    if let Some(components) = &attrs.record {
        let mut body = Vec::new();
        (components.len() as u16).serialize(&mut body)?;
        for component in components {
            write_record_component(&mut body, component, names)?;
        }
        attributes.push(names.get(attribute::RECORD)?, &body)?;
    }
    push_flags(&mut attributes, attrs.synthetic, attrs.deprecated, names)?;
    push_annotations(&mut attributes, &attrs.annotations, names)?;

    // The bootstrap methods live in the pool's operands, but are written as a class attribute
    let operands = names.pool.operands().to_vec();
    if !operands.is_empty() {
        let mut body = Vec::new();
        (operands.len() as u16).serialize(&mut body)?;
        for specifier in &operands {
            specifier.method_handle_index.serialize(&mut body)?;
            specifier.arguments.as_slice().serialize(&mut body)?;
        }
        attributes.push(names.get(attribute::BOOTSTRAP_METHODS)?, &body)?;
    }

    attributes.finish(out)?;
    Ok(())
}
