use byteorder::{BigEndian, ReadBytesExt};
use smallvec::SmallVec;

use super::{attribute, ClassFileError, MAGIC};
use crate::{
    access::{ClassAccessFlags, FieldAccessFlags, InnerClassAccessFlags, MethodAccessFlags},
    class::{
        Annotations, ClassAttributes, ClassData, ClassFileVersion, EnclosingMethod, FieldInfo,
        InnerClassEntry, MethodInfo, MethodParameter, RecordComponent,
    },
    code::{stack_map::StackMapTable, Code, ExceptionHandler, LineNumber, LocalVariable},
    constant_pool::{
        BootstrapSpecifier, ConstantEntry, ConstantPool, ConstantPoolError, ConstantTag,
        DynamicRef, MemberRef, PoolIndex, ReferenceKind,
    },
    symbol::{Symbol, SymbolTable},
};

type Data<'a> = &'a [u8];

fn take<'a>(data: &mut Data<'a>, len: usize) -> Result<&'a [u8], ClassFileError> {
    if data.len() < len {
        return Err(ClassFileError::Truncated);
    }
    let (taken, rest) = data.split_at(len);
    *data = rest;
    Ok(taken)
}

fn read_u16(data: &mut Data<'_>) -> Result<u16, ClassFileError> {
    Ok(data.read_u16::<BigEndian>()?)
}

fn read_u16_list(data: &mut Data<'_>) -> Result<Vec<u16>, ClassFileError> {
    let count = read_u16(data)?;
    if usize::from(count) * 2 > data.len() {
        return Err(ClassFileError::Truncated);
    }
    (0..count).map(|_| read_u16(data)).collect()
}

fn read_member(data: &mut Data<'_>) -> Result<MemberRef, ClassFileError> {
    Ok(MemberRef {
        class_index: read_u16(data)?,
        name_and_type_index: read_u16(data)?,
    })
}

fn read_dynamic(data: &mut Data<'_>) -> Result<DynamicRef, ClassFileError> {
    Ok(DynamicRef {
        bootstrap_index: read_u16(data)?,
        name_and_type_index: read_u16(data)?,
    })
}

/// Set an attribute slot, rejecting a second occurrence
fn set_once<T>(slot: &mut Option<T>, value: T, name: &'static str) -> Result<(), ClassFileError> {
    if slot.is_some() {
        return Err(ClassFileError::DuplicateAttribute { name });
    }
    *slot = Some(value);
    Ok(())
}

/// Run `parse` over an attribute body, requiring that it consumes all of it
fn parse_body<'a, T>(
    mut body: Data<'a>,
    name: &'static str,
    parse: impl FnOnce(&mut Data<'a>) -> Result<T, ClassFileError>,
) -> Result<T, ClassFileError> {
    let value = parse(&mut body).map_err(|err| match err {
        ClassFileError::Truncated => ClassFileError::AttributeLength { name },
        err => err,
    })?;
    if !body.is_empty() {
        return Err(ClassFileError::AttributeLength { name });
    }
    Ok(value)
}

fn single_index(body: Data<'_>, name: &'static str) -> Result<PoolIndex, ClassFileError> {
    parse_body(body, name, read_u16)
}

fn index_list(body: Data<'_>, name: &'static str) -> Result<Vec<PoolIndex>, ClassFileError> {
    parse_body(body, name, read_u16_list)
}

/// The attributes that hold annotations are kept as their raw bodies.
/// Returns whether the attribute was one of them.
fn annotation_attribute(
    annotations: &mut Annotations,
    name: &[u8],
    body: Data<'_>,
) -> Result<bool, ClassFileError> {
    let (slot, name) = match name {
        b"RuntimeVisibleAnnotations" => (
            &mut annotations.visible,
            attribute::RUNTIME_VISIBLE_ANNOTATIONS,
        ),
        b"RuntimeInvisibleAnnotations" => (
            &mut annotations.invisible,
            attribute::RUNTIME_INVISIBLE_ANNOTATIONS,
        ),
        b"RuntimeVisibleTypeAnnotations" => (
            &mut annotations.visible_type,
            attribute::RUNTIME_VISIBLE_TYPE_ANNOTATIONS,
        ),
        b"RuntimeInvisibleTypeAnnotations" => (
            &mut annotations.invisible_type,
            attribute::RUNTIME_INVISIBLE_TYPE_ANNOTATIONS,
        ),
        _ => return Ok(false),
    };
    set_once(slot, body.to_vec(), name)?;
    Ok(true)
}

fn skip_attribute(owner: &str, name: &[u8]) {
    tracing::trace!(
        "Skipping unhandled {} attribute {}",
        owner,
        String::from_utf8_lossy(name)
    );
}

/// Parses class files, interning their strings into a shared symbol table.
pub struct ClassFileReader<'s> {
    symbols: &'s SymbolTable,
}
impl<'s> ClassFileReader<'s> {
    #[must_use]
    pub fn new(symbols: &'s SymbolTable) -> ClassFileReader<'s> {
        ClassFileReader { symbols }
    }

    pub fn parse(&self, bytes: &[u8]) -> Result<(ClassData, ConstantPool), ClassFileError> {
        let mut data = bytes;
        let magic = data.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor = read_u16(&mut data)?;
        let major = read_u16(&mut data)?;

        let entries = self.parse_entries(&mut data)?;

        let access_flags = ClassAccessFlags::from_bits_truncate(read_u16(&mut data)?);
        let this_class = read_u16(&mut data)?;
        let super_class = match read_u16(&mut data)? {
            0 => None,
            index => Some(index),
        };
        let interfaces = read_u16_list(&mut data)?;

        let field_count = read_u16(&mut data)?;
        let mut fields = Vec::with_capacity(usize::from(field_count).min(data.len()));
        for _ in 0..field_count {
            fields.push(parse_field(&mut data, &entries)?);
        }

        let method_count = read_u16(&mut data)?;
        let mut methods = Vec::with_capacity(usize::from(method_count).min(data.len()));
        for _ in 0..method_count {
            methods.push(parse_method(&mut data, &entries)?);
        }

        let (attributes, operands) = parse_class_attributes(&mut data, &entries)?;

        if !data.is_empty() {
            return Err(ClassFileError::TrailingBytes);
        }

        let pool = ConstantPool::from_parts(entries, operands)?;
        pool.class_name_at(this_class)?;
        if let Some(super_class) = super_class {
            pool.class_name_at(super_class)?;
        }
        for &interface in &interfaces {
            pool.class_name_at(interface)?;
        }

        let class = ClassData {
            version: ClassFileVersion { major, minor },
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        Ok((class, pool))
    }

    fn parse_entries(&self, data: &mut Data<'_>) -> Result<Vec<ConstantEntry>, ClassFileError> {
        let count = read_u16(data)?;
        if count == 0 {
            return Err(ConstantPoolError::InvalidIndex { index: 0 }.into());
        }

        let mut entries = Vec::with_capacity(usize::from(count).min(data.len() + 1));
        entries.push(ConstantEntry::Invalid);
        while entries.len() < usize::from(count) {
            let index = entries.len() as PoolIndex;
            let tag = data.read_u8()?;
            let tag = ConstantTag::from_raw(tag)
                .ok_or(ClassFileError::UnknownConstantTag { index, tag })?;
            let entry = match tag {
                ConstantTag::Utf8 => {
                    let len = read_u16(data)?;
                    let bytes = take(data, usize::from(len))?;
                    ConstantEntry::Utf8(self.symbols.intern(bytes))
                }
                ConstantTag::Integer => ConstantEntry::Integer(data.read_i32::<BigEndian>()?),
                ConstantTag::Float => ConstantEntry::Float(data.read_u32::<BigEndian>()?),
                ConstantTag::Long => ConstantEntry::Long(data.read_i64::<BigEndian>()?),
                ConstantTag::Double => ConstantEntry::Double(data.read_u64::<BigEndian>()?),
                ConstantTag::Class => ConstantEntry::Class {
                    name_index: read_u16(data)?,
                },
                ConstantTag::String => ConstantEntry::String {
                    string_index: read_u16(data)?,
                },
                ConstantTag::FieldRef => ConstantEntry::FieldRef(read_member(data)?),
                ConstantTag::MethodRef => ConstantEntry::MethodRef(read_member(data)?),
                ConstantTag::InterfaceMethodRef => {
                    ConstantEntry::InterfaceMethodRef(read_member(data)?)
                }
                ConstantTag::NameAndType => ConstantEntry::NameAndType {
                    name_index: read_u16(data)?,
                    descriptor_index: read_u16(data)?,
                },
                ConstantTag::MethodHandle => {
                    let kind = data.read_u8()?;
                    let kind = ReferenceKind::from_raw(kind)
                        .ok_or(ClassFileError::BadReferenceKind { index, kind })?;
                    ConstantEntry::MethodHandle {
                        kind,
                        reference_index: read_u16(data)?,
                    }
                }
                ConstantTag::MethodType => ConstantEntry::MethodType {
                    descriptor_index: read_u16(data)?,
                },
                ConstantTag::Dynamic => ConstantEntry::Dynamic(read_dynamic(data)?),
                ConstantTag::InvokeDynamic => ConstantEntry::InvokeDynamic(read_dynamic(data)?),
            };

            let wide = entry.is_wide();
            entries.push(entry);
            if wide {
                if entries.len() >= usize::from(count) {
                    return Err(ConstantPoolError::MissingWideSlot { index }.into());
                }
                entries.push(ConstantEntry::Invalid);
            }
        }

        Ok(entries)
    }
}

/// The name of an attribute, which must be a Utf8 entry. The pool has not been validated yet so
/// this looks at the raw entries.
fn utf8_entry(entries: &[ConstantEntry], index: PoolIndex) -> Result<&Symbol, ClassFileError> {
    match entries.get(usize::from(index)) {
        Some(ConstantEntry::Utf8(symbol)) => Ok(symbol),
        Some(entry) => Err(ConstantPoolError::BadTag {
            index,
            expected: "Utf8",
            found: entry.tag(),
        }
        .into()),
        None => Err(ConstantPoolError::InvalidIndex { index }.into()),
    }
}

/// Read every attribute header in a table, passing the name and body of each to `handle`
fn for_each_attribute<'a>(
    data: &mut Data<'a>,
    entries: &[ConstantEntry],
    mut handle: impl FnMut(&[u8], Data<'a>) -> Result<(), ClassFileError>,
) -> Result<(), ClassFileError> {
    let count = read_u16(data)?;
    for _ in 0..count {
        let name = utf8_entry(entries, read_u16(data)?)?;
        let len = data.read_u32::<BigEndian>()?;
        let len = usize::try_from(len).map_err(|_| ClassFileError::Truncated)?;
        let body = take(data, len)?;
        handle(name.as_bytes(), body)?;
    }
    Ok(())
}

fn parse_field(data: &mut Data<'_>, entries: &[ConstantEntry]) -> Result<FieldInfo, ClassFileError> {
    let mut field = FieldInfo {
        access_flags: FieldAccessFlags::from_bits_truncate(read_u16(data)?),
        name_index: read_u16(data)?,
        descriptor_index: read_u16(data)?,
        constant_value: None,
        signature: None,
        annotations: Annotations::default(),
        synthetic: false,
        deprecated: false,
    };
    utf8_entry(entries, field.name_index)?;
    utf8_entry(entries, field.descriptor_index)?;

    for_each_attribute(data, entries, |name, body| {
        match name {
            b"ConstantValue" => set_once(
                &mut field.constant_value,
                single_index(body, attribute::CONSTANT_VALUE)?,
                attribute::CONSTANT_VALUE,
            )?,
            b"Signature" => set_once(
                &mut field.signature,
                single_index(body, attribute::SIGNATURE)?,
                attribute::SIGNATURE,
            )?,
            b"Synthetic" => field.synthetic = true,
            b"Deprecated" => field.deprecated = true,
            _ => {
                if !annotation_attribute(&mut field.annotations, name, body)? {
                    skip_attribute("field", name);
                }
            }
        }
        Ok(())
    })?;

    Ok(field)
}

fn parse_method(
    data: &mut Data<'_>,
    entries: &[ConstantEntry],
) -> Result<MethodInfo, ClassFileError> {
    let access_flags = MethodAccessFlags::from_bits_truncate(read_u16(data)?);
    let name_index = read_u16(data)?;
    let descriptor_index = read_u16(data)?;
    utf8_entry(entries, name_index)?;
    utf8_entry(entries, descriptor_index)?;
    let mut method = MethodInfo::new(access_flags, name_index, descriptor_index, None);

    for_each_attribute(data, entries, |name, body| {
        match name {
            b"Code" => set_once(
                &mut method.code,
                parse_body(body, attribute::CODE, |body| parse_code(body, entries))?,
                attribute::CODE,
            )?,
            b"Exceptions" => set_once(
                &mut method.exceptions,
                index_list(body, attribute::EXCEPTIONS)?,
                attribute::EXCEPTIONS,
            )?,
            b"Signature" => set_once(
                &mut method.signature,
                single_index(body, attribute::SIGNATURE)?,
                attribute::SIGNATURE,
            )?,
            b"MethodParameters" => {
                let parameters = parse_body(body, attribute::METHOD_PARAMETERS, |body| {
                    let count = body.read_u8()?;
                    (0..count)
                        .map(|_| {
                            Ok(MethodParameter {
                                name_index: read_u16(body)?,
                                access_flags: read_u16(body)?,
                            })
                        })
                        .collect::<Result<Vec<_>, ClassFileError>>()
                })?;
                set_once(
                    &mut method.method_parameters,
                    parameters,
                    attribute::METHOD_PARAMETERS,
                )?;
            }
            b"RuntimeVisibleParameterAnnotations" => set_once(
                &mut method.parameter_annotations_visible,
                body.to_vec(),
                attribute::RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS,
            )?,
            b"RuntimeInvisibleParameterAnnotations" => set_once(
                &mut method.parameter_annotations_invisible,
                body.to_vec(),
                attribute::RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS,
            )?,
            b"AnnotationDefault" => set_once(
                &mut method.annotation_default,
                body.to_vec(),
                attribute::ANNOTATION_DEFAULT,
            )?,
            b"Synthetic" => method.synthetic = true,
            b"Deprecated" => method.deprecated = true,
            _ => {
                if !annotation_attribute(&mut method.annotations, name, body)? {
                    skip_attribute("method", name);
                }
            }
        }
        Ok(())
    })?;

    Ok(method)
}

fn parse_local_variables(body: &mut Data<'_>) -> Result<Vec<LocalVariable>, ClassFileError> {
    let count = read_u16(body)?;
    (0..count)
        .map(|_| {
            Ok(LocalVariable {
                start_pc: read_u16(body)?,
                length: read_u16(body)?,
                name_index: read_u16(body)?,
                descriptor_index: read_u16(body)?,
                index: read_u16(body)?,
            })
        })
        .collect()
}

fn parse_code(data: &mut Data<'_>, entries: &[ConstantEntry]) -> Result<Code, ClassFileError> {
    let max_stack = read_u16(data)?;
    let max_locals = read_u16(data)?;
    let code_length = data.read_u32::<BigEndian>()?;
    if code_length == 0 || code_length > u32::from(u16::MAX) {
        return Err(ClassFileError::CodeLength(code_length));
    }
    let bytecode = take(data, code_length as usize)?.to_vec();
    let mut code = Code::new(max_stack, max_locals, bytecode);

    let handler_count = read_u16(data)?;
    for _ in 0..handler_count {
        code.exception_table.push(ExceptionHandler {
            start_pc: read_u16(data)?,
            end_pc: read_u16(data)?,
            handler_pc: read_u16(data)?,
            catch_type: read_u16(data)?,
        });
    }

    for_each_attribute(data, entries, |name, body| {
        match name {
            b"StackMapTable" => set_once(
                &mut code.stack_map,
                StackMapTable::parse(body)?,
                attribute::STACK_MAP_TABLE,
            )?,
            // Compilers may split these tables across several attributes
            b"LineNumberTable" => {
                let lines = parse_body(body, attribute::LINE_NUMBER_TABLE, |body| {
                    let count = read_u16(body)?;
                    (0..count)
                        .map(|_| {
                            Ok(LineNumber {
                                start_pc: read_u16(body)?,
                                line_number: read_u16(body)?,
                            })
                        })
                        .collect::<Result<Vec<_>, ClassFileError>>()
                })?;
                code.line_numbers.get_or_insert_with(Vec::new).extend(lines);
            }
            b"LocalVariableTable" => {
                let vars = parse_body(body, attribute::LOCAL_VARIABLE_TABLE, parse_local_variables)?;
                code.local_variables.get_or_insert_with(Vec::new).extend(vars);
            }
            b"LocalVariableTypeTable" => {
                let vars = parse_body(
                    body,
                    attribute::LOCAL_VARIABLE_TYPE_TABLE,
                    parse_local_variables,
                )?;
                code.local_variable_types
                    .get_or_insert_with(Vec::new)
                    .extend(vars);
            }
            _ => skip_attribute("code", name),
        }
        Ok(())
    })?;

    Ok(code)
}

fn parse_record_component(
    data: &mut Data<'_>,
    entries: &[ConstantEntry],
) -> Result<RecordComponent, ClassFileError> {
    let mut component = RecordComponent {
        name_index: read_u16(data)?,
        descriptor_index: read_u16(data)?,
        signature: None,
        annotations: Annotations::default(),
    };
    for_each_attribute(data, entries, |name, body| {
        if name == b"Signature" {
            set_once(
                &mut component.signature,
                single_index(body, attribute::SIGNATURE)?,
                attribute::SIGNATURE,
            )?;
        } else if !annotation_attribute(&mut component.annotations, name, body)? {
            skip_attribute("record component", name);
        }
        Ok(())
    })?;
    Ok(component)
}

fn parse_class_attributes(
    data: &mut Data<'_>,
    entries: &[ConstantEntry],
) -> Result<(ClassAttributes, Vec<BootstrapSpecifier>), ClassFileError> {
    let mut attributes = ClassAttributes::default();
    let mut operands: Option<Vec<BootstrapSpecifier>> = None;

    for_each_attribute(data, entries, |name, body| {
        match name {
            b"SourceFile" => set_once(
                &mut attributes.source_file,
                single_index(body, attribute::SOURCE_FILE)?,
                attribute::SOURCE_FILE,
            )?,
            b"SourceDebugExtension" => set_once(
                &mut attributes.source_debug_extension,
                body.to_vec(),
                attribute::SOURCE_DEBUG_EXTENSION,
            )?,
            b"Signature" => set_once(
                &mut attributes.signature,
                single_index(body, attribute::SIGNATURE)?,
                attribute::SIGNATURE,
            )?,
            b"InnerClasses" => {
                let classes = parse_body(body, attribute::INNER_CLASSES, |body| {
                    let count = read_u16(body)?;
                    (0..count)
                        .map(|_| {
                            Ok(InnerClassEntry {
                                inner_class_info_index: read_u16(body)?,
                                outer_class_info_index: read_u16(body)?,
                                inner_name_index: read_u16(body)?,
                                access_flags: InnerClassAccessFlags::from_bits_truncate(
                                    read_u16(body)?,
                                ),
                            })
                        })
                        .collect::<Result<Vec<_>, ClassFileError>>()
                })?;
                set_once(&mut attributes.inner_classes, classes, attribute::INNER_CLASSES)?;
            }
            b"EnclosingMethod" => {
                let enclosing = parse_body(body, attribute::ENCLOSING_METHOD, |body| {
                    Ok(EnclosingMethod {
                        class_index: read_u16(body)?,
                        method_index: read_u16(body)?,
                    })
                })?;
                set_once(
                    &mut attributes.enclosing_method,
                    enclosing,
                    attribute::ENCLOSING_METHOD,
                )?;
            }
            b"NestHost" => set_once(
                &mut attributes.nest_host,
                single_index(body, attribute::NEST_HOST)?,
                attribute::NEST_HOST,
            )?,
            b"NestMembers" => set_once(
                &mut attributes.nest_members,
                index_list(body, attribute::NEST_MEMBERS)?,
                attribute::NEST_MEMBERS,
            )?,
            b"PermittedSubclasses" => set_once(
                &mut attributes.permitted_subclasses,
                index_list(body, attribute::PERMITTED_SUBCLASSES)?,
                attribute::PERMITTED_SUBCLASSES,
            )?,
            b"Record" => {
                let components = parse_body(body, attribute::RECORD, |body| {
                    let count = read_u16(body)?;
                    (0..count)
                        .map(|_| parse_record_component(body, entries))
                        .collect::<Result<Vec<_>, ClassFileError>>()
                })?;
                set_once(&mut attributes.record, components, attribute::RECORD)?;
            }
            b"BootstrapMethods" => {
                let specifiers = parse_body(body, attribute::BOOTSTRAP_METHODS, |body| {
                    let count = read_u16(body)?;
                    (0..count)
                        .map(|_| {
                            let method_handle_index = read_u16(body)?;
                            let arguments: SmallVec<[PoolIndex; 4]> =
                                read_u16_list(body)?.into_iter().collect();
                            Ok(BootstrapSpecifier {
                                method_handle_index,
                                arguments,
                            })
                        })
                        .collect::<Result<Vec<_>, ClassFileError>>()
                })?;
                set_once(&mut operands, specifiers, attribute::BOOTSTRAP_METHODS)?;
            }
            b"Synthetic" => attributes.synthetic = true,
            b"Deprecated" => attributes.deprecated = true,
            _ => {
                if !annotation_attribute(&mut attributes.annotations, name, body)? {
                    skip_attribute("class", name);
                }
            }
        }
        Ok(())
    })?;

    Ok((attributes, operands.unwrap_or_default()))
}
