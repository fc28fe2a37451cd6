//! Rewriting a candidate class so that its indices address the merged constant pool.
//!
//! This is the symbolic pass: indices stay big-endian pool indices. Linking to the call site
//! cache is a separate pass, see [`link`].

use byteorder::{BigEndian, ByteOrder};
use redefine_base::{
    class::Annotations,
    code::{
        op::{Opcode, OperandKind},
        relocate::{relocate, RelocationError, Replacement},
        stack_map::VerificationType,
        stream::Instruction,
        Code,
    },
    class_file::ClassFileError,
    ClassData, PoolIndex,
};
use smallvec::SmallVec;

use crate::{error::RedefineError, translation::TranslationMap};

pub(crate) mod annotations;
pub mod link;

use annotations::{
    remap_annotations, remap_element_value, remap_parameter_annotations, remap_type_annotations,
};

/// What rewriting did that remapping alone can't undo
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteJournal {
    /// For each method, the positions of `ldc` instructions that became `ldc_w`, in the
    /// rewritten code
    widened: Vec<SmallVec<[usize; 2]>>,
}
impl RewriteJournal {
    #[must_use]
    pub fn widened(&self, method: usize) -> &[usize] {
        self.widened.get(method).map_or(&[], SmallVec::as_slice)
    }

    #[must_use]
    pub fn widened_count(&self) -> usize {
        self.widened.iter().map(SmallVec::len).sum()
    }
}

/// Rewrite every pool index in `class` through `map`.
/// An `ldc` whose constant moved past the one byte range is widened to `ldc_w`, and the method's
/// code is relocated around it.
pub fn rewrite_class(
    class: &mut ClassData,
    map: &TranslationMap,
) -> Result<RewriteJournal, RedefineError> {
    let mut journal = RewriteJournal {
        widened: vec![SmallVec::new(); class.methods.len()],
    };
    if map.is_empty() {
        tracing::trace!("Nothing moved, so there is nothing to rewrite");
        return Ok(journal);
    }

    let remap = |index| map.find_new_index(index);
    remap_class_indices(class, &remap)?;

    for (method, widened) in class.methods.iter_mut().zip(journal.widened.iter_mut()) {
        if let Some(code) = &mut method.code {
            *widened = rewrite_code(code, map)?;
        }
    }

    Ok(journal)
}

/// Undo [`rewrite_class`], given the inverse of the map it was rewritten with
pub fn unrewrite_class(
    class: &mut ClassData,
    inverse: &TranslationMap,
    journal: &RewriteJournal,
) -> Result<(), RedefineError> {
    let remap = |index| inverse.find_new_index(index);
    remap_class_indices(class, &remap)?;

    for (i, method) in class.methods.iter_mut().enumerate() {
        if let Some(code) = &mut method.code {
            unrewrite_code(code, inverse, journal.widened(i))?;
        }
    }

    Ok(())
}

pub(crate) fn decode(code: &Code) -> Result<Vec<Instruction>, RedefineError> {
    code.decode()
        .map_err(|err| RedefineError::from(RelocationError::Parse(err)))
}

/// Rewrite the pool indices in a method's code.
/// Returns where any widened `ldc` instructions ended up.
fn rewrite_code(
    code: &mut Code,
    map: &TranslationMap,
) -> Result<SmallVec<[usize; 2]>, RedefineError> {
    let insts = decode(code)?;

    let mut replacements = Vec::new();
    for inst in &insts {
        match inst.opcode.operand() {
            OperandKind::ConstantByte => {
                let at = inst.operand_start();
                let old = PoolIndex::from(code.bytecode[at]);
                let new = map.find_new_index(old);
                if new == old {
                    continue;
                }

                if let Ok(new) = u8::try_from(new) {
                    code.bytecode[at] = new;
                } else {
                    tracing::trace!("widening ldc #{} at {} to ldc_w #{}", old, inst.bci, new);
                    let [high, low] = new.to_be_bytes();
                    replacements.push(Replacement::new(
                        inst.bci,
                        vec![Opcode::LdcW.raw(), high, low],
                    ));
                }
            }
            kind if kind.has_pool_index() => {
                remap_operand(&mut code.bytecode, inst, |index| map.find_new_index(index));
            }
            _ => {}
        }
    }

    remap_code_tables(code, &|index| map.find_new_index(index));

    if replacements.is_empty() {
        return Ok(SmallVec::new());
    }

    let positions: SmallVec<[usize; 2]> = replacements.iter().map(|r| r.bci).collect();
    let (relocated, bci_map) = relocate(code, replacements)?;
    *code = relocated;

    positions
        .into_iter()
        .map(|bci| {
            bci_map.get(bci).ok_or_else(|| {
                RedefineError::InternalInvariantViolation(format!(
                    "widened ldc at {} has no new position",
                    bci
                ))
            })
        })
        .collect()
}

fn unrewrite_code(
    code: &mut Code,
    inverse: &TranslationMap,
    widened: &[usize],
) -> Result<(), RedefineError> {
    let insts = decode(code)?;

    for inst in &insts {
        match inst.opcode.operand() {
            OperandKind::ConstantByte => {
                let at = inst.operand_start();
                let new = PoolIndex::from(code.bytecode[at]);
                let old = inverse.find_new_index(new);
                code.bytecode[at] = u8::try_from(old).map_err(|_| {
                    RedefineError::InternalInvariantViolation(format!(
                        "ldc at {} would need index #{}",
                        inst.bci, old
                    ))
                })?;
            }
            kind if kind.has_pool_index() => {
                remap_operand(&mut code.bytecode, inst, |index| inverse.find_new_index(index));
            }
            _ => {}
        }
    }

    remap_code_tables(code, &|index| inverse.find_new_index(index));

    if widened.is_empty() {
        return Ok(());
    }

    // The widened instructions already hold their original index, as an ldc_w
    let mut replacements = Vec::with_capacity(widened.len());
    for &bci in widened {
        let narrow = match code.bytecode.get(bci..bci + 3) {
            Some(&[op, high, low]) if op == Opcode::LdcW.raw() => {
                u8::try_from(u16::from_be_bytes([high, low])).ok()
            }
            _ => None,
        };
        let narrow = narrow.ok_or_else(|| {
            RedefineError::InternalInvariantViolation(format!(
                "no ldc_w to narrow at {}",
                bci
            ))
        })?;
        replacements.push(Replacement::new(bci, vec![Opcode::Ldc.raw(), narrow]));
    }

    let (relocated, _) = relocate(code, replacements)?;
    *code = relocated;
    Ok(())
}

/// Rewrite the two byte big-endian pool index of an instruction
fn remap_operand(bytecode: &mut [u8], inst: &Instruction, map: impl Fn(PoolIndex) -> PoolIndex) {
    let at = inst.operand_start();
    let operand = &mut bytecode[at..at + 2];
    let old = BigEndian::read_u16(operand);
    let new = map(old);
    if new != old {
        tracing::trace!("{} at {}: #{} -> #{}", inst.opcode, inst.bci, old, new);
        BigEndian::write_u16(operand, new);
    }
}

/// The tables in a `Code` attribute which refer to the pool
fn remap_code_tables(code: &mut Code, map: &impl Fn(PoolIndex) -> PoolIndex) {
    for handler in &mut code.exception_table {
        handler.catch_type = map(handler.catch_type);
    }

    let variables = code
        .local_variables
        .iter_mut()
        .chain(code.local_variable_types.iter_mut())
        .flatten();
    for variable in variables {
        variable.name_index = map(variable.name_index);
        variable.descriptor_index = map(variable.descriptor_index);
    }

    if let Some(stack_map) = &mut code.stack_map {
        for ty in stack_map.types_mut() {
            if let VerificationType::Object(index) = ty {
                *index = map(*index);
            }
        }
    }
}

fn remap_option(index: &mut Option<PoolIndex>, map: &impl Fn(PoolIndex) -> PoolIndex) {
    if let Some(index) = index {
        *index = map(*index);
    }
}

fn remap_list(indices: &mut Option<Vec<PoolIndex>>, map: &impl Fn(PoolIndex) -> PoolIndex) {
    for index in indices.iter_mut().flatten() {
        *index = map(*index);
    }
}

fn remap_annotation_set(
    annotations: &mut Annotations,
    map: &impl Fn(PoolIndex) -> PoolIndex,
) -> Result<(), ClassFileError> {
    if let Some(data) = &mut annotations.visible {
        remap_annotations(data, "RuntimeVisibleAnnotations", map)?;
    }
    if let Some(data) = &mut annotations.invisible {
        remap_annotations(data, "RuntimeInvisibleAnnotations", map)?;
    }
    if let Some(data) = &mut annotations.visible_type {
        remap_type_annotations(data, "RuntimeVisibleTypeAnnotations", map)?;
    }
    if let Some(data) = &mut annotations.invisible_type {
        remap_type_annotations(data, "RuntimeInvisibleTypeAnnotations", map)?;
    }
    Ok(())
}

/// Every index outside of code instructions
fn remap_class_indices(
    class: &mut ClassData,
    map: &impl Fn(PoolIndex) -> PoolIndex,
) -> Result<(), RedefineError> {
    class.this_class = map(class.this_class);
    remap_option(&mut class.super_class, map);
    for interface in &mut class.interfaces {
        *interface = map(*interface);
    }

    for field in &mut class.fields {
        field.name_index = map(field.name_index);
        field.descriptor_index = map(field.descriptor_index);
        remap_option(&mut field.constant_value, map);
        remap_option(&mut field.signature, map);
        remap_annotation_set(&mut field.annotations, map)?;
    }

    for method in &mut class.methods {
        method.name_index = map(method.name_index);
        method.descriptor_index = map(method.descriptor_index);
        remap_option(&mut method.signature, map);
        remap_list(&mut method.exceptions, map);
        for parameter in method.method_parameters.iter_mut().flatten() {
            parameter.name_index = map(parameter.name_index);
        }
        remap_annotation_set(&mut method.annotations, map)?;
        if let Some(data) = &mut method.parameter_annotations_visible {
            remap_parameter_annotations(data, "RuntimeVisibleParameterAnnotations", map)?;
        }
        if let Some(data) = &mut method.parameter_annotations_invisible {
            remap_parameter_annotations(data, "RuntimeInvisibleParameterAnnotations", map)?;
        }
        if let Some(data) = &mut method.annotation_default {
            remap_element_value(data, "AnnotationDefault", map)?;
        }
    }

    let attributes = &mut class.attributes;
    remap_option(&mut attributes.source_file, map);
    remap_option(&mut attributes.signature, map);
    for inner in attributes.inner_classes.iter_mut().flatten() {
        inner.inner_class_info_index = map(inner.inner_class_info_index);
        inner.outer_class_info_index = map(inner.outer_class_info_index);
        inner.inner_name_index = map(inner.inner_name_index);
    }
    if let Some(enclosing) = &mut attributes.enclosing_method {
        enclosing.class_index = map(enclosing.class_index);
        enclosing.method_index = map(enclosing.method_index);
    }
    remap_option(&mut attributes.nest_host, map);
    remap_list(&mut attributes.nest_members, map);
    remap_list(&mut attributes.permitted_subclasses, map);
    for component in attributes.record.iter_mut().flatten() {
        component.name_index = map(component.name_index);
        component.descriptor_index = map(component.descriptor_index);
        remap_option(&mut component.signature, map);
        remap_annotation_set(&mut component.annotations, map)?;
    }
    remap_annotation_set(&mut attributes.annotations, map)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use redefine_base::{
        builder::{ClassBuilder, CodeBuilder},
        class::Annotations,
        code::{
            op::Opcode,
            stack_map::{StackMapFrame, StackMapTable, VerificationType},
            ExceptionHandler, LineNumber,
        },
        ClassData, FieldAccessFlags, MethodAccessFlags, SymbolTable,
    };

    use super::{rewrite_class, unrewrite_class};
    use crate::translation::TranslationMap;

    /// A method which loads a string, with a handler and stack map after the load
    fn ldc_class(symbols: &SymbolTable) -> (ClassData, u16, u16) {
        let mut class = ClassBuilder::new(symbols, "demo/C", Some("java/lang/Object"));
        let string = class.pool().string("hello");
        let throwable = class.pool().class("java/lang/Throwable");

        let mut code = CodeBuilder::new();
        code.iload(0)
            .branch(Opcode::Ifeq, 7)
            .ldc(string)
            .areturn()
            .pop()
            .op(Opcode::AConstNull.raw())
            .areturn();
        let mut code = code.build(1, 1);
        code.exception_table.push(ExceptionHandler {
            start_pc: 4,
            end_pc: 6,
            handler_pc: 7,
            catch_type: throwable,
        });
        code.line_numbers = Some(vec![
            LineNumber {
                start_pc: 0,
                line_number: 10,
            },
            LineNumber {
                start_pc: 4,
                line_number: 11,
            },
            LineNumber {
                start_pc: 7,
                line_number: 12,
            },
        ]);
        code.stack_map = Some(StackMapTable {
            frames: vec![
                StackMapFrame::Full {
                    offset_delta: 7,
                    locals: vec![VerificationType::Integer],
                    stack: vec![VerificationType::Object(throwable)],
                },
                StackMapFrame::Same {
                    offset_delta: 0,
                    extended: false,
                },
            ],
        });

        class.method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "pick",
            "(I)Ljava/lang/Object;",
            Some(code),
        );
        let (class, _) = class.build();
        (class, string, throwable)
    }

    #[test]
    fn test_ldc_widened_past_byte_range() {
        let symbols = SymbolTable::new();
        let (mut class, string, throwable) = ldc_class(&symbols);
        let original = class.clone();

        let mut map = TranslationMap::new();
        map.map_index(string, 300);
        map.map_index(throwable, 42);

        let journal = rewrite_class(&mut class, &map).unwrap();
        assert_eq!(journal.widened(0), &[4]);
        assert_eq!(journal.widened_count(), 1);

        let code = class.methods[0].code.as_ref().unwrap();
        #[rustfmt::skip]
        let expected = vec![
            Opcode::Iload0.raw(),
            Opcode::Ifeq.raw(), 0x00, 0x08,
            Opcode::LdcW.raw(), 0x01, 0x2C,
            Opcode::Areturn.raw(),
            Opcode::Pop.raw(),
            Opcode::AConstNull.raw(),
            Opcode::Areturn.raw(),
        ];
        assert_eq!(code.bytecode, expected);
        assert_eq!(
            code.exception_table,
            vec![ExceptionHandler {
                start_pc: 4,
                end_pc: 7,
                handler_pc: 8,
                catch_type: 42,
            }]
        );
        let lines: Vec<_> = code
            .line_numbers
            .as_ref()
            .unwrap()
            .iter()
            .map(|line| line.start_pc)
            .collect();
        assert_eq!(lines, vec![0, 4, 8]);

        let stack_map = code.stack_map.as_ref().unwrap();
        assert_eq!(stack_map.frame_offsets(), vec![8, 9]);
        assert!(matches!(
            &stack_map.frames[0],
            StackMapFrame::Full { stack, .. } if stack == &vec![VerificationType::Object(42)]
        ));

        // And back again
        unrewrite_class(&mut class, &map.inverse(), &journal).unwrap();
        assert_eq!(class, original);
    }

    #[test]
    fn test_rewrite_symbolic_operands() {
        let symbols = SymbolTable::new();
        let mut class = ClassBuilder::new(&symbols, "demo/D", Some("java/lang/Object"));
        class.interface("demo/Service");
        let field = class.pool().field_ref("demo/D", "count", "I");
        let method = class.pool().method_ref("demo/D", "run", "()V");
        let target = class.pool().class("demo/Target");
        let number = class.pool().string("seven");
        class.field(FieldAccessFlags::PRIVATE, "count", "I");
        class.source_file("D.java");

        let mut code = CodeBuilder::new();
        code.aload(0)
            .getfield(field)
            .pop()
            .aload(0)
            .invokevirtual(method)
            .new_object(target)
            .pop()
            .ldc(number)
            .areturn();
        let index = class.method(
            MethodAccessFlags::PUBLIC,
            "go",
            "()Ljava/lang/Object;",
            Some(code.build(2, 1)),
        );
        // A class annotation of type #target
        let [high, low] = target.to_be_bytes();
        class.attributes_mut().annotations = Annotations {
            visible: Some(vec![0, 1, high, low, 0, 0]),
            ..Annotations::default()
        };
        let (mut class, pool) = class.build();
        let original = class.clone();

        let mut map = TranslationMap::new();
        map.map_index(field, 200);
        map.map_index(method, 201);
        map.map_index(target, 202);
        map.map_index(number, 203);
        let this_class = class.this_class;
        map.map_index(this_class, 204);
        let source_file = class.attributes.source_file.unwrap();
        map.map_index(source_file, 205);

        let journal = rewrite_class(&mut class, &map).unwrap();
        assert_eq!(journal.widened_count(), 0);

        let code = class.methods[index].code.as_ref().unwrap();
        let indices: Vec<_> = code
            .decode()
            .unwrap()
            .iter()
            .filter_map(|inst| inst.pool_index(&code.bytecode))
            .collect();
        assert_eq!(indices, vec![200, 201, 202, 203]);
        assert_eq!(class.this_class, 204);
        assert_eq!(class.attributes.source_file, Some(205));
        assert_eq!(
            class.attributes.annotations.visible,
            Some(vec![0, 1, 0, 202, 0, 0])
        );
        // Entries that did not move are untouched
        assert_eq!(class.fields[0].name_index, original.fields[0].name_index);
        assert!(pool.count() < 200);

        unrewrite_class(&mut class, &map.inverse(), &journal).unwrap();
        assert_eq!(class, original);
    }

    #[test]
    fn test_empty_map_changes_nothing() {
        let symbols = SymbolTable::new();
        let (mut class, _, _) = ldc_class(&symbols);
        let original = class.clone();

        let journal = rewrite_class(&mut class, &TranslationMap::new()).unwrap();
        assert_eq!(journal.widened_count(), 0);
        assert_eq!(class, original);
    }
}
