//! Reading and writing the binary class file format.

use crate::{
    code::stack_map::StackMapError, constant_pool::ConstantPoolError, descriptor::DescriptorError,
};

pub mod reader;
pub mod writer;

pub use reader::ClassFileReader;
pub use writer::ClassFileWriter;

pub const MAGIC: u32 = 0xCAFE_BABE;

pub(crate) mod attribute {
    pub const CODE: &str = "Code";
    pub const STACK_MAP_TABLE: &str = "StackMapTable";
    pub const LINE_NUMBER_TABLE: &str = "LineNumberTable";
    pub const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
    pub const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";
    pub const EXCEPTIONS: &str = "Exceptions";
    pub const METHOD_PARAMETERS: &str = "MethodParameters";
    pub const SIGNATURE: &str = "Signature";
    pub const CONSTANT_VALUE: &str = "ConstantValue";
    pub const SOURCE_FILE: &str = "SourceFile";
    pub const SOURCE_DEBUG_EXTENSION: &str = "SourceDebugExtension";
    pub const INNER_CLASSES: &str = "InnerClasses";
    pub const ENCLOSING_METHOD: &str = "EnclosingMethod";
    pub const NEST_HOST: &str = "NestHost";
    pub const NEST_MEMBERS: &str = "NestMembers";
    pub const PERMITTED_SUBCLASSES: &str = "PermittedSubclasses";
    pub const RECORD: &str = "Record";
    pub const BOOTSTRAP_METHODS: &str = "BootstrapMethods";
    pub const SYNTHETIC: &str = "Synthetic";
    pub const DEPRECATED: &str = "Deprecated";
    pub const RUNTIME_VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
    pub const RUNTIME_INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";
    pub const RUNTIME_VISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeVisibleTypeAnnotations";
    pub const RUNTIME_INVISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeInvisibleTypeAnnotations";
    pub const RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS: &str = "RuntimeVisibleParameterAnnotations";
    pub const RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS: &str =
        "RuntimeInvisibleParameterAnnotations";
    pub const ANNOTATION_DEFAULT: &str = "AnnotationDefault";
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClassFileError {
    /// The data ended early
    Truncated,
    Io(std::io::ErrorKind),
    BadMagic(u32),
    UnknownConstantTag {
        index: u16,
        tag: u8,
    },
    BadReferenceKind {
        index: u16,
        kind: u8,
    },
    ConstantPool(ConstantPoolError),
    /// An attribute's declared length did not match its contents
    AttributeLength {
        name: &'static str,
    },
    DuplicateAttribute {
        name: &'static str,
    },
    CodeLength(u32),
    StackMap(StackMapError),
    Descriptor(DescriptorError),
    /// There was data after the class
    TrailingBytes,
}
impl From<std::io::Error> for ClassFileError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ClassFileError::Truncated,
            kind => ClassFileError::Io(kind),
        }
    }
}
impl From<ConstantPoolError> for ClassFileError {
    fn from(err: ConstantPoolError) -> Self {
        ClassFileError::ConstantPool(err)
    }
}
impl From<StackMapError> for ClassFileError {
    fn from(err: StackMapError) -> Self {
        ClassFileError::StackMap(err)
    }
}
impl From<DescriptorError> for ClassFileError {
    fn from(err: DescriptorError) -> Self {
        ClassFileError::Descriptor(err)
    }
}
impl std::fmt::Display for ClassFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassFileError::Truncated => f.write_str("class file is truncated"),
            ClassFileError::Io(kind) => write!(f, "io error: {:?}", kind),
            ClassFileError::BadMagic(magic) => write!(f, "bad magic {:#010x}", magic),
            ClassFileError::UnknownConstantTag { index, tag } => {
                write!(f, "unknown constant tag {} at #{}", tag, index)
            }
            ClassFileError::BadReferenceKind { index, kind } => {
                write!(f, "bad method handle kind {} at #{}", kind, index)
            }
            ClassFileError::ConstantPool(err) => write!(f, "{}", err),
            ClassFileError::AttributeLength { name } => {
                write!(f, "{} attribute has the wrong length", name)
            }
            ClassFileError::DuplicateAttribute { name } => {
                write!(f, "{} attribute appears more than once", name)
            }
            ClassFileError::CodeLength(len) => write!(f, "invalid code length {}", len),
            ClassFileError::StackMap(err) => write!(f, "{}", err),
            ClassFileError::Descriptor(err) => write!(f, "{}", err),
            ClassFileError::TrailingBytes => f.write_str("trailing bytes after class"),
        }
    }
}
impl std::error::Error for ClassFileError {}

#[cfg(test)]
mod tests {
    use crate::{
        builder::{ClassBuilder, CodeBuilder},
        class_file::{ClassFileError, ClassFileReader, ClassFileWriter},
        code::{ExceptionHandler, LineNumber},
        constant_pool::ReferenceKind,
        symbol::SymbolTable,
        MethodAccessFlags,
    };

    #[test]
    fn test_write_then_read() {
        let symbols = SymbolTable::new();
        let mut class = ClassBuilder::new(&symbols, "demo/Counter", Some("java/lang/Object"));
        class.interface("java/lang/Runnable");
        class.field(crate::FieldAccessFlags::PRIVATE, "count", "I");
        let field = class.pool().field_ref("demo/Counter", "count", "I");
        let init = class.pool().method_ref("java/lang/Object", "<init>", "()V");
        let big = class.pool().long(1 << 40);
        let handle = class.pool().method_handle(
            ReferenceKind::InvokeStatic,
            "demo/Boot",
            "bsm",
            "()Ljava/lang/invoke/CallSite;",
        );
        let boot = class.pool().bootstrap(handle, &[]);
        let indy = class.pool().invoke_dynamic(boot, "run", "()V");

        let mut code = CodeBuilder::new();
        code.aload(0).invokespecial(init).aload(0).dup().getfield(field);
        code.iconst(1).op(0x60).putfield(field);
        code.ldc2_w(big).op(0x58).invokedynamic(indy).ret();
        let mut code = code.build(4, 1);
        code.exception_table.push(ExceptionHandler {
            start_pc: 0,
            end_pc: 4,
            handler_pc: 4,
            catch_type: 0,
        });
        code.line_numbers = Some(vec![LineNumber {
            start_pc: 0,
            line_number: 10,
        }]);
        class.method(MethodAccessFlags::PUBLIC, "<init>", "()V", Some(code));
        class.source_file("Counter.java");
        let (data, pool) = class.build();

        let bytes = ClassFileWriter::new(&symbols).write(&data, &pool).unwrap();
        let (read, read_pool) = ClassFileReader::new(&symbols).parse(&bytes).unwrap();

        assert_eq!(read.methods[0].code, data.methods[0].code);
        assert_eq!(read.fields, data.fields);
        assert_eq!(read.interfaces, data.interfaces);
        assert_eq!(read.attributes.source_file, data.attributes.source_file);
        assert_eq!(read_pool.operands(), pool.operands());
        assert!(read_pool.count() >= pool.count());
        for (index, _) in pool.iter() {
            assert!(pool.compare_entry_to(index, &read_pool, index));
        }
    }

    #[test]
    fn test_rejects_malformed() {
        let symbols = SymbolTable::new();
        let reader = ClassFileReader::new(&symbols);
        assert_eq!(
            reader.parse(&[0xCA, 0xFE, 0xBA, 0xBF, 0, 0, 0, 52]).err(),
            Some(ClassFileError::BadMagic(0xCAFE_BABF))
        );
        assert_eq!(
            reader.parse(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0]).err(),
            Some(ClassFileError::Truncated)
        );
        // Pool of two entries where the only entry has tag 2
        assert_eq!(
            reader
                .parse(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 2, 2])
                .err(),
            Some(ClassFileError::UnknownConstantTag { index: 1, tag: 2 })
        );
    }
}
