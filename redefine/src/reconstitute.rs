//! Writing a loaded class back out as a class file, the way an agent asking for its current
//! bytes would see it.

use redefine_base::{class_file::ClassFileWriter, ClassId};

use crate::{error::RedefineError, rewrite::link::unlink_code, runtime::Runtime};

impl Runtime {
    /// The installed version of `class` as class file bytes.
    /// Methods come out in the order of the class file they were defined with, with their code
    /// unlinked from the call site cache. The pool is the merged pool, so it may hold entries
    /// left over from earlier versions.
    pub fn reconstitute_class_file(&self, class: ClassId) -> Result<Vec<u8>, RedefineError> {
        let class = self
            .class(class)
            .ok_or_else(|| RedefineError::InvalidTarget(format!("no class {:?}", class)))?;
        let version = class.current();

        let mut data = version.data().clone();
        for method in version.methods_in_original_order() {
            let mut info = method.info().clone();
            if let Some(code) = &info.code {
                info.code = Some(unlink_code(code, version.cache())?);
            }
            data.methods.push(info);
        }

        let pool = version.pool().unresolved_copy();
        Ok(ClassFileWriter::new(&self.symbols).write(&data, &pool)?)
    }
}

#[cfg(test)]
mod tests {
    use redefine_base::{
        builder::{ClassBuilder, CodeBuilder},
        class_file::ClassFileReader,
        ClassId, MethodAccessFlags, SymbolTable,
    };

    use crate::{
        config::RedefineConfig,
        error::RedefineError,
        runtime::{
            tests::{class_bytes, string_method},
            Runtime,
        },
    };

    fn calls(c: &mut ClassBuilder) {
        let target = c.pool().method_ref("demo/Out", "b", "()Ljava/lang/Object;");
        let mut code = CodeBuilder::new();
        code.invokestatic(target).areturn();
        c.method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "a",
            "()Ljava/lang/Object;",
            Some(code.build(1, 0)),
        );
    }

    #[test]
    fn test_reconstitute_after_redefinition() {
        let runtime = Runtime::new(RedefineConfig::new());
        let original = class_bytes("demo/Out", Some("java/lang/Object"), |c| {
            string_method(c, "b", "first");
            calls(c);
        });
        let id = runtime.define_class(&original).unwrap();

        // Defining doesn't change anything that is written back
        let written = runtime.reconstitute_class_file(id).unwrap();
        let symbols = SymbolTable::new();
        let reader = ClassFileReader::new(&symbols);
        assert_eq!(reader.parse(&written).unwrap().0, reader.parse(&original).unwrap().0);

        runtime
            .redefine_class(
                id,
                &class_bytes("demo/Out", Some("java/lang/Object"), |c| {
                    string_method(c, "b", "second");
                    calls(c);
                }),
            )
            .unwrap();

        let (data, pool) = reader.parse(&runtime.reconstitute_class_file(id).unwrap()).unwrap();
        let names: Vec<_> = data
            .methods
            .iter()
            .map(|method| method.name(&pool).unwrap().to_string())
            .collect();
        assert_eq!(names, ["b", "a"]);

        // The call in `a` names the right method again once unlinked
        let code = data.methods[1].code.as_ref().unwrap();
        let index = u16::from_be_bytes([code.bytecode[1], code.bytecode[2]]);
        let info = pool.member_ref_at(index).unwrap();
        assert_eq!(info.class_name.as_bytes(), b"demo/Out");
        assert_eq!(info.name.as_bytes(), b"b");

        let code = data.methods[0].code.as_ref().unwrap();
        let index = u16::from_be_bytes([code.bytecode[1], code.bytecode[2]]);
        assert_eq!(pool.string_at(index).unwrap().as_bytes(), b"second");
    }

    #[test]
    fn test_reconstitute_unknown_class() {
        let runtime = Runtime::new(RedefineConfig::new());
        assert!(matches!(
            runtime.reconstitute_class_file(ClassId::new_unchecked(42)),
            Err(RedefineError::InvalidTarget(_))
        ));
    }
}
