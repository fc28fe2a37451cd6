//! The registry of loaded classes and methods that redefinition acts on, with just enough of a
//! runtime around it to define classes and resolve their call sites.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::RwLock;
use redefine_base::{
    class_file::ClassFileReader,
    code::{
        op::{OperandKind, Opcode},
        stream::{decode_at, Instruction},
    },
    id::MethodKey,
    verify::{Verifier, VerifyTarget},
    ClassData, ClassId, ConstantPool, FieldAccessFlags, IdMap, MethodIdnum, Symbol, SymbolTable,
};
use redefine_verifier::StructuralVerifier;
use usize_cast::IntoUsize;

use crate::{
    class::{ClassVersion, LoadedClass},
    config::RedefineConfig,
    cpcache::{CacheEntry, CacheFlags, Resolution, ResolvedTarget},
    error::{LinkageError, RedefineError},
    frames::FrameRegistry,
    lock::RedefinitionLocks,
    method::Method,
    redefine::{CompiledCode, NoCompiledCode, RedefinitionListener},
    rewrite::link::link_methods,
    safepoint::{Safepoint, WorldLock},
};

pub struct Runtime {
    pub(crate) conf: RedefineConfig,
    pub(crate) symbols: SymbolTable,
    pub(crate) verifier: Box<dyn Verifier>,
    pub(crate) world: Arc<dyn Safepoint>,
    pub(crate) compiled: Box<dyn CompiledCode>,
    pub(crate) listeners: RwLock<Vec<Box<dyn RedefinitionListener>>>,
    pub(crate) frames: FrameRegistry,
    pub(crate) locks: RedefinitionLocks,
    classes: RwLock<IdMap<ClassId, Arc<LoadedClass>>>,
    names: RwLock<HashMap<Symbol, ClassId>>,
    /// Weak so that methods of purged versions go away
    methods: RwLock<IdMap<MethodKey, Weak<Method>>>,
    next_class_id: AtomicU32,
    next_method_key: AtomicU32,
    pub(crate) next_redefinition_id: AtomicU64,
    pub(crate) epoch: AtomicU64,
}
impl Runtime {
    #[must_use]
    pub fn new(conf: RedefineConfig) -> Runtime {
        Runtime::with_collaborators(
            conf,
            Box::new(StructuralVerifier::default()),
            Arc::new(WorldLock::new()),
            Box::new(NoCompiledCode),
        )
    }

    #[must_use]
    pub fn with_collaborators(
        conf: RedefineConfig,
        verifier: Box<dyn Verifier>,
        world: Arc<dyn Safepoint>,
        compiled: Box<dyn CompiledCode>,
    ) -> Runtime {
        Runtime {
            conf,
            symbols: SymbolTable::new(),
            verifier,
            world,
            compiled,
            listeners: RwLock::new(Vec::new()),
            frames: FrameRegistry::new(),
            locks: RedefinitionLocks::new(),
            classes: RwLock::new(IdMap::default()),
            names: RwLock::new(HashMap::new()),
            methods: RwLock::new(IdMap::default()),
            next_class_id: AtomicU32::new(1),
            next_method_key: AtomicU32::new(1),
            next_redefinition_id: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn conf(&self) -> &RedefineConfig {
        &self.conf
    }

    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Live activations, which keep old versions of redefined classes around
    #[must_use]
    pub fn frames(&self) -> &FrameRegistry {
        &self.frames
    }

    /// Increases every time a batch of redefinitions is installed
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: Box<dyn RedefinitionListener>) {
        self.listeners.write().push(listener);
    }

    #[must_use]
    pub fn class(&self, id: ClassId) -> Option<Arc<LoadedClass>> {
        self.classes.read().get(&id).cloned()
    }

    #[must_use]
    pub fn class_by_name(&self, name: &str) -> Option<Arc<LoadedClass>> {
        let name = self.symbols.lookup(name.as_bytes())?;
        let id = *self.names.read().get(&name)?;
        self.class(id)
    }

    /// Every loaded class, in no particular order
    #[must_use]
    pub fn classes(&self) -> Vec<Arc<LoadedClass>> {
        self.classes.read().values().cloned().collect()
    }

    /// A method of any version of any class, as long as something still holds it
    #[must_use]
    pub fn method(&self, key: MethodKey) -> Option<Arc<Method>> {
        self.methods.read().get(&key).and_then(Weak::upgrade)
    }

    /// Find a method of the installed version of `class`
    #[must_use]
    pub fn find_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let class = self.class(class)?;
        let version = class.current();
        version
            .find_method(name.as_bytes(), descriptor.as_bytes())
            .cloned()
    }

    pub(crate) fn register_methods(&self, methods: &[Arc<Method>]) {
        let mut registry = self.methods.write();
        for method in methods {
            registry.insert(method.key(), Arc::downgrade(method));
        }
    }

    /// Link a parsed class and wrap its methods.
    /// `idnums` holds the idnum of each method in class file order.
    pub(crate) fn link_version(
        &self,
        holder: ClassId,
        number: u32,
        mut data: ClassData,
        pool: ConstantPool,
        idnums: &[MethodIdnum],
    ) -> Result<ClassVersion, RedefineError> {
        let cache = Arc::new(link_methods(&mut data.methods, &pool, &self.conf)?);
        let pool = Arc::new(pool);

        let infos = std::mem::take(&mut data.methods);
        let mut methods = Vec::with_capacity(infos.len());
        for (position, info) in infos.into_iter().enumerate() {
            let name = info.name(&pool)?.clone();
            let descriptor = info.descriptor(&pool)?.clone();
            let idnum = idnums.get(position).copied().ok_or_else(|| {
                RedefineError::InternalInvariantViolation(format!(
                    "no idnum for method {} of {}",
                    position,
                    idnums.len()
                ))
            })?;
            let key = MethodKey::new_unchecked(self.next_method_key.fetch_add(1, Ordering::Relaxed));
            let method = Method::new(
                key,
                holder,
                info,
                Arc::clone(&pool),
                Arc::clone(&cache),
                idnum,
                name,
                descriptor,
            );
            methods.push((Arc::new(method), position as u16));
        }

        methods.sort_by(|(a, _), (b, _)| {
            (a.name().as_bytes(), a.descriptor().as_bytes())
                .cmp(&(b.name().as_bytes(), b.descriptor().as_bytes()))
        });
        let (methods, ordering) = methods.into_iter().unzip();
        Ok(ClassVersion::new(number, data, pool, cache, methods, ordering))
    }

    /// Parse, verify, link and register a class.
    /// Super classes and interfaces that aren't loaded are ignored rather than loaded.
    pub fn define_class(&self, bytes: &[u8]) -> Result<ClassId, RedefineError> {
        let (data, pool) = ClassFileReader::new(&self.symbols).parse(bytes)?;
        self.verifier.verify(&VerifyTarget::new(&data, &pool))?;

        let name = data.name(&pool)?.clone();
        if self.names.read().contains_key(&name) {
            return Err(RedefineError::InvalidTarget(format!(
                "{} is already defined",
                name
            )));
        }

        let super_class = match data.super_name(&pool)? {
            Some(super_name) => {
                let super_class = self.names.read().get(super_name).copied();
                if super_class.is_none() {
                    tracing::debug!("Super class {} of {} isn't loaded", super_name, name);
                }
                super_class
            }
            None => None,
        };
        let mut interfaces = Vec::with_capacity(data.interfaces.len());
        for &index in &data.interfaces {
            let interface_name = pool.class_name_at(index)?;
            match self.names.read().get(interface_name) {
                Some(&interface) => interfaces.push(interface),
                None => tracing::debug!("Interface {} of {} isn't loaded", interface_name, name),
            }
        }

        let id = ClassId::new_unchecked(self.next_class_id.fetch_add(1, Ordering::Relaxed));
        let idnums: Vec<_> = (0..data.methods.len())
            .map(|i| MethodIdnum::new(i as u16))
            .collect();
        let version = Arc::new(self.link_version(id, 0, data, pool, &idnums)?);
        self.register_methods(version.methods());

        let vtable = self.build_vtable(super_class, &version);
        let itable = self.build_itable(super_class, &interfaces, &vtable);

        let class = LoadedClass::new(id, name.clone(), super_class, interfaces, version, vtable, itable);
        tracing::info!("Defined {} as {:?}", name, id);
        self.classes.write().insert(id, Arc::new(class));
        self.names.write().insert(name, id);
        Ok(id)
    }

    fn build_vtable(&self, super_class: Option<ClassId>, version: &ClassVersion) -> Vec<MethodKey> {
        let mut vtable = super_class
            .and_then(|id| self.class(id))
            .map(|class| class.vtable())
            .unwrap_or_default();

        for method in version.methods_in_original_order() {
            if !method.is_virtual() {
                continue;
            }
            let overridden = vtable.iter().position(|&key| {
                self.method(key).map_or(false, |inherited| {
                    inherited.name() == method.name() && inherited.descriptor() == method.descriptor()
                })
            });
            match overridden {
                Some(slot) => vtable[slot] = method.key(),
                None => vtable.push(method.key()),
            }
        }
        vtable
    }

    fn build_itable(
        &self,
        super_class: Option<ClassId>,
        interfaces: &[ClassId],
        vtable: &[MethodKey],
    ) -> IdMap<ClassId, Vec<Option<MethodKey>>> {
        let mut all_interfaces = interfaces.to_vec();
        if let Some(super_class) = super_class.and_then(|id| self.class(id)) {
            all_interfaces.extend(super_class.interfaces().iter().copied());
        }

        let mut itable = IdMap::default();
        for interface_id in all_interfaces {
            let interface = match self.class(interface_id) {
                Some(interface) => interface,
                None => continue,
            };
            let interface_version = interface.current();
            let slots = interface_version
                .methods()
                .iter()
                .filter(|method| method.is_virtual())
                .map(|wanted| {
                    let implementation = vtable
                        .iter()
                        .filter_map(|&key| self.method(key))
                        .find(|method| {
                            method.name() == wanted.name()
                                && method.descriptor() == wanted.descriptor()
                                && method.code().is_some()
                        });
                    match implementation {
                        Some(method) => Some(method.key()),
                        // A default method
                        None if wanted.code().is_some() => Some(wanted.key()),
                        None => None,
                    }
                })
                .collect();
            itable.insert(interface_id, slots);
        }
        itable
    }

    /// Look a method up in a class and then its super classes and interfaces
    fn lookup_method(
        &self,
        class: &Arc<LoadedClass>,
        name: &Symbol,
        descriptor: &Symbol,
    ) -> Option<Arc<Method>> {
        let mut current = Some(Arc::clone(class));
        while let Some(class) = current {
            let version = class.current();
            if let Some(method) = version.find_method(name.as_bytes(), descriptor.as_bytes()) {
                return Some(Arc::clone(method));
            }
            for &interface in class.interfaces() {
                let found = self.class(interface).and_then(|interface| {
                    interface
                        .current()
                        .find_method(name.as_bytes(), descriptor.as_bytes())
                        .cloned()
                });
                if found.is_some() {
                    return found;
                }
            }
            current = class.super_class().and_then(|id| self.class(id));
        }
        None
    }

    fn resolve_method_entry(
        &self,
        caller: &Method,
        cp_index: u16,
        opcode: Opcode,
    ) -> Result<Resolution, LinkageError> {
        let info = caller
            .pool()
            .member_ref_at(cp_index)
            .map_err(|err| LinkageError::BadCallSite(err.to_string()))?;
        let class = self
            .names
            .read()
            .get(info.class_name)
            .and_then(|&id| self.class(id))
            .ok_or_else(|| LinkageError::NoSuchClass(info.class_name.to_string()))?;
        let method = self
            .lookup_method(&class, info.name, info.descriptor)
            .ok_or_else(|| LinkageError::NoSuchMethod {
                class: info.class_name.to_string(),
                name: info.name.to_string(),
                descriptor: info.descriptor.to_string(),
            })?;

        let mut flags = CacheFlags::empty();
        let mut aux = 0;
        if method.info().is_static() {
            flags |= CacheFlags::STATIC;
        }
        match opcode {
            Opcode::InvokeVirtual if method.is_virtual() => {
                let slot = class
                    .vtable()
                    .iter()
                    .position(|&key| key == method.key());
                match slot {
                    Some(slot) => {
                        flags |= CacheFlags::VTABLE;
                        aux = slot as u64;
                    }
                    None => flags |= CacheFlags::FINAL,
                }
            }
            Opcode::InvokeInterface => {
                // Same order the itables were built in
                let slot = class
                    .current()
                    .methods()
                    .iter()
                    .filter(|method| method.is_virtual())
                    .position(|candidate| {
                        candidate.name() == info.name && candidate.descriptor() == info.descriptor
                    });
                if let Some(slot) = slot {
                    flags |= CacheFlags::ITABLE;
                    aux = (u64::from(class.id().get()) << 16) | slot as u64;
                }
            }
            _ => flags |= CacheFlags::FINAL,
        }

        Ok(Resolution {
            target: ResolvedTarget::Method(method.key()),
            aux,
            flags,
        })
    }

    fn call_site(caller: &Method, bci: usize) -> Result<(Instruction, usize), RedefineError> {
        let code = caller.code().ok_or_else(|| {
            LinkageError::BadCallSite(format!("{} has no code", caller.display_name()))
        })?;
        let inst = decode_at(&code.bytecode, bci)
            .map_err(|err| LinkageError::BadCallSite(format!("{:?}", err)))?;
        let at = inst.operand_start();
        let bytes = code.bytecode.get(at..).unwrap_or(&[]);
        let index = match inst.opcode.operand() {
            OperandKind::Dynamic if bytes.len() >= 4 => {
                u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).into_usize()
            }
            kind if kind.is_cache_indexed() && bytes.len() >= 2 => {
                usize::from(u16::from_ne_bytes([bytes[0], bytes[1]]))
            }
            _ => {
                return Err(LinkageError::BadCallSite(format!(
                    "{} at {} is not a linked call site",
                    inst.opcode, bci
                ))
                .into())
            }
        };
        Ok((inst, index))
    }

    /// Resolve the invoke instruction at `bci` in `caller`, through its cache
    pub fn resolve_invoke(&self, caller: &Method, bci: usize) -> Result<Resolution, RedefineError> {
        let (inst, index) = Runtime::call_site(caller, bci)?;
        let cache = caller.cache();
        let resolve = |entry: &CacheEntry| {
            self.resolve_method_entry(caller, entry.cp_index(), inst.opcode)
        };
        match inst.opcode {
            Opcode::InvokeVirtual => cache.resolve_virtual(index, resolve),
            Opcode::InvokeStatic => cache.resolve_static(index, resolve),
            Opcode::InvokeSpecial => cache.resolve_special(index, resolve),
            Opcode::InvokeInterface => cache.resolve_interface(index, resolve),
            opcode => Err(LinkageError::BadCallSite(format!("{} is not an invoke", opcode)).into()),
        }
    }

    /// Resolve the field instruction at `bci` in `caller`
    pub fn resolve_field(&self, caller: &Method, bci: usize) -> Result<Resolution, RedefineError> {
        let (inst, index) = Runtime::call_site(caller, bci)?;
        caller.cache().resolve_field(index, inst.opcode, |entry| {
            let info = caller
                .pool()
                .member_ref_at(entry.cp_index())
                .map_err(|err| LinkageError::BadCallSite(err.to_string()))?;
            let no_such_field = || LinkageError::NoSuchField {
                class: info.class_name.to_string(),
                name: info.name.to_string(),
                descriptor: info.descriptor.to_string(),
            };

            let mut current = self.names.read().get(info.class_name).and_then(|&id| self.class(id));
            while let Some(class) = current {
                let version = class.current();
                let pool = version.pool();
                let slot = version.data().fields.iter().position(|field| {
                    pool.utf8_at(field.name_index).ok() == Some(info.name)
                        && pool.utf8_at(field.descriptor_index).ok() == Some(info.descriptor)
                });
                if let Some(slot) = slot {
                    let access = version.data().fields[slot].access_flags;
                    let mut flags = CacheFlags::empty();
                    flags.set(CacheFlags::STATIC, access.contains(FieldAccessFlags::STATIC));
                    flags.set(CacheFlags::FINAL, access.contains(FieldAccessFlags::FINAL));
                    flags.set(CacheFlags::VOLATILE, access.contains(FieldAccessFlags::VOLATILE));
                    return Ok(Resolution {
                        target: ResolvedTarget::Field {
                            holder: class.id(),
                            slot: slot as u16,
                        },
                        aux: 0,
                        flags,
                    });
                }
                current = class.super_class().and_then(|id| self.class(id));
            }
            Err(no_such_field())
        })
    }

    /// Resolve the `invokedynamic` at `bci` in `caller`.
    /// `bootstrap` produces the call site object's id, and runs at most once per site.
    pub fn resolve_dynamic(
        &self,
        caller: &Method,
        bci: usize,
        bootstrap: impl FnOnce(&ConstantPool, u16) -> Result<u32, LinkageError>,
    ) -> Result<Resolution, RedefineError> {
        let (inst, index) = Runtime::call_site(caller, bci)?;
        if inst.opcode != Opcode::InvokeDynamic {
            return Err(
                LinkageError::BadCallSite(format!("{} is not invokedynamic", inst.opcode)).into(),
            );
        }
        caller.cache().resolve_dynamic(index, |entry| {
            let call_site = bootstrap(caller.pool(), entry.cp_index())?;
            Ok(Resolution {
                target: ResolvedTarget::CallSite(call_site),
                aux: 0,
                flags: CacheFlags::empty(),
            })
        })
    }

    /// The method a resolved call runs for a receiver of class `receiver`
    #[must_use]
    pub fn dispatch(&self, receiver: ClassId, resolution: &Resolution) -> Option<MethodKey> {
        let target = match resolution.target {
            ResolvedTarget::Method(target) => target,
            _ => return None,
        };
        let class = self.class(receiver)?;
        if resolution.flags.contains(CacheFlags::VTABLE) {
            class.vtable_entry(resolution.aux.into_usize())
        } else if resolution.flags.contains(CacheFlags::ITABLE) {
            let interface = ClassId::new_unchecked((resolution.aux >> 16) as u32);
            class.itable_entry(interface, (resolution.aux & 0xFFFF).into_usize())
        } else {
            Some(target)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use redefine_base::{
        builder::{ClassBuilder, CodeBuilder},
        class_file::ClassFileWriter,
        constant_pool::ReferenceKind,
        MethodAccessFlags, SymbolTable,
    };

    use super::Runtime;
    use crate::{
        config::RedefineConfig,
        cpcache::{CacheFlags, ResolvedTarget},
        error::{LinkageError, RedefineError},
        method::Method,
    };

    /// Write a class built by `build` to class file bytes
    pub(crate) fn class_bytes(
        name: &str,
        super_name: Option<&str>,
        build: impl FnOnce(&mut ClassBuilder),
    ) -> Vec<u8> {
        let symbols = SymbolTable::new();
        let mut class = ClassBuilder::new(&symbols, name, super_name);
        build(&mut class);
        let (class, pool) = class.build();
        ClassFileWriter::new(&symbols).write(&class, &pool).unwrap()
    }

    /// `static Object name()` returning the string `text`
    pub(crate) fn string_method(class: &mut ClassBuilder, name: &str, text: &str) {
        let string = class.pool().string(text);
        let mut code = CodeBuilder::new();
        code.ldc_w(string).areturn();
        class.method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            name,
            "()Ljava/lang/Object;",
            Some(code.build(1, 0)),
        );
    }

    /// `void run()` on `demo/Base`, overridden by `demo/Derived`, and a caller of both
    fn hierarchy(runtime: &Runtime) {
        let empty = |class: &mut ClassBuilder, name: &str| {
            let mut code = CodeBuilder::new();
            code.ret();
            class.method(MethodAccessFlags::PUBLIC, name, "()V", Some(code.build(0, 1)));
        };
        runtime
            .define_class(&class_bytes("demo/Base", Some("java/lang/Object"), |c| {
                empty(c, "run");
                empty(c, "stay");
            }))
            .unwrap();
        runtime
            .define_class(&class_bytes("demo/Derived", Some("demo/Base"), |c| {
                empty(c, "run");
            }))
            .unwrap();
        runtime
            .define_class(&class_bytes("demo/Caller", Some("java/lang/Object"), |c| {
                let run = c.pool().method_ref("demo/Base", "run", "()V");
                let mut code = CodeBuilder::new();
                code.aload(0).invokevirtual(run).ret();
                c.method(
                    MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                    "call",
                    "(Ldemo/Base;)V",
                    Some(code.build(1, 1)),
                );
            }))
            .unwrap();
    }

    #[test]
    fn test_define_and_dispatch() {
        let runtime = Runtime::new(RedefineConfig::new());
        hierarchy(&runtime);

        let base = runtime.class_by_name("demo/Base").unwrap();
        let derived = runtime.class_by_name("demo/Derived").unwrap();
        assert_eq!(derived.super_class(), Some(base.id()));
        assert_eq!(base.vtable().len(), 2);
        assert_eq!(derived.vtable().len(), 2);

        let base_run = runtime.find_method(base.id(), "run", "()V").unwrap();
        let derived_run = runtime.find_method(derived.id(), "run", "()V").unwrap();
        let stay = runtime.find_method(base.id(), "stay", "()V").unwrap();
        assert_eq!(derived.vtable()[1], stay.key());

        let caller_class = runtime.class_by_name("demo/Caller").unwrap();
        let caller = runtime.find_method(caller_class.id(), "call", "(Ldemo/Base;)V").unwrap();
        let resolution = runtime.resolve_invoke(&caller, 1).unwrap();
        assert_eq!(resolution.target, ResolvedTarget::Method(base_run.key()));
        assert!(resolution.flags.contains(CacheFlags::VTABLE));

        assert_eq!(runtime.dispatch(base.id(), &resolution), Some(base_run.key()));
        assert_eq!(runtime.dispatch(derived.id(), &resolution), Some(derived_run.key()));

        // Cached from now on
        assert_eq!(runtime.resolve_invoke(&caller, 1).unwrap(), resolution);
        assert!(matches!(
            runtime.resolve_invoke(&caller, 0),
            Err(RedefineError::Linkage(LinkageError::BadCallSite(_)))
        ));
    }

    /// `demo/Derived.both()` calling `super.run()` then `this.run()` through one `Methodref`.
    /// Returns the method with the bci of its `invokespecial` and its `invokevirtual`.
    fn special_then_virtual(runtime: &Runtime) -> (Arc<Method>, usize, usize) {
        let empty = |class: &mut ClassBuilder, name: &str| {
            let mut code = CodeBuilder::new();
            code.ret();
            class.method(MethodAccessFlags::PUBLIC, name, "()V", Some(code.build(0, 1)));
        };
        runtime
            .define_class(&class_bytes("demo/Base", Some("java/lang/Object"), |c| {
                empty(c, "run");
            }))
            .unwrap();
        let derived = runtime
            .define_class(&class_bytes("demo/Derived", Some("demo/Base"), |c| {
                empty(c, "run");
                let run = c.pool().method_ref("demo/Base", "run", "()V");
                let mut code = CodeBuilder::new();
                code.aload(0)
                    .invokespecial(run)
                    .aload(0)
                    .invokevirtual(run)
                    .ret();
                c.method(MethodAccessFlags::PUBLIC, "both", "()V", Some(code.build(1, 1)));
            }))
            .unwrap();
        let both = runtime.find_method(derived, "both", "()V").unwrap();
        (both, 1, 5)
    }

    #[test]
    fn test_special_and_virtual_on_one_entry() {
        for special_first in [true, false] {
            let runtime = Runtime::new(RedefineConfig::new());
            let (both, special_bci, virtual_bci) = special_then_virtual(&runtime);
            let base = runtime.class_by_name("demo/Base").unwrap();
            let derived = runtime.class_by_name("demo/Derived").unwrap();
            let base_run = runtime.find_method(base.id(), "run", "()V").unwrap();
            let derived_run = runtime.find_method(derived.id(), "run", "()V").unwrap();
            // Both instructions were linked to the same cache entry
            assert_eq!(both.cache().ordinary_len(), 1);

            let (special, virtual_call) = if special_first {
                let special = runtime.resolve_invoke(&both, special_bci).unwrap();
                (special, runtime.resolve_invoke(&both, virtual_bci).unwrap())
            } else {
                let virtual_call = runtime.resolve_invoke(&both, virtual_bci).unwrap();
                (runtime.resolve_invoke(&both, special_bci).unwrap(), virtual_call)
            };

            assert!(special.flags.contains(CacheFlags::FINAL));
            assert!(virtual_call.flags.contains(CacheFlags::VTABLE));
            assert_eq!(runtime.dispatch(derived.id(), &special), Some(base_run.key()));
            assert_eq!(
                runtime.dispatch(derived.id(), &virtual_call),
                Some(derived_run.key())
            );

            // And again from the cache, each keeping its own mode
            assert_eq!(runtime.resolve_invoke(&both, special_bci).unwrap(), special);
            assert_eq!(runtime.resolve_invoke(&both, virtual_bci).unwrap(), virtual_call);
        }
    }

    #[test]
    fn test_define_twice() {
        let runtime = Runtime::new(RedefineConfig::new());
        let bytes = class_bytes("demo/Once", Some("java/lang/Object"), |c| string_method(c, "get", "x"));
        runtime.define_class(&bytes).unwrap();
        assert!(matches!(
            runtime.define_class(&bytes),
            Err(RedefineError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_resolution_failures() {
        let runtime = Runtime::new(RedefineConfig::new());
        let id = runtime
            .define_class(&class_bytes("demo/Missing", Some("java/lang/Object"), |c| {
                let gone = c.pool().method_ref("demo/Nowhere", "gone", "()V");
                let field = c.pool().field_ref("demo/Missing", "count", "I");
                let handle =
                    c.pool()
                        .method_handle(ReferenceKind::InvokeStatic, "demo/Boot", "bsm", "()V");
                let boot = c.pool().bootstrap(handle, &[]);
                let indy = c.pool().invoke_dynamic(boot, "make", "()V");
                let mut code = CodeBuilder::new();
                code.invokestatic(gone)
                    .getstatic(field)
                    .pop()
                    .invokedynamic(indy)
                    .ret();
                c.method(
                    MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                    "broken",
                    "()V",
                    Some(code.build(1, 0)),
                );
            }))
            .unwrap();
        let method = runtime.find_method(id, "broken", "()V").unwrap();

        assert_eq!(
            runtime.resolve_invoke(&method, 0),
            Err(RedefineError::Linkage(LinkageError::NoSuchClass(
                "demo/Nowhere".to_owned()
            )))
        );
        assert!(matches!(
            runtime.resolve_field(&method, 3),
            Err(RedefineError::Linkage(LinkageError::NoSuchField { .. }))
        ));

        let failed = || Err(LinkageError::Bootstrap("no".to_owned()));
        assert!(matches!(
            runtime.resolve_dynamic(&method, 7, |_, _| failed()),
            Err(RedefineError::Linkage(_))
        ));
        assert!(matches!(
            runtime.resolve_dynamic(&method, 7, |_, _| Ok(1)),
            Err(RedefineError::LinkageFailureSticky(_))
        ));
    }
}
