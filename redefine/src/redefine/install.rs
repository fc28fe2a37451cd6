//! The part of a redefinition that runs at the safepoint. None of it can fail.

use std::sync::{atomic::Ordering, Arc};

use redefine_base::{id::MethodKey, IdMap};

use super::{
    coordinator::PreparedClass, ClassReport, Dependents, PhaseTracker, RedefinitionPhase,
    RedefinitionReport,
};
use crate::{frames::FrameOracle, method::MethodState, runtime::Runtime};

impl Runtime {
    pub(super) fn install_all(
        &self,
        prepared: Vec<(PreparedClass, PhaseTracker)>,
    ) -> RedefinitionReport {
        let mut replacements = IdMap::default();
        let mut dependents = Dependents::default();

        let mut installed = Vec::with_capacity(prepared.len());
        for (request, (class, mut tracker)) in prepared.into_iter().enumerate() {
            let span = tracing::span!(
                tracing::Level::INFO,
                "install",
                request = request as u64,
                class = %class.class.name()
            );
            let _span = span.enter();
            tracker.advance(RedefinitionPhase::Installing);
            let report = self.install(class, &mut replacements, &mut dependents);
            installed.push((report, tracker));
        }

        for (_, tracker) in &mut installed {
            tracker.advance(RedefinitionPhase::FixingUp);
        }
        let retargeted = self.fix_up(&replacements, &dependents);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        let classes = installed
            .into_iter()
            .map(|(mut report, mut tracker)| {
                tracker.advance(RedefinitionPhase::Done);
                report.phases = tracker.into_history();
                report
            })
            .collect();
        RedefinitionReport {
            epoch,
            classes,
            retargeted,
        }
    }

    fn install(
        &self,
        prepared: PreparedClass,
        replacements: &mut IdMap<MethodKey, MethodKey>,
        dependents: &mut Dependents,
    ) -> ClassReport {
        let PreparedClass {
            class,
            version,
            pairs,
            added,
            deleted,
            obsolete_idnums,
            appended,
            moved,
            widened,
        } = prepared;

        let mut obsolete_idnums = obsolete_idnums.into_iter();
        let mut emcp_methods = 0;
        let mut obsolete_methods = 0;
        for (old, new, emcp) in &pairs {
            if *emcp {
                old.set_state(MethodState::OldEmcp);
                emcp_methods += 1;
            } else {
                old.set_state(MethodState::OldObsolete);
                if let Some(idnum) = obsolete_idnums.next() {
                    old.set_idnum(idnum);
                }
                obsolete_methods += 1;
            }
            if new.info().is_native() {
                new.bind_native(old.native_binding());
            }
            replacements.insert(old.key(), new.key());
            dependents.methods.insert(old.key());
        }
        for method in &deleted {
            tracing::debug!("Deleted {}", method.display_name());
            method.set_state(MethodState::Deleted);
            dependents.methods.insert(method.key());
        }
        dependents.classes.insert(class.id());

        let previous = class.swap_current(Arc::clone(&version));
        let running = previous
            .methods()
            .iter()
            .any(|method| self.frames.is_executing(method.key()));
        // Nothing could tell a fully equivalent version apart from its replacement
        let keep_previous = running || obsolete_methods != 0 || !deleted.is_empty();
        if keep_previous {
            class.history().push(previous);
        }

        self.register_methods(version.methods());
        let redefinition_count = class.increment_redefinition_count();
        let redefinition_id = self.next_redefinition_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Installed version {} of {} ({} equivalent, {} obsolete, {} added, {} deleted)",
            version.number(),
            class.name(),
            emcp_methods,
            obsolete_methods,
            added.len(),
            deleted.len()
        );

        ClassReport {
            class: class.id(),
            name: class.name().clone(),
            version: version.number(),
            redefinition_id,
            redefinition_count,
            emcp_methods,
            obsolete_methods,
            added_methods: added.len(),
            deleted_methods: deleted.len(),
            appended_entries: appended,
            moved_entries: moved,
            widened_loads: widened,
            kept_previous_version: keep_previous,
            phases: Vec::new(),
        }
    }

    /// Point every table and cache at the replacements, and drop stale profiles.
    /// Returns how many table slots and cache entries changed.
    fn fix_up(
        &self,
        replacements: &IdMap<MethodKey, MethodKey>,
        dependents: &Dependents,
    ) -> usize {
        let mut retargeted = 0;
        let mut cleaned = 0;
        for class in self.classes() {
            retargeted += class.retarget_dispatch(replacements);

            let current = class.current();
            let history = class.history();
            for version in std::iter::once(&current).chain(history.iter()) {
                retargeted += version.cache().retarget_methods(replacements);
                for method in version.methods() {
                    cleaned += method
                        .profile()
                        .clean(|key| dependents.methods.contains(&key));
                }
            }
        }
        tracing::debug!(
            "Retargeted {} slot(s) and cleaned {} profile row(s)",
            retargeted,
            cleaned
        );

        self.compiled.flush_dependents(dependents);

        if self.conf.check_fixups {
            self.check_fix_ups(replacements);
        }
        retargeted
    }

    /// Look for anything that still refers to a replaced method
    fn check_fix_ups(&self, replacements: &IdMap<MethodKey, MethodKey>) {
        for class in self.classes() {
            let current = class.current();
            let stale = class
                .dispatch_targets()
                .into_iter()
                .chain(current.cache().referenced_methods())
                .filter(|key| replacements.contains_key(key))
                .count();
            if stale != 0 {
                tracing::error!(
                    "{} still refers to {} replaced method(s) after fixing up",
                    class.name(),
                    stale
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use redefine_base::{
        builder::{ClassBuilder, CodeBuilder},
        verify::Verifier,
        MethodAccessFlags,
    };
    use redefine_verifier::StructuralVerifier;

    use crate::{
        config::{MethodChangePolicy, RedefineConfig},
        method::{MethodState, NativeBinding},
        redefine::{CompiledCode, Dependents},
        runtime::{
            tests::{class_bytes, string_method},
            Runtime,
        },
        safepoint::WorldLock,
    };

    #[derive(Default)]
    struct FlushLog {
        flushed: Arc<Mutex<Vec<Dependents>>>,
    }
    impl CompiledCode for FlushLog {
        fn flush_dependents(&self, dependents: &Dependents) {
            self.flushed.lock().push(dependents.clone());
        }
    }

    fn runtime(policy: MethodChangePolicy) -> (Runtime, Arc<Mutex<Vec<Dependents>>>) {
        let mut conf = RedefineConfig::new();
        conf.method_change_policy = policy;
        conf.check_fixups = true;
        let log = FlushLog::default();
        let flushed = Arc::clone(&log.flushed);
        let verifier: Box<dyn Verifier> = Box::new(StructuralVerifier::default());
        let runtime =
            Runtime::with_collaborators(conf, verifier, Arc::new(WorldLock::new()), Box::new(log));
        (runtime, flushed)
    }

    fn private_helper(class: &mut ClassBuilder, name: &str) {
        let mut code = CodeBuilder::new();
        code.ret();
        class.method(
            MethodAccessFlags::PRIVATE | MethodAccessFlags::STATIC,
            name,
            "()V",
            Some(code.build(0, 0)),
        );
    }

    #[test]
    fn test_added_and_deleted_methods() {
        let (runtime, flushed) = runtime(MethodChangePolicy::Private);
        let id = runtime
            .define_class(&class_bytes("demo/Shape", Some("java/lang/Object"), |c| {
                string_method(c, "get", "x");
                private_helper(c, "before");
            }))
            .unwrap();
        let before = runtime.find_method(id, "before", "()V").unwrap();
        let get = runtime.find_method(id, "get", "()Ljava/lang/Object;").unwrap();

        let report = runtime
            .redefine_class(
                id,
                &class_bytes("demo/Shape", Some("java/lang/Object"), |c| {
                    string_method(c, "get", "x");
                    private_helper(c, "after");
                }),
            )
            .unwrap();
        let class_report = &report.classes[0];
        assert_eq!(class_report.added_methods, 1);
        assert_eq!(class_report.deleted_methods, 1);
        assert_eq!(class_report.emcp_methods, 1);
        assert!(class_report.kept_previous_version);

        assert_eq!(before.state(), MethodState::Deleted);
        assert_eq!(get.state(), MethodState::OldEmcp);
        let after = runtime.find_method(id, "after", "()V").unwrap();
        // Two methods were defined, so the first fresh idnum is 2
        assert_eq!(after.idnum().get(), 2);
        assert!(runtime.find_method(id, "before", "()V").is_none());

        let flushed = flushed.lock();
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].classes.contains(&id));
        assert!(flushed[0].methods.contains(&before.key()));
        assert!(flushed[0].methods.contains(&get.key()));
    }

    #[test]
    fn test_native_binding_carries_over() {
        let (runtime, _) = runtime(MethodChangePolicy::Disallow);
        let native = |c: &mut ClassBuilder| {
            c.method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC | MethodAccessFlags::NATIVE,
                "hash",
                "()I",
                None,
            );
        };
        let bytes = class_bytes("demo/Native", Some("java/lang/Object"), |c| {
            native(c);
            string_method(c, "get", "one");
        });
        let id = runtime.define_class(&bytes).unwrap();
        runtime
            .find_method(id, "hash", "()I")
            .unwrap()
            .bind_native(Some(NativeBinding(0x1000)));

        let changed = class_bytes("demo/Native", Some("java/lang/Object"), |c| {
            native(c);
            string_method(c, "get", "two");
        });
        runtime.redefine_class(id, &changed).unwrap();
        let hash = runtime.find_method(id, "hash", "()I").unwrap();
        assert_eq!(hash.native_binding(), Some(NativeBinding(0x1000)));
        assert_eq!(hash.state(), MethodState::Current);
    }

    #[test]
    fn test_profiles_forget_replaced_methods() {
        let (runtime, _) = runtime(MethodChangePolicy::Disallow);
        let callee = runtime
            .define_class(&class_bytes("demo/Target", Some("java/lang/Object"), |c| {
                string_method(c, "get", "a");
            }))
            .unwrap();
        let user = runtime
            .define_class(&class_bytes("demo/User", Some("java/lang/Object"), |c| {
                string_method(c, "use", "b");
            }))
            .unwrap();
        let old = runtime.find_method(callee, "get", "()Ljava/lang/Object;").unwrap();
        let profiled = runtime.find_method(user, "use", "()Ljava/lang/Object;").unwrap();
        profiled.profile().record(0, Some(callee), Some(old.key()));
        profiled.profile().record(3, None, None);

        runtime
            .redefine_class(
                callee,
                &class_bytes("demo/Target", Some("java/lang/Object"), |c| {
                    string_method(c, "get", "c");
                }),
            )
            .unwrap();
        let profile = profiled.profile();
        assert_eq!(profile.rows().len(), 1);
        assert_eq!(profile.rows()[0].bci, 3);
    }
}
