use std::sync::Arc;

use redefine_base::{
    class_file::ClassFileReader,
    verify::VerifyTarget,
    ClassData, ClassId, ConstantPool, IdSet, MethodIdnum, Symbol,
};

use super::{PhaseTracker, RedefinitionEvent, RedefinitionPhase, RedefinitionReport};
use crate::{
    class::{ClassVersion, LoadedClass},
    compare::{check_compatibility, reconcile_methods},
    emcp::methods_emcp,
    error::{BatchError, RedefineError},
    method::Method,
    pool_merge::{merge_constant_pools, MergeResult},
    rewrite::{link::unlink_code, rewrite_class, unrewrite_class, RewriteJournal},
    runtime::Runtime,
};

/// Replace the class `target` with the class file `bytes`
#[derive(Debug, Clone, Copy)]
pub struct RedefinitionRequest<'a> {
    pub target: ClassId,
    pub bytes: &'a [u8],
}

/// A redefinition that has passed every check, waiting to be installed
#[derive(Debug)]
pub(super) struct PreparedClass {
    pub(super) class: Arc<LoadedClass>,
    pub(super) version: Arc<ClassVersion>,
    /// Each old method with its replacement, and whether the two are equivalent modulo pool
    pub(super) pairs: Vec<(Arc<Method>, Arc<Method>, bool)>,
    pub(super) added: Vec<Arc<Method>>,
    pub(super) deleted: Vec<Arc<Method>>,
    /// Idnums for the old methods that become obsolete, in `pairs` order
    pub(super) obsolete_idnums: Vec<MethodIdnum>,
    pub(super) appended: usize,
    pub(super) moved: usize,
    pub(super) widened: usize,
}

impl Runtime {
    /// Redefine a batch of classes. Either every class is installed, or none are and the
    /// error holds the failure of each class that could not be prepared.
    pub fn redefine_classes(
        &self,
        requests: &[RedefinitionRequest<'_>],
    ) -> Result<RedefinitionReport, BatchError> {
        let mut failures = Vec::new();
        let mut targets = Vec::with_capacity(requests.len());
        let mut seen = IdSet::default();
        for request in requests {
            if !seen.insert(request.target) {
                failures.push((
                    request.target,
                    RedefineError::InvalidTarget(format!(
                        "{:?} is named more than once",
                        request.target
                    )),
                ));
                continue;
            }
            match self.class(request.target) {
                Some(class) => targets.push((class, request.bytes)),
                None => failures.push((
                    request.target,
                    RedefineError::InvalidTarget(format!("no class {:?}", request.target)),
                )),
            }
        }
        if !failures.is_empty() {
            return Err(BatchError { failures });
        }

        let ids: Vec<ClassId> = targets.iter().map(|(class, _)| class.id()).collect();
        let _guard = self.locks.acquire(&ids);

        let mut prepared = Vec::with_capacity(targets.len());
        for (request, (class, bytes)) in targets.iter().enumerate() {
            let span = tracing::span!(
                tracing::Level::INFO,
                "prepare",
                request = request as u64,
                class = %class.name()
            );
            let _span = span.enter();

            let mut tracker = PhaseTracker::new(class.name().clone());
            match self.prepare(class, bytes, &mut tracker) {
                Ok(class) => prepared.push((class, tracker)),
                Err(err) => {
                    tracker.fail(&err);
                    failures.push((class.id(), err));
                }
            }
        }
        if !failures.is_empty() {
            tracing::warn!(
                "Abandoned a batch of {} redefinition(s), {} failed",
                targets.len(),
                failures.len()
            );
            return Err(BatchError { failures });
        }

        let mut installed = None;
        self.world.synchronize(&mut || {
            installed = Some(self.install_all(std::mem::take(&mut prepared)));
        });
        let report = installed.ok_or_else(|| BatchError {
            failures: ids
                .iter()
                .map(|&id| {
                    (
                        id,
                        RedefineError::InternalInvariantViolation(
                            "the safepoint never ran the installation".to_owned(),
                        ),
                    )
                })
                .collect(),
        })?;

        let listeners = self.listeners.read();
        for class in &report.classes {
            let event = RedefinitionEvent {
                redefinition_id: class.redefinition_id,
                class: class.class,
                name: class.name.clone(),
                redefinition_count: class.redefinition_count,
                epoch: report.epoch,
            };
            for listener in listeners.iter() {
                listener.on_redefined(&event);
            }
        }

        tracing::info!(
            "Installed {} redefinition(s) at epoch {}",
            report.classes.len(),
            report.epoch
        );
        Ok(report)
    }

    pub fn redefine_class(
        &self,
        target: ClassId,
        bytes: &[u8],
    ) -> Result<RedefinitionReport, RedefineError> {
        self.redefine_classes(&[RedefinitionRequest { target, bytes }])
            .map_err(|err| match err.failures.into_iter().next() {
                Some((_, err)) => err,
                None => RedefineError::InternalInvariantViolation(
                    "a failed batch reported no failures".to_owned(),
                ),
            })
    }

    /// Everything about a redefinition that may fail. Nothing visible to other threads is
    /// changed, apart from reserving method idnums.
    fn prepare(
        &self,
        class: &Arc<LoadedClass>,
        bytes: &[u8],
        tracker: &mut PhaseTracker,
    ) -> Result<PreparedClass, RedefineError> {
        tracker.advance(RedefinitionPhase::Loading);
        let (mut data, scratch) = ClassFileReader::new(&self.symbols).parse(bytes)?;

        tracker.advance(RedefinitionPhase::Verifying);
        self.verifier
            .verify(&VerifyTarget::new(&data, &scratch).with_host_name(class.name()))?;

        tracker.advance(RedefinitionPhase::Merging);
        let current = class.current();
        let old_pool = current.pool().unresolved_copy();
        check_compatibility(current.data(), &old_pool, &data, &scratch)?;
        let matches = reconcile_methods(
            current.methods(),
            &data,
            &scratch,
            self.conf.method_change_policy,
        )?;

        let mut emcp = Vec::with_capacity(matches.matched.len());
        for (old, position) in &matches.matched {
            let old_code = old
                .code()
                .map(|code| unlink_code(code, old.cache()))
                .transpose()?;
            emcp.push(methods_emcp(
                old_code.as_ref(),
                &old_pool,
                &data.methods[*position],
                &scratch,
            )?);
        }

        let merge = merge_constant_pools(current.pool(), &scratch)?;
        let original = self.conf.verify_merged.then(|| data.clone());
        let journal = rewrite_class(&mut data, &merge.map)?;
        if let Some(original) = original {
            self.check_merged(class.name(), &original, &data, &scratch, &merge, &journal)?;
        }

        // Replacements take over the idnums of the methods they replace, so that lookups by
        // idnum find the newest version. Old methods that stay reachable need new ones.
        let obsolete = emcp.iter().filter(|&&emcp| !emcp).count();
        let fresh = matches.added.len() + obsolete;
        let first = u16::try_from(fresh)
            .ok()
            .and_then(|count| class.reserve_method_idnums(count))
            .ok_or_else(|| {
                RedefineError::ResourceExhaustion(format!(
                    "{} has run out of method idnums",
                    class.name()
                ))
            })?;
        let mut fresh_idnums = (0..fresh).map(|i| MethodIdnum::new(first.get() + i as u16));

        let mut idnums = vec![MethodIdnum::new(0); data.methods.len()];
        for (old, position) in &matches.matched {
            idnums[*position] = old.idnum();
        }
        for (&position, idnum) in matches.added.iter().zip(fresh_idnums.by_ref()) {
            idnums[position] = idnum;
        }
        let obsolete_idnums = fresh_idnums.collect();

        let stats = (merge.appended, merge.map.len(), journal.widened_count());
        let version = Arc::new(self.link_version(
            class.id(),
            current.number() + 1,
            data,
            merge.pool,
            &idnums,
        )?);

        let by_position: Vec<Arc<Method>> = version.methods_in_original_order().cloned().collect();
        let at = |position: usize| {
            by_position.get(position).cloned().ok_or_else(|| {
                RedefineError::InternalInvariantViolation(format!(
                    "no linked method at position {}",
                    position
                ))
            })
        };
        let mut pairs = Vec::with_capacity(matches.matched.len());
        for ((old, position), emcp) in matches.matched.into_iter().zip(emcp) {
            pairs.push((old, at(position)?, emcp));
        }
        let added = matches
            .added
            .iter()
            .map(|&position| at(position))
            .collect::<Result<_, _>>()?;

        tracing::debug!(
            "Prepared version {} of {}: {} obsolete, {} appended entries, {} moved",
            version.number(),
            class.name(),
            obsolete,
            stats.0,
            stats.1
        );
        tracker.advance(RedefinitionPhase::AwaitingSync);
        Ok(PreparedClass {
            class: Arc::clone(class),
            version,
            pairs,
            added,
            deleted: matches.deleted,
            obsolete_idnums,
            appended: stats.0,
            moved: stats.1,
            widened: stats.2,
        })
    }

    /// Verify a rewritten candidate against the merged pool, and check that undoing the rewrite
    /// gives back exactly what was parsed
    fn check_merged(
        &self,
        name: &Symbol,
        original: &ClassData,
        rewritten: &ClassData,
        scratch: &ConstantPool,
        merge: &MergeResult,
        journal: &RewriteJournal,
    ) -> Result<(), RedefineError> {
        self.verifier
            .verify(&VerifyTarget::new(rewritten, &merge.pool).with_host_name(name))?;

        let operand_count = scratch.operands().len() as u16;
        if !merge.map.is_invertible(scratch.count(), operand_count) {
            tracing::debug!("Merge of {} can't be inverted, not checking the rewrite", name);
            return Ok(());
        }

        let mut restored = rewritten.clone();
        unrewrite_class(&mut restored, &merge.map.inverse(), journal)?;
        if &restored != original {
            return Err(RedefineError::InternalInvariantViolation(format!(
                "undoing the rewrite of {} did not restore it",
                name
            )));
        }
        Ok(())
    }
}
