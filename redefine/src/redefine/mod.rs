//! Replacing the definitions of loaded classes.
//!
//! A batch of requests goes through [`RedefinitionPhase`]s. Everything up to
//! [`RedefinitionPhase::AwaitingSync`] may fail and only builds new, unpublished data. Installing
//! and fixing up happen at a safepoint and can't fail, so a batch either installs completely or
//! not at all.

use redefine_base::{id::MethodKey, ClassId, IdSet, Symbol};

use crate::error::RedefineError;

mod coordinator;
mod install;

pub use coordinator::RedefinitionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RedefinitionPhase {
    Requested,
    Loading,
    Verifying,
    Merging,
    AwaitingSync,
    Installing,
    FixingUp,
    Done,
    Failed,
}
impl RedefinitionPhase {
    /// Whether work in this phase is allowed to fail
    #[must_use]
    pub fn is_fallible(self) -> bool {
        self < RedefinitionPhase::Installing
    }

    #[must_use]
    pub fn can_advance_to(self, next: RedefinitionPhase) -> bool {
        use RedefinitionPhase as P;
        match (self, next) {
            (from, P::Failed) => from.is_fallible(),
            (P::Requested, P::Loading)
            | (P::Loading, P::Verifying)
            | (P::Verifying, P::Merging)
            | (P::Merging, P::AwaitingSync)
            | (P::AwaitingSync, P::Installing)
            | (P::Installing, P::FixingUp)
            | (P::FixingUp, P::Done) => true,
            _ => false,
        }
    }
}

/// The phases one class's redefinition has gone through
#[derive(Debug, Clone)]
pub(crate) struct PhaseTracker {
    class: Symbol,
    history: Vec<RedefinitionPhase>,
}
impl PhaseTracker {
    pub(crate) fn new(class: Symbol) -> PhaseTracker {
        PhaseTracker {
            class,
            history: vec![RedefinitionPhase::Requested],
        }
    }

    pub(crate) fn phase(&self) -> RedefinitionPhase {
        self.history
            .last()
            .copied()
            .unwrap_or(RedefinitionPhase::Requested)
    }

    pub(crate) fn advance(&mut self, next: RedefinitionPhase) {
        let current = self.phase();
        if !current.can_advance_to(next) {
            tracing::error!(
                "Redefinition of {} moved from {:?} to {:?}",
                self.class,
                current,
                next
            );
        }
        tracing::info!("{}: {:?}", self.class, next);
        self.history.push(next);
    }

    pub(crate) fn fail(&mut self, err: &RedefineError) {
        tracing::warn!(
            "Redefinition of {} failed while {:?}: {}",
            self.class,
            self.phase(),
            err
        );
        self.advance(RedefinitionPhase::Failed);
    }

    pub(crate) fn into_history(self) -> Vec<RedefinitionPhase> {
        self.history
    }
}

/// What a successful redefinition did to one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassReport {
    pub class: ClassId,
    pub name: Symbol,
    /// The version number that was installed
    pub version: u32,
    pub redefinition_id: u64,
    pub redefinition_count: u32,
    /// Matched methods whose old version is equivalent modulo constant pool
    pub emcp_methods: usize,
    pub obsolete_methods: usize,
    pub added_methods: usize,
    pub deleted_methods: usize,
    /// Entries the merge appended to the old pool
    pub appended_entries: usize,
    /// Candidate pool entries that ended up at a different index
    pub moved_entries: usize,
    /// `ldc` instructions that became `ldc_w`
    pub widened_loads: usize,
    /// Whether the replaced version is kept for frames still running it
    pub kept_previous_version: bool,
    pub phases: Vec<RedefinitionPhase>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedefinitionReport {
    /// The redefinition epoch once the batch was installed
    pub epoch: u64,
    pub classes: Vec<ClassReport>,
    /// Entries of other classes' tables and caches pointed at replacement methods
    pub retargeted: usize,
}

/// Sent to listeners once for every class a batch installs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedefinitionEvent {
    /// Unique across the whole runtime, increasing
    pub redefinition_id: u64,
    pub class: ClassId,
    pub name: Symbol,
    pub redefinition_count: u32,
    pub epoch: u64,
}

pub trait RedefinitionListener: Send + Sync {
    fn on_redefined(&self, event: &RedefinitionEvent);
}

/// What compiled code must be thrown away after a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependents {
    pub classes: IdSet<ClassId>,
    /// Every method of every version of the redefined classes
    pub methods: IdSet<MethodKey>,
}

/// A compiler which may have inlined methods that were just replaced
pub trait CompiledCode: Send + Sync {
    /// Called once per installed batch, at the safepoint
    fn flush_dependents(&self, dependents: &Dependents);
}

/// For runtimes without a compiler
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompiledCode;
impl CompiledCode for NoCompiledCode {
    fn flush_dependents(&self, _dependents: &Dependents) {}
}

#[cfg(test)]
mod tests {
    use super::RedefinitionPhase as P;

    #[test]
    fn test_phase_transitions() {
        let order = [
            P::Requested,
            P::Loading,
            P::Verifying,
            P::Merging,
            P::AwaitingSync,
            P::Installing,
            P::FixingUp,
            P::Done,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]));
            assert!(!pair[1].can_advance_to(pair[0]));
        }

        assert!(P::Merging.can_advance_to(P::Failed));
        assert!(P::AwaitingSync.can_advance_to(P::Failed));
        assert!(!P::Installing.can_advance_to(P::Failed));
        assert!(!P::FixingUp.can_advance_to(P::Failed));
        assert!(!P::Loading.can_advance_to(P::Merging));
    }
}
