use redefine_base::{
    class_file::ClassFileError,
    code::relocate::RelocationError,
    constant_pool::ConstantPoolError,
    verify::VerifyError,
    ClassAccessFlags, ClassId,
};
use thiserror::Error;

/// Why a redefinition (or a definition) failed.
/// Every one of these is raised before anything has been installed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RedefineError {
    #[error("malformed class file: {0}")]
    MalformedInput(ClassFileError),
    #[error("verification failed: {0}")]
    VerificationFailure(VerifyError),
    #[error("incompatible change: {0}")]
    IncompatibleSchema(SchemaChange),
    #[error("unsupported method change: {0}")]
    UnsupportedMethodChange(MethodChange),
    #[error("resources exhausted: {0}")]
    ResourceExhaustion(String),
    /// A logic error in redefinition itself
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),
    #[error("linkage failed: {0}")]
    Linkage(LinkageError),
    /// A dynamic call site whose bootstrap failed before, replayed
    #[error("linkage failed previously: {0}")]
    LinkageFailureSticky(LinkageError),
    /// The class named by a request is unknown or can't be redefined
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}
impl From<ClassFileError> for RedefineError {
    fn from(err: ClassFileError) -> Self {
        RedefineError::MalformedInput(err)
    }
}
impl From<VerifyError> for RedefineError {
    fn from(err: VerifyError) -> Self {
        RedefineError::VerificationFailure(err)
    }
}
impl From<SchemaChange> for RedefineError {
    fn from(change: SchemaChange) -> Self {
        RedefineError::IncompatibleSchema(change)
    }
}
impl From<MethodChange> for RedefineError {
    fn from(change: MethodChange) -> Self {
        RedefineError::UnsupportedMethodChange(change)
    }
}
impl From<LinkageError> for RedefineError {
    fn from(err: LinkageError) -> Self {
        RedefineError::Linkage(err)
    }
}
impl From<ConstantPoolError> for RedefineError {
    fn from(err: ConstantPoolError) -> Self {
        match err {
            ConstantPoolError::Overflow => RedefineError::ResourceExhaustion(err.to_string()),
            err => RedefineError::InternalInvariantViolation(err.to_string()),
        }
    }
}
impl From<RelocationError> for RedefineError {
    fn from(err: RelocationError) -> Self {
        match err {
            RelocationError::CodeTooLarge { .. } | RelocationError::BranchOutOfRange { .. } => {
                RedefineError::ResourceExhaustion(err.to_string())
            }
            err => RedefineError::InternalInvariantViolation(err.to_string()),
        }
    }
}

/// The ways a class's shape may not change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SchemaChange {
    /// The class name, superclass, or directly implemented interfaces changed
    #[error("hierarchy changed: {0}")]
    Hierarchy(String),
    /// A field was added, removed, reordered, or changed
    #[error("fields changed: {0}")]
    Fields(String),
    #[error("class modifiers changed from {old:?} to {new:?}")]
    Modifiers {
        old: ClassAccessFlags,
        new: ClassAccessFlags,
    },
    /// One of the attributes that take part in access control changed
    #[error("{name} attribute changed")]
    Attribute { name: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MethodChange {
    #[error("method {name}{descriptor} was added")]
    Added { name: String, descriptor: String },
    #[error("method {name}{descriptor} was deleted")]
    Deleted { name: String, descriptor: String },
    #[error("modifiers of method {name}{descriptor} changed")]
    ModifiersChanged { name: String, descriptor: String },
    /// The class needs more call site cache entries than an index can address
    #[error("{needed} call site cache entries do not fit in {bits} bit indices")]
    CacheIndexOverflow { needed: usize, bits: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LinkageError {
    #[error("no class {0}")]
    NoSuchClass(String),
    #[error("no method {class}.{name}{descriptor}")]
    NoSuchMethod {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("no field {class}.{name}:{descriptor}")]
    NoSuchField {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("bootstrap method failed: {0}")]
    Bootstrap(String),
    /// The site's cache entry or pool entry was not what the instruction needs
    #[error("bad call site: {0}")]
    BadCallSite(String),
}

/// A batch failed. Nothing in it was installed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("redefinition failed for {} class(es)", .failures.len())]
pub struct BatchError {
    /// One error for each class that failed
    pub failures: Vec<(ClassId, RedefineError)>,
}
impl BatchError {
    #[must_use]
    pub fn error_for(&self, class: ClassId) -> Option<&RedefineError> {
        self.failures
            .iter()
            .find(|(id, _)| *id == class)
            .map(|(_, err)| err)
    }
}
