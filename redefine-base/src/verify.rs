//! The interface to bytecode verification.
//! Verification is a pass/fail oracle: nothing here decides what is type-safe, that is left to
//! an implementation of [`Verifier`].

use crate::{
    class::ClassData,
    code::InstructionParseError,
    constant_pool::{ConstantPool, ConstantPoolError, PoolIndex},
    descriptor::DescriptorError,
    symbol::Symbol,
};

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MethodVerifyError {
    Parse(InstructionParseError),
    Descriptor(DescriptorError),
    /// A method which must have code did not, or one which must not have it did
    CodePresence { expected: bool },
    /// An instruction referred to a pool entry of the wrong kind
    BadOperandTag {
        bci: usize,
        index: PoolIndex,
        expected: &'static str,
    },
    /// A malformed operand other than a pool index, such as a zero `invokeinterface` count
    BadOperand { bci: usize },
    BadBranchTarget { bci: usize, target: isize },
    /// Execution could run past the last instruction
    FallsOffEnd,
    BadExceptionHandler { index: usize },
    StackUnderflow { bci: usize },
    StackOverflow { bci: usize, max_stack: u16 },
    /// Two paths reach an instruction with different stack depths
    InconsistentStackDepth { bci: usize, first: u16, second: u16 },
    BadLocal { bci: usize, index: u16, max_locals: u16 },
    /// The parameters need more locals than the method has
    TooFewLocals { needed: u16, max_locals: u16 },
    StackMapFrameNotAtInstruction { offset: usize },
    MissingStackMap,
}
impl From<InstructionParseError> for MethodVerifyError {
    fn from(err: InstructionParseError) -> Self {
        MethodVerifyError::Parse(err)
    }
}
impl From<DescriptorError> for MethodVerifyError {
    fn from(err: DescriptorError) -> Self {
        MethodVerifyError::Descriptor(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerifyError {
    /// Verification only accepts pools whose class entries are all unresolved
    PreResolvedClass { index: PoolIndex },
    ConstantPool(ConstantPoolError),
    Method {
        name: String,
        descriptor: String,
        error: MethodVerifyError,
    },
    /// A rejection by some other oracle, with its reason
    Rejected(String),
}
impl From<ConstantPoolError> for VerifyError {
    fn from(err: ConstantPoolError) -> Self {
        VerifyError::ConstantPool(err)
    }
}
impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::PreResolvedClass { index } => {
                write!(f, "class entry #{} was already resolved", index)
            }
            VerifyError::ConstantPool(err) => write!(f, "{}", err),
            VerifyError::Method {
                name,
                descriptor,
                error,
            } => write!(f, "in {}{}: {:?}", name, descriptor, error),
            VerifyError::Rejected(reason) => f.write_str(reason),
        }
    }
}
impl std::error::Error for VerifyError {}

/// What to verify
#[derive(Clone, Copy)]
pub struct VerifyTarget<'a> {
    pub class: &'a ClassData,
    pub pool: &'a ConstantPool,
    /// When verifying a redefinition candidate, the name of the class it will replace.
    /// Type checks against the containing class then use this name.
    pub host_name: Option<&'a Symbol>,
}
impl<'a> VerifyTarget<'a> {
    #[must_use]
    pub fn new(class: &'a ClassData, pool: &'a ConstantPool) -> VerifyTarget<'a> {
        VerifyTarget {
            class,
            pool,
            host_name: None,
        }
    }

    #[must_use]
    pub fn with_host_name(mut self, host_name: &'a Symbol) -> VerifyTarget<'a> {
        self.host_name = Some(host_name);
        self
    }

    /// The name the class is verified under
    pub fn class_name(&self) -> Result<&'a Symbol, ConstantPoolError> {
        match self.host_name {
            Some(name) => Ok(name),
            None => self.class.name(self.pool),
        }
    }

    /// Whether the class entry at `index` refers to the class being verified
    #[must_use]
    pub fn is_own_class(&self, index: PoolIndex) -> bool {
        let name = match self.pool.class_name_at(index) {
            Ok(name) => name,
            Err(_) => return false,
        };
        self.class.name(self.pool).ok() == Some(name) || self.host_name == Some(name)
    }
}

pub trait Verifier: Send + Sync {
    fn verify(&self, target: &VerifyTarget<'_>) -> Result<(), VerifyError>;
}

/// Accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVerification;
impl Verifier for NoVerification {
    fn verify(&self, _target: &VerifyTarget<'_>) -> Result<(), VerifyError> {
        Ok(())
    }
}
