use crate::constant_pool::PoolIndex;

use self::{
    op::RawOpcode,
    stack_map::StackMapTable,
    stream::{BytecodeStream, Instruction},
};

pub mod op;
pub mod relocate;
pub mod stack_map;
pub mod stream;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InstructionParseError {
    NotEnoughData {
        opcode: RawOpcode,
        needed: usize,
        had: usize,
    },
    ExpectedOpCodeAt(usize),
    UnknownOpcode {
        idx: usize,
        opcode: RawOpcode,
    },
    UnknownWideOpcode {
        idx: usize,
        opcode: RawOpcode,
    },
    /// A `tableswitch` whose high bound is below its low bound, or a `lookupswitch` with a
    /// negative pair count
    InvalidSwitch {
        idx: usize,
    },
}
impl std::fmt::Display for InstructionParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstructionParseError::NotEnoughData {
                opcode,
                needed,
                had,
            } => write!(
                f,
                "opcode {:#04x} needed {} bytes of code but there were {}",
                opcode, needed, had
            ),
            InstructionParseError::ExpectedOpCodeAt(idx) => {
                write!(f, "expected an opcode at {}", idx)
            }
            InstructionParseError::UnknownOpcode { idx, opcode } => {
                write!(f, "unknown opcode {:#04x} at {}", opcode, idx)
            }
            InstructionParseError::UnknownWideOpcode { idx, opcode } => {
                write!(f, "opcode {:#04x} cannot be modified by wide at {}", opcode, idx)
            }
            InstructionParseError::InvalidSwitch { idx } => {
                write!(f, "malformed switch at {}", idx)
            }
        }
    }
}
impl std::error::Error for InstructionParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    /// Exclusive
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Zero catches everything
    pub catch_type: PoolIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line_number: u16,
}

/// An entry of either the `LocalVariableTable` or the `LocalVariableTypeTable`.
/// For the latter the descriptor is a generic signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: PoolIndex,
    pub descriptor_index: PoolIndex,
    pub index: u16,
}

/// The `Code` attribute of a method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub line_numbers: Option<Vec<LineNumber>>,
    pub local_variables: Option<Vec<LocalVariable>>,
    pub local_variable_types: Option<Vec<LocalVariable>>,
    pub stack_map: Option<StackMapTable>,
}
impl Code {
    /// Code with no tables
    #[must_use]
    pub fn new(max_stack: u16, max_locals: u16, bytecode: Vec<u8>) -> Code {
        Code {
            max_stack,
            max_locals,
            bytecode,
            exception_table: Vec::new(),
            line_numbers: None,
            local_variables: None,
            local_variable_types: None,
            stack_map: None,
        }
    }

    pub fn instructions(&self) -> BytecodeStream<'_> {
        BytecodeStream::new(&self.bytecode)
    }

    pub fn decode(&self) -> Result<Vec<Instruction>, InstructionParseError> {
        BytecodeStream::decode_all(&self.bytecode)
    }

    /// A table of which bytecode indices begin an instruction.
    /// It has one extra slot for the end of the code, which is never a start.
    pub fn instruction_starts(&self) -> Result<Vec<bool>, InstructionParseError> {
        let mut starts = vec![false; self.bytecode.len() + 1];
        for inst in self.instructions() {
            starts[inst?.bci] = true;
        }
        Ok(starts)
    }
}
