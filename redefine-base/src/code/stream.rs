use byteorder::{BigEndian, ByteOrder};
use smallvec::SmallVec;

use super::{
    op::{Opcode, OperandKind},
    InstructionParseError,
};

/// One decoded instruction's position and shape. Operands are read on demand from the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub bci: usize,
    pub opcode: Opcode,
    /// Whether this was prefixed by `wide`. The opcode is then the modified instruction.
    pub wide: bool,
    /// Length in bytes, including any `wide` prefix and switch padding
    pub len: usize,
}
impl Instruction {
    /// The position of the first operand byte
    #[must_use]
    pub fn operand_start(&self) -> usize {
        if self.wide {
            self.bci + 2
        } else {
            self.bci + 1
        }
    }

    #[must_use]
    pub fn next_bci(&self) -> usize {
        self.bci + self.len
    }

    /// The constant pool index this instruction refers to, in its symbolic big-endian form
    #[must_use]
    pub fn pool_index(&self, code: &[u8]) -> Option<u16> {
        let at = self.operand_start();
        match self.opcode.operand() {
            OperandKind::ConstantByte => code.get(at).map(|&index| u16::from(index)),
            kind if kind.has_pool_index() => code.get(at..at + 2).map(BigEndian::read_u16),
            _ => None,
        }
    }

    /// The absolute targets of a branch or switch, default target first for switches.
    /// Targets may be negative or past the end if the code is malformed.
    pub fn branch_targets(&self, code: &[u8]) -> Result<SmallVec<[isize; 2]>, InstructionParseError> {
        let bci = self.bci as isize;
        let at = self.operand_start();
        Ok(match self.opcode.operand() {
            OperandKind::Branch => {
                let offset = BigEndian::read_i16(slice(code, self.opcode, at, 2)?);
                smallvec::smallvec![bci + offset as isize]
            }
            OperandKind::WideBranch => {
                let offset = BigEndian::read_i32(slice(code, self.opcode, at, 4)?);
                smallvec::smallvec![bci + offset as isize]
            }
            OperandKind::TableSwitch | OperandKind::LookupSwitch => {
                let switch = Switch::parse(code, self.bci)?;
                switch
                    .offsets()
                    .map(|offset| bci + offset as isize)
                    .collect()
            }
            _ => SmallVec::new(),
        })
    }
}

fn slice(code: &[u8], opcode: Opcode, at: usize, len: usize) -> Result<&[u8], InstructionParseError> {
    let end = at.checked_add(len);
    end.and_then(|end| code.get(at..end))
        .ok_or(InstructionParseError::NotEnoughData {
            opcode: opcode.raw(),
            needed: end.unwrap_or(usize::MAX),
            had: code.len(),
        })
}

/// The padding after a switch opcode which aligns its operands to four bytes
#[must_use]
pub fn switch_padding(bci: usize) -> usize {
    (4 - (bci + 1) % 4) % 4
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchKind {
    Table {
        low: i32,
        high: i32,
        offsets: Vec<i32>,
    },
    /// Match value and offset pairs
    Lookup { pairs: Vec<(i32, i32)> },
}

/// A decoded `tableswitch` or `lookupswitch`. Offsets are relative to the opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switch {
    pub default: i32,
    pub kind: SwitchKind,
}
impl Switch {
    pub fn parse(code: &[u8], bci: usize) -> Result<Switch, InstructionParseError> {
        let opcode_raw = *code
            .get(bci)
            .ok_or(InstructionParseError::ExpectedOpCodeAt(bci))?;
        let opcode = Opcode::from_raw(opcode_raw)
            .ok_or(InstructionParseError::UnknownOpcode {
                idx: bci,
                opcode: opcode_raw,
            })?;
        let start = bci + 1 + switch_padding(bci);
        let read_i32 = |at: usize| slice(code, opcode, at, 4).map(BigEndian::read_i32);

        let default = read_i32(start)?;
        let kind = match opcode {
            Opcode::TableSwitch => {
                let low = read_i32(start + 4)?;
                let high = read_i32(start + 8)?;
                if high < low {
                    return Err(InstructionParseError::InvalidSwitch { idx: bci });
                }
                let count = (i64::from(high) - i64::from(low) + 1) as usize;
                // Check the whole table is present before allocating for it
                slice(code, opcode, start + 12, count.saturating_mul(4))?;
                let offsets = (0..count)
                    .map(|i| read_i32(start + 12 + i * 4))
                    .collect::<Result<Vec<_>, _>>()?;
                SwitchKind::Table { low, high, offsets }
            }
            Opcode::LookupSwitch => {
                let count = read_i32(start + 4)?;
                let count = usize::try_from(count)
                    .map_err(|_| InstructionParseError::InvalidSwitch { idx: bci })?;
                slice(code, opcode, start + 8, count.saturating_mul(8))?;
                let pairs = (0..count)
                    .map(|i| {
                        let at = start + 8 + i * 8;
                        Ok((read_i32(at)?, read_i32(at + 4)?))
                    })
                    .collect::<Result<Vec<_>, InstructionParseError>>()?;
                SwitchKind::Lookup { pairs }
            }
            _ => return Err(InstructionParseError::InvalidSwitch { idx: bci }),
        };

        Ok(Switch { default, kind })
    }

    /// Every relative offset, the default first
    pub fn offsets(&self) -> impl Iterator<Item = i32> + '_ {
        let rest: Box<dyn Iterator<Item = i32> + '_> = match &self.kind {
            SwitchKind::Table { offsets, .. } => Box::new(offsets.iter().copied()),
            SwitchKind::Lookup { pairs } => Box::new(pairs.iter().map(|(_, offset)| *offset)),
        };
        std::iter::once(self.default).chain(rest)
    }

    pub fn offsets_mut(&mut self) -> impl Iterator<Item = &mut i32> + '_ {
        let rest: Box<dyn Iterator<Item = &mut i32> + '_> = match &mut self.kind {
            SwitchKind::Table { offsets, .. } => Box::new(offsets.iter_mut()),
            SwitchKind::Lookup { pairs } => Box::new(pairs.iter_mut().map(|(_, offset)| offset)),
        };
        std::iter::once(&mut self.default).chain(rest)
    }

    /// The encoded length of this switch if its opcode were placed at `bci`
    #[must_use]
    pub fn len_at(&self, bci: usize) -> usize {
        let body = match &self.kind {
            SwitchKind::Table { offsets, .. } => 12 + offsets.len() * 4,
            SwitchKind::Lookup { pairs } => 8 + pairs.len() * 8,
        };
        1 + switch_padding(bci) + body
    }

    /// Encode the switch as though its opcode were at `bci`
    pub fn write(&self, out: &mut Vec<u8>, bci: usize) {
        let push_i32 = |out: &mut Vec<u8>, value: i32| {
            let mut buf = [0; 4];
            BigEndian::write_i32(&mut buf, value);
            out.extend_from_slice(&buf);
        };

        match &self.kind {
            SwitchKind::Table { low, high, offsets } => {
                out.push(Opcode::TableSwitch.raw());
                out.extend(std::iter::repeat(0).take(switch_padding(bci)));
                push_i32(out, self.default);
                push_i32(out, *low);
                push_i32(out, *high);
                for &offset in offsets {
                    push_i32(out, offset);
                }
            }
            SwitchKind::Lookup { pairs } => {
                out.push(Opcode::LookupSwitch.raw());
                out.extend(std::iter::repeat(0).take(switch_padding(bci)));
                push_i32(out, self.default);
                push_i32(out, pairs.len() as i32);
                for &(key, offset) in pairs {
                    push_i32(out, key);
                    push_i32(out, offset);
                }
            }
        }
    }
}

/// Decode the instruction starting at `bci`
pub fn decode_at(code: &[u8], bci: usize) -> Result<Instruction, InstructionParseError> {
    let raw = *code
        .get(bci)
        .ok_or(InstructionParseError::ExpectedOpCodeAt(bci))?;
    let opcode =
        Opcode::from_raw(raw).ok_or(InstructionParseError::UnknownOpcode { idx: bci, opcode: raw })?;

    let (opcode, wide, len) = match opcode {
        Opcode::Wide => {
            let raw = *code
                .get(bci + 1)
                .ok_or(InstructionParseError::NotEnoughData {
                    opcode: opcode.raw(),
                    needed: bci + 2,
                    had: code.len(),
                })?;
            let modified = Opcode::from_raw(raw)
                .filter(|modified| modified.is_widenable())
                .ok_or(InstructionParseError::UnknownWideOpcode { idx: bci, opcode: raw })?;
            let len = if modified == Opcode::Iinc { 6 } else { 4 };
            (modified, true, len)
        }
        Opcode::TableSwitch | Opcode::LookupSwitch => {
            let switch = Switch::parse(code, bci)?;
            (opcode, false, switch.len_at(bci))
        }
        // Every other opcode has a fixed length
        _ => (opcode, false, opcode.fixed_length().unwrap_or(1)),
    };

    if bci + len > code.len() {
        return Err(InstructionParseError::NotEnoughData {
            opcode: raw,
            needed: bci + len,
            had: code.len(),
        });
    }

    Ok(Instruction {
        bci,
        opcode,
        wide,
        len,
    })
}

/// Iterates over the instructions of a method's code.
/// After the first error it yields nothing more.
pub struct BytecodeStream<'a> {
    code: &'a [u8],
    bci: usize,
    failed: bool,
}
impl<'a> BytecodeStream<'a> {
    #[must_use]
    pub fn new(code: &'a [u8]) -> BytecodeStream<'a> {
        BytecodeStream {
            code,
            bci: 0,
            failed: false,
        }
    }

    /// Decode the whole method, failing on the first bad instruction
    pub fn decode_all(code: &'a [u8]) -> Result<Vec<Instruction>, InstructionParseError> {
        BytecodeStream::new(code).collect()
    }
}
impl<'a> Iterator for BytecodeStream<'a> {
    type Item = Result<Instruction, InstructionParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.bci >= self.code.len() {
            return None;
        }

        match decode_at(self.code, self.bci) {
            Ok(inst) => {
                self.bci = inst.next_bci();
                Some(Ok(inst))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
