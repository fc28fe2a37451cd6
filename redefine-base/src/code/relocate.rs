//! Rebuilding a method's code when instructions change length.
//! The new buffer is emitted fresh while tracking where every old bytecode index landed, and that
//! map is then used to fix every branch, switch, exception handler, debug table and stack map
//! frame in a single pass.

use byteorder::{BigEndian, ByteOrder};

use super::{
    op::{Opcode, OperandKind},
    stack_map::VerificationType,
    stream::{decode_at, Instruction, Switch},
    Code, InstructionParseError,
};

/// The largest a method's code may be
pub const MAX_CODE_LENGTH: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RelocationError {
    Parse(InstructionParseError),
    /// A replacement did not land on the start of an instruction
    NotInstructionStart { bci: usize },
    /// Two replacements were given for the same instruction
    DuplicateReplacement { bci: usize },
    /// The replacement bytes were not a single instruction that may be moved freely
    InvalidReplacement { bci: usize },
    /// A branch, handler or table refers to somewhere that is not an instruction start
    InvalidTarget { bci: usize, target: isize },
    /// A short branch no longer reaches its target
    BranchOutOfRange { bci: usize, offset: isize },
    CodeTooLarge { len: usize },
    /// The stack map frames are no longer in increasing order
    StackMapOrder,
}
impl From<InstructionParseError> for RelocationError {
    fn from(err: InstructionParseError) -> Self {
        RelocationError::Parse(err)
    }
}
impl std::fmt::Display for RelocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelocationError::Parse(err) => write!(f, "{}", err),
            RelocationError::NotInstructionStart { bci } => {
                write!(f, "replacement at {} is not an instruction start", bci)
            }
            RelocationError::DuplicateReplacement { bci } => {
                write!(f, "more than one replacement at {}", bci)
            }
            RelocationError::InvalidReplacement { bci } => {
                write!(f, "replacement at {} is not a single movable instruction", bci)
            }
            RelocationError::InvalidTarget { bci, target } => {
                write!(f, "reference at {} to {} which is not an instruction", bci, target)
            }
            RelocationError::BranchOutOfRange { bci, offset } => {
                write!(f, "branch at {} cannot reach offset {}", bci, offset)
            }
            RelocationError::CodeTooLarge { len } => {
                write!(f, "code of length {} exceeds the maximum", len)
            }
            RelocationError::StackMapOrder => f.write_str("stack map frames out of order"),
        }
    }
}
impl std::error::Error for RelocationError {}

/// Substitute the instruction at `bci` with `bytes`, which must encode exactly one instruction
/// that is not a branch or switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub bci: usize,
    pub bytes: Vec<u8>,
}
impl Replacement {
    #[must_use]
    pub fn new(bci: usize, bytes: Vec<u8>) -> Replacement {
        Replacement { bci, bytes }
    }
}

/// Where each old bytecode index ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BciMap {
    /// Indexed by old bci, with one extra slot for the end of the code
    new_bci: Vec<usize>,
    starts: Vec<bool>,
}
impl BciMap {
    /// The identity map for code of the given length
    #[must_use]
    pub fn identity(len: usize, starts: Vec<bool>) -> BciMap {
        BciMap {
            new_bci: (0..=len).collect(),
            starts,
        }
    }

    /// The new position of an old bci, if that was an instruction start or the end of the code
    #[must_use]
    pub fn get(&self, old: usize) -> Option<usize> {
        let is_end = old + 1 == self.new_bci.len();
        if is_end || self.starts.get(old).copied().unwrap_or(false) {
            self.new_bci.get(old).copied()
        } else {
            None
        }
    }

    /// The new position of any old bci, including ones inside an instruction
    #[must_use]
    pub fn get_any(&self, old: usize) -> Option<usize> {
        self.new_bci.get(old).copied()
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.new_bci.iter().enumerate().all(|(old, new)| old == *new)
    }
}

fn map_target(map: &BciMap, at: usize, target: isize) -> Result<usize, RelocationError> {
    usize::try_from(target)
        .ok()
        .and_then(|target| map.get(target))
        .ok_or(RelocationError::InvalidTarget { bci: at, target })
}

/// Rebuild `code` with the given instructions replaced.
/// Returns the new code along with the map from old to new positions. On error `code` is left
/// untouched.
pub fn relocate(
    code: &Code,
    mut replacements: Vec<Replacement>,
) -> Result<(Code, BciMap), RelocationError> {
    let insts = code.decode()?;
    let old_len = code.bytecode.len();
    let mut starts = vec![false; old_len + 1];
    for inst in &insts {
        starts[inst.bci] = true;
    }

    replacements.sort_by_key(|r| r.bci);
    for pair in replacements.windows(2) {
        if pair[0].bci == pair[1].bci {
            return Err(RelocationError::DuplicateReplacement { bci: pair[0].bci });
        }
    }
    for replacement in &replacements {
        if !starts.get(replacement.bci).copied().unwrap_or(false) {
            return Err(RelocationError::NotInstructionStart {
                bci: replacement.bci,
            });
        }
        let valid = decode_at(&replacement.bytes, 0)
            .map(|inst| {
                inst.len == replacement.bytes.len()
                    && !inst.opcode.operand().is_branch()
                    && !matches!(
                        inst.opcode.operand(),
                        OperandKind::TableSwitch | OperandKind::LookupSwitch
                    )
            })
            .unwrap_or(false);
        if !valid {
            return Err(RelocationError::InvalidReplacement {
                bci: replacement.bci,
            });
        }
    }

    // Layout: assign each instruction its new position. Switch padding depends only on the
    // switch's own position so one forward pass is enough.
    let mut new_bci = vec![0; old_len + 1];
    let mut switches = Vec::new();
    let mut pending = replacements.iter().peekable();
    let mut layout: Vec<(&Instruction, Option<&Replacement>)> = Vec::with_capacity(insts.len());
    let mut cursor = 0;
    for inst in &insts {
        let replacement = pending.next_if(|r| r.bci == inst.bci);
        let len = if let Some(replacement) = replacement {
            replacement.bytes.len()
        } else if matches!(inst.opcode, Opcode::TableSwitch | Opcode::LookupSwitch) {
            let switch = Switch::parse(&code.bytecode, inst.bci)?;
            let len = switch.len_at(cursor);
            switches.push(switch);
            len
        } else {
            inst.len
        };

        // Positions inside an instruction follow its start, clamped to its new length
        for offset in 0..inst.len {
            new_bci[inst.bci + offset] = cursor + offset.min(len.saturating_sub(1));
        }
        layout.push((inst, replacement));
        cursor += len;
    }
    new_bci[old_len] = cursor;

    if cursor > MAX_CODE_LENGTH {
        return Err(RelocationError::CodeTooLarge { len: cursor });
    }

    let map = BciMap {
        new_bci,
        starts,
    };

    // Emit
    let mut out = Vec::with_capacity(cursor);
    let mut switches = switches.into_iter();
    for (inst, replacement) in layout {
        let at = out.len();
        if let Some(replacement) = replacement {
            out.extend_from_slice(&replacement.bytes);
            continue;
        }

        let old = &code.bytecode[inst.bci..inst.next_bci()];
        match inst.opcode.operand() {
            OperandKind::Branch => {
                let offset = BigEndian::read_i16(&old[1..3]);
                let target = map_target(&map, inst.bci, inst.bci as isize + isize::from(offset))?;
                let new_offset = target as isize - at as isize;
                let new_offset = i16::try_from(new_offset).map_err(|_| {
                    RelocationError::BranchOutOfRange {
                        bci: inst.bci,
                        offset: new_offset,
                    }
                })?;
                out.push(old[0]);
                let mut buf = [0; 2];
                BigEndian::write_i16(&mut buf, new_offset);
                out.extend_from_slice(&buf);
            }
            OperandKind::WideBranch => {
                let offset = BigEndian::read_i32(&old[1..5]);
                let target = map_target(&map, inst.bci, inst.bci as isize + offset as isize)?;
                // Code is at most 65535 bytes so this always fits
                let new_offset = (target as isize - at as isize) as i32;
                out.push(old[0]);
                let mut buf = [0; 4];
                BigEndian::write_i32(&mut buf, new_offset);
                out.extend_from_slice(&buf);
            }
            OperandKind::TableSwitch | OperandKind::LookupSwitch => {
                let mut switch = switches
                    .next()
                    .ok_or(InstructionParseError::InvalidSwitch { idx: inst.bci })?;
                for offset in switch.offsets_mut() {
                    let target = map_target(&map, inst.bci, inst.bci as isize + *offset as isize)?;
                    *offset = (target as isize - at as isize) as i32;
                }
                switch.write(&mut out, at);
            }
            _ => out.extend_from_slice(old),
        }
    }

    let mut new_code = Code {
        bytecode: out,
        ..code.clone()
    };
    remap_tables(&mut new_code, &map)?;

    Ok((new_code, map))
}

/// Move every bci carried by the code's tables according to `map`
fn remap_tables(code: &mut Code, map: &BciMap) -> Result<(), RelocationError> {
    let pos = |old: u16| -> Result<u16, RelocationError> {
        let new = map
            .get(usize::from(old))
            .ok_or(RelocationError::InvalidTarget {
                bci: usize::from(old),
                target: old as isize,
            })?;
        u16::try_from(new).map_err(|_| RelocationError::CodeTooLarge { len: new })
    };

    for handler in &mut code.exception_table {
        handler.start_pc = pos(handler.start_pc)?;
        handler.end_pc = pos(handler.end_pc)?;
        handler.handler_pc = pos(handler.handler_pc)?;
    }

    if let Some(lines) = &mut code.line_numbers {
        for line in lines {
            line.start_pc = pos(line.start_pc)?;
        }
    }

    for table in [&mut code.local_variables, &mut code.local_variable_types]
        .into_iter()
        .flatten()
    {
        for var in table.iter_mut() {
            let end = usize::from(var.start_pc) + usize::from(var.length);
            let start = pos(var.start_pc)?;
            // The end of a range may be inside an instruction in sloppy class files
            let end = map
                .get_any(end)
                .ok_or(RelocationError::InvalidTarget {
                    bci: usize::from(var.start_pc),
                    target: end as isize,
                })?;
            var.start_pc = start;
            var.length = u16::try_from(end.saturating_sub(usize::from(start)))
                .map_err(|_| RelocationError::CodeTooLarge { len: end })?;
        }
    }

    if let Some(stack_map) = &mut code.stack_map {
        let offsets = stack_map
            .frame_offsets()
            .into_iter()
            .map(|offset| {
                map.get(offset).ok_or(RelocationError::InvalidTarget {
                    bci: offset,
                    target: offset as isize,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if !stack_map.set_frame_offsets(&offsets) {
            return Err(RelocationError::StackMapOrder);
        }

        for ty in stack_map.types_mut() {
            if let VerificationType::Uninitialized(offset) = ty {
                *offset = pos(*offset)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{relocate, RelocationError, Replacement};
    use crate::code::{
        stack_map::{StackMapFrame, StackMapTable, VerificationType},
        Code, ExceptionHandler, LineNumber,
    };

    fn ldc_w(index: u16) -> Vec<u8> {
        let [hi, lo] = index.to_be_bytes();
        vec![0x13, hi, lo]
    }

    #[test]
    fn test_grow_shifts_branches_and_tables() {
        let bytecode = vec![
            0xA7, 0x00, 0x05, // 0: goto 5
            0x12, 0x01, // 3: ldc #1
            0x12, 0x02, // 5: ldc #2
            0x57, // 7: pop
            0xA7, 0xFF, 0xFB, // 8: goto 3
            0xB1, // 11: return
        ];
        let mut code = Code::new(1, 1, bytecode);
        code.exception_table.push(ExceptionHandler {
            start_pc: 3,
            end_pc: 8,
            handler_pc: 11,
            catch_type: 0,
        });
        code.line_numbers = Some(vec![
            LineNumber {
                start_pc: 0,
                line_number: 1,
            },
            LineNumber {
                start_pc: 5,
                line_number: 2,
            },
        ]);

        let (new, map) = relocate(&code, vec![Replacement::new(3, ldc_w(257))]).unwrap();
        assert_eq!(
            new.bytecode,
            vec![
                0xA7, 0x00, 0x06, // goto 6
                0x13, 0x01, 0x01, // ldc_w #257
                0x12, 0x02, // ldc #2
                0x57, // pop
                0xA7, 0xFF, 0xFA, // goto 3
                0xB1,
            ]
        );
        assert_eq!(map.get(5), Some(6));
        assert_eq!(map.get(4), None);
        assert_eq!(
            new.exception_table[0],
            ExceptionHandler {
                start_pc: 3,
                end_pc: 9,
                handler_pc: 12,
                catch_type: 0,
            }
        );
        assert_eq!(new.line_numbers.unwrap()[1].start_pc, 6);
    }

    #[test]
    fn test_shrink_restores_original() {
        let bytecode = vec![0x13, 0x00, 0x05, 0x57, 0xA7, 0xFF, 0xFC, 0xB1];
        let code = Code::new(1, 1, bytecode);
        let (new, _) = relocate(&code, vec![Replacement::new(0, vec![0x12, 0x05])]).unwrap();
        assert_eq!(new.bytecode, vec![0x12, 0x05, 0x57, 0xA7, 0xFF, 0xFD, 0xB1]);

        let (back, map) = relocate(&new, vec![Replacement::new(0, ldc_w(5))]).unwrap();
        assert_eq!(back.bytecode, code.bytecode);
        assert!(!map.is_identity());
    }

    #[test]
    fn test_switch_padding_recomputed() {
        // ldc #1; tableswitch at 2 with one byte of padding, every target the return
        let mut bytecode = vec![0x12, 0x01, 0xAA, 0x00];
        bytecode.extend_from_slice(&18i32.to_be_bytes());
        bytecode.extend_from_slice(&0i32.to_be_bytes());
        bytecode.extend_from_slice(&0i32.to_be_bytes());
        bytecode.extend_from_slice(&18i32.to_be_bytes());
        bytecode.push(0xB1);
        assert_eq!(bytecode.len(), 21);
        let code = Code::new(1, 1, bytecode);

        let (new, map) = relocate(&code, vec![Replacement::new(0, ldc_w(300))]).unwrap();
        // The switch moved to 3 so it loses its padding and the return stays at 20
        assert_eq!(map.get(2), Some(3));
        assert_eq!(map.get(20), Some(20));
        assert_eq!(new.bytecode.len(), 21);
        assert_eq!(new.bytecode[3], 0xAA);
        assert_eq!(&new.bytecode[4..8], &17i32.to_be_bytes());
        assert_eq!(&new.bytecode[16..20], &17i32.to_be_bytes());
    }

    #[test]
    fn test_stack_map_frames_follow() {
        let bytecode = vec![0x12, 0x01, 0xBB, 0x00, 0x02, 0x57, 0xB1];
        let mut code = Code::new(1, 1, bytecode);
        code.stack_map = Some(StackMapTable {
            frames: vec![
                StackMapFrame::SameLocals1StackItem {
                    offset_delta: 5,
                    extended: false,
                    stack: VerificationType::Uninitialized(2),
                },
                StackMapFrame::Same {
                    offset_delta: 0,
                    extended: false,
                },
            ],
        });

        let (new, _) = relocate(&code, vec![Replacement::new(0, ldc_w(1))]).unwrap();
        let stack_map = new.stack_map.unwrap();
        assert_eq!(stack_map.frame_offsets(), vec![6, 7]);
        assert_eq!(
            stack_map.frames[0],
            StackMapFrame::SameLocals1StackItem {
                offset_delta: 6,
                extended: false,
                stack: VerificationType::Uninitialized(3),
            }
        );
    }

    #[test]
    fn test_rejected_replacements() {
        let code = Code::new(1, 1, vec![0x12, 0x01, 0xB1]);
        assert_eq!(
            relocate(&code, vec![Replacement::new(1, vec![0x00])]),
            Err(RelocationError::NotInstructionStart { bci: 1 })
        );
        assert_eq!(
            relocate(&code, vec![Replacement::new(0, vec![0xA7, 0, 0])]),
            Err(RelocationError::InvalidReplacement { bci: 0 })
        );
    }

    #[test]
    fn test_short_branch_out_of_range() {
        // goto over a long run of ldc that all grow
        let count = 16_000;
        let mut bytecode = vec![0xA7];
        let jump = (3 + count * 2) as i16;
        bytecode.extend_from_slice(&jump.to_be_bytes());
        let mut replacements = Vec::new();
        for _ in 0..count {
            replacements.push(Replacement::new(bytecode.len(), ldc_w(300)));
            bytecode.extend_from_slice(&[0x12, 0x01]);
        }
        bytecode.push(0xB1);
        let code = Code::new(1, 1, bytecode);
        assert!(matches!(
            relocate(&code, replacements),
            Err(RelocationError::BranchOutOfRange { bci: 0, .. })
        ));
    }
}
