//! The `StackMapTable` attribute.
//! The table arrives as untrusted bytes, so parsing checks every length and tag rather than
//! trusting the frame count.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;

use crate::constant_pool::PoolIndex;

const SAME_LOCALS_1_ITEM_START: u8 = 64;
const RESERVED_START: u8 = 128;
const SAME_LOCALS_1_ITEM_EXTENDED: u8 = 247;
const CHOP_START: u8 = 248;
const SAME_EXTENDED: u8 = 251;
const APPEND_START: u8 = 252;
const FULL_FRAME: u8 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StackMapError {
    /// The data ended in the middle of a frame
    Truncated,
    /// Frame types 128 through 246 are reserved
    ReservedFrameType(u8),
    InvalidVerificationTag(u8),
    /// There was data after the last frame
    TrailingBytes,
}
impl std::fmt::Display for StackMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackMapError::Truncated => f.write_str("stack map table is truncated"),
            StackMapError::ReservedFrameType(tag) => {
                write!(f, "stack map frame uses reserved type {}", tag)
            }
            StackMapError::InvalidVerificationTag(tag) => {
                write!(f, "invalid verification type tag {}", tag)
            }
            StackMapError::TrailingBytes => f.write_str("trailing bytes after stack map table"),
        }
    }
}
impl std::error::Error for StackMapError {}

impl From<std::io::Error> for StackMapError {
    fn from(_: std::io::Error) -> Self {
        // Reading from a slice can only fail by running out of data
        StackMapError::Truncated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// A class instance ref, naming the class by its pool index
    Object(PoolIndex),
    /// Contains the offset of the `new` instruction that created the object
    Uninitialized(u16),
}
impl VerificationType {
    fn parse(data: &mut &[u8]) -> Result<VerificationType, StackMapError> {
        let tag = data.read_u8()?;
        Ok(match tag {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(data.read_u16::<BigEndian>()?),
            8 => VerificationType::Uninitialized(data.read_u16::<BigEndian>()?),
            _ => return Err(StackMapError::InvalidVerificationTag(tag)),
        })
    }

    fn serialize(self, out: &mut Vec<u8>) {
        // Writing into a vec never fails
        let _ = match self {
            VerificationType::Top => out.write_u8(0),
            VerificationType::Integer => out.write_u8(1),
            VerificationType::Float => out.write_u8(2),
            VerificationType::Double => out.write_u8(3),
            VerificationType::Long => out.write_u8(4),
            VerificationType::Null => out.write_u8(5),
            VerificationType::UninitializedThis => out.write_u8(6),
            VerificationType::Object(index) => out
                .write_u8(7)
                .and_then(|_| out.write_u16::<BigEndian>(index)),
            VerificationType::Uninitialized(offset) => out
                .write_u8(8)
                .and_then(|_| out.write_u16::<BigEndian>(offset)),
        };
    }

    #[must_use]
    pub fn is_category_2(self) -> bool {
        matches!(self, VerificationType::Double | VerificationType::Long)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same {
        offset_delta: u16,
        /// Whether it was stored in the two byte delta form
        extended: bool,
    },
    SameLocals1StackItem {
        offset_delta: u16,
        extended: bool,
        stack: VerificationType,
    },
    Chop {
        offset_delta: u16,
        /// How many locals were removed, one through three
        chopped: u8,
    },
    Append {
        offset_delta: u16,
        locals: SmallVec<[VerificationType; 3]>,
    },
    Full {
        offset_delta: u16,
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}
impl StackMapFrame {
    #[must_use]
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }

    pub fn set_offset_delta(&mut self, delta: u16) {
        match self {
            StackMapFrame::Same { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta = delta,
        }
    }

    /// Every verification type mentioned by the frame
    pub fn types_mut(&mut self) -> impl Iterator<Item = &mut VerificationType> {
        let (first, second): (&mut [VerificationType], &mut [VerificationType]) = match self {
            StackMapFrame::Same { .. } | StackMapFrame::Chop { .. } => (&mut [], &mut []),
            StackMapFrame::SameLocals1StackItem { stack, .. } => {
                (std::slice::from_mut(stack), &mut [])
            }
            StackMapFrame::Append { locals, .. } => (locals.as_mut_slice(), &mut []),
            StackMapFrame::Full { locals, stack, .. } => {
                (locals.as_mut_slice(), stack.as_mut_slice())
            }
        };
        first.iter_mut().chain(second.iter_mut())
    }

    fn parse(data: &mut &[u8]) -> Result<StackMapFrame, StackMapError> {
        let frame_type = data.read_u8()?;
        Ok(match frame_type {
            0..=63 => StackMapFrame::Same {
                offset_delta: u16::from(frame_type),
                extended: false,
            },
            SAME_LOCALS_1_ITEM_START..=127 => StackMapFrame::SameLocals1StackItem {
                offset_delta: u16::from(frame_type - SAME_LOCALS_1_ITEM_START),
                extended: false,
                stack: VerificationType::parse(data)?,
            },
            RESERVED_START..=246 => return Err(StackMapError::ReservedFrameType(frame_type)),
            SAME_LOCALS_1_ITEM_EXTENDED => StackMapFrame::SameLocals1StackItem {
                offset_delta: data.read_u16::<BigEndian>()?,
                extended: true,
                stack: VerificationType::parse(data)?,
            },
            CHOP_START..=250 => StackMapFrame::Chop {
                offset_delta: data.read_u16::<BigEndian>()?,
                chopped: SAME_EXTENDED - frame_type,
            },
            SAME_EXTENDED => StackMapFrame::Same {
                offset_delta: data.read_u16::<BigEndian>()?,
                extended: true,
            },
            APPEND_START..=254 => {
                let offset_delta = data.read_u16::<BigEndian>()?;
                let count = frame_type - SAME_EXTENDED;
                let mut locals = SmallVec::new();
                for _ in 0..count {
                    locals.push(VerificationType::parse(data)?);
                }
                StackMapFrame::Append {
                    offset_delta,
                    locals,
                }
            }
            FULL_FRAME => {
                let offset_delta = data.read_u16::<BigEndian>()?;
                let locals = parse_types(data)?;
                let stack = parse_types(data)?;
                StackMapFrame::Full {
                    offset_delta,
                    locals,
                    stack,
                }
            }
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        let write_delta = |out: &mut Vec<u8>, delta: u16| {
            let _ = out.write_u16::<BigEndian>(delta);
        };
        match self {
            StackMapFrame::Same {
                offset_delta,
                extended,
            } => {
                if *extended || *offset_delta >= u16::from(SAME_LOCALS_1_ITEM_START) {
                    out.push(SAME_EXTENDED);
                    write_delta(out, *offset_delta);
                } else {
                    out.push(*offset_delta as u8);
                }
            }
            StackMapFrame::SameLocals1StackItem {
                offset_delta,
                extended,
                stack,
            } => {
                if *extended || *offset_delta >= u16::from(SAME_LOCALS_1_ITEM_START) {
                    out.push(SAME_LOCALS_1_ITEM_EXTENDED);
                    write_delta(out, *offset_delta);
                } else {
                    out.push(SAME_LOCALS_1_ITEM_START + *offset_delta as u8);
                }
                stack.serialize(out);
            }
            StackMapFrame::Chop {
                offset_delta,
                chopped,
            } => {
                out.push(SAME_EXTENDED - *chopped);
                write_delta(out, *offset_delta);
            }
            StackMapFrame::Append {
                offset_delta,
                locals,
            } => {
                out.push(SAME_EXTENDED + locals.len() as u8);
                write_delta(out, *offset_delta);
                for local in locals {
                    local.serialize(out);
                }
            }
            StackMapFrame::Full {
                offset_delta,
                locals,
                stack,
            } => {
                out.push(FULL_FRAME);
                write_delta(out, *offset_delta);
                write_delta(out, locals.len() as u16);
                for local in locals {
                    local.serialize(out);
                }
                write_delta(out, stack.len() as u16);
                for item in stack {
                    item.serialize(out);
                }
            }
        }
    }
}

fn parse_types(data: &mut &[u8]) -> Result<Vec<VerificationType>, StackMapError> {
    let count = data.read_u16::<BigEndian>()?;
    // Every type takes at least a byte, so a count larger than the remaining data is bogus
    if usize::from(count) > data.len() {
        return Err(StackMapError::Truncated);
    }
    (0..count).map(|_| VerificationType::parse(data)).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackMapTable {
    pub frames: Vec<StackMapFrame>,
}
impl StackMapTable {
    /// Parse the body of a `StackMapTable` attribute
    pub fn parse(mut data: &[u8]) -> Result<StackMapTable, StackMapError> {
        let count = data.read_u16::<BigEndian>()?;
        if usize::from(count) > data.len() {
            return Err(StackMapError::Truncated);
        }

        let mut frames = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            frames.push(StackMapFrame::parse(&mut data)?);
        }

        if !data.is_empty() {
            return Err(StackMapError::TrailingBytes);
        }

        Ok(StackMapTable { frames })
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = out.write_u16::<BigEndian>(self.frames.len() as u16);
        for frame in &self.frames {
            frame.serialize(&mut out);
        }
        out
    }

    /// The bytecode index each frame applies to.
    /// The first frame is at its delta, every later one at the previous plus delta plus one.
    #[must_use]
    pub fn frame_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.frames.len());
        let mut previous: Option<usize> = None;
        for frame in &self.frames {
            let delta = usize::from(frame.offset_delta());
            let offset = match previous {
                Some(previous) => previous + delta + 1,
                None => delta,
            };
            offsets.push(offset);
            previous = Some(offset);
        }
        offsets
    }

    /// Replace the frames' positions with the given absolute offsets, which must be strictly
    /// increasing. Returns `false` if they are not.
    pub fn set_frame_offsets(&mut self, offsets: &[usize]) -> bool {
        if offsets.len() != self.frames.len() {
            return false;
        }

        let mut previous: Option<usize> = None;
        for (frame, &offset) in self.frames.iter_mut().zip(offsets) {
            let delta = match previous {
                Some(previous) if offset > previous => offset - previous - 1,
                Some(_) => return false,
                None => offset,
            };
            match u16::try_from(delta) {
                Ok(delta) => frame.set_offset_delta(delta),
                Err(_) => return false,
            }
            previous = Some(offset);
        }
        true
    }

    pub fn types_mut(&mut self) -> impl Iterator<Item = &mut VerificationType> {
        self.frames.iter_mut().flat_map(StackMapFrame::types_mut)
    }
}
