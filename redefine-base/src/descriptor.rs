use std::num::NonZeroUsize;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DescriptorError {
    /// The descriptor ended before a type was complete
    UnexpectedEnd,
    UnknownType { at: usize, found: u8 },
    /// A method descriptor did not begin with `(`
    ExpectedParameters,
    /// There was text after the descriptor
    Trailing { at: usize },
    /// Arrays may have at most 255 dimensions
    TooManyDimensions,
    /// `void` may only be a return type
    VoidParameter,
}
impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorError::UnexpectedEnd => f.write_str("descriptor ended unexpectedly"),
            DescriptorError::UnknownType { at, found } => {
                write!(f, "unknown descriptor type {:?} at {}", char::from(*found), at)
            }
            DescriptorError::ExpectedParameters => {
                f.write_str("method descriptor must begin with '('")
            }
            DescriptorError::Trailing { at } => write!(f, "trailing data at {}", at),
            DescriptorError::TooManyDimensions => f.write_str("array has over 255 dimensions"),
            DescriptorError::VoidParameter => f.write_str("void used as a field or parameter"),
        }
    }
}
impl std::error::Error for DescriptorError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorTypeBasic {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    /// The binary name of the class, `java/lang/Object` for example
    Class(Vec<u8>),
    Short,
    Boolean,
}
impl DescriptorTypeBasic {
    /// How many local variable or operand stack slots a value of this type takes
    #[must_use]
    pub fn slot_size(&self) -> u16 {
        match self {
            DescriptorTypeBasic::Double | DescriptorTypeBasic::Long => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    Basic(DescriptorTypeBasic),
    Array {
        level: NonZeroUsize,
        component: DescriptorTypeBasic,
    },
}
impl DescriptorType {
    /// Parse a field descriptor
    pub fn parse(desc: &[u8]) -> Result<DescriptorType, DescriptorError> {
        let (ty, end) = parse_type(desc, 0)?;
        if end != desc.len() {
            return Err(DescriptorError::Trailing { at: end });
        }
        ty.ok_or(DescriptorError::VoidParameter)
    }

    #[must_use]
    pub fn slot_size(&self) -> u16 {
        match self {
            DescriptorType::Basic(basic) => basic.slot_size(),
            DescriptorType::Array { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    parameters: Vec<DescriptorType>,
    /// None represents void
    return_type: Option<DescriptorType>,
}
impl MethodDescriptor {
    pub fn parse(desc: &[u8]) -> Result<MethodDescriptor, DescriptorError> {
        if desc.first() != Some(&b'(') {
            return Err(DescriptorError::ExpectedParameters);
        }

        let mut at = 1;
        let mut parameters = Vec::new();
        loop {
            match desc.get(at) {
                Some(b')') => {
                    at += 1;
                    break;
                }
                Some(_) => {
                    let (ty, end) = parse_type(desc, at)?;
                    parameters.push(ty.ok_or(DescriptorError::VoidParameter)?);
                    at = end;
                }
                None => return Err(DescriptorError::UnexpectedEnd),
            }
        }

        let (return_type, end) = parse_type(desc, at)?;
        if end != desc.len() {
            return Err(DescriptorError::Trailing { at: end });
        }

        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }

    #[must_use]
    pub fn parameters(&self) -> &[DescriptorType] {
        self.parameters.as_slice()
    }

    #[must_use]
    pub fn return_type(&self) -> Option<&DescriptorType> {
        self.return_type.as_ref()
    }

    /// The number of local variable slots the parameters take, not counting any receiver
    #[must_use]
    pub fn parameter_slots(&self) -> u16 {
        self.parameters.iter().map(DescriptorType::slot_size).sum()
    }
}

/// Parse a single type starting at `at`, returning it (`None` for void) and the index after it
fn parse_type(desc: &[u8], at: usize) -> Result<(Option<DescriptorType>, usize), DescriptorError> {
    let mut level = 0usize;
    let mut at = at;
    while desc.get(at) == Some(&b'[') {
        level += 1;
        at += 1;
    }
    if level > 255 {
        return Err(DescriptorError::TooManyDimensions);
    }

    let found = *desc.get(at).ok_or(DescriptorError::UnexpectedEnd)?;
    let (basic, end) = match found {
        b'B' => (DescriptorTypeBasic::Byte, at + 1),
        b'C' => (DescriptorTypeBasic::Char, at + 1),
        b'D' => (DescriptorTypeBasic::Double, at + 1),
        b'F' => (DescriptorTypeBasic::Float, at + 1),
        b'I' => (DescriptorTypeBasic::Int, at + 1),
        b'J' => (DescriptorTypeBasic::Long, at + 1),
        b'S' => (DescriptorTypeBasic::Short, at + 1),
        b'Z' => (DescriptorTypeBasic::Boolean, at + 1),
        b'L' => {
            let name_start = at + 1;
            let len = desc[name_start..]
                .iter()
                .position(|&c| c == b';')
                .ok_or(DescriptorError::UnexpectedEnd)?;
            if len == 0 {
                return Err(DescriptorError::UnknownType { at, found });
            }
            let name = desc[name_start..name_start + len].to_vec();
            (DescriptorTypeBasic::Class(name), name_start + len + 1)
        }
        b'V' if level == 0 => return Ok((None, at + 1)),
        b'V' => return Err(DescriptorError::VoidParameter),
        _ => return Err(DescriptorError::UnknownType { at, found }),
    };

    let ty = match NonZeroUsize::new(level) {
        Some(level) => DescriptorType::Array {
            level,
            component: basic,
        },
        None => DescriptorType::Basic(basic),
    };
    Ok((Some(ty), end))
}

#[cfg(test)]
mod tests {
    use super::{DescriptorError, DescriptorType, DescriptorTypeBasic, MethodDescriptor};

    #[test]
    fn test_method_descriptor() {
        let desc = MethodDescriptor::parse(b"(IJ[Ljava/lang/String;D)V").unwrap();
        assert_eq!(desc.parameters().len(), 4);
        assert_eq!(desc.parameter_slots(), 6);
        assert_eq!(desc.return_type(), None);
        assert!(matches!(
            &desc.parameters()[2],
            DescriptorType::Array { level, component: DescriptorTypeBasic::Class(name) }
                if level.get() == 1 && name == b"java/lang/String"
        ));

        let desc = MethodDescriptor::parse(b"()[[Z").unwrap();
        assert_eq!(desc.parameter_slots(), 0);
        assert!(desc.return_type().is_some());
    }

    #[test]
    fn test_bad_descriptors() {
        assert_eq!(
            MethodDescriptor::parse(b"I)V"),
            Err(DescriptorError::ExpectedParameters)
        );
        assert_eq!(
            MethodDescriptor::parse(b"(V)V"),
            Err(DescriptorError::VoidParameter)
        );
        assert_eq!(
            MethodDescriptor::parse(b"(Ljava/lang/Object)V"),
            Err(DescriptorError::UnexpectedEnd)
        );
        assert_eq!(
            DescriptorType::parse(b"II"),
            Err(DescriptorError::Trailing { at: 1 })
        );
        assert_eq!(
            DescriptorType::parse(b"Q"),
            Err(DescriptorError::UnknownType { at: 0, found: b'Q' })
        );
    }
}
