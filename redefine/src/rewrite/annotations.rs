//! Remapping the pool indices held inside the raw bodies of annotation attributes.
//! The bodies are walked in place, and every length is checked against the data since the
//! layout comes straight from the class file.

use byteorder::{BigEndian, ByteOrder};
use redefine_base::{class_file::ClassFileError, PoolIndex};

/// Walks an attribute body, rewriting indices as it goes
struct Remapper<'a, F> {
    data: &'a mut [u8],
    pos: usize,
    name: &'static str,
    map: F,
}
impl<'a, F: Fn(PoolIndex) -> PoolIndex> Remapper<'a, F> {
    fn new(data: &'a mut [u8], name: &'static str, map: F) -> Remapper<'a, F> {
        Remapper {
            data,
            pos: 0,
            name,
            map,
        }
    }

    fn read_u8(&mut self) -> Result<u8, ClassFileError> {
        let value = *self.data.get(self.pos).ok_or(ClassFileError::Truncated)?;
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> Result<u16, ClassFileError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 2)
            .ok_or(ClassFileError::Truncated)?;
        self.pos += 2;
        Ok(BigEndian::read_u16(bytes))
    }

    fn skip(&mut self, len: usize) -> Result<(), ClassFileError> {
        if self.pos + len > self.data.len() {
            return Err(ClassFileError::Truncated);
        }
        self.pos += len;
        Ok(())
    }

    /// Rewrite the index at the current position
    fn index(&mut self) -> Result<(), ClassFileError> {
        let at = self.pos;
        let old = self.read_u16()?;
        let new = (self.map)(old);
        if new != old {
            BigEndian::write_u16(&mut self.data[at..at + 2], new);
        }
        Ok(())
    }

    fn finish(self) -> Result<(), ClassFileError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(ClassFileError::AttributeLength { name: self.name })
        }
    }

    fn annotations(&mut self) -> Result<(), ClassFileError> {
        let count = self.read_u16()?;
        for _ in 0..count {
            self.annotation()?;
        }
        Ok(())
    }

    fn annotation(&mut self) -> Result<(), ClassFileError> {
        // type_index
        self.index()?;
        self.element_value_pairs()
    }

    fn element_value_pairs(&mut self) -> Result<(), ClassFileError> {
        let pairs = self.read_u16()?;
        for _ in 0..pairs {
            // element_name_index
            self.index()?;
            self.element_value()?;
        }
        Ok(())
    }

    fn element_value(&mut self) -> Result<(), ClassFileError> {
        let tag = self.read_u8()?;
        match tag {
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => self.index(),
            b'e' => {
                // type_name_index, const_name_index
                self.index()?;
                self.index()
            }
            b'@' => self.annotation(),
            b'[' => {
                let count = self.read_u16()?;
                for _ in 0..count {
                    self.element_value()?;
                }
                Ok(())
            }
            _ => Err(ClassFileError::AttributeLength { name: self.name }),
        }
    }

    fn parameter_annotations(&mut self) -> Result<(), ClassFileError> {
        let parameters = self.read_u8()?;
        for _ in 0..parameters {
            self.annotations()?;
        }
        Ok(())
    }

    fn type_annotations(&mut self) -> Result<(), ClassFileError> {
        let count = self.read_u16()?;
        for _ in 0..count {
            self.type_annotation()?;
        }
        Ok(())
    }

    fn type_annotation(&mut self) -> Result<(), ClassFileError> {
        let target_type = self.read_u8()?;
        // target_info holds offsets and counts, but never pool indices
        match target_type {
            // type_parameter_target, formal_parameter_target
            0x00 | 0x01 | 0x16 => self.skip(1)?,
            // supertype_target, throws_target, catch_target, offset_target
            0x10 | 0x17 | 0x42..=0x46 => self.skip(2)?,
            // type_parameter_bound_target
            0x11 | 0x12 => self.skip(2)?,
            // empty_target
            0x13..=0x15 => {}
            // localvar_target
            0x40 | 0x41 => {
                let table_length = usize::from(self.read_u16()?);
                self.skip(table_length * 6)?;
            }
            // type_argument_target
            0x47..=0x4B => self.skip(3)?,
            _ => return Err(ClassFileError::AttributeLength { name: self.name }),
        }

        // type_path
        let path_length = usize::from(self.read_u8()?);
        self.skip(path_length * 2)?;

        self.annotation()
    }
}

pub(crate) fn remap_annotations(
    data: &mut [u8],
    name: &'static str,
    map: impl Fn(PoolIndex) -> PoolIndex,
) -> Result<(), ClassFileError> {
    let mut remapper = Remapper::new(data, name, map);
    remapper.annotations()?;
    remapper.finish()
}

pub(crate) fn remap_parameter_annotations(
    data: &mut [u8],
    name: &'static str,
    map: impl Fn(PoolIndex) -> PoolIndex,
) -> Result<(), ClassFileError> {
    let mut remapper = Remapper::new(data, name, map);
    remapper.parameter_annotations()?;
    remapper.finish()
}

pub(crate) fn remap_type_annotations(
    data: &mut [u8],
    name: &'static str,
    map: impl Fn(PoolIndex) -> PoolIndex,
) -> Result<(), ClassFileError> {
    let mut remapper = Remapper::new(data, name, map);
    remapper.type_annotations()?;
    remapper.finish()
}

/// The body of `AnnotationDefault`, a single element value
pub(crate) fn remap_element_value(
    data: &mut [u8],
    name: &'static str,
    map: impl Fn(PoolIndex) -> PoolIndex,
) -> Result<(), ClassFileError> {
    let mut remapper = Remapper::new(data, name, map);
    remapper.element_value()?;
    remapper.finish()
}

#[cfg(test)]
mod tests {
    use redefine_base::class_file::ClassFileError;

    use super::{remap_annotations, remap_type_annotations};

    fn shift(index: u16) -> u16 {
        if index >= 10 {
            index + 100
        } else {
            index
        }
    }

    #[test]
    fn test_remap_annotations() {
        #[rustfmt::skip]
        let mut data = vec![
            0, 1,
            // @#10(#11 = enum #12.#3, #4 = [int #13, @#5()])
            0, 10, 0, 2,
            0, 11, b'e', 0, 12, 0, 3,
            0, 4, b'[', 0, 2,
                b'I', 0, 13,
                b'@', 0, 5, 0, 0,
        ];
        remap_annotations(&mut data, "RuntimeVisibleAnnotations", shift).unwrap();

        #[rustfmt::skip]
        let expected = vec![
            0, 1,
            0, 110, 0, 2,
            0, 111, b'e', 0, 112, 0, 3,
            0, 4, b'[', 0, 2,
                b'I', 0, 113,
                b'@', 0, 5, 0, 0,
        ];
        assert_eq!(data, expected);
    }

    #[test]
    fn test_remap_type_annotations() {
        #[rustfmt::skip]
        let mut data = vec![
            0, 2,
            // localvar_target with one entry, empty path, @#10()
            0x40, 0, 1, 0, 0, 0, 5, 0, 1,
            0, 0, 10, 0, 0,
            // type_argument_target, path of one step, @#11()
            0x47, 0, 4, 0,
            1, 3, 0,
            0, 11, 0, 0,
        ];
        remap_type_annotations(&mut data, "RuntimeVisibleTypeAnnotations", shift).unwrap();
        assert_eq!(&data[12..14], &[0, 110]);
        assert_eq!(&data[23..25], &[0, 111]);
        // Offsets inside the targets are left alone
        assert_eq!(&data[5..11], &[0, 0, 0, 5, 0, 1]);
    }

    #[test]
    fn test_malformed_annotations() {
        let mut truncated = vec![0, 1, 0, 10, 0, 1, 0, 11];
        assert_eq!(
            remap_annotations(&mut truncated, "RuntimeVisibleAnnotations", shift),
            Err(ClassFileError::Truncated)
        );

        let mut bad_tag = vec![0, 1, 0, 10, 0, 1, 0, 11, b'x', 0, 0];
        assert_eq!(
            remap_annotations(&mut bad_tag, "RuntimeVisibleAnnotations", shift),
            Err(ClassFileError::AttributeLength {
                name: "RuntimeVisibleAnnotations"
            })
        );

        let mut trailing = vec![0, 0, 1];
        assert!(remap_annotations(&mut trailing, "RuntimeVisibleAnnotations", shift).is_err());
    }
}
