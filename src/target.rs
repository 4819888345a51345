//! Target parameterization for layout questions.
//!
//! The IR itself is target-independent; anything that needs `sizeof` or
//! field offsets is parameterized by a [`TargetData`] describing the
//! pointer width and the size/alignment of each primitive.

use crate::error::{CodecError, Error, Result};

/// Size and alignment of one primitive, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeSpec {
    pub size: u32,
    pub align: u32,
}

impl TypeSpec {
    const fn new(size: u32, align: u32) -> Self {
        Self { size, align }
    }
}

/// Byte widths and alignments of the primitive types on one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetData {
    pub little_endian: bool,
    pub pointer: TypeSpec,
    pub bool_: TypeSpec,
    pub i8: TypeSpec,
    pub i16: TypeSpec,
    pub i32: TypeSpec,
    pub i64: TypeSpec,
    pub f32: TypeSpec,
    pub f64: TypeSpec,
}

impl Default for TargetData {
    /// A generic 64-bit little-endian machine.
    fn default() -> Self {
        Self {
            little_endian: true,
            pointer: TypeSpec::new(8, 8),
            bool_: TypeSpec::new(1, 1),
            i8: TypeSpec::new(1, 1),
            i16: TypeSpec::new(2, 2),
            i32: TypeSpec::new(4, 4),
            i64: TypeSpec::new(8, 8),
            f32: TypeSpec::new(4, 4),
            f64: TypeSpec::new(8, 8),
        }
    }
}

impl TargetData {
    /// A generic 32-bit little-endian machine.
    pub fn ilp32() -> Self {
        Self {
            pointer: TypeSpec::new(4, 4),
            i64: TypeSpec::new(8, 4),
            f64: TypeSpec::new(8, 4),
            ..Self::default()
        }
    }

    /// Render the compact signature stored in the bytecode module block,
    /// e.g. `e-p8:8-i64:8-f64:8`.
    pub fn signature(&self) -> String {
        let mut s = String::from(if self.little_endian { "e" } else { "E" });
        s.push_str(&format!("-p{}:{}", self.pointer.size, self.pointer.align));
        s.push_str(&format!("-i64:{}", self.i64.align));
        s.push_str(&format!("-f64:{}", self.f64.align));
        s
    }

    /// Parse a signature produced by [`TargetData::signature`].
    pub fn from_signature(sig: &str) -> Result<Self> {
        let mut td = Self::default();
        for (i, part) in sig.split('-').enumerate() {
            match (i, part) {
                (0, "e") => td.little_endian = true,
                (0, "E") => td.little_endian = false,
                (_, p) if p.starts_with('p') => {
                    let rest = &p[1..];
                    let (size, align) = rest
                        .split_once(':')
                        .ok_or(Error::Codec(CodecError::Truncated))?;
                    td.pointer = TypeSpec::new(
                        size.parse().map_err(|_| bad_sig())?,
                        align.parse().map_err(|_| bad_sig())?,
                    );
                }
                (_, p) if p.starts_with("i64:") => {
                    td.i64.align = p[4..].parse().map_err(|_| bad_sig())?;
                }
                (_, p) if p.starts_with("f64:") => {
                    td.f64.align = p[4..].parse().map_err(|_| bad_sig())?;
                }
                _ => return Err(bad_sig()),
            }
        }
        Ok(td)
    }
}

fn bad_sig() -> Error {
    Error::Codec(CodecError::BadTag {
        block: "target-data signature",
        tag: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        for td in [TargetData::default(), TargetData::ilp32()] {
            let sig = td.signature();
            assert_eq!(TargetData::from_signature(&sig).unwrap(), td);
        }
    }
}
