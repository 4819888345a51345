use std::{error, fmt, io};

/// Errors specific to the bytecode codec.
#[derive(Debug)]
pub enum CodecError {
    /// The stream ended before the structure it promised.
    Truncated,
    /// The leading 4-byte tag is not ours.
    BadMagic(u32),
    /// The format version is newer than this library understands.
    UnsupportedVersion(u32),
    /// A scope closed while values referenced before their definition
    /// were still unresolved.
    UnresolvedForwardRef { scope: &'static str, count: usize },
    /// A tag byte had no meaning in the block it appeared in.
    BadTag { block: &'static str, tag: u64 },
    /// An index into a table (types, values, globals) was out of bounds.
    BadIndex { table: &'static str, index: u64 },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "bytecode stream truncated"),
            Self::BadMagic(magic) => write!(f, "bad magic number: 0x{magic:08x}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version {v}"),
            Self::UnresolvedForwardRef { scope, count } => {
                write!(f, "{count} unresolved forward reference(s) at end of {scope}")
            }
            Self::BadTag { block, tag } => write!(f, "unknown tag {tag} in {block} block"),
            Self::BadIndex { table, index } => {
                write!(f, "index {index} out of range for {table} table")
            }
        }
    }
}

impl error::Error for CodecError {}

/// The crate-wide error type.
///
/// Library routines return `Result<_, Error>`; none of the recoverable
/// conditions unwind. Constant folding is not represented here at all:
/// "no fold" is an `Option::None`, not an error.
#[derive(Debug)]
pub enum Error {
    /// The IR violates a structural invariant. Carries the identity of the
    /// first violating value and a human-readable message.
    Structural { value: String, message: String },
    /// Malformed, truncated or unsupported bytecode.
    Codec(CodecError),
    /// An operand's type does not match the signature it is used with.
    TypeMismatch {
        context: &'static str,
        expected: String,
        found: String,
    },
    /// A constant's payload does not fit its declared type.
    ConstantOutOfRange { ty: String, value: String },
    /// Name lookup failed. The caller decides how severe this is.
    Unresolved(String),
    /// Underlying read or write failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structural { value, message } => {
                write!(f, "broken invariant on {value}: {message}")
            }
            Self::Codec(err) => err.fmt(f),
            Self::TypeMismatch {
                context,
                expected,
                found,
            } => write!(f, "{context}: expected {expected}, found {found}"),
            Self::ConstantOutOfRange { ty, value } => {
                write!(f, "constant {value} out of range for {ty}")
            }
            Self::Unresolved(name) => write!(f, "unresolved symbol `{name}`"),
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Codec(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
