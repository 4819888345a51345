//! The binary bytecode codec.
//!
//! Layout of a module file, leaf-first:
//!
//! ```text
//! magic "mdbc", version
//! MODULE    name, target-data signature, dependent libraries
//! TYPES     uniqued type table, leaf-first, indices into itself
//! GLOBALS   variables and function declarations (no initializers yet)
//! CONSTANTS global-scope pool, topologically sorted (operands before
//!           users)
//! INITS     global-index -> constant-index references
//! FUNCTION* one block per defined body: the function-scope constant
//!           pool (continuing the global index space) then the
//!           instructions; length-framed so a lazy reader can skip and
//!           materialize later
//! ```
//!
//! Every block is `tag, payload-length (VBR), payload`, so a reader can
//! always skip what it does not understand. Function bodies carry their
//! own value symbol tables.

pub mod archive;
pub mod bytes;
pub mod codes;
pub mod provider;
pub mod reader;
pub mod writer;

pub use self::archive::{Archive, ArchiveBuilder};
pub use self::provider::ModuleProvider;
pub use self::reader::read_module;
pub use self::writer::{write_module, write_module_to};
