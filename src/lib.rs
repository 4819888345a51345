//! A retargetable SSA compiler middle-end.
//!
//! The library ingests a typed, SSA-form intermediate representation,
//! optimizes it through a pluggable pass pipeline, and emits either the
//! same IR (as compact bytecode, for further staging) or a lowered
//! two-address machine IR ready for target code selection.
//!
//! Everything hangs off a [`Context`]: type and constant interning,
//! annotation side-tables, layout caches. Drivers create one per
//! compilation; the library is single-threaded throughout.

/// The compilation context: interners and annotations.
pub mod context;
/// Crate-wide error taxonomy.
pub mod error;
/// Target widths and alignments.
pub mod target;
/// Pipeline configuration values.
pub mod settings;

/// The SSA object model.
pub mod ir;
/// The constant-folding algebra.
pub mod fold;
/// Pass traits, registry and the scheduler.
pub mod pass;
/// Read-only analyses: dominance, call graph, data-structure graphs.
pub mod analysis {
    pub mod callgraph;
    pub mod dominance;
    /// Unification-based points-to (data-structure) analysis.
    pub mod dsa {
        pub mod closure;
        mod graph;
        pub mod local;
        pub use self::graph::*;
    }
}
/// IR-to-IR transformations and the canonical pipelines.
pub mod transforms;
/// Two-address machine IR, liveness and the emission interface.
pub mod machine;
/// The bytecode codec: reader, writer, lazy provider, archives.
pub mod codec;

pub use self::context::Context;
pub use self::error::{CodecError, Error, Result};
pub use self::ir::{Builder, Function, Module, Opcode, Type, TypeKind, ValueRef};
pub use self::target::TargetData;
