//! The pass framework.
//!
//! Passes come in three granularities (module, function, basic block)
//! and declare up front which analyses they require, provide and
//! preserve. The scheduler in [`manager`] synthesizes missing required
//! analyses, batches finer-grained passes inside coarser managers, and
//! releases each analysis result at its last use.

pub mod manager;
pub mod registry;

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

use crate::context::Context;
use crate::error::Result;
use crate::ir::module::Module;
use crate::ir::{BlockId, FuncId};

pub use self::manager::{FunctionPassManager, PassManager, TimingInfo};
pub use self::registry::{PassInfo, PassKind, PassRegistry};

/// Identity of an analysis: its registered argument string.
pub type AnalysisId = &'static str;

/// What a pass declares about the analyses around it.
#[derive(Debug, Clone, Default)]
pub struct AnalysisUsage {
    /// Analyses that must be available before this pass runs.
    pub required: Vec<AnalysisId>,
    /// Analyses this pass computes and caches.
    pub provided: Vec<AnalysisId>,
    /// Analyses this pass promises not to invalidate.
    pub preserved: Preserved,
}

impl AnalysisUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requires(mut self, id: AnalysisId) -> Self {
        self.required.push(id);
        self
    }

    pub fn provides(mut self, id: AnalysisId) -> Self {
        self.provided.push(id);
        self
    }

    pub fn preserves(mut self, p: Preserved) -> Self {
        self.preserved = p;
        self
    }
}

/// The preservation declaration.
#[derive(Debug, Clone, Default)]
pub enum Preserved {
    /// Nothing survives this pass.
    #[default]
    None,
    /// Everything survives (analyses and transforms that don't touch IR).
    All,
    /// Everything registered as CFG-only survives; the pass may rewrite
    /// instructions but not the block graph.
    AllCfgOnly,
    /// Exactly these survive.
    Set(Vec<AnalysisId>),
}

impl Preserved {
    /// Does this declaration keep `id` alive? `cfg_only` is the
    /// registration flag of `id` itself.
    pub fn covers(&self, id: AnalysisId, cfg_only: bool) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::AllCfgOnly => cfg_only,
            Self::Set(ids) => ids.contains(&id),
        }
    }

    pub fn preserves_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// Cached analysis results, keyed by analysis id. Results are immutable
/// while cached; the scheduler drops them at invalidation or last-use
/// points.
#[derive(Default)]
pub struct AnalysisCache {
    results: HashMap<AnalysisId, Rc<dyn Any>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly computed result (analysis passes call this from
    /// their `run`).
    pub fn put<T: 'static>(&mut self, id: AnalysisId, result: T) {
        self.results.insert(id, Rc::new(result));
    }

    /// Fetch a live result.
    pub fn get<T: 'static>(&self, id: AnalysisId) -> Option<Rc<T>> {
        self.results.get(id)?.clone().downcast::<T>().ok()
    }

    pub fn contains(&self, id: AnalysisId) -> bool {
        self.results.contains_key(id)
    }

    pub fn remove(&mut self, id: AnalysisId) {
        self.results.remove(id);
    }

    /// Drop everything not covered by a preservation declaration.
    pub fn invalidate(&mut self, preserved: &Preserved, registry: &PassRegistry) {
        if preserved.preserves_all() {
            return;
        }
        self.results
            .retain(|&id, _| preserved.covers(id, registry.is_cfg_only(id)));
    }
}

/// A pass over whole modules.
pub trait ModulePass {
    fn name(&self) -> &'static str;

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::default()
    }

    fn run(
        &mut self,
        module: &mut Module,
        cx: &Context,
        am: &mut AnalysisCache,
    ) -> Result<bool>;

    /// Drop any memory retained beyond the cached result.
    fn release_memory(&mut self) {}
}

/// A pass invoked once per defined function.
pub trait FunctionPass {
    fn name(&self) -> &'static str;

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::default()
    }

    /// Hook run once before the first function.
    fn initialize(&mut self, _module: &Module, _cx: &Context) -> Result<()> {
        Ok(())
    }

    fn run(
        &mut self,
        func: FuncId,
        module: &mut Module,
        cx: &Context,
        am: &mut AnalysisCache,
    ) -> Result<bool>;

    /// Hook run once after the last function.
    fn finalize(&mut self, _module: &Module, _cx: &Context) -> Result<()> {
        Ok(())
    }

    fn release_memory(&mut self) {}
}

/// A pass invoked once per basic block.
pub trait BasicBlockPass {
    fn name(&self) -> &'static str;

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::default()
    }

    fn initialize(&mut self, _module: &Module, _cx: &Context) -> Result<()> {
        Ok(())
    }

    fn run(
        &mut self,
        block: BlockId,
        func: FuncId,
        module: &mut Module,
        cx: &Context,
        am: &mut AnalysisCache,
    ) -> Result<bool>;

    fn finalize(&mut self, _module: &Module, _cx: &Context) -> Result<()> {
        Ok(())
    }

    fn release_memory(&mut self) {}
}

/// A pass of any granularity, as produced by registry constructors.
pub enum AnyPass {
    Module(Box<dyn ModulePass>),
    Function(Box<dyn FunctionPass>),
    Block(Box<dyn BasicBlockPass>),
}

impl AnyPass {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Module(p) => p.name(),
            Self::Function(p) => p.name(),
            Self::Block(p) => p.name(),
        }
    }

    pub fn usage(&self) -> AnalysisUsage {
        match self {
            Self::Module(p) => p.usage(),
            Self::Function(p) => p.usage(),
            Self::Block(p) => p.usage(),
        }
    }
}
