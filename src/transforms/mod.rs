//! IR-to-IR transformations.

pub mod const_prop;
pub mod dce;
pub mod mem2reg;
pub mod pipeline;

pub use self::pipeline::add_canonical_passes;

use crate::context::Context;
use crate::error::Result;
use crate::ir::module::Module;
use crate::ir::verifier;
use crate::pass::{
    AnalysisCache, AnalysisUsage, AnyPass, ModulePass, PassInfo, PassKind, PassRegistry, Preserved,
};

/// Register every transform this crate ships.
pub fn register(registry: &mut PassRegistry) {
    registry.register(PassInfo {
        name: "Constant Propagation",
        argument: "constprop",
        kind: PassKind::Optimization,
        cfg_only: false,
        ctor: || AnyPass::Function(Box::new(const_prop::ConstantPropagation)),
    });
    registry.register(PassInfo {
        name: "Dead Instruction Elimination",
        argument: "die",
        kind: PassKind::Optimization,
        cfg_only: false,
        ctor: || AnyPass::Block(Box::new(dce::DeadInstElimination)),
    });
    registry.register(PassInfo {
        name: "Dead Code Elimination",
        argument: "dce",
        kind: PassKind::Optimization,
        cfg_only: false,
        ctor: || AnyPass::Function(Box::new(dce::DeadCodeElimination)),
    });
    registry.register(PassInfo {
        name: "Promote Memory to Register",
        argument: "mem2reg",
        kind: PassKind::Optimization,
        cfg_only: false,
        ctor: || AnyPass::Function(Box::new(mem2reg::PromoteMem2Reg)),
    });
    registry.register(PassInfo {
        name: "Module Verifier",
        argument: "verify",
        kind: PassKind::Utility,
        cfg_only: false,
        ctor: || AnyPass::Module(Box::new(VerifierPass)),
    });
}

/// The verifier as a schedulable pass; fails the pipeline on the first
/// broken invariant.
pub struct VerifierPass;

impl ModulePass for VerifierPass {
    fn name(&self) -> &'static str {
        "Module Verifier"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new().preserves(Preserved::All)
    }

    fn run(&mut self, module: &mut Module, cx: &Context, _am: &mut AnalysisCache) -> Result<bool> {
        verifier::verify_module(module, cx)?;
        Ok(false)
    }
}
