use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use midend::analysis::dominance::DOMINATORS;
use midend::context::Context;
use midend::ir::printer::print_module;
use midend::ir::verifier;
use midend::ir::{ArgId, Linkage, Module, Opcode, ValueRef};
use midend::pass::{
    AnalysisCache, AnalysisUsage, AnyPass, FunctionPass, PassInfo, PassKind, PassManager,
    PassRegistry, Preserved,
};
use midend::settings::{OptLevel, Settings};
use midend::transforms::add_canonical_passes;
use midend::Builder;

fn registry() -> Rc<PassRegistry> {
    Rc::new(PassRegistry::with_builtin_passes())
}

fn o2() -> Settings {
    Settings {
        opt_level: OptLevel::O2,
        ..Settings::default()
    }
}

/// `%a = add i32 1, 2; %b = mul i32 %a, 3; ret i32 %b` folds to
/// `ret i32 9` under the canonical pipeline.
#[test]
fn constant_folding_end_to_end() {
    let cx = Context::new();
    let mut module = Module::new("fold", &cx);
    let sig = cx.function_ty(cx.i32_ty(), &[], false);
    let g = module
        .add_function("main", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        let one = ValueRef::Const(cx.const_int(cx.i32_ty(), 1).unwrap());
        let two = ValueRef::Const(cx.const_int(cx.i32_ty(), 2).unwrap());
        let three = ValueRef::Const(cx.const_int(cx.i32_ty(), 3).unwrap());
        let a = b.binary(Opcode::Add, one, two).unwrap();
        let m = b.binary(Opcode::Mul, a, three).unwrap();
        b.ret(Some(m)).unwrap();
    }

    let settings = o2();
    let mut pm = PassManager::new(registry(), settings.clone());
    add_canonical_passes(&mut pm, &settings).unwrap();
    assert!(pm.run(&mut module, &cx).unwrap());

    let func = &module.functions[f];
    let insts = func.inst_ids();
    assert_eq!(insts.len(), 1, "only the return should remain");
    let ret = func.inst(insts[0]);
    assert_eq!(ret.opcode, Opcode::Ret);
    let c = ret.operands[0].as_const().unwrap();
    assert_eq!(cx.const_int_value(c), Some(9));
}

/// Alloca/store/load promotes away completely: `ret i32 7` with no
/// memory traffic left.
#[test]
fn promotion_eliminates_memory_traffic() {
    let cx = Context::new();
    let mut module = Module::new("promote", &cx);
    let sig = cx.function_ty(cx.i32_ty(), &[], false);
    let g = module
        .add_function("main", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        let slot = b.alloca(cx.i32_ty(), None).unwrap();
        let seven = ValueRef::Const(cx.const_int(cx.i32_ty(), 7).unwrap());
        b.store(seven, slot).unwrap();
        let loaded = b.load(slot).unwrap();
        b.ret(Some(loaded)).unwrap();
    }

    let settings = o2();
    let mut pm = PassManager::new(registry(), settings.clone());
    add_canonical_passes(&mut pm, &settings).unwrap();
    pm.run(&mut module, &cx).unwrap();

    let func = &module.functions[f];
    for i in func.inst_ids() {
        assert!(
            !matches!(
                func.inst(i).opcode,
                Opcode::Alloca | Opcode::Load | Opcode::Store
            ),
            "memory instruction survived promotion"
        );
    }
    let insts = func.inst_ids();
    assert_eq!(insts.len(), 1);
    let ret = func.inst(insts[0]);
    let c = ret.operands[0].as_const().unwrap();
    assert_eq!(cx.const_int_value(c), Some(7));
}

/// Canonical passes are idempotent: a second run reports no change and
/// prints identically.
#[test]
fn canonical_pipeline_is_idempotent() {
    let cx = Context::new();
    let mut module = Module::new("idem", &cx);
    let sig = cx.function_ty(cx.i32_ty(), &[cx.i32_ty()], false);
    let g = module
        .add_function("f", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        let x = ValueRef::Arg(ArgId::from_raw(0));
        let two = ValueRef::Const(cx.const_int(cx.i32_ty(), 2).unwrap());
        // Dead: no uses, removed by the cleanup round.
        b.binary(Opcode::Mul, x, two).unwrap();
        let sum = b.binary(Opcode::Add, x, two).unwrap();
        b.ret(Some(sum)).unwrap();
    }

    let settings = o2();
    let mut pm = PassManager::new(registry(), settings.clone());
    add_canonical_passes(&mut pm, &settings).unwrap();
    pm.run(&mut module, &cx).unwrap();
    let after_first = print_module(&module, &cx);

    let mut pm = PassManager::new(registry(), settings.clone());
    add_canonical_passes(&mut pm, &settings).unwrap();
    let changed = pm.run(&mut module, &cx).unwrap();
    assert!(!changed);
    assert_eq!(after_first, print_module(&module, &cx));
}

/// The verifier rejects a handcrafted broken function and a pipeline
/// surfaces the failure.
#[test]
fn verifier_rejects_missing_terminator() {
    let cx = Context::new();
    let mut module = Module::new("broken", &cx);
    let sig = cx.function_ty(cx.void_ty(), &[], false);
    let g = module
        .add_function("f", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    module.functions[f].add_block(); // no terminator

    assert!(verifier::verify_module(&module, &cx).is_err());

    let mut pm = PassManager::new(registry(), Settings::default());
    pm.add_by_argument("verify").unwrap();
    assert!(pm.run(&mut module, &cx).is_err());
}

/// Clones of a well-formed module verify too.
#[test]
fn clone_of_verified_module_verifies() {
    let cx = Context::new();
    let mut module = Module::new("c", &cx);
    let sig = cx.function_ty(cx.i32_ty(), &[cx.i32_ty()], false);
    let g = module
        .add_function("id", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        b.ret(Some(ValueRef::Arg(ArgId::from_raw(0)))).unwrap();
    }
    verifier::verify_module(&module, &cx).unwrap();
    let copy = module.clone();
    verifier::verify_module(&copy, &cx).unwrap();
}

// ---------------------------------------------------------------------------
// preservation (scenario: a CFG-preserving pass must not force a
// CFG-only analysis to recompute)
// ---------------------------------------------------------------------------

static RUNS: AtomicUsize = AtomicUsize::new(0);

const COUNTED: &str = "counted-analysis";

struct CountedAnalysis;

impl FunctionPass for CountedAnalysis {
    fn name(&self) -> &'static str {
        "Counted Analysis"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new().provides(COUNTED).preserves(Preserved::All)
    }

    fn run(
        &mut self,
        _f: midend::ir::FuncId,
        _m: &mut Module,
        _cx: &Context,
        am: &mut AnalysisCache,
    ) -> midend::Result<bool> {
        RUNS.fetch_add(1, Ordering::SeqCst);
        am.put(COUNTED, ());
        Ok(false)
    }
}

struct Consumer;

impl FunctionPass for Consumer {
    fn name(&self) -> &'static str {
        "Consumer"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new().requires(COUNTED).preserves(Preserved::All)
    }

    fn run(
        &mut self,
        _f: midend::ir::FuncId,
        _m: &mut Module,
        _cx: &Context,
        am: &mut AnalysisCache,
    ) -> midend::Result<bool> {
        assert!(am.contains(COUNTED));
        Ok(false)
    }
}

struct Transform {
    preserved: Preserved,
}

impl FunctionPass for Transform {
    fn name(&self) -> &'static str {
        "Transform Under Test"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new().preserves(self.preserved.clone())
    }

    fn run(
        &mut self,
        _f: midend::ir::FuncId,
        _m: &mut Module,
        _cx: &Context,
        _am: &mut AnalysisCache,
    ) -> midend::Result<bool> {
        Ok(true)
    }
}

fn one_function_module(cx: &Context) -> Module {
    let mut module = Module::new("m", cx);
    let sig = cx.function_ty(cx.void_ty(), &[], false);
    let g = module
        .add_function("f", sig, Linkage::External, cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    let Module {
        globals, functions, ..
    } = &mut module;
    let mut b = Builder::new(cx, globals, &mut functions[f]);
    b.start_block();
    b.ret(None).unwrap();
    module
}

fn counted_registry() -> Rc<PassRegistry> {
    let mut registry = PassRegistry::with_builtin_passes();
    registry.register(PassInfo {
        name: "Counted Analysis",
        argument: COUNTED,
        kind: PassKind::Analysis,
        cfg_only: true,
        ctor: || AnyPass::Function(Box::new(CountedAnalysis)),
    });
    registry.register(PassInfo {
        name: "Consumer",
        argument: "consumer",
        kind: PassKind::Utility,
        cfg_only: false,
        ctor: || AnyPass::Function(Box::new(Consumer)),
    });
    Rc::new(registry)
}

#[test]
fn cfg_preserving_pass_keeps_cfg_only_analysis_alive() {
    let cx = Context::new();

    // Preserving all-CFG-only: one computation serves both consumers.
    RUNS.store(0, Ordering::SeqCst);
    let mut module = one_function_module(&cx);
    let mut pm = PassManager::new(counted_registry(), Settings::default());
    pm.add(AnyPass::Function(Box::new(Consumer))).unwrap();
    pm.add(AnyPass::Function(Box::new(Transform {
        preserved: Preserved::AllCfgOnly,
    })))
    .unwrap();
    pm.add(AnyPass::Function(Box::new(Consumer))).unwrap();
    pm.run(&mut module, &cx).unwrap();
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);

    // Preserving nothing: the second consumer forces a recomputation.
    RUNS.store(0, Ordering::SeqCst);
    let mut module = one_function_module(&cx);
    let mut pm = PassManager::new(counted_registry(), Settings::default());
    pm.add(AnyPass::Function(Box::new(Consumer))).unwrap();
    pm.add(AnyPass::Function(Box::new(Transform {
        preserved: Preserved::None,
    })))
    .unwrap();
    pm.add(AnyPass::Function(Box::new(Consumer))).unwrap();
    pm.run(&mut module, &cx).unwrap();
    assert_eq!(RUNS.load(Ordering::SeqCst), 2);
}

/// Required analyses are synthesized ahead of their consumer and appear
/// in the structure dump inside the function batch.
#[test]
fn required_analyses_are_synthesized() {
    let mut pm = PassManager::new(registry(), Settings::default());
    pm.add_by_argument("mem2reg").unwrap();
    let structure = pm.dump_structure();
    let dom = structure.find("Dominator Set Construction").unwrap();
    let mem2reg = structure.find("Promote Memory to Register").unwrap();
    assert!(dom < mem2reg);
}

/// Module-level analyses chain: dsa-bu pulls in dsa-local and the call
/// graph automatically.
#[test]
fn dsa_closures_schedule_their_inputs() {
    let cx = Context::new();
    let mut module = one_function_module(&cx);
    let mut pm = PassManager::new(registry(), Settings::default());
    pm.add_by_argument("dsa-td").unwrap();
    let structure = pm.dump_structure();
    for name in [
        "Local Data Structure Graphs",
        "Call Graph Construction",
        "Bottom-Up Data Structure Graphs",
        "Top-Down Data Structure Graphs",
    ] {
        assert!(structure.contains(name), "missing {name} in\n{structure}");
    }
    pm.run(&mut module, &cx).unwrap();
}

/// The dominance analysis id is stable API.
#[test]
fn dominator_analysis_is_registered() {
    assert!(registry().find(DOMINATORS).is_some());
}
