use midend::analysis::callgraph::CallGraph;
use midend::analysis::dsa::local::build_local_graph;
use midend::analysis::dsa::NodeFlags;
use midend::context::Context;
use midend::ir::{ArgId, GlobalId, Linkage, Module, ValueRef};
use midend::Builder;

fn func_id(module: &Module, g: GlobalId) -> midend::ir::FuncId {
    module.globals[g].function_id().unwrap()
}

/// A heap cell that never leaves the function is reported as a
/// non-escaping allocation; one that is returned escapes.
#[test]
fn escape_analysis_separates_local_and_returned_heap() {
    let cx = Context::new();
    let mut module = Module::new("m", &cx);
    let p32 = cx.pointer_to(cx.i32_ty());

    let local_sig = cx.function_ty(cx.i32_ty(), &[], false);
    let local_g = module
        .add_function("local_use", local_sig, Linkage::External, &cx)
        .unwrap();
    let local_f = func_id(&module, local_g);
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[local_f]);
        b.start_block();
        let cell = b.malloc(cx.i32_ty(), None).unwrap();
        let seven = ValueRef::Const(cx.const_int(cx.i32_ty(), 7).unwrap());
        b.store(seven, cell).unwrap();
        let v = b.load(cell).unwrap();
        b.free(cell).unwrap();
        b.ret(Some(v)).unwrap();
    }

    let leak_sig = cx.function_ty(p32, &[], false);
    let leak_g = module
        .add_function("leak", leak_sig, Linkage::External, &cx)
        .unwrap();
    let leak_f = func_id(&module, leak_g);
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[leak_f]);
        b.start_block();
        let cell = b.malloc(cx.i32_ty(), None).unwrap();
        b.ret(Some(cell)).unwrap();
    }

    let g = build_local_graph(
        local_f,
        &module.functions[local_f],
        &module.globals,
        &module.target,
        &cx,
    );
    let locals = g.non_escaping_allocations();
    assert_eq!(locals.len(), 1);
    let node = g.node(locals[0]);
    assert!(node.flags.contains(NodeFlags::HEAP));
    assert!(node.flags.contains(NodeFlags::READ | NodeFlags::MODIFIED));

    let g = build_local_graph(
        leak_f,
        &module.functions[leak_f],
        &module.globals,
        &module.target,
        &cx,
    );
    assert!(g.non_escaping_allocations().is_empty());
}

/// Storing into distinct fields of a struct keeps the field structure;
/// a variable array index collapses it.
#[test]
fn variable_indexing_collapses_the_node() {
    let cx = Context::new();
    let mut module = Module::new("m", &cx);
    let arr = cx.array_of(cx.i32_ty(), 8);

    let sig = cx.function_ty(cx.void_ty(), &[cx.u64_ty()], false);
    let g = module
        .add_function("touch", sig, Linkage::External, &cx)
        .unwrap();
    let f = func_id(&module, g);
    let slot;
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        slot = b.alloca(arr, None).unwrap();
        let zero = ValueRef::Const(cx.const_uint(cx.u64_ty(), 0).unwrap());
        let i = ValueRef::Arg(ArgId::from_raw(0));
        let elem = b.gep(slot, &[zero, i]).unwrap();
        let one = ValueRef::Const(cx.const_int(cx.i32_ty(), 1).unwrap());
        b.store(one, elem).unwrap();
        b.ret(None).unwrap();
    }

    let g = build_local_graph(f, &module.functions[f], &module.globals, &module.target, &cx);
    let handle = g.scalar(f, slot).unwrap();
    assert!(g.node(handle.node).flags.contains(NodeFlags::COLLAPSED));
}

/// Mutual recursion lands both functions in one SCC, ordered before
/// their caller.
#[test]
fn callgraph_sccs_come_out_leaves_first() {
    let cx = Context::new();
    let mut module = Module::new("m", &cx);
    let sig = cx.function_ty(cx.void_ty(), &[], false);
    let even_g = module
        .add_function("even", sig, Linkage::Internal, &cx)
        .unwrap();
    let odd_g = module
        .add_function("odd", sig, Linkage::Internal, &cx)
        .unwrap();
    let main_g = module
        .add_function("main", sig, Linkage::External, &cx)
        .unwrap();
    let (even_f, odd_f, main_f) = (
        func_id(&module, even_g),
        func_id(&module, odd_g),
        func_id(&module, main_g),
    );

    for (f, callee) in [(even_f, odd_g), (odd_f, even_g), (main_f, even_g)] {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        b.call(ValueRef::Global(callee), &[]).unwrap();
        b.ret(None).unwrap();
    }

    let cg = CallGraph::compute(&module);
    let sccs = cg.sccs_postorder();
    assert_eq!(sccs.len(), 2);
    let mutual: Vec<_> = {
        let mut v = sccs[0].clone();
        v.sort_unstable();
        v
    };
    let mut expected = vec![even_f, odd_f];
    expected.sort_unstable();
    assert_eq!(mutual, expected);
    assert_eq!(sccs[1], vec![main_f]);
    assert!(!cg.calls_unknown(main_f));
}

/// An indirect call is recorded as calling unknown code.
#[test]
fn indirect_calls_are_unknown() {
    let cx = Context::new();
    let mut module = Module::new("m", &cx);
    let callee_sig = cx.function_ty(cx.void_ty(), &[], false);
    let fp = cx.pointer_to(callee_sig);
    let sig = cx.function_ty(cx.void_ty(), &[fp], false);
    let g = module
        .add_function("dispatch", sig, Linkage::External, &cx)
        .unwrap();
    let f = func_id(&module, g);
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        b.call(ValueRef::Arg(ArgId::from_raw(0)), &[]).unwrap();
        b.ret(None).unwrap();
    }
    let cg = CallGraph::compute(&module);
    assert!(cg.calls_unknown(f));
    assert!(cg.callees(f).is_empty());
}
