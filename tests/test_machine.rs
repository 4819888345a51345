use midend::context::Context;
use midend::ir::{ArgId, Linkage, Module, Opcode, ValueRef};
use midend::machine::select::select_function;
use midend::machine::target::{generic_ops, GenericTarget, MachineTarget};
use midend::machine::{lower_two_address, LiveVariables, MOperand};
use midend::Builder;

/// Select `f(a, b) = a + b` and rewrite it to two-address form: a copy
/// materializes immediately before the add, the add reads its own def,
/// and the operand count drops by one.
#[test]
fn selected_add_lowers_to_two_address() {
    let cx = Context::new();
    let mut module = Module::new("m", &cx);
    let sig = cx.function_ty(cx.i32_ty(), &[cx.i32_ty(), cx.i32_ty()], false);
    let g = module
        .add_function("sum", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        let a = ValueRef::Arg(ArgId::from_raw(0));
        let bb = ValueRef::Arg(ArgId::from_raw(1));
        let sum = b.binary(Opcode::Add, a, bb).unwrap();
        b.ret(Some(sum)).unwrap();
    }

    let mut mf = select_function(f, &module, &cx).unwrap();
    let target = GenericTarget;
    let mut lv = LiveVariables::compute(&mf);

    assert!(lower_two_address(&mut mf, &target, Some(&mut lv)));

    let block = mf.block_ids().next().unwrap();
    let insts = &mf.blocks[block].insts;
    let add_pos = insts
        .iter()
        .position(|&i| mf.inst(i).opcode == generic_ops::ADD)
        .unwrap();
    let add = mf.inst(insts[add_pos]);
    let copy = mf.inst(insts[add_pos - 1]);

    assert!(target.is_copy(copy));
    assert_eq!(add.operands.len(), 2);
    let def = &add.operands[0];
    assert!(def.is_reg_def() && def.is_reg_use());
    assert_eq!(copy.operands[0].reg(), def.reg());

    // The def of the result register moved onto the copy.
    let result = def.reg().unwrap().as_virtual().unwrap();
    assert_eq!(lv.def_of(result), Some(insts[add_pos - 1]));
}

/// The whole machine pipeline is idempotent over a diamond CFG with a
/// phi (eliminated into copies during selection).
#[test]
fn lowering_twice_changes_nothing() {
    let cx = Context::new();
    let mut module = Module::new("m", &cx);
    let sig = cx.function_ty(cx.i32_ty(), &[cx.bool_ty(), cx.i32_ty()], false);
    let g = module
        .add_function("pick", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        let entry = b.start_block();
        let then = b.func.add_block();
        let other = b.func.add_block();
        let join = b.func.add_block();

        let flag = ValueRef::Arg(ArgId::from_raw(0));
        let n = ValueRef::Arg(ArgId::from_raw(1));
        b.position_at_end(entry);
        b.cond_br(flag, then, other).unwrap();

        b.position_at_end(then);
        let one = ValueRef::Const(cx.const_int(cx.i32_ty(), 1).unwrap());
        let inc = b.binary(Opcode::Add, n, one).unwrap();
        b.br(join).unwrap();

        b.position_at_end(other);
        let dec = b.binary(Opcode::Sub, n, one).unwrap();
        b.br(join).unwrap();

        b.position_at_end(join);
        let phi = b.phi(cx.i32_ty()).unwrap();
        b.add_incoming(phi, inc, then).unwrap();
        b.add_incoming(phi, dec, other).unwrap();
        b.ret(Some(phi)).unwrap();
    }

    let mut mf = select_function(f, &module, &cx).unwrap();
    let target = GenericTarget;
    assert!(lower_two_address(&mut mf, &target, None));
    let snapshot: Vec<_> = mf
        .block_ids()
        .flat_map(|b| mf.blocks[b].insts.clone())
        .map(|i| mf.inst(i).clone().operands)
        .collect();
    assert!(!lower_two_address(&mut mf, &target, None));
    let again: Vec<_> = mf
        .block_ids()
        .flat_map(|b| mf.blocks[b].insts.clone())
        .map(|i| mf.inst(i).clone().operands)
        .collect();
    assert_eq!(snapshot, again);
}

/// Calls select into symbol operands the emitter can relocate.
#[test]
fn calls_reference_symbols() {
    let cx = Context::new();
    let mut module = Module::new("m", &cx);
    let callee_sig = cx.function_ty(cx.i32_ty(), &[], false);
    module
        .add_function("callee", callee_sig, Linkage::External, &cx)
        .unwrap();
    let sig = cx.function_ty(cx.i32_ty(), &[], false);
    let g = module
        .add_function("caller", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        let callee = globals
            .iter_enumerated()
            .find(|(_, g)| g.name == "callee")
            .map(|(id, _)| id)
            .unwrap();
        let r = b.call(ValueRef::Global(callee), &[]).unwrap();
        b.ret(Some(r)).unwrap();
    }

    let mf = select_function(f, &module, &cx).unwrap();
    let has_symbol = mf
        .block_ids()
        .flat_map(|b| mf.blocks[b].insts.clone())
        .any(|i| {
            mf.inst(i)
                .operands
                .iter()
                .any(|op| matches!(op, MOperand::Symbol(s) if &**s == "callee"))
        });
    assert!(has_symbol);
}
