use std::fs;

use midend::codec::{read_module, write_module, Archive, ArchiveBuilder, ModuleProvider};
use midend::codec::archive::MemberInfo;
use midend::context::Context;
use midend::ir::printer::print_module;
use midend::ir::verifier;
use midend::ir::{ArgId, Linkage, Module, Opcode, ValueRef};
use midend::{Builder, CodecError, Error};

/// A module exercising most of the surface: globals with aggregate
/// initializers, declarations, phis, branches, calls, address
/// arithmetic, casts and switches.
fn rich_module(cx: &Context) -> Module {
    let mut module = Module::new("rich", cx);
    module.deplibs.push("m".into());

    let pair = cx.struct_of(&[cx.i32_ty(), cx.i32_ty()]);
    let init = cx
        .const_aggregate(
            pair,
            &[
                cx.const_int(cx.i32_ty(), 3).unwrap(),
                cx.const_int(cx.i32_ty(), 4).unwrap(),
            ],
        )
        .unwrap();
    let table = module
        .add_global("table", pair, Linkage::Internal, Some(init), true, cx)
        .unwrap();

    let puts_sig = cx.function_ty(cx.i32_ty(), &[cx.pointer_to(cx.u8_ty())], false);
    module
        .add_function("puts", puts_sig, Linkage::External, cx)
        .unwrap();

    let sig = cx.function_ty(cx.i32_ty(), &[cx.i32_ty(), cx.bool_ty()], false);
    let g = module
        .add_function("compute", sig, Linkage::External, cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let mut b = Builder::new(cx, globals, func);
        let entry = b.start_block();
        let then = b.func.add_block();
        let other = b.func.add_block();
        let join = b.func.add_block();

        let n = ValueRef::Arg(ArgId::from_raw(0));
        let flag = ValueRef::Arg(ArgId::from_raw(1));
        b.position_at_end(entry);
        let zero = ValueRef::Const(cx.const_uint(cx.u64_ty(), 0).unwrap());
        let one = ValueRef::Const(cx.const_uint(cx.u32_ty(), 1).unwrap());
        let field = b.gep(ValueRef::Global(table), &[zero, one]).unwrap();
        let loaded = b.load(field).unwrap();
        b.cond_br(flag, then, other).unwrap();

        b.position_at_end(then);
        let doubled = b.binary(Opcode::Add, n, n).unwrap();
        b.br(join).unwrap();

        b.position_at_end(other);
        let narrowed = b.cast(n, cx.i64_ty()).unwrap();
        let widened = b.cast(narrowed, cx.i32_ty()).unwrap();
        b.br(join).unwrap();

        b.position_at_end(join);
        let phi = b.phi(cx.i32_ty()).unwrap();
        b.add_incoming(phi, doubled, then).unwrap();
        b.add_incoming(phi, widened, other).unwrap();
        let sum = b.binary(Opcode::Add, phi, loaded).unwrap();
        b.ret(Some(sum)).unwrap();

        func.set_value_name(n, Some("n"), globals, cx);
        func.set_value_name(phi, Some("merged"), globals, cx);
        func.set_value_name(ValueRef::Block(join), Some("join"), globals, cx);
    }
    verifier::verify_module(&module, cx).unwrap();
    module
}

#[test]
fn round_trip_preserves_structure() {
    let cx = Context::new();
    let module = rich_module(&cx);
    let bytes = write_module(&module, &cx);
    let back = read_module(&bytes, &cx).unwrap();
    verifier::verify_module(&back, &cx).unwrap();
    assert_eq!(print_module(&module, &cx), print_module(&back, &cx));
}

#[test]
fn empty_module_bytecode_is_minimal_and_reproducible() {
    let cx = Context::new();
    let module = Module::new("empty", &cx);
    let bytes = write_module(&module, &cx);
    assert_eq!(bytes, write_module(&module, &cx));
    assert!(bytes.len() < 64, "empty module took {} bytes", bytes.len());
    let back = read_module(&bytes, &cx).unwrap();
    assert_eq!(back.name, "empty");
}

#[test]
fn lazy_provider_parses_bodies_on_demand() {
    let cx = Context::new();
    let module = rich_module(&cx);
    let bytes = write_module(&module, &cx);

    let mut provider = ModuleProvider::open(bytes, &cx).unwrap();
    let compute = provider
        .module()
        .lookup_global_named("compute")
        .unwrap();
    let puts = provider.module().lookup_global_named("puts").unwrap();
    let compute_f = provider.module().globals[compute].function_id().unwrap();
    let puts_f = provider.module().globals[puts].function_id().unwrap();

    // Names are available without touching any body.
    assert_eq!(provider.module().functions[compute_f].name, "compute");
    assert!(!provider.is_materialized(compute_f));
    assert!(provider.module().functions[compute_f].is_declaration());

    // Materializing one body leaves the others alone (`puts` has no
    // body at all and counts as materialized).
    provider.materialize_function(compute_f, &cx).unwrap();
    assert!(provider.is_materialized(compute_f));
    assert!(!provider.module().functions[compute_f].is_declaration());
    assert!(provider.is_materialized(puts_f));

    let back = provider.into_module(&cx).unwrap();
    assert_eq!(print_module(&module, &cx), print_module(&back, &cx));
}

/// A loop: the phi reads the increment defined later in its own block,
/// so the writer emits a use before the definition and the reader must
/// resolve the forward reference.
#[test]
fn forward_references_resolve() {
    let cx = Context::new();
    let mut module = Module::new("loop", &cx);
    let sig = cx.function_ty(cx.i32_ty(), &[cx.i32_ty()], false);
    let g = module
        .add_function("count", sig, Linkage::External, &cx)
        .unwrap();
    let f = module.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut module;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        let entry = b.start_block();
        let body = b.func.add_block();
        let exit = b.func.add_block();

        let limit = ValueRef::Arg(ArgId::from_raw(0));
        b.position_at_end(entry);
        b.br(body).unwrap();

        b.position_at_end(body);
        let zero = ValueRef::Const(cx.const_int(cx.i32_ty(), 0).unwrap());
        let one = ValueRef::Const(cx.const_int(cx.i32_ty(), 1).unwrap());
        let i = b.phi(cx.i32_ty()).unwrap();
        let next = b.binary(Opcode::Add, i, one).unwrap();
        b.add_incoming(i, zero, entry).unwrap();
        b.add_incoming(i, next, body).unwrap();
        let done = b.binary(Opcode::SetGe, next, limit).unwrap();
        b.cond_br(done, exit, body).unwrap();

        b.position_at_end(exit);
        b.ret(Some(i)).unwrap();
    }
    verifier::verify_module(&module, &cx).unwrap();

    let bytes = write_module(&module, &cx);
    let back = read_module(&bytes, &cx).unwrap();
    assert_eq!(print_module(&module, &cx), print_module(&back, &cx));
}

#[test]
fn bad_magic_is_rejected() {
    let cx = Context::new();
    let err = read_module(b"nope....", &cx).unwrap_err();
    assert!(matches!(err, Error::Codec(CodecError::BadMagic(_))));
}

#[test]
fn truncated_streams_are_rejected() {
    let cx = Context::new();
    let module = rich_module(&cx);
    let bytes = write_module(&module, &cx);
    // Chopping inside a block must never panic, and must fail cleanly
    // wherever parsing notices.
    for cut in [6, bytes.len() / 2, bytes.len() - 1] {
        assert!(read_module(&bytes[..cut], &cx).is_err());
    }
}

#[test]
fn future_versions_are_rejected() {
    let cx = Context::new();
    let mut bytes = write_module(&Module::new("v", &cx), &cx);
    bytes[4] = 0x7f; // version byte after the 4-byte magic
    let err = read_module(&bytes, &cx).unwrap_err();
    assert!(matches!(
        err,
        Error::Codec(CodecError::UnsupportedVersion(_))
    ));
}

#[test]
fn archives_demand_load_by_symbol() {
    let cx = Context::new();
    let mut first = Module::new("first", &cx);
    let sig = cx.function_ty(cx.void_ty(), &[], false);
    let g = first
        .add_function("alpha", sig, Linkage::External, &cx)
        .unwrap();
    let f = first.globals[g].function_id().unwrap();
    {
        let Module {
            globals, functions, ..
        } = &mut first;
        let mut b = Builder::new(&cx, globals, &mut functions[f]);
        b.start_block();
        b.ret(None).unwrap();
    }
    let mut second = Module::new("second", &cx);
    second
        .add_global(
            "beta",
            cx.i32_ty(),
            Linkage::External,
            Some(cx.const_int(cx.i32_ty(), 5).unwrap()),
            false,
            &cx,
        )
        .unwrap();
    // Internal symbols stay out of the index.
    second
        .add_global(
            "hidden",
            cx.i32_ty(),
            Linkage::Internal,
            Some(cx.const_int(cx.i32_ty(), 6).unwrap()),
            false,
            &cx,
        )
        .unwrap();

    let mut builder = ArchiveBuilder::new();
    builder.add_module(MemberInfo::named("first.bc"), &first, &cx);
    builder.add_module(MemberInfo::named("second.bc"), &second, &cx);
    let bytes = builder.build();

    let archive = Archive::parse(&bytes).unwrap();
    let mut symbols: Vec<_> = archive.symbols().collect();
    symbols.sort_unstable();
    assert_eq!(symbols, ["alpha", "beta"]);
    assert_eq!(archive.members().count(), 2);

    let provider = archive.load_module_for_symbol("beta", &cx).unwrap();
    assert_eq!(provider.module().name, "second");
    assert!(archive.load_module_for_symbol("gamma", &cx).is_err());
}

#[test]
fn archives_round_trip_through_disk() {
    let cx = Context::new();
    let module = rich_module(&cx);
    let mut builder = ArchiveBuilder::new();
    builder.add_module(MemberInfo::named("rich.bc"), &module, &cx);
    let bytes = builder.build();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lib.a");
    fs::write(&path, &bytes).unwrap();
    let loaded = fs::read(&path).unwrap();

    let archive = Archive::parse(&loaded).unwrap();
    let provider = archive.load_module_for_symbol("compute", &cx).unwrap();
    let back = provider.into_module(&cx).unwrap();
    assert_eq!(print_module(&module, &cx), print_module(&back, &cx));
}
