//! End-to-end compilation tests over small source programs.
//!
//! Each program runs the whole pipeline down to a serialized object file on
//! both targets. Execution is covered by the linked test harness outside
//! this repository; here the assertions are structural: clean diagnostics,
//! plausible code, and the expected symbols and relocations.

use cot_codegen::binemit::{CompiledFunc, Reloc};
use cot_codegen::{Arch, Context, Diagnostics};
use cot_object::ObjectModule;

/// Compile `src` for `arch`, returning the compiled functions and the
/// finished object bytes.
fn compile(src: &str, arch: Arch) -> (Vec<CompiledFunc>, Vec<u8>) {
    let diag = Diagnostics::new();
    let (checked, ir_funcs) =
        cot_frontend::compile_source(src, &diag).expect("frontend failed");
    assert!(!diag.has_errors(), "diagnostics: {:?}", diag.take());

    let mut module = ObjectModule::new(arch);
    for (name, &ty) in &checked.globals {
        module.add_global(name, checked.registry.size_of(ty));
    }
    let ctx = Context::new(arch);
    let mut out = Vec::new();
    for f in &ir_funcs {
        if f.is_extern {
            continue;
        }
        let string_syms: Vec<String> = f
            .strings
            .iter()
            .map(|s| module.intern_literal(s))
            .collect();
        let compiled = ctx
            .compile(f, &checked.registry, &string_syms)
            .expect("codegen failed");
        out.push(CompiledFunc {
            name: compiled.name.clone(),
            code: compiled.code.clone(),
            relocs: compiled.relocs.clone(),
        });
        module.add_function(compiled);
    }
    let bytes = module.finish().expect("object write failed");
    (out, bytes)
}

fn compile_both(src: &str) -> [(Vec<CompiledFunc>, Vec<u8>); 2] {
    [compile(src, Arch::Aarch64), compile(src, Arch::X64)]
}

#[test]
fn return_constant() {
    for (funcs, object) in compile_both("fn main() i64 { return 42 }") {
        assert_eq!(funcs.len(), 1);
        assert!(!funcs[0].code.is_empty());
        assert!(!object.is_empty());
    }
}

#[test]
fn return_sum_of_constants() {
    for (funcs, _) in compile_both("fn main() i64 { return 20 + 22 }") {
        assert_eq!(funcs[0].name, "main");
    }
}

#[test]
fn call_between_functions() {
    let src = "fn add(a: i64, b: i64) i64 { return a + b }
               fn main() i64 { return add(40, 2) }";
    for (arch, want) in [
        (Arch::Aarch64, Reloc::Arm64Call26),
        (Arch::X64, Reloc::X64CallRel32),
    ] {
        let (funcs, _) = compile(src, arch);
        let main = funcs.iter().find(|f| f.name == "main").unwrap();
        let calls: Vec<_> = main.relocs.iter().filter(|r| r.kind == want).collect();
        assert_eq!(calls.len(), 1, "exactly one call relocation");
        assert_eq!(calls[0].name, "add");
    }
}

#[test]
fn while_loop_counts_to_ten() {
    let src = "fn main() i64 { var i: i64 = 0; while i < 10 { i = i + 1 } return i + 32 }";
    for (funcs, _) in compile_both(src) {
        // The loop must produce at least one backward branch; on both
        // targets the code is clearly bigger than a straight return.
        assert!(funcs[0].code.len() > 24);
    }
}

#[test]
fn recursive_fib() {
    let src = "fn fib(n: i64) i64 { if n < 2 { return n } return fib(n-1) + fib(n-2) }
               fn main() i64 { return fib(10) }";
    for (arch, want) in [
        (Arch::Aarch64, Reloc::Arm64Call26),
        (Arch::X64, Reloc::X64CallRel32),
    ] {
        let (funcs, _) = compile(src, arch);
        let fib = funcs.iter().find(|f| f.name == "fib").unwrap();
        let self_calls = fib
            .relocs
            .iter()
            .filter(|r| r.kind == want && r.name == "fib")
            .count();
        assert_eq!(self_calls, 2, "fib calls itself twice");
    }
}

#[test]
fn struct_fields_round_trip() {
    let src = "struct P { x: i64, y: i64 }
               fn main() i64 { var p: P; p.x = 20; p.y = 22; return p.x + p.y }";
    for (funcs, _) in compile_both(src) {
        assert_eq!(funcs[0].name, "main");
    }
}

#[test]
fn string_literal_and_len() {
    // The length of a literal folds to a constant, but the literal itself
    // still lands, deduplicated, in the data section.
    let src = "fn main() i64 { let s = \"hello\"; return len(s) + 37 }";
    for (_, object) in compile_both(src) {
        assert!(
            object.windows(5).any(|w| w == b"hello"),
            "literal bytes missing from the object"
        );
        let sym = b"L.str.0";
        assert!(
            object.windows(sym.len()).any(|w| w == sym),
            "literal symbol missing"
        );
    }
}

#[test]
fn string_argument_references_the_literal() {
    let src = "extern fn puts(s: string)
               fn main() i64 { puts(\"hello\") return 0 }";
    for (funcs, object) in compile_both(src) {
        let main = funcs.iter().find(|f| f.name == "main").unwrap();
        assert!(
            main.relocs.iter().any(|r| r.name == "L.str.0"),
            "literal address must be materialized through a relocation"
        );
        assert!(
            main.relocs.iter().any(|r| r.name == "puts"),
            "call relocation missing"
        );
        assert!(object.windows(5).any(|w| w == b"hello"));
    }
}

#[test]
fn extern_call_leaves_undefined_symbol() {
    let src = "extern fn __print_int(n: i64)
               fn main() i64 { __print_int(42) return 0 }";
    let diag = Diagnostics::new();
    let (checked, ir_funcs) = cot_frontend::compile_source(src, &diag).unwrap();
    assert!(!diag.has_errors());
    let mut module = ObjectModule::new(Arch::Aarch64);
    let ctx = Context::new(Arch::Aarch64);
    for f in &ir_funcs {
        if f.is_extern {
            continue;
        }
        let compiled = ctx.compile(f, &checked.registry, &[]).unwrap();
        module.add_function(compiled);
    }
    assert_eq!(module.undefined_symbols(), vec!["__print_int".to_string()]);
    let bytes = module.finish().unwrap();
    assert!(bytes.windows(12).any(|w| w == b"___print_int"));
}

#[test]
fn for_loop_over_array() {
    let src = "fn main() i64 {
                   var a: [3]i64 = [10, 14, 18]
                   var total: i64 = 0
                   for v in a { total += v }
                   return total
               }";
    for (funcs, _) in compile_both(src) {
        assert_eq!(funcs[0].name, "main");
    }
}

#[test]
fn defer_and_early_return() {
    let src = "extern fn note(n: i64)
               fn main() i64 {
                   defer note(1)
                   var i: i64 = 0
                   while true { i += 1; if i > 3 { break } }
                   return i + 38
               }";
    for (arch, want) in [
        (Arch::Aarch64, Reloc::Arm64Call26),
        (Arch::X64, Reloc::X64CallRel32),
    ] {
        let (funcs, _) = compile(src, arch);
        let main = funcs.iter().find(|f| f.name == "main").unwrap();
        assert!(
            main.relocs.iter().any(|r| r.kind == want && r.name == "note"),
            "deferred call must be emitted"
        );
    }
}

#[test]
fn globals_get_data_symbols() {
    let src = "var counter: i64
               fn main() i64 { counter = 7; return counter }";
    let (_, object) = compile(src, Arch::X64);
    assert!(object.windows(8).any(|w| w == b"counter\0"));
}

#[test]
fn source_errors_block_codegen() {
    let diag = Diagnostics::new();
    let (_, funcs) =
        cot_frontend::compile_source("fn main() i64 { return missing }", &diag).unwrap();
    assert!(diag.has_errors());
    assert!(funcs.is_empty(), "no IR is produced for a broken unit");
}
