//! Property tests over randomly shaped control flow.
//!
//! A random tree of straight-line, branch, and loop regions is lowered into
//! named-local IR; the SSA builder must produce a function the verifier
//! accepts, the passes must preserve the invariants, and scheduling must be
//! a fixed point.

use cot_codegen::ir::{self, Builder, Opcode as O};
use cot_codegen::isa::Arch;
use cot_codegen::ssa::{self, passes, verify};
use cot_codegen::types::{self, TypeRegistry};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Shape {
    /// A run of assignments selected by the bits.
    Straight(u8),
    /// A diamond with the two arms.
    If(Box<Shape>, Box<Shape>),
    /// A loop around the body.
    While(Box<Shape>),
    /// Two regions in sequence.
    Seq(Box<Shape>, Box<Shape>),
}

fn shape() -> impl Strategy<Value = Shape> {
    let leaf = any::<u8>().prop_map(Shape::Straight);
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Shape::If(Box::new(a), Box::new(b))),
            inner.clone().prop_map(|s| Shape::While(Box::new(s))),
            (inner.clone(), inner).prop_map(|(a, b)| Shape::Seq(Box::new(a), Box::new(b))),
        ]
    })
}

struct Gen {
    b: Builder,
    x: ir::Local,
    y: ir::Local,
}

impl Gen {
    fn new() -> Self {
        let mut b = Builder::new("gen", types::I64);
        let x = b.declare_local("x", types::I64, 8, false);
        let y = b.declare_local("y", types::I64, 8, false);
        let zero = b.ins0(O::ConstInt, types::I64, &[], 0);
        b.ins0(O::StoreLocal, types::I64, &[zero], x.index_i64());
        let one = b.ins0(O::ConstInt, types::I64, &[], 1);
        b.ins0(O::StoreLocal, types::I64, &[one], y.index_i64());
        Self { b, x, y }
    }

    fn emit(&mut self, s: &Shape) {
        match s {
            Shape::Straight(bits) => {
                if bits & 1 != 0 {
                    let xv = self.b.ins0(O::LoadLocal, types::I64, &[], self.x.index_i64());
                    let one = self.b.ins0(O::ConstInt, types::I64, &[], 1);
                    let sum = self.b.ins0(O::Add, types::I64, &[xv, one], 0);
                    self.b
                        .ins0(O::StoreLocal, types::I64, &[sum], self.x.index_i64());
                }
                if bits & 2 != 0 {
                    let c = self.b.ins0(O::ConstInt, types::I64, &[], (*bits as i64) & 15);
                    self.b
                        .ins0(O::StoreLocal, types::I64, &[c], self.y.index_i64());
                }
                if bits & 4 != 0 {
                    let xv = self.b.ins0(O::LoadLocal, types::I64, &[], self.x.index_i64());
                    let yv = self.b.ins0(O::LoadLocal, types::I64, &[], self.y.index_i64());
                    let sum = self.b.ins0(O::Add, types::I64, &[xv, yv], 0);
                    self.b
                        .ins0(O::StoreLocal, types::I64, &[sum], self.y.index_i64());
                }
            }
            Shape::If(t, e) => {
                let xv = self.b.ins0(O::LoadLocal, types::I64, &[], self.x.index_i64());
                let yv = self.b.ins0(O::LoadLocal, types::I64, &[], self.y.index_i64());
                let c = self.b.ins0(O::Lt, types::BOOL, &[xv, yv], 0);
                let then_b = self.b.create_block();
                let else_b = self.b.create_block();
                let merge = self.b.create_block();
                self.b
                    .ins0(O::Branch, types::VOID, &[c], ir::pack_targets(then_b, else_b));
                self.b.switch_to_block(then_b);
                self.emit(t);
                self.b.ins0(O::Jump, types::VOID, &[], merge.as_u32() as i64);
                self.b.switch_to_block(else_b);
                self.emit(e);
                self.b.ins0(O::Jump, types::VOID, &[], merge.as_u32() as i64);
                self.b.switch_to_block(merge);
            }
            Shape::While(body) => {
                let cond_b = self.b.create_block();
                let body_b = self.b.create_block();
                let exit_b = self.b.create_block();
                self.b.ins0(O::Jump, types::VOID, &[], cond_b.as_u32() as i64);
                self.b.switch_to_block(cond_b);
                let xv = self.b.ins0(O::LoadLocal, types::I64, &[], self.x.index_i64());
                let yv = self.b.ins0(O::LoadLocal, types::I64, &[], self.y.index_i64());
                let c = self.b.ins0(O::Lt, types::BOOL, &[xv, yv], 0);
                self.b
                    .ins0(O::Branch, types::VOID, &[c], ir::pack_targets(body_b, exit_b));
                self.b.switch_to_block(body_b);
                self.emit(body);
                let xv2 = self.b.ins0(O::LoadLocal, types::I64, &[], self.x.index_i64());
                let one = self.b.ins0(O::ConstInt, types::I64, &[], 1);
                let nx = self.b.ins0(O::Add, types::I64, &[xv2, one], 0);
                self.b
                    .ins0(O::StoreLocal, types::I64, &[nx], self.x.index_i64());
                self.b.ins0(O::Jump, types::VOID, &[], cond_b.as_u32() as i64);
                self.b.switch_to_block(exit_b);
            }
            Shape::Seq(a, b) => {
                self.emit(a);
                self.emit(b);
            }
        }
    }

    fn finish(mut self) -> ir::Function {
        let xv = self.b.ins0(O::LoadLocal, types::I64, &[], self.x.index_i64());
        let yv = self.b.ins0(O::LoadLocal, types::I64, &[], self.y.index_i64());
        let sum = self.b.ins0(O::Add, types::I64, &[xv, yv], 0);
        self.b.ins0(O::Return, types::VOID, &[sum], 0);
        self.b.finish()
    }
}

trait LocalExt {
    fn index_i64(&self) -> i64;
}

impl LocalExt for ir::Local {
    fn index_i64(&self) -> i64 {
        self.as_u32() as i64
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn builder_output_always_verifies(s in shape()) {
        let reg = TypeRegistry::new();
        let mut g = Gen::new();
        g.emit(&s);
        let f = g.finish();
        let ssa_func = ssa::builder::build(&f, &reg, Arch::Aarch64).unwrap();
        verify::verify(&ssa_func).unwrap();
    }

    #[test]
    fn passes_preserve_invariants(s in shape()) {
        let reg = TypeRegistry::new();
        let mut g = Gen::new();
        g.emit(&s);
        let f = g.finish();
        let mut ssa_func = ssa::builder::build(&f, &reg, Arch::Aarch64).unwrap();
        passes::run_all(&mut ssa_func, &reg).unwrap();
        verify::verify(&ssa_func).unwrap();
    }

    #[test]
    fn schedule_is_a_fixed_point(s in shape()) {
        let reg = TypeRegistry::new();
        let mut g = Gen::new();
        g.emit(&s);
        let f = g.finish();
        let mut ssa_func = ssa::builder::build(&f, &reg, Arch::Aarch64).unwrap();
        passes::run_all(&mut ssa_func, &reg).unwrap();
        passes::schedule::run(&mut ssa_func).unwrap();
        let before: Vec<Vec<ssa::Value>> = ssa_func
            .blocks
            .keys()
            .map(|b| ssa_func.blocks[b].values.clone())
            .collect();
        passes::schedule::run(&mut ssa_func).unwrap();
        let after: Vec<Vec<ssa::Value>> = ssa_func
            .blocks
            .keys()
            .map(|b| ssa_func.blocks[b].values.clone())
            .collect();
        prop_assert_eq!(before, after);
    }
}
