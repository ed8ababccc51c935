//! Aggregate decomposition.
//!
//! After this pass the only values of string (or slice) type are the
//! `StringMake` / `SliceMake` pairings themselves; loads, stores, constants,
//! selects and phis of 16-byte aggregates are all rewritten into their
//! eight-byte components. The rules feed each other (a store of a load is
//! only splittable once the load has been split), so the pass iterates to a
//! fixed point with a small safety cap.

use crate::error::{CodegenError, CodegenResult};
use crate::ssa::passes::place_before;
use crate::ssa::{Func, Op, Value};
use crate::types::{self, TypeData, TypeRegistry};

/// Iteration cap; two or three rounds settle any real function.
const MAX_ROUNDS: usize = 8;

/// Run the pass to fixed point.
pub fn run(func: &mut Func, reg: &TypeRegistry) -> CodegenResult<()> {
    for _ in 0..MAX_ROUNDS {
        if !round(func, reg) {
            return Ok(());
        }
    }
    Err(CodegenError::InternalInvariant {
        phase: "decompose",
        func: func.name.clone(),
        message: "aggregate decomposition did not reach a fixed point".into(),
    })
}

fn is_wide(reg: &TypeRegistry, ty: types::Type) -> bool {
    ty == types::STR || matches!(reg.data(ty), TypeData::Slice { .. })
}

fn make_op(ty: types::Type) -> Op {
    if ty == types::STR {
        Op::StringMake
    } else {
        Op::SliceMake
    }
}

/// One rewrite sweep. Returns true if anything changed.
fn round(func: &mut Func, reg: &TypeRegistry) -> bool {
    let mut changed = false;
    let blocks: Vec<_> = func.blocks.keys().collect();
    for b in blocks {
        let vals: Vec<Value> = func.blocks[b].values.clone();
        for v in vals {
            // The value may have been detached by an earlier rewrite in
            // this sweep.
            if !func.blocks[b].values.contains(&v) {
                continue;
            }
            changed |= rewrite(func, reg, v);
        }
    }
    changed
}

fn rewrite(func: &mut Func, reg: &TypeRegistry, v: Value) -> bool {
    let op = func.values[v].op;
    let ty = func.values[v].ty;
    let block = func.values[v].block;
    let loc = func.values[v].loc;

    match op {
        // load<str>(a) => make(load<i64>(a), load<i64>(a + 8))
        Op::Load if is_wide(reg, ty) => {
            let addr = func.values[v].args[0];
            let lo = func.add_value(block, Op::Load, types::I64, &[addr], 0, loc);
            place_before(func, block, v, lo);
            let hia = func.add_value(block, Op::OffPtr, types::I64, &[addr], 8, loc);
            place_before(func, block, v, hia);
            let hi = func.add_value(block, Op::Load, types::I64, &[hia], 0, loc);
            place_before(func, block, v, hi);
            let m = func.add_value(block, make_op(ty), ty, &[lo, hi], 0, loc);
            place_before(func, block, v, m);
            func.replace_uses(v, m);
            func.detach(v);
            true
        }

        // store(a, make(p, l)) => store(a, p); store(a + 8, l)
        Op::Store => {
            let stored = func.values[v].args[1];
            let sty = func.values[stored].ty;
            if !is_wide(reg, sty) {
                return false;
            }
            if func.values[stored].op != make_op(sty) {
                // Not split yet; a later round will see the make.
                return false;
            }
            let addr = func.values[v].args[0];
            let p = func.values[stored].args[0];
            let l = func.values[stored].args[1];
            let s0 = func.add_value(block, Op::Store, types::MEM, &[addr, p], 0, loc);
            place_before(func, block, v, s0);
            let hia = func.add_value(block, Op::OffPtr, types::I64, &[addr], 8, loc);
            place_before(func, block, v, hia);
            let s1 = func.add_value(block, Op::Store, types::MEM, &[hia, l], 0, loc);
            place_before(func, block, v, s1);
            func.detach(v);
            if func.values[stored].uses == 0 {
                func.detach(stored);
            }
            true
        }

        // const_str(i) => make(const_str_ptr(i), const_int(len))
        Op::ConstStr => {
            let idx = func.values[v].aux;
            let len = func.strings[idx as usize].len() as i64;
            let p = func.add_value(block, Op::ConstStrPtr, types::I64, &[], idx, loc);
            place_before(func, block, v, p);
            let l = func.add_value(block, Op::ConstInt, types::I64, &[], len, loc);
            place_before(func, block, v, l);
            let m = func.add_value(block, Op::StringMake, types::STR, &[p, l], 0, loc);
            place_before(func, block, v, m);
            func.replace_uses(v, m);
            func.detach(v);
            true
        }

        // phi<str>(a, b) => make(phi(ptr parts), phi(len parts))
        Op::Phi if is_wide(reg, ty) => {
            let args: Vec<Value> = func.values[v].args.iter().copied().collect();
            if args
                .iter()
                .any(|&a| a != v && func.values[a].op != make_op(func.values[a].ty))
            {
                return false;
            }
            let pp = func.add_value(block, Op::Phi, types::I64, &[], 0, loc);
            place_before(func, block, v, pp);
            let lp = func.add_value(block, Op::Phi, types::I64, &[], 0, loc);
            place_before(func, block, v, lp);
            for &a in &args {
                // A self-referential edge turns into the matching component
                // phi referencing itself.
                if a == v {
                    func.add_arg(pp, pp);
                    func.add_arg(lp, lp);
                } else {
                    func.add_arg(pp, func.values[a].args[0]);
                    func.add_arg(lp, func.values[a].args[1]);
                }
            }
            // The make is not a phi, so it goes after the phi run; its exact
            // position does not matter to the scheduler.
            let m = func.add_value(block, make_op(ty), ty, &[pp, lp], 0, loc);
            func.replace_uses(v, m);
            func.detach(v);
            // Detaching the phi may have killed its make arguments.
            for a in args {
                if func.blocks[func.values[a].block].values.contains(&a) && func.values[a].uses == 0
                {
                    func.detach(a);
                }
            }
            true
        }

        // select<str>(c, make, make) => make(select(c, p, p), select(c, l, l))
        Op::Select if is_wide(reg, ty) => {
            let c = func.values[v].args[0];
            let t = func.values[v].args[1];
            let e = func.values[v].args[2];
            if func.values[t].op != make_op(ty) || func.values[e].op != make_op(ty) {
                return false;
            }
            let (tp, tl) = (func.values[t].args[0], func.values[t].args[1]);
            let (ep, el) = (func.values[e].args[0], func.values[e].args[1]);
            let sp = func.add_value(block, Op::Select, types::I64, &[c, tp, ep], 0, loc);
            place_before(func, block, v, sp);
            let sl = func.add_value(block, Op::Select, types::I64, &[c, tl, el], 0, loc);
            place_before(func, block, v, sl);
            let m = func.add_value(block, make_op(ty), ty, &[sp, sl], 0, loc);
            place_before(func, block, v, m);
            func.replace_uses(v, m);
            func.detach(v);
            true
        }

        // The projection peephole: ptr(make(p, l)) is p, len(make(p, l)) is l.
        Op::StringPtr | Op::SlicePtr => {
            let a = func.values[v].args[0];
            if func.values[a].op != make_op(func.values[a].ty) {
                return false;
            }
            let p = func.values[a].args[0];
            func.replace_uses(v, p);
            func.detach(v);
            if func.values[a].uses == 0 {
                func.detach(a);
            }
            true
        }
        Op::StringLen | Op::SliceLen => {
            let a = func.values[v].args[0];
            if func.values[a].op != make_op(func.values[a].ty) {
                return false;
            }
            let l = func.values[a].args[1];
            func.replace_uses(v, l);
            func.detach(v);
            if func.values[a].uses == 0 {
                func.detach(a);
            }
            true
        }

        // A copy of a make forwards to the make itself.
        Op::Copy if is_wide(reg, ty) => {
            let a = func.values[v].args[0];
            if func.values[a].op != make_op(ty) {
                return false;
            }
            func.replace_uses(v, a);
            func.detach(v);
            true
        }

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srcloc::SourceLoc;
    use crate::ssa::BlockKind;

    fn wide_free(func: &Func, reg: &TypeRegistry) -> bool {
        func.blocks.keys().all(|b| {
            func.blocks[b].values.iter().all(|&v| {
                let d = &func.values[v];
                !is_wide(reg, d.ty) || d.op == Op::StringMake || d.op == Op::SliceMake
            })
        })
    }

    #[test]
    fn load_and_store_split_into_halves() {
        let reg = TypeRegistry::new();
        let mut f = Func::new("t", types::VOID);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        f.slots.push(crate::ssa::LocalSlot { name: "a".into(), size: 16, offset: 0 });
        f.slots.push(crate::ssa::LocalSlot { name: "b".into(), size: 16, offset: 0 });
        let src = f.add_value(e, Op::LocalAddr, types::I64, &[], 0, SourceLoc::default());
        let dst = f.add_value(e, Op::LocalAddr, types::I64, &[], 1, SourceLoc::default());
        let ld = f.add_value(e, Op::Load, types::STR, &[src], 0, SourceLoc::default());
        let _st = f.add_value(e, Op::Store, types::MEM, &[dst, ld], 0, SourceLoc::default());
        run(&mut f, &reg).unwrap();
        assert!(wide_free(&f, &reg));
        let stores: Vec<Value> = f.blocks[e]
            .values
            .iter()
            .copied()
            .filter(|&v| f.values[v].op == Op::Store)
            .collect();
        assert_eq!(stores.len(), 2);
        let loads: Vec<Value> = f.blocks[e]
            .values
            .iter()
            .copied()
            .filter(|&v| f.values[v].op == Op::Load)
            .collect();
        assert_eq!(loads.len(), 2);
        assert!(loads.iter().all(|&v| f.values[v].ty == types::I64));
    }

    #[test]
    fn string_phi_splits_into_component_phis() {
        let reg = TypeRegistry::new();
        let mut f = Func::new("t", types::STR);
        let e = f.entry;
        let l = f.add_block(BlockKind::Plain);
        let r = f.add_block(BlockKind::Plain);
        let m = f.add_block(BlockKind::Ret);
        f.blocks[e].kind = BlockKind::If;
        f.add_edge(e, l);
        f.add_edge(e, r);
        f.add_edge(l, m);
        f.add_edge(r, m);
        let c = f.add_value(e, Op::ConstBool, types::BOOL, &[], 1, SourceLoc::default());
        f.set_ctrl(e, c);
        f.strings = vec!["one".into(), "three".into()];
        let s1 = f.add_value(l, Op::ConstStr, types::STR, &[], 0, SourceLoc::default());
        let s2 = f.add_value(r, Op::ConstStr, types::STR, &[], 1, SourceLoc::default());
        let phi = f.add_value(m, Op::Phi, types::STR, &[s1, s2], 0, SourceLoc::default());
        f.set_ctrl(m, phi);
        run(&mut f, &reg).unwrap();
        assert!(wide_free(&f, &reg));
        // Ret control is now a make of two i64 phis.
        let ret = f.blocks[m].ctrl[0];
        assert_eq!(f.values[ret].op, Op::StringMake);
        let pp = f.values[ret].args[0];
        let lp = f.values[ret].args[1];
        assert_eq!(f.values[pp].op, Op::Phi);
        assert_eq!(f.values[lp].op, Op::Phi);
        // The length phi joins the literal lengths 3 and 5.
        let lens: Vec<i64> = f.values[lp]
            .args
            .iter()
            .map(|&a| f.values[a].aux)
            .collect();
        assert_eq!(lens, vec![3, 5]);
    }

    #[test]
    fn idempotent() {
        let reg = TypeRegistry::new();
        let mut f = Func::new("t", types::VOID);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        f.strings = vec!["hello".into()];
        f.slots.push(crate::ssa::LocalSlot { name: "s".into(), size: 16, offset: 0 });
        let dst = f.add_value(e, Op::LocalAddr, types::I64, &[], 0, SourceLoc::default());
        let s = f.add_value(e, Op::ConstStr, types::STR, &[], 0, SourceLoc::default());
        let _ = f.add_value(e, Op::Store, types::MEM, &[dst, s], 0, SourceLoc::default());
        run(&mut f, &reg).unwrap();
        let order1: Vec<Vec<Value>> = f.blocks.keys().map(|b| f.blocks[b].values.clone()).collect();
        run(&mut f, &reg).unwrap();
        let order2: Vec<Vec<Value>> = f.blocks.keys().map(|b| f.blocks[b].values.clone()).collect();
        assert_eq!(order1, order2);
        assert!(wide_free(&f, &reg));
    }
}
