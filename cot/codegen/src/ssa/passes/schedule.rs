//! In-block scheduling.
//!
//! Assigns each block's final emission order with a priority-respecting
//! topological sort. Dependencies come from same-block argument edges and
//! from memory order: a store depends on the store before it, and a load
//! depends on the store before it. Ties within a priority class break by the
//! current list position, which keeps the pass deterministic and idempotent.

use crate::error::{CodegenError, CodegenResult};
use crate::ssa::{Block, Func, Op, Value};
use std::collections::BinaryHeap;

/// Priority classes; lower is scheduled earlier.
fn score(func: &Func, block: Block, v: Value) -> u8 {
    let data = &func.values[v];
    if func.blocks[block].ctrl.contains(&v) {
        return 5;
    }
    match data.op {
        Op::Phi => 0,
        Op::Arg | Op::RetPtr => 1,
        Op::SelectN => 2,
        op if op.is_store() => 3,
        _ => 4,
    }
}

/// Schedule every block of `func`.
pub fn run(func: &mut Func) -> CodegenResult<()> {
    let blocks: Vec<Block> = func.blocks.keys().collect();
    for b in blocks {
        schedule_block(func, b)?;
    }
    Ok(())
}

fn schedule_block(func: &mut Func, block: Block) -> CodegenResult<()> {
    let vals: Vec<Value> = func.blocks[block].values.clone();
    let n = vals.len();
    if n <= 1 {
        return Ok(());
    }
    let pos_of = |v: Value| vals.iter().position(|&x| x == v);

    // succs[i] lists the in-block indices that must come after i.
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indeg = vec![0usize; n];
    let edge = |from: usize, to: usize, indeg: &mut Vec<usize>, succs: &mut Vec<Vec<usize>>| {
        succs[from].push(to);
        indeg[to] += 1;
    };

    let mut last_store: Option<usize> = None;
    for (i, &v) in vals.iter().enumerate() {
        let data = &func.values[v];
        // Argument edges. Phis read their inputs on the incoming edges, so
        // they impose no in-block ordering.
        if data.op != Op::Phi {
            for &a in &data.args {
                if let Some(ai) = pos_of(a) {
                    if ai != i {
                        edge(ai, i, &mut indeg, &mut succs);
                    }
                }
            }
        }
        // Memory order.
        if data.op.is_store() {
            if let Some(p) = last_store {
                edge(p, i, &mut indeg, &mut succs);
            }
            last_store = Some(i);
        } else if data.op == Op::Load || data.op == Op::LoadReg {
            if let Some(p) = last_store {
                edge(p, i, &mut indeg, &mut succs);
            }
        }
    }

    // Ready heap keyed by (score, position); BinaryHeap is a max-heap, so
    // invert with Reverse.
    use std::cmp::Reverse;
    let mut heap: BinaryHeap<Reverse<(u8, usize)>> = BinaryHeap::new();
    for i in 0..n {
        if indeg[i] == 0 {
            heap.push(Reverse((score(func, block, vals[i]), i)));
        }
    }
    let mut out: Vec<Value> = Vec::with_capacity(n);
    while let Some(Reverse((_, i))) = heap.pop() {
        out.push(vals[i]);
        for &s in &succs[i] {
            indeg[s] -= 1;
            if indeg[s] == 0 {
                heap.push(Reverse((score(func, block, vals[s]), s)));
            }
        }
    }
    if out.len() != n {
        return Err(CodegenError::InternalInvariant {
            phase: "schedule",
            func: func.name.clone(),
            message: format!("dependency cycle among the values of {block}"),
        });
    }
    func.blocks[block].values = out;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srcloc::SourceLoc;
    use crate::ssa::BlockKind;
    use crate::types;

    #[test]
    fn stores_keep_their_order_and_loads_respect_stores() {
        let mut f = Func::new("t", types::I64);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        f.slots.push(crate::ssa::LocalSlot { name: "x".into(), size: 8, offset: 0 });
        let a = f.add_value(e, Op::LocalAddr, types::I64, &[], 0, SourceLoc::default());
        let c1 = f.add_value(e, Op::ConstInt, types::I64, &[], 1, SourceLoc::default());
        let s1 = f.add_value(e, Op::Store, types::MEM, &[a, c1], 0, SourceLoc::default());
        let c2 = f.add_value(e, Op::ConstInt, types::I64, &[], 2, SourceLoc::default());
        let s2 = f.add_value(e, Op::Store, types::MEM, &[a, c2], 0, SourceLoc::default());
        let ld = f.add_value(e, Op::Load, types::I64, &[a], 0, SourceLoc::default());
        f.set_ctrl(e, ld);
        run(&mut f).unwrap();
        let order = f.blocks[e].values.clone();
        let idx = |v: Value| order.iter().position(|&x| x == v).unwrap();
        assert!(idx(s1) < idx(s2), "store order preserved");
        assert!(idx(s2) < idx(ld), "load follows the last prior store");
    }

    #[test]
    fn phis_schedule_first_and_control_last() {
        let mut f = Func::new("t", types::I64);
        let e = f.entry;
        let m = f.add_block(BlockKind::Ret);
        f.add_edge(e, m);
        let c0 = f.add_value(e, Op::ConstInt, types::I64, &[], 7, SourceLoc::default());
        let add = f.add_value(m, Op::Add, types::I64, &[c0, c0], 0, SourceLoc::default());
        let phi = f.add_value(m, Op::Phi, types::I64, &[c0], 0, SourceLoc::default());
        f.set_ctrl(m, add);
        run(&mut f).unwrap();
        let order = f.blocks[m].values.clone();
        assert_eq!(order.first(), Some(&phi));
        assert_eq!(order.last(), Some(&add));
    }

    #[test]
    fn idempotent() {
        let mut f = Func::new("t", types::I64);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        f.slots.push(crate::ssa::LocalSlot { name: "x".into(), size: 8, offset: 0 });
        let a = f.add_value(e, Op::LocalAddr, types::I64, &[], 0, SourceLoc::default());
        let c1 = f.add_value(e, Op::ConstInt, types::I64, &[], 1, SourceLoc::default());
        let _s1 = f.add_value(e, Op::Store, types::MEM, &[a, c1], 0, SourceLoc::default());
        let ld = f.add_value(e, Op::Load, types::I64, &[a], 0, SourceLoc::default());
        let c2 = f.add_value(e, Op::ConstInt, types::I64, &[], 3, SourceLoc::default());
        let add = f.add_value(e, Op::Add, types::I64, &[ld, c2], 0, SourceLoc::default());
        f.set_ctrl(e, add);
        run(&mut f).unwrap();
        let order1 = f.blocks[e].values.clone();
        run(&mut f).unwrap();
        let order2 = f.blocks[e].values.clone();
        assert_eq!(order1, order2);
    }
}
