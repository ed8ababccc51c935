//! SSA invariant checking.
//!
//! The verifier runs after construction and again after the transformation
//! passes. Any failure here is a compiler bug, reported as an internal
//! invariant violation naming the offending function.

use crate::entity::EntityRef;
use crate::error::{CodegenError, CodegenResult};
use crate::ssa::{Block, BlockKind, Func, Op, Value};
use crate::types;

/// Immediate-dominator table, computed over reachable blocks only.
pub struct DomTree {
    /// `idom[b]` is the immediate dominator of `b`; the entry maps to
    /// itself. Unreachable blocks map to `None`.
    idom: Vec<Option<Block>>,
    /// Reverse postorder number per block, for the intersect walk.
    rpo_num: Vec<u32>,
    /// The reverse postorder itself.
    pub rpo: Vec<Block>,
}

impl DomTree {
    /// Compute immediate dominators with the iterative two-finger method
    /// over reverse postorder.
    pub fn compute(func: &Func) -> Self {
        let n = func.blocks.len();
        let rpo = func.rpo();
        let mut rpo_num = vec![u32::MAX; n];
        for (i, &b) in rpo.iter().enumerate() {
            rpo_num[b.index()] = i as u32;
        }
        let mut idom: Vec<Option<Block>> = vec![None; n];
        idom[func.entry.index()] = Some(func.entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for &p in &func.blocks[b].preds {
                    if idom[p.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &rpo_num, p, cur),
                    });
                }
                if new_idom.is_some() && idom[b.index()] != new_idom {
                    idom[b.index()] = new_idom;
                    changed = true;
                }
            }
        }
        Self { idom, rpo_num, rpo }
    }

    /// Does `a` dominate `b`? Reflexive. False if either is unreachable.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if self.rpo_num[a.index()] == u32::MAX || self.rpo_num[b.index()] == u32::MAX {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            let up = match self.idom[cur.index()] {
                Some(up) => up,
                None => return false,
            };
            if up == cur {
                return false;
            }
            cur = up;
        }
    }

    /// Is `b` reachable from the entry?
    pub fn is_reachable(&self, b: Block) -> bool {
        self.rpo_num[b.index()] != u32::MAX
    }
}

fn intersect(idom: &[Option<Block>], rpo_num: &[u32], mut a: Block, mut b: Block) -> Block {
    while a != b {
        while rpo_num[a.index()] > rpo_num[b.index()] {
            a = idom[a.index()].expect("processed block");
        }
        while rpo_num[b.index()] > rpo_num[a.index()] {
            b = idom[b.index()].expect("processed block");
        }
    }
    a
}

/// Check every SSA invariant on `func`.
pub fn verify(func: &Func) -> CodegenResult<()> {
    let dom = DomTree::compute(func);
    verify_with(func, &dom)
}

/// Check invariants with a precomputed dominator tree.
pub fn verify_with(func: &Func, dom: &DomTree) -> CodegenResult<()> {
    let fail = |message: String| -> CodegenError {
        CodegenError::InternalInvariant {
            phase: "ssa-verify",
            func: func.name.clone(),
            message,
        }
    };

    // Edges must be reciprocal and within the kind's arity.
    for b in func.blocks.keys() {
        let data = &func.blocks[b];
        for &s in &data.succs {
            let n = func.blocks[s].preds.iter().filter(|&&p| p == b).count();
            let m = data.succs.iter().filter(|&&x| x == s).count();
            if n != m {
                return Err(fail(format!("edge {b} -> {s} is not reciprocal")));
            }
        }
        match data.kind {
            BlockKind::Entry | BlockKind::Plain => {
                if dom.is_reachable(b) && data.succs.len() != 1 {
                    return Err(fail(format!(
                        "{b} is plain but has {} successors",
                        data.succs.len()
                    )));
                }
                if !data.ctrl.is_empty() {
                    return Err(fail(format!("{b} is plain but carries a control value")));
                }
            }
            BlockKind::If => {
                if data.succs.len() != 2 {
                    return Err(fail(format!(
                        "{b} is a branch but has {} successors",
                        data.succs.len()
                    )));
                }
                if data.ctrl.len() != 1 {
                    return Err(fail(format!("{b} is a branch without a condition")));
                }
                let c = data.ctrl[0];
                if func.values[c].ty != types::BOOL {
                    return Err(fail(format!("{b} branches on non-boolean {c}")));
                }
            }
            BlockKind::Ret => {
                if !data.succs.is_empty() {
                    return Err(fail(format!("{b} returns but has successors")));
                }
                if data.ctrl.len() > 1 {
                    return Err(fail(format!("{b} returns more than one value")));
                }
            }
        }
    }

    // Values: definitions dominate uses; phis lead their block; no
    // unresolved placeholders.
    for b in func.blocks.keys() {
        if !dom.is_reachable(b) {
            continue;
        }
        let mut seen_nonphi = false;
        for &v in &func.blocks[b].values {
            let data = &func.values[v];
            if data.block != b {
                return Err(fail(format!("{v} listed in {b} but owned by {}", data.block)));
            }
            match data.op {
                Op::FwdRef => {
                    return Err(fail(format!("{v} is an unresolved forward reference")));
                }
                Op::Phi => {
                    if seen_nonphi {
                        return Err(fail(format!("phi {v} appears after non-phi values")));
                    }
                    let preds = &func.blocks[b].preds;
                    if data.args.len() != preds.len() {
                        return Err(fail(format!(
                            "phi {v} has {} arguments for {} predecessors",
                            data.args.len(),
                            preds.len()
                        )));
                    }
                    for (i, &a) in data.args.iter().enumerate() {
                        let ab = func.values[a].block;
                        if !dom.dominates(ab, preds[i]) {
                            return Err(fail(format!(
                                "phi {v} argument {a} does not reach predecessor {}",
                                preds[i]
                            )));
                        }
                    }
                }
                _ => {
                    seen_nonphi = true;
                    for &a in &data.args {
                        let ab = func.values[a].block;
                        if !dom.dominates(ab, b) {
                            return Err(fail(format!(
                                "{v} uses {a} defined in {ab}, which does not dominate {b}"
                            )));
                        }
                    }
                }
            }
        }
        for &c in &func.blocks[b].ctrl {
            let cb = func.values[c].block;
            if !dom.dominates(cb, b) {
                return Err(fail(format!(
                    "control value {c} of {b} is defined in {cb}, which does not dominate it"
                )));
            }
        }
    }

    // Use counts must be exact.
    let mut counted = vec![0u32; func.values.len()];
    for b in func.blocks.keys() {
        for &v in &func.blocks[b].values {
            for &a in &func.values[v].args {
                counted[a.index()] += 1;
            }
        }
        for &c in &func.blocks[b].ctrl {
            counted[c.index()] += 1;
        }
    }
    for v in func.values.keys() {
        // Detached values keep their arena entry; only attached ones count.
        if !func.blocks[func.values[v].block]
            .values
            .contains(&v)
        {
            continue;
        }
        if func.values[v].uses != counted[v.index()] {
            return Err(fail(format!(
                "{v} records {} uses but {} were found",
                func.values[v].uses,
                counted[v.index()]
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srcloc::SourceLoc;
    use crate::types;

    #[test]
    fn straight_line_verifies() {
        let mut f = Func::new("ok", types::I64);
        let e = f.entry;
        let exit = f.add_block(BlockKind::Ret);
        f.add_edge(e, exit);
        let a = f.add_value(e, Op::ConstInt, types::I64, &[], 40, SourceLoc::default());
        let b = f.add_value(e, Op::ConstInt, types::I64, &[], 2, SourceLoc::default());
        let s = f.add_value(exit, Op::Add, types::I64, &[a, b], 0, SourceLoc::default());
        f.set_ctrl(exit, s);
        verify(&f).unwrap();
    }

    #[test]
    fn use_in_non_dominating_block_fails() {
        let mut f = Func::new("bad", types::I64);
        let e = f.entry;
        let left = f.add_block(BlockKind::Plain);
        let right = f.add_block(BlockKind::Plain);
        let merge = f.add_block(BlockKind::Ret);
        f.blocks[e].kind = BlockKind::If;
        f.add_edge(e, left);
        f.add_edge(e, right);
        f.add_edge(left, merge);
        f.add_edge(right, merge);
        let c = f.add_value(e, Op::ConstBool, types::BOOL, &[], 1, SourceLoc::default());
        f.set_ctrl(e, c);
        // Defined only on the left path, used in the merge: not dominating.
        let x = f.add_value(left, Op::ConstInt, types::I64, &[], 5, SourceLoc::default());
        let y = f.add_value(merge, Op::Copy, types::I64, &[x], 0, SourceLoc::default());
        f.set_ctrl(merge, y);
        assert!(verify(&f).is_err());
    }

    #[test]
    fn phi_arity_mismatch_fails() {
        let mut f = Func::new("bad", types::I64);
        let e = f.entry;
        let m = f.add_block(BlockKind::Ret);
        f.add_edge(e, m);
        let a = f.add_value(e, Op::ConstInt, types::I64, &[], 1, SourceLoc::default());
        let b = f.add_value(e, Op::ConstInt, types::I64, &[], 2, SourceLoc::default());
        // Two args, one predecessor.
        let p = f.add_value(m, Op::Phi, types::I64, &[a, b], 0, SourceLoc::default());
        f.set_ctrl(m, p);
        assert!(verify(&f).is_err());
    }
}
