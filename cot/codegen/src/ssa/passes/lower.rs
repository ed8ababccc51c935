//! Late strength reduction and constant-materialization planning.
//!
//! Runs after scheduling, so it only rewrites values in place and never
//! creates or moves them. Multiplications by powers of two become shifts,
//! identity arithmetic becomes copies, and integer constants are classified
//! by the cheapest AArch64 move-wide sequence that can build them.

use crate::ssa::{Func, Op, Value};

/// Run the rewrites over every value of `func`.
pub fn run(func: &mut Func) {
    let vals: Vec<Value> = func.values.keys().collect();
    for v in vals {
        rewrite(func, v);
    }
    sweep_dead_constants(func);
}

fn const_of(func: &Func, v: Value) -> Option<i64> {
    match func.values[v].op {
        Op::ConstInt | Op::ConstBool => Some(func.values[v].aux),
        _ => None,
    }
}

fn rewrite(func: &mut Func, v: Value) {
    match func.values[v].op {
        Op::Mul => {
            let (a, b) = (func.values[v].args[0], func.values[v].args[1]);
            // x * 1 is x; x * 2^k is a left shift.
            for (x, c) in [(a, b), (b, a)] {
                let Some(k) = const_of(func, c) else { continue };
                if k == 1 {
                    func.values[v].op = Op::Copy;
                    func.set_args(v, &[x]);
                    return;
                }
                if k > 0 && (k as u64).is_power_of_two() {
                    func.values[v].op = Op::Shl;
                    func.values[v].aux = (k as u64).trailing_zeros() as i64;
                    func.set_args(v, &[x]);
                    return;
                }
            }
        }
        Op::Add => {
            let (a, b) = (func.values[v].args[0], func.values[v].args[1]);
            for (x, c) in [(a, b), (b, a)] {
                if const_of(func, c) == Some(0) {
                    func.values[v].op = Op::Copy;
                    func.set_args(v, &[x]);
                    return;
                }
            }
        }
        Op::Shl => {
            // A two-argument shift by a constant folds the amount into aux;
            // a shift by zero is a copy.
            if func.values[v].args.len() == 2 {
                let amt = func.values[v].args[1];
                if let Some(k) = const_of(func, amt) {
                    let x = func.values[v].args[0];
                    if k == 0 {
                        func.values[v].op = Op::Copy;
                        func.set_args(v, &[x]);
                    } else {
                        func.values[v].aux = k & 63;
                        func.set_args(v, &[x]);
                    }
                }
            } else if func.values[v].args.len() == 1 && func.values[v].aux == 0 {
                func.values[v].op = Op::Copy;
            }
        }
        _ => {}
    }
}

/// Constants whose last use disappeared in a rewrite have nothing left to
/// feed; drop them from their blocks.
fn sweep_dead_constants(func: &mut Func) {
    let vals: Vec<Value> = func.values.keys().collect();
    for v in vals {
        let d = &func.values[v];
        if d.uses == 0
            && matches!(d.op, Op::ConstInt | Op::ConstBool)
            && func.blocks[d.block].values.contains(&v)
        {
            func.detach(v);
        }
    }
}

/// How an AArch64 integer constant is best materialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstPlan {
    /// A single `movz` (one non-zero half-word).
    Movz {
        /// The half-word value.
        imm16: u16,
        /// Half-word position, 0..=3.
        shift: u8,
    },
    /// A single `movn` (one non-ones half-word in an all-ones pattern).
    Movn {
        /// The complemented half-word value.
        imm16: u16,
        /// Half-word position, 0..=3.
        shift: u8,
    },
    /// `movz` then a `movk` per remaining non-zero half-word.
    Chain,
}

/// Pick the cheapest move-wide plan for `imm`.
pub fn plan_const(imm: u64) -> ConstPlan {
    let halves: [u16; 4] = [
        imm as u16,
        (imm >> 16) as u16,
        (imm >> 32) as u16,
        (imm >> 48) as u16,
    ];
    let nonzero = halves.iter().filter(|&&h| h != 0).count();
    if nonzero <= 1 {
        let shift = halves.iter().position(|&h| h != 0).unwrap_or(0) as u8;
        return ConstPlan::Movz {
            imm16: halves[shift as usize],
            shift,
        };
    }
    let nonones = halves.iter().filter(|&&h| h != 0xffff).count();
    if nonones <= 1 {
        let shift = halves.iter().position(|&h| h != 0xffff).unwrap_or(0) as u8;
        return ConstPlan::Movn {
            imm16: !halves[shift as usize],
            shift,
        };
    }
    ConstPlan::Chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srcloc::SourceLoc;
    use crate::ssa::BlockKind;
    use crate::types;

    #[test]
    fn mul_by_power_of_two_becomes_shift() {
        let mut f = Func::new("t", types::I64);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        let x = f.add_value(e, Op::Arg, types::I64, &[], 0, SourceLoc::default());
        let c = f.add_value(e, Op::ConstInt, types::I64, &[], 8, SourceLoc::default());
        let m = f.add_value(e, Op::Mul, types::I64, &[x, c], 0, SourceLoc::default());
        f.set_ctrl(e, m);
        run(&mut f);
        assert_eq!(f.values[m].op, Op::Shl);
        assert_eq!(f.values[m].aux, 3);
        assert_eq!(f.values[m].args.as_slice(), &[x]);
        // The 8 is dead and swept.
        assert!(!f.blocks[e].values.contains(&c));
    }

    #[test]
    fn identities_become_copies() {
        let mut f = Func::new("t", types::I64);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        let x = f.add_value(e, Op::Arg, types::I64, &[], 0, SourceLoc::default());
        let zero = f.add_value(e, Op::ConstInt, types::I64, &[], 0, SourceLoc::default());
        let one = f.add_value(e, Op::ConstInt, types::I64, &[], 1, SourceLoc::default());
        let a = f.add_value(e, Op::Add, types::I64, &[x, zero], 0, SourceLoc::default());
        let m = f.add_value(e, Op::Mul, types::I64, &[a, one], 0, SourceLoc::default());
        f.set_ctrl(e, m);
        run(&mut f);
        assert_eq!(f.values[a].op, Op::Copy);
        assert_eq!(f.values[m].op, Op::Copy);
    }

    #[test]
    fn const_plans() {
        assert_eq!(plan_const(42), ConstPlan::Movz { imm16: 42, shift: 0 });
        assert_eq!(
            plan_const(0x7000_0000_0000_0000),
            ConstPlan::Movz { imm16: 0x7000, shift: 3 }
        );
        assert_eq!(plan_const(u64::MAX), ConstPlan::Movn { imm16: 0, shift: 0 });
        assert_eq!(
            plan_const(-2i64 as u64),
            ConstPlan::Movn { imm16: 1, shift: 0 }
        );
        assert_eq!(plan_const(0x1234_5678), ConstPlan::Chain);
    }
}
