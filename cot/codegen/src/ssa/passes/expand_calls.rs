//! Call expansion.
//!
//! Rewrites every call site and call result so that afterwards no SSA value
//! wider than 32 bytes flows through a call boundary except as an explicit
//! `Move`:
//!
//! - arguments of by-reference aggregate type are replaced by the address
//!   they were loaded from;
//! - two-register aggregate arguments are split into their eight-byte
//!   halves;
//! - string and slice arguments become (ptr, len) pairs;
//! - calls returning a two-register aggregate have their users rerouted
//!   through `SelectN` projections reassembled with the matching `*Make`;
//! - stores of a by-reference aggregate result become the callee's hidden
//!   return pointer, carried as a trailing call argument.

use crate::error::CodegenResult;
use crate::ssa::passes::{place_after, place_before};
use crate::ssa::{Func, Op, Value};
use crate::types::{self, TypeData, TypeRegistry};
use smallvec::SmallVec;

/// Marker stored in a call's `aux` when its trailing argument is the hidden
/// return pointer rather than a normal operand.
pub const CALL_RET_PTR: i64 = 1;

/// Run the pass.
pub fn run(func: &mut Func, reg: &TypeRegistry) -> CodegenResult<()> {
    let calls: Vec<Value> = func
        .values
        .keys()
        .filter(|&v| func.values[v].op.is_call())
        .collect();

    for call in &calls {
        expand_args(func, reg, *call);
    }
    for call in &calls {
        expand_result(func, reg, *call);
    }
    Ok(())
}

fn is_slice(reg: &TypeRegistry, ty: types::Type) -> bool {
    matches!(reg.data(ty), TypeData::Slice { .. })
}

fn is_two_reg_aggregate(reg: &TypeRegistry, ty: types::Type) -> bool {
    reg.is_two_reg_aggregate(ty)
}

fn expand_args(func: &mut Func, reg: &TypeRegistry, call: Value) {
    let block = func.values[call].block;
    let loc = func.values[call].loc;
    // For indirect calls the callee pointer stays in front.
    let fixed = if func.values[call].op == Op::CallIndirect {
        1
    } else {
        0
    };
    let old_args: SmallVec<[Value; 4]> = func.values[call].args.clone();
    let mut new_args: SmallVec<[Value; 4]> = SmallVec::new();
    new_args.extend_from_slice(&old_args[..fixed]);

    for &a in &old_args[fixed..] {
        let ty = func.values[a].ty;
        if reg.is_by_ref_aggregate(ty) {
            // Pass the source address. The argument is a load of the source
            // aggregate; dropping the call's use usually kills the load.
            debug_assert_eq!(func.values[a].op, Op::Load);
            let addr = func.values[a].args[0];
            new_args.push(addr);
        } else if ty == types::STR || is_slice(reg, ty) {
            let (pop, lop) = if ty == types::STR {
                (Op::StringPtr, Op::StringLen)
            } else {
                (Op::SlicePtr, Op::SliceLen)
            };
            let p = func.add_value(block, pop, types::I64, &[a], 0, loc);
            place_before(func, block, call, p);
            let l = func.add_value(block, lop, types::I64, &[a], 0, loc);
            place_before(func, block, call, l);
            new_args.push(p);
            new_args.push(l);
        } else if is_two_reg_aggregate(reg, ty) {
            debug_assert_eq!(func.values[a].op, Op::Load);
            let addr = func.values[a].args[0];
            let lo = func.add_value(block, Op::Load, types::I64, &[addr], 0, loc);
            place_before(func, block, call, lo);
            let hi_addr = func.add_value(block, Op::OffPtr, types::I64, &[addr], 8, loc);
            place_before(func, block, call, hi_addr);
            let hi = func.add_value(block, Op::Load, types::I64, &[hi_addr], 0, loc);
            place_before(func, block, call, hi);
            new_args.push(lo);
            new_args.push(hi);
        } else {
            new_args.push(a);
        }
    }
    func.set_args(call, &new_args);

    // Arguments that were only feeding this call may now be dead.
    for &a in &old_args[fixed..] {
        if func.values[a].uses == 0 {
            func.detach(a);
        }
    }
}

fn expand_result(func: &mut Func, reg: &TypeRegistry, call: Value) {
    let ty = func.values[call].ty;
    let block = func.values[call].block;
    let loc = func.values[call].loc;

    if ty == types::STR || is_slice(reg, ty) {
        // Capture both return registers, then reassemble.
        let users = collect_users(func, call);
        let s0 = func.add_value(block, Op::SelectN, types::I64, &[call], 0, loc);
        place_after(func, block, call, s0);
        let s1 = func.add_value(block, Op::SelectN, types::I64, &[call], 1, loc);
        place_after(func, block, s0, s1);
        let mk = if ty == types::STR {
            Op::StringMake
        } else {
            Op::SliceMake
        };
        let m = func.add_value(block, mk, ty, &[s0, s1], 0, loc);
        place_after(func, block, s1, m);
        reroute_users(func, call, m, &users);
        func.values[call].ty = types::RESULTS;
    } else if is_two_reg_aggregate(reg, ty) {
        // The pair comes back in the two return registers; the receiving
        // store becomes two eight-byte stores of the projections.
        let users = collect_users(func, call);
        let s0 = func.add_value(block, Op::SelectN, types::I64, &[call], 0, loc);
        place_after(func, block, call, s0);
        let s1 = func.add_value(block, Op::SelectN, types::I64, &[call], 1, loc);
        place_after(func, block, s0, s1);
        for (user, _) in users {
            if func.values[user].op == Op::Store && func.values[user].args[1] == call {
                let dst = func.values[user].args[0];
                let lo = func.add_value(block, Op::Store, types::MEM, &[dst, s0], 0, loc);
                place_before(func, block, user, lo);
                let hia = func.add_value(block, Op::OffPtr, types::I64, &[dst], 8, loc);
                place_before(func, block, user, hia);
                let hi = func.add_value(block, Op::Store, types::MEM, &[hia, s1], 0, loc);
                place_before(func, block, user, hi);
                func.detach(user);
            }
        }
        func.values[call].ty = types::RESULTS;
    } else if reg.is_by_ref_aggregate(ty) {
        // The caller provides the destination buffer: find the store that
        // receives the result and turn its address into the hidden return
        // pointer argument.
        let users = collect_users(func, call);
        for (user, _) in users {
            if func.values[user].op == Op::Store && func.values[user].args[1] == call {
                let dst = func.values[user].args[0];
                func.detach(user);
                func.add_arg(call, dst);
                func.values[call].aux = CALL_RET_PTR;
                func.values[call].ty = types::VOID;
                break;
            }
        }
    }
}

/// All (value, ctrl-slot) users of `v`: values whose args mention it and
/// blocks whose control slots do.
fn collect_users(func: &Func, v: Value) -> Vec<(Value, bool)> {
    let mut out = Vec::new();
    for u in func.values.keys() {
        if func.values[u].args.contains(&v) {
            out.push((u, false));
        }
    }
    out
}

fn reroute_users(func: &mut Func, old: Value, new: Value, users: &[(Value, bool)]) {
    for &(u, _) in users {
        let n = func.values[u].args.iter().filter(|&&a| a == old).count();
        if n == 0 {
            continue;
        }
        for a in func.values[u].args.iter_mut() {
            if *a == old {
                *a = new;
            }
        }
        func.values[old].uses -= n as u32;
        func.values[new].uses += n as u32;
    }
    // Control slots can also hold the call result (returning a call's value
    // directly).
    let blocks: Vec<_> = func.blocks.keys().collect();
    for b in blocks {
        let n = func.blocks[b].ctrl.iter().filter(|&&c| c == old).count();
        if n == 0 {
            continue;
        }
        for c in func.blocks[b].ctrl.iter_mut() {
            if *c == old {
                *c = new;
            }
        }
        func.values[old].uses -= n as u32;
        func.values[new].uses += n as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srcloc::SourceLoc;
    use crate::ssa::BlockKind;
    use crate::types::TypeRegistry;

    #[test]
    fn string_arg_becomes_ptr_len_pair() {
        let reg = TypeRegistry::new();
        let mut f = Func::new("t", types::I64);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        let s = f.add_value(e, Op::ConstStr, types::STR, &[], 0, SourceLoc::default());
        let c = f.add_value_sym(e, Op::Call, types::I64, &[s], 0, "puts", SourceLoc::default());
        f.set_ctrl(e, c);
        run(&mut f, &reg).unwrap();
        let args = f.values[c].args.clone();
        assert_eq!(args.len(), 2);
        assert_eq!(f.values[args[0]].op, Op::StringPtr);
        assert_eq!(f.values[args[1]].op, Op::StringLen);
        // The pair is placed ahead of the call.
        let vals = &f.blocks[e].values;
        let ci = vals.iter().position(|&v| v == c).unwrap();
        let pi = vals.iter().position(|&v| v == args[0]).unwrap();
        let li = vals.iter().position(|&v| v == args[1]).unwrap();
        assert!(pi < ci && li < ci);
    }

    #[test]
    fn string_result_is_projected_and_reassembled() {
        let reg = TypeRegistry::new();
        let mut f = Func::new("t", types::VOID);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        let c = f.add_value_sym(e, Op::Call, types::STR, &[], 0, "mk", SourceLoc::default());
        let l = f.add_value(e, Op::StringLen, types::I64, &[c], 0, SourceLoc::default());
        run(&mut f, &reg).unwrap();
        // The user now feeds off a StringMake of two SelectN projections.
        let m = f.values[l].args[0];
        assert_eq!(f.values[m].op, Op::StringMake);
        let s0 = f.values[m].args[0];
        let s1 = f.values[m].args[1];
        assert_eq!(f.values[s0].op, Op::SelectN);
        assert_eq!(f.values[s1].op, Op::SelectN);
        assert_eq!(f.values[s0].aux, 0);
        assert_eq!(f.values[s1].aux, 1);
        assert_eq!(f.values[c].ty, types::RESULTS);
        // Projections immediately follow the call.
        let vals = &f.blocks[e].values;
        let ci = vals.iter().position(|&v| v == c).unwrap();
        assert_eq!(vals[ci + 1], s0);
        assert_eq!(vals[ci + 2], s1);
    }

    #[test]
    fn big_struct_arg_passes_source_address() {
        let mut reg = TypeRegistry::new();
        let big = reg.declare_struct(
            "Big",
            vec![
                ("a".to_string(), types::I64),
                ("b".to_string(), types::I64),
                ("c".to_string(), types::I64),
            ],
        );
        let mut f = Func::new("t", types::VOID);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        f.slots.push(crate::ssa::LocalSlot {
            name: "x".into(),
            size: 24,
            offset: 0,
        });
        let addr = f.add_value(e, Op::LocalAddr, types::I64, &[], 0, SourceLoc::default());
        let ld = f.add_value(e, Op::Load, big, &[addr], 0, SourceLoc::default());
        let c = f.add_value_sym(e, Op::Call, types::VOID, &[ld], 0, "sink", SourceLoc::default());
        run(&mut f, &reg).unwrap();
        assert_eq!(f.values[c].args.as_slice(), &[addr]);
        // The wide load is gone from the block.
        assert!(!f.blocks[e].values.contains(&ld));
    }

    #[test]
    fn big_struct_result_uses_hidden_pointer() {
        let mut reg = TypeRegistry::new();
        let big = reg.declare_struct(
            "Big",
            vec![
                ("a".to_string(), types::I64),
                ("b".to_string(), types::I64),
                ("c".to_string(), types::I64),
            ],
        );
        let mut f = Func::new("t", types::VOID);
        let e = f.entry;
        f.blocks[e].kind = BlockKind::Ret;
        f.slots.push(crate::ssa::LocalSlot {
            name: "x".into(),
            size: 24,
            offset: 0,
        });
        let addr = f.add_value(e, Op::LocalAddr, types::I64, &[], 0, SourceLoc::default());
        let c = f.add_value_sym(e, Op::Call, big, &[], 0, "mk", SourceLoc::default());
        let st = f.add_value(e, Op::Store, types::MEM, &[addr, c], 0, SourceLoc::default());
        run(&mut f, &reg).unwrap();
        assert_eq!(f.values[c].aux, CALL_RET_PTR);
        assert_eq!(f.values[c].args.as_slice(), &[addr]);
        assert_eq!(f.values[c].ty, types::VOID);
        assert!(!f.blocks[e].values.contains(&st));
    }
}
