//! The SSA transformation passes.
//!
//! The order here is fixed: call expansion must run before aggregate
//! decomposition (it introduces the projections decomposition feeds on),
//! scheduling must see the final value set, and the strength-reduction
//! rewrites run last because they only mutate values in place.

pub mod decompose;
pub mod expand_calls;
pub mod lower;
pub mod schedule;

use crate::error::CodegenResult;
use crate::ssa::{Block, Func, Value};
use crate::types::TypeRegistry;

/// Run every pass over `func` in the required order.
pub fn run_all(func: &mut Func, reg: &TypeRegistry) -> CodegenResult<()> {
    expand_calls::run(func, reg)?;
    decompose::run(func, reg)?;
    schedule::run(func)?;
    lower::run(func);
    Ok(())
}

/// Move `v`, currently the last entry of `block`'s value list, to just
/// before `anchor`. Used by passes that synthesize replacement values and
/// need them to occupy the replaced value's program position, so the memory
/// ordering the scheduler derives from list order stays intact.
pub(crate) fn place_before(func: &mut Func, block: Block, anchor: Value, v: Value) {
    let values = &mut func.blocks[block].values;
    debug_assert_eq!(values.last(), Some(&v));
    values.pop();
    let at = values
        .iter()
        .position(|&x| x == anchor)
        .expect("anchor in block");
    values.insert(at, v);
}

/// Move `v`, currently the last entry of `block`'s value list, to just
/// after `anchor`.
pub(crate) fn place_after(func: &mut Func, block: Block, anchor: Value, v: Value) {
    let values = &mut func.blocks[block].values;
    debug_assert_eq!(values.last(), Some(&v));
    values.pop();
    let at = values
        .iter()
        .position(|&x| x == anchor)
        .expect("anchor in block");
    values.insert(at + 1, v);
}
