//! Parallel copy resolution.
//!
//! Phi moves on a control-flow edge and argument shuffling before a call are
//! the same problem: a set of simultaneous location-to-location moves that
//! must be serialized without clobbering a source before it is read. The
//! resolver emits non-conflicting moves first and breaks cycles by parking
//! one destination in a scratch location.

use crate::isa::Reg;
use crate::ssa::Value;

/// A source or destination of a parallel move.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Loc {
    /// A physical register.
    Reg(Reg),
    /// A frame-pointer-relative stack slot.
    Stack(i32),
}

/// A move source: a location, or a value the emitter can rematerialize.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Src {
    /// Read from a location.
    Loc(Loc),
    /// Materialize the given value from scratch.
    Remat(Value),
}

/// One serialized step. `dst` may be the scratch location introduced to
/// break a cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MoveStep {
    /// Where the data comes from.
    pub src: Src,
    /// Where it goes.
    pub dst: Loc,
}

/// Serialize `moves` so every source is read before any step overwrites it.
///
/// `scratch` is a register reserved for the resolver; it must not appear as
/// a source or destination of any requested move.
pub fn resolve(mut moves: Vec<(Src, Loc)>, scratch: Reg) -> Vec<MoveStep> {
    let scratch_loc = Loc::Reg(scratch);
    debug_assert!(
        moves
            .iter()
            .all(|&(s, d)| s != Src::Loc(scratch_loc) && d != scratch_loc),
        "scratch register participates in a requested move"
    );
    // Self-moves are complete before they start.
    moves.retain(|&(s, d)| s != Src::Loc(d));

    let mut out = Vec::with_capacity(moves.len());
    while !moves.is_empty() {
        // A destination nobody still reads can be written now.
        let ready = moves
            .iter()
            .position(|&(_, d)| !moves.iter().any(|&(s, _)| s == Src::Loc(d)));
        match ready {
            Some(i) => {
                let (s, d) = moves.remove(i);
                out.push(MoveStep { src: s, dst: d });
            }
            None => {
                // Every pending destination is also a pending source: a
                // cycle. Park the first destination in the scratch register
                // and retarget its readers.
                let parked = moves[0].1;
                out.push(MoveStep {
                    src: Src::Loc(parked),
                    dst: scratch_loc,
                });
                for m in moves.iter_mut() {
                    if m.0 == Src::Loc(parked) {
                        m.0 = Src::Loc(scratch_loc);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(n: u8) -> Loc {
        Loc::Reg(Reg(n))
    }

    #[test]
    fn independent_moves_pass_through() {
        let steps = resolve(vec![(Src::Loc(r(1)), r(2)), (Src::Loc(r(3)), r(4))], Reg(16));
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn chain_is_ordered_leaf_first() {
        // 1 -> 2 -> 3: the 2 -> 3 move must run before 1 -> 2.
        let steps = resolve(vec![(Src::Loc(r(1)), r(2)), (Src::Loc(r(2)), r(3))], Reg(16));
        assert_eq!(
            steps,
            vec![
                MoveStep { src: Src::Loc(r(2)), dst: r(3) },
                MoveStep { src: Src::Loc(r(1)), dst: r(2) },
            ]
        );
    }

    #[test]
    fn swap_uses_the_scratch() {
        let steps = resolve(vec![(Src::Loc(r(1)), r(2)), (Src::Loc(r(2)), r(1))], Reg(16));
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].dst, Loc::Reg(Reg(16)));
        // The parked value ends up read back out of the scratch.
        assert!(steps.iter().any(|s| s.src == Src::Loc(Loc::Reg(Reg(16)))));
    }

    #[test]
    fn stack_swap_resolves() {
        let a = Loc::Stack(-8);
        let b = Loc::Stack(-16);
        let steps = resolve(vec![(Src::Loc(a), b), (Src::Loc(b), a)], Reg(16));
        assert_eq!(steps.len(), 3);
    }

    #[test]
    fn self_move_is_dropped() {
        let steps = resolve(vec![(Src::Loc(r(5)), r(5))], Reg(16));
        assert!(steps.is_empty());
    }
}
