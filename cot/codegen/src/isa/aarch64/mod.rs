//! AArch64 ISA definitions: registers and ABI tables.

pub mod emit;

use crate::isa::Reg;

/// First integer argument / return register.
pub const X0: Reg = Reg(0);
/// Second argument / second return register.
pub const X1: Reg = Reg(1);
/// Indirect (hidden) return pointer register.
pub const X8: Reg = Reg(8);
/// First reserved scratch (IP0). Used for parallel-copy cycle breaking and
/// operand materialization; never allocated.
pub const X16: Reg = Reg(16);
/// Second reserved scratch (IP1).
pub const X17: Reg = Reg(17);
/// Frame pointer.
pub const FP: Reg = Reg(29);
/// Link register.
pub const LR: Reg = Reg(30);
/// Zero register / stack pointer, depending on context.
pub const ZR: Reg = Reg(31);

/// Integer argument registers, in ABI order.
pub static ARG_REGS: &[Reg] = &[
    Reg(0),
    Reg(1),
    Reg(2),
    Reg(3),
    Reg(4),
    Reg(5),
    Reg(6),
    Reg(7),
];

/// The allocatable pool: the caller-saved integer registers, excluding the
/// two reserved scratches. Callee-saved registers are deliberately left out
/// so prologues never need to save them.
pub static ALLOCATABLE: &[Reg] = &[
    Reg(0),
    Reg(1),
    Reg(2),
    Reg(3),
    Reg(4),
    Reg(5),
    Reg(6),
    Reg(7),
    Reg(9),
    Reg(10),
    Reg(11),
    Reg(12),
    Reg(13),
    Reg(14),
    Reg(15),
    Reg(8),
];

/// Registers a call may clobber.
pub static CALLER_SAVED: &[Reg] = ALLOCATABLE;
