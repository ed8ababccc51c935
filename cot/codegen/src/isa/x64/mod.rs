//! x86-64 ISA definitions: registers and System V ABI tables.

pub mod emit;

use crate::isa::Reg;

/// rax: first return register.
pub const RAX: Reg = Reg(0);
/// rcx: fourth argument register, variable shift counts.
pub const RCX: Reg = Reg(1);
/// rdx: third argument register, second return register.
pub const RDX: Reg = Reg(2);
/// rsp.
pub const RSP: Reg = Reg(4);
/// rbp: frame pointer.
pub const RBP: Reg = Reg(5);
/// rsi: second argument register.
pub const RSI: Reg = Reg(6);
/// rdi: first argument register, hidden return pointer.
pub const RDI: Reg = Reg(7);
/// r8: fifth argument register.
pub const R8: Reg = Reg(8);
/// r9: sixth argument register.
pub const R9: Reg = Reg(9);
/// r10: second reserved scratch.
pub const R10: Reg = Reg(10);
/// r11: first reserved scratch.
pub const R11: Reg = Reg(11);

/// Integer argument registers, System V order.
pub static ARG_REGS: &[Reg] = &[RDI, RSI, RDX, RCX, R8, R9];

/// The allocatable pool: caller-saved registers minus the two scratches.
/// r12..r15 and rbx are callee-saved and deliberately unused.
pub static ALLOCATABLE: &[Reg] = &[RAX, RCX, RDX, RSI, RDI, R8, R9];

/// Registers a call may clobber.
pub static CALLER_SAVED: &[Reg] = ALLOCATABLE;

/// Printable name.
pub fn reg_name(r: Reg) -> &'static str {
    match r.hw_enc() {
        0 => "rax",
        1 => "rcx",
        2 => "rdx",
        3 => "rbx",
        4 => "rsp",
        5 => "rbp",
        6 => "rsi",
        7 => "rdi",
        8 => "r8",
        9 => "r9",
        10 => "r10",
        11 => "r11",
        12 => "r12",
        13 => "r13",
        14 => "r14",
        15 => "r15",
        _ => "r?",
    }
}
