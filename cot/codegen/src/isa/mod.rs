//! Target ISA definitions.
//!
//! Two architectures are supported: AArch64 (Mach-O / Darwin) and x86-64
//! (ELF / System V). Everything the target-independent core needs to know
//! about a target is expressed through the `Arch` enum here; instruction
//! encoding lives in the per-ISA submodules.

pub mod aarch64;
pub mod x64;

use core::fmt;

/// A physical register, identified by its hardware encoding number.
///
/// The meaning of the number depends on the target: `x0..x30` on AArch64,
/// the standard 0-15 GPR encoding on x86-64.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

impl Reg {
    /// The hardware encoding of this register.
    pub fn hw_enc(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// The target architecture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arch {
    /// AArch64, Darwin, Mach-O objects.
    Aarch64,
    /// x86-64, System V, ELF objects.
    X64,
}

impl Arch {
    /// Integer argument registers in ABI order.
    pub fn arg_regs(self) -> &'static [Reg] {
        match self {
            Self::Aarch64 => aarch64::ARG_REGS,
            Self::X64 => x64::ARG_REGS,
        }
    }

    /// Return-value registers: a (first, second) pair for two-register
    /// aggregates such as strings and slices.
    pub fn ret_regs(self) -> [Reg; 2] {
        match self {
            Self::Aarch64 => [aarch64::X0, aarch64::X1],
            Self::X64 => [x64::RAX, x64::RDX],
        }
    }

    /// The hidden return pointer register for large aggregate returns.
    pub fn ret_ptr_reg(self) -> Reg {
        match self {
            Self::Aarch64 => aarch64::X8,
            Self::X64 => x64::RDI,
        }
    }

    /// The scratch register reserved for parallel-copy cycle breaking and
    /// operand materialization. Never handed out by the allocator.
    pub fn scratch_reg(self) -> Reg {
        match self {
            Self::Aarch64 => aarch64::X16,
            Self::X64 => x64::R11,
        }
    }

    /// The second reserved scratch, for the cases that need two temporaries
    /// at once (memory-to-memory moves inside a parallel copy, two
    /// rematerialized operands).
    pub fn scratch_reg2(self) -> Reg {
        match self {
            Self::Aarch64 => aarch64::X17,
            Self::X64 => x64::R10,
        }
    }

    /// Registers the allocator may hand out, in preference order.
    pub fn allocatable_regs(self) -> &'static [Reg] {
        match self {
            Self::Aarch64 => aarch64::ALLOCATABLE,
            Self::X64 => x64::ALLOCATABLE,
        }
    }

    /// Registers clobbered by a call.
    pub fn caller_saved(self) -> &'static [Reg] {
        match self {
            Self::Aarch64 => aarch64::CALLER_SAVED,
            Self::X64 => x64::CALLER_SAVED,
        }
    }

    /// Render a register name for trace output.
    pub fn reg_name(self, r: Reg) -> String {
        match self {
            Self::Aarch64 => format!("x{}", r.0),
            Self::X64 => x64::reg_name(r).to_string(),
        }
    }
}
