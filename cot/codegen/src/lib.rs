//! The cot compiler's SSA core and machine-code generator.
//!
//! This crate takes the named-local IR the frontend lowers to, builds SSA
//! form with phi insertion over arbitrary control flow, runs the
//! transformation passes (call expansion, aggregate decomposition,
//! scheduling, strength reduction), allocates registers with spilling and
//! reloading, and emits machine code with relocations for AArch64 (Mach-O)
//! or x86-64 (ELF). Object-file serialization lives in `cot-object`; the
//! language frontend in `cot-frontend`.

pub mod binemit;
pub mod context;
pub mod entity;
pub mod error;
pub mod ir;
pub mod isa;
pub mod regalloc;
pub mod srcloc;
pub mod ssa;
pub mod types;

pub use crate::context::Context;
pub use crate::error::{CodegenError, CodegenResult, Diagnostics, Severity};
pub use crate::isa::Arch;
pub use crate::srcloc::SourceLoc;
