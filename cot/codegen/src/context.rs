//! The per-function compilation context.
//!
//! Drives the fixed pipeline: SSA construction, verification, the
//! transformation passes, register allocation, and code emission. The order
//! is part of the contract; nothing here may be reordered.

use crate::binemit::CompiledFunc;
use crate::error::CodegenResult;
use crate::ir;
use crate::isa::Arch;
use crate::regalloc;
use crate::ssa::{self, passes, verify};
use crate::types::TypeRegistry;

/// Compilation state reused across the functions of one unit.
pub struct Context {
    /// The target being compiled for.
    pub arch: Arch,
}

impl Context {
    /// A context for `arch`.
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    /// Compile one IR function to machine code.
    ///
    /// `string_syms` maps the function's string-literal indices to the
    /// data-section symbols the module assigned them.
    pub fn compile(
        &self,
        ir_func: &ir::Function,
        types: &TypeRegistry,
        string_syms: &[String],
    ) -> CodegenResult<CompiledFunc> {
        log::debug!("compiling `{}`", ir_func.name);

        let mut func = ssa::builder::build(ir_func, types, self.arch)?;
        verify::verify(&func)?;
        log::trace!(
            "`{}`: {} blocks, {} values after ssa construction",
            func.name,
            func.blocks.len(),
            func.values.len()
        );

        passes::run_all(&mut func, types)?;
        verify::verify(&func)?;

        let alloc = regalloc::run(&mut func, self.arch)?;
        log::trace!("`{}`: frame {} bytes", func.name, func.frame_size);

        match self.arch {
            Arch::Aarch64 => crate::isa::aarch64::emit::emit_func(&func, &alloc, types, string_syms),
            Arch::X64 => crate::isa::x64::emit::emit_func(&func, &alloc, types, string_syms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Opcode as O};
    use crate::types;

    fn compile_ret_42(arch: Arch) -> CompiledFunc {
        let reg = TypeRegistry::new();
        let mut b = Builder::new("main", types::I64);
        let c = b.ins0(O::ConstInt, types::I64, &[], 42);
        b.ins0(O::Return, types::VOID, &[c], 0);
        let f = b.finish();
        Context::new(arch).compile(&f, &reg, &[]).unwrap()
    }

    #[test]
    fn return_constant_compiles_on_both_targets() {
        let a64 = compile_ret_42(Arch::Aarch64);
        assert!(!a64.code.is_empty());
        assert_eq!(a64.code.len() % 4, 0);
        // The first word is the prologue's stp.
        assert_eq!(
            u32::from_le_bytes(a64.code[..4].try_into().unwrap()),
            0xA9BF_7BFD
        );
        // Somewhere the constant 42 is built with movz.
        let words: Vec<u32> = a64
            .code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert!(words.contains(&0xD280_0540), "movz x0, #42 missing");

        let x64 = compile_ret_42(Arch::X64);
        assert_eq!(x64.code[0], 0x55, "push rbp missing");
        assert_eq!(*x64.code.last().unwrap(), 0xC3, "ret missing");
    }

    #[test]
    fn call_emits_one_relocation() {
        let reg = TypeRegistry::new();
        let mut b = Builder::new("main", types::I64);
        let a = b.ins0(O::ConstInt, types::I64, &[], 40);
        let c2 = b.ins0(O::ConstInt, types::I64, &[], 2);
        let call = b.ins(O::Call, types::I64, &[a, c2], 0, Some("add".into()));
        b.ins0(O::Return, types::VOID, &[call], 0);
        let f = b.finish();
        let out = Context::new(Arch::Aarch64).compile(&f, &reg, &[]).unwrap();
        let calls: Vec<_> = out
            .relocs
            .iter()
            .filter(|r| r.kind == crate::binemit::Reloc::Arm64Call26)
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "add");
    }
}
