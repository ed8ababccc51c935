//! AArch64 binary code emission.

use crate::binemit::{CodeOffset, CodeSink, CompiledFunc, Fixup, FixupKind, Reloc, patch_fixups};
use crate::entity::EntityRef;
use crate::error::{CodegenError, CodegenResult};
use crate::isa::Reg;
use crate::isa::aarch64::{ARG_REGS, FP, X0, X8, X16, X17, ZR};
use crate::regalloc::parallel_moves::{Loc, MoveStep, Src, resolve};
use crate::regalloc::{Allocation, EndLoc};
use crate::ssa::passes::expand_calls::CALL_RET_PTR;
use crate::ssa::passes::lower::{ConstPlan, plan_const};
use crate::ssa::{Block, BlockKind, Func, Home, Op, Value};
use crate::types::{self, TypeRegistry};

//=============================================================================
// Instruction word builders

fn gpr(r: Reg) -> u32 {
    (r.hw_enc() & 31) as u32
}

fn enc_arith_rrr(top8: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (top8 << 24) | (gpr(rm) << 16) | (gpr(rn) << 5) | gpr(rd)
}

fn enc_arith_imm12(top8: u32, rd: Reg, rn: Reg, imm12: u32) -> u32 {
    debug_assert!(imm12 < (1 << 12));
    (top8 << 24) | (imm12 << 10) | (gpr(rn) << 5) | gpr(rd)
}

fn enc_madd(rd: Reg, rn: Reg, rm: Reg, ra: Reg) -> u32 {
    0x9B00_0000 | (gpr(rm) << 16) | (gpr(ra) << 10) | (gpr(rn) << 5) | gpr(rd)
}

fn enc_msub(rd: Reg, rn: Reg, rm: Reg, ra: Reg) -> u32 {
    0x9B00_8000 | (gpr(rm) << 16) | (gpr(ra) << 10) | (gpr(rn) << 5) | gpr(rd)
}

fn enc_dp2(op15_10: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    0x9AC0_0000 | (gpr(rm) << 16) | (op15_10 << 10) | (gpr(rn) << 5) | gpr(rd)
}

fn enc_move_wide(base: u32, rd: Reg, imm16: u16, hw: u8) -> u32 {
    base | ((hw as u32) << 21) | ((imm16 as u32) << 5) | gpr(rd)
}

fn enc_bitfield(base: u32, rd: Reg, rn: Reg, immr: u32, imms: u32) -> u32 {
    base | (immr << 16) | (imms << 10) | (gpr(rn) << 5) | gpr(rd)
}

fn enc_ldst_uimm12(top10: u32, rt: Reg, rn: Reg, imm12: u32) -> u32 {
    debug_assert!(imm12 < (1 << 12));
    (top10 << 22) | (imm12 << 10) | (gpr(rn) << 5) | gpr(rt)
}

fn enc_ldst_simm9(top10: u32, rt: Reg, rn: Reg, simm9: i32) -> u32 {
    debug_assert!((-256..256).contains(&simm9));
    (top10 << 22) | (((simm9 as u32) & 0x1ff) << 12) | (gpr(rn) << 5) | gpr(rt)
}

fn enc_csel(rd: Reg, rn: Reg, rm: Reg, cond: u32) -> u32 {
    0x9A80_0000 | (gpr(rm) << 16) | (cond << 12) | (gpr(rn) << 5) | gpr(rd)
}

fn enc_cset(rd: Reg, cond: u32) -> u32 {
    // csinc rd, xzr, xzr, !cond
    0x9A9F_07E0 | ((cond ^ 1) << 12) | gpr(rd)
}

// Condition codes.
const EQ: u32 = 0;
const NE: u32 = 1;
const HS: u32 = 2;
const LO: u32 = 3;
const HI: u32 = 8;
const LS: u32 = 9;
const GE: u32 = 10;
const LT: u32 = 11;
const GT: u32 = 12;
const LE: u32 = 13;

//=============================================================================
// The emitter

/// Emit one allocated, scheduled function.
pub fn emit_func(
    func: &Func,
    alloc: &Allocation,
    reg: &TypeRegistry,
    string_syms: &[String],
) -> CodegenResult<CompiledFunc> {
    let mut e = Emitter {
        func,
        alloc,
        types: reg,
        string_syms,
        sink: CodeSink::new(),
        fixups: Vec::new(),
        block_offsets: vec![0; func.blocks.len()],
    };
    e.run()?;
    let Emitter { mut sink, fixups, block_offsets, .. } = e;
    patch_fixups(&mut sink, &fixups, &block_offsets);
    let (code, relocs) = sink.finish();
    Ok(CompiledFunc {
        name: func.name.clone(),
        code,
        relocs,
    })
}

struct Emitter<'a> {
    func: &'a Func,
    alloc: &'a Allocation,
    types: &'a TypeRegistry,
    string_syms: &'a [String],
    sink: CodeSink,
    fixups: Vec<Fixup>,
    block_offsets: Vec<CodeOffset>,
}

impl<'a> Emitter<'a> {
    fn run(&mut self) -> CodegenResult<()> {
        for b in self.func.rpo() {
            self.block_offsets[b.index()] = self.sink.offset();
            if b == self.func.entry {
                self.prologue();
            }
            let values = &self.func.blocks[b].values;
            for &v in values {
                self.emit_value(v)?;
            }
            self.terminator(b)?;
        }
        Ok(())
    }

    fn put(&mut self, word: u32) {
        self.sink.put4(word);
    }

    fn prologue(&mut self) {
        self.put(0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
        self.put(0x9100_03FD); // mov x29, sp
        // The immediate form is the one that addresses sp, so large frames
        // drop in aligned chunks.
        let mut remaining = self.func.frame_size;
        while remaining > 0 {
            let chunk = remaining.min(4080);
            self.put(enc_arith_imm12(0xD1, Reg(31), Reg(31), chunk)); // sub sp, sp, #chunk
            remaining -= chunk;
        }
    }

    fn epilogue(&mut self) {
        self.put(0x9100_03BF); // mov sp, x29
        self.put(0xA8C1_7BFD); // ldp x29, x30, [sp], #16
        self.put(0xD65F_03C0); // ret
    }

    fn load_constant(&mut self, rd: Reg, imm: u64) {
        match plan_const(imm) {
            ConstPlan::Movz { imm16, shift } => {
                self.put(enc_move_wide(0xD280_0000, rd, imm16, shift));
            }
            ConstPlan::Movn { imm16, shift } => {
                self.put(enc_move_wide(0x9280_0000, rd, imm16, shift));
            }
            ConstPlan::Chain => {
                let mut first = true;
                for hw in 0..4u8 {
                    let part = (imm >> (16 * hw)) as u16;
                    if part == 0 && !first {
                        continue;
                    }
                    if first {
                        self.put(enc_move_wide(0xD280_0000, rd, part, hw));
                        first = false;
                    } else {
                        self.put(enc_move_wide(0xF280_0000, rd, part, hw));
                    }
                }
            }
        }
    }

    fn mov(&mut self, rd: Reg, rm: Reg) {
        if rd != rm {
            self.put(0xAA00_03E0 | (gpr(rm) << 16) | gpr(rd)); // orr rd, xzr, rm
        }
    }

    /// `add rd, rn, #off` for a signed byte offset. The wide-offset path
    /// builds the constant in the destination itself whenever it can, so
    /// no scratch register is disturbed; parallel copies rely on that.
    fn add_imm(&mut self, rd: Reg, rn: Reg, off: i64) {
        if off == 0 {
            self.mov_from(rd, rn);
        } else if (0..4096).contains(&off) {
            self.put(enc_arith_imm12(0x91, rd, rn, off as u32));
        } else if (-4095..0).contains(&off) {
            self.put(enc_arith_imm12(0xD1, rd, rn, (-off) as u32));
        } else if rd != rn {
            self.load_constant(rd, off as u64);
            self.put(enc_arith_rrr(0x8B, rd, rd, rn)); // add rd, rd, rn
        } else {
            self.load_constant(X16, off as u64);
            self.put(enc_arith_rrr(0x8B, rd, rn, X16));
        }
    }

    /// Register move that also works when `rn` is the frame pointer.
    fn mov_from(&mut self, rd: Reg, rn: Reg) {
        if rn == FP {
            self.put(enc_arith_imm12(0x91, rd, rn, 0)); // add rd, x29, #0
        } else {
            self.mov(rd, rn);
        }
    }

    /// Load or store `rt` at `[x29 + off]`, eight bytes.
    ///
    /// Far offsets go through the stack pointer with a scaled unsigned
    /// offset rather than a temporary, so this stays safe inside parallel
    /// copies where both scratches may be occupied.
    fn fp_slot(&mut self, load: bool, rt: Reg, off: i32) {
        if (-256..256).contains(&off) {
            let top10 = if load { 0x3E1 } else { 0x3E0 }; // ldur / stur x
            self.put(enc_ldst_simm9(top10, rt, FP, off));
        } else {
            // sp = x29 - frame_size, so the slot sits at a non-negative,
            // eight-aligned offset from sp.
            let sp_off = self.func.frame_size as i64 + off as i64;
            debug_assert!(sp_off >= 0 && sp_off % 8 == 0 && (sp_off / 8) < (1 << 12));
            let top10 = if load { 0x3E5 } else { 0x3E4 }; // ldr / str x
            self.put(enc_ldst_uimm12(top10, rt, Reg(31), (sp_off / 8) as u32));
        }
    }

    /// Address of a global or literal: adrp + add with a relocation pair.
    fn load_symbol_addr(&mut self, rd: Reg, sym: &str) {
        self.sink.reloc(Reloc::Arm64Page21, sym, 0);
        self.put(0x9000_0000 | gpr(rd)); // adrp rd, sym@PAGE
        self.sink.reloc(Reloc::Arm64PageOff12, sym, 0);
        self.put(enc_arith_imm12(0x91, rd, rd, 0)); // add rd, rd, sym@PAGEOFF
    }

    /// Rebuild a rematerializable value into `rd`.
    fn materialize(&mut self, v: Value, rd: Reg) -> CodegenResult<()> {
        let data = &self.func.values[v];
        match data.op {
            Op::ConstInt | Op::ConstBool | Op::ConstFloat => {
                self.load_constant(rd, data.aux as u64);
            }
            Op::ConstNil => self.load_constant(rd, 0),
            Op::LocalAddr => {
                let off = self.func.slots[data.aux as usize].offset;
                self.add_imm(rd, FP, off as i64);
            }
            Op::GlobalAddr | Op::FuncAddr => {
                let sym = data.sym.as_deref().expect("symbol on address value");
                self.load_symbol_addr(rd, sym);
            }
            Op::ConstStrPtr => {
                let sym = self.string_syms[data.aux as usize].clone();
                self.load_symbol_addr(rd, &sym);
            }
            _ => {
                return Err(self.bug(format!("{v} is not rematerializable")));
            }
        }
        Ok(())
    }

    fn bug(&self, message: String) -> CodegenError {
        CodegenError::InternalInvariant {
            phase: "emit-aarch64",
            func: self.func.name.clone(),
            message,
        }
    }

    /// The register holding argument `idx` of `user`, materializing into
    /// `hint` when the allocator left it to us.
    fn arg_reg(&mut self, user: Value, idx: usize, hint: Reg) -> CodegenResult<Reg> {
        let a = self.func.values[user].args[idx];
        if let Some(&r) = self.alloc.use_regs.get(&(user, idx)) {
            if self.func.values[a].op.is_rematerializable() {
                self.materialize(a, r)?;
            }
            return Ok(r);
        }
        if self.func.values[a].op.is_rematerializable() {
            self.materialize(a, hint)?;
            return Ok(hint);
        }
        match self.func.values[a].home {
            Some(Home::Reg(r)) => Ok(r),
            Some(Home::Stack(off)) => {
                self.fp_slot(true, hint, off);
                Ok(hint)
            }
            None => Err(self.bug(format!("{a} has no location"))),
        }
    }

    fn def_reg(&mut self, v: Value) -> CodegenResult<Reg> {
        self.alloc
            .def_regs
            .get(&v)
            .copied()
            .ok_or_else(|| self.bug(format!("{v} has no destination register")))
    }

    fn cmp_cond(&self, v: Value) -> u32 {
        let signed = self
            .types
            .is_signed_int(self.func.values[self.func.values[v].args[0]].ty);
        match self.func.values[v].op {
            Op::Eq => EQ,
            Op::Ne => NE,
            Op::Lt => {
                if signed {
                    LT
                } else {
                    LO
                }
            }
            Op::Le => {
                if signed {
                    LE
                } else {
                    LS
                }
            }
            Op::Gt => {
                if signed {
                    GT
                } else {
                    HI
                }
            }
            Op::Ge => {
                if signed {
                    GE
                } else {
                    HS
                }
            }
            _ => unreachable!("not a comparison"),
        }
    }

    fn emit_value(&mut self, v: Value) -> CodegenResult<()> {
        let op = self.func.values[v].op;
        match op {
            // No code of their own.
            Op::Phi
            | Op::Arg
            | Op::RetPtr
            | Op::SelectN
            | Op::StringMake
            | Op::SliceMake => Ok(()),

            // Rematerialized at each use.
            _ if op.is_rematerializable() => Ok(()),

            Op::Copy => {
                let Ok(rd) = self.def_reg(v) else {
                    return Ok(()); // dead copy
                };
                let a = self.func.values[v].args[0];
                if self.func.values[a].op.is_rematerializable()
                    && !self.alloc.use_regs.contains_key(&(v, 0))
                {
                    return self.materialize(a, rd);
                }
                let rs = self.arg_reg(v, 0, X16)?;
                self.mov(rd, rs);
                Ok(())
            }

            Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor | Op::AddPtr => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                let rm = self.arg_reg(v, 1, X17)?;
                let top8 = match op {
                    Op::Add | Op::AddPtr => 0x8B,
                    Op::Sub => 0xCB,
                    Op::And => 0x8A,
                    Op::Or => 0xAA,
                    Op::Xor => 0xCA,
                    _ => unreachable!(),
                };
                self.put(enc_arith_rrr(top8, rd, rn, rm));
                Ok(())
            }

            Op::Mul => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                let rm = self.arg_reg(v, 1, X17)?;
                self.put(enc_madd(rd, rn, rm, ZR));
                Ok(())
            }

            Op::Div => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                let rm = self.arg_reg(v, 1, X17)?;
                let signed = self
                    .types
                    .is_signed_int(self.func.values[self.func.values[v].args[0]].ty);
                self.put(enc_dp2(if signed { 0b000011 } else { 0b000010 }, rd, rn, rm));
                Ok(())
            }

            Op::Rem => {
                // q = a / b; r = a - q * b
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                let rm = self.arg_reg(v, 1, X17)?;
                let signed = self
                    .types
                    .is_signed_int(self.func.values[self.func.values[v].args[0]].ty);
                // The quotient must not clobber either operand before the
                // msub reads them; park it in whichever scratch is free,
                // falling back to the destination when both are operands.
                let q = if rn != X16 && rm != X16 {
                    X16
                } else if rn != X17 && rm != X17 {
                    X17
                } else {
                    rd
                };
                self.put(enc_dp2(if signed { 0b000011 } else { 0b000010 }, q, rn, rm));
                self.put(enc_msub(rd, q, rm, rn));
                Ok(())
            }

            Op::Shl => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                if self.func.values[v].args.len() == 2 {
                    let rm = self.arg_reg(v, 1, X17)?;
                    self.put(enc_dp2(0b001000, rd, rn, rm)); // lslv
                } else {
                    let sh = (self.func.values[v].aux as u32) & 63;
                    self.put(enc_bitfield(0xD340_0000, rd, rn, (64 - sh) & 63, 63 - sh));
                }
                Ok(())
            }

            Op::Shr => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                let signed = self
                    .types
                    .is_signed_int(self.func.values[self.func.values[v].args[0]].ty);
                if self.func.values[v].args.len() == 2 {
                    let rm = self.arg_reg(v, 1, X17)?;
                    self.put(enc_dp2(if signed { 0b001010 } else { 0b001001 }, rd, rn, rm));
                } else {
                    let sh = (self.func.values[v].aux as u32) & 63;
                    let base = if signed { 0x9340_0000 } else { 0xD340_0000 };
                    self.put(enc_bitfield(base, rd, rn, sh, 63));
                }
                Ok(())
            }

            Op::Neg => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                self.put(enc_arith_rrr(0xCB, rd, ZR, rn)); // sub rd, xzr, rn
                Ok(())
            }

            Op::Not => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                if self.func.values[v].ty == types::BOOL {
                    // Logical not: x ^ 1.
                    self.load_constant(X17, 1);
                    self.put(enc_arith_rrr(0xCA, rd, rn, X17)); // eor
                } else {
                    self.put(0xAA20_03E0 | (gpr(rn) << 16) | gpr(rd)); // orn rd, xzr, rn
                }
                Ok(())
            }

            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                let rm = self.arg_reg(v, 1, X17)?;
                self.put(enc_arith_rrr(0xEB, ZR, rn, rm)); // cmp rn, rm
                self.put(enc_cset(rd, self.cmp_cond(v)));
                Ok(())
            }

            Op::Load => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                let ty = self.func.values[v].ty;
                let signed = self.types.is_signed_int(ty);
                let word = match (self.types.size_of(ty), signed) {
                    (8, _) => enc_ldst_uimm12(0x3E5, rd, rn, 0),
                    (4, true) => 0xB980_0000 | (gpr(rn) << 5) | gpr(rd),
                    (4, false) => 0xB940_0000 | (gpr(rn) << 5) | gpr(rd),
                    (2, true) => 0x7980_0000 | (gpr(rn) << 5) | gpr(rd),
                    (2, false) => 0x7940_0000 | (gpr(rn) << 5) | gpr(rd),
                    (1, true) => 0x3980_0000 | (gpr(rn) << 5) | gpr(rd),
                    (_, _) => 0x3940_0000 | (gpr(rn) << 5) | gpr(rd),
                };
                self.put(word);
                Ok(())
            }

            Op::Store => {
                let rn = self.arg_reg(v, 0, X16)?;
                let rt = self.arg_reg(v, 1, X17)?;
                let ty = self.func.values[self.func.values[v].args[1]].ty;
                let word = match self.types.size_of(ty) {
                    8 => 0xF900_0000 | (gpr(rn) << 5) | gpr(rt),
                    4 => 0xB900_0000 | (gpr(rn) << 5) | gpr(rt),
                    2 => 0x7900_0000 | (gpr(rn) << 5) | gpr(rt),
                    _ => 0x3900_0000 | (gpr(rn) << 5) | gpr(rt),
                };
                self.put(word);
                Ok(())
            }

            Op::OffPtr => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                self.add_imm(rd, rn, self.func.values[v].aux);
                Ok(())
            }

            Op::Move => {
                let rd = self.arg_reg(v, 0, X16)?;
                let rs = self.arg_reg(v, 1, X17)?;
                self.emit_block_copy(rd, rs, self.func.values[v].aux as u32);
                Ok(())
            }

            Op::Select => {
                let rd = self.def_reg(v)?;
                let rc = self.arg_reg(v, 0, X16)?;
                let rn = self.arg_reg(v, 1, X17)?;
                // The third operand may need the first scratch again, so
                // resolve it after the condition test consumed rc.
                self.put(0xF100_001F | (gpr(rc) << 5)); // subs xzr, rc, #0
                let rm = self.arg_reg(v, 2, X16)?;
                self.put(enc_csel(rd, rn, rm, NE));
                Ok(())
            }

            Op::Convert => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, X16)?;
                let ty = self.func.values[v].ty;
                let signed = self.types.is_signed_int(ty);
                match (self.types.size_of(ty), signed) {
                    (8, _) => self.mov(rd, rn),
                    (4, true) => self.put(enc_bitfield(0x9340_0000, rd, rn, 0, 31)), // sxtw
                    (4, false) => self.put(enc_bitfield(0xD340_0000, rd, rn, 0, 31)), // uxtw
                    (2, true) => self.put(enc_bitfield(0x9340_0000, rd, rn, 0, 15)),
                    (2, false) => self.put(enc_bitfield(0xD340_0000, rd, rn, 0, 15)),
                    (1, true) => self.put(enc_bitfield(0x9340_0000, rd, rn, 0, 7)),
                    (_, _) => self.put(enc_bitfield(0xD340_0000, rd, rn, 0, 7)),
                }
                Ok(())
            }

            Op::Call | Op::CallIndirect => self.emit_call(v),

            Op::LoadReg => {
                let rd = self.def_reg(v)?;
                let a = self.func.values[v].args[0];
                let Some(Home::Stack(off)) = self.func.values[a].home else {
                    return Err(self.bug(format!("reload of {a} without a stack home")));
                };
                self.fp_slot(true, rd, off);
                Ok(())
            }

            Op::StoreReg => {
                let a = self.func.values[v].args[0];
                let src = Reg(self.func.values[v].aux as u8);
                let Some(Home::Stack(off)) = self.func.values[a].home else {
                    return Err(self.bug(format!("spill of {a} without a stack home")));
                };
                self.fp_slot(false, src, off);
                Ok(())
            }

            Op::StringPtr | Op::StringLen | Op::SlicePtr | Op::SliceLen => {
                // Decomposition removes every one of these whose operand is
                // a make; anything left is a pass bug.
                Err(self.bug(format!("{v} survived aggregate decomposition")))
            }

            Op::FwdRef | Op::ConstStr => Err(self.bug(format!("{v} survived earlier passes"))),

            Op::ConstInt
            | Op::ConstBool
            | Op::ConstNil
            | Op::ConstFloat
            | Op::ConstStrPtr
            | Op::LocalAddr
            | Op::GlobalAddr
            | Op::FuncAddr => Ok(()),
        }
    }

    /// Inline chunked memory copy through the first scratch register.
    fn emit_block_copy(&mut self, rd: Reg, rs: Reg, size: u32) {
        let mut off = 0u32;
        while off + 8 <= size {
            self.put(enc_ldst_uimm12(0x3E5, X16, rs, off / 8)); // ldr x16, [rs, #off]
            self.put(enc_ldst_uimm12(0x3E4, X16, rd, off / 8)); // str x16, [rd, #off]
            off += 8;
        }
        if off + 4 <= size {
            self.put(0xB940_0000 | ((off / 4) << 10) | (gpr(rs) << 5) | gpr(X16));
            self.put(0xB900_0000 | ((off / 4) << 10) | (gpr(rd) << 5) | gpr(X16));
            off += 4;
        }
        if off + 2 <= size {
            self.put(0x7940_0000 | ((off / 2) << 10) | (gpr(rs) << 5) | gpr(X16));
            self.put(0x7900_0000 | ((off / 2) << 10) | (gpr(rd) << 5) | gpr(X16));
            off += 2;
        }
        if off < size {
            self.put(0x3940_0000 | (off << 10) | (gpr(rs) << 5) | gpr(X16));
            self.put(0x3900_0000 | (off << 10) | (gpr(rd) << 5) | gpr(X16));
        }
    }

    fn emit_call(&mut self, v: Value) -> CodegenResult<()> {
        let data = &self.func.values[v];
        let indirect = data.op == Op::CallIndirect;
        let has_ret_ptr = data.aux == CALL_RET_PTR;
        let args = data.args.clone();
        let first = usize::from(indirect);
        let last = args.len() - usize::from(has_ret_ptr);

        // Park the callee out of the argument shuffle's way.
        if indirect {
            let rc = self.arg_reg(v, 0, X17)?;
            self.mov(X17, rc);
        }

        // Stack arguments go out first, while every source register is
        // still intact; then the register arguments shuffle as one
        // parallel copy.
        let reg_slots = ARG_REGS.len();
        let mut moves: Vec<(Src, Loc)> = Vec::new();
        for (k, &a) in args[first..last].iter().enumerate() {
            let idx = first + k;
            if k < reg_slots {
                let src = self.call_src(v, idx, a);
                moves.push((src, Loc::Reg(ARG_REGS[k])));
            } else {
                let off = ((k - reg_slots) * 8) as i32;
                let r = self.arg_reg(v, idx, X16)?;
                // str r, [sp, #off]
                self.put(enc_ldst_uimm12(0x3E4, r, Reg(31), (off / 8) as u32));
            }
        }
        if has_ret_ptr {
            let src = self.call_src(v, args.len() - 1, args[args.len() - 1]);
            moves.push((src, Loc::Reg(X8)));
        }
        for step in resolve(moves, X16) {
            self.emit_move_step(step)?;
        }

        if indirect {
            self.put(0xD63F_0000 | (gpr(X17) << 5)); // blr x17
        } else {
            let sym = data.sym.clone().expect("direct call target");
            self.sink.reloc(Reloc::Arm64Call26, &sym, 0);
            self.put(0x9400_0000); // bl
        }
        Ok(())
    }

    /// A parallel-copy source for a call argument.
    fn call_src(&self, user: Value, idx: usize, a: Value) -> Src {
        if let Some(&r) = self.alloc.use_regs.get(&(user, idx)) {
            if !self.func.values[a].op.is_rematerializable() {
                return Src::Loc(Loc::Reg(r));
            }
        }
        if self.func.values[a].op.is_rematerializable() {
            Src::Remat(a)
        } else {
            match self.func.values[a].home {
                Some(Home::Reg(r)) => Src::Loc(Loc::Reg(r)),
                Some(Home::Stack(off)) => Src::Loc(Loc::Stack(off)),
                None => Src::Remat(a),
            }
        }
    }

    fn emit_move_step(&mut self, step: MoveStep) -> CodegenResult<()> {
        match (step.src, step.dst) {
            (Src::Loc(Loc::Reg(rs)), Loc::Reg(rd)) => {
                self.mov(rd, rs);
                Ok(())
            }
            (Src::Loc(Loc::Stack(off)), Loc::Reg(rd)) => {
                self.fp_slot(true, rd, off);
                Ok(())
            }
            (Src::Loc(Loc::Reg(rs)), Loc::Stack(off)) => {
                self.fp_slot(false, rs, off);
                Ok(())
            }
            (Src::Loc(Loc::Stack(from)), Loc::Stack(to)) => {
                self.fp_slot(true, X17, from);
                self.fp_slot(false, X17, to);
                Ok(())
            }
            (Src::Remat(a), Loc::Reg(rd)) => self.materialize(a, rd),
            (Src::Remat(a), Loc::Stack(off)) => {
                self.materialize(a, X17)?;
                self.fp_slot(false, X17, off);
                Ok(())
            }
        }
    }

    /// Where `v` lives at the end of `b`, as a parallel-copy source.
    fn end_src(&self, b: Block, v: Value) -> Src {
        match self.alloc.end_locs.get(&(b, v)) {
            Some(EndLoc::Reg(r)) => Src::Loc(Loc::Reg(*r)),
            Some(EndLoc::Stack(off)) => Src::Loc(Loc::Stack(*off)),
            Some(EndLoc::Remat) | None => Src::Remat(v),
        }
    }

    /// Bring `v` into a register at the end of `b`, for terminator use.
    fn end_reg(&mut self, b: Block, v: Value, hint: Reg) -> CodegenResult<Reg> {
        match self.end_src(b, v) {
            Src::Loc(Loc::Reg(r)) => Ok(r),
            Src::Loc(Loc::Stack(off)) => {
                self.fp_slot(true, hint, off);
                Ok(hint)
            }
            Src::Remat(a) => {
                self.materialize(a, hint)?;
                Ok(hint)
            }
        }
    }

    /// Moves for the phis of `succ` along the edge from `b`.
    fn edge_moves(&mut self, b: Block, succ: Block) -> CodegenResult<()> {
        let pred_idx = self
            .func
            .pred_index(succ, b)
            .ok_or_else(|| self.bug(format!("missing edge {b} -> {succ}")))?;
        let mut moves: Vec<(Src, Loc)> = Vec::new();
        for &ph in &self.func.blocks[succ].values {
            if self.func.values[ph].op != Op::Phi {
                break;
            }
            let arg = self.func.values[ph].args[pred_idx];
            let Some(Home::Stack(dst)) = self.func.values[ph].home else {
                return Err(self.bug(format!("phi {ph} has no stack home")));
            };
            moves.push((self.end_src(b, arg), Loc::Stack(dst)));
        }
        for step in resolve(moves, X16) {
            self.emit_move_step(step)?;
        }
        Ok(())
    }

    fn terminator(&mut self, b: Block) -> CodegenResult<()> {
        let data = &self.func.blocks[b];
        match data.kind {
            BlockKind::Entry | BlockKind::Plain => {
                let succ = data.succs[0];
                self.edge_moves(b, succ)?;
                self.fixups.push(Fixup {
                    at: self.sink.offset(),
                    target: succ,
                    kind: FixupKind::Branch26,
                });
                self.put(0x1400_0000); // b
                Ok(())
            }
            BlockKind::If => {
                let (then_b, else_b) = (data.succs[0], data.succs[1]);
                for s in [then_b, else_b] {
                    let has_phis = self.func.blocks[s]
                        .values
                        .first()
                        .is_some_and(|&v| self.func.values[v].op == Op::Phi);
                    if has_phis {
                        return Err(self.bug(format!("critical edge {b} -> {s}")));
                    }
                }
                let cond = data.ctrl[0];
                let rc = self.end_reg(b, cond, X16)?;
                self.fixups.push(Fixup {
                    at: self.sink.offset(),
                    target: else_b,
                    kind: FixupKind::Branch19,
                });
                self.put(0xB400_0000 | gpr(rc)); // cbz rc, else
                self.fixups.push(Fixup {
                    at: self.sink.offset(),
                    target: then_b,
                    kind: FixupKind::Branch26,
                });
                self.put(0x1400_0000); // b then
                Ok(())
            }
            BlockKind::Ret => {
                if let Some(&rv) = data.ctrl.first() {
                    let vd = &self.func.values[rv];
                    if matches!(vd.op, Op::StringMake | Op::SliceMake) {
                        let (p, l) = (vd.args[0], vd.args[1]);
                        let moves = vec![
                            (self.end_src(b, p), Loc::Reg(X0)),
                            (self.end_src(b, l), Loc::Reg(Reg(1))),
                        ];
                        for step in resolve(moves, X16) {
                            self.emit_move_step(step)?;
                        }
                    } else {
                        let r = self.end_reg(b, rv, X0)?;
                        self.mov(X0, r);
                    }
                }
                self.epilogue();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod emit_tests {
    use super::*;

    #[test]
    fn word_builders() {
        // add x0, x1, x2
        assert_eq!(enc_arith_rrr(0x8B, Reg(0), Reg(1), Reg(2)), 0x8B02_0020);
        // sub sp, sp, #32
        assert_eq!(enc_arith_imm12(0xD1, Reg(31), Reg(31), 32), 0xD100_83FF);
        // movz x3, #42
        assert_eq!(enc_move_wide(0xD280_0000, Reg(3), 42, 0), 0xD280_0543);
        // sdiv x0, x1, x2
        assert_eq!(enc_dp2(0b000011, Reg(0), Reg(1), Reg(2)), 0x9AC2_0C20);
        // csel x0, x1, x2, ne
        assert_eq!(enc_csel(Reg(0), Reg(1), Reg(2), NE), 0x9A82_1020);
    }

    #[test]
    fn cset_inverts_condition() {
        // cset x0, eq == csinc x0, xzr, xzr, ne
        assert_eq!(enc_cset(Reg(0), EQ), 0x9A9F_17E0);
    }

    #[test]
    fn load_store_offsets_scale() {
        // ldr x5, [x2, #16]
        assert_eq!(enc_ldst_uimm12(0x3E5, Reg(5), Reg(2), 2), 0xF940_0845);
        // ldur x5, [x29, #-8]
        assert_eq!(
            enc_ldst_simm9(0x3E1, Reg(5), FP, -8),
            0xF85F_83A5
        );
    }
}
