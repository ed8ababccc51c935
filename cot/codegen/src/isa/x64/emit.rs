//! x86-64 binary code emission.

use crate::binemit::{CodeOffset, CodeSink, CompiledFunc, Fixup, FixupKind, Reloc, patch_fixups};
use crate::entity::EntityRef;
use crate::error::{CodegenError, CodegenResult};
use crate::isa::Reg;
use crate::isa::x64::{ARG_REGS, R10, R11, RAX, RBP, RCX, RDX};
use crate::regalloc::parallel_moves::{Loc, MoveStep, Src, resolve};
use crate::regalloc::{Allocation, EndLoc};
use crate::ssa::passes::expand_calls::CALL_RET_PTR;
use crate::ssa::{Block, BlockKind, Func, Home, Op, Value};
use crate::types::{self, TypeRegistry};

// Condition codes as used in 0F 9x setcc and 0F 8x jcc.
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;
const CC_B: u8 = 0x2;
const CC_AE: u8 = 0x3;
const CC_BE: u8 = 0x6;
const CC_A: u8 = 0x7;
const CC_L: u8 = 0xC;
const CC_GE: u8 = 0xD;
const CC_LE: u8 = 0xE;
const CC_G: u8 = 0xF;

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

    //=========================================================================
    // Byte-level helpers

    fn rex(&mut self, w: bool, reg: Reg, rm: Reg) {
        let mut b = 0x40u8;
        if w {
            b |= 8;
        }
        if reg.hw_enc() >= 8 {
            b |= 4;
        }
        if rm.hw_enc() >= 8 {
            b |= 1;
        }
        self.sink.put1(b);
    }

    fn modrm_rr(&mut self, reg: Reg, rm: Reg) {
        self.sink
            .put1(0xC0 | ((reg.hw_enc() & 7) << 3) | (rm.hw_enc() & 7));
    }

    /// `[base + disp32]` operand. The bases we use never require a SIB.
    fn modrm_mem(&mut self, reg: Reg, base: Reg, disp: i32) {
        debug_assert!(base.hw_enc() & 7 != 4, "rsp base needs a SIB byte");
        self.sink
            .put1(0x80 | ((reg.hw_enc() & 7) << 3) | (base.hw_enc() & 7));
        self.sink.put4(disp as u32);
    }

    /// Two-register ALU op `opcode /r` with the destination in `rm`.
    fn alu_rr(&mut self, opcode: u8, src: Reg, dst: Reg) {
        self.rex(true, src, dst);
        self.sink.put1(opcode);
        self.modrm_rr(src, dst);
    }

    fn mov_rr(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.alu_rr(0x89, src, dst);
        }
    }

    fn mov_imm64(&mut self, dst: Reg, imm: u64) {
        self.rex(true, Reg(0), dst);
        self.sink.put1(0xB8 | (dst.hw_enc() & 7));
        self.sink.put8(imm);
    }

    /// `mov dst, [rbp + off]` / `mov [rbp + off], src` for spill slots.
    fn fp_slot(&mut self, load: bool, r: Reg, off: i32) {
        self.rex(true, r, RBP);
        self.sink.put1(if load { 0x8B } else { 0x89 });
        self.modrm_mem(r, RBP, off);
    }

    fn lea_rbp(&mut self, dst: Reg, off: i32) {
        self.rex(true, dst, RBP);
        self.sink.put1(0x8D);
        self.modrm_mem(dst, RBP, off);
    }

    /// `lea dst, [rip + sym]` with a PC-relative relocation.
    fn lea_symbol(&mut self, dst: Reg, sym: &str) {
        self.rex(true, dst, Reg(0));
        self.sink.put1(0x8D);
        self.sink.put1(((dst.hw_enc() & 7) << 3) | 0x05);
        self.sink.reloc(Reloc::X64PcRel32, sym, -4);
        self.sink.put4(0);
    }

    fn prologue(&mut self) {
        self.sink.put1(0x55); // push rbp
        self.sink.put1(0x48);
        self.sink.put1(0x89);
        self.sink.put1(0xE5); // mov rbp, rsp
        let frame = self.func.frame_size;
        if frame > 0 {
            self.sink.put1(0x48);
            self.sink.put1(0x81);
            self.sink.put1(0xEC); // sub rsp, imm32
            self.sink.put4(frame);
        }
    }

    fn epilogue(&mut self) {
        self.sink.put1(0xC9); // leave
        self.sink.put1(0xC3); // ret
    }

    fn bug(&self, message: String) -> CodegenError {
        CodegenError::InternalInvariant {
            phase: "emit-x64",
            func: self.func.name.clone(),
            message,
        }
    }

    //=========================================================================
    // Operand plumbing (mirrors the AArch64 emitter)

    fn materialize(&mut self, v: Value, rd: Reg) -> CodegenResult<()> {
        let data = &self.func.values[v];
        match data.op {
            Op::ConstInt | Op::ConstBool | Op::ConstFloat => self.mov_imm64(rd, data.aux as u64),
            // A plain move, not the xor idiom: materialization must not
            // disturb flags between a test and its cmov.
            Op::ConstNil => self.mov_imm64(rd, 0),
            Op::LocalAddr => {
                let off = self.func.slots[data.aux as usize].offset;
                self.lea_rbp(rd, off);
            }
            Op::GlobalAddr | Op::FuncAddr => {
                let sym = data.sym.clone().expect("symbol on address value");
                self.lea_symbol(rd, &sym);
            }
            Op::ConstStrPtr => {
                let sym = self.string_syms[data.aux as usize].clone();
                self.lea_symbol(rd, &sym);
            }
            _ => return Err(self.bug(format!("{v} is not rematerializable"))),
        }
        Ok(())
    }

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

    /// The classic two-operand dance: get `rd = rn OP rm` out of x86's
    /// read-modify-write ALU forms.
    fn binop_rrr(&mut self, opcode: u8, commutative: bool, rd: Reg, rn: Reg, rm: Reg) {
        if rd == rn {
            self.alu_rr(opcode, rm, rd);
        } else if rd == rm {
            if commutative {
                self.alu_rr(opcode, rn, rd);
            } else {
                // rd = rn - rd: negate and add.
                debug_assert_eq!(opcode, 0x29);
                self.unop(0xF7, 3, rd); // neg rd
                self.alu_rr(0x01, rn, rd); // add rd, rn
            }
        } else {
            self.mov_rr(rd, rn);
            self.alu_rr(opcode, rm, rd);
        }
    }

    fn unop(&mut self, opcode: u8, ext: u8, rm: Reg) {
        self.rex(true, Reg(0), rm);
        self.sink.put1(opcode);
        self.sink.put1(0xC0 | (ext << 3) | (rm.hw_enc() & 7));
    }

    fn setcc(&mut self, cc: u8, rd: Reg) {
        // setcc needs a REX prefix to reach sil/dil/r8b..r15b uniformly.
        self.rex(false, Reg(0), rd);
        self.sink.put1(0x0F);
        self.sink.put1(0x90 | cc);
        self.sink.put1(0xC0 | (rd.hw_enc() & 7));
        // movzx rd, rdb
        self.rex(true, rd, rd);
        self.sink.put1(0x0F);
        self.sink.put1(0xB6);
        self.modrm_rr(rd, rd);
    }

    fn cmp_cc(&self, v: Value) -> u8 {
        let signed = self
            .types
            .is_signed_int(self.func.values[self.func.values[v].args[0]].ty);
        match self.func.values[v].op {
            Op::Eq => CC_E,
            Op::Ne => CC_NE,
            Op::Lt => {
                if signed { CC_L } else { CC_B }
            }
            Op::Le => {
                if signed { CC_LE } else { CC_BE }
            }
            Op::Gt => {
                if signed { CC_G } else { CC_A }
            }
            Op::Ge => {
                if signed { CC_GE } else { CC_AE }
            }
            _ => unreachable!("not a comparison"),
        }
    }

    //=========================================================================
    // Values

    fn emit_value(&mut self, v: Value) -> CodegenResult<()> {
        let op = self.func.values[v].op;
        match op {
            Op::Phi
            | Op::Arg
            | Op::RetPtr
            | Op::SelectN
            | Op::StringMake
            | Op::SliceMake => Ok(()),

            _ if op.is_rematerializable() => Ok(()),

            Op::Copy => {
                let Ok(rd) = self.def_reg(v) else {
                    return Ok(());
                };
                let a = self.func.values[v].args[0];
                if self.func.values[a].op.is_rematerializable()
                    && !self.alloc.use_regs.contains_key(&(v, 0))
                {
                    return self.materialize(a, rd);
                }
                let rs = self.arg_reg(v, 0, R11)?;
                self.mov_rr(rd, rs);
                Ok(())
            }

            Op::Add | Op::AddPtr | Op::Sub | Op::And | Op::Or | Op::Xor => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                let rm = self.arg_reg(v, 1, R10)?;
                let (opcode, commutative) = match op {
                    Op::Add | Op::AddPtr => (0x01, true),
                    Op::Sub => (0x29, false),
                    Op::And => (0x21, true),
                    Op::Or => (0x09, true),
                    Op::Xor => (0x31, true),
                    _ => unreachable!(),
                };
                self.binop_rrr(opcode, commutative, rd, rn, rm);
                Ok(())
            }

            Op::Mul => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                let rm = self.arg_reg(v, 1, R10)?;
                // imul is dst-in-reg-field, so the dance flips.
                if rd == rn {
                    self.imul(rd, rm);
                } else if rd == rm {
                    self.imul(rd, rn);
                } else {
                    self.mov_rr(rd, rn);
                    self.imul(rd, rm);
                }
                Ok(())
            }

            Op::Div | Op::Rem => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                let rm = self.arg_reg(v, 1, R10)?;
                debug_assert!(rm != RAX && rm != RDX, "divisor aliases rax/rdx");
                let signed = self
                    .types
                    .is_signed_int(self.func.values[self.func.values[v].args[0]].ty);
                self.mov_rr(RAX, rn);
                if signed {
                    self.sink.put1(0x48);
                    self.sink.put1(0x99); // cqo
                    self.unop(0xF7, 7, rm); // idiv
                } else {
                    self.alu_rr(0x31, RDX, RDX); // xor rdx, rdx
                    self.unop(0xF7, 6, rm); // div
                }
                // Quotient lands in rax, remainder in rdx; the allocator
                // pinned rd accordingly.
                debug_assert_eq!(rd, if op == Op::Div { RAX } else { RDX });
                Ok(())
            }

            Op::Shl | Op::Shr => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                let signed = self
                    .types
                    .is_signed_int(self.func.values[self.func.values[v].args[0]].ty);
                if self.func.values[v].args.len() == 2 {
                    let ra = self.arg_reg(v, 1, R10)?;
                    self.mov_rr(RCX, ra);
                    self.mov_rr(rd, rn);
                    let ext = match (op, signed) {
                        (Op::Shl, _) => 4,
                        (Op::Shr, true) => 7,
                        (Op::Shr, false) => 5,
                        _ => unreachable!(),
                    };
                    self.unop(0xD3, ext, rd);
                } else {
                    let sh = (self.func.values[v].aux as u8) & 63;
                    self.mov_rr(rd, rn);
                    let ext = match (op, signed) {
                        (Op::Shl, _) => 4,
                        (Op::Shr, true) => 7,
                        (Op::Shr, false) => 5,
                        _ => unreachable!(),
                    };
                    self.rex(true, Reg(0), rd);
                    self.sink.put1(0xC1);
                    self.sink.put1(0xC0 | (ext << 3) | (rd.hw_enc() & 7));
                    self.sink.put1(sh);
                }
                Ok(())
            }

            Op::Neg => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                self.mov_rr(rd, rn);
                self.unop(0xF7, 3, rd);
                Ok(())
            }

            Op::Not => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                self.mov_rr(rd, rn);
                if self.func.values[v].ty == types::BOOL {
                    // xor rd, 1
                    self.rex(true, Reg(0), rd);
                    self.sink.put1(0x83);
                    self.sink.put1(0xC0 | (6 << 3) | (rd.hw_enc() & 7));
                    self.sink.put1(1);
                } else {
                    self.unop(0xF7, 2, rd);
                }
                Ok(())
            }

            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                let rm = self.arg_reg(v, 1, R10)?;
                self.alu_rr(0x39, rm, rn); // cmp rn, rm
                self.setcc(self.cmp_cc(v), rd);
                Ok(())
            }

            Op::Load => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                let ty = self.func.values[v].ty;
                let signed = self.types.is_signed_int(ty);
                match (self.types.size_of(ty), signed) {
                    (8, _) => {
                        self.rex(true, rd, rn);
                        self.sink.put1(0x8B);
                        self.modrm_mem(rd, rn, 0);
                    }
                    (4, true) => {
                        self.rex(true, rd, rn);
                        self.sink.put1(0x63); // movsxd
                        self.modrm_mem(rd, rn, 0);
                    }
                    (4, false) => {
                        self.rex(false, rd, rn);
                        self.sink.put1(0x8B); // mov r32 zero-extends
                        self.modrm_mem(rd, rn, 0);
                    }
                    (2, s) => {
                        self.rex(true, rd, rn);
                        self.sink.put1(0x0F);
                        self.sink.put1(if s { 0xBF } else { 0xB7 });
                        self.modrm_mem(rd, rn, 0);
                    }
                    (_, s) => {
                        self.rex(true, rd, rn);
                        self.sink.put1(0x0F);
                        self.sink.put1(if s { 0xBE } else { 0xB6 });
                        self.modrm_mem(rd, rn, 0);
                    }
                }
                Ok(())
            }

            Op::Store => {
                let rn = self.arg_reg(v, 0, R11)?;
                let rt = self.arg_reg(v, 1, R10)?;
                let ty = self.func.values[self.func.values[v].args[1]].ty;
                match self.types.size_of(ty) {
                    8 => {
                        self.rex(true, rt, rn);
                        self.sink.put1(0x89);
                        self.modrm_mem(rt, rn, 0);
                    }
                    4 => {
                        self.rex(false, rt, rn);
                        self.sink.put1(0x89);
                        self.modrm_mem(rt, rn, 0);
                    }
                    2 => {
                        self.sink.put1(0x66);
                        self.rex(false, rt, rn);
                        self.sink.put1(0x89);
                        self.modrm_mem(rt, rn, 0);
                    }
                    _ => {
                        self.rex(false, rt, rn);
                        self.sink.put1(0x88);
                        self.modrm_mem(rt, rn, 0);
                    }
                }
                Ok(())
            }

            Op::OffPtr => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                // lea rd, [rn + off]
                let off = self.func.values[v].aux as i32;
                self.rex(true, rd, rn);
                self.sink.put1(0x8D);
                self.modrm_mem(rd, rn, off);
                Ok(())
            }

            Op::Move => {
                let rd = self.arg_reg(v, 0, R11)?;
                let rs = self.arg_reg(v, 1, R10)?;
                self.emit_block_copy(rd, rs, self.func.values[v].aux as u32);
                Ok(())
            }

            Op::Select => {
                let rd = self.def_reg(v)?;
                let rc = self.arg_reg(v, 0, R11)?;
                let rn = self.arg_reg(v, 1, R10)?;
                self.alu_rr(0x85, rc, rc); // test rc, rc
                self.mov_rr(rd, rn);
                let rm = self.arg_reg(v, 2, R11)?;
                // cmove rd, rm
                self.rex(true, rd, rm);
                self.sink.put1(0x0F);
                self.sink.put1(0x44);
                self.modrm_rr(rd, rm);
                Ok(())
            }

            Op::Convert => {
                let rd = self.def_reg(v)?;
                let rn = self.arg_reg(v, 0, R11)?;
                let ty = self.func.values[v].ty;
                let signed = self.types.is_signed_int(ty);
                match (self.types.size_of(ty), signed) {
                    (8, _) => self.mov_rr(rd, rn),
                    (4, true) => {
                        self.rex(true, rd, rn);
                        self.sink.put1(0x63); // movsxd
                        self.modrm_rr(rd, rn);
                    }
                    (4, false) => {
                        // mov r32 zero-extends into the full register.
                        self.rex(false, rn, rd);
                        self.sink.put1(0x89);
                        self.modrm_rr(rn, rd);
                    }
                    (w, s) => {
                        self.rex(true, rd, rn);
                        self.sink.put1(0x0F);
                        let opcode = match (w, s) {
                            (2, true) => 0xBF,
                            (2, false) => 0xB7,
                            (_, true) => 0xBE,
                            _ => 0xB6,
                        };
                        self.sink.put1(opcode);
                        self.modrm_rr(rd, rn);
                    }
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

    fn imul(&mut self, rd: Reg, rm: Reg) {
        self.rex(true, rd, rm);
        self.sink.put1(0x0F);
        self.sink.put1(0xAF);
        self.modrm_rr(rd, rm);
    }

    fn emit_block_copy(&mut self, rd: Reg, rs: Reg, size: u32) {
        // Chunked copy through r11; sizes here are known small constants.
        let mut off = 0i32;
        let mut left = size;
        while left >= 8 {
            self.rex(true, R11, rs);
            self.sink.put1(0x8B);
            self.modrm_mem(R11, rs, off);
            self.rex(true, R11, rd);
            self.sink.put1(0x89);
            self.modrm_mem(R11, rd, off);
            off += 8;
            left -= 8;
        }
        if left >= 4 {
            self.rex(false, R11, rs);
            self.sink.put1(0x8B);
            self.modrm_mem(R11, rs, off);
            self.rex(false, R11, rd);
            self.sink.put1(0x89);
            self.modrm_mem(R11, rd, off);
            off += 4;
            left -= 4;
        }
        if left >= 2 {
            self.sink.put1(0x66);
            self.rex(false, R11, rs);
            self.sink.put1(0x8B);
            self.modrm_mem(R11, rs, off);
            self.sink.put1(0x66);
            self.rex(false, R11, rd);
            self.sink.put1(0x89);
            self.modrm_mem(R11, rd, off);
            off += 2;
            left -= 2;
        }
        if left > 0 {
            self.rex(false, R11, rs);
            self.sink.put1(0x8A);
            self.modrm_mem(R11, rs, off);
            self.rex(false, R11, rd);
            self.sink.put1(0x88);
            self.modrm_mem(R11, rd, off);
        }
    }

    fn emit_call(&mut self, v: Value) -> CodegenResult<()> {
        let data = &self.func.values[v];
        let indirect = data.op == Op::CallIndirect;
        let has_ret_ptr = data.aux == CALL_RET_PTR;
        let args = data.args.clone();
        let first = usize::from(indirect);
        let last = args.len() - usize::from(has_ret_ptr);

        if indirect {
            let rc = self.arg_reg(v, 0, R10)?;
            self.mov_rr(R10, rc);
        }

        // Stack arguments push right to left, with an alignment pad when
        // their count is odd.
        let reg_slots = ARG_REGS.len();
        let nstack = (last - first).saturating_sub(reg_slots);
        let pad = nstack % 2;
        if pad == 1 {
            self.sub_rsp(8);
        }
        for k in (reg_slots..last - first).rev() {
            let idx = first + k;
            let r = self.arg_reg(v, idx, R11)?;
            if r.hw_enc() >= 8 {
                self.sink.put1(0x41);
            }
            self.sink.put1(0x50 | (r.hw_enc() & 7)); // push r
        }

        let mut moves: Vec<(Src, Loc)> = Vec::new();
        for (k, &a) in args[first..last].iter().enumerate().take(reg_slots) {
            let src = self.call_src(v, first + k, a);
            moves.push((src, Loc::Reg(ARG_REGS[k])));
        }
        if has_ret_ptr {
            let src = self.call_src(v, args.len() - 1, args[args.len() - 1]);
            moves.push((src, Loc::Reg(ARG_REGS[0])));
        }
        for step in resolve(moves, R11) {
            self.emit_move_step(step)?;
        }

        if indirect {
            self.sink.put1(0x41);
            self.sink.put1(0xFF);
            self.sink.put1(0xD2); // call r10
        } else {
            let sym = data.sym.clone().expect("direct call target");
            self.sink.put1(0xE8);
            self.sink.reloc(Reloc::X64CallRel32, &sym, -4);
            self.sink.put4(0);
        }

        // The caller owns stack-argument cleanup.
        if nstack + pad > 0 {
            self.add_rsp(((nstack + pad) * 8) as u32);
        }
        Ok(())
    }

    fn sub_rsp(&mut self, n: u32) {
        self.sink.put1(0x48);
        self.sink.put1(0x81);
        self.sink.put1(0xEC);
        self.sink.put4(n);
    }

    fn add_rsp(&mut self, n: u32) {
        self.sink.put1(0x48);
        self.sink.put1(0x81);
        self.sink.put1(0xC4);
        self.sink.put4(n);
    }

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
                self.mov_rr(rd, rs);
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
                self.fp_slot(true, R10, from);
                self.fp_slot(false, R10, to);
                Ok(())
            }
            (Src::Remat(a), Loc::Reg(rd)) => self.materialize(a, rd),
            (Src::Remat(a), Loc::Stack(off)) => {
                self.materialize(a, R10)?;
                self.fp_slot(false, R10, off);
                Ok(())
            }
        }
    }

    fn end_src(&self, b: Block, v: Value) -> Src {
        match self.alloc.end_locs.get(&(b, v)) {
            Some(EndLoc::Reg(r)) => Src::Loc(Loc::Reg(*r)),
            Some(EndLoc::Stack(off)) => Src::Loc(Loc::Stack(*off)),
            Some(EndLoc::Remat) | None => Src::Remat(v),
        }
    }

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
        for step in resolve(moves, R11) {
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
                self.sink.put1(0xE9); // jmp rel32
                self.fixups.push(Fixup {
                    at: self.sink.offset(),
                    target: succ,
                    kind: FixupKind::Rel32,
                });
                self.sink.put4(0);
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
                let rc = self.end_reg(b, cond, R11)?;
                self.alu_rr(0x85, rc, rc); // test rc, rc
                self.sink.put1(0x0F);
                self.sink.put1(0x80 | CC_E); // je else
                self.fixups.push(Fixup {
                    at: self.sink.offset(),
                    target: else_b,
                    kind: FixupKind::Rel32,
                });
                self.sink.put4(0);
                self.sink.put1(0xE9); // jmp then
                self.fixups.push(Fixup {
                    at: self.sink.offset(),
                    target: then_b,
                    kind: FixupKind::Rel32,
                });
                self.sink.put4(0);
                Ok(())
            }
            BlockKind::Ret => {
                if let Some(&rv) = data.ctrl.first() {
                    let vd = &self.func.values[rv];
                    if matches!(vd.op, Op::StringMake | Op::SliceMake) {
                        let (p, l) = (vd.args[0], vd.args[1]);
                        let moves = vec![
                            (self.end_src(b, p), Loc::Reg(RAX)),
                            (self.end_src(b, l), Loc::Reg(RDX)),
                        ];
                        for step in resolve(moves, R11) {
                            self.emit_move_step(step)?;
                        }
                    } else {
                        let r = self.end_reg(b, rv, RAX)?;
                        self.mov_rr(RAX, r);
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
    use crate::isa::x64::{RSI, RDI};

    fn sink_bytes(f: impl FnOnce(&mut Emitter)) -> Vec<u8> {
        let func = Func::new("t", types::VOID);
        let alloc = Allocation {
            def_regs: Default::default(),
            use_regs: Default::default(),
            end_locs: Default::default(),
            outgoing_args: 0,
        };
        let reg = TypeRegistry::new();
        let mut e = Emitter {
            func: &func,
            alloc: &alloc,
            types: &reg,
            string_syms: &[],
            sink: CodeSink::new(),
            fixups: Vec::new(),
            block_offsets: vec![0],
        };
        f(&mut e);
        let (bytes, _) = e.sink.finish();
        bytes
    }

    #[test]
    fn mov_and_alu_encode() {
        let b = sink_bytes(|e| e.mov_rr(RDI, RSI));
        assert_eq!(b, vec![0x48, 0x89, 0xF7]); // mov rdi, rsi
        let b = sink_bytes(|e| e.alu_rr(0x01, RSI, RDI));
        assert_eq!(b, vec![0x48, 0x01, 0xF7]); // add rdi, rsi
    }

    #[test]
    fn imm64_uses_movabs() {
        let b = sink_bytes(|e| e.mov_imm64(RAX, 42));
        assert_eq!(b[..2], [0x48, 0xB8]);
        assert_eq!(u64::from_le_bytes(b[2..10].try_into().unwrap()), 42);
    }

    #[test]
    fn rbp_slots_use_disp32() {
        let b = sink_bytes(|e| e.fp_slot(true, RAX, -8));
        // mov rax, [rbp - 8]
        assert_eq!(b[..3], [0x48, 0x8B, 0x85]);
        assert_eq!(i32::from_le_bytes(b[3..7].try_into().unwrap()), -8);
    }

    #[test]
    fn extended_regs_get_rex_bits() {
        let b = sink_bytes(|e| e.mov_rr(R10, RAX));
        assert_eq!(b, vec![0x49, 0x89, 0xC2]); // mov r10, rax
    }
}
