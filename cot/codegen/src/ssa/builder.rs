//! Translation of named-local IR into SSA form.
//!
//! Locals become SSA values through on-demand reads. Each block keeps a map
//! of the values its locals hold; a read that misses consults a lone
//! translated predecessor, and otherwise leaves a `FwdRef` placeholder. After
//! the whole function is translated the placeholders are resolved into phis
//! (or collapsed to copies when every incoming value agrees) in a fixed-point
//! loop, since resolving one placeholder can require creating another in a
//! predecessor.

use crate::entity::EntityRef;
use crate::error::{CodegenError, CodegenResult};
use crate::ir;
use crate::isa::Arch;
use crate::srcloc::SourceLoc;
use crate::ssa::{Block, BlockKind, Func, Op, Value};
use crate::types::{self, Type, TypeData, TypeRegistry};
use hashbrown::HashMap;
use smallvec::SmallVec;

/// Translate one IR function into SSA.
pub fn build(
    ir_func: &ir::Function,
    reg: &TypeRegistry,
    arch: Arch,
) -> CodegenResult<Func> {
    let mut b = Builder {
        ir: ir_func,
        reg,
        arch,
        func: Func::new(ir_func.name.clone(), ir_func.ret_ty),
        block_map: Vec::new(),
        translated: Vec::new(),
        defs: HashMap::new(),
        node_map: HashMap::new(),
        fwdrefs: Vec::new(),
        ret_ptr: None,
    };
    b.func.strings = ir_func.strings.clone();
    b.func.globals = ir_func.globals.clone();
    for (_, local) in ir_func.locals.iter() {
        b.func.slots.push(crate::ssa::LocalSlot {
            name: local.name.clone(),
            size: local.size,
            offset: 0,
        });
    }
    b.run()?;
    Ok(b.func)
}

struct Builder<'a> {
    ir: &'a ir::Function,
    reg: &'a TypeRegistry,
    arch: Arch,
    func: Func,
    /// IR block index -> SSA block.
    block_map: Vec<Block>,
    /// Which SSA blocks have had their bodies translated.
    translated: Vec<bool>,
    /// Outgoing value of each local per block.
    defs: HashMap<(Block, ir::Local), Value>,
    /// IR node -> SSA value.
    node_map: HashMap<ir::Node, Value>,
    /// Unresolved placeholders.
    fwdrefs: Vec<Value>,
    /// Captured hidden return pointer, for by-reference aggregate returns.
    ret_ptr: Option<Value>,
}

impl<'a> Builder<'a> {
    fn run(&mut self) -> CodegenResult<()> {
        self.map_blocks();
        self.connect_edges();
        self.lower_params();
        for irb in self.ir.blocks.keys() {
            self.translate_block(irb)?;
        }
        self.resolve_fwdrefs()?;
        self.reorder_phis_first();
        Ok(())
    }

    fn map_blocks(&mut self) {
        for (i, _) in self.ir.blocks.iter() {
            let b = if i.index() == 0 {
                self.func.entry
            } else {
                self.func.add_block(BlockKind::Plain)
            };
            self.block_map.push(b);
            self.translated.push(false);
        }
    }

    /// All edges are known from the IR terminators before any body is
    /// translated, so every block is effectively sealed and predecessor
    /// lists are complete during the walk.
    fn connect_edges(&mut self) {
        for irb in self.ir.blocks.keys() {
            let Some(term) = self.ir.terminator(irb) else {
                continue;
            };
            let node = &self.ir.nodes[term];
            let from = self.block_map[irb.index()];
            match node.op {
                ir::Opcode::Jump => {
                    let to = self.block_map[node.aux as usize];
                    self.func.add_edge(from, to);
                }
                ir::Opcode::Branch => {
                    let (t, e) = ir::unpack_targets(node.aux);
                    let to_then = self.block_map[t.index()];
                    let to_else = self.block_map[e.index()];
                    self.func.add_edge(from, to_then);
                    self.func.add_edge(from, to_else);
                }
                _ => {}
            }
        }
    }

    /// Entry is built in three phases so that no parameter store clobbers a
    /// register another parameter has yet to be captured from.
    fn lower_params(&mut self) {
        let entry = self.func.entry;
        let loc = SourceLoc::default();
        let arg_regs = self.arch.arg_regs();
        let mut next_reg = 0usize;

        // Phase 1: capture every physical argument register.
        let mut captured: Vec<SmallVec<[Value; 2]>> = Vec::new();
        if self.reg.is_by_ref_aggregate(self.ir.ret_ty) {
            let rp = self.arch.ret_ptr_reg();
            let v = self.func.add_value(
                entry,
                Op::RetPtr,
                types::I64,
                &[],
                rp.hw_enc() as i64,
                loc,
            );
            self.ret_ptr = Some(v);
        }
        for param in &self.ir.params {
            let nregs = if self.reg.is_by_ref_aggregate(param.ty) {
                1
            } else {
                self.reg.abi_register_count(param.ty) as usize
            };
            let mut vals = SmallVec::new();
            for _ in 0..nregs {
                let phys = arg_regs[next_reg];
                next_reg += 1;
                let v = self.func.add_value(
                    entry,
                    Op::Arg,
                    types::I64,
                    &[],
                    phys.hw_enc() as i64,
                    loc,
                );
                vals.push(v);
            }
            captured.push(vals);
        }

        // Phase 2: reassemble two-register string and slice parameters.
        let mut assembled: Vec<Value> = Vec::new();
        for (i, param) in self.ir.params.iter().enumerate() {
            let vals = &captured[i];
            let v = if param.ty == types::STR {
                self.func
                    .add_value(entry, Op::StringMake, types::STR, &[vals[0], vals[1]], 0, loc)
            } else if matches!(self.reg.data(param.ty), TypeData::Slice { .. }) {
                self.func
                    .add_value(entry, Op::SliceMake, param.ty, &[vals[0], vals[1]], 0, loc)
            } else {
                vals[0]
            };
            assembled.push(v);
        }

        // Phase 3: land each parameter in its local. Promotable parameters
        // become the entry definition of their local; aggregates go to
        // memory.
        for (i, param) in self.ir.params.iter().enumerate() {
            if self.reg.is_by_ref_aggregate(param.ty) {
                let addr = self.func.add_value(
                    entry,
                    Op::LocalAddr,
                    types::I64,
                    &[],
                    param.local.index() as i64,
                    loc,
                );
                let size = self.reg.size_of(param.ty) as i64;
                self.func
                    .add_value(entry, Op::Move, types::MEM, &[addr, captured[i][0]], size, loc);
            } else if captured[i].len() == 2 && param.ty != types::STR
                && !matches!(self.reg.data(param.ty), TypeData::Slice { .. })
            {
                // A 9..16 byte aggregate: two eight-byte stores.
                let addr = self.func.add_value(
                    entry,
                    Op::LocalAddr,
                    types::I64,
                    &[],
                    param.local.index() as i64,
                    loc,
                );
                self.func
                    .add_value(entry, Op::Store, types::MEM, &[addr, captured[i][0]], 0, loc);
                let hi = self
                    .func
                    .add_value(entry, Op::OffPtr, types::I64, &[addr], 8, loc);
                self.func
                    .add_value(entry, Op::Store, types::MEM, &[hi, captured[i][1]], 0, loc);
            } else {
                self.defs.insert((self.func.entry, param.local), assembled[i]);
            }
        }
    }

    fn translate_block(&mut self, irb: ir::BlockId) -> CodegenResult<()> {
        let block = self.block_map[irb.index()];
        let nodes: Vec<ir::Node> = self.ir.block_nodes(irb).collect();
        for n in nodes {
            self.translate_node(block, n)?;
        }
        self.translated[block.index()] = true;
        Ok(())
    }

    fn arg(&self, n: ir::Node, i: usize) -> Value {
        let a = self.ir.nodes[n].args[i];
        *self
            .node_map
            .get(&a)
            .expect("operand translated before use")
    }

    fn translate_node(&mut self, block: Block, n: ir::Node) -> CodegenResult<()> {
        use ir::Opcode as O;
        let data = &self.ir.nodes[n];
        let (op, ty, aux, loc) = (data.op, data.ty, data.aux, data.loc);
        let sym = data.sym.clone();
        let v = match op {
            O::ConstInt => self.func.add_value(block, Op::ConstInt, ty, &[], aux, loc),
            O::ConstBool => self.func.add_value(block, Op::ConstBool, ty, &[], aux, loc),
            O::ConstNil => self.func.add_value(block, Op::ConstNil, ty, &[], 0, loc),
            O::ConstFloat => self.func.add_value(block, Op::ConstFloat, ty, &[], aux, loc),
            O::ConstStr => self.func.add_value(block, Op::ConstStr, ty, &[], aux, loc),

            O::Add | O::Sub | O::Mul | O::Div | O::Rem | O::And | O::Or | O::Xor | O::Shl
            | O::Shr => {
                let (a, b) = (self.arg(n, 0), self.arg(n, 1));
                self.func.add_value(block, binop(op), ty, &[a, b], 0, loc)
            }
            O::Neg | O::Not => {
                let a = self.arg(n, 0);
                let sop = if op == O::Neg { Op::Neg } else { Op::Not };
                self.func.add_value(block, sop, ty, &[a], 0, loc)
            }
            O::Eq | O::Ne | O::Lt | O::Le | O::Gt | O::Ge => {
                let (a, b) = (self.arg(n, 0), self.arg(n, 1));
                self.func.add_value(block, cmpop(op), ty, &[a, b], 0, loc)
            }

            O::Load => {
                let a = self.arg(n, 0);
                self.func.add_value(block, Op::Load, ty, &[a], 0, loc)
            }
            O::Store => {
                let (a, val) = (self.arg(n, 0), self.arg(n, 1));
                self.func
                    .add_value(block, Op::Store, types::MEM, &[a, val], 0, loc)
            }
            O::Move => {
                let (dst, src) = (self.arg(n, 0), self.arg(n, 1));
                self.func
                    .add_value(block, Op::Move, types::MEM, &[dst, src], aux, loc)
            }

            O::LoadLocal => {
                let local = ir::Local::from_u32(aux as u32);
                self.read_local(block, local, ty, loc)
            }
            O::StoreLocal => {
                let val = self.arg(n, 0);
                let local = ir::Local::from_u32(aux as u32);
                self.defs.insert((block, local), val);
                val
            }
            O::LocalAddr => self.func.add_value(block, Op::LocalAddr, ty, &[], aux, loc),
            O::GlobalAddr => self.func.add_value_sym(
                block,
                Op::GlobalAddr,
                ty,
                &[],
                0,
                sym.clone().expect("global symbol"),
                loc,
            ),
            O::FuncAddr => self.func.add_value_sym(
                block,
                Op::FuncAddr,
                ty,
                &[],
                0,
                sym.clone().expect("function symbol"),
                loc,
            ),
            O::OffPtr => {
                let a = self.arg(n, 0);
                self.func.add_value(block, Op::OffPtr, ty, &[a], aux, loc)
            }
            O::IndexPtr => {
                // Scale the index by the element stride up front; the
                // strength-reduction pass turns the multiply into a shift
                // when the stride allows it.
                let (a, i) = (self.arg(n, 0), self.arg(n, 1));
                let scaled = if aux == 1 {
                    i
                } else {
                    let c = self
                        .func
                        .add_value(block, Op::ConstInt, types::I64, &[], aux, loc);
                    self.func.add_value(block, Op::Mul, types::I64, &[i, c], 0, loc)
                };
                self.func.add_value(block, Op::AddPtr, ty, &[a, scaled], 0, loc)
            }
            O::FieldLoad => {
                let base = self.arg(n, 0);
                let addr = if aux != 0 {
                    self.func
                        .add_value(block, Op::OffPtr, types::I64, &[base], aux, loc)
                } else {
                    base
                };
                self.func.add_value(block, Op::Load, ty, &[addr], 0, loc)
            }
            O::FieldStore => {
                let base = self.arg(n, 0);
                let val = self.arg(n, 1);
                let addr = if aux != 0 {
                    self.func
                        .add_value(block, Op::OffPtr, types::I64, &[base], aux, loc)
                } else {
                    base
                };
                self.func
                    .add_value(block, Op::Store, types::MEM, &[addr, val], 0, loc)
            }

            O::Call => {
                let args: Vec<Value> = (0..data.args.len()).map(|i| self.arg(n, i)).collect();
                self.func.add_value_sym(
                    block,
                    Op::Call,
                    ty,
                    &args,
                    0,
                    sym.clone().expect("call target"),
                    loc,
                )
            }
            O::CallIndirect => {
                let args: Vec<Value> = (0..data.args.len()).map(|i| self.arg(n, i)).collect();
                self.func
                    .add_value(block, Op::CallIndirect, ty, &args, 0, loc)
            }
            O::StringConcat => {
                let (a, b) = (self.arg(n, 0), self.arg(n, 1));
                self.func.add_value_sym(
                    block,
                    Op::Call,
                    types::STR,
                    &[a, b],
                    0,
                    "__string_concat",
                    loc,
                )
            }

            O::SliceMake => {
                let (p, l) = (self.arg(n, 0), self.arg(n, 1));
                self.func.add_value(block, Op::SliceMake, ty, &[p, l], 0, loc)
            }
            O::SlicePtr => {
                let a = self.arg(n, 0);
                self.func.add_value(block, Op::SlicePtr, ty, &[a], 0, loc)
            }
            O::SliceLen => {
                let a = self.arg(n, 0);
                self.func.add_value(block, Op::SliceLen, ty, &[a], 0, loc)
            }
            O::StringMake => {
                let (p, l) = (self.arg(n, 0), self.arg(n, 1));
                self.func
                    .add_value(block, Op::StringMake, ty, &[p, l], 0, loc)
            }
            O::StringPtr => {
                let a = self.arg(n, 0);
                self.func.add_value(block, Op::StringPtr, ty, &[a], 0, loc)
            }
            O::StringLen => {
                let a = self.arg(n, 0);
                self.func.add_value(block, Op::StringLen, ty, &[a], 0, loc)
            }

            O::Select => {
                let (c, a, b) = (self.arg(n, 0), self.arg(n, 1), self.arg(n, 2));
                self.func.add_value(block, Op::Select, ty, &[c, a, b], 0, loc)
            }
            O::Convert => {
                let a = self.arg(n, 0);
                self.func.add_value(block, Op::Convert, ty, &[a], 0, loc)
            }

            O::Entry => return Ok(()),
            O::Jump => {
                // Edges were connected up front; nothing to emit.
                return Ok(());
            }
            O::Branch => {
                let cond = self.arg(n, 0);
                self.func.blocks[block].kind = BlockKind::If;
                self.func.set_ctrl(block, cond);
                return Ok(());
            }
            O::Return => {
                self.func.blocks[block].kind = BlockKind::Ret;
                if !data.args.is_empty() {
                    let val = self.arg(n, 0);
                    if self.reg.is_by_ref_aggregate(self.ir.ret_ty) {
                        // The value argument is the source address; copy into
                        // the caller-provided buffer.
                        let rp = self.ret_ptr.ok_or_else(|| {
                            CodegenError::InternalInvariant {
                                phase: "ssa-build",
                                func: self.ir.name.clone(),
                                message: "aggregate return without a return pointer".into(),
                            }
                        })?;
                        let size = self.reg.size_of(self.ir.ret_ty) as i64;
                        self.func
                            .add_value(block, Op::Move, types::MEM, &[rp, val], size, loc);
                    } else if self.reg.is_two_reg_aggregate(self.ir.ret_ty)
                        && self.func.values[val].op == Op::Load
                    {
                        // A pair-sized aggregate returns in two registers;
                        // split the wide load into its halves.
                        let addr = self.func.values[val].args[0];
                        let lo = self.func.add_value(block, Op::Load, types::I64, &[addr], 0, loc);
                        let hia = self
                            .func
                            .add_value(block, Op::OffPtr, types::I64, &[addr], 8, loc);
                        let hi = self.func.add_value(block, Op::Load, types::I64, &[hia], 0, loc);
                        let pair = self
                            .func
                            .add_value(block, Op::SliceMake, types::TUPLE, &[lo, hi], 0, loc);
                        self.func.set_ctrl(block, pair);
                        if self.func.values[val].uses == 0 {
                            self.func.detach(val);
                        }
                    } else {
                        self.func.set_ctrl(block, val);
                    }
                }
                return Ok(());
            }
        };
        self.node_map.insert(n, v);
        Ok(())
    }

    /// The on-demand local read.
    fn read_local(&mut self, block: Block, local: ir::Local, ty: Type, loc: SourceLoc) -> Value {
        if let Some(&v) = self.defs.get(&(block, local)) {
            return v;
        }
        let preds = self.func.blocks[block].preds.clone();
        if preds.len() == 1 && self.translated[preds[0].index()] {
            let v = self.read_local(preds[0], local, ty, loc);
            self.defs.insert((block, local), v);
            return v;
        }
        if preds.is_empty() {
            // Entry, and nothing ever stored: the language zero-initializes.
            let v = self.zero_value(block, ty, loc);
            self.defs.insert((block, local), v);
            return v;
        }
        let v = self
            .func
            .add_value(block, Op::FwdRef, ty, &[], local.index() as i64, loc);
        self.defs.insert((block, local), v);
        self.fwdrefs.push(v);
        v
    }

    fn zero_value(&mut self, block: Block, ty: Type, loc: SourceLoc) -> Value {
        if ty == types::STR {
            let p = self.func.add_value(block, Op::ConstNil, types::I64, &[], 0, loc);
            let l = self.func.add_value(block, Op::ConstInt, types::I64, &[], 0, loc);
            self.func
                .add_value(block, Op::StringMake, types::STR, &[p, l], 0, loc)
        } else if ty == types::F32 || ty == types::F64 {
            self.func.add_value(block, Op::ConstFloat, ty, &[], 0, loc)
        } else {
            self.func.add_value(block, Op::ConstInt, ty, &[], 0, loc)
        }
    }

    /// The outgoing value of `local` from `block`, for phi arguments. May
    /// have to plant a new placeholder, which joins the worklist.
    fn lookup_outgoing(&mut self, block: Block, local: ir::Local, ty: Type) -> Value {
        if let Some(&v) = self.defs.get(&(block, local)) {
            return v;
        }
        if self.func.blocks[block].preds.is_empty() {
            let v = self.zero_value(block, ty, SourceLoc::default());
            self.defs.insert((block, local), v);
            return v;
        }
        let v = self.func.add_value(
            block,
            Op::FwdRef,
            ty,
            &[],
            local.index() as i64,
            SourceLoc::default(),
        );
        self.defs.insert((block, local), v);
        self.fwdrefs.push(v);
        v
    }

    /// Fixed-point resolution of placeholders into phis or copies.
    fn resolve_fwdrefs(&mut self) -> CodegenResult<()> {
        let mut guard = 0usize;
        while let Some(v) = self.fwdrefs.pop() {
            guard += 1;
            if guard > self.func.values.len() * 4 + 64 {
                return Err(CodegenError::InternalInvariant {
                    phase: "ssa-build",
                    func: self.ir.name.clone(),
                    message: "forward-reference resolution did not converge".into(),
                });
            }
            if self.func.values[v].op != Op::FwdRef {
                continue;
            }
            let block = self.func.values[v].block;
            let ty = self.func.values[v].ty;
            let local = ir::Local::from_u32(self.func.values[v].aux as u32);
            let preds = self.func.blocks[block].preds.clone();
            let mut args: SmallVec<[Value; 2]> = SmallVec::new();
            for p in preds {
                args.push(self.lookup_outgoing(p, local, ty));
            }
            // A phi fed the same value from every edge (itself aside) is a
            // copy of that value.
            let mut unique: Option<Value> = None;
            let mut trivial = true;
            for &a in &args {
                if a == v {
                    continue;
                }
                match unique {
                    None => unique = Some(a),
                    Some(u) if u == a => {}
                    Some(_) => {
                        trivial = false;
                        break;
                    }
                }
            }
            if trivial && unique.is_some() {
                self.func.values[v].op = Op::Copy;
                self.func.set_args(v, &[unique.unwrap()]);
            } else {
                self.func.values[v].op = Op::Phi;
                self.func.set_args(v, &args);
            }
        }
        Ok(())
    }

    /// Stable reorder so phis come first in every block.
    fn reorder_phis_first(&mut self) {
        let blocks: Vec<Block> = self.func.blocks.keys().collect();
        for b in blocks {
            let vals = std::mem::take(&mut self.func.blocks[b].values);
            let (phis, rest): (Vec<Value>, Vec<Value>) = vals
                .into_iter()
                .partition(|&v| self.func.values[v].op == Op::Phi);
            let mut out = phis;
            out.extend(rest);
            self.func.blocks[b].values = out;
        }
    }
}

fn binop(op: ir::Opcode) -> Op {
    match op {
        ir::Opcode::Add => Op::Add,
        ir::Opcode::Sub => Op::Sub,
        ir::Opcode::Mul => Op::Mul,
        ir::Opcode::Div => Op::Div,
        ir::Opcode::Rem => Op::Rem,
        ir::Opcode::And => Op::And,
        ir::Opcode::Or => Op::Or,
        ir::Opcode::Xor => Op::Xor,
        ir::Opcode::Shl => Op::Shl,
        ir::Opcode::Shr => Op::Shr,
        _ => unreachable!("not a binary op"),
    }
}

fn cmpop(op: ir::Opcode) -> Op {
    match op {
        ir::Opcode::Eq => Op::Eq,
        ir::Opcode::Ne => Op::Ne,
        ir::Opcode::Lt => Op::Lt,
        ir::Opcode::Le => Op::Le,
        ir::Opcode::Gt => Op::Gt,
        ir::Opcode::Ge => Op::Ge,
        _ => unreachable!("not a comparison"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder as IrBuilder, Opcode as O};
    use crate::ssa::verify;
    use crate::types;

    fn registry() -> TypeRegistry {
        TypeRegistry::new()
    }

    /// entry -> then|else -> merge, with `x` assigned a different constant
    /// on each arm: the merge must hold exactly one phi of arity two whose
    /// arguments follow predecessor order.
    #[test]
    fn diamond_gets_one_phi() {
        let reg = registry();
        let mut b = IrBuilder::new("d", types::I64);
        let x = b.declare_local("x", types::I64, 8, false);
        let then_b = b.create_block();
        let else_b = b.create_block();
        let merge_b = b.create_block();
        let c = b.ins0(O::ConstBool, types::BOOL, &[], 1);
        b.ins0(O::Branch, types::VOID, &[c], ir::pack_targets(then_b, else_b));
        b.switch_to_block(then_b);
        let one = b.ins0(O::ConstInt, types::I64, &[], 1);
        b.ins0(O::StoreLocal, types::I64, &[one], x.index() as i64);
        b.ins0(O::Jump, types::VOID, &[], merge_b.as_u32() as i64);
        b.switch_to_block(else_b);
        let two = b.ins0(O::ConstInt, types::I64, &[], 2);
        b.ins0(O::StoreLocal, types::I64, &[two], x.index() as i64);
        b.ins0(O::Jump, types::VOID, &[], merge_b.as_u32() as i64);
        b.switch_to_block(merge_b);
        let rd = b.ins0(O::LoadLocal, types::I64, &[], x.index() as i64);
        b.ins0(O::Return, types::VOID, &[rd], 0);
        let f = b.finish();

        let ssa = build(&f, &reg, Arch::Aarch64).unwrap();
        verify::verify(&ssa).unwrap();

        let merge = ssa.blocks.keys().nth(3).unwrap();
        let phis: Vec<Value> = ssa.blocks[merge]
            .values
            .iter()
            .copied()
            .filter(|&v| ssa.values[v].op == Op::Phi)
            .collect();
        assert_eq!(phis.len(), 1);
        let phi = phis[0];
        assert_eq!(ssa.values[phi].args.len(), 2);
        // Argument i corresponds to predecessor i.
        let preds = ssa.blocks[merge].preds.clone();
        for (i, &arg) in ssa.values[phi].args.iter().enumerate() {
            assert_eq!(ssa.values[arg].block, preds[i]);
        }
        let consts: Vec<i64> = ssa.values[phi]
            .args
            .iter()
            .map(|&a| ssa.values[a].aux)
            .collect();
        assert_eq!(consts, vec![1, 2]);
    }

    /// A loop that never reassigns `x` must not grow a phi for it.
    #[test]
    fn loop_invariant_local_collapses_to_copy() {
        let reg = registry();
        let mut b = IrBuilder::new("l", types::I64);
        let x = b.declare_local("x", types::I64, 8, false);
        let i = b.declare_local("i", types::I64, 8, false);
        let cond_b = b.create_block();
        let body_b = b.create_block();
        let exit_b = b.create_block();

        let seven = b.ins0(O::ConstInt, types::I64, &[], 7);
        b.ins0(O::StoreLocal, types::I64, &[seven], x.index() as i64);
        let zero = b.ins0(O::ConstInt, types::I64, &[], 0);
        b.ins0(O::StoreLocal, types::I64, &[zero], i.index() as i64);
        b.ins0(O::Jump, types::VOID, &[], cond_b.as_u32() as i64);

        b.switch_to_block(cond_b);
        let iv = b.ins0(O::LoadLocal, types::I64, &[], i.index() as i64);
        let ten = b.ins0(O::ConstInt, types::I64, &[], 10);
        let lt = b.ins0(O::Lt, types::BOOL, &[iv, ten], 0);
        b.ins0(O::Branch, types::VOID, &[lt], ir::pack_targets(body_b, exit_b));

        b.switch_to_block(body_b);
        let iv2 = b.ins0(O::LoadLocal, types::I64, &[], i.index() as i64);
        let one = b.ins0(O::ConstInt, types::I64, &[], 1);
        let inc = b.ins0(O::Add, types::I64, &[iv2, one], 0);
        b.ins0(O::StoreLocal, types::I64, &[inc], i.index() as i64);
        b.ins0(O::Jump, types::VOID, &[], cond_b.as_u32() as i64);

        b.switch_to_block(exit_b);
        let xv = b.ins0(O::LoadLocal, types::I64, &[], x.index() as i64);
        b.ins0(O::Return, types::VOID, &[xv], 0);
        let f = b.finish();

        let ssa = build(&f, &reg, Arch::Aarch64).unwrap();
        verify::verify(&ssa).unwrap();

        // `i` needs a phi in the loop header; `x` must not get one.
        let header = ssa.blocks.keys().nth(1).unwrap();
        let phis: Vec<Value> = ssa.blocks[header]
            .values
            .iter()
            .copied()
            .filter(|&v| ssa.values[v].op == Op::Phi)
            .collect();
        assert_eq!(phis.len(), 1, "only the induction variable gets a phi");
    }

    /// Parameter capture must be complete before any parameter is landed.
    #[test]
    fn params_capture_before_spill() {
        let mut reg = registry();
        let big = reg.declare_struct(
            "Big",
            vec![
                ("a".to_string(), types::I64),
                ("b".to_string(), types::I64),
                ("c".to_string(), types::I64),
            ],
        );
        let mut b = IrBuilder::new("f", types::VOID);
        let pa = b.declare_local("a", types::I64, 8, true);
        let ps = b.declare_local("s", types::STR, 16, true);
        let pb = b.declare_local("g", big, 24, true);
        b.func.params = vec![
            ir::Param { name: "a".into(), ty: types::I64, size: 8, local: pa },
            ir::Param { name: "s".into(), ty: types::STR, size: 16, local: ps },
            ir::Param { name: "g".into(), ty: big, size: 24, local: pb },
        ];
        b.ins0(O::Return, types::VOID, &[], 0);
        let f = b.finish();

        let ssa = build(&f, &reg, Arch::Aarch64).unwrap();
        verify::verify(&ssa).unwrap();
        let entry_vals = &ssa.blocks[ssa.entry].values;
        // x0 for `a`, x1/x2 for `s`, x3 for `g` by reference.
        let arg_regs: Vec<i64> = entry_vals
            .iter()
            .filter(|&&v| ssa.values[v].op == Op::Arg)
            .map(|&v| ssa.values[v].aux)
            .collect();
        assert_eq!(arg_regs, vec![0, 1, 2, 3]);
        // All captures precede the first store or move.
        let first_store = entry_vals
            .iter()
            .position(|&v| ssa.values[v].op.is_store())
            .unwrap();
        let last_arg = entry_vals
            .iter()
            .rposition(|&v| ssa.values[v].op == Op::Arg)
            .unwrap();
        assert!(last_arg < first_store);
    }
}
