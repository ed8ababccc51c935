//! Lowering the checked AST to named-local IR.
//!
//! Statements lower block-first: `if` routes through then/else/merge blocks,
//! `while` through cond/body/exit, and `for` desugars into an index/length
//! loop. Expressions lower bottom-up. Reads and writes of promotable locals
//! stay named (`LoadLocal` / `StoreLocal`); aggregates go through explicit
//! address arithmetic and memory operations.
//!
//! Deferred expressions ride a per-function stack. Every exit path from a
//! scope replays the pending defers in LIFO order down to the depth captured
//! at scope entry; `return` evaluates its operand before any defer runs.

use crate::ast::*;
use crate::checker::CheckedModule;
use cot_codegen::error::{CodegenError, CodegenResult};
use cot_codegen::entity::EntityRef;
use cot_codegen::ir::{self, Builder, Opcode as O};
use cot_codegen::types::{self, Type, TypeData};
use cot_codegen::{Diagnostics, SourceLoc};
use hashbrown::HashMap;

/// Lower every non-extern function of the checked module. Extern
/// declarations produce body-less IR functions so the driver can skip them
/// while still seeing their names.
pub fn lower(checked: &CheckedModule, diag: &Diagnostics) -> CodegenResult<Vec<ir::Function>> {
    let mut out = Vec::new();
    for decl in &checked.module.decls {
        if let Decl::Func {
            name,
            params,
            body,
            is_extern,
            ..
        } = decl
        {
            if *is_extern {
                let sig = &checked.funcs[name];
                let mut f = ir::Function::new(name.clone(), sig.ret);
                f.is_extern = true;
                out.push(f);
                continue;
            }
            log::debug!("lowering `{name}`");
            let mut lf = LowerFunc::new(checked, diag, name);
            lf.lower_body(params, body)?;
            out.push(lf.b.finish());
        }
    }
    Ok(out)
}

struct LoopCtx {
    continue_blk: ir::BlockId,
    break_blk: ir::BlockId,
    defer_depth: usize,
}

struct LowerFunc<'a> {
    checked: &'a CheckedModule,
    diag: &'a Diagnostics,
    b: Builder,
    /// Lexical scopes mapping names to local slots.
    scopes: Vec<HashMap<String, (ir::Local, Type)>>,
    defers: Vec<Expr>,
    loops: Vec<LoopCtx>,
    /// Set once the current block has been terminated; statements after
    /// that point in the same block are unreachable and skipped.
    terminated: bool,
    ret_ty: Type,
}

impl<'a> LowerFunc<'a> {
    fn new(checked: &'a CheckedModule, diag: &'a Diagnostics, name: &str) -> Self {
        let ret_ty = checked.funcs[name].ret;
        Self {
            checked,
            diag,
            b: Builder::new(name, ret_ty),
            scopes: Vec::new(),
            defers: Vec::new(),
            loops: Vec::new(),
            terminated: false,
            ret_ty,
        }
    }

    fn reg(&self) -> &cot_codegen::types::TypeRegistry {
        &self.checked.registry
    }

    /// The checker's cached type for an expression node.
    fn ty_of(&self, e: &Expr) -> CodegenResult<Type> {
        self.checked.node_types.get(&e.id).copied().ok_or_else(|| {
            CodegenError::Source {
                loc: e.loc,
                message: "missing type for expression".into(),
            }
        })
    }

    fn fatal(&self, loc: SourceLoc, message: impl Into<String>) -> CodegenError {
        let message = message.into();
        self.diag.error(loc, message.clone());
        CodegenError::Source { loc, message }
    }

    /// Can this type live as an SSA value, or does it need memory?
    fn is_promotable(&self, ty: Type) -> bool {
        if ty == types::STR {
            return true;
        }
        match self.reg().data(ty) {
            TypeData::Slice { .. } => true,
            TypeData::Struct { .. } | TypeData::Array { .. } => false,
            _ => self.reg().size_of(ty) <= 8,
        }
    }

    fn declare_local(&mut self, name: &str, ty: Type, is_param: bool) -> ir::Local {
        let size = self.reg().size_of(ty);
        let local = self.b.declare_local(name, ty, size, is_param);
        self.scopes
            .last_mut()
            .expect("inside a scope")
            .insert(name.to_string(), (local, ty));
        local
    }

    fn lookup(&self, name: &str) -> Option<(ir::Local, Type)> {
        for scope in self.scopes.iter().rev() {
            if let Some(&entry) = scope.get(name) {
                return Some(entry);
            }
        }
        None
    }

    //=========================================================================
    // Function body

    fn lower_body(&mut self, params: &[ParamDecl], body: &[Stmt]) -> CodegenResult<()> {
        self.scopes.push(HashMap::new());
        let name = self.b.func.name.clone();
        let sig = self.checked.funcs[&name].clone();
        for (p, &ty) in params.iter().zip(&sig.params) {
            let local = self.declare_local(&p.name, ty, true);
            self.b.func.params.push(ir::Param {
                name: p.name.clone(),
                ty,
                size: self.reg().size_of(ty),
                local,
            });
        }
        self.lower_block(body)?;
        self.scopes.pop();
        if !self.terminated {
            // Fell off the end; void functions return implicitly, anything
            // else returns zero.
            self.run_defers_down_to(0)?;
            if self.ret_ty == types::VOID {
                self.b.ins0(O::Return, types::VOID, &[], 0);
            } else {
                let z = self.b.ins0(O::ConstInt, self.ret_ty, &[], 0);
                self.b.ins0(O::Return, types::VOID, &[z], 0);
            }
        }
        Ok(())
    }

    fn lower_block(&mut self, body: &[Stmt]) -> CodegenResult<()> {
        self.scopes.push(HashMap::new());
        let defer_base = self.defers.len();
        for stmt in body {
            if self.terminated {
                break;
            }
            self.lower_stmt(stmt)?;
        }
        if !self.terminated {
            self.run_defers_down_to(defer_base)?;
        }
        self.defers.truncate(defer_base);
        self.scopes.pop();
        Ok(())
    }

    /// Replay pending defers, newest first, down to `depth`. The stack is
    /// not popped; other exit paths need the same entries.
    fn run_defers_down_to(&mut self, depth: usize) -> CodegenResult<()> {
        for i in (depth..self.defers.len()).rev() {
            let e = self.defers[i].clone();
            self.lower_expr(&e)?;
        }
        Ok(())
    }

    //=========================================================================
    // Statements

    fn lower_stmt(&mut self, stmt: &Stmt) -> CodegenResult<()> {
        self.b.set_loc(stmt.loc);
        match &stmt.kind {
            StmtKind::Local { name, init, .. } => {
                let ty = self
                    .checked
                    .node_types
                    .get(&stmt.id)
                    .copied()
                    .ok_or_else(|| self.fatal(stmt.loc, format!("unresolved type for `{name}`")))?;
                self.lower_local(name, ty, init)
            }
            StmtKind::Assign { target, value } => {
                let tty = self.ty_of(target)?;
                if self.is_promotable(tty) {
                    let v = self.lower_expr(value)?;
                    self.lower_store_to(target, v)
                } else {
                    self.lower_aggregate_assign(target, value, tty)
                }
            }
            StmtKind::CompoundAssign { target, op, value } => {
                // Expanded to load-op-store.
                let cur = self.lower_expr(target)?;
                let rhs = self.lower_expr(value)?;
                let ty = self.ty_of(target)?;
                let combined = self.b.ins0(binop_opcode(*op), ty, &[cur, rhs], 0);
                self.lower_store_to(target, combined)
            }
            StmtKind::Expr(e) => {
                self.lower_expr(e)?;
                Ok(())
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let c = self.lower_expr(cond)?;
                let then_blk = self.b.create_block();
                let else_blk = self.b.create_block();
                let merge_blk = if else_body.is_empty() {
                    else_blk
                } else {
                    self.b.create_block()
                };
                self.b
                    .ins0(O::Branch, types::VOID, &[c], ir::pack_targets(then_blk, else_blk));

                self.b.switch_to_block(then_blk);
                self.terminated = false;
                self.lower_block(then_body)?;
                if !self.terminated {
                    self.b
                        .ins0(O::Jump, types::VOID, &[], merge_blk.as_u32() as i64);
                }

                if !else_body.is_empty() {
                    self.b.switch_to_block(else_blk);
                    self.terminated = false;
                    self.lower_block(else_body)?;
                    if !self.terminated {
                        self.b
                            .ins0(O::Jump, types::VOID, &[], merge_blk.as_u32() as i64);
                    }
                }

                self.b.switch_to_block(merge_blk);
                self.terminated = false;
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let cond_blk = self.b.create_block();
                let body_blk = self.b.create_block();
                let exit_blk = self.b.create_block();
                self.b
                    .ins0(O::Jump, types::VOID, &[], cond_blk.as_u32() as i64);

                self.b.switch_to_block(cond_blk);
                self.terminated = false;
                let c = self.lower_expr(cond)?;
                self.b
                    .ins0(O::Branch, types::VOID, &[c], ir::pack_targets(body_blk, exit_blk));

                self.b.switch_to_block(body_blk);
                self.terminated = false;
                self.loops.push(LoopCtx {
                    continue_blk: cond_blk,
                    break_blk: exit_blk,
                    defer_depth: self.defers.len(),
                });
                self.lower_block(body)?;
                self.loops.pop();
                if !self.terminated {
                    self.b
                        .ins0(O::Jump, types::VOID, &[], cond_blk.as_u32() as i64);
                }

                self.b.switch_to_block(exit_blk);
                self.terminated = false;
                Ok(())
            }
            StmtKind::For { name, iter, body } => self.lower_for(stmt.loc, name, iter, body),
            StmtKind::Return(value) => {
                // The value is evaluated before any defer runs.
                let v = match value {
                    Some(e) => Some(self.lower_expr(e)?),
                    None => None,
                };
                self.run_defers_down_to(0)?;
                match v {
                    Some(v) => self.b.ins0(O::Return, types::VOID, &[v], 0),
                    None => self.b.ins0(O::Return, types::VOID, &[], 0),
                };
                self.terminated = true;
                Ok(())
            }
            StmtKind::Break => {
                let Some(ctx) = self.loops.last() else {
                    return Err(self.fatal(stmt.loc, "`break` outside of a loop"));
                };
                let (blk, depth) = (ctx.break_blk, ctx.defer_depth);
                self.run_defers_down_to(depth)?;
                self.b.ins0(O::Jump, types::VOID, &[], blk.as_u32() as i64);
                self.terminated = true;
                Ok(())
            }
            StmtKind::Continue => {
                let Some(ctx) = self.loops.last() else {
                    return Err(self.fatal(stmt.loc, "`continue` outside of a loop"));
                };
                let (blk, depth) = (ctx.continue_blk, ctx.defer_depth);
                self.run_defers_down_to(depth)?;
                self.b.ins0(O::Jump, types::VOID, &[], blk.as_u32() as i64);
                self.terminated = true;
                Ok(())
            }
            StmtKind::Defer(e) => {
                self.defers.push(e.clone());
                Ok(())
            }
        }
    }

    fn lower_local(&mut self, name: &str, ty: Type, init: &Option<Expr>) -> CodegenResult<()> {
        let local = self.declare_local(name, ty, false);

        let Some(init) = init else {
            // Zero initialization for uninitialized promotable locals;
            // aggregates start as uninitialized stack memory.
            if self.is_promotable(ty) {
                let z = self.zero_of(ty);
                self.b
                    .ins0(O::StoreLocal, ty, &[z], local.index() as i64);
            }
            return Ok(());
        };

        if self.is_promotable(ty) {
            let v = self.lower_expr(init)?;
            self.b
                .ins0(O::StoreLocal, ty, &[v], local.index() as i64);
            return Ok(());
        }
        let dst = self
            .b
            .ins0(O::LocalAddr, types::I64, &[], local.index() as i64);
        self.write_aggregate(dst, ty, init)
    }

    /// Route an aggregate rvalue into memory at `dst`. Literal initializers
    /// write field by field; calls store through the hidden return pointer
    /// convention; everything else is a bulk copy from the source address.
    fn write_aggregate(&mut self, dst: ir::Node, ty: Type, value: &Expr) -> CodegenResult<()> {
        match &value.kind {
            ExprKind::StructLit { .. } | ExprKind::ArrayLit(_) => {
                self.init_aggregate_at(dst, ty, value)
            }
            ExprKind::Call { .. } => {
                let v = self.lower_expr(value)?;
                self.b.ins0(O::Store, types::VOID, &[dst, v], 0);
                Ok(())
            }
            _ => {
                let src = self.addr_of(value)?;
                let size = self.reg().size_of(ty);
                self.b.ins0(O::Move, types::VOID, &[dst, src], size as i64);
                Ok(())
            }
        }
    }

    fn lower_aggregate_assign(
        &mut self,
        target: &Expr,
        value: &Expr,
        ty: Type,
    ) -> CodegenResult<()> {
        let dst = self.addr_of(target)?;
        self.write_aggregate(dst, ty, value)
    }

    fn zero_of(&mut self, ty: Type) -> ir::Node {
        if ty == types::STR {
            let p = self.b.ins0(O::ConstNil, types::I64, &[], 0);
            let l = self.b.ins0(O::ConstInt, types::I64, &[], 0);
            self.b.ins0(O::StringMake, types::STR, &[p, l], 0)
        } else if ty == types::F32 || ty == types::F64 {
            self.b.ins0(O::ConstFloat, ty, &[], 0)
        } else if matches!(self.reg().data(ty), TypeData::Slice { .. }) {
            let p = self.b.ins0(O::ConstNil, types::I64, &[], 0);
            let l = self.b.ins0(O::ConstInt, types::I64, &[], 0);
            self.b.ins0(O::SliceMake, ty, &[p, l], 0)
        } else {
            self.b.ins0(O::ConstInt, ty, &[], 0)
        }
    }

    fn stride_of(&self, elem: Type) -> u32 {
        let sz = self.reg().size_of(elem);
        let al = self.reg().align_of(elem).max(1);
        sz.div_ceil(al) * al
    }

    fn lower_for(
        &mut self,
        loc: SourceLoc,
        name: &str,
        iter: &Expr,
        body: &[Stmt],
    ) -> CodegenResult<()> {
        let ity = self.ty_of(iter)?;
        let (elem, stride) = match self.reg().data(ity) {
            TypeData::Array { elem, .. } | TypeData::Slice { elem } => {
                (*elem, self.stride_of(*elem))
            }
            _ => return Err(self.fatal(loc, "for loops iterate arrays and slices")),
        };

        // Hidden index and limit locals, then the usual loop skeleton. The
        // limit is a compile-time constant for arrays and a slice_len read
        // for slices.
        self.scopes.push(HashMap::new());
        let idx = self.declare_local(&format!("{name}#idx"), types::I64, false);
        let zero = self.b.ins0(O::ConstInt, types::I64, &[], 0);
        self.b
            .ins0(O::StoreLocal, types::I64, &[zero], idx.index() as i64);

        let array_len = match self.reg().data(ity) {
            TypeData::Array { len, .. } => Some(*len),
            _ => None,
        };
        let (base_ptr, limit) = match array_len {
            Some(len) => {
                let base = self.addr_of(iter)?;
                let n = self.b.ins0(O::ConstInt, types::I64, &[], len as i64);
                (base, n)
            }
            None => {
                let s = self.lower_expr(iter)?;
                let p = self.b.ins0(O::SlicePtr, types::I64, &[s], 0);
                let l = self.b.ins0(O::SliceLen, types::I64, &[s], 0);
                (p, l)
            }
        };
        // The base and limit have to survive the loop in locals; blocks
        // downstream cannot reference nodes across an unsealed path.
        let base_l = self.declare_local(&format!("{name}#ptr"), types::I64, false);
        self.b
            .ins0(O::StoreLocal, types::I64, &[base_ptr], base_l.index() as i64);
        let limit_l = self.declare_local(&format!("{name}#len"), types::I64, false);
        self.b
            .ins0(O::StoreLocal, types::I64, &[limit], limit_l.index() as i64);

        let cond_blk = self.b.create_block();
        let body_blk = self.b.create_block();
        let incr_blk = self.b.create_block();
        let exit_blk = self.b.create_block();
        self.b
            .ins0(O::Jump, types::VOID, &[], cond_blk.as_u32() as i64);

        self.b.switch_to_block(cond_blk);
        let iv = self
            .b
            .ins0(O::LoadLocal, types::I64, &[], idx.index() as i64);
        let lv = self
            .b
            .ins0(O::LoadLocal, types::I64, &[], limit_l.index() as i64);
        let c = self.b.ins0(O::Lt, types::BOOL, &[iv, lv], 0);
        self.b
            .ins0(O::Branch, types::VOID, &[c], ir::pack_targets(body_blk, exit_blk));

        self.b.switch_to_block(body_blk);
        self.terminated = false;
        // Bind the element: x = base[idx].
        let elem_local = self.declare_local(name, elem, false);
        let bv = self
            .b
            .ins0(O::LoadLocal, types::I64, &[], base_l.index() as i64);
        let iv2 = self
            .b
            .ins0(O::LoadLocal, types::I64, &[], idx.index() as i64);
        let slot = self
            .b
            .ins0(O::IndexPtr, types::I64, &[bv, iv2], stride as i64);
        if self.is_promotable(elem) {
            let v = self.b.ins0(O::Load, elem, &[slot], 0);
            self.b
                .ins0(O::StoreLocal, elem, &[v], elem_local.index() as i64);
        } else {
            let dst = self
                .b
                .ins0(O::LocalAddr, types::I64, &[], elem_local.index() as i64);
            let size = self.reg().size_of(elem);
            self.b
                .ins0(O::Move, types::VOID, &[dst, slot], size as i64);
        }

        self.loops.push(LoopCtx {
            continue_blk: incr_blk,
            break_blk: exit_blk,
            defer_depth: self.defers.len(),
        });
        self.lower_block(body)?;
        self.loops.pop();
        if !self.terminated {
            self.b
                .ins0(O::Jump, types::VOID, &[], incr_blk.as_u32() as i64);
        }

        self.b.switch_to_block(incr_blk);
        self.terminated = false;
        let iv3 = self
            .b
            .ins0(O::LoadLocal, types::I64, &[], idx.index() as i64);
        let one = self.b.ins0(O::ConstInt, types::I64, &[], 1);
        let next = self.b.ins0(O::Add, types::I64, &[iv3, one], 0);
        self.b
            .ins0(O::StoreLocal, types::I64, &[next], idx.index() as i64);
        self.b
            .ins0(O::Jump, types::VOID, &[], cond_blk.as_u32() as i64);

        self.b.switch_to_block(exit_blk);
        self.terminated = false;
        self.scopes.pop();
        Ok(())
    }

    //=========================================================================
    // Stores and addresses

    fn lower_store_to(&mut self, target: &Expr, value: ir::Node) -> CodegenResult<()> {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some((local, ty)) = self.lookup(name) {
                    debug_assert!(self.is_promotable(ty), "aggregate assign takes the move path");
                    self.b
                        .ins0(O::StoreLocal, ty, &[value], local.index() as i64);
                    return Ok(());
                }
                if self.checked.globals.contains_key(name) {
                    self.b.func.note_global(name);
                    let addr =
                        self.b
                            .ins(O::GlobalAddr, types::I64, &[], 0, Some(name.clone()));
                    self.b.ins0(O::Store, types::VOID, &[addr, value], 0);
                    return Ok(());
                }
                Err(self.fatal(target.loc, format!("unknown identifier `{name}`")))
            }
            ExprKind::Field { base, name } => {
                let bty = self.ty_of(base)?;
                let sty = match self.reg().data(bty) {
                    TypeData::Pointer { elem } => *elem,
                    _ => bty,
                };
                let (_, off, _) = self
                    .reg()
                    .field_of(sty, name)
                    .ok_or_else(|| self.fatal(target.loc, format!("missing field `{name}`")))?;
                let base_addr = self.base_address(base)?;
                self.b
                    .ins0(O::FieldStore, types::VOID, &[base_addr, value], off as i64);
                Ok(())
            }
            ExprKind::Index { base, index } => {
                let slot = self.index_address(base, index)?;
                self.b.ins0(O::Store, types::VOID, &[slot, value], 0);
                Ok(())
            }
            _ => Err(self.fatal(target.loc, "expression cannot be assigned to")),
        }
    }

    /// Address of an lvalue.
    fn addr_of(&mut self, e: &Expr) -> CodegenResult<ir::Node> {
        match &e.kind {
            ExprKind::Ident(name) => {
                if let Some((local, _)) = self.lookup(name) {
                    return Ok(self
                        .b
                        .ins0(O::LocalAddr, types::I64, &[], local.index() as i64));
                }
                if self.checked.globals.contains_key(name) {
                    self.b.func.note_global(name);
                    return Ok(self.b.ins(
                        O::GlobalAddr,
                        types::I64,
                        &[],
                        0,
                        Some(name.clone()),
                    ));
                }
                Err(self.fatal(e.loc, format!("unknown identifier `{name}`")))
            }
            ExprKind::Field { base, name } => {
                let bty = self.ty_of(base)?;
                let sty = match self.reg().data(bty) {
                    TypeData::Pointer { elem } => *elem,
                    _ => bty,
                };
                let (_, off, _) = self
                    .reg()
                    .field_of(sty, name)
                    .ok_or_else(|| self.fatal(e.loc, format!("missing field `{name}`")))?;
                let base_addr = self.base_address(base)?;
                Ok(self
                    .b
                    .ins0(O::OffPtr, types::I64, &[base_addr], off as i64))
            }
            ExprKind::Index { base, index } => self.index_address(base, index),
            _ => Err(self.fatal(e.loc, "expression has no address")),
        }
    }

    /// The address a field access resolves against: pointers load their
    /// value, aggregates take their own address.
    fn base_address(&mut self, base: &Expr) -> CodegenResult<ir::Node> {
        let bty = self.ty_of(base)?;
        if matches!(self.reg().data(bty), TypeData::Pointer { .. }) {
            self.lower_expr(base)
        } else {
            self.addr_of(base)
        }
    }

    fn index_address(&mut self, base: &Expr, index: &Expr) -> CodegenResult<ir::Node> {
        let bty = self.ty_of(base)?;
        let idx = self.lower_expr(index)?;
        match self.reg().data(bty).clone() {
            TypeData::Array { elem, .. } => {
                let stride = self.stride_of(elem);
                let b = self.addr_of(base)?;
                Ok(self
                    .b
                    .ins0(O::IndexPtr, types::I64, &[b, idx], stride as i64))
            }
            TypeData::Slice { elem } => {
                let stride = self.stride_of(elem);
                let s = self.lower_expr(base)?;
                let p = self.b.ins0(O::SlicePtr, types::I64, &[s], 0);
                Ok(self
                    .b
                    .ins0(O::IndexPtr, types::I64, &[p, idx], stride as i64))
            }
            _ => Err(self.fatal(base.loc, "only arrays and slices index")),
        }
    }

    //=========================================================================
    // Expressions

    fn lower_expr(&mut self, e: &Expr) -> CodegenResult<ir::Node> {
        self.b.set_loc(e.loc);
        let ty = self.ty_of(e)?;
        match &e.kind {
            ExprKind::Int(n) => Ok(self.b.ins0(O::ConstInt, ty, &[], *n)),
            ExprKind::Float(x) => Ok(self
                .b
                .ins0(O::ConstFloat, ty, &[], x.to_bits() as i64)),
            ExprKind::Bool(v) => Ok(self.b.ins0(O::ConstBool, ty, &[], i64::from(*v))),
            ExprKind::Nil => Ok(self.b.ins0(O::ConstNil, ty, &[], 0)),
            ExprKind::Str(s) => {
                let idx = self.b.func.intern_string(s);
                Ok(self.b.ins0(O::ConstStr, types::STR, &[], idx))
            }
            ExprKind::Ident(name) => {
                if let Some((local, lty)) = self.lookup(name) {
                    if self.is_promotable(lty) {
                        return Ok(self
                            .b
                            .ins0(O::LoadLocal, lty, &[], local.index() as i64));
                    }
                    // Aggregates read as a wide load; call expansion turns
                    // the load back into an address when it feeds a call.
                    let addr = self
                        .b
                        .ins0(O::LocalAddr, types::I64, &[], local.index() as i64);
                    return Ok(self.b.ins0(O::Load, lty, &[addr], 0));
                }
                if self.checked.globals.contains_key(name) {
                    self.b.func.note_global(name);
                    let addr =
                        self.b
                            .ins(O::GlobalAddr, types::I64, &[], 0, Some(name.clone()));
                    return Ok(self.b.ins0(O::Load, ty, &[addr], 0));
                }
                if self.checked.funcs.contains_key(name) {
                    return Ok(self
                        .b
                        .ins(O::FuncAddr, ty, &[], 0, Some(name.clone())));
                }
                Err(self.fatal(e.loc, format!("unknown identifier `{name}`")))
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(e, *op, lhs, rhs),
            ExprKind::Unary { op, operand } => {
                if ty == types::F32 || ty == types::F64 {
                    return Err(CodegenError::Unsupported {
                        loc: e.loc,
                        message: "floating-point arithmetic".into(),
                    });
                }
                let v = self.lower_expr(operand)?;
                let opcode = match op {
                    UnOp::Neg => O::Neg,
                    UnOp::Not => O::Not,
                };
                Ok(self.b.ins0(opcode, ty, &[v], 0))
            }
            ExprKind::Call { callee, args } => self.lower_call(e, callee, args),
            ExprKind::Field { base, name } => {
                // Enum variant constant.
                if let ExprKind::Ident(tyname) = &base.kind {
                    if let Some(&tag) = self
                        .checked
                        .enum_tags
                        .get(&(tyname.clone(), name.clone()))
                    {
                        return Ok(self.b.ins0(O::ConstInt, ty, &[], tag));
                    }
                }
                let bty = self.ty_of(base)?;
                let sty = match self.reg().data(bty) {
                    TypeData::Pointer { elem } => *elem,
                    _ => bty,
                };
                let (_, off, fty) = self
                    .reg()
                    .field_of(sty, name)
                    .ok_or_else(|| self.fatal(e.loc, format!("missing field `{name}`")))?;
                let base_addr = self.base_address(base)?;
                Ok(self.b.ins0(O::FieldLoad, fty, &[base_addr], off as i64))
            }
            ExprKind::Index { base, index } => {
                let slot = self.index_address(base, index)?;
                Ok(self.b.ins0(O::Load, ty, &[slot], 0))
            }
            ExprKind::StructLit { .. } | ExprKind::ArrayLit(_) => {
                // An aggregate literal outside a declaration initializer
                // lands in a hidden temporary, then reads back as a value.
                let tmp = self.declare_local("#lit", ty, false);
                let base = self
                    .b
                    .ins0(O::LocalAddr, types::I64, &[], tmp.index() as i64);
                self.init_aggregate_at(base, ty, e)?;
                let addr = self
                    .b
                    .ins0(O::LocalAddr, types::I64, &[], tmp.index() as i64);
                Ok(self.b.ins0(O::Load, ty, &[addr], 0))
            }
        }
    }

    fn init_aggregate_at(&mut self, base: ir::Node, ty: Type, e: &Expr) -> CodegenResult<()> {
        match &e.kind {
            ExprKind::StructLit { fields, .. } => {
                for (fname, fe) in fields {
                    let (_, off, _) = self
                        .reg()
                        .field_of(ty, fname)
                        .ok_or_else(|| self.fatal(fe.loc, format!("missing field `{fname}`")))?;
                    let v = self.lower_expr(fe)?;
                    self.b
                        .ins0(O::FieldStore, types::VOID, &[base, v], off as i64);
                }
                Ok(())
            }
            ExprKind::ArrayLit(elems) => {
                let elem = self
                    .reg()
                    .element_of(ty)
                    .ok_or_else(|| self.fatal(e.loc, "array initializer for non-array"))?;
                let stride = self.stride_of(elem);
                for (i, el) in elems.iter().enumerate() {
                    let v = self.lower_expr(el)?;
                    let slot = self
                        .b
                        .ins0(O::OffPtr, types::I64, &[base], (i as i64) * stride as i64);
                    self.b.ins0(O::Store, types::VOID, &[slot, v], 0);
                }
                Ok(())
            }
            _ => Err(self.fatal(e.loc, "not an aggregate literal")),
        }
    }

    fn lower_binary(
        &mut self,
        e: &Expr,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CodegenResult<ir::Node> {
        let ty = self.ty_of(e)?;
        let lty = self.ty_of(lhs)?;
        if lty == types::F32 || lty == types::F64 {
            return Err(CodegenError::Unsupported {
                loc: e.loc,
                message: "floating-point arithmetic".into(),
            });
        }
        match op {
            BinOp::And => {
                // select(a, b, false); both sides evaluate.
                let a = self.lower_expr(lhs)?;
                let b = self.lower_expr(rhs)?;
                let f = self.b.ins0(O::ConstBool, types::BOOL, &[], 0);
                Ok(self.b.ins0(O::Select, types::BOOL, &[a, b, f], 0))
            }
            BinOp::Or => {
                let a = self.lower_expr(lhs)?;
                let t = self.b.ins0(O::ConstBool, types::BOOL, &[], 1);
                let b = self.lower_expr(rhs)?;
                Ok(self.b.ins0(O::Select, types::BOOL, &[a, t, b], 0))
            }
            BinOp::Add if lty == types::STR => {
                let a = self.lower_expr(lhs)?;
                let b = self.lower_expr(rhs)?;
                Ok(self.b.ins0(O::StringConcat, types::STR, &[a, b], 0))
            }
            _ => {
                let a = self.lower_expr(lhs)?;
                let b = self.lower_expr(rhs)?;
                Ok(self.b.ins0(binop_opcode(op), ty, &[a, b], 0))
            }
        }
    }

    fn lower_call(&mut self, e: &Expr, callee: &Expr, args: &[Expr]) -> CodegenResult<ir::Node> {
        let ty = self.ty_of(e)?;
        if let ExprKind::Ident(name) = &callee.kind {
            if name == "len" {
                return self.lower_len(&args[0]);
            }
            if self.checked.funcs.contains_key(name) {
                let mut ops = Vec::with_capacity(args.len());
                for a in args {
                    ops.push(self.lower_call_arg(a)?);
                }
                return Ok(self
                    .b
                    .ins(O::Call, ty, &ops, 0, Some(name.clone())));
            }
        }
        // Function pointer call.
        let f = self.lower_expr(callee)?;
        let mut ops = vec![f];
        for a in args {
            ops.push(self.lower_call_arg(a)?);
        }
        Ok(self.b.ins0(O::CallIndirect, ty, &ops, 0))
    }

    /// A call argument. Large aggregates pass by reference to their
    /// storage, so an aggregate produced by a nested call has to land in a
    /// hidden temporary first.
    fn lower_call_arg(&mut self, a: &Expr) -> CodegenResult<ir::Node> {
        let aty = self.ty_of(a)?;
        if (self.reg().is_by_ref_aggregate(aty) || self.reg().is_two_reg_aggregate(aty))
            && matches!(a.kind, ExprKind::Call { .. } | ExprKind::StructLit { .. } | ExprKind::ArrayLit(_))
        {
            let tmp = self.declare_local("#arg", aty, false);
            let dst = self
                .b
                .ins0(O::LocalAddr, types::I64, &[], tmp.index() as i64);
            self.write_aggregate(dst, aty, a)?;
            let addr = self
                .b
                .ins0(O::LocalAddr, types::I64, &[], tmp.index() as i64);
            return Ok(self.b.ins0(O::Load, aty, &[addr], 0));
        }
        self.lower_expr(a)
    }

    fn lower_len(&mut self, arg: &Expr) -> CodegenResult<ir::Node> {
        let aty = self.ty_of(arg)?;
        if aty == types::STR {
            let s = self.lower_expr(arg)?;
            return Ok(self.b.ins0(O::StringLen, types::I64, &[s], 0));
        }
        match self.reg().data(aty) {
            TypeData::Array { len, .. } => {
                let n = *len as i64;
                Ok(self.b.ins0(O::ConstInt, types::I64, &[], n))
            }
            TypeData::Slice { .. } => {
                let s = self.lower_expr(arg)?;
                Ok(self.b.ins0(O::SliceLen, types::I64, &[s], 0))
            }
            _ => Err(self.fatal(arg.loc, "len works on strings, slices, and arrays")),
        }
    }
}

fn binop_opcode(op: BinOp) -> O {
    match op {
        BinOp::Add => O::Add,
        BinOp::Sub => O::Sub,
        BinOp::Mul => O::Mul,
        BinOp::Div => O::Div,
        BinOp::Rem => O::Rem,
        BinOp::Eq => O::Eq,
        BinOp::Ne => O::Ne,
        BinOp::Lt => O::Lt,
        BinOp::Le => O::Le,
        BinOp::Gt => O::Gt,
        BinOp::Ge => O::Ge,
        BinOp::And => O::And,
        BinOp::Or => O::Or,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{checker, parser};

    fn lower_src(src: &str) -> Vec<ir::Function> {
        let diag = Diagnostics::new();
        let m = parser::parse(src, &diag);
        let checked = checker::check(m, &diag);
        assert!(!diag.has_errors(), "{:?}", diag.take());
        lower(&checked, &diag).unwrap()
    }

    #[test]
    fn while_loop_shapes_four_blocks() {
        let fs = lower_src(
            "fn main() i64 { var i: i64 = 0; while i < 10 { i = i + 1 } return i + 32 }",
        );
        // entry, cond, body, exit
        assert_eq!(fs[0].blocks.len(), 4);
        let term_ops: Vec<O> = fs[0]
            .blocks
            .keys()
            .filter_map(|b| fs[0].terminator(b))
            .map(|n| fs[0].nodes[n].op)
            .collect();
        assert_eq!(
            term_ops,
            vec![O::Jump, O::Branch, O::Jump, O::Return]
        );
    }

    #[test]
    fn string_literal_interned_once() {
        let fs = lower_src(
            "fn main() i64 { let s = \"hello\"; let t = \"hello\"; return len(s) + len(t) }",
        );
        assert_eq!(fs[0].strings, vec!["hello".to_string()]);
    }

    #[test]
    fn compound_assign_expands_to_load_op_store() {
        let fs = lower_src("fn main() i64 { var i: i64 = 1; i += 2; return i }");
        let ops: Vec<O> = fs[0].nodes.values().map(|n| n.op).collect();
        let loads = ops.iter().filter(|&&o| o == O::LoadLocal).count();
        let adds = ops.iter().filter(|&&o| o == O::Add).count();
        assert!(loads >= 1 && adds == 1);
    }

    #[test]
    fn defer_runs_before_return_after_value() {
        let fs = lower_src(
            "extern fn note(n: i64)
             fn main() i64 { defer note(1) return 40 + 2 }",
        );
        let f = fs.iter().find(|f| f.name == "main").unwrap();
        let ops: Vec<O> = f.nodes.values().map(|n| n.op).collect();
        // The add happens before the deferred call.
        let add_at = ops.iter().position(|&o| o == O::Add).unwrap();
        let call_at = ops.iter().position(|&o| o == O::Call).unwrap();
        assert!(add_at < call_at, "return value evaluates before defers");
    }

    #[test]
    fn extern_produces_no_body() {
        let fs = lower_src("extern fn write(fd: i64, p: *u8, n: i64) i64");
        assert!(fs[0].is_extern);
        assert!(fs[0].nodes.is_empty());
    }

    #[test]
    fn struct_fields_write_through_offsets() {
        let fs = lower_src(
            "struct P { x: i64, y: i64 }
             fn main() i64 { var p: P; p.x = 20; p.y = 22; return p.x + p.y }",
        );
        let f = &fs[0];
        let stores: Vec<i64> = f
            .nodes
            .values()
            .filter(|n| n.op == O::FieldStore)
            .map(|n| n.aux)
            .collect();
        assert_eq!(stores, vec![0, 8]);
    }
}
