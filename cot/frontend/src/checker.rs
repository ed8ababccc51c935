//! Name resolution and type checking.
//!
//! Two passes over the declarations: the first interns struct, enum, and
//! function signatures so bodies can reference anything declared anywhere in
//! the unit; the second checks every function body, caching a type per
//! expression node for the lowerer. All diagnostics accumulate in the shared
//! sink; checking continues past errors so one compile reports as much as
//! possible.

use crate::ast::*;
use cot_codegen::types::{self, Type, TypeData, TypeRegistry};
use cot_codegen::{Diagnostics, SourceLoc};
use hashbrown::HashMap;

/// A function signature, as the checker records it.
#[derive(Clone, Debug)]
pub struct FuncSig {
    /// Parameter types in order.
    pub params: Vec<Type>,
    /// Return type; `VOID` when none was written.
    pub ret: Type,
    /// Extern declarations have no body and become undefined symbols.
    pub is_extern: bool,
}

/// Everything the lowerer needs: the AST plus the checker's caches.
pub struct CheckedModule {
    /// The parsed unit.
    pub module: Module,
    /// The interned type registry; read-only from here on.
    pub registry: TypeRegistry,
    /// Per-expression types.
    pub node_types: HashMap<NodeId, Type>,
    /// Function signatures by name.
    pub funcs: HashMap<String, FuncSig>,
    /// Module-level globals by name.
    pub globals: HashMap<String, Type>,
    /// Named types (structs and enums).
    pub type_names: HashMap<String, Type>,
    /// Enum variant tags: (enum name, variant name) -> value.
    pub enum_tags: HashMap<(String, String), i64>,
}

/// Check `module`, producing the caches the lowerer consumes.
pub fn check(module: Module, diag: &Diagnostics) -> CheckedModule {
    let mut c = Checker {
        registry: TypeRegistry::new(),
        node_types: HashMap::new(),
        funcs: HashMap::new(),
        globals: HashMap::new(),
        type_names: HashMap::new(),
        enum_tags: HashMap::new(),
        scopes: Vec::new(),
        current_ret: types::VOID,
        diag,
    };
    c.collect(&module);
    for decl in &module.decls {
        if let Decl::Func {
            name,
            params,
            body,
            is_extern: false,
            ..
        } = decl
        {
            c.check_func(name, params, body);
        }
    }
    CheckedModule {
        module,
        registry: c.registry,
        node_types: c.node_types,
        funcs: c.funcs,
        globals: c.globals,
        type_names: c.type_names,
        enum_tags: c.enum_tags,
    }
}

struct Checker<'a> {
    registry: TypeRegistry,
    node_types: HashMap<NodeId, Type>,
    funcs: HashMap<String, FuncSig>,
    globals: HashMap<String, Type>,
    type_names: HashMap<String, Type>,
    enum_tags: HashMap<(String, String), i64>,
    scopes: Vec<HashMap<String, Type>>,
    current_ret: Type,
    diag: &'a Diagnostics,
}

impl<'a> Checker<'a> {
    /// First pass: intern every named type and signature.
    fn collect(&mut self, module: &Module) {
        // Structs and enums first, so signatures can use them. Structs that
        // reference structs declared later are rejected; declaration order
        // is the layout order.
        for decl in &module.decls {
            match decl {
                Decl::Struct { name, fields, loc } => {
                    let mut laid = Vec::with_capacity(fields.len());
                    for (fname, fty) in fields {
                        let t = self.resolve_type(fty, *loc);
                        laid.push((fname.clone(), t));
                    }
                    let ty = self.registry.declare_struct(name.clone(), laid);
                    self.type_names.insert(name.clone(), ty);
                }
                Decl::Enum { name, variants, loc } => {
                    if variants.is_empty() {
                        self.diag.error(*loc, format!("enum `{name}` has no variants"));
                    }
                    let ty = self
                        .registry
                        .declare_enum(name.clone(), variants.clone());
                    self.type_names.insert(name.clone(), ty);
                    for (i, v) in variants.iter().enumerate() {
                        self.enum_tags
                            .insert((name.clone(), v.clone()), i as i64);
                    }
                }
                _ => {}
            }
        }
        for decl in &module.decls {
            match decl {
                Decl::Func {
                    name,
                    params,
                    ret,
                    is_extern,
                    loc,
                    ..
                } => {
                    let ptys: Vec<Type> = params
                        .iter()
                        .map(|p| self.resolve_type(&p.ty, p.loc))
                        .collect();
                    let rty = ret
                        .as_ref()
                        .map(|t| self.resolve_type(t, *loc))
                        .unwrap_or(types::VOID);
                    if self.funcs.contains_key(name) {
                        self.diag
                            .error(*loc, format!("function `{name}` declared twice"));
                    }
                    self.funcs.insert(
                        name.clone(),
                        FuncSig {
                            params: ptys,
                            ret: rty,
                            is_extern: *is_extern,
                        },
                    );
                }
                Decl::Global { name, ty, loc } => {
                    let t = self.resolve_type(ty, *loc);
                    self.globals.insert(name.clone(), t);
                }
                _ => {}
            }
        }
    }

    fn resolve_type(&mut self, ty: &TypeExpr, loc: SourceLoc) -> Type {
        match ty {
            TypeExpr::Named(name) => match name.as_str() {
                "void" => types::VOID,
                "bool" => types::BOOL,
                "i8" => types::I8,
                "i16" => types::I16,
                "i32" => types::I32,
                "i64" => types::I64,
                "u8" => types::U8,
                "u16" => types::U16,
                "u32" => types::U32,
                "u64" => types::U64,
                "f32" => types::F32,
                "f64" => types::F64,
                "string" => types::STR,
                _ => {
                    if let Some(&t) = self.type_names.get(name) {
                        t
                    } else {
                        self.diag.error(loc, format!("unknown type `{name}`"));
                        types::VOID
                    }
                }
            },
            TypeExpr::Pointer(inner) => {
                let t = self.resolve_type(inner, loc);
                self.registry.pointer_to(t)
            }
            TypeExpr::Slice(inner) => {
                let t = self.resolve_type(inner, loc);
                self.registry.slice_of(t)
            }
            TypeExpr::Array(n, inner) => {
                let t = self.resolve_type(inner, loc);
                self.registry.array_of(t, *n)
            }
            TypeExpr::Func(params, ret) => {
                let ptys: Vec<Type> = params.iter().map(|p| self.resolve_type(p, loc)).collect();
                let rty = self.resolve_type(ret, loc);
                self.registry.func_type(ptys, rty)
            }
        }
    }

    //=========================================================================
    // Bodies

    fn check_func(&mut self, name: &str, params: &[ParamDecl], body: &[Stmt]) {
        let sig = self.funcs[name].clone();
        self.current_ret = sig.ret;
        self.scopes.push(HashMap::new());
        for (p, &t) in params.iter().zip(&sig.params) {
            self.declare_local(&p.name, t, p.loc);
        }
        self.check_block(body);
        self.scopes.pop();
    }

    fn declare_local(&mut self, name: &str, ty: Type, loc: SourceLoc) {
        let scope = self.scopes.last_mut().expect("inside a scope");
        if scope.contains_key(name) {
            self.diag
                .error(loc, format!("`{name}` is already declared in this scope"));
        }
        scope.insert(name.to_string(), ty);
    }

    fn lookup(&self, name: &str) -> Option<Type> {
        for scope in self.scopes.iter().rev() {
            if let Some(&t) = scope.get(name) {
                return Some(t);
            }
        }
        self.globals.get(name).copied()
    }

    fn check_block(&mut self, body: &[Stmt]) {
        self.scopes.push(HashMap::new());
        for stmt in body {
            self.check_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Local { name, ty, init } => {
                let declared = ty.as_ref().map(|t| self.resolve_type(t, stmt.loc));
                let inferred = init
                    .as_ref()
                    .map(|e| self.check_expr(e, declared));
                let final_ty = match (declared, inferred) {
                    (Some(d), Some(i)) => {
                        if d != i && i != types::VOID {
                            self.type_mismatch(stmt.loc, d, i);
                        }
                        d
                    }
                    (Some(d), None) => d,
                    (None, Some(i)) => i,
                    (None, None) => {
                        self.diag.error(
                            stmt.loc,
                            format!("`{name}` needs a type or an initializer"),
                        );
                        types::I64
                    }
                };
                // The lowerer reads the resolved declaration type back
                // through the statement's node id.
                self.node_types.insert(stmt.id, final_ty);
                self.declare_local(name, final_ty, stmt.loc);
            }
            StmtKind::Assign { target, value } => {
                let tty = self.check_assign_target(target);
                let vty = self.check_expr(value, Some(tty));
                if tty != vty && vty != types::VOID {
                    self.type_mismatch(stmt.loc, tty, vty);
                }
            }
            StmtKind::CompoundAssign { target, op, value } => {
                let tty = self.check_assign_target(target);
                if !self.registry.is_integer(tty) {
                    self.diag.error(
                        stmt.loc,
                        format!("`{op:?}=` needs an integer target"),
                    );
                }
                let vty = self.check_expr(value, Some(tty));
                if tty != vty {
                    self.type_mismatch(stmt.loc, tty, vty);
                }
            }
            StmtKind::Expr(e) => {
                self.check_expr(e, None);
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let cty = self.check_expr(cond, Some(types::BOOL));
                if cty != types::BOOL {
                    self.diag.error(cond.loc, "if condition must be a bool");
                }
                self.check_block(then_body);
                self.check_block(else_body);
            }
            StmtKind::While { cond, body } => {
                let cty = self.check_expr(cond, Some(types::BOOL));
                if cty != types::BOOL {
                    self.diag.error(cond.loc, "while condition must be a bool");
                }
                self.check_block(body);
            }
            StmtKind::For { name, iter, body } => {
                let ity = self.check_expr(iter, None);
                let elem = match self.registry.data(ity) {
                    TypeData::Array { elem, .. } | TypeData::Slice { elem } => *elem,
                    _ => {
                        self.diag
                            .error(iter.loc, "for loops iterate arrays and slices");
                        types::I64
                    }
                };
                self.scopes.push(HashMap::new());
                self.declare_local(name, elem, stmt.loc);
                for s in body {
                    self.check_stmt(s);
                }
                self.scopes.pop();
            }
            StmtKind::Return(value) => {
                match value {
                    Some(e) => {
                        let t = self.check_expr(e, Some(self.current_ret));
                        if t != self.current_ret {
                            self.type_mismatch(e.loc, self.current_ret, t);
                        }
                    }
                    None => {
                        if self.current_ret != types::VOID {
                            self.diag
                                .error(stmt.loc, "return value required");
                        }
                    }
                }
            }
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Defer(e) => {
                self.check_expr(e, None);
            }
        }
    }

    fn check_assign_target(&mut self, target: &Expr) -> Type {
        match &target.kind {
            ExprKind::Ident(_) | ExprKind::Field { .. } | ExprKind::Index { .. } => {
                self.check_expr(target, None)
            }
            _ => {
                self.diag
                    .error(target.loc, "expression cannot be assigned to");
                self.check_expr(target, None)
            }
        }
    }

    fn type_mismatch(&self, loc: SourceLoc, want: Type, got: Type) {
        self.diag.error(
            loc,
            format!(
                "type mismatch: expected {}, found {}",
                self.registry.display(want),
                self.registry.display(got)
            ),
        );
    }

    fn cache(&mut self, id: NodeId, ty: Type) -> Type {
        self.node_types.insert(id, ty);
        ty
    }

    fn check_expr(&mut self, e: &Expr, expect: Option<Type>) -> Type {
        let ty = self.check_expr_inner(e, expect);
        self.cache(e.id, ty)
    }

    fn check_expr_inner(&mut self, e: &Expr, expect: Option<Type>) -> Type {
        match &e.kind {
            ExprKind::Int(_) => match expect {
                Some(t) if self.registry.is_integer(t) && t != types::BOOL => t,
                _ => types::I64,
            },
            ExprKind::Float(_) => match expect {
                Some(types::F32) => types::F32,
                _ => types::F64,
            },
            ExprKind::Bool(_) => types::BOOL,
            ExprKind::Str(_) => types::STR,
            ExprKind::Nil => match expect {
                Some(t) if matches!(self.registry.data(t), TypeData::Pointer { .. }) => t,
                _ => {
                    let t = self.registry.pointer_to(types::U8);
                    t
                }
            },
            ExprKind::Ident(name) => {
                if let Some(t) = self.lookup(name) {
                    return t;
                }
                if let Some(sig) = self.funcs.get(name) {
                    // A function name in value position is a function
                    // pointer.
                    let (params, ret) = (sig.params.clone(), sig.ret);
                    return self.registry.func_type(params, ret);
                }
                self.diag
                    .error(e.loc, format!("unknown identifier `{name}`"));
                types::I64
            }
            ExprKind::Binary { op, lhs, rhs } => {
                use BinOp::*;
                match op {
                    And | Or => {
                        let l = self.check_expr(lhs, Some(types::BOOL));
                        let r = self.check_expr(rhs, Some(types::BOOL));
                        if l != types::BOOL || r != types::BOOL {
                            self.diag.error(e.loc, "logical operators need bools");
                        }
                        types::BOOL
                    }
                    Eq | Ne | Lt | Le | Gt | Ge => {
                        let l = self.check_expr(lhs, None);
                        let r = self.check_expr(rhs, Some(l));
                        if l != r {
                            self.type_mismatch(e.loc, l, r);
                        }
                        // Comparisons work on scalar operands only; string
                        // and aggregate equality are not operations the
                        // backend carries.
                        if !self.registry.is_integer(l)
                            && !matches!(self.registry.data(l), TypeData::Pointer { .. })
                            && l != types::F32
                            && l != types::F64
                        {
                            self.diag
                                .error(e.loc, "comparison needs scalar operands");
                        }
                        types::BOOL
                    }
                    _ => {
                        let hint = expect.filter(|&t| self.registry.is_integer(t));
                        let l = self.check_expr(lhs, hint);
                        let r = self.check_expr(rhs, Some(l));
                        if l != r {
                            self.type_mismatch(e.loc, l, r);
                        }
                        if l == types::STR && *op == Add {
                            // String concatenation rides on `+`.
                            return types::STR;
                        }
                        if !self.registry.is_integer(l) && l != types::F32 && l != types::F64 {
                            self.diag
                                .error(e.loc, "arithmetic needs integer operands");
                        }
                        l
                    }
                }
            }
            ExprKind::Unary { op, operand } => match op {
                UnOp::Neg => self.check_expr(operand, expect),
                UnOp::Not => {
                    let t = self.check_expr(operand, Some(types::BOOL));
                    if t != types::BOOL {
                        self.diag.error(e.loc, "`!` needs a bool");
                    }
                    types::BOOL
                }
            },
            ExprKind::Call { callee, args } => {
                // The len builtin.
                if let ExprKind::Ident(name) = &callee.kind {
                    if name == "len" {
                        if args.len() != 1 {
                            self.diag.error(e.loc, "len takes one argument");
                            return types::I64;
                        }
                        let t = self.check_expr(&args[0], None);
                        match self.registry.data(t) {
                            TypeData::Array { .. } | TypeData::Slice { .. } => {}
                            _ if t == types::STR => {}
                            _ => {
                                self.diag
                                    .error(e.loc, "len works on strings, slices, and arrays");
                            }
                        }
                        return types::I64;
                    }
                    if let Some(sig) = self.funcs.get(name).cloned() {
                        self.check_call_args(e.loc, &sig.params, args);
                        return sig.ret;
                    }
                }
                // Indirect call through a function-typed value.
                let cty = self.check_expr(callee, None);
                if let TypeData::Func { params, ret } = self.registry.data(cty).clone() {
                    self.check_call_args(e.loc, &params, args);
                    ret
                } else {
                    self.diag.error(callee.loc, "call of a non-function");
                    for a in args {
                        self.check_expr(a, None);
                    }
                    types::VOID
                }
            }
            ExprKind::Field { base, name } => {
                // Enum variant reference: `Color.Red`.
                if let ExprKind::Ident(tyname) = &base.kind {
                    if let Some(&t) = self.type_names.get(tyname) {
                        if matches!(self.registry.data(t), TypeData::Enum { .. }) {
                            if !self.enum_tags.contains_key(&(tyname.clone(), name.clone())) {
                                self.diag.error(
                                    e.loc,
                                    format!("enum `{tyname}` has no variant `{name}`"),
                                );
                            }
                            self.cache(base.id, t);
                            return t;
                        }
                    }
                }
                let bty = self.check_expr(base, None);
                // Fields resolve through one level of pointer.
                let sty = match self.registry.data(bty) {
                    TypeData::Pointer { elem } => *elem,
                    _ => bty,
                };
                match self.registry.field_of(sty, name) {
                    Some((_, _, t)) => t,
                    None => {
                        self.diag.error(
                            e.loc,
                            format!(
                                "no field `{name}` on {}",
                                self.registry.display(sty)
                            ),
                        );
                        types::I64
                    }
                }
            }
            ExprKind::Index { base, index } => {
                let bty = self.check_expr(base, None);
                let ity = self.check_expr(index, Some(types::I64));
                if !self.registry.is_integer(ity) {
                    self.diag.error(index.loc, "index must be an integer");
                }
                match self.registry.element_of(bty) {
                    Some(t) => t,
                    None => {
                        self.diag.error(base.loc, "only arrays and slices index");
                        types::I64
                    }
                }
            }
            ExprKind::StructLit { name, fields } => {
                let Some(&t) = self.type_names.get(name) else {
                    self.diag.error(e.loc, format!("unknown struct `{name}`"));
                    return types::VOID;
                };
                for (fname, fe) in fields {
                    match self.registry.field_of(t, fname) {
                        Some((_, _, ft)) => {
                            let et = self.check_expr(fe, Some(ft));
                            if et != ft {
                                self.type_mismatch(fe.loc, ft, et);
                            }
                        }
                        None => {
                            self.diag.error(
                                fe.loc,
                                format!("no field `{fname}` on {name}"),
                            );
                            self.check_expr(fe, None);
                        }
                    }
                }
                t
            }
            ExprKind::ArrayLit(elems) => {
                let elem_hint = expect.and_then(|t| self.registry.element_of(t));
                let mut elem_ty = elem_hint;
                for el in elems {
                    let t = self.check_expr(el, elem_ty);
                    if let Some(want) = elem_ty {
                        if t != want {
                            self.type_mismatch(el.loc, want, t);
                        }
                    } else {
                        elem_ty = Some(t);
                    }
                }
                let elem = elem_ty.unwrap_or(types::I64);
                self.registry.array_of(elem, elems.len() as u64)
            }
        }
    }

    fn check_call_args(&mut self, loc: SourceLoc, params: &[Type], args: &[Expr]) {
        if params.len() != args.len() {
            self.diag.error(
                loc,
                format!("expected {} arguments, found {}", params.len(), args.len()),
            );
        }
        for (a, &p) in args.iter().zip(params) {
            let t = self.check_expr(a, Some(p));
            if t != p {
                self.type_mismatch(a.loc, p, t);
            }
        }
        for a in args.iter().skip(params.len()) {
            self.check_expr(a, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn check_src(src: &str) -> (CheckedModule, Diagnostics) {
        let diag = Diagnostics::new();
        let m = parser::parse(src, &diag);
        let checked = check(m, &diag);
        (checked, diag)
    }

    #[test]
    fn accepts_the_basics() {
        let (_, diag) = check_src(
            "struct P { x: i64, y: i64 }
             fn add(a: i64, b: i64) i64 { return a + b }
             fn main() i64 {
                 var p: P
                 p.x = 20
                 p.y = 22
                 let s = \"hello\"
                 return add(p.x, p.y) + len(s) - 5
             }",
        );
        assert!(!diag.has_errors(), "{:?}", diag.take());
    }

    #[test]
    fn rejects_unknown_identifier() {
        let (_, diag) = check_src("fn main() i64 { return missing }");
        assert!(diag.has_errors());
    }

    #[test]
    fn rejects_type_mismatch() {
        let (_, diag) = check_src("fn main() i64 { let s = \"x\" return s }");
        assert!(diag.has_errors());
    }

    #[test]
    fn rejects_bad_condition() {
        let (_, diag) = check_src("fn main() i64 { if 1 { return 0 } return 1 }");
        assert!(diag.has_errors());
    }

    #[test]
    fn caches_node_types() {
        let (checked, diag) = check_src("fn main() i64 { return 40 + 2 }");
        assert!(!diag.has_errors());
        assert!(
            checked
                .node_types
                .values()
                .any(|&t| t == types::I64)
        );
    }
}
