//! The recursive-descent parser.
//!
//! Grammar notes: semicolons between statements are optional because every
//! statement form is self-delimiting; struct literals are forbidden in
//! condition position so `if x { .. }` stays unambiguous.

use crate::ast::*;
use crate::lexer::{Lexer, Token};
use cot_codegen::{Diagnostics, SourceLoc};

/// Parse a whole compilation unit. Errors land in `diag`; the returned
/// module covers everything parsed before the first hard failure.
pub fn parse(src: &str, diag: &Diagnostics) -> Module {
    let mut p = Parser::new(src, diag);
    p.module()
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    tok: Token,
    loc: SourceLoc,
    diag: &'a Diagnostics,
    next_id: u32,
    /// Struct literals are disabled while parsing a condition.
    no_struct_lit: bool,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, diag: &'a Diagnostics) -> Self {
        let mut p = Self {
            lexer: Lexer::new(src),
            tok: Token::Eof,
            loc: SourceLoc::default(),
            diag,
            next_id: 0,
            no_struct_lit: false,
        };
        p.bump();
        p
    }

    fn bump(&mut self) {
        match self.lexer.next_token() {
            Ok((t, l)) => {
                self.tok = t;
                self.loc = l;
            }
            Err((msg, l)) => {
                self.diag.error(l, msg);
                self.tok = Token::Eof;
                self.loc = l;
            }
        }
    }

    fn fresh_id(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId(self.next_id)
    }

    fn expr_node(&mut self, loc: SourceLoc, kind: ExprKind) -> Expr {
        Expr {
            id: self.fresh_id(),
            loc,
            kind,
        }
    }

    fn eat(&mut self, want: &Token) -> bool {
        if &self.tok == want {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, want: &Token) {
        if !self.eat(want) {
            self.diag
                .error(self.loc, format!("expected {want}, found {}", self.tok));
            // Skip one token so errors don't loop forever.
            if self.tok != Token::Eof {
                self.bump();
            }
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(&self.tok, Token::Ident(s) if s == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> String {
        if let Token::Ident(s) = self.tok.clone() {
            self.bump();
            s
        } else {
            self.diag
                .error(self.loc, format!("expected a name, found {}", self.tok));
            String::new()
        }
    }

    //=========================================================================
    // Declarations

    fn module(&mut self) -> Module {
        let mut m = Module::default();
        while self.tok != Token::Eof {
            if let Some(d) = self.decl() {
                m.decls.push(d);
            }
        }
        m
    }

    fn decl(&mut self) -> Option<Decl> {
        let loc = self.loc;
        if self.eat_kw("extern") {
            if !self.is_kw("fn") {
                self.diag.error(self.loc, "expected `fn` after `extern`");
                self.bump();
                return None;
            }
            self.bump();
            return Some(self.func_decl(loc, true));
        }
        if self.eat_kw("fn") {
            return Some(self.func_decl(loc, false));
        }
        if self.eat_kw("struct") {
            let name = self.ident();
            self.expect(&Token::LBrace);
            let mut fields = Vec::new();
            while self.tok != Token::RBrace && self.tok != Token::Eof {
                let fname = self.ident();
                self.expect(&Token::Colon);
                let fty = self.type_expr();
                fields.push((fname, fty));
                self.eat(&Token::Comma);
            }
            self.expect(&Token::RBrace);
            return Some(Decl::Struct { name, fields, loc });
        }
        if self.eat_kw("enum") {
            let name = self.ident();
            self.expect(&Token::LBrace);
            let mut variants = Vec::new();
            while self.tok != Token::RBrace && self.tok != Token::Eof {
                variants.push(self.ident());
                self.eat(&Token::Comma);
            }
            self.expect(&Token::RBrace);
            return Some(Decl::Enum { name, variants, loc });
        }
        if self.eat_kw("var") {
            let name = self.ident();
            self.expect(&Token::Colon);
            let ty = self.type_expr();
            self.eat(&Token::Semi);
            return Some(Decl::Global { name, ty, loc });
        }
        self.diag
            .error(self.loc, format!("expected a declaration, found {}", self.tok));
        self.bump();
        None
    }

    fn func_decl(&mut self, loc: SourceLoc, is_extern: bool) -> Decl {
        let name = self.ident();
        self.expect(&Token::LParen);
        let mut params = Vec::new();
        while self.tok != Token::RParen && self.tok != Token::Eof {
            let ploc = self.loc;
            let pname = self.ident();
            self.expect(&Token::Colon);
            let pty = self.type_expr();
            params.push(ParamDecl {
                name: pname,
                ty: pty,
                loc: ploc,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen);
        let ret = if self.tok != Token::LBrace
            && self.tok != Token::Eof
            && !(is_extern && matches!(self.tok, Token::Ident(_)) && self.peek_is_decl_start())
        {
            Some(self.type_expr())
        } else {
            None
        };
        let body = if is_extern {
            self.eat(&Token::Semi);
            Vec::new()
        } else {
            self.block()
        };
        Decl::Func {
            name,
            params,
            ret,
            body,
            is_extern,
            loc,
        }
    }

    /// Is the current identifier a declaration keyword? Used to spot the
    /// end of an extern declaration with no return type.
    fn peek_is_decl_start(&self) -> bool {
        matches!(&self.tok, Token::Ident(s) if matches!(s.as_str(), "fn" | "extern" | "struct" | "enum" | "var"))
    }

    fn type_expr(&mut self) -> TypeExpr {
        if self.eat(&Token::Star) {
            return TypeExpr::Pointer(Box::new(self.type_expr()));
        }
        if self.eat(&Token::LBracket) {
            if self.eat(&Token::RBracket) {
                return TypeExpr::Slice(Box::new(self.type_expr()));
            }
            let n = if let Token::Int(n) = self.tok {
                self.bump();
                n as u64
            } else {
                self.diag.error(self.loc, "expected an array length");
                0
            };
            self.expect(&Token::RBracket);
            return TypeExpr::Array(n, Box::new(self.type_expr()));
        }
        if self.is_kw("fn") {
            self.bump();
            self.expect(&Token::LParen);
            let mut params = Vec::new();
            while self.tok != Token::RParen && self.tok != Token::Eof {
                params.push(self.type_expr());
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen);
            let ret = if matches!(self.tok, Token::Ident(_)) || self.tok == Token::Star {
                self.type_expr()
            } else {
                TypeExpr::Named("void".into())
            };
            return TypeExpr::Func(params, Box::new(ret));
        }
        TypeExpr::Named(self.ident())
    }

    //=========================================================================
    // Statements

    fn block(&mut self) -> Vec<Stmt> {
        self.expect(&Token::LBrace);
        let mut out = Vec::new();
        while self.tok != Token::RBrace && self.tok != Token::Eof {
            out.push(self.stmt());
            self.eat(&Token::Semi);
        }
        self.expect(&Token::RBrace);
        out
    }

    fn stmt(&mut self) -> Stmt {
        let loc = self.loc;
        if self.eat_kw("let") {
            let name = self.ident();
            let ty = if self.eat(&Token::Colon) {
                Some(self.type_expr())
            } else {
                None
            };
            self.expect(&Token::Assign);
            let init = self.expr();
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::Local {
                    name,
                    ty,
                    init: Some(init),
                },
            };
        }
        if self.eat_kw("var") {
            let name = self.ident();
            let ty = if self.eat(&Token::Colon) {
                Some(self.type_expr())
            } else {
                None
            };
            let init = if self.eat(&Token::Assign) {
                Some(self.expr())
            } else {
                None
            };
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::Local { name, ty, init },
            };
        }
        if self.eat_kw("if") {
            let cond = self.cond_expr();
            let then_body = self.block();
            let else_body = if self.eat_kw("else") {
                if self.is_kw("if") {
                    vec![self.stmt()]
                } else {
                    self.block()
                }
            } else {
                Vec::new()
            };
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::If {
                    cond,
                    then_body,
                    else_body,
                },
            };
        }
        if self.eat_kw("while") {
            let cond = self.cond_expr();
            let body = self.block();
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::While { cond, body },
            };
        }
        if self.eat_kw("for") {
            let name = self.ident();
            if !self.eat_kw("in") {
                self.diag.error(self.loc, "expected `in` in for loop");
            }
            let iter = self.cond_expr();
            let body = self.block();
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::For { name, iter, body },
            };
        }
        if self.eat_kw("return") {
            let value = if self.tok == Token::RBrace
                || self.tok == Token::Semi
                || self.tok == Token::Eof
            {
                None
            } else {
                Some(self.expr())
            };
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::Return(value),
            };
        }
        if self.eat_kw("break") {
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::Break,
            };
        }
        if self.eat_kw("continue") {
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::Continue,
            };
        }
        if self.eat_kw("defer") {
            let e = self.expr();
            return Stmt {
                id: self.fresh_id(),
                loc,
                kind: StmtKind::Defer(e),
            };
        }

        // Expression, assignment, or compound assignment.
        let target = self.expr();
        let op = match self.tok {
            Token::Assign => None,
            Token::PlusAssign => Some(BinOp::Add),
            Token::MinusAssign => Some(BinOp::Sub),
            Token::StarAssign => Some(BinOp::Mul),
            Token::SlashAssign => Some(BinOp::Div),
            _ => {
                return Stmt {
                    id: self.fresh_id(),
                    loc,
                    kind: StmtKind::Expr(target),
                };
            }
        };
        self.bump();
        let value = self.expr();
        Stmt {
            id: self.fresh_id(),
            loc,
            kind: match op {
                None => StmtKind::Assign { target, value },
                Some(op) => StmtKind::CompoundAssign { target, op, value },
            },
        }
    }

    //=========================================================================
    // Expressions

    /// A condition: struct literals disabled so `{` starts the body.
    fn cond_expr(&mut self) -> Expr {
        let saved = self.no_struct_lit;
        self.no_struct_lit = true;
        let e = self.expr();
        self.no_struct_lit = saved;
        e
    }

    fn expr(&mut self) -> Expr {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Expr {
        let mut lhs = self.and_expr();
        while self.tok == Token::OrOr {
            let loc = self.loc;
            self.bump();
            let rhs = self.and_expr();
            lhs = self.expr_node(
                loc,
                ExprKind::Binary {
                    op: BinOp::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
        lhs
    }

    fn and_expr(&mut self) -> Expr {
        let mut lhs = self.cmp_expr();
        while self.tok == Token::AndAnd {
            let loc = self.loc;
            self.bump();
            let rhs = self.cmp_expr();
            lhs = self.expr_node(
                loc,
                ExprKind::Binary {
                    op: BinOp::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
        lhs
    }

    fn cmp_expr(&mut self) -> Expr {
        let lhs = self.add_expr();
        let op = match self.tok {
            Token::Eq => BinOp::Eq,
            Token::NotEq => BinOp::Ne,
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            _ => return lhs,
        };
        let loc = self.loc;
        self.bump();
        let rhs = self.add_expr();
        self.expr_node(
            loc,
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        )
    }

    fn add_expr(&mut self) -> Expr {
        let mut lhs = self.mul_expr();
        loop {
            let op = match self.tok {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => return lhs,
            };
            let loc = self.loc;
            self.bump();
            let rhs = self.mul_expr();
            lhs = self.expr_node(
                loc,
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
    }

    fn mul_expr(&mut self) -> Expr {
        let mut lhs = self.unary_expr();
        loop {
            let op = match self.tok {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
                _ => return lhs,
            };
            let loc = self.loc;
            self.bump();
            let rhs = self.unary_expr();
            lhs = self.expr_node(
                loc,
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
    }

    fn unary_expr(&mut self) -> Expr {
        let loc = self.loc;
        if self.eat(&Token::Minus) {
            let e = self.unary_expr();
            return self.expr_node(
                loc,
                ExprKind::Unary {
                    op: UnOp::Neg,
                    operand: Box::new(e),
                },
            );
        }
        if self.eat(&Token::Not) {
            let e = self.unary_expr();
            return self.expr_node(
                loc,
                ExprKind::Unary {
                    op: UnOp::Not,
                    operand: Box::new(e),
                },
            );
        }
        self.postfix_expr()
    }

    fn postfix_expr(&mut self) -> Expr {
        let mut e = self.primary_expr();
        loop {
            let loc = self.loc;
            if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                let saved = self.no_struct_lit;
                self.no_struct_lit = false;
                while self.tok != Token::RParen && self.tok != Token::Eof {
                    args.push(self.expr());
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.no_struct_lit = saved;
                self.expect(&Token::RParen);
                e = self.expr_node(
                    loc,
                    ExprKind::Call {
                        callee: Box::new(e),
                        args,
                    },
                );
            } else if self.eat(&Token::Dot) {
                let name = self.ident();
                e = self.expr_node(
                    loc,
                    ExprKind::Field {
                        base: Box::new(e),
                        name,
                    },
                );
            } else if self.eat(&Token::LBracket) {
                let saved = self.no_struct_lit;
                self.no_struct_lit = false;
                let idx = self.expr();
                self.no_struct_lit = saved;
                self.expect(&Token::RBracket);
                e = self.expr_node(
                    loc,
                    ExprKind::Index {
                        base: Box::new(e),
                        index: Box::new(idx),
                    },
                );
            } else {
                return e;
            }
        }
    }

    fn primary_expr(&mut self) -> Expr {
        let loc = self.loc;
        match self.tok.clone() {
            Token::Int(n) => {
                self.bump();
                self.expr_node(loc, ExprKind::Int(n))
            }
            Token::Float(x) => {
                self.bump();
                self.expr_node(loc, ExprKind::Float(x))
            }
            Token::Str(s) => {
                self.bump();
                self.expr_node(loc, ExprKind::Str(s))
            }
            Token::LParen => {
                self.bump();
                let e = self.expr();
                self.expect(&Token::RParen);
                e
            }
            Token::LBracket => {
                self.bump();
                let mut elems = Vec::new();
                while self.tok != Token::RBracket && self.tok != Token::Eof {
                    elems.push(self.expr());
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBracket);
                self.expr_node(loc, ExprKind::ArrayLit(elems))
            }
            Token::Ident(name) => {
                self.bump();
                match name.as_str() {
                    "true" => return self.expr_node(loc, ExprKind::Bool(true)),
                    "false" => return self.expr_node(loc, ExprKind::Bool(false)),
                    "nil" => return self.expr_node(loc, ExprKind::Nil),
                    _ => {}
                }
                if self.tok == Token::LBrace && !self.no_struct_lit {
                    self.bump();
                    let mut fields = Vec::new();
                    while self.tok != Token::RBrace && self.tok != Token::Eof {
                        let fname = self.ident();
                        self.expect(&Token::Colon);
                        fields.push((fname, self.expr()));
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RBrace);
                    return self.expr_node(loc, ExprKind::StructLit { name, fields });
                }
                self.expr_node(loc, ExprKind::Ident(name))
            }
            t => {
                self.diag
                    .error(loc, format!("expected an expression, found {t}"));
                self.bump();
                self.expr_node(loc, ExprKind::Int(0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Module {
        let diag = Diagnostics::new();
        let m = parse(src, &diag);
        assert!(!diag.has_errors(), "unexpected parse errors");
        m
    }

    #[test]
    fn parses_fib() {
        let m = parse_ok(
            "fn fib(n: i64) i64 { if n < 2 { return n } return fib(n-1) + fib(n-2) }
             fn main() i64 { return fib(10) }",
        );
        assert_eq!(m.decls.len(), 2);
        let Decl::Func { name, params, body, .. } = &m.decls[0] else {
            panic!("expected a function");
        };
        assert_eq!(name, "fib");
        assert_eq!(params.len(), 1);
        assert!(matches!(body[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn parses_while_with_optional_semis() {
        let m = parse_ok("fn main() i64 { var i: i64 = 0; while i < 10 { i = i + 1 } return i + 32 }");
        let Decl::Func { body, .. } = &m.decls[0] else {
            panic!()
        };
        assert_eq!(body.len(), 3);
        assert!(matches!(body[1].kind, StmtKind::While { .. }));
    }

    #[test]
    fn parses_struct_decl_and_field_assign() {
        let m = parse_ok(
            "struct P { x: i64, y: i64 }
             fn main() i64 { var p: P; p.x = 20; p.y = 22; return p.x + p.y }",
        );
        assert!(matches!(m.decls[0], Decl::Struct { .. }));
        let Decl::Func { body, .. } = &m.decls[1] else {
            panic!()
        };
        assert!(matches!(
            body[1].kind,
            StmtKind::Assign { .. }
        ));
    }

    #[test]
    fn parses_extern_and_defer() {
        let m = parse_ok(
            "extern fn __print_int(n: i64)
             fn main() i64 { defer __print_int(1) return 0 }",
        );
        let Decl::Func { is_extern, .. } = &m.decls[0] else {
            panic!()
        };
        assert!(*is_extern);
    }

    #[test]
    fn struct_literals_stay_out_of_conditions() {
        let m = parse_ok("fn f(x: bool) i64 { if x { return 1 } return 0 }");
        let Decl::Func { body, .. } = &m.decls[0] else {
            panic!()
        };
        assert!(matches!(body[0].kind, StmtKind::If { .. }));
    }
}
