//! Parser: token stream to arena AST
//!
//! Recursive descent for statements and declarations, Pratt-style binding
//! powers for expressions. Desugarings applied here so the emitter only
//! sees primitive forms:
//!
//! - `unless c; a; else; b; end` ⇒ `if c; b; else; a; end`
//! - `until c; …; end` ⇒ `while !c; …; end`
//! - `for x in e; …; end` ⇒ `x = nil; e.each { |t| x = t; … }` — the
//!   loop variable is declared in the enclosing scope first, which is
//!   what makes it outlive the loop (unlike a bare block parameter)
//! - `&:sym` ⇒ `{ |v| v.sym }` attached as the call's block
//! - `{ key: v }` ⇒ `{ :key => v }`
//! - modifier `if`/`unless`/`while`/`until` ⇒ the statement form
//!
//! Errors carry expected-vs-got token descriptions with the source
//! position of the offending token.

use crate::ast::*;
use crate::token::{Kw, StrPiece, Token, TokenKind};
use bumpalo::Bump;
use ruse_core::ErrorInfo;

pub struct Parser<'a, 't> {
    arena: &'a Bump,
    tokens: &'t [Token],
    pos: usize,
    filename: String,
    tmp_counter: u32,
}

/// Parse a full program (the token stream must end with `Eof`).
pub fn parse_program<'a>(
    arena: &'a Bump,
    tokens: &[Token],
    filename: &str,
) -> Result<&'a [P<'a>], ErrorInfo> {
    let mut parser = Parser {
        arena,
        tokens,
        pos: 0,
        filename: filename.to_string(),
        tmp_counter: 0,
    };
    let body = parser.parse_body(&|k| matches!(k, TokenKind::Eof))?;
    parser.expect_eof()?;
    Ok(body)
}

// Binding powers, loosest to tightest. Each entry is (left, right); a
// right-assoc operator has right < left.
const BP_TERNARY: (u8, u8) = (3, 2);
const BP_RANGE: (u8, u8) = (5, 6);
const BP_OR: (u8, u8) = (7, 8);
const BP_AND: (u8, u8) = (9, 10);
const BP_EQUALITY: (u8, u8) = (11, 12);
const BP_COMPARE: (u8, u8) = (13, 14);
const BP_BITOR: (u8, u8) = (15, 16);
const BP_BITAND: (u8, u8) = (17, 18);
const BP_SHIFT: (u8, u8) = (19, 20);
const BP_ADD: (u8, u8) = (21, 22);
const BP_MUL: (u8, u8) = (23, 24);
const BP_POW: (u8, u8) = (28, 27);

impl<'a, 't> Parser<'a, 't> {
    // ---- token plumbing ----

    fn peek(&self) -> &'t Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &'t TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, offset: usize) -> &'t TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> &'t Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        self.eat(&TokenKind::Kw(kw))
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<&'t Token, ErrorInfo> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.err_expected(what))
        }
    }

    fn expect_eof(&mut self) -> Result<(), ErrorInfo> {
        self.skip_terms();
        if matches!(self.peek_kind(), TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.err_expected("end of input"))
        }
    }

    fn err_expected(&self, what: &str) -> ErrorInfo {
        let tok = self.peek();
        ErrorInfo::syntax(
            format!("expected {what}, got {}", tok.kind.describe()),
            &self.filename,
            tok.line,
            tok.col,
        )
    }

    fn err_at(&self, message: impl Into<String>) -> ErrorInfo {
        let tok = self.peek();
        ErrorInfo::syntax(message, &self.filename, tok.line, tok.col)
    }

    /// Skip newlines only (significant inside bracketed forms).
    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline) {
            self.advance();
        }
    }

    /// Skip statement terminators (newlines and semicolons).
    fn skip_terms(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semi) {
            self.advance();
        }
    }

    // ---- arena helpers ----

    fn node(&self, expr: Expr<'a>, line: u32) -> P<'a> {
        self.arena.alloc(Node { expr, line })
    }

    fn text(&self, s: &str) -> &'a str {
        self.arena.alloc_str(s)
    }

    fn nodes(&self, items: Vec<P<'a>>) -> &'a [P<'a>] {
        self.arena.alloc_slice_fill_iter(items)
    }

    fn fresh_tmp(&mut self, stem: &str) -> &'a str {
        let n = self.tmp_counter;
        self.tmp_counter += 1;
        self.text(&format!("__{stem}{n}"))
    }

    // ---- statements ----

    fn parse_body(
        &mut self,
        stop: &dyn Fn(&TokenKind) -> bool,
    ) -> Result<&'a [P<'a>], ErrorInfo> {
        let mut stmts = Vec::new();
        loop {
            self.skip_terms();
            if stop(self.peek_kind()) || matches!(self.peek_kind(), TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_stmt()?);
            if !matches!(
                self.peek_kind(),
                TokenKind::Newline | TokenKind::Semi | TokenKind::Eof
            ) && !stop(self.peek_kind())
            {
                return Err(self.err_expected("newline or ';'"));
            }
        }
        Ok(self.nodes(stmts))
    }

    fn parse_stmt(&mut self) -> Result<P<'a>, ErrorInfo> {
        let mut expr = self.parse_stmt_expr()?;
        // Modifier forms bind loosest of all.
        loop {
            let line = self.peek().line;
            match self.peek_kind() {
                TokenKind::Kw(Kw::If) => {
                    self.advance();
                    let cond = self.parse_expr_value()?;
                    expr = self.node(
                        Expr::If {
                            cond,
                            then_body: self.nodes(vec![expr]),
                            else_body: &[],
                        },
                        line,
                    );
                }
                TokenKind::Kw(Kw::Unless) => {
                    self.advance();
                    let cond = self.parse_expr_value()?;
                    expr = self.node(
                        Expr::If {
                            cond,
                            then_body: &[],
                            else_body: self.nodes(vec![expr]),
                        },
                        line,
                    );
                }
                TokenKind::Kw(Kw::While) => {
                    self.advance();
                    let cond = self.parse_expr_value()?;
                    expr = self.node(Expr::While { cond, body: self.nodes(vec![expr]) }, line);
                }
                TokenKind::Kw(Kw::Until) => {
                    self.advance();
                    let cond = self.parse_expr_value()?;
                    let negated = self.node(Expr::UnOp { op: UnOp::Not, operand: cond }, line);
                    expr =
                        self.node(Expr::While { cond: negated, body: self.nodes(vec![expr]) }, line);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// A statement-position expression: multiple assignment and
    /// paren-less command calls are recognized only here.
    fn parse_stmt_expr(&mut self) -> Result<P<'a>, ErrorInfo> {
        if self.multi_assign_follows() {
            return self.parse_multi_assign();
        }
        if let TokenKind::Ident(name) = self.peek_kind() {
            if self.command_args_follow() {
                let line = self.peek().line;
                let name = self.text(name);
                self.advance();
                let (args, block) = self.parse_command_args()?;
                let call = self.node(
                    Expr::Call { recv: None, name, args, block, safe: false },
                    line,
                );
                return Ok(call);
            }
        }
        self.parse_expr_value()
    }

    /// True when the statement starts a multiple assignment
    /// (`a, b = …` / `a, *r = …`). Scans ahead for a top-level `=`
    /// before the statement ends.
    fn multi_assign_follows(&self) -> bool {
        // Fast reject: a multiple assignment begins with a target.
        match self.peek_kind() {
            TokenKind::Ident(_)
            | TokenKind::Ivar(_)
            | TokenKind::Cvar(_)
            | TokenKind::ConstName(_)
            | TokenKind::Star => {}
            _ => return false,
        }
        let mut depth = 0usize;
        let mut saw_comma = false;
        let mut i = self.pos;
        loop {
            match &self.tokens[i].kind {
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    if depth == 0 {
                        return false;
                    }
                    depth -= 1;
                }
                TokenKind::Comma if depth == 0 => saw_comma = true,
                TokenKind::Assign if depth == 0 => return saw_comma,
                TokenKind::Newline | TokenKind::Semi | TokenKind::Eof => return false,
                // Any operator other than `*` (splat) and `.`/`[]` (attr
                // and index targets) disqualifies the scan.
                TokenKind::Kw(_)
                | TokenKind::FatArrow
                | TokenKind::Question
                | TokenKind::OrOrAssign
                | TokenKind::AndAndAssign
                | TokenKind::PlusAssign
                | TokenKind::MinusAssign
                | TokenKind::StarAssign
                | TokenKind::SlashAssign
                | TokenKind::PercentAssign => return false,
                _ => {}
            }
            i += 1;
            if i >= self.tokens.len() {
                return false;
            }
        }
    }

    fn parse_multi_assign(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        let mut targets = Vec::new();
        let mut splat = None;
        loop {
            if self.eat(&TokenKind::Star) {
                if splat.is_some() {
                    return Err(self.err_at("multiple splat targets in assignment"));
                }
                splat = Some(targets.len());
            }
            let target = self.parse_postfix_target()?;
            targets.push(target);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::Assign, "'='")?;
        self.skip_newlines();
        let mut values = vec![self.parse_expr_value()?];
        while self.eat(&TokenKind::Comma) {
            self.skip_newlines();
            values.push(self.parse_expr_value()?);
        }
        let value = if values.len() == 1 {
            values[0]
        } else {
            self.node(Expr::Array(self.nodes(values)), line)
        };
        Ok(self.node(
            Expr::MultiAssign { targets: self.nodes(targets), splat, value },
            line,
        ))
    }

    /// A bare assignment target: identifier, ivar, cvar, constant,
    /// `recv.attr`, or `recv[idx]`.
    fn parse_postfix_target(&mut self) -> Result<P<'a>, ErrorInfo> {
        let primary = self.parse_primary()?;
        self.parse_postfix_chain(primary, false)
    }

    /// Does a paren-less command argument list follow the identifier at
    /// the cursor? Only unambiguous starters count.
    fn command_args_follow(&self) -> bool {
        match self.peek_at(1) {
            TokenKind::Str(_)
            | TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Sym(_)
            | TokenKind::BlockSym(_)
            | TokenKind::ConstName(_)
            | TokenKind::Ivar(_)
            | TokenKind::Cvar(_)
            | TokenKind::Ident(_)
            | TokenKind::Kw(Kw::Nil)
            | TokenKind::Kw(Kw::True)
            | TokenKind::Kw(Kw::False)
            | TokenKind::Kw(Kw::SelfKw) => true,
            // `ident […]` is a command call only when the bracket is not
            // adjacent (adjacent means indexing).
            TokenKind::LBracket => !self.bracket_adjacent(),
            _ => false,
        }
    }

    fn bracket_adjacent(&self) -> bool {
        let ident = self.peek();
        let bracket = &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)];
        if ident.line != bracket.line {
            return false;
        }
        let len = match &ident.kind {
            TokenKind::Ident(name) => name.len() as u32,
            _ => return false,
        };
        ident.col + len == bracket.col
    }

    fn parse_command_args(
        &mut self,
    ) -> Result<(&'a [Arg<'a>], Option<&'a Block<'a>>), ErrorInfo> {
        let mut args = Vec::new();
        let mut block = None;
        loop {
            if let Some(b) = self.try_parse_arg(&mut args)? {
                block = Some(b);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        if block.is_none() {
            block = self.try_parse_block()?;
        }
        Ok((self.arena.alloc_slice_fill_iter(args), block))
    }

    // ---- expressions ----

    /// Expression including assignment but not statement-only forms.
    fn parse_expr_value(&mut self) -> Result<P<'a>, ErrorInfo> {
        let lhs = self.parse_expr_bp(0)?;
        self.parse_assign_tail(lhs)
    }

    fn parse_assign_tail(&mut self, lhs: P<'a>) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        let op = match self.peek_kind() {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinOp::Add),
            TokenKind::MinusAssign => Some(BinOp::Sub),
            TokenKind::StarAssign => Some(BinOp::Mul),
            TokenKind::SlashAssign => Some(BinOp::Div),
            TokenKind::PercentAssign => Some(BinOp::Mod),
            TokenKind::OrOrAssign => Some(BinOp::Or),
            TokenKind::AndAndAssign => Some(BinOp::And),
            _ => return Ok(lhs),
        };
        self.check_assign_target(lhs)?;
        self.advance();
        self.skip_newlines();
        let value = self.parse_expr_value()?; // right-assoc
        Ok(match op {
            None => self.node(Expr::Assign { target: lhs, value }, line),
            Some(op) => self.node(Expr::OpAssign { target: lhs, op, value }, line),
        })
    }

    fn check_assign_target(&self, target: P<'a>) -> Result<(), ErrorInfo> {
        match &target.expr {
            Expr::Ident(_)
            | Expr::Ivar(_)
            | Expr::Cvar(_)
            | Expr::ConstName(_)
            | Expr::Index { .. } => Ok(()),
            Expr::Call { args, block: None, .. } if args.is_empty() => Ok(()),
            _ => Err(self.err_at("invalid assignment target")),
        }
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> Result<P<'a>, ErrorInfo> {
        let mut lhs = self.parse_unary()?;
        loop {
            let line = self.peek().line;
            let (op, bp): (Option<BinOp>, (u8, u8)) = match self.peek_kind() {
                TokenKind::Kw(Kw::Or) => (Some(BinOp::Or), (1, 2)),
                TokenKind::Kw(Kw::And) => (Some(BinOp::And), (1, 2)),
                TokenKind::Question => (None, BP_TERNARY),
                TokenKind::DotDot | TokenKind::DotDotDot => (None, BP_RANGE),
                TokenKind::OrOr => (Some(BinOp::Or), BP_OR),
                TokenKind::AndAnd => (Some(BinOp::And), BP_AND),
                TokenKind::EqEq => (Some(BinOp::Eq), BP_EQUALITY),
                TokenKind::NotEq => (Some(BinOp::Ne), BP_EQUALITY),
                TokenKind::EqEqEq => (Some(BinOp::CaseEq), BP_EQUALITY),
                TokenKind::Spaceship => (Some(BinOp::Cmp), BP_EQUALITY),
                TokenKind::Lt => (Some(BinOp::Lt), BP_COMPARE),
                TokenKind::Le => (Some(BinOp::Le), BP_COMPARE),
                TokenKind::Gt => (Some(BinOp::Gt), BP_COMPARE),
                TokenKind::Ge => (Some(BinOp::Ge), BP_COMPARE),
                TokenKind::Pipe => (Some(BinOp::BitOr), BP_BITOR),
                TokenKind::Caret => (Some(BinOp::BitXor), BP_BITOR),
                TokenKind::Amp => (Some(BinOp::BitAnd), BP_BITAND),
                TokenKind::Shl => (Some(BinOp::Shl), BP_SHIFT),
                TokenKind::Shr => (Some(BinOp::Shr), BP_SHIFT),
                TokenKind::Plus => (Some(BinOp::Add), BP_ADD),
                TokenKind::Minus => (Some(BinOp::Sub), BP_ADD),
                TokenKind::Star => (Some(BinOp::Mul), BP_MUL),
                TokenKind::Slash => (Some(BinOp::Div), BP_MUL),
                TokenKind::Percent => (Some(BinOp::Mod), BP_MUL),
                TokenKind::StarStar => (Some(BinOp::Pow), BP_POW),
                _ => break,
            };
            let (l_bp, r_bp) = bp;
            if l_bp < min_bp {
                break;
            }
            match self.peek_kind() {
                TokenKind::Question => {
                    self.advance();
                    self.skip_newlines();
                    let then_val = self.parse_expr_bp(0)?;
                    self.skip_newlines();
                    self.expect(&TokenKind::Colon, "':' in ternary")?;
                    self.skip_newlines();
                    let else_val = self.parse_expr_bp(r_bp)?;
                    lhs = self.node(
                        Expr::If {
                            cond: lhs,
                            then_body: self.nodes(vec![then_val]),
                            else_body: self.nodes(vec![else_val]),
                        },
                        line,
                    );
                }
                TokenKind::DotDot | TokenKind::DotDotDot => {
                    let exclusive = matches!(self.peek_kind(), TokenKind::DotDotDot);
                    self.advance();
                    self.skip_newlines();
                    let hi = self.parse_expr_bp(r_bp)?;
                    lhs = self.node(Expr::Range { lo: lhs, hi, exclusive }, line);
                }
                _ => {
                    let op = op.expect("binary operator");
                    self.advance();
                    self.skip_newlines();
                    let rhs = self.parse_expr_bp(r_bp)?;
                    lhs = self.node(Expr::BinOp { op, lhs, rhs }, line);
                }
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                // Fold a literal so `-9223372036854775808` stays in range.
                match self.peek_kind() {
                    TokenKind::Int(v) => {
                        let v = *v;
                        self.advance();
                        let lit = self.node(Expr::Int(v.wrapping_neg()), line);
                        return self.parse_postfix_chain(lit, true);
                    }
                    TokenKind::Float(v) => {
                        let v = *v;
                        self.advance();
                        let lit = self.node(Expr::Float(-v), line);
                        return self.parse_postfix_chain(lit, true);
                    }
                    _ => {}
                }
                let operand = self.parse_unary()?;
                Ok(self.node(Expr::UnOp { op: UnOp::Neg, operand }, line))
            }
            TokenKind::Bang | TokenKind::Kw(Kw::Not) => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(self.node(Expr::UnOp { op: UnOp::Not, operand }, line))
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix_chain(primary, true)
            }
        }
    }

    /// `.name(args) { block }`, `&.name`, `[index]`, `(args)` chains.
    /// When `allow_block` is false (assignment-target scanning) brace
    /// blocks are not consumed.
    fn parse_postfix_chain(&mut self, mut expr: P<'a>, allow_block: bool) -> Result<P<'a>, ErrorInfo> {
        loop {
            let line = self.peek().line;
            match self.peek_kind() {
                TokenKind::Dot | TokenKind::AmpDot => {
                    let safe = matches!(self.peek_kind(), TokenKind::AmpDot);
                    self.advance();
                    self.skip_newlines();
                    if safe && self.at(&TokenKind::LBracket) {
                        // a&.[i]
                        self.advance();
                        let args = self.parse_expr_list(&TokenKind::RBracket)?;
                        self.expect(&TokenKind::RBracket, "']'")?;
                        expr = self.node(Expr::Index { recv: expr, args, safe: true }, line);
                        continue;
                    }
                    let name = self.parse_method_name()?;
                    let (args, block) = if self.at(&TokenKind::LParen) {
                        self.advance();
                        let args = self.parse_call_args(&TokenKind::RParen)?;
                        self.expect(&TokenKind::RParen, "')'")?;
                        args
                    } else {
                        (&[][..], None)
                    };
                    let block = if allow_block && block.is_none() {
                        self.try_parse_block()?
                    } else {
                        block
                    };
                    expr = self.node(
                        Expr::Call { recv: Some(expr), name, args, block, safe },
                        line,
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let args = self.parse_expr_list(&TokenKind::RBracket)?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = self.node(Expr::Index { recv: expr, args, safe: false }, line);
                }
                TokenKind::LParen => {
                    // Only a bare identifier can become a call this way.
                    let Expr::Ident(name) = &expr.expr else { break };
                    let name = *name;
                    self.advance();
                    let (args, mut block) = self.parse_call_args(&TokenKind::RParen)?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    if allow_block && block.is_none() {
                        block = self.try_parse_block()?;
                    }
                    expr = self.node(
                        Expr::Call { recv: None, name, args, block, safe: false },
                        line,
                    );
                }
                TokenKind::LBrace | TokenKind::Kw(Kw::Do) if allow_block => {
                    // A trailing block turns a bare identifier into a call.
                    let Expr::Ident(name) = &expr.expr else { break };
                    let name = *name;
                    let block = self.try_parse_block()?;
                    expr = self.node(
                        Expr::Call { recv: None, name, args: &[], block, safe: false },
                        line,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Method-name position: identifiers plus keywords that double as
    /// method names (`x.class`).
    fn parse_method_name(&mut self) -> Result<&'a str, ErrorInfo> {
        let tok = self.peek();
        let name: String = match &tok.kind {
            TokenKind::Ident(name) => name.clone(),
            TokenKind::ConstName(name) => name.clone(),
            TokenKind::Kw(Kw::Class) => "class".to_string(),
            TokenKind::Kw(Kw::Nil) => "nil".to_string(),
            _ => return Err(self.err_expected("method name")),
        };
        self.advance();
        // setter call target: `a.name = v` is parsed by the assignment
        // layer; nothing to do here.
        Ok(self.text(&name))
    }

    /// Comma-separated plain expressions up to (not consuming) `close`.
    fn parse_expr_list(&mut self, close: &TokenKind) -> Result<&'a [P<'a>], ErrorInfo> {
        let mut items = Vec::new();
        self.skip_newlines();
        if !self.at(close) {
            loop {
                items.push(self.parse_expr_value()?);
                self.skip_newlines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        Ok(self.nodes(items))
    }

    /// Call arguments inside parens, up to (not consuming) `close`.
    fn parse_call_args(
        &mut self,
        close: &TokenKind,
    ) -> Result<(&'a [Arg<'a>], Option<&'a Block<'a>>), ErrorInfo> {
        let mut args = Vec::new();
        let mut block = None;
        self.skip_newlines();
        if !self.at(close) {
            loop {
                if let Some(b) = self.try_parse_arg(&mut args)? {
                    block = Some(b);
                }
                self.skip_newlines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        Ok((self.arena.alloc_slice_fill_iter(args), block))
    }

    /// Parse one argument into `args`; returns a block when the argument
    /// was `&:sym` shorthand (which becomes the call's block).
    fn try_parse_arg(
        &mut self,
        args: &mut Vec<Arg<'a>>,
    ) -> Result<Option<&'a Block<'a>>, ErrorInfo> {
        let line = self.peek().line;
        match self.peek_kind() {
            TokenKind::Star => {
                self.advance();
                let value = self.parse_expr_value()?;
                args.push(Arg::Splat(value));
                Ok(None)
            }
            TokenKind::Amp => {
                self.advance();
                let value = self.parse_expr_value()?;
                args.push(Arg::BlockPass(value));
                Ok(None)
            }
            TokenKind::BlockSym(name) => {
                let name = self.text(name);
                self.advance();
                // &:sym ⇒ { |v| v.sym }
                let param = self.text("__v");
                let recv = self.node(Expr::Ident(param), line);
                let call = self.node(
                    Expr::Call { recv: Some(recv), name, args: &[], block: None, safe: false },
                    line,
                );
                let block = self.arena.alloc(Block {
                    params: self.arena.alloc_slice_fill_iter(vec![param]),
                    rest: None,
                    body: self.nodes(vec![call]),
                    line,
                });
                Ok(Some(block))
            }
            TokenKind::Ident(name) if matches!(self.peek_at(1), TokenKind::Colon) => {
                let name = self.text(name);
                self.advance(); // ident
                self.advance(); // :
                self.skip_newlines();
                let value = self.parse_expr_value()?;
                args.push(Arg::Kw(name, value));
                Ok(None)
            }
            _ => {
                let value = self.parse_expr_value()?;
                args.push(Arg::Pos(value));
                Ok(None)
            }
        }
    }

    fn try_parse_block(&mut self) -> Result<Option<&'a Block<'a>>, ErrorInfo> {
        let line = self.peek().line;
        let (brace, terminator) = match self.peek_kind() {
            TokenKind::LBrace => (true, TokenKind::RBrace),
            TokenKind::Kw(Kw::Do) => (false, TokenKind::Kw(Kw::End)),
            _ => return Ok(None),
        };
        self.advance();
        self.skip_newlines();
        let (params, rest) = if self.eat(&TokenKind::Pipe) {
            self.parse_block_params()?
        } else {
            (&[][..], None)
        };
        let stop_brace = |k: &TokenKind| matches!(k, TokenKind::RBrace);
        let stop_end = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
        let body = if brace {
            self.parse_body(&stop_brace)?
        } else {
            self.parse_body(&stop_end)?
        };
        self.expect(&terminator, if brace { "'}'" } else { "'end'" })?;
        Ok(Some(self.arena.alloc(Block { params, rest, body, line })))
    }

    fn parse_block_params(&mut self) -> Result<(&'a [&'a str], Option<&'a str>), ErrorInfo> {
        let mut params = Vec::new();
        let mut rest = None;
        if !self.at(&TokenKind::Pipe) {
            loop {
                if self.eat(&TokenKind::Star) {
                    let TokenKind::Ident(name) = self.peek_kind() else {
                        return Err(self.err_expected("block parameter name"));
                    };
                    rest = Some(self.text(name));
                    self.advance();
                } else {
                    let TokenKind::Ident(name) = self.peek_kind() else {
                        return Err(self.err_expected("block parameter name"));
                    };
                    params.push(self.text(name));
                    self.advance();
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::Pipe, "'|'")?;
        Ok((self.arena.alloc_slice_fill_iter(params), rest))
    }

    // ---- primaries ----

    fn parse_primary(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        match self.peek_kind().clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(self.node(Expr::Int(v), line))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(self.node(Expr::Float(v), line))
            }
            TokenKind::Str(pieces) => {
                self.advance();
                self.parse_string_literal(&pieces, line)
            }
            TokenKind::Sym(name) => {
                self.advance();
                Ok(self.node(Expr::Sym(self.text(&name)), line))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(self.node(Expr::Ident(self.text(&name)), line))
            }
            TokenKind::ConstName(name) => {
                self.advance();
                Ok(self.node(Expr::ConstName(self.text(&name)), line))
            }
            TokenKind::Ivar(name) => {
                self.advance();
                Ok(self.node(Expr::Ivar(self.text(&name)), line))
            }
            TokenKind::Cvar(name) => {
                self.advance();
                Ok(self.node(Expr::Cvar(self.text(&name)), line))
            }
            TokenKind::Kw(Kw::Nil) => {
                self.advance();
                Ok(self.node(Expr::Nil, line))
            }
            TokenKind::Kw(Kw::True) => {
                self.advance();
                Ok(self.node(Expr::True, line))
            }
            TokenKind::Kw(Kw::False) => {
                self.advance();
                Ok(self.node(Expr::False, line))
            }
            TokenKind::Kw(Kw::SelfKw) => {
                self.advance();
                Ok(self.node(Expr::SelfLit, line))
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let inner = self.parse_expr_value()?;
                self.skip_newlines();
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let items = self.parse_expr_list(&TokenKind::RBracket)?;
                self.expect(&TokenKind::RBracket, "']'")?;
                Ok(self.node(Expr::Array(items), line))
            }
            TokenKind::LBrace => {
                self.advance();
                let pairs = self.parse_hash_body()?;
                self.expect(&TokenKind::RBrace, "'}'")?;
                Ok(self.node(Expr::Hash(pairs), line))
            }
            TokenKind::Kw(Kw::If) => self.parse_if(false),
            TokenKind::Kw(Kw::Unless) => self.parse_if(true),
            TokenKind::Kw(Kw::While) => self.parse_while(false),
            TokenKind::Kw(Kw::Until) => self.parse_while(true),
            TokenKind::Kw(Kw::For) => self.parse_for(),
            TokenKind::Kw(Kw::Loop) => self.parse_loop(),
            TokenKind::Kw(Kw::Case) => self.parse_case(),
            TokenKind::Kw(Kw::Begin) => self.parse_begin(),
            TokenKind::Kw(Kw::Def) => self.parse_def(),
            TokenKind::Kw(Kw::Class) => self.parse_class(),
            TokenKind::Kw(Kw::Module) => self.parse_module(),
            TokenKind::Kw(Kw::Yield) => self.parse_yield(),
            TokenKind::Kw(Kw::Super) => self.parse_super(),
            TokenKind::Kw(Kw::Return) => {
                self.advance();
                let value = self.parse_optional_value()?;
                Ok(self.node(Expr::Return(value), line))
            }
            TokenKind::Kw(Kw::Break) => {
                self.advance();
                let value = self.parse_optional_value()?;
                Ok(self.node(Expr::Break(value), line))
            }
            TokenKind::Kw(Kw::Next) => {
                self.advance();
                let value = self.parse_optional_value()?;
                Ok(self.node(Expr::Next(value), line))
            }
            TokenKind::Kw(Kw::Redo) => {
                self.advance();
                Ok(self.node(Expr::Redo, line))
            }
            TokenKind::Kw(Kw::Retry) => {
                self.advance();
                Ok(self.node(Expr::Retry, line))
            }
            _ => Err(self.err_expected("expression")),
        }
    }

    fn parse_optional_value(&mut self) -> Result<Option<P<'a>>, ErrorInfo> {
        if self.value_follows() {
            Ok(Some(self.parse_expr_value()?))
        } else {
            Ok(None)
        }
    }

    fn value_follows(&self) -> bool {
        !matches!(
            self.peek_kind(),
            TokenKind::Newline
                | TokenKind::Semi
                | TokenKind::Eof
                | TokenKind::Kw(Kw::End)
                | TokenKind::Kw(Kw::If)
                | TokenKind::Kw(Kw::Unless)
                | TokenKind::Kw(Kw::While)
                | TokenKind::Kw(Kw::Until)
                | TokenKind::RBrace
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::Comma
        )
    }

    fn parse_string_literal(
        &mut self,
        pieces: &[StrPiece],
        line: u32,
    ) -> Result<P<'a>, ErrorInfo> {
        let mut parts = Vec::new();
        for piece in pieces {
            match piece {
                StrPiece::Lit(text) => parts.push(StrPart::Lit(self.text(text))),
                StrPiece::Interp(tokens) => {
                    let mut sub = Parser {
                        arena: self.arena,
                        tokens,
                        pos: 0,
                        filename: self.filename.clone(),
                        tmp_counter: 0,
                    };
                    let expr = sub.parse_expr_value()?;
                    sub.expect_eof()?;
                    parts.push(StrPart::Interp(expr));
                }
            }
        }
        if parts.is_empty() {
            parts.push(StrPart::Lit(self.text("")));
        }
        Ok(self.node(Expr::Str(self.arena.alloc_slice_fill_iter(parts)), line))
    }

    fn parse_hash_body(&mut self) -> Result<&'a [(P<'a>, P<'a>)], ErrorInfo> {
        let mut pairs = Vec::new();
        self.skip_newlines();
        while !self.at(&TokenKind::RBrace) {
            let line = self.peek().line;
            // `key: value` shorthand ⇒ `:key => value`
            let key = if let TokenKind::Ident(name) = self.peek_kind() {
                if matches!(self.peek_at(1), TokenKind::Colon) {
                    let name = self.text(name);
                    self.advance();
                    self.advance();
                    Some(self.node(Expr::Sym(name), line))
                } else {
                    None
                }
            } else {
                None
            };
            let (key, value) = match key {
                Some(key) => {
                    self.skip_newlines();
                    (key, self.parse_expr_value()?)
                }
                None => {
                    let key = self.parse_expr_value()?;
                    self.skip_newlines();
                    self.expect(&TokenKind::FatArrow, "'=>'")?;
                    self.skip_newlines();
                    (key, self.parse_expr_value()?)
                }
            };
            pairs.push((key, value));
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        Ok(self.arena.alloc_slice_fill_iter(pairs))
    }

    // ---- control-flow forms ----

    fn parse_if(&mut self, invert: bool) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // if / unless
        let cond = self.parse_expr_value()?;
        self.eat_kw(Kw::Then);
        let stop = |k: &TokenKind| {
            matches!(
                k,
                TokenKind::Kw(Kw::Elsif) | TokenKind::Kw(Kw::Else) | TokenKind::Kw(Kw::End)
            )
        };
        let then_body = self.parse_body(&stop)?;
        let else_body = self.parse_else_tail()?;
        self.expect(&TokenKind::Kw(Kw::End), "'end'")?;
        Ok(if invert {
            self.node(Expr::If { cond, then_body: else_body, else_body: then_body }, line)
        } else {
            self.node(Expr::If { cond, then_body, else_body }, line)
        })
    }

    /// The `elsif …`/`else …` tail of an `if`, up to but not consuming
    /// `end`.
    fn parse_else_tail(&mut self) -> Result<&'a [P<'a>], ErrorInfo> {
        if self.at(&TokenKind::Kw(Kw::Elsif)) {
            let line = self.peek().line;
            self.advance();
            let cond = self.parse_expr_value()?;
            self.eat_kw(Kw::Then);
            let stop = |k: &TokenKind| {
                matches!(
                    k,
                    TokenKind::Kw(Kw::Elsif) | TokenKind::Kw(Kw::Else) | TokenKind::Kw(Kw::End)
                )
            };
            let then_body = self.parse_body(&stop)?;
            let else_body = self.parse_else_tail()?;
            let nested = self.node(Expr::If { cond, then_body, else_body }, line);
            return Ok(self.nodes(vec![nested]));
        }
        if self.eat_kw(Kw::Else) {
            let stop = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
            return self.parse_body(&stop);
        }
        Ok(&[])
    }

    fn parse_while(&mut self, invert: bool) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // while / until
        let mut cond = self.parse_expr_value()?;
        if invert {
            cond = self.node(Expr::UnOp { op: UnOp::Not, operand: cond }, line);
        }
        self.eat_kw(Kw::Do);
        let stop = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
        let body = self.parse_body(&stop)?;
        self.expect(&TokenKind::Kw(Kw::End), "'end'")?;
        Ok(self.node(Expr::While { cond, body }, line))
    }

    fn parse_loop(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // loop
        let (terminator, stop): (TokenKind, fn(&TokenKind) -> bool) =
            if self.eat(&TokenKind::LBrace) {
                (TokenKind::RBrace, |k| matches!(k, TokenKind::RBrace))
            } else {
                self.expect(&TokenKind::Kw(Kw::Do), "'do' after 'loop'")?;
                (TokenKind::Kw(Kw::End), |k| matches!(k, TokenKind::Kw(Kw::End)))
            };
        let body = self.parse_body(&stop)?;
        self.expect(&terminator, "end of loop body")?;
        Ok(self.node(Expr::Loop { body }, line))
    }

    /// `for x in e … end` keeps `x` visible after the loop, which is the
    /// one observable difference from writing `e.each { |x| … }`.
    fn parse_for(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // for
        let mut vars = Vec::new();
        loop {
            let TokenKind::Ident(name) = self.peek_kind() else {
                return Err(self.err_expected("loop variable"));
            };
            vars.push(self.text(name));
            self.advance();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::Kw(Kw::In), "'in'")?;
        let iterable = self.parse_expr_value()?;
        self.eat_kw(Kw::Do);
        let stop = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
        let body = self.parse_body(&stop)?;
        self.expect(&TokenKind::Kw(Kw::End), "'end'")?;

        // x = nil; e.each { |t…| x = t…; body }
        let mut stmts = Vec::new();
        for &var in &vars {
            let target = self.node(Expr::Ident(var), line);
            let nil = self.node(Expr::Nil, line);
            stmts.push(self.node(Expr::Assign { target, value: nil }, line));
        }
        let mut block_body = Vec::new();
        let mut tmps = Vec::new();
        for &var in &vars {
            let tmp = self.fresh_tmp("for");
            tmps.push(tmp);
            let target = self.node(Expr::Ident(var), line);
            let value = self.node(Expr::Ident(tmp), line);
            block_body.push(self.node(Expr::Assign { target, value }, line));
        }
        block_body.extend_from_slice(body);
        let block = self.arena.alloc(Block {
            params: self.arena.alloc_slice_fill_iter(tmps),
            rest: None,
            body: self.nodes(block_body),
            line,
        });
        let each = self.node(
            Expr::Call {
                recv: Some(iterable),
                name: self.text("each"),
                args: &[],
                block: Some(block),
                safe: false,
            },
            line,
        );
        stmts.push(each);
        Ok(self.node(Expr::Seq(self.nodes(stmts)), line))
    }

    fn parse_case(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // case
        let subject = if matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semi) {
            None
        } else {
            Some(self.parse_expr_value()?)
        };
        self.skip_terms();
        let mut whens = Vec::new();
        while self.eat_kw(Kw::When) {
            let values = {
                let mut values = vec![self.parse_expr_value()?];
                while self.eat(&TokenKind::Comma) {
                    self.skip_newlines();
                    values.push(self.parse_expr_value()?);
                }
                self.nodes(values)
            };
            self.eat_kw(Kw::Then);
            let stop = |k: &TokenKind| {
                matches!(
                    k,
                    TokenKind::Kw(Kw::When) | TokenKind::Kw(Kw::Else) | TokenKind::Kw(Kw::End)
                )
            };
            let body = self.parse_body(&stop)?;
            whens.push(WhenClause { values, body });
        }
        let else_body = if self.eat_kw(Kw::Else) {
            let stop = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
            self.parse_body(&stop)?
        } else {
            &[]
        };
        self.expect(&TokenKind::Kw(Kw::End), "'end'")?;
        Ok(self.node(
            Expr::Case {
                subject,
                whens: self.arena.alloc_slice_fill_iter(whens),
                else_body,
            },
            line,
        ))
    }

    fn parse_begin(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // begin
        let stop = |k: &TokenKind| {
            matches!(
                k,
                TokenKind::Kw(Kw::Rescue) | TokenKind::Kw(Kw::Ensure) | TokenKind::Kw(Kw::End)
            )
        };
        let body = self.parse_body(&stop)?;
        let mut rescues = Vec::new();
        while self.eat_kw(Kw::Rescue) {
            let mut classes = Vec::new();
            while matches!(self.peek_kind(), TokenKind::ConstName(_)) {
                classes.push(self.parse_primary()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            let var = if self.eat(&TokenKind::FatArrow) {
                let TokenKind::Ident(name) = self.peek_kind() else {
                    return Err(self.err_expected("rescue variable name"));
                };
                let name = self.text(name);
                self.advance();
                Some(name)
            } else {
                None
            };
            self.eat_kw(Kw::Then);
            let body = self.parse_body(&stop)?;
            rescues.push(RescueClause { classes: self.nodes(classes), var, body });
        }
        let ensure_body = if self.eat_kw(Kw::Ensure) {
            let stop_end = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
            Some(self.parse_body(&stop_end)?)
        } else {
            None
        };
        self.expect(&TokenKind::Kw(Kw::End), "'end'")?;
        Ok(self.node(
            Expr::Begin {
                body,
                rescues: self.arena.alloc_slice_fill_iter(rescues),
                ensure_body,
            },
            line,
        ))
    }

    // ---- definitions ----

    fn parse_def(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // def
        let singleton = if self.at(&TokenKind::Kw(Kw::SelfKw))
            && matches!(self.peek_at(1), TokenKind::Dot)
        {
            self.advance();
            self.advance();
            true
        } else {
            false
        };
        let name = self.parse_def_name()?;
        let params = self.parse_def_params()?;
        let stop = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End) | TokenKind::Kw(Kw::Rescue) | TokenKind::Kw(Kw::Ensure));
        let mut body = self.parse_body(&stop)?;
        // `def … rescue … end` protects the whole body.
        if matches!(
            self.peek_kind(),
            TokenKind::Kw(Kw::Rescue) | TokenKind::Kw(Kw::Ensure)
        ) {
            let mut rescues = Vec::new();
            let stop_r = |k: &TokenKind| {
                matches!(
                    k,
                    TokenKind::Kw(Kw::Rescue) | TokenKind::Kw(Kw::Ensure) | TokenKind::Kw(Kw::End)
                )
            };
            while self.eat_kw(Kw::Rescue) {
                let mut classes = Vec::new();
                while matches!(self.peek_kind(), TokenKind::ConstName(_)) {
                    classes.push(self.parse_primary()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                let var = if self.eat(&TokenKind::FatArrow) {
                    let TokenKind::Ident(name) = self.peek_kind() else {
                        return Err(self.err_expected("rescue variable name"));
                    };
                    let name = self.text(name);
                    self.advance();
                    Some(name)
                } else {
                    None
                };
                let rbody = self.parse_body(&stop_r)?;
                rescues.push(RescueClause { classes: self.nodes(classes), var, body: rbody });
            }
            let ensure_body = if self.eat_kw(Kw::Ensure) {
                let stop_end = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
                Some(self.parse_body(&stop_end)?)
            } else {
                None
            };
            let begin = self.node(
                Expr::Begin {
                    body,
                    rescues: self.arena.alloc_slice_fill_iter(rescues),
                    ensure_body,
                },
                line,
            );
            body = self.nodes(vec![begin]);
        }
        self.expect(&TokenKind::Kw(Kw::End), "'end'")?;
        Ok(self.node(Expr::Def { name, singleton, params, body }, line))
    }

    fn parse_def_name(&mut self) -> Result<&'a str, ErrorInfo> {
        use TokenKind::*;
        let name: String = match self.peek_kind() {
            Ident(name) => {
                let mut name = name.clone();
                self.advance();
                // setter: `def name=(v)`
                if self.at(&Assign) {
                    self.advance();
                    name.push('=');
                }
                return Ok(self.text(&name));
            }
            Plus => "+".into(),
            Minus => "-".into(),
            Star => "*".into(),
            StarStar => "**".into(),
            Slash => "/".into(),
            Percent => "%".into(),
            EqEq => "==".into(),
            EqEqEq => "===".into(),
            NotEq => "!=".into(),
            Lt => "<".into(),
            Le => "<=".into(),
            Gt => ">".into(),
            Ge => ">=".into(),
            Spaceship => "<=>".into(),
            Shl => "<<".into(),
            Shr => ">>".into(),
            Bang => "!".into(),
            LBracket => {
                self.advance();
                self.expect(&RBracket, "']' in method name")?;
                let name = if self.eat(&Assign) { "[]=" } else { "[]" };
                return Ok(self.text(name));
            }
            _ => return Err(self.err_expected("method name")),
        };
        self.advance();
        Ok(self.text(&name))
    }

    fn parse_def_params(&mut self) -> Result<&'a Params<'a>, ErrorInfo> {
        let mut required = Vec::new();
        let mut optional = Vec::new();
        let mut rest = None;
        let mut kw = Vec::new();
        let mut block = None;

        let parens = self.eat(&TokenKind::LParen);
        let list_ends = |k: &TokenKind, parens: bool| {
            if parens {
                matches!(k, TokenKind::RParen)
            } else {
                matches!(k, TokenKind::Newline | TokenKind::Semi | TokenKind::Eof)
            }
        };
        if parens {
            self.skip_newlines();
        }
        while !list_ends(self.peek_kind(), parens) {
            match self.peek_kind().clone() {
                TokenKind::Star => {
                    self.advance();
                    let TokenKind::Ident(name) = self.peek_kind() else {
                        return Err(self.err_expected("parameter name after '*'"));
                    };
                    rest = Some(self.text(name));
                    self.advance();
                }
                TokenKind::Amp => {
                    self.advance();
                    let TokenKind::Ident(name) = self.peek_kind() else {
                        return Err(self.err_expected("parameter name after '&'"));
                    };
                    block = Some(self.text(name));
                    self.advance();
                }
                TokenKind::Ident(name) => {
                    let name = self.text(&name);
                    self.advance();
                    match self.peek_kind() {
                        // `name:` keyword parameter, required or defaulted
                        TokenKind::Colon => {
                            self.advance();
                            let next_is_default = !matches!(
                                self.peek_kind(),
                                TokenKind::Comma
                                    | TokenKind::RParen
                                    | TokenKind::Newline
                                    | TokenKind::Semi
                                    | TokenKind::Eof
                            );
                            let default = if next_is_default {
                                Some(self.parse_expr_value()?)
                            } else {
                                None
                            };
                            kw.push((name, default));
                        }
                        // `name = default`
                        TokenKind::Assign => {
                            self.advance();
                            let default = self.parse_expr_value()?;
                            optional.push((name, default));
                        }
                        _ => required.push(name),
                    }
                }
                _ => return Err(self.err_expected("parameter")),
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        if parens {
            self.expect(&TokenKind::RParen, "')'")?;
        }
        Ok(self.arena.alloc(Params {
            required: self.arena.alloc_slice_fill_iter(required),
            optional: self.arena.alloc_slice_fill_iter(optional),
            rest,
            kw: self.arena.alloc_slice_fill_iter(kw),
            block,
        }))
    }

    fn parse_class(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // class
        let TokenKind::ConstName(name) = self.peek_kind() else {
            return Err(self.err_expected("class name (a constant)"));
        };
        let name = self.text(name);
        self.advance();
        let superclass = if self.eat(&TokenKind::Lt) {
            Some(self.parse_expr_value()?)
        } else {
            None
        };
        let stop = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
        let body = self.parse_body(&stop)?;
        self.expect(&TokenKind::Kw(Kw::End), "'end'")?;
        Ok(self.node(Expr::ClassDef { name, superclass, body }, line))
    }

    fn parse_module(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // module
        let TokenKind::ConstName(name) = self.peek_kind() else {
            return Err(self.err_expected("module name (a constant)"));
        };
        let name = self.text(name);
        self.advance();
        let stop = |k: &TokenKind| matches!(k, TokenKind::Kw(Kw::End));
        let body = self.parse_body(&stop)?;
        self.expect(&TokenKind::Kw(Kw::End), "'end'")?;
        Ok(self.node(Expr::ModuleDef { name, body }, line))
    }

    fn parse_yield(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // yield
        let args = if self.eat(&TokenKind::LParen) {
            let args = self.parse_expr_list(&TokenKind::RParen)?;
            self.expect(&TokenKind::RParen, "')'")?;
            args
        } else if self.value_follows() {
            let mut items = vec![self.parse_expr_value()?];
            while self.eat(&TokenKind::Comma) {
                self.skip_newlines();
                items.push(self.parse_expr_value()?);
            }
            self.nodes(items)
        } else {
            &[]
        };
        Ok(self.node(Expr::Yield { args }, line))
    }

    fn parse_super(&mut self) -> Result<P<'a>, ErrorInfo> {
        let line = self.peek().line;
        self.advance(); // super
        if self.eat(&TokenKind::LParen) {
            let (args, block) = self.parse_call_args(&TokenKind::RParen)?;
            self.expect(&TokenKind::RParen, "')'")?;
            Ok(self.node(Expr::Super { args: Some(args), block }, line))
        } else {
            Ok(self.node(Expr::Super { args: None, block: None }, line))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_one<'a>(arena: &'a Bump, source: &str) -> &'a [P<'a>] {
        let tokens = lex(source, "<test>").unwrap();
        parse_program(arena, &tokens, "<test>").unwrap()
    }

    fn parse_err(source: &str) -> ErrorInfo {
        let arena = Bump::new();
        let tokens = lex(source, "<test>").unwrap();
        parse_program(&arena, &tokens, "<test>").unwrap_err()
    }

    #[test]
    fn test_parse_arithmetic_precedence() {
        let arena = Bump::new();
        let body = parse_one(&arena, "1 + 2 * 3");
        let Expr::BinOp { op: BinOp::Add, rhs, .. } = &body[0].expr else {
            panic!("expected '+' at the root");
        };
        assert!(matches!(rhs.expr, Expr::BinOp { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_parse_method_chain_with_block() {
        let arena = Bump::new();
        let body = parse_one(&arena, "[1,2].map { |x| x * 2 }");
        let Expr::Call { recv: Some(recv), name, block: Some(block), .. } = &body[0].expr else {
            panic!("expected call with block");
        };
        assert_eq!(*name, "map");
        assert!(matches!(recv.expr, Expr::Array(_)));
        assert_eq!(block.params, &["x"]);
    }

    #[test]
    fn test_parse_unless_swaps_branches() {
        let arena = Bump::new();
        let body = parse_one(&arena, "unless a\n 1\n else\n 2\n end");
        let Expr::If { then_body, else_body, .. } = &body[0].expr else {
            panic!("expected if");
        };
        assert!(matches!(then_body[0].expr, Expr::Int(2)));
        assert!(matches!(else_body[0].expr, Expr::Int(1)));
    }

    #[test]
    fn test_parse_until_negates() {
        let arena = Bump::new();
        let body = parse_one(&arena, "until done\n step\n end");
        let Expr::While { cond, .. } = &body[0].expr else {
            panic!("expected while");
        };
        assert!(matches!(cond.expr, Expr::UnOp { op: UnOp::Not, .. }));
    }

    #[test]
    fn test_parse_for_desugars_to_each() {
        let arena = Bump::new();
        let body = parse_one(&arena, "for x in [1,2]\n x\n end");
        let Expr::Seq(stmts) = &body[0].expr else {
            panic!("expected desugared sequence");
        };
        assert!(matches!(stmts[0].expr, Expr::Assign { .. }));
        let Expr::Call { name, block: Some(_), .. } = &stmts[1].expr else {
            panic!("expected each call");
        };
        assert_eq!(*name, "each");
    }

    #[test]
    fn test_parse_def_with_kwargs() {
        let arena = Bump::new();
        let body = parse_one(&arena, "def f(a, b = 2, *rest, c:, d: 4, &blk)\n a\n end");
        let Expr::Def { name, params, .. } = &body[0].expr else {
            panic!("expected def");
        };
        assert_eq!(*name, "f");
        assert_eq!(params.required, &["a"]);
        assert_eq!(params.optional.len(), 1);
        assert_eq!(params.rest, Some("rest"));
        assert_eq!(params.kw.len(), 2);
        assert_eq!(params.kw[0].0, "c");
        assert!(params.kw[0].1.is_none());
        assert_eq!(params.block, Some("blk"));
    }

    #[test]
    fn test_parse_multiple_assignment_with_splat() {
        let arena = Bump::new();
        let body = parse_one(&arena, "a, *rest = [1, 2, 3]");
        let Expr::MultiAssign { targets, splat, .. } = &body[0].expr else {
            panic!("expected multiple assignment");
        };
        assert_eq!(targets.len(), 2);
        assert_eq!(*splat, Some(1));
    }

    #[test]
    fn test_parse_block_sym_shorthand() {
        let arena = Bump::new();
        let body = parse_one(&arena, "names.map(&:upcase)");
        let Expr::Call { block: Some(block), .. } = &body[0].expr else {
            panic!("expected block from &:sym");
        };
        let Expr::Call { name, .. } = &block.body[0].expr else {
            panic!("expected method call in synthesized block");
        };
        assert_eq!(*name, "upcase");
    }

    #[test]
    fn test_parse_hash_shorthand_desugars_to_symbols() {
        let arena = Bump::new();
        let body = parse_one(&arena, "{ name: 1, \"k\" => 2 }");
        let Expr::Hash(pairs) = &body[0].expr else {
            panic!("expected hash");
        };
        assert!(matches!(pairs[0].0.expr, Expr::Sym("name")));
        assert!(matches!(pairs[1].0.expr, Expr::Str(_)));
    }

    #[test]
    fn test_parse_begin_rescue_ensure() {
        let arena = Bump::new();
        let body = parse_one(
            &arena,
            "begin\n work\n rescue TypeError => e\n 1\n rescue\n 2\n ensure\n 3\n end",
        );
        let Expr::Begin { rescues, ensure_body, .. } = &body[0].expr else {
            panic!("expected begin");
        };
        assert_eq!(rescues.len(), 2);
        assert_eq!(rescues[0].var, Some("e"));
        assert_eq!(rescues[1].classes.len(), 0);
        assert!(ensure_body.is_some());
    }

    #[test]
    fn test_parse_modifier_forms() {
        let arena = Bump::new();
        let body = parse_one(&arena, "x = 1 if ready");
        assert!(matches!(body[0].expr, Expr::If { .. }));
        let body = parse_one(&arena, "x = 1 unless done");
        let Expr::If { then_body, .. } = &body[0].expr else {
            panic!("expected if");
        };
        assert!(then_body.is_empty());
    }

    #[test]
    fn test_parse_safe_navigation() {
        let arena = Bump::new();
        let body = parse_one(&arena, "a&.b&.c");
        let Expr::Call { recv: Some(recv), safe: true, name, .. } = &body[0].expr else {
            panic!("expected safe call");
        };
        assert_eq!(*name, "c");
        assert!(matches!(recv.expr, Expr::Call { safe: true, .. }));
    }

    #[test]
    fn test_parse_command_call() {
        let arena = Bump::new();
        let body = parse_one(&arena, "puts \"hi\", 2");
        let Expr::Call { recv: None, name, args, .. } = &body[0].expr else {
            panic!("expected command call");
        };
        assert_eq!(*name, "puts");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_parse_index_vs_command_array() {
        let arena = Bump::new();
        let body = parse_one(&arena, "a[1]");
        assert!(matches!(body[0].expr, Expr::Index { .. }));
        let body = parse_one(&arena, "puts [1, 2]");
        let Expr::Call { name, args, .. } = &body[0].expr else {
            panic!("expected command call");
        };
        assert_eq!(*name, "puts");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_parse_case_when() {
        let arena = Bump::new();
        let body = parse_one(&arena, "case x\n when 1, 2 then \"a\"\n when 3\n \"b\"\n else\n \"c\"\n end");
        let Expr::Case { subject: Some(_), whens, else_body } = &body[0].expr else {
            panic!("expected case");
        };
        assert_eq!(whens.len(), 2);
        assert_eq!(whens[0].values.len(), 2);
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn test_parse_error_reports_expected_and_got() {
        let err = parse_err("def 42");
        assert!(err.message.contains("expected method name"));
        assert!(err.message.contains("integer 42"));
        assert_eq!(err.kind, "SyntaxError");
    }

    #[test]
    fn test_parse_operator_method_definition() {
        let arena = Bump::new();
        let body = parse_one(&arena, "class V\n def +(o)\n o\n end\n def [](i)\n i\n end\n end");
        let Expr::ClassDef { body, .. } = &body[0].expr else {
            panic!("expected class");
        };
        let Expr::Def { name, .. } = &body[0].expr else {
            panic!("expected def");
        };
        assert_eq!(*name, "+");
        let Expr::Def { name, .. } = &body[1].expr else {
            panic!("expected def");
        };
        assert_eq!(*name, "[]");
    }

    #[test]
    fn test_parse_interpolation() {
        let arena = Bump::new();
        let body = parse_one(&arena, "\"a#{1 + 2}b\"");
        let Expr::Str(parts) = &body[0].expr else {
            panic!("expected string");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[1], StrPart::Interp(_)));
    }

    #[test]
    fn test_parse_ternary_and_range() {
        let arena = Bump::new();
        let body = parse_one(&arena, "x > 0 ? 1..10 : 0...5");
        let Expr::If { then_body, else_body, .. } = &body[0].expr else {
            panic!("expected ternary as if");
        };
        assert!(matches!(then_body[0].expr, Expr::Range { exclusive: false, .. }));
        assert!(matches!(else_body[0].expr, Expr::Range { exclusive: true, .. }));
    }
}
