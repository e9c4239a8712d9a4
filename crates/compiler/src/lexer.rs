//! Lexer: source text to token stream
//!
//! Single pass, byte-oriented, position-tracked. Statement-ending newlines
//! become [`TokenKind::Newline`] tokens; newlines after a binary operator,
//! open bracket, comma, or a trailing backslash are swallowed so the
//! statement continues.
//!
//! String scanning has three modes: `'…'` (escapes limited to `\'` and
//! `\\`), `"…"` with escapes and `#{…}` interpolation, and heredocs.
//! Heredoc bodies are deferred: `<<TAG` emits a placeholder string token
//! and records a pending heredoc, the rest of the line lexes normally, and
//! the body is collected starting at the next newline (several heredocs
//! may stack on one line). `<<-TAG` additionally allows the terminator to
//! be indented.
//!
//! Disambiguation:
//! - `&.` and `&:name` are single tokens.
//! - `:` followed by an identifier character starts a symbol; otherwise
//!   it is punctuation (ternary, hash shorthand).
//! - A trailing `?` or `!` is part of an identifier only when written
//!   adjacent to it (`alive?` yes, `x ? y : z` no).
//! - `<<` followed by an identifier character or `-`/`"` starts a heredoc
//!   when it appears where a value may begin; elsewhere it is shift.

use crate::token::{Kw, StrPiece, Token, TokenKind};
use ruse_core::ErrorInfo;

struct PendingHeredoc {
    tag: String,
    allow_indent: bool,
    token_index: usize,
}

pub struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    line: u32,
    col: u32,
    filename: String,
    tokens: Vec<Token>,
    pending_heredocs: Vec<PendingHeredoc>,
}

/// Lex `source` into a token vector terminated by `Eof`.
pub fn lex(source: &str, filename: &str) -> Result<Vec<Token>, ErrorInfo> {
    let mut lexer = Lexer {
        src: source.as_bytes(),
        pos: 0,
        line: 1,
        col: 0,
        filename: filename.to_string(),
        tokens: Vec::new(),
        pending_heredocs: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl<'src> Lexer<'src> {
    fn run(&mut self) -> Result<(), ErrorInfo> {
        loop {
            self.skip_spaces_and_comments();
            if self.at_end() {
                if let Some(pending) = self.pending_heredocs.first() {
                    return Err(self.err(format!(
                        "unterminated heredoc (missing '{}')",
                        pending.tag
                    )));
                }
                self.push(TokenKind::Eof);
                return Ok(());
            }
            if self.peek() == b'\n' {
                self.take_newline()?;
                continue;
            }
            let token = self.next_token()?;
            self.tokens.push(token);
        }
    }

    // ---- low-level cursor ----

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> u8 {
        self.src[self.pos]
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> u8 {
        let b = self.src[self.pos];
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        b
    }

    fn eat(&mut self, b: u8) -> bool {
        if !self.at_end() && self.peek() == b {
            self.bump();
            true
        } else {
            false
        }
    }

    fn push(&mut self, kind: TokenKind) {
        let token = Token::new(kind, self.line, self.col);
        self.tokens.push(token);
    }

    fn err(&self, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo::syntax(message, &self.filename, self.line, self.col)
    }

    fn skip_spaces_and_comments(&mut self) {
        while !self.at_end() {
            match self.peek() {
                b' ' | b'\t' | b'\r' => {
                    self.bump();
                }
                b'#' => {
                    while !self.at_end() && self.peek() != b'\n' {
                        self.bump();
                    }
                }
                b'\\' if self.peek_at(1) == Some(b'\n') => {
                    self.bump();
                    self.bump();
                }
                _ => return,
            }
        }
    }

    // ---- newlines and heredoc bodies ----

    fn take_newline(&mut self) -> Result<(), ErrorInfo> {
        self.bump();
        // Heredoc bodies begin immediately after the line that opened them.
        if !self.pending_heredocs.is_empty() {
            self.collect_heredoc_bodies()?;
        }
        let significant = match self.tokens.last() {
            None => false,
            Some(tok) => !matches!(tok.kind, TokenKind::Newline | TokenKind::Semi)
                && !tok.kind.continues_line(),
        };
        if significant {
            self.push(TokenKind::Newline);
        }
        Ok(())
    }

    fn collect_heredoc_bodies(&mut self) -> Result<(), ErrorInfo> {
        let pending = std::mem::take(&mut self.pending_heredocs);
        for heredoc in pending {
            let body_line = self.line;
            let mut body = String::new();
            loop {
                if self.at_end() {
                    return Err(self.err(format!(
                        "unterminated heredoc (missing '{}')",
                        heredoc.tag
                    )));
                }
                let line_start = self.pos;
                while !self.at_end() && self.peek() != b'\n' {
                    self.bump();
                }
                let line = std::str::from_utf8(&self.src[line_start..self.pos])
                    .map_err(|_| self.err("invalid utf-8 in heredoc body"))?
                    .to_string();
                if !self.at_end() {
                    self.bump();
                }
                let candidate = if heredoc.allow_indent { line.trim_start() } else { line.as_str() };
                if candidate == heredoc.tag {
                    break;
                }
                body.push_str(&line);
                body.push('\n');
            }
            let pieces = self.scan_string_pieces_from(&body, body_line)?;
            self.tokens[heredoc.token_index].kind = TokenKind::Str(pieces);
        }
        Ok(())
    }

    // ---- token scanning ----

    fn next_token(&mut self) -> Result<Token, ErrorInfo> {
        let line = self.line;
        let col = self.col;
        let kind = self.next_kind()?;
        Ok(Token::new(kind, line, col))
    }

    fn next_kind(&mut self) -> Result<TokenKind, ErrorInfo> {
        let b = self.peek();
        match b {
            b'0'..=b'9' => self.scan_number(),
            b'\'' => self.scan_sq_string(),
            b'"' => self.scan_dq_string(),
            b'@' => self.scan_at_var(),
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => Ok(self.scan_ident()),
            _ => self.scan_punct(),
        }
    }

    fn is_ident_char(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_'
    }

    fn is_ident_start(b: u8) -> bool {
        b.is_ascii_alphabetic() || b == b'_'
    }

    fn scan_ident(&mut self) -> TokenKind {
        let start = self.pos;
        while !self.at_end() && Self::is_ident_char(self.peek()) {
            self.bump();
        }
        // alive? / empty! style names: sigil must be adjacent
        if !self.at_end() && (self.peek() == b'?' || self.peek() == b'!') {
            let next = self.peek_at(1);
            let stand_alone_bang = self.peek() == b'!' && next == Some(b'=');
            if !stand_alone_bang {
                self.bump();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap().to_string();
        if let Some(kw) = Kw::from_ident(&text) {
            TokenKind::Kw(kw)
        } else if text.as_bytes()[0].is_ascii_uppercase() {
            TokenKind::ConstName(text)
        } else {
            TokenKind::Ident(text)
        }
    }

    fn scan_at_var(&mut self) -> Result<TokenKind, ErrorInfo> {
        self.bump(); // @
        let class_var = self.eat(b'@');
        if self.at_end() || !Self::is_ident_start(self.peek()) {
            return Err(self.err("expected variable name after '@'"));
        }
        let start = self.pos;
        while !self.at_end() && Self::is_ident_char(self.peek()) {
            self.bump();
        }
        let name = std::str::from_utf8(&self.src[start..self.pos]).unwrap().to_string();
        Ok(if class_var { TokenKind::Cvar(name) } else { TokenKind::Ivar(name) })
    }

    fn scan_number(&mut self) -> Result<TokenKind, ErrorInfo> {
        let start = self.pos;
        while !self.at_end() && (self.peek().is_ascii_digit() || self.peek() == b'_') {
            self.bump();
        }
        let mut is_float = false;
        if !self.at_end()
            && self.peek() == b'.'
            && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            self.bump();
            while !self.at_end() && (self.peek().is_ascii_digit() || self.peek() == b'_') {
                self.bump();
            }
        }
        if !self.at_end() && (self.peek() == b'e' || self.peek() == b'E') {
            let after = self.peek_at(1);
            let after2 = self.peek_at(2);
            let exp_ok = after.is_some_and(|c| c.is_ascii_digit())
                || (matches!(after, Some(b'+') | Some(b'-'))
                    && after2.is_some_and(|c| c.is_ascii_digit()));
            if exp_ok {
                is_float = true;
                self.bump();
                if matches!(self.peek(), b'+' | b'-') {
                    self.bump();
                }
                while !self.at_end() && self.peek().is_ascii_digit() {
                    self.bump();
                }
            }
        }
        let text: String = std::str::from_utf8(&self.src[start..self.pos])
            .unwrap()
            .chars()
            .filter(|&c| c != '_')
            .collect();
        if is_float {
            let v: f64 = text.parse().map_err(|_| self.err(format!("invalid float '{text}'")))?;
            Ok(TokenKind::Float(v))
        } else {
            let v: i64 = text.parse().map_err(|_| self.err(format!("integer '{text}' out of range")))?;
            Ok(TokenKind::Int(v))
        }
    }

    fn scan_sq_string(&mut self) -> Result<TokenKind, ErrorInfo> {
        self.bump(); // '
        let mut bytes = Vec::new();
        loop {
            if self.at_end() {
                return Err(self.err("unterminated string literal"));
            }
            match self.bump() {
                b'\'' => break,
                b'\\' if !self.at_end() && (self.peek() == b'\'' || self.peek() == b'\\') => {
                    bytes.push(self.bump());
                }
                other => bytes.push(other),
            }
        }
        let text = String::from_utf8(bytes).map_err(|_| self.err("invalid utf-8 in string"))?;
        Ok(TokenKind::Str(vec![StrPiece::Lit(text)]))
    }

    fn scan_dq_string(&mut self) -> Result<TokenKind, ErrorInfo> {
        self.bump(); // "
        let mut pieces = Vec::new();
        let mut lit: Vec<u8> = Vec::new();
        loop {
            if self.at_end() {
                return Err(self.err("unterminated string literal"));
            }
            match self.bump() {
                b'"' => break,
                b'\\' => {
                    if self.at_end() {
                        return Err(self.err("unterminated string literal"));
                    }
                    lit.push(Self::unescape(self.bump()));
                }
                b'#' if !self.at_end() && self.peek() == b'{' => {
                    self.bump(); // {
                    if !lit.is_empty() {
                        pieces.push(self.finish_lit(std::mem::take(&mut lit))?);
                    }
                    let expr_tokens = self.scan_interp_tokens()?;
                    pieces.push(StrPiece::Interp(expr_tokens));
                }
                other => lit.push(other),
            }
        }
        if !lit.is_empty() || pieces.is_empty() {
            pieces.push(self.finish_lit(lit)?);
        }
        Ok(TokenKind::Str(pieces))
    }

    fn finish_lit(&self, bytes: Vec<u8>) -> Result<StrPiece, ErrorInfo> {
        String::from_utf8(bytes)
            .map(StrPiece::Lit)
            .map_err(|_| self.err("invalid utf-8 in string"))
    }

    fn unescape(b: u8) -> u8 {
        match b {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            b'e' => 0x1b,
            other => other,
        }
    }

    /// Collect the tokens of one `#{…}` expression; consumes the closing
    /// brace and appends an `Eof` so a sub-parser can run over the result.
    fn scan_interp_tokens(&mut self) -> Result<Vec<Token>, ErrorInfo> {
        let mut tokens = Vec::new();
        let mut depth = 0usize;
        loop {
            self.skip_spaces_and_comments();
            if self.at_end() {
                return Err(self.err("unterminated interpolation"));
            }
            if self.peek() == b'\n' {
                self.bump();
                continue;
            }
            if self.peek() == b'}' && depth == 0 {
                self.bump();
                break;
            }
            let token = self.next_token()?;
            match token.kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth -= 1,
                _ => {}
            }
            tokens.push(token);
        }
        tokens.push(Token::new(TokenKind::Eof, self.line, self.col));
        Ok(tokens)
    }

    /// Scan an already-collected heredoc body into string pieces,
    /// including interpolation (lexed by a sub-lexer over the body text).
    fn scan_string_pieces_from(
        &self,
        body: &str,
        base_line: u32,
    ) -> Result<Vec<StrPiece>, ErrorInfo> {
        let bytes = body.as_bytes();
        let mut pieces = Vec::new();
        let mut lit: Vec<u8> = Vec::new();
        let mut i = 0usize;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'\\' && i + 1 < bytes.len() {
                lit.push(Self::unescape(bytes[i + 1]));
                i += 2;
            } else if b == b'#' && bytes.get(i + 1) == Some(&b'{') {
                if !lit.is_empty() {
                    pieces.push(self.finish_lit(std::mem::take(&mut lit))?);
                }
                let mut sub = Lexer {
                    src: &bytes[i + 2..],
                    pos: 0,
                    line: base_line,
                    col: 0,
                    filename: self.filename.clone(),
                    tokens: Vec::new(),
                    pending_heredocs: Vec::new(),
                };
                let tokens = sub.scan_interp_tokens()?;
                i += 2 + sub.pos;
                pieces.push(StrPiece::Interp(tokens));
            } else {
                lit.push(b);
                i += 1;
            }
        }
        if !lit.is_empty() || pieces.is_empty() {
            pieces.push(self.finish_lit(lit)?);
        }
        Ok(pieces)
    }

    fn scan_heredoc_start(&mut self) -> Result<TokenKind, ErrorInfo> {
        let allow_indent = self.eat(b'-');
        let quoted = self.eat(b'"');
        if self.at_end() || !Self::is_ident_start(self.peek()) {
            return Err(self.err("expected heredoc tag after '<<'"));
        }
        let start = self.pos;
        while !self.at_end() && Self::is_ident_char(self.peek()) {
            self.bump();
        }
        let tag = std::str::from_utf8(&self.src[start..self.pos]).unwrap().to_string();
        if quoted && !self.eat(b'"') {
            return Err(self.err("unterminated heredoc tag"));
        }
        self.pending_heredocs.push(PendingHeredoc {
            tag,
            allow_indent,
            token_index: self.tokens.len(),
        });
        // Placeholder; the body is filled in at the next newline.
        Ok(TokenKind::Str(Vec::new()))
    }

    /// Shift vs heredoc: `<<` begins a heredoc only where a value can
    /// begin, i.e. not after an expression-ending token.
    fn heredoc_position(&self) -> bool {
        match self.tokens.last().map(|t| &t.kind) {
            None => true,
            Some(kind) => !matches!(
                kind,
                TokenKind::Ident(_)
                    | TokenKind::ConstName(_)
                    | TokenKind::Ivar(_)
                    | TokenKind::Cvar(_)
                    | TokenKind::Int(_)
                    | TokenKind::Float(_)
                    | TokenKind::Str(_)
                    | TokenKind::RParen
                    | TokenKind::RBracket
                    | TokenKind::Kw(Kw::SelfKw)
                    | TokenKind::Kw(Kw::Nil)
                    | TokenKind::Kw(Kw::True)
                    | TokenKind::Kw(Kw::False)
                    | TokenKind::Kw(Kw::End)
            ),
        }
    }

    fn scan_punct(&mut self) -> Result<TokenKind, ErrorInfo> {
        use TokenKind::*;
        let b = self.bump();
        let kind = match b {
            b'+' => {
                if self.eat(b'=') { PlusAssign } else { Plus }
            }
            b'-' => {
                if self.eat(b'=') { MinusAssign } else { Minus }
            }
            b'*' => {
                if self.eat(b'*') {
                    StarStar
                } else if self.eat(b'=') {
                    StarAssign
                } else {
                    Star
                }
            }
            b'/' => {
                if self.eat(b'=') { SlashAssign } else { Slash }
            }
            b'%' => {
                if self.eat(b'=') { PercentAssign } else { Percent }
            }
            b'=' => {
                if self.eat(b'=') {
                    if self.eat(b'=') { EqEqEq } else { EqEq }
                } else if self.eat(b'>') {
                    FatArrow
                } else {
                    Assign
                }
            }
            b'!' => {
                if self.eat(b'=') { NotEq } else { Bang }
            }
            b'<' => {
                if self.eat(b'=') {
                    if self.eat(b'>') { Spaceship } else { Le }
                } else if !self.at_end()
                    && self.peek() == b'<'
                    && self.heredoc_start_follows()
                {
                    self.bump(); // second <
                    return self.scan_heredoc_start();
                } else if self.eat(b'<') {
                    Shl
                } else {
                    Lt
                }
            }
            b'>' => {
                if self.eat(b'=') {
                    Ge
                } else if self.eat(b'>') {
                    Shr
                } else {
                    Gt
                }
            }
            b'&' => {
                if self.eat(b'&') {
                    if self.eat(b'=') { AndAndAssign } else { AndAnd }
                } else if self.eat(b'.') {
                    AmpDot
                } else if !self.at_end()
                    && self.peek() == b':'
                    && self.peek_at(1).is_some_and(Self::is_ident_start)
                {
                    self.bump(); // :
                    if let TokenKind::Ident(name) | TokenKind::ConstName(name) = self.scan_ident() {
                        BlockSym(name)
                    } else {
                        return Err(self.err("expected method name after '&:'"));
                    }
                } else {
                    Amp
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    if self.eat(b'=') { OrOrAssign } else { OrOr }
                } else {
                    Pipe
                }
            }
            b'^' => Caret,
            b'(' => LParen,
            b')' => RParen,
            b'[' => LBracket,
            b']' => RBracket,
            b'{' => LBrace,
            b'}' => RBrace,
            b',' => Comma,
            b';' => Semi,
            b'?' => Question,
            b'.' => {
                if self.eat(b'.') {
                    if self.eat(b'.') { DotDotDot } else { DotDot }
                } else {
                    Dot
                }
            }
            b':' => {
                if self.eat(b':') {
                    ColonColon
                } else if !self.at_end() && Self::is_ident_start(self.peek()) {
                    match self.scan_ident() {
                        TokenKind::Ident(name) | TokenKind::ConstName(name) => Sym(name),
                        TokenKind::Kw(kw) => Sym(Self::keyword_symbol_name(kw)),
                        _ => return Err(self.err("bad symbol literal")),
                    }
                } else if !self.at_end() && self.symbol_operator_follows() {
                    Sym(self.scan_operator_symbol())
                } else {
                    Colon
                }
            }
            other => {
                return Err(self.err(format!("unexpected character '{}'", other as char)));
            }
        };
        Ok(kind)
    }

    fn heredoc_start_follows(&self) -> bool {
        // self.pos is at the second '<'
        let after = self.src.get(self.pos + 1).copied();
        let starts_tag = matches!(after, Some(c) if Self::is_ident_start(c) || c == b'-' || c == b'"');
        starts_tag && self.heredoc_position()
    }

    fn keyword_symbol_name(kw: Kw) -> String {
        match kw {
            Kw::SelfKw => "self".to_string(),
            Kw::Nil => "nil".to_string(),
            Kw::True => "true".to_string(),
            Kw::False => "false".to_string(),
            other => format!("{other:?}").to_lowercase(),
        }
    }

    fn symbol_operator_follows(&self) -> bool {
        matches!(self.peek(), b'+' | b'-' | b'*' | b'/' | b'%' | b'<' | b'>' | b'=' | b'[' | b'!')
    }

    fn scan_operator_symbol(&mut self) -> String {
        // Longest match over the operator names a class may define.
        const OPS: &[&str] = &[
            "<=>", "===", "==", "!=", "<=", ">=", "<<", ">>", "[]=", "[]", "**", "+", "-", "*",
            "/", "%", "<", ">", "!",
        ];
        for op in OPS {
            if self.src[self.pos..].starts_with(op.as_bytes()) {
                for _ in 0..op.len() {
                    self.bump();
                }
                return (*op).to_string();
            }
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source, "<test>").unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_arithmetic_tokens() {
        use TokenKind::*;
        assert_eq!(
            kinds("1 + 2 * 3"),
            vec![Int(1), Plus, Int(2), Star, Int(3), Eof]
        );
    }

    #[test]
    fn test_float_vs_range() {
        use TokenKind::*;
        assert_eq!(kinds("1.5"), vec![Float(1.5), Eof]);
        assert_eq!(kinds("1..5"), vec![Int(1), DotDot, Int(5), Eof]);
        assert_eq!(kinds("1...5"), vec![Int(1), DotDotDot, Int(5), Eof]);
    }

    #[test]
    fn test_symbol_vs_punctuation() {
        use TokenKind::*;
        assert_eq!(kinds(":foo"), vec![Sym("foo".into()), Eof]);
        assert_eq!(
            kinds("a ? b : c"),
            vec![
                Ident("a".into()),
                Question,
                Ident("b".into()),
                Colon,
                Ident("c".into()),
                Eof
            ]
        );
        assert_eq!(kinds("&:upcase"), vec![BlockSym("upcase".into()), Eof]);
        assert_eq!(
            kinds("x&.y"),
            vec![Ident("x".into()), AmpDot, Ident("y".into()), Eof]
        );
    }

    #[test]
    fn test_predicate_identifier() {
        use TokenKind::*;
        assert_eq!(kinds("f.alive?"), vec![Ident("f".into()), Dot, Ident("alive?".into()), Eof]);
        // != after an identifier stays a comparison
        assert_eq!(
            kinds("a != b"),
            vec![Ident("a".into()), NotEq, Ident("b".into()), Eof]
        );
    }

    #[test]
    fn test_newline_suppression_after_operator() {
        use TokenKind::*;
        assert_eq!(
            kinds("1 +\n2"),
            vec![Int(1), Plus, Int(2), Eof]
        );
        assert_eq!(
            kinds("a = 1\nb = 2"),
            vec![
                Ident("a".into()),
                Assign,
                Int(1),
                Newline,
                Ident("b".into()),
                Assign,
                Int(2),
                Eof
            ]
        );
    }

    #[test]
    fn test_interpolated_string_pieces() {
        let tokens = lex("\"a#{b + 1}c\"", "<test>").unwrap();
        let TokenKind::Str(pieces) = &tokens[0].kind else {
            panic!("expected string token");
        };
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], StrPiece::Lit("a".into()));
        assert!(matches!(&pieces[1], StrPiece::Interp(inner) if inner.len() == 4));
        assert_eq!(pieces[2], StrPiece::Lit("c".into()));
    }

    #[test]
    fn test_heredoc_body_collection() {
        let tokens = lex("x = <<END\nHello World\nEND\nx", "<test>").unwrap();
        let TokenKind::Str(pieces) = &tokens[2].kind else {
            panic!("expected heredoc placeholder to be filled, got {:?}", tokens[2]);
        };
        assert_eq!(pieces, &vec![StrPiece::Lit("Hello World\n".into())]);
    }

    #[test]
    fn test_heredoc_indented_terminator() {
        let tokens = lex("x = <<-END\n  text\n  END\nx", "<test>").unwrap();
        let TokenKind::Str(pieces) = &tokens[2].kind else {
            panic!("expected heredoc token");
        };
        assert_eq!(pieces, &vec![StrPiece::Lit("  text\n".into())]);
    }

    #[test]
    fn test_heredoc_vs_shift() {
        use TokenKind::*;
        assert_eq!(
            kinds("a << 1"),
            vec![Ident("a".into()), Shl, Int(1), Eof]
        );
    }

    #[test]
    fn test_lex_error_has_position() {
        let err = lex("x = `", "main.rse").unwrap_err();
        assert_eq!(err.kind, "SyntaxError");
        assert_eq!(err.filename, "main.rse");
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_keywords_and_constants() {
        use TokenKind::*;
        assert_eq!(
            kinds("class Foo < Bar"),
            vec![
                Kw(super::Kw::Class),
                ConstName("Foo".into()),
                Lt,
                ConstName("Bar".into()),
                Eof
            ]
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_lexer_never_panics(source in "[ -~\n]{0,200}") {
                // errors are fine; panics are not
                let _ = lex(&source, "<fuzz>");
            }

            #[test]
            fn prop_integer_literals_roundtrip(v in 0i64..=i64::MAX) {
                let tokens = lex(&v.to_string(), "<test>").unwrap();
                prop_assert_eq!(&tokens[0].kind, &TokenKind::Int(v));
            }

            #[test]
            fn prop_identifiers_lex_whole(name in "[a-z][a-z0-9_]{0,20}") {
                prop_assume!(crate::token::Kw::from_ident(&name).is_none());
                let tokens = lex(&name, "<test>").unwrap();
                prop_assert_eq!(&tokens[0].kind, &TokenKind::Ident(name));
            }
        }
    }
}
