//! Ruse Compiler: source text to bytecode protos
//!
//! The pipeline is lex → parse → emit. The AST lives in a `bumpalo`
//! arena owned by [`compile`] and is dropped as soon as emission
//! finishes; the returned [`Proto`] owns everything it needs.
//!
//! Symbols are interned into the caller's [`SymbolTable`] so that name
//! ids agree between compiled code and the runtime that executes it.

pub mod ast;
pub mod emit;
pub mod lexer;
pub mod parser;
pub mod token;

use bumpalo::Bump;
use ruse_core::proto::Proto;
use ruse_core::{ErrorInfo, SymbolTable};
use std::rc::Rc;

/// Compile `source` to a top-level proto.
pub fn compile(
    source: &str,
    filename: &str,
    symbols: &mut SymbolTable,
) -> Result<Rc<Proto>, ErrorInfo> {
    let tokens = lexer::lex(source, filename)?;
    let arena = Bump::new();
    let body = parser::parse_program(&arena, &tokens, filename)?;
    emit::compile_program(body, filename, symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruse_core::proto::{Op, ProtoKind};

    #[test]
    fn test_compile_end_to_end() {
        let mut symbols = SymbolTable::new();
        let proto = compile("x = 1 + 2", "<test>", &mut symbols).unwrap();
        assert_eq!(proto.kind, ProtoKind::TopLevel);
        assert!(proto.code.iter().any(|op| matches!(op, Op::Add)));
        assert!(matches!(proto.code.last(), Some(Op::Return)));
    }

    #[test]
    fn test_compile_reports_lex_errors() {
        let mut symbols = SymbolTable::new();
        let err = compile("x = `oops`", "bad.rse", &mut symbols).unwrap_err();
        assert_eq!(err.kind, "SyntaxError");
        assert_eq!(err.filename, "bad.rse");
    }

    #[test]
    fn test_compile_reports_parse_errors() {
        let mut symbols = SymbolTable::new();
        let err = compile("def end", "<test>", &mut symbols).unwrap_err();
        assert_eq!(err.kind, "SyntaxError");
        assert!(err.message.contains("expected"));
    }

    #[test]
    fn test_symbols_shared_with_caller() {
        let mut symbols = SymbolTable::new();
        let before = symbols.len();
        compile("foo(:bar)", "<test>", &mut symbols).unwrap();
        assert!(symbols.len() > before);
    }
}
