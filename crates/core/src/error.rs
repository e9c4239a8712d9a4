//! Host-visible error taxonomy
//!
//! Every failure that escapes an embedding entry point is reduced to an
//! [`ErrorInfo`]: a status code, the exception kind, a message, and the
//! source position the failure was raised at. The interpreter keeps the
//! most recent one in a last-error slot so C-style hosts can poll it; the
//! Rust API also returns it directly through `Result`.

use std::fmt;
use thiserror::Error;

/// Coarse status an embedding call resolves to. `Ok` is zero so the value
/// doubles as a C-style return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    /// The source failed to lex or parse.
    SyntaxError = 1,
    /// The source parsed but could not be lowered to bytecode.
    CompileError = 2,
    /// Execution failed: unrescued raise, budget exhaustion, type errors.
    Runtime = 3,
}

/// The built-in exception classes. User subclasses carry their own class
/// name; this enum only names the roots the runtime itself raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    StandardError,
    RuntimeError,
    TypeError,
    NameError,
    NoMethodError,
    ArgumentError,
    ZeroDivisionError,
}

impl ExcKind {
    /// The class name, as spelled in the language.
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::StandardError => "StandardError",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::TypeError => "TypeError",
            ExcKind::NameError => "NameError",
            ExcKind::NoMethodError => "NoMethodError",
            ExcKind::ArgumentError => "ArgumentError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
        }
    }

    /// Superclass in the built-in hierarchy. `StandardError` is the root
    /// (its own superclass is `Object`, which is not an exception kind).
    pub fn parent(self) -> Option<ExcKind> {
        match self {
            ExcKind::StandardError => None,
            ExcKind::NoMethodError => Some(ExcKind::NameError),
            _ => Some(ExcKind::StandardError),
        }
    }
}

/// One frame of a captured backtrace, derived from proto line maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub filename: String,
    pub line: u32,
    pub method_name: String,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:in `{}`", self.filename, self.line, self.method_name)
    }
}

/// The last-error record: everything `format_error` needs.
///
/// Display renders the canonical host format:
/// `<filename>:<line>: <kind>: <message>`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{filename}:{line}: {kind}: {message}")]
pub struct ErrorInfo {
    pub status: Status,
    /// Exception class name, or `"SyntaxError"` / `"CompileError"` for
    /// pre-execution failures.
    pub kind: String,
    pub message: String,
    pub filename: String,
    pub line: u32,
    pub column: u32,
    pub backtrace: Vec<TraceEntry>,
}

impl ErrorInfo {
    pub fn syntax(message: impl Into<String>, filename: &str, line: u32, column: u32) -> Self {
        ErrorInfo {
            status: Status::SyntaxError,
            kind: "SyntaxError".to_string(),
            message: message.into(),
            filename: filename.to_string(),
            line,
            column,
            backtrace: Vec::new(),
        }
    }

    pub fn compile(message: impl Into<String>, filename: &str, line: u32) -> Self {
        ErrorInfo {
            status: Status::CompileError,
            kind: "CompileError".to_string(),
            message: message.into(),
            filename: filename.to_string(),
            line,
            column: 0,
            backtrace: Vec::new(),
        }
    }

    pub fn runtime(
        kind: impl Into<String>,
        message: impl Into<String>,
        filename: &str,
        line: u32,
    ) -> Self {
        ErrorInfo {
            status: Status::Runtime,
            kind: kind.into(),
            message: message.into(),
            filename: filename.to_string(),
            line,
            column: 0,
            backtrace: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_format_matches_host_contract() {
        let err = ErrorInfo::runtime("ZeroDivisionError", "divided by 0", "game.rse", 12);
        assert_eq!(err.to_string(), "game.rse:12: ZeroDivisionError: divided by 0");
    }

    #[test]
    fn test_exc_hierarchy_roots_at_standard_error() {
        let mut kind = ExcKind::NoMethodError;
        let mut hops = 0;
        while let Some(parent) = kind.parent() {
            kind = parent;
            hops += 1;
            assert!(hops < 10);
        }
        assert_eq!(kind, ExcKind::StandardError);
    }

    #[test]
    fn test_status_is_c_compatible() {
        assert_eq!(Status::Ok as i32, 0);
        assert_ne!(Status::Runtime as i32, 0);
    }
}
