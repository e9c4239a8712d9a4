//! Ruse Core: shared primitives for the Ruse interpreter
//!
//! This crate holds the pieces both the compiler and the runtime need but
//! that belong to neither: interned symbols, the compiled function format
//! (protos and opcodes), the error taxonomy the host sees, and the
//! resource-budget bookkeeping.
//!
//! # Modules
//!
//! - `symbol`: interned identifiers with stable u32 ids
//! - `proto`: the compiled function format (opcodes, constant pool,
//!   exception table, line map)
//! - `error`: host-visible error kinds, status codes, and formatting
//! - `limits`: budget caps and the meters that enforce them

pub mod error;
pub mod limits;
pub mod proto;
pub mod symbol;

pub use error::{ErrorInfo, ExcKind, Status, TraceEntry};
pub use limits::{Limits, MemTicket, Meters};
pub use proto::{
    CallFlags, Const, HandlerKind, KwParam, Op, ParamInfo, Proto, ProtoKind, Region, UpvalDesc,
};
pub use symbol::{Symbol, SymbolTable};
