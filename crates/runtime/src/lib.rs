//! Ruse Runtime: the embeddable interpreter
//!
//! Hosts create an [`Interp`], call [`Interp::open_base`] to install the
//! primitive kernel, then evaluate source and exchange [`Value`]s:
//!
//! ```
//! use ruse_runtime::{Config, Interp, Value};
//!
//! let mut interp = Interp::new(Config::default());
//! interp.open_base().unwrap();
//! let out = interp.eval("1 + 2 * 3", "<host>").unwrap();
//! assert!(matches!(out, Value::Int(7)));
//! ```
//!
//! Resource budgets (instructions, allocations, call depth, live bytes)
//! come from [`Config`] and can be adjusted between invocations; any
//! exceedance surfaces as a rescuable `RuntimeError` naming the budget.
//!
//! # Modules
//!
//! - `value`: the tagged value representation and heap records
//! - `object`: classes, modules, method tables, ancestry
//! - `fiber`: fiber records and call frames
//! - `vm`: the dispatch loop, unwinding, fiber switching
//! - `kernel`: native primitives plus the bytecode prelude
//! - `interp`: interpreter state and the host embedding API
//! - `vfs`: the `{exists, read}` file-system contract for `require`
//! - `userdata`: opaque host payloads with finalizers and tombstoning

pub mod fiber;
pub mod interp;
pub mod kernel;
pub mod object;
pub mod userdata;
pub mod value;
pub mod vfs;
pub mod vm;

pub use interp::{Config, Interp};
pub use ruse_core::{ErrorInfo, Limits, Status};
pub use userdata::Finalizer;
pub use value::Value;
pub use vfs::{DirVfs, MemVfs, Vfs};
pub use vm::{BlockSignal, Flow, NativeArgs, NativeFn, Vm};
