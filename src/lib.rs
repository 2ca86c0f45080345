//! A sandboxed execution runtime for a small JavaScript-subset guest
//! language, designed for hosting untrusted agent programs.
//!
//! The crate is exactly two coupled subsystems:
//!
//! - a **transpiler** ([`transpile`]) that parses a single guest function
//!   and lowers it into a JSON-like Agent AST ([`ast::Instruction`]) plus a
//!   [`Signature`] describing its parameters and return type;
//! - a **VM** ([`Vm`]) that runs an Agent AST against a JSON input value
//!   under a fuel budget, a wall-clock timeout, and a host-supplied
//!   [`Capabilities`] bundle.
//!
//! Everything the guest program can do beyond pure computation — network
//! calls, key/value storage, LLM calls, console output, running another
//! agent — is mediated through `Capabilities`; the VM itself never touches
//! the outside world.
//!
//! # Quick Start
//!
//! ```
//! use agentscript_vm::{transpile, Vm, RunOptions, NullCapabilities, NeverAbort, ProcedureStore};
//! use serde_json::json;
//!
//! let out = transpile("function add(a: 0, b: 0) { return a + b; }").unwrap();
//!
//! let capabilities = NullCapabilities;
//! let procedures = ProcedureStore::new();
//! let abort = NeverAbort;
//!
//! let outcome = Vm::run(
//!     &out.ast,
//!     json!({ "a": 1, "b": 2 }),
//!     RunOptions::default(),
//!     &capabilities,
//!     &procedures,
//!     &abort,
//! );
//!
//! assert_eq!(outcome.result, Some(json!({ "__result__": 3.0 })));
//! ```
//!
//! # Execution Model
//!
//! [`Vm::run`] is a single synchronous call: it walks the Agent AST with a
//! tree-walking dispatch loop, charging fuel at every instruction and
//! expression node and checking the wall-clock timeout at every loop
//! iteration and block boundary. There is no incremental `step()` — a run
//! either completes, fails with a recoverable [`ErrorRecord`], or is cut
//! off by fuel exhaustion, timeout, or cancellation via an [`AbortSignal`].
//! Guest `try`/`catch` can observe and recover from the first kind of
//! failure; the latter three are terminal and always propagate to
//! [`RunOutcome::error`].
//!
//! # Working with Capabilities
//!
//! Hosts that want to expose real effects (HTTP, storage, nested agent
//! runs) implement the [`Capabilities`] trait. Methods left unimplemented
//! by a host's wrapper fail the guest operation with a `CapabilityError`
//! rather than panicking — see [`NullCapabilities`] for the all-refusing
//! default:
//!
//! ```
//! use agentscript_vm::{Capabilities, ConsoleLevel};
//!
//! struct LoggingOnly;
//!
//! impl Capabilities for LoggingOnly {
//!     fn console(&self, level: ConsoleLevel, message: &str) {
//!         println!("[{level:?}] {message}");
//!     }
//! }
//! ```
//!
//! # Running Stored Procedures
//!
//! Agent ASTs can be registered in a process-wide [`ProcedureStore`] and
//! later invoked by token from within another run's `agentRun` step,
//! without a host round-trip:
//!
//! ```
//! use agentscript_vm::{transpile, ProcedureStore};
//!
//! let store = ProcedureStore::new();
//! let out = transpile("function identity(x) { return x; }").unwrap();
//! let token = store.store(out.ast).unwrap();
//! assert!(store.resolve(&token).is_ok());
//! ```

pub mod api;
pub mod ast;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod lowering;
pub mod parser;
pub mod procedure_store;
pub mod types;
pub mod vm;

pub use api::{transpile, TranspileOutput};
pub use error::{ErrorKind, ErrorRecord, VmError};
pub use procedure_store::{ProcedureStore, Token};
pub use types::{ParamDescriptor, Signature, TypeDescriptor};
pub use vm::{
    AbortSignal, Capabilities, ConsoleLevel, CostOverrides, NeverAbort, NullCapabilities,
    RunOptions, RunOutcome, TraceOutcome, TraceRecord, Vm,
};

/// Registers `ast` in `store`, returning its content-addressed token.
/// Thin wrapper kept at crate root alongside [`transpile`] so the common
/// "transpile, then make runnable by token" path doesn't require reaching
/// into the `procedure_store` module directly.
pub fn store_procedure(store: &ProcedureStore, ast: ast::Instruction) -> Result<Token, VmError> {
    store.store(ast)
}

/// Looks up a previously stored Agent AST by its token.
pub fn resolve_procedure(
    store: &ProcedureStore,
    token: &Token,
) -> Result<std::rc::Rc<ast::Instruction>, VmError> {
    store.resolve(token)
}

/// Clears every entry from `store`. Intended for test harnesses that reuse
/// a single process-wide store across independent cases.
pub fn clear_procedures(store: &ProcedureStore) {
    store.clear();
}
