//! Procedure store (`spec.md` §4.8): a process-wide, append-only registry
//! mapping opaque fingerprint tokens to previously-lowered Agent ASTs.
//!
//! Grounded in the teacher's `string_dict.rs` interning table (a
//! `rustc_hash::FxHashMap` guarding a stable-handle registry keyed by
//! content) and in `spec.md §9`'s redesign note ("the procedure store as
//! global mutable state becomes an explicit registry owned by the host").

use std::sync::RwLock;

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::ast::Instruction;
use crate::error::VmError;

/// An opaque, content-addressed handle to a stored Agent AST. Stable
/// within a process; two identical ASTs always produce the same token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn fingerprint(ast: &Instruction) -> Result<Token, VmError> {
    let canonical = serde_json::to_vec(ast).map_err(|e| VmError::Runtime {
        message: format!("failed to canonicalize AST for fingerprinting: {e}"),
        op: Some("storeProcedure".into()),
    })?;
    let digest = Sha256::digest(&canonical);
    Ok(Token(hex_encode(&digest)))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Owned per-host, shared across every `Vm::run` call via a shared
/// reference (`spec.md` §5 "the procedure store is process-wide and must
/// serialize writes").
#[derive(Default)]
pub struct ProcedureStore {
    table: RwLock<FxHashMap<Token, std::rc::Rc<Instruction>>>,
}

impl ProcedureStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(FxHashMap::default()),
        }
    }

    /// Stores `ast`, returning its content-addressed token. Storing the
    /// same AST twice returns the same token and does not duplicate the
    /// entry.
    pub fn store(&self, ast: Instruction) -> Result<Token, VmError> {
        let token = fingerprint(&ast)?;
        let mut table = self.table.write().map_err(|_| poisoned())?;
        table.entry(token.clone()).or_insert_with(|| std::rc::Rc::new(ast));
        Ok(token)
    }

    pub fn resolve(&self, token: &Token) -> Result<std::rc::Rc<Instruction>, VmError> {
        let table = self.table.read().map_err(|_| poisoned())?;
        table.get(token).cloned().ok_or_else(|| VmError::UnknownProcedure {
            token: token.as_str().to_string(),
        })
    }

    /// Looks up a token by its string form, used when `agentRun`'s
    /// `agentId` field is checked against the store before falling back
    /// to name-based capability resolution (`DESIGN.md`: tokens shadow
    /// names).
    pub fn resolve_str(&self, token: &str) -> Option<std::rc::Rc<Instruction>> {
        let table = self.table.read().ok()?;
        table.get(&Token(token.to_string())).cloned()
    }

    /// Clears the whole registry. Used in tests (`spec.md` §4.8).
    pub fn clear(&self) {
        if let Ok(mut table) = self.table.write() {
            table.clear();
        }
    }
}

fn poisoned() -> VmError {
    VmError::Runtime {
        message: "procedure store lock was poisoned by a panicking writer".into(),
        op: Some("procedureStore".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Instruction;

    #[test]
    fn round_trips_an_ast() {
        let store = ProcedureStore::new();
        let ast = Instruction::Seq { steps: vec![] };
        let token = store.store(ast).unwrap();
        let resolved = store.resolve(&token).unwrap();
        assert!(matches!(&*resolved, Instruction::Seq { steps } if steps.is_empty()));
    }

    #[test]
    fn storing_identical_ast_twice_yields_same_token() {
        let store = ProcedureStore::new();
        let a = Instruction::Seq { steps: vec![] };
        let b = Instruction::Seq { steps: vec![] };
        assert_eq!(store.store(a).unwrap(), store.store(b).unwrap());
    }

    #[test]
    fn unknown_token_is_an_error() {
        let store = ProcedureStore::new();
        let err = store.resolve(&Token("deadbeef".into())).unwrap_err();
        assert!(matches!(err, VmError::UnknownProcedure { .. }));
    }
}
