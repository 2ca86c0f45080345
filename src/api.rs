//! The transpiler entry point: source text in, Agent AST + signature out.
//!
//! Mirrors the teacher's two-phase `lexer` -> `parser` pipeline, adding the
//! lowering pass as a third phase (`parser::parse` -> `lowering::transform`).

use crate::error::VmError;
use crate::lowering::{self, LoweringOutput};
use crate::parser::{self, ReturnMarker};
use crate::types::Signature;

/// The result of a successful `transpile` call: a ready-to-run Agent AST
/// plus the metadata extracted from the guest function's declaration.
#[derive(Debug, Clone)]
pub struct TranspileOutput {
    pub ast: crate::ast::Instruction,
    pub signature: Signature,
    pub return_marker: Option<ReturnMarker>,
    /// Non-fatal diagnostics collected during lowering, e.g. an untyped
    /// parameter falling back to `any`.
    pub warnings: Vec<String>,
}

impl From<LoweringOutput> for TranspileOutput {
    fn from(out: LoweringOutput) -> Self {
        Self {
            ast: out.ast,
            signature: out.signature,
            return_marker: out.return_marker,
            warnings: out.warnings,
        }
    }
}

/// Parses and lowers a single-function guest program into an Agent AST.
///
/// ```
/// use agentscript_vm::transpile;
///
/// let out = transpile("function add(a: 0, b: 0) { return a + b; }").unwrap();
/// assert_eq!(out.signature.name, "add");
/// assert_eq!(out.signature.parameters.len(), 2);
/// ```
pub fn transpile(source: &str) -> Result<TranspileOutput, VmError> {
    let program = parser::parse(source)?;
    let lowered = lowering::transform(&program)?;
    Ok(lowered.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpiles_a_minimal_function() {
        let out = transpile("function f(x: 0) { return x; }").unwrap();
        assert_eq!(out.signature.name, "f");
        assert!(matches!(out.ast, crate::ast::Instruction::Seq { .. }));
    }

    #[test]
    fn surfaces_syntax_errors() {
        let err = transpile("function (").unwrap_err();
        assert!(matches!(err, VmError::Syntax { .. }));
    }
}
