//! Error types for the guest-language transpiler and VM.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A location in the original guest-language source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Internal error type threaded through the lexer, parser, lowering pass, and VM.
///
/// Parse-time variants (`Syntax`) fail the whole `transpile` call. Runtime
/// variants are converted to [`ErrorRecord`] values at the VM boundary and
/// are locally recoverable via `try`/`catch`, except `OutOfFuel`, `Timeout`,
/// and `Cancelled`, which are terminal.
#[derive(Debug, Error, Clone)]
pub enum VmError {
    #[error("SyntaxError: {message} at {location}")]
    Syntax {
        message: String,
        location: SourceLocation,
    },

    #[error("TypeError: {message}")]
    Type {
        message: String,
        path: Option<String>,
    },

    #[error("ReferenceError: {name} is not defined")]
    Reference { name: String },

    #[error("RuntimeError: {message}")]
    Runtime { message: String, op: Option<String> },

    #[error("CapabilityError: {message}")]
    Capability { message: String, op: Option<String> },

    #[error("UnknownProcedure: {token}")]
    UnknownProcedure { token: String },

    #[error("OutOfFuel while executing {op}")]
    OutOfFuel { op: String },

    #[error("Timeout after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    /// An error record that re-enters `Err` flow unchanged, used by the
    /// parameter prelude's pass-through check (`spec.md` §4.6): a caught
    /// error bound to a scope name and passed into another call keeps its
    /// original kind/path/stack instead of being reported as a fresh error.
    #[error("{message}")]
    Propagated {
        kind: ErrorKind,
        message: String,
        op: Option<String>,
        path: Option<String>,
        stack: Option<Vec<String>>,
        cause: Option<Box<ErrorRecord>>,
    },
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Syntax { .. } => ErrorKind::RuntimeError,
            VmError::Type { .. } => ErrorKind::TypeError,
            VmError::Reference { .. } => ErrorKind::RefError,
            VmError::Runtime { .. } => ErrorKind::RuntimeError,
            VmError::Capability { .. } => ErrorKind::CapabilityError,
            VmError::UnknownProcedure { .. } => ErrorKind::UnknownProcedure,
            VmError::OutOfFuel { .. } => ErrorKind::OutOfFuel,
            VmError::Timeout { .. } => ErrorKind::Timeout,
            VmError::Cancelled => ErrorKind::Cancelled,
            VmError::Propagated { kind, .. } => *kind,
        }
    }

    /// Terminal errors are not observable by guest `try`/`catch`. Driven off
    /// `kind()` rather than the variant so a propagated record carrying a
    /// terminal kind (which can't actually arise, since terminal errors are
    /// never caught in the first place) is still handled correctly.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::OutOfFuel | ErrorKind::Timeout | ErrorKind::Cancelled)
    }

    pub fn op(&self) -> Option<&str> {
        match self {
            VmError::Runtime { op, .. } => op.as_deref(),
            VmError::Capability { op, .. } => op.as_deref(),
            VmError::OutOfFuel { op } => Some(op),
            VmError::Propagated { op, .. } => op.as_deref(),
            _ => None,
        }
    }

    pub fn to_record(&self, stack: &[String]) -> ErrorRecord {
        if let VmError::Propagated {
            kind,
            message,
            op,
            path,
            stack: rec_stack,
            cause,
        } = self
        {
            return ErrorRecord {
                kind: *kind,
                message: message.clone(),
                op: op.clone(),
                path: path.clone(),
                stack: rec_stack.clone(),
                cause: cause.clone(),
            };
        }
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
            op: self.op().map(|s| s.to_string()),
            path: match self {
                VmError::Type { path, .. } => path.clone(),
                _ => None,
            },
            stack: if stack.is_empty() {
                None
            } else {
                Some(stack.to_vec())
            },
            cause: None,
        }
    }

    /// Reconstructs a propagating error from a scope value already shaped
    /// like an `ErrorRecord` (`spec.md` §4.6 parameter prelude pass-through).
    pub fn from_record(record: ErrorRecord) -> Self {
        VmError::Propagated {
            kind: record.kind,
            message: record.message,
            op: record.op,
            path: record.path,
            stack: record.stack,
            cause: record.cause,
        }
    }
}

/// Detects whether a runtime value already has the `{ kind, message, ... }`
/// shape of an `ErrorRecord` (`spec.md` §4.6), e.g. one bound by a `catch`
/// and threaded through as another call's argument.
pub fn as_error_record(value: &serde_json::Value) -> Option<ErrorRecord> {
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// The taxonomy of error kinds observable at the embedding boundary (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    TypeError,
    RefError,
    OutOfFuel,
    Timeout,
    Cancelled,
    CapabilityError,
    UnknownProcedure,
    RuntimeError,
}

/// The boundary-visible error shape: `{ kind, message, op?, path?, stack?, cause? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Names of enclosing `agentRun` callers, innermost first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorRecord>>,
}

impl ErrorRecord {
    pub fn type_error(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TypeError,
            message: message.into(),
            op: None,
            path: Some(path.into()),
            stack: None,
            cause: None,
        }
    }
}
