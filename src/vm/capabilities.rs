//! The capability bundle (`spec.md` §4.5): externally-supplied
//! implementations of every effectful op, resolved at dispatch time
//! rather than baked into the VM the way the teacher's `ConsoleProvider`/
//! `TimeProvider`/`RandomProvider` platform traits are resolved.
//!
//! Unlike the teacher, which splits one trait per concern, this crate
//! follows `spec.md §4.5`'s single `capabilities` bundle literally: one
//! trait with a method per recognized capability member, plus a
//! `NullCapabilities` default that answers every method with a
//! `CapabilityError`, matching "missing capability methods that are
//! invoked produce a CapabilityError".

use serde_json::Value;

use crate::error::VmError;

/// Console output levels, mirrored from the teacher's `ConsoleLevel`
/// (`platform/mod.rs`) since this crate routes `console.*` through the
/// capability bundle instead of a dedicated provider trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

/// A host-supplied abort signal, threaded into every suspension-point
/// capability call so cancellation (`spec.md` §5) can reach in-flight
/// work promptly.
pub trait AbortSignal {
    fn is_aborted(&self) -> bool;
}

/// A signal that never fires, used when the host has no cancellation
/// mechanism of its own.
pub struct NeverAbort;

impl AbortSignal for NeverAbort {
    fn is_aborted(&self) -> bool {
        false
    }
}

fn missing(op: &str) -> VmError {
    VmError::Capability {
        message: format!("capability '{op}' is not implemented by this host"),
        op: Some(op.to_string()),
    }
}

/// The effectful surface a guest program can reach (`spec.md` §4.5
/// table). Every method receives the run's `context` value (opaque
/// per-request metadata, e.g. caller identity) and an abort signal.
pub trait Capabilities {
    fn fetch(&self, url: &str, init: &Value, context: &Value, abort: &dyn AbortSignal) -> Result<Value, VmError> {
        let _ = (url, init, context, abort);
        Err(missing("httpFetch"))
    }

    fn store_get(&self, key: &str, context: &Value) -> Result<Value, VmError> {
        let _ = (key, context);
        Err(missing("storeGet"))
    }

    fn store_set(&self, key: &str, value: &Value, context: &Value) -> Result<(), VmError> {
        let _ = (key, value, context);
        Err(missing("storeSet"))
    }

    fn store_delete(&self, key: &str, context: &Value) -> Result<(), VmError> {
        let _ = (key, context);
        Err(missing("storeDelete"))
    }

    fn llm_predict(&self, request: &Value, context: &Value, abort: &dyn AbortSignal) -> Result<Value, VmError> {
        let _ = (request, context, abort);
        Err(missing("llmPredict"))
    }

    /// Resolves and invokes another agent by registered name or procedure
    /// token. Token-vs-name precedence is the VM's responsibility
    /// (`DESIGN.md`); this method only runs whichever agent the VM already
    /// resolved, identified here by its opaque `agent_id`.
    fn agent_run(&self, agent_id: &str, input: &Value, context: &Value, abort: &dyn AbortSignal) -> Result<Value, VmError> {
        let _ = (agent_id, input, context, abort);
        Err(missing("agentRun"))
    }

    /// Monotonic time source in milliseconds, used for `timeoutMs`
    /// enforcement and for deterministic `random`/`uuid` seeding
    /// (`spec.md` §4.5). Defaults to the host clock.
    fn clock_now(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn console(&self, level: ConsoleLevel, message: &str) {
        let _ = (level, message);
    }
}

/// Default bundle used when the host wires up no capabilities at all
/// (`spec.md` §4.5: every member is "missing" and thus a `CapabilityError`
/// on use). `console`/`clock_now` keep their harmless default behavior
/// since those two have no meaningful "missing" state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCapabilities;

impl Capabilities for NullCapabilities {}
