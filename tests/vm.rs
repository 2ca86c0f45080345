//! Integration tests for the VM's run-time controls (`spec.md` §4.4, §4.7):
//! the trace buffer, wall-clock timeout enforcement, host fuel-cost
//! overrides, cancellation via `AbortSignal`, and fuel composition across a
//! nested `agentRun`.

use agentscript_vm::{
    transpile, AbortSignal, CostOverrides, ErrorKind, NeverAbort, NullCapabilities, ProcedureStore, RunOptions, Vm,
};
use serde_json::json;

struct AlreadyAborted;

impl AbortSignal for AlreadyAborted {
    fn is_aborted(&self) -> bool {
        true
    }
}

#[test]
fn trace_buffer_records_each_dispatched_instruction() {
    let out = transpile("function f(a: 0) { return a; }").unwrap();
    let procedures = ProcedureStore::new();
    let options = RunOptions {
        trace: true,
        ..RunOptions::default()
    };
    let outcome = Vm::run(
        &out.ast,
        json!({"a": 7}),
        options,
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    assert!(outcome.error.is_none());
    let trace = outcome.trace.expect("trace should be populated when RunOptions::trace is set");
    assert!(!trace.is_empty());
    assert!(trace.iter().any(|r| r.op == "typeCheck"));
    assert!(trace.iter().any(|r| r.op == "return"));
}

#[test]
fn trace_is_absent_by_default() {
    let out = transpile("function f(a: 0) { return a; }").unwrap();
    let procedures = ProcedureStore::new();
    let outcome = Vm::run(
        &out.ast,
        json!({"a": 1}),
        RunOptions::default(),
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    assert!(outcome.trace.is_none());
}

#[test]
fn timeout_cuts_off_a_long_running_loop() {
    let source = "function f(){ let i = 0; while(i < 10000000) { i = i + 1 } return {i} }";
    let out = transpile(source).unwrap();
    let procedures = ProcedureStore::new();
    let options = RunOptions {
        fuel: 500_000_000,
        timeout_ms: 1,
        ..RunOptions::default()
    };
    let outcome = Vm::run(
        &out.ast,
        json!({}),
        options,
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    let error = outcome.error.expect("a 1ms timeout should cut off a ten-million-iteration loop");
    assert_eq!(error.kind, ErrorKind::Timeout);
}

#[test]
fn an_already_aborted_signal_cancels_immediately() {
    let source = "function f(){ let i = 0; while(i < 1000) { i = i + 1 } return {i} }";
    let out = transpile(source).unwrap();
    let procedures = ProcedureStore::new();
    let outcome = Vm::run(
        &out.ast,
        json!({}),
        RunOptions::default(),
        &NullCapabilities,
        &procedures,
        &AlreadyAborted,
    );
    let error = outcome.error.expect("an already-aborted signal should cancel the run");
    assert_eq!(error.kind, ErrorKind::Cancelled);
}

#[test]
fn cost_override_replaces_the_default_op_cost() {
    let source = "function f(){ let r = mathCalc('1 + 1'); return {r} }";
    let out = transpile(source).unwrap();
    let procedures = ProcedureStore::new();

    let mut overrides = CostOverrides::new();
    overrides.set("mathCalc", |_input, _ctx| 1_000);
    let options = RunOptions {
        fuel: 500,
        cost_overrides: overrides,
        ..RunOptions::default()
    };
    let outcome = Vm::run(
        &out.ast,
        json!({}),
        options,
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    let error = outcome.error.expect("a 1000-fuel override on a 500-fuel budget should exhaust it");
    assert_eq!(error.kind, ErrorKind::OutOfFuel);
}

#[test]
fn nested_agent_run_exhausting_its_forked_budget_reports_out_of_fuel() {
    let inner = transpile(
        "function heavy(n:0){ let total = 0; let i = 0; \
         while(i < 1000) { total = total + n; i = i + 1 } return {total} }",
    )
    .unwrap();
    let procedures = ProcedureStore::new();
    let token = procedures.store(inner.ast).unwrap();

    let outer_source = format!("function f(n:0){{ let out = agentRun({{token: '{token}'}}, {{n}}); return out }}");
    let outer = transpile(&outer_source).unwrap();
    let options = RunOptions {
        fuel: 40,
        ..RunOptions::default()
    };
    let outcome = Vm::run(
        &outer.ast,
        json!({"n": 2}),
        options,
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    let error = outcome.error.expect("a 40-fuel outer budget can't cover a 1000-iteration nested loop");
    assert_eq!(error.kind, ErrorKind::OutOfFuel);
    assert!(outcome.fuel_used <= 40);
}

#[test]
fn error_record_passed_as_a_required_parameter_propagates_unchanged() {
    let inner = transpile("function inner(x:0){ return {x} }").unwrap();
    let procedures = ProcedureStore::new();
    let token = procedures.store(inner.ast).unwrap();

    let outer_source = format!(
        "function f(){{ let r = 'unset'; \
         try {{ \
           try {{ storeGet('missing-key') }} catch (e) {{ agentRun({{token: '{token}'}}, {{x: e}}) }} \
         }} catch (e2) {{ r = e2.kind }} \
         return {{r}} }}"
    );
    let out = transpile(&outer_source).unwrap();
    let outcome = Vm::run(
        &out.ast,
        json!({}),
        RunOptions::default(),
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    assert!(outcome.error.is_none());
    assert_eq!(outcome.result.unwrap(), json!({"r": "CapabilityError"}));
}

#[test]
fn successful_nested_agent_run_charges_outer_fuel_for_nested_work() {
    let inner = transpile("function doubled(n:0){ return n * 2 }").unwrap();
    let procedures = ProcedureStore::new();
    let token = procedures.store(inner.ast).unwrap();

    let outer_source = format!("function f(n:0){{ let out = agentRun({{token: '{token}'}}, {{n}}); return out }}");
    let outer = transpile(&outer_source).unwrap();
    let outcome = Vm::run(
        &outer.ast,
        json!({"n": 21}),
        RunOptions::default(),
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    assert!(outcome.error.is_none());
    assert!(outcome.fuel_used > 0);
}
