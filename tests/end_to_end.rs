//! Integration tests exercising the full pipeline: source text ->
//! `transpile` -> `Vm::run`, covering the testable scenarios of `spec.md` §8.

use agentscript_vm::{transpile, ErrorKind, NeverAbort, NullCapabilities, ProcedureStore, RunOptions, Vm};
use serde_json::json;

#[test]
fn fibonacci_iteration_scenario() {
    let source = "function fib({n}){ let a=0; let b=1; let c=n; \
                  while(c>0){ let t=a+b; a=b; b=t; c=c-1 } return {result:a} }";
    let out = transpile(source).unwrap();
    let procedures = ProcedureStore::new();
    let outcome = Vm::run(
        &out.ast,
        json!({"n": 10}),
        RunOptions::default(),
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    assert!(outcome.error.is_none());
    assert_eq!(outcome.result.unwrap(), json!({"result": 55.0}));
}

#[test]
fn required_vs_optional_parameters() {
    let source = "function f(a:'x', b=3){ return {a,b} }";
    let out = transpile(source).unwrap();
    let procedures = ProcedureStore::new();

    let ok = Vm::run(
        &out.ast,
        json!({"a": "y"}),
        RunOptions::default(),
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    assert_eq!(ok.result.unwrap(), json!({"a": "y", "b": 3.0}));

    let missing = Vm::run(
        &out.ast,
        json!({}),
        RunOptions::default(),
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    let error = missing.error.unwrap();
    assert_eq!(error.kind, ErrorKind::TypeError);
    assert_eq!(error.path.as_deref(), Some("f.a"));
}

#[test]
fn fuel_exhaustion_reports_out_of_fuel() {
    let source = "function f(s:'x'){ let out = s.repeat(1000000); return out }";
    let out = transpile(source).unwrap();
    let procedures = ProcedureStore::new();
    let options = RunOptions {
        fuel: 20,
        ..RunOptions::default()
    };
    let outcome = Vm::run(
        &out.ast,
        json!({"s": "x"}),
        options,
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::OutOfFuel);
    assert_eq!(outcome.fuel_used, 20);
}

#[test]
fn try_catch_recovers_from_a_capability_error() {
    let source = "function f(){ let r = 'fallback'; \
                  try { storeGet('missing-key') } catch (e) { r = e.kind } \
                  return {r} }";
    let out = transpile(source).unwrap();
    let procedures = ProcedureStore::new();
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
fn agent_run_resolves_a_stored_procedure_by_token() {
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
    assert_eq!(outcome.result.unwrap(), json!({"__result__": {"__result__": 42.0}}));
}

#[test]
fn map_filter_and_reduce_over_an_array() {
    let source = "function f(items:[1]){ \
                  let doubled = items.map(x => x * 2); \
                  let evens = doubled.filter(x => x % 2 === 0); \
                  let total = evens.reduce((acc, x) => acc + x, 0); \
                  return {total} }";
    let out = transpile(source).unwrap();
    let procedures = ProcedureStore::new();
    let outcome = Vm::run(
        &out.ast,
        json!({"items": [1, 2, 3]}),
        RunOptions::default(),
        &NullCapabilities,
        &procedures,
        &NeverAbort,
    );
    assert!(outcome.error.is_none());
    assert_eq!(outcome.result.unwrap(), json!({"total": 12.0}));
}
