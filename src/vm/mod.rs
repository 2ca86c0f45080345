//! VM core (`spec.md` §4.4): executes a lowered Agent AST against a root
//! scope seeded from `input`, tree-walking with a shared fuel counter and
//! wall-clock timeout, mirroring the teacher's `Interpreter::run_stack`
//! dispatch loop and its `check_timeout` discipline (`interpreter/mod.rs`).

pub mod capabilities;
pub mod fuel;
pub mod ops;
pub mod scope;

pub use capabilities::{AbortSignal, Capabilities, ConsoleLevel, NeverAbort, NullCapabilities};
pub use fuel::{CostOverrides, FuelMeter};
pub use scope::{ScopeArena, ScopeId};

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ast::{CatchClause, Instruction, NameSpec};
use crate::error::{ErrorRecord, VmError};
use crate::eval::{self, truthy};
use crate::procedure_store::ProcedureStore;
use crate::vm::fuel::alloc_cost;

pub const DEFAULT_FUEL: u64 = 1_000_000;
pub const DEFAULT_TRACE_LIMIT: usize = 1_000;

/// Configuration for a single `Vm::run` call (`spec.md` §4.4 "Options").
pub struct RunOptions {
    pub fuel: u64,
    pub timeout_ms: u64,
    pub context: Value,
    pub cost_overrides: CostOverrides,
    pub trace: bool,
    pub trace_limit: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            fuel: DEFAULT_FUEL,
            timeout_ms: 0,
            context: Value::Null,
            cost_overrides: CostOverrides::new(),
            trace: false,
            trace_limit: DEFAULT_TRACE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceOutcome {
    Result(Value),
    Error(ErrorRecord),
}

/// One entry of the bounded trace buffer (`spec.md` §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub op: String,
    pub input_snapshot: Value,
    pub outcome: TraceOutcome,
    pub fuel_used: u64,
}

/// The result of a `Vm::run` call (`spec.md` §4.4 contract).
pub struct RunOutcome {
    pub result: Option<Value>,
    pub error: Option<ErrorRecord>,
    pub fuel_used: u64,
    pub trace: Option<Vec<TraceRecord>>,
}

/// Uniform control-flow signal propagated out of every block-executing
/// instruction (`seq`, `scope`, `if`, `while`, `map`, `filter`, `find`,
/// `reduce`, `try`): a genuine `return` anywhere inside terminates the
/// whole run, not just its immediately enclosing block.
enum Flow {
    Next,
    Return(Value),
}

/// Reserved scope key holding the run's raw `input` value, seeded into the
/// root scope before any instruction runs; `varsImport`/`varsExport` read
/// and write named bindings derived from it. Double-underscored to avoid
/// colliding with a guest identifier (the lexer allows `$` and `_` as
/// identifier leads, but never two leading underscores by convention here).
const INPUT_KEY: &str = "__input__";
const ITEM_KEY: &str = "__item__";

pub struct Vm<'a> {
    capabilities: &'a dyn Capabilities,
    procedures: &'a ProcedureStore,
    abort: &'a dyn AbortSignal,
    context: Value,
    start: Instant,
    timeout_ms: u64,
    trace: Option<VecDeque<TraceRecord>>,
    trace_limit: usize,
    call_stack: Vec<String>,
    random_counter: u64,
}

impl<'a> Vm<'a> {
    /// Runs `ast` (the whole lowered program, typically a single top-level
    /// `seq`) against `input`, returning the boundary-visible outcome.
    pub fn run(
        ast: &Instruction,
        input: Value,
        options: RunOptions,
        capabilities: &'a dyn Capabilities,
        procedures: &'a ProcedureStore,
        abort: &'a dyn AbortSignal,
    ) -> RunOutcome {
        let mut vm = Vm {
            capabilities,
            procedures,
            abort,
            context: options.context,
            start: Instant::now(),
            timeout_ms: options.timeout_ms,
            trace: if options.trace { Some(VecDeque::new()) } else { None },
            trace_limit: options.trace_limit.max(1),
            call_stack: Vec::new(),
            random_counter: 0,
        };
        let mut arena = ScopeArena::new();
        let root = arena.root();
        arena.declare(root, INPUT_KEY, input, true);
        let mut fuel = FuelMeter::new(options.fuel, options.cost_overrides);

        let outcome = vm.exec_instruction(ast, root, &mut arena, &mut fuel);
        let fuel_used = fuel.used();
        let trace = vm.trace.map(Vec::from);
        match outcome {
            Ok(Flow::Return(value)) => RunOutcome {
                result: Some(value),
                error: None,
                fuel_used,
                trace,
            },
            Ok(Flow::Next) => RunOutcome {
                result: Some(Value::Object(serde_json::Map::new())),
                error: None,
                fuel_used,
                trace,
            },
            Err(err) => RunOutcome {
                result: None,
                error: Some(err.to_record(&vm.call_stack)),
                fuel_used,
                trace,
            },
        }
    }

    fn check_suspended(&self) -> Result<(), VmError> {
        if self.abort.is_aborted() {
            return Err(VmError::Cancelled);
        }
        if self.timeout_ms == 0 {
            return Ok(());
        }
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        if elapsed_ms > self.timeout_ms {
            return Err(VmError::Timeout {
                elapsed_ms,
                limit_ms: self.timeout_ms,
            });
        }
        Ok(())
    }

    fn exec_block(&mut self, steps: &[Instruction], scope: ScopeId, arena: &mut ScopeArena, fuel: &mut FuelMeter) -> Result<Flow, VmError> {
        for step in steps {
            self.check_suspended()?;
            match self.exec_instruction(step, scope, arena, fuel)? {
                Flow::Next => continue,
                Flow::Return(value) => return Ok(Flow::Return(value)),
            }
        }
        Ok(Flow::Next)
    }

    fn exec_instruction(&mut self, instr: &Instruction, scope: ScopeId, arena: &mut ScopeArena, fuel: &mut FuelMeter) -> Result<Flow, VmError> {
        // Host cost overrides are keyed on op name and the run's `context`
        // only here: the instruction hasn't produced a runtime value yet at
        // dispatch time, so `input` is `Value::Null` (`spec.md` §4.4
        // `costOverrides`; mirrors `fuel.rs`'s own override test).
        fuel.charge(op_name(instr), &Value::Null, &self.context, fuel::BASE_COST)?;
        if self.trace.is_none() {
            return self.dispatch(instr, scope, arena, fuel);
        }
        let input_snapshot = serde_json::to_value(instr).unwrap_or(Value::Null);
        let result = self.dispatch(instr, scope, arena, fuel);
        let fuel_used = fuel.used();
        let outcome = match &result {
            Ok(Flow::Next) => TraceOutcome::Result(Value::Null),
            Ok(Flow::Return(value)) => TraceOutcome::Result(value.clone()),
            Err(e) => TraceOutcome::Error(e.to_record(&self.call_stack)),
        };
        if let Some(trace) = self.trace.as_mut() {
            trace.push_back(TraceRecord {
                op: op_name(instr).to_string(),
                input_snapshot,
                outcome,
                fuel_used,
            });
            if trace.len() > self.trace_limit {
                trace.pop_front();
            }
        }
        result
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, instr: &Instruction, scope: ScopeId, arena: &mut ScopeArena, fuel: &mut FuelMeter) -> Result<Flow, VmError> {
        match instr {
            Instruction::Seq { steps } => self.exec_block(steps, scope, arena, fuel),
            Instruction::Scope { steps } => {
                let child = arena.child(Some(scope));
                self.exec_block(steps, child, arena, fuel)
            }

            Instruction::VarSet { key, value } => {
                let v = eval::eval(value, scope, arena, fuel)?;
                arena.set(scope, key, v)?;
                Ok(Flow::Next)
            }
            Instruction::ConstSet { key, value } => {
                let v = eval::eval(value, scope, arena, fuel)?;
                arena.declare_const(scope, key.clone(), v)?;
                Ok(Flow::Next)
            }
            Instruction::VarGet { key, result } => {
                let v = arena.get(scope, key).cloned().ok_or_else(|| VmError::Reference { name: key.clone() })?;
                arena.declare(scope, result.clone(), v, false);
                Ok(Flow::Next)
            }
            Instruction::VarsImport { spec } => {
                let input = arena.get(scope, INPUT_KEY).cloned().unwrap_or(Value::Null);
                match spec {
                    NameSpec::Keys { keys } => {
                        for key in keys {
                            arena.declare(scope, key.clone(), read_field(&input, key), false);
                        }
                    }
                    NameSpec::Map { map } => {
                        for (input_name, scope_name) in map {
                            arena.declare(scope, scope_name.clone(), read_field(&input, input_name), false);
                        }
                    }
                }
                Ok(Flow::Next)
            }
            Instruction::VarsExport { spec, result } => {
                let exported = match spec {
                    NameSpec::Keys { keys } => arena.export(scope, keys),
                    NameSpec::Map { map } => {
                        let mut out = serde_json::Map::with_capacity(map.len());
                        for (scope_name, output_name) in map {
                            out.insert(output_name.clone(), arena.get(scope, scope_name).cloned().unwrap_or(Value::Null));
                        }
                        Value::Object(out)
                    }
                };
                arena.declare(scope, result.clone(), exported, false);
                Ok(Flow::Next)
            }

            Instruction::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let cond = eval::eval(condition, scope, arena, fuel)?;
                if truthy(&cond) {
                    let child = arena.child(Some(scope));
                    self.exec_block(then_branch, child, arena, fuel)
                } else if let Some(else_branch) = else_branch {
                    let child = arena.child(Some(scope));
                    self.exec_block(else_branch, child, arena, fuel)
                } else {
                    Ok(Flow::Next)
                }
            }
            Instruction::While { condition, body } => {
                loop {
                    self.check_suspended()?;
                    let cond = eval::eval(condition, scope, arena, fuel)?;
                    if !truthy(&cond) {
                        break;
                    }
                    let child = arena.child(Some(scope));
                    match self.exec_block(body, child, arena, fuel)? {
                        Flow::Next => {}
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                    }
                }
                Ok(Flow::Next)
            }

            Instruction::Map {
                items,
                as_name,
                steps,
                result,
            } => {
                let elements = eval_array(items, scope, arena, fuel, "map")?;
                let mut collected = Vec::with_capacity(elements.len());
                for element in elements {
                    self.check_suspended()?;
                    let child = arena.child(Some(scope));
                    arena.declare(child, as_name.clone(), element, false);
                    match self.exec_block(steps, child, arena, fuel)? {
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Next => {}
                    }
                    if result.is_some() {
                        collected.push(arena.get(child, ITEM_KEY).cloned().unwrap_or(Value::Null));
                    }
                }
                if let Some(result) = result {
                    arena.declare(scope, result.clone(), Value::Array(collected), false);
                }
                Ok(Flow::Next)
            }
            Instruction::Filter {
                items,
                as_name,
                steps,
                result,
            } => {
                let elements = eval_array(items, scope, arena, fuel, "filter")?;
                let mut collected = Vec::with_capacity(elements.len());
                for element in elements {
                    self.check_suspended()?;
                    let child = arena.child(Some(scope));
                    arena.declare(child, as_name.clone(), element.clone(), false);
                    match self.exec_block(steps, child, arena, fuel)? {
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Next => {}
                    }
                    let keep = arena.get(child, ITEM_KEY).map(truthy).unwrap_or(false);
                    if keep {
                        collected.push(element);
                    }
                }
                if let Some(result) = result {
                    arena.declare(scope, result.clone(), Value::Array(collected), false);
                }
                Ok(Flow::Next)
            }
            Instruction::Find {
                items,
                as_name,
                steps,
                result,
            } => {
                let elements = eval_array(items, scope, arena, fuel, "find")?;
                let mut found = Value::Null;
                for element in elements {
                    self.check_suspended()?;
                    let child = arena.child(Some(scope));
                    arena.declare(child, as_name.clone(), element.clone(), false);
                    match self.exec_block(steps, child, arena, fuel)? {
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Next => {}
                    }
                    let matched = arena.get(child, ITEM_KEY).map(truthy).unwrap_or(false);
                    if matched {
                        found = element;
                        break;
                    }
                }
                if let Some(result) = result {
                    arena.declare(scope, result.clone(), found, false);
                }
                Ok(Flow::Next)
            }
            Instruction::Reduce {
                items,
                as_name,
                accumulator,
                initial,
                steps,
                result,
            } => {
                let elements = eval_array(items, scope, arena, fuel, "reduce")?;
                let mut acc = eval::eval(initial, scope, arena, fuel)?;
                for element in elements {
                    self.check_suspended()?;
                    let child = arena.child(Some(scope));
                    arena.declare(child, as_name.clone(), element, false);
                    arena.declare(child, accumulator.clone(), acc.clone(), false);
                    match self.exec_block(steps, child, arena, fuel)? {
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Next => {}
                    }
                    acc = arena.get(child, ITEM_KEY).cloned().unwrap_or(acc);
                }
                if let Some(result) = result {
                    arena.declare(scope, result.clone(), acc, false);
                }
                Ok(Flow::Next)
            }

            Instruction::Try { try_block, catch_block } => {
                let try_scope = arena.child(Some(scope));
                match self.exec_block(try_block, try_scope, arena, fuel) {
                    Ok(flow) => Ok(flow),
                    Err(e) if !e.is_terminal() => match catch_block {
                        Some(CatchClause { param, body }) => {
                            let catch_scope = arena.child(Some(scope));
                            if let Some(param) = param {
                                let record = e.to_record(&self.call_stack);
                                let value = serde_json::to_value(&record).unwrap_or(Value::Null);
                                arena.declare(catch_scope, param.clone(), value, false);
                            }
                            self.exec_block(body, catch_scope, arena, fuel)
                        }
                        None => Err(e),
                    },
                    Err(e) => Err(e),
                }
            }

            Instruction::Return { schema } => Ok(Flow::Return(arena.export(scope, schema))),

            Instruction::TypeCheck {
                param,
                type_desc,
                nullable,
                path,
            } => {
                let value = arena.get(scope, param).cloned().unwrap_or(Value::Null);
                if let Some(record) = crate::error::as_error_record(&value) {
                    return Err(VmError::from_record(record));
                }
                if (*nullable && value.is_null()) || type_desc.matches(&value) {
                    Ok(Flow::Next)
                } else {
                    Err(VmError::Type {
                        message: format!("expected {}, got {}", type_desc.primitive_name(), json_kind(&value)),
                        path: Some(path.clone()),
                    })
                }
            }

            Instruction::Template { tmpl, vars, result } => {
                let mut rendered = tmpl.clone();
                for (name, expr) in vars {
                    let value = eval::eval(expr, scope, arena, fuel)?;
                    rendered = rendered.replace(&format!("{{{{{name}}}}}"), &template_coerce(&value));
                }
                fuel.charge_flat("template", alloc_cost(rendered.len()))?;
                arena.declare(scope, result.clone(), Value::String(rendered), false);
                Ok(Flow::Next)
            }
            Instruction::JsonParse { input, result } => {
                let value = eval::eval(input, scope, arena, fuel)?;
                let parsed = ops::json_parse(&value)?;
                arena.declare(scope, result.clone(), parsed, false);
                Ok(Flow::Next)
            }
            Instruction::JsonStringify { input, result } => {
                let value = eval::eval(input, scope, arena, fuel)?;
                arena.declare(scope, result.clone(), ops::json_stringify(&value), false);
                Ok(Flow::Next)
            }
            Instruction::RegexMatch {
                input,
                pattern,
                flags,
                result,
            } => {
                let input = eval::eval(input, scope, arena, fuel)?;
                let pattern = eval::eval(pattern, scope, arena, fuel)?;
                let flags = match flags {
                    Some(e) => Some(eval::eval(e, scope, arena, fuel)?),
                    None => None,
                };
                let matched = ops::regex_match(&input, &pattern, flags.as_ref())?;
                arena.declare(scope, result.clone(), matched, false);
                Ok(Flow::Next)
            }
            Instruction::Hash { input, algorithm, result } => {
                let value = eval::eval(input, scope, arena, fuel)?;
                let hashed = ops::hash(&value, algorithm.as_deref())?;
                arena.declare(scope, result.clone(), hashed, false);
                Ok(Flow::Next)
            }
            Instruction::Uuid { result } => {
                arena.declare(scope, result.clone(), ops::uuid(), false);
                Ok(Flow::Next)
            }
            Instruction::Random { result } => {
                let seed = self.capabilities.clock_now() ^ self.random_counter;
                self.random_counter = self.random_counter.wrapping_add(1);
                let mut rng = ops::Rng::seeded(seed);
                arena.declare(scope, result.clone(), Value::from(rng.next_f64()), false);
                Ok(Flow::Next)
            }
            Instruction::HttpFetch { url, init, result } => {
                let url = eval::eval(url, scope, arena, fuel)?;
                let init = match init {
                    Some(e) => Some(eval::eval(e, scope, arena, fuel)?),
                    None => None,
                };
                let value = ops::http_fetch(&url, init.as_ref(), self.capabilities, &self.context, self.abort)?;
                arena.declare(scope, result.clone(), value, false);
                Ok(Flow::Next)
            }
            Instruction::StoreGet { key, result } => {
                let key = eval::eval(key, scope, arena, fuel)?;
                let value = ops::store_get(&key, self.capabilities, &self.context)?;
                arena.declare(scope, result.clone(), value, false);
                Ok(Flow::Next)
            }
            Instruction::StoreSet { key, value, result } => {
                let key = eval::eval(key, scope, arena, fuel)?;
                let value = eval::eval(value, scope, arena, fuel)?;
                let stored = ops::store_set(&key, &value, self.capabilities, &self.context)?;
                if let Some(result) = result {
                    arena.declare(scope, result.clone(), stored, false);
                }
                Ok(Flow::Next)
            }
            Instruction::LlmPredict { request, result } => {
                let request = eval::eval(request, scope, arena, fuel)?;
                let value = ops::llm_predict(&request, self.capabilities, &self.context, self.abort)?;
                arena.declare(scope, result.clone(), value, false);
                Ok(Flow::Next)
            }
            Instruction::XmlParse { input, result } => {
                let value = eval::eval(input, scope, arena, fuel)?;
                let parsed = ops::xml_parse(&value)?;
                arena.declare(scope, result.clone(), parsed, false);
                Ok(Flow::Next)
            }
            Instruction::Push { list, value, result } => {
                let current = arena.get(scope, list).cloned().ok_or_else(|| VmError::Reference { name: list.clone() })?;
                let Value::Array(mut items) = current else {
                    return Err(VmError::Runtime {
                        message: format!("'{list}' is not an array"),
                        op: Some("push".into()),
                    });
                };
                let value = eval::eval(value, scope, arena, fuel)?;
                items.push(value);
                fuel.charge_flat("push", alloc_cost(items.len()))?;
                let updated = Value::Array(items);
                arena.set(scope, list, updated.clone())?;
                if let Some(result) = result {
                    arena.declare(scope, result.clone(), updated, false);
                }
                Ok(Flow::Next)
            }
            Instruction::Join { list, separator, result } => {
                let list = eval::eval(list, scope, arena, fuel)?;
                let separator = eval::eval(separator, scope, arena, fuel)?;
                let joined = ops::join(&list, &separator)?;
                arena.declare(scope, result.clone(), joined, false);
                Ok(Flow::Next)
            }
            Instruction::Split { input, separator, result } => {
                let input = eval::eval(input, scope, arena, fuel)?;
                let separator = eval::eval(separator, scope, arena, fuel)?;
                let parts = ops::split(&input, &separator)?;
                arena.declare(scope, result.clone(), parts, false);
                Ok(Flow::Next)
            }
            Instruction::Len { target, result } => {
                let value = eval::eval(target, scope, arena, fuel)?;
                arena.declare(scope, result.clone(), ops::len(&value), false);
                Ok(Flow::Next)
            }
            Instruction::Pick { target, keys, result } => {
                let value = eval::eval(target, scope, arena, fuel)?;
                arena.declare(scope, result.clone(), ops::pick(&value, keys), false);
                Ok(Flow::Next)
            }
            Instruction::Keys { target, result } => {
                let value = eval::eval(target, scope, arena, fuel)?;
                arena.declare(scope, result.clone(), ops::keys(&value), false);
                Ok(Flow::Next)
            }
            Instruction::Merge { targets, result } => {
                let values = targets
                    .iter()
                    .map(|t| eval::eval(t, scope, arena, fuel))
                    .collect::<Result<Vec<_>, _>>()?;
                arena.declare(scope, result.clone(), ops::merge(&values), false);
                Ok(Flow::Next)
            }
            Instruction::MathCalc { calc, args, result } => {
                let values = args.iter().map(|a| eval::eval(a, scope, arena, fuel)).collect::<Result<Vec<_>, _>>()?;
                let computed = ops::math_calc(calc, &values)?;
                arena.declare(scope, result.clone(), computed, false);
                Ok(Flow::Next)
            }

            Instruction::AgentRun {
                agent_id,
                token,
                input,
                result,
            } => self.exec_agent_run(agent_id.as_ref(), token.as_ref(), input, result, scope, arena, fuel),

            Instruction::OpCall { op, args, result } => {
                for arg in args {
                    eval::eval(arg, scope, arena, fuel)?;
                }
                let _ = result;
                Err(VmError::Runtime {
                    message: format!("'{op}' is not a recognized operation"),
                    op: Some(op.clone()),
                })
            }
        }
    }

    /// Resolves `agentId`/`token` against the procedure store first —
    /// tokens shadow names when both are supplied — and falls back to the
    /// `agent.run` capability only on a resolution miss, matching the
    /// recommended policy for the guest language's ambiguous "agent id".
    #[allow(clippy::too_many_arguments)]
    fn exec_agent_run(
        &mut self,
        agent_id: Option<&crate::ast::Expr>,
        token: Option<&crate::ast::Expr>,
        input: &crate::ast::Expr,
        result: &str,
        scope: ScopeId,
        arena: &mut ScopeArena,
        fuel: &mut FuelMeter,
    ) -> Result<Flow, VmError> {
        let input_value = eval::eval(input, scope, arena, fuel)?;
        let token_str = match token {
            Some(e) => Some(expect_string(eval::eval(e, scope, arena, fuel)?, "agentRun")?),
            None => None,
        };
        let agent_id_str = match agent_id {
            Some(e) => Some(expect_string(eval::eval(e, scope, arena, fuel)?, "agentRun")?),
            None => None,
        };

        let lookup_key = token_str.as_deref().or(agent_id_str.as_deref());
        if let Some(key) = lookup_key {
            if let Some(procedure) = self.procedures.resolve_str(key) {
                let mut nested_arena = ScopeArena::new();
                let nested_root = nested_arena.root();
                nested_arena.declare(nested_root, INPUT_KEY, input_value, true);
                let mut nested_fuel = fuel.fork(fuel.remaining());

                self.call_stack.push(key.to_string());
                let outcome = self.exec_instruction(procedure.as_ref(), nested_root, &mut nested_arena, &mut nested_fuel);
                self.call_stack.pop();

                fuel.charge_flat("agentRun", nested_fuel.used())?;
                return match outcome {
                    Ok(Flow::Return(value)) => {
                        arena.declare(scope, result.to_string(), value, false);
                        Ok(Flow::Next)
                    }
                    Ok(Flow::Next) => {
                        arena.declare(scope, result.to_string(), Value::Object(serde_json::Map::new()), false);
                        Ok(Flow::Next)
                    }
                    Err(e) => Err(e),
                };
            }
        }

        let capability_id = agent_id_str.or(token_str).unwrap_or_default();
        self.call_stack.push(capability_id.clone());
        let outcome = self.capabilities.agent_run(&capability_id, &input_value, &self.context, self.abort);
        self.call_stack.pop();
        let value = outcome?;
        arena.declare(scope, result.to_string(), value, false);
        Ok(Flow::Next)
    }
}

fn read_field(input: &Value, key: &str) -> Value {
    match input {
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn eval_array(expr: &crate::ast::Expr, scope: ScopeId, arena: &ScopeArena, fuel: &mut FuelMeter, op: &str) -> Result<Vec<Value>, VmError> {
    match eval::eval(expr, scope, arena, fuel)? {
        Value::Array(items) => Ok(items),
        _ => Err(VmError::Runtime {
            message: format!("'{op}' requires an array"),
            op: Some(op.to_string()),
        }),
    }
}

fn expect_string(value: Value, op: &str) -> Result<String, VmError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(VmError::Runtime {
            message: format!("'{op}' expected a string, got {other}"),
            op: Some(op.to_string()),
        }),
    }
}

fn template_coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn op_name(instr: &Instruction) -> &'static str {
    match instr {
        Instruction::Seq { .. } => "seq",
        Instruction::Scope { .. } => "scope",
        Instruction::VarSet { .. } => "varSet",
        Instruction::ConstSet { .. } => "constSet",
        Instruction::VarGet { .. } => "varGet",
        Instruction::VarsImport { .. } => "varsImport",
        Instruction::VarsExport { .. } => "varsExport",
        Instruction::If { .. } => "if",
        Instruction::While { .. } => "while",
        Instruction::Map { .. } => "map",
        Instruction::Filter { .. } => "filter",
        Instruction::Find { .. } => "find",
        Instruction::Reduce { .. } => "reduce",
        Instruction::Try { .. } => "try",
        Instruction::Return { .. } => "return",
        Instruction::TypeCheck { .. } => "typeCheck",
        Instruction::Template { .. } => "template",
        Instruction::JsonParse { .. } => "jsonParse",
        Instruction::JsonStringify { .. } => "jsonStringify",
        Instruction::RegexMatch { .. } => "regexMatch",
        Instruction::Hash { .. } => "hash",
        Instruction::Uuid { .. } => "uuid",
        Instruction::Random { .. } => "random",
        Instruction::HttpFetch { .. } => "httpFetch",
        Instruction::StoreGet { .. } => "storeGet",
        Instruction::StoreSet { .. } => "storeSet",
        Instruction::LlmPredict { .. } => "llmPredict",
        Instruction::XmlParse { .. } => "xmlParse",
        Instruction::Push { .. } => "push",
        Instruction::Join { .. } => "join",
        Instruction::Split { .. } => "split",
        Instruction::Len { .. } => "len",
        Instruction::Pick { .. } => "pick",
        Instruction::Keys { .. } => "keys",
        Instruction::Merge { .. } => "merge",
        Instruction::MathCalc { .. } => "mathCalc",
        Instruction::AgentRun { .. } => "agentRun",
        Instruction::OpCall { .. } => "opCall",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;

    fn seq(steps: Vec<Instruction>) -> Instruction {
        Instruction::Seq { steps }
    }

    #[test]
    fn fibonacci_iteration_matches_scenario_one() {
        // while (c>0) { t=a+b; a=b; b=t; c=c-1 } return {result:a}
        let ast = seq(vec![
            Instruction::VarsImport {
                spec: NameSpec::Keys { keys: vec!["n".into()] },
            },
            Instruction::VarSet {
                key: "a".into(),
                value: Expr::literal(0),
            },
            Instruction::VarSet {
                key: "b".into(),
                value: Expr::literal(1),
            },
            Instruction::VarSet {
                key: "c".into(),
                value: Expr::ident("n"),
            },
            Instruction::While {
                condition: Expr::Binary {
                    op: ">".into(),
                    left: Box::new(Expr::ident("c")),
                    right: Box::new(Expr::literal(0)),
                },
                body: vec![
                    Instruction::VarSet {
                        key: "t".into(),
                        value: Expr::Binary {
                            op: "+".into(),
                            left: Box::new(Expr::ident("a")),
                            right: Box::new(Expr::ident("b")),
                        },
                    },
                    Instruction::VarSet {
                        key: "a".into(),
                        value: Expr::ident("b"),
                    },
                    Instruction::VarSet {
                        key: "b".into(),
                        value: Expr::ident("t"),
                    },
                    Instruction::VarSet {
                        key: "c".into(),
                        value: Expr::Binary {
                            op: "-".into(),
                            left: Box::new(Expr::ident("c")),
                            right: Box::new(Expr::literal(1)),
                        },
                    },
                ],
            },
            Instruction::VarSet {
                key: "result".into(),
                value: Expr::ident("a"),
            },
            Instruction::Return {
                schema: vec!["result".into()],
            },
        ]);

        let procedures = ProcedureStore::new();
        let outcome = Vm::run(
            &ast,
            serde_json::json!({"n": 10}),
            RunOptions::default(),
            &NullCapabilities,
            &procedures,
            &NeverAbort,
        );
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result.unwrap(), serde_json::json!({"result": 55.0}));
    }

    #[test]
    fn required_param_missing_yields_type_error_with_path() {
        let ast = seq(vec![
            Instruction::VarsImport {
                spec: NameSpec::Keys { keys: vec!["a".into(), "b".into()] },
            },
            Instruction::TypeCheck {
                param: "a".into(),
                type_desc: crate::types::TypeDescriptor::String,
                nullable: false,
                path: "f.a".into(),
            },
            Instruction::If {
                condition: Expr::Binary {
                    op: "==".into(),
                    left: Box::new(Expr::ident("b")),
                    right: Box::new(Expr::literal(Value::Null)),
                },
                then_branch: vec![Instruction::VarSet {
                    key: "b".into(),
                    value: Expr::literal(3),
                }],
                else_branch: None,
            },
            Instruction::VarsExport {
                spec: NameSpec::Keys {
                    keys: vec!["a".into(), "b".into()],
                },
                result: "__result__".into(),
            },
            Instruction::Return {
                schema: vec!["__result__".into()],
            },
        ]);

        let procedures = ProcedureStore::new();
        let ok = Vm::run(
            &ast,
            serde_json::json!({"a": "y"}),
            RunOptions::default(),
            &NullCapabilities,
            &procedures,
            &NeverAbort,
        );
        assert_eq!(ok.result.unwrap(), serde_json::json!({"__result__": {"a": "y", "b": 3}}));

        let failed = Vm::run(
            &ast,
            serde_json::json!({}),
            RunOptions::default(),
            &NullCapabilities,
            &procedures,
            &NeverAbort,
        );
        let error = failed.error.unwrap();
        assert_eq!(error.kind, crate::error::ErrorKind::TypeError);
        assert_eq!(error.path.as_deref(), Some("f.a"));
    }

    #[test]
    fn string_repeat_exhausts_fuel_and_reports_op() {
        let ast = seq(vec![Instruction::VarSet {
            key: "out".into(),
            value: Expr::MethodCall {
                object: Box::new(Expr::literal("x")),
                method: "repeat".into(),
                args: vec![Expr::literal(1_000_000)],
                optional: false,
            },
        }]);
        let procedures = ProcedureStore::new();
        let options = RunOptions {
            fuel: 50,
            ..RunOptions::default()
        };
        let outcome = Vm::run(&ast, Value::Null, options, &NullCapabilities, &procedures, &NeverAbort);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, crate::error::ErrorKind::OutOfFuel);
        assert_eq!(outcome.fuel_used, 50);
    }

    #[test]
    fn try_catch_recovers_from_unknown_operation() {
        let ast = seq(vec![
            Instruction::Try {
                try_block: vec![Instruction::OpCall {
                    op: "unknownAtom".into(),
                    args: vec![],
                    result: None,
                }],
                catch_block: Some(CatchClause {
                    param: Some("e".into()),
                    body: vec![Instruction::VarSet {
                        key: "r".into(),
                        value: Expr::literal("caught"),
                    }],
                }),
            },
            Instruction::VarsExport {
                spec: NameSpec::Keys { keys: vec!["r".into()] },
                result: "__result__".into(),
            },
            Instruction::Return {
                schema: vec!["__result__".into()],
            },
        ]);
        let procedures = ProcedureStore::new();
        let outcome = Vm::run(&ast, Value::Null, RunOptions::default(), &NullCapabilities, &procedures, &NeverAbort);
        assert_eq!(outcome.result.unwrap(), serde_json::json!({"__result__": {"r": "caught"}}));
    }

    #[test]
    fn procedure_store_round_trip_executes_same_semantics() {
        let inner = seq(vec![
            Instruction::VarsImport {
                spec: NameSpec::Keys { keys: vec!["n".into()] },
            },
            Instruction::VarSet {
                key: "doubled".into(),
                value: Expr::Binary {
                    op: "*".into(),
                    left: Box::new(Expr::ident("n")),
                    right: Box::new(Expr::literal(2)),
                },
            },
            Instruction::Return {
                schema: vec!["doubled".into()],
            },
        ]);
        let procedures = ProcedureStore::new();
        let token = procedures.store(inner).unwrap();

        let ast = seq(vec![
            Instruction::AgentRun {
                agent_id: None,
                token: Some(Expr::literal(token.as_str())),
                input: Expr::Object {
                    properties: vec![crate::ast::ObjectProperty {
                        key: "n".into(),
                        value: Expr::literal(21),
                    }],
                },
                result: "out".into(),
            },
            Instruction::Return {
                schema: vec!["out".into()],
            },
        ]);
        let outcome = Vm::run(&ast, Value::Null, RunOptions::default(), &NullCapabilities, &procedures, &NeverAbort);
        assert_eq!(outcome.result.unwrap(), serde_json::json!({"out": {"doubled": 42.0}}));
    }
}
