//! Expression evaluator (`spec.md` §4.3): a pure, synchronous evaluator
//! over `Expr` nodes against a scope chain. Has no access to capabilities
//! or the instruction dispatcher — the Expression AST carries no
//! capability-mediated op, only built-in operators and method calls that
//! are themselves pure (`len`/`push`/etc. are `Instruction`s, not `Expr`s).

use serde_json::Value;

use crate::ast::Expr;
use crate::error::VmError;
use crate::vm::fuel::{alloc_cost, FuelMeter, BASE_COST};
use crate::vm::scope::{ScopeArena, ScopeId};

/// Evaluates `expr` against `scope`, charging `fuel` as it goes
/// (`spec.md` §4.3).
pub fn eval(expr: &Expr, scope: ScopeId, arena: &ScopeArena, fuel: &mut FuelMeter) -> Result<Value, VmError> {
    match expr {
        Expr::Literal { value } => {
            fuel.charge_flat("literal", BASE_COST)?;
            Ok(value.clone())
        }
        Expr::Ident { name } => {
            fuel.charge_flat("ident", BASE_COST)?;
            arena
                .get(scope, name)
                .cloned()
                .ok_or_else(|| VmError::Reference { name: name.clone() })
        }
        Expr::Member {
            object,
            property,
            computed,
            optional,
        } => eval_member(object, property, *computed, *optional, scope, arena, fuel),
        Expr::MethodCall {
            object,
            method,
            args,
            optional,
        } => eval_method_call(object, method, args, *optional, scope, arena, fuel),
        Expr::Binary { op, left, right } => eval_binary(op, left, right, scope, arena, fuel),
        Expr::Logical { op, left, right } => eval_logical(op, left, right, scope, arena, fuel),
        Expr::Unary { op, argument } => eval_unary(op, argument, scope, arena, fuel),
        Expr::Conditional {
            test,
            consequent,
            alternate,
        } => {
            fuel.charge_flat("conditional", BASE_COST)?;
            if truthy(&eval(test, scope, arena, fuel)?) {
                eval(consequent, scope, arena, fuel)
            } else {
                eval(alternate, scope, arena, fuel)
            }
        }
        Expr::Array { elements } => {
            let values = elements
                .iter()
                .map(|e| eval(e, scope, arena, fuel))
                .collect::<Result<Vec<_>, _>>()?;
            fuel.charge_flat("array", alloc_cost(values.len()))?;
            Ok(Value::Array(values))
        }
        Expr::Object { properties } => {
            let mut map = serde_json::Map::with_capacity(properties.len());
            for prop in properties {
                let value = eval(&prop.value, scope, arena, fuel)?;
                map.insert(prop.key.clone(), value);
            }
            fuel.charge_flat("object", alloc_cost(map.len()))?;
            Ok(Value::Object(map))
        }
    }
}

fn eval_member(
    object: &Expr,
    property: &Expr,
    computed: bool,
    optional: bool,
    scope: ScopeId,
    arena: &ScopeArena,
    fuel: &mut FuelMeter,
) -> Result<Value, VmError> {
    fuel.charge_flat("member", BASE_COST)?;
    let base = eval(object, scope, arena, fuel)?;
    if optional && base.is_null() {
        return Ok(Value::Null);
    }
    let key = eval(property, scope, arena, fuel)?;
    if computed {
        if let (Value::Array(items), Value::Number(n)) = (&base, &key) {
            let idx = n.as_f64().unwrap_or(-1.0);
            if idx >= 0.0 {
                return Ok(items.get(idx as usize).cloned().unwrap_or(Value::Null));
            }
            return Ok(Value::Null);
        }
    }
    let Value::String(name) = &key else {
        return Err(VmError::Runtime {
            message: "member access requires a string property name".into(),
            op: Some("member".into()),
        });
    };
    match &base {
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Array(items) => match name.as_str() {
            "length" => Ok(Value::from(items.len())),
            _ => Ok(Value::Null),
        },
        Value::String(s) => match name.as_str() {
            "length" => Ok(Value::from(s.chars().count())),
            _ => Ok(Value::Null),
        },
        Value::Null => Ok(Value::Null),
        _ => Ok(Value::Null),
    }
}

/// Method calls that survived lowering unrecognized (`spec.md` §4.2
/// "unknown method names lower to a generic method-call expression").
/// The guest language exposes no way to invoke one of these at run time
/// other than the small set of read-only accessors below; anything else
/// is a `RuntimeError`.
fn eval_method_call(
    object: &Expr,
    method: &str,
    args: &[Expr],
    optional: bool,
    scope: ScopeId,
    arena: &ScopeArena,
    fuel: &mut FuelMeter,
) -> Result<Value, VmError> {
    fuel.charge_flat("methodCall", BASE_COST)?;
    let base = eval(object, scope, arena, fuel)?;
    if optional && base.is_null() {
        return Ok(Value::Null);
    }
    let evaluated_args = args
        .iter()
        .map(|a| eval(a, scope, arena, fuel))
        .collect::<Result<Vec<_>, _>>()?;
    match (&base, method) {
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "includes") => {
            let needle = evaluated_args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(Value::Bool(s.contains(needle)))
        }
        (Value::String(s), "repeat") => {
            let count = evaluated_args
                .first()
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .max(0.0) as usize;
            let projected_len = s.len().saturating_mul(count);
            fuel.charge_flat("repeat", alloc_cost(projected_len))?;
            Ok(Value::String(s.repeat(count)))
        }
        (Value::Array(items), "includes") => {
            let needle = evaluated_args.first().cloned().unwrap_or(Value::Null);
            Ok(Value::Bool(items.contains(&needle)))
        }
        _ => Err(VmError::Runtime {
            message: format!("method '{method}' is not recognized at run time"),
            op: Some(method.to_string()),
        }),
    }
}

fn eval_binary(op: &str, left: &Expr, right: &Expr, scope: ScopeId, arena: &ScopeArena, fuel: &mut FuelMeter) -> Result<Value, VmError> {
    let l = eval(left, scope, arena, fuel)?;
    let r = eval(right, scope, arena, fuel)?;
    match op {
        "+" => add(&l, &r, fuel),
        "-" | "*" | "/" | "%" => arith(op, &l, &r),
        "<" | "<=" | ">" | ">=" => compare(op, &l, &r),
        "==" | "===" => {
            fuel.charge_flat("eq", BASE_COST)?;
            Ok(Value::Bool(l == r))
        }
        "!=" | "!==" => {
            fuel.charge_flat("eq", BASE_COST)?;
            Ok(Value::Bool(l != r))
        }
        _ => Err(VmError::Runtime {
            message: format!("unknown binary operator '{op}'"),
            op: Some("binary".into()),
        }),
    }
}

fn add(l: &Value, r: &Value, fuel: &mut FuelMeter) -> Result<Value, VmError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            fuel.charge_flat("+", BASE_COST)?;
            let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
            Ok(serde_json::Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null))
        }
        (Value::String(_), _) | (_, Value::String(_)) => {
            let out = format!("{}{}", coerce_to_string(l), coerce_to_string(r));
            fuel.charge_flat("+", alloc_cost(out.len()))?;
            Ok(Value::String(out))
        }
        _ => Err(VmError::Runtime {
            message: "'+' requires two numbers or at least one string operand".into(),
            op: Some("binary".into()),
        }),
    }
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn arith(op: &str, l: &Value, r: &Value) -> Result<Value, VmError> {
    let (Value::Number(a), Value::Number(b)) = (l, r) else {
        return Err(VmError::Runtime {
            message: format!("'{op}' requires two numbers"),
            op: Some("binary".into()),
        });
    };
    let a = a.as_f64().unwrap_or(0.0);
    let b = b.as_f64().unwrap_or(0.0);
    let result = match op {
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "%" => a % b,
        _ => {
            return Err(VmError::Runtime {
                message: format!("unknown arithmetic operator '{op}'"),
                op: Some("binary".into()),
            })
        }
    };
    Ok(serde_json::Number::from_f64(result).map(Value::Number).unwrap_or(Value::Null))
}

fn compare(op: &str, l: &Value, r: &Value) -> Result<Value, VmError> {
    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().unwrap_or(0.0).partial_cmp(&b.as_f64().unwrap_or(0.0)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            return Err(VmError::Runtime {
                message: format!("'{op}' requires two numbers or two strings"),
                op: Some("binary".into()),
            })
        }
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    use std::cmp::Ordering::*;
    let result = match op {
        "<" => ordering == Less,
        "<=" => ordering != Greater,
        ">" => ordering == Greater,
        ">=" => ordering != Less,
        _ => {
            return Err(VmError::Runtime {
                message: format!("unknown comparison operator '{op}'"),
                op: Some("binary".into()),
            })
        }
    };
    Ok(Value::Bool(result))
}

fn eval_logical(op: &str, left: &Expr, right: &Expr, scope: ScopeId, arena: &ScopeArena, fuel: &mut FuelMeter) -> Result<Value, VmError> {
    fuel.charge_flat("logical", BASE_COST)?;
    let l = eval(left, scope, arena, fuel)?;
    match op {
        "&&" => {
            if truthy(&l) {
                eval(right, scope, arena, fuel)
            } else {
                Ok(l)
            }
        }
        "||" => {
            if truthy(&l) {
                Ok(l)
            } else {
                eval(right, scope, arena, fuel)
            }
        }
        "??" => {
            if nullish(&l) {
                eval(right, scope, arena, fuel)
            } else {
                Ok(l)
            }
        }
        _ => Err(VmError::Runtime {
            message: format!("unknown logical operator '{op}'"),
            op: Some("logical".into()),
        }),
    }
}

fn eval_unary(op: &str, argument: &Expr, scope: ScopeId, arena: &ScopeArena, fuel: &mut FuelMeter) -> Result<Value, VmError> {
    fuel.charge_flat("unary", BASE_COST)?;
    let value = eval(argument, scope, arena, fuel)?;
    match op {
        "-" => {
            let n = value.as_f64().ok_or_else(|| VmError::Runtime {
                message: "unary '-' requires a number".into(),
                op: Some("unary".into()),
            })?;
            Ok(serde_json::Number::from_f64(-n).map(Value::Number).unwrap_or(Value::Null))
        }
        "!" => Ok(Value::Bool(!truthy(&value))),
        "typeof" => Ok(Value::String(typeof_str(&value).to_string())),
        _ => Err(VmError::Runtime {
            message: format!("unknown unary operator '{op}'"),
            op: Some("unary".into()),
        }),
    }
}

fn typeof_str(value: &Value) -> &'static str {
    match value {
        Value::Null => "object",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "object",
    }
}

/// JS truthiness (`spec.md` §4.3).
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Only `null` is nullish in this crate's `serde_json::Value` value model
/// (there is no separate `undefined`; missing scope bindings already
/// surface as `null` via `ScopeArena::export`/member access) — `??`
/// treats it the same as the guest's `null`/`undefined` pair
/// (`spec.md` §4.3).
fn nullish(value: &Value) -> bool {
    value.is_null()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::fuel::CostOverrides;
    use serde_json::json;

    fn fresh() -> (ScopeArena, ScopeId) {
        let mut arena = ScopeArena::new();
        let scope = arena.root();
        (arena, scope)
    }

    fn run(expr: &Expr) -> Result<Value, VmError> {
        let (arena, scope) = fresh();
        let mut fuel = FuelMeter::new(10_000, CostOverrides::new());
        eval(expr, scope, &arena, &mut fuel)
    }

    #[test]
    fn string_plus_number_coerces() {
        let expr = Expr::Binary {
            op: "+".into(),
            left: Box::new(Expr::literal("n=")),
            right: Box::new(Expr::literal(3)),
        };
        assert_eq!(run(&expr).unwrap(), json!("n=3"));
    }

    #[test]
    fn strict_equality_no_coercion() {
        let expr = Expr::Binary {
            op: "===".into(),
            left: Box::new(Expr::literal("3")),
            right: Box::new(Expr::literal(3)),
        };
        assert_eq!(run(&expr).unwrap(), json!(false));
    }

    #[test]
    fn nullish_coalescing_skips_false_but_not_null() {
        let expr = Expr::Logical {
            op: "??".into(),
            left: Box::new(Expr::literal(false)),
            right: Box::new(Expr::literal("fallback")),
        };
        assert_eq!(run(&expr).unwrap(), json!(false));

        let expr = Expr::Logical {
            op: "??".into(),
            left: Box::new(Expr::literal(Value::Null)),
            right: Box::new(Expr::literal("fallback")),
        };
        assert_eq!(run(&expr).unwrap(), json!("fallback"));
    }

    #[test]
    fn unresolved_ident_is_ref_error() {
        let expr = Expr::ident("missing");
        assert!(matches!(run(&expr), Err(VmError::Reference { .. })));
    }

    #[test]
    fn optional_member_short_circuits_on_null() {
        let expr = Expr::Member {
            object: Box::new(Expr::literal(Value::Null)),
            property: Box::new(Expr::literal("x")),
            computed: false,
            optional: true,
        };
        assert_eq!(run(&expr).unwrap(), Value::Null);
    }

    #[test]
    fn string_repeat_exhausts_small_fuel_budget() {
        let expr = Expr::MethodCall {
            object: Box::new(Expr::literal("x")),
            method: "repeat".into(),
            args: vec![Expr::literal(1_000_000)],
            optional: false,
        };
        let (arena, scope) = fresh();
        let mut fuel = FuelMeter::new(50, CostOverrides::new());
        let err = eval(&expr, scope, &arena, &mut fuel).unwrap_err();
        assert!(matches!(err, VmError::OutOfFuel { .. }));
    }
}
