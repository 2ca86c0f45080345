//! Fuel accounting (`spec.md` §4.3, §4.4): a decrementing counter bounding
//! total work per `run`, checked at every evaluator and instruction
//! dispatch boundary the way the teacher's `check_timeout` is checked at
//! every frame (`interpreter/mod.rs`), just for a different resource.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::error::VmError;

/// A host override for an op's fuel cost, given the op's primary input
/// value and the run's opaque `context` (`spec.md` §4.4 `costOverrides`).
pub type CostFn = dyn Fn(&Value, &Value) -> u64;

/// `op name -> cost function` table, supplied via `RunOptions`.
#[derive(Default)]
pub struct CostOverrides {
    table: HashMap<String, Box<CostFn>>,
}

impl CostOverrides {
    pub fn new() -> Self {
        Self { table: HashMap::new() }
    }

    pub fn set(&mut self, op: impl Into<String>, f: impl Fn(&Value, &Value) -> u64 + 'static) {
        self.table.insert(op.into(), Box::new(f));
    }

    fn cost_for(&self, op: &str, input: &Value, context: &Value, default: u64) -> u64 {
        match self.table.get(op) {
            Some(f) => f(input, context),
            None => default,
        }
    }
}

/// Allocation-proportional surcharge used for `+` on strings, array/object
/// literal construction, and string `repeat` (`spec.md` §4.3): `1 + ceil(n / 64)`.
pub fn alloc_cost(n: usize) -> u64 {
    1 + (n as u64).div_ceil(64)
}

/// Base cost charged for every evaluator entry (`spec.md` §4.3).
pub const BASE_COST: u64 = 1;

pub struct FuelMeter {
    budget: u64,
    used: u64,
    overrides: Rc<CostOverrides>,
}

impl FuelMeter {
    pub fn new(budget: u64, overrides: impl Into<Rc<CostOverrides>>) -> Self {
        Self {
            budget,
            used: 0,
            overrides: overrides.into(),
        }
    }

    /// Starts a fresh meter with the same cost-override table, used when a
    /// nested `agentRun` gets "a fresh fuel counter" (`spec.md` §4.4).
    pub fn fork(&self, budget: u64) -> Self {
        Self {
            budget,
            used: 0,
            overrides: Rc::clone(&self.overrides),
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.used)
    }

    /// Charges `default` fuel for `op`, after applying any host override
    /// keyed on `input`/`context`. Fails with `OutOfFuel` (tagging the op)
    /// if this exhausts the budget; `used` is clamped to `budget` so
    /// `fuelUsed == fuel` holds exactly on exhaustion (`spec.md` §8).
    pub fn charge(&mut self, op: &str, input: &Value, context: &Value, default: u64) -> Result<(), VmError> {
        let amount = self.overrides.cost_for(op, input, context, default);
        self.used = self.used.saturating_add(amount);
        if self.used > self.budget {
            self.used = self.budget;
            return Err(VmError::OutOfFuel { op: op.to_string() });
        }
        Ok(())
    }

    /// Charges a fixed amount with no override lookup, used internally by
    /// the evaluator for the flat per-node `BASE_COST`.
    pub fn charge_flat(&mut self, op: &str, amount: u64) -> Result<(), VmError> {
        self.used = self.used.saturating_add(amount);
        if self.used > self.budget {
            self.used = self.budget;
            return Err(VmError::OutOfFuel { op: op.to_string() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_clamps_used_to_budget() {
        let mut meter = FuelMeter::new(5, CostOverrides::new());
        for _ in 0..5 {
            meter.charge_flat("ident", 1).unwrap();
        }
        let err = meter.charge_flat("ident", 1).unwrap_err();
        assert!(matches!(err, VmError::OutOfFuel { .. }));
        assert_eq!(meter.used(), 5);
    }

    #[test]
    fn override_replaces_default_cost() {
        let mut overrides = CostOverrides::new();
        overrides.set("mathCalc", |_input, _ctx| 100);
        let mut meter = FuelMeter::new(1000, overrides);
        meter.charge("mathCalc", &Value::Null, &Value::Null, 1).unwrap();
        assert_eq!(meter.used(), 100);
    }
}
