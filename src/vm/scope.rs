//! The scope chain (`spec.md` §3 "Scope chain").
//!
//! A `run` owns an arena of scope frames addressed by integer handles
//! (`spec.md` §9's recommended redesign of "scope chains with upward
//! capture"), rather than a reference-counted linked list of environments
//! the way the teacher's `Environment`/`Gc` does it — this guest language
//! has no user-visible object identity or cycles, so there is nothing for
//! a tracing collector to buy us.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

struct Binding {
    value: Value,
    is_const: bool,
}

struct ScopeFrame {
    parent: Option<ScopeId>,
    bindings: IndexMap<String, Binding>,
}

/// Owns every scope frame created during a single `Vm::run` call. Frames
/// are never removed individually; the whole arena is dropped when the
/// run ends.
pub struct ScopeArena {
    frames: Vec<ScopeFrame>,
}

impl ScopeArena {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Creates the top-level scope for a run (no parent).
    pub fn root(&mut self) -> ScopeId {
        self.child(None)
    }

    /// Creates a child scope of `parent` (or a detached root scope if `None`).
    pub fn child(&mut self, parent: Option<ScopeId>) -> ScopeId {
        self.frames.push(ScopeFrame {
            parent,
            bindings: IndexMap::new(),
        });
        ScopeId(self.frames.len() - 1)
    }

    fn frame(&self, id: ScopeId) -> &ScopeFrame {
        #[allow(clippy::indexing_slicing)]
        &self.frames[id.0]
    }

    fn frame_mut(&mut self, id: ScopeId) -> &mut ScopeFrame {
        #[allow(clippy::indexing_slicing)]
        &mut self.frames[id.0]
    }

    /// Declares a new binding in `scope` itself (not a parent), shadowing
    /// any binding of the same name already present there.
    pub fn declare(&mut self, scope: ScopeId, key: impl Into<String>, value: Value, is_const: bool) {
        self.frame_mut(scope)
            .bindings
            .insert(key.into(), Binding { value, is_const });
    }

    /// Declares a new `const` binding in `scope` itself. Fails if `scope`
    /// already has a `const` binding of that name in its own frame — a
    /// `const` cannot be shadowed within the same scope (`spec.md` §3).
    pub fn declare_const(&mut self, scope: ScopeId, key: impl Into<String>, value: Value) -> Result<(), VmError> {
        let key = key.into();
        if self.frame(scope).bindings.get(&key).is_some_and(|b| b.is_const) {
            return Err(VmError::Runtime {
                message: format!("cannot redeclare const binding '{key}' in the same scope"),
                op: Some("constSet".into()),
            });
        }
        self.declare(scope, key, value, true);
        Ok(())
    }

    /// Looks up `key` starting at `scope` and walking parents. Returns
    /// `None` if unbound anywhere in the chain.
    pub fn get(&self, scope: ScopeId, key: &str) -> Option<&Value> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = self.frame(id);
            if let Some(binding) = frame.bindings.get(key) {
                return Some(&binding.value);
            }
            current = frame.parent;
        }
        None
    }

    pub fn has(&self, scope: ScopeId, key: &str) -> bool {
        self.get(scope, key).is_some()
    }

    /// Writes to the nearest existing binding of `key` in the chain
    /// starting at `scope`. Declares a new binding in `scope` itself if
    /// `key` is unbound anywhere in the chain (`spec.md` §3: a bare
    /// `varSet` on an unknown name introduces it, matching `let`-style
    /// lowering of reassignment targets).
    pub fn set(&mut self, scope: ScopeId, key: &str, value: Value) -> Result<(), VmError> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = self.frame_mut(id);
            if let Some(binding) = frame.bindings.get_mut(key) {
                if binding.is_const {
                    return Err(VmError::Runtime {
                        message: format!("cannot assign to const binding '{key}'"),
                        op: Some("varSet".into()),
                    });
                }
                binding.value = value;
                return Ok(());
            }
            current = frame.parent;
        }
        self.declare(scope, key.to_string(), value, false);
        Ok(())
    }

    /// Exports `keys` from `scope` as a JSON object, reading `null` for any
    /// key not bound anywhere in the chain (`spec.md` §4.4 "return" rule,
    /// reused for `varsExport`).
    pub fn export(&self, scope: ScopeId, keys: &[String]) -> Value {
        let mut map = serde_json::Map::with_capacity(keys.len());
        for key in keys {
            map.insert(key.clone(), self.get(scope, key).cloned().unwrap_or(Value::Null));
        }
        Value::Object(map)
    }
}

impl Default for ScopeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_scope_sees_parent_bindings() {
        let mut arena = ScopeArena::new();
        let root = arena.root();
        arena.declare(root, "x", Value::from(1), false);
        let child = arena.child(Some(root));
        assert_eq!(arena.get(child, "x"), Some(&Value::from(1)));
    }

    #[test]
    fn set_on_const_fails() {
        let mut arena = ScopeArena::new();
        let root = arena.root();
        arena.declare(root, "x", Value::from(1), true);
        assert!(arena.set(root, "x", Value::from(2)).is_err());
    }

    #[test]
    fn const_cannot_be_redeclared_in_same_scope() {
        let mut arena = ScopeArena::new();
        let root = arena.root();
        arena.declare_const(root, "x", Value::from(1)).unwrap();
        assert!(arena.declare_const(root, "x", Value::from(2)).is_err());
    }

    #[test]
    fn const_in_child_scope_may_reuse_a_parent_const_name() {
        let mut arena = ScopeArena::new();
        let root = arena.root();
        arena.declare_const(root, "x", Value::from(1)).unwrap();
        let child = arena.child(Some(root));
        assert!(arena.declare_const(child, "x", Value::from(2)).is_ok());
    }

    #[test]
    fn set_in_child_does_not_shadow_parent_mutable_binding() {
        let mut arena = ScopeArena::new();
        let root = arena.root();
        arena.declare(root, "x", Value::from(1), false);
        let child = arena.child(Some(root));
        arena.set(child, "x", Value::from(2)).unwrap();
        assert_eq!(arena.get(root, "x"), Some(&Value::from(2)));
    }

    #[test]
    fn export_missing_key_is_null() {
        let mut arena = ScopeArena::new();
        let root = arena.root();
        arena.declare(root, "a", Value::from(1), false);
        let exported = arena.export(root, &["a".to_string(), "b".to_string()]);
        assert_eq!(exported, serde_json::json!({"a": 1, "b": null}));
    }
}
