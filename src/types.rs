//! Structural type descriptors (`spec.md` §3) used by signatures and by the
//! runtime prelude validators emitted by the lowering pass (`spec.md` §4.6).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A structural description of a value's shape, inferred from literal
/// parameter defaults or declared explicitly via a return-type annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TypeDescriptor {
    String,
    Number,
    Boolean,
    Null,
    Any,
    Array {
        items: Box<TypeDescriptor>,
    },
    Object {
        shape: IndexMap<String, TypeDescriptor>,
        #[serde(skip_serializing_if = "Option::is_none")]
        destructured_params: Option<Vec<String>>,
    },
    Union {
        members: Vec<TypeDescriptor>,
    },
}

impl TypeDescriptor {
    pub fn primitive_name(&self) -> &'static str {
        match self {
            TypeDescriptor::String => "string",
            TypeDescriptor::Number => "number",
            TypeDescriptor::Boolean => "boolean",
            TypeDescriptor::Null => "null",
            TypeDescriptor::Any => "any",
            TypeDescriptor::Array { .. } => "array",
            TypeDescriptor::Object { .. } => "object",
            TypeDescriptor::Union { .. } => "union",
        }
    }

    /// Structural inference from a JSON literal, used both for parameter
    /// defaults (`spec.md` §4.2 "Type inference") and for `||`-chained
    /// nullable/union annotations handled by the caller.
    pub fn infer_from_literal(value: &serde_json::Value) -> TypeDescriptor {
        match value {
            serde_json::Value::String(_) => TypeDescriptor::String,
            serde_json::Value::Number(_) => TypeDescriptor::Number,
            serde_json::Value::Bool(_) => TypeDescriptor::Boolean,
            serde_json::Value::Null => TypeDescriptor::Null,
            serde_json::Value::Array(items) => {
                let item_ty = items
                    .first()
                    .map(TypeDescriptor::infer_from_literal)
                    .unwrap_or(TypeDescriptor::Any);
                TypeDescriptor::Array {
                    items: Box::new(item_ty),
                }
            }
            serde_json::Value::Object(map) => {
                let mut shape = IndexMap::new();
                for (k, v) in map {
                    shape.insert(k.clone(), TypeDescriptor::infer_from_literal(v));
                }
                TypeDescriptor::Object {
                    shape,
                    destructured_params: None,
                }
            }
        }
    }

    /// Checks whether a runtime value matches this descriptor's primitive
    /// kind, used by the prelude validator (`spec.md` §4.6). `nullable`
    /// parameters additionally accept `null`.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            TypeDescriptor::Any => true,
            TypeDescriptor::String => value.is_string(),
            TypeDescriptor::Number => value.is_number(),
            TypeDescriptor::Boolean => value.is_boolean(),
            TypeDescriptor::Null => value.is_null(),
            TypeDescriptor::Array { .. } => value.is_array(),
            TypeDescriptor::Object { .. } => value.is_object(),
            TypeDescriptor::Union { members } => members.iter().any(|m| m.matches(value)),
        }
    }
}

/// Descriptor for a single function parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDescriptor {
    #[serde(rename = "type")]
    pub type_desc: TypeDescriptor,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Orthogonal nullable flag: `X || null` gives the type of `X` with
    /// `nullable: true` (`spec.md` §4.2).
    #[serde(default)]
    pub nullable: bool,
}

/// The extracted declaration of a program's parameters and return type,
/// produced by lowering (`spec.md` §3 "Signature").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: IndexMap<String, ParamDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns: Option<TypeDescriptor>,
}
