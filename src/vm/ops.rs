//! Capability dispatcher (`spec.md` §4.5): implementations of every
//! built-in `Instruction` that is not pure control flow or scope access.
//! Pure, in-memory ops are computed directly here; effectful ones are
//! resolved against the injected `Capabilities` bundle.

use std::fmt::Write as _;

use serde_json::Value;

use crate::error::VmError;
use crate::vm::capabilities::{AbortSignal, Capabilities};

pub fn json_parse(input: &Value) -> Result<Value, VmError> {
    let text = as_string(input, "jsonParse")?;
    serde_json::from_str(&text).map_err(|e| VmError::Runtime {
        message: format!("invalid JSON: {e}"),
        op: Some("jsonParse".into()),
    })
}

pub fn json_stringify(input: &Value) -> Value {
    Value::String(serde_json::to_string(input).unwrap_or_else(|_| "null".to_string()))
}

/// `spec.md` §3 lists `regexMatch` among the built-in ops without
/// prescribing its exact output shape; this crate returns `null` on no
/// match, a single `{match, groups, index}` record by default, and an
/// array of such records when the `g` flag is present.
pub fn regex_match(input: &Value, pattern: &Value, flags: Option<&Value>) -> Result<Value, VmError> {
    let haystack = as_string(input, "regexMatch")?;
    let raw_pattern = as_string(pattern, "regexMatch")?;
    let flag_str = match flags {
        Some(v) => as_string(v, "regexMatch")?,
        None => String::new(),
    };
    let global = flag_str.contains('g');
    let mut effective = String::new();
    if flag_str.contains('i') {
        effective.push_str("(?i)");
    }
    effective.push_str(&raw_pattern);
    let re = fancy_regex::Regex::new(&effective).map_err(|e| VmError::Runtime {
        message: format!("invalid regular expression: {e}"),
        op: Some("regexMatch".into()),
    })?;

    let to_record = |m: fancy_regex::Captures| -> Value {
        let full = m.get(0).map(|mm| mm.as_str().to_string()).unwrap_or_default();
        let index = m.get(0).map(|mm| mm.start()).unwrap_or(0);
        let groups: Vec<Value> = (1..m.len())
            .map(|i| match m.get(i) {
                Some(g) => Value::String(g.as_str().to_string()),
                None => Value::Null,
            })
            .collect();
        serde_json::json!({ "match": full, "groups": groups, "index": index })
    };

    if global {
        let mut matches = Vec::new();
        for m in re.captures_iter(&haystack) {
            let m = m.map_err(|e| VmError::Runtime {
                message: format!("regex match failed: {e}"),
                op: Some("regexMatch".into()),
            })?;
            matches.push(to_record(m));
        }
        return Ok(Value::Array(matches));
    }

    match re.captures(&haystack) {
        Ok(Some(m)) => Ok(to_record(m)),
        Ok(None) => Ok(Value::Null),
        Err(e) => Err(VmError::Runtime {
            message: format!("regex match failed: {e}"),
            op: Some("regexMatch".into()),
        }),
    }
}

pub fn hash(input: &Value, algorithm: Option<&str>) -> Result<Value, VmError> {
    let text = match input {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    match algorithm.unwrap_or("sha256") {
        "sha256" => {
            use sha2::{Digest, Sha256};
            let digest = Sha256::digest(text.as_bytes());
            Ok(Value::String(hex(&digest)))
        }
        other => Err(VmError::Runtime {
            message: format!("unsupported hash algorithm '{other}'"),
            op: Some("hash".into()),
        }),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn uuid() -> Value {
    Value::String(uuid::Uuid::new_v4().to_string())
}

/// A small xorshift PRNG seeded from the capability clock plus a per-run
/// counter, avoiding a dependency on a dedicated `rand` crate for a
/// single `Math.random()`-shaped op (`spec.md` §4.5 "seeding where
/// deterministic runs are required").
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_f64(&mut self) -> f64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }
}

pub fn http_fetch(
    url: &Value,
    init: Option<&Value>,
    capabilities: &dyn Capabilities,
    context: &Value,
    abort: &dyn AbortSignal,
) -> Result<Value, VmError> {
    let url = as_string(url, "httpFetch")?;
    let init = init.cloned().unwrap_or(Value::Null);
    capabilities.fetch(&url, &init, context, abort)
}

pub fn store_get(key: &Value, capabilities: &dyn Capabilities, context: &Value) -> Result<Value, VmError> {
    let key = as_string(key, "storeGet")?;
    capabilities.store_get(&key, context)
}

pub fn store_set(key: &Value, value: &Value, capabilities: &dyn Capabilities, context: &Value) -> Result<Value, VmError> {
    let key = as_string(key, "storeSet")?;
    capabilities.store_set(&key, value, context)?;
    Ok(value.clone())
}

pub fn llm_predict(request: &Value, capabilities: &dyn Capabilities, context: &Value, abort: &dyn AbortSignal) -> Result<Value, VmError> {
    capabilities.llm_predict(request, context, abort)
}

/// Minimal element-tree XML parser (`roxmltree`), converting a document
/// into the same shape the guest's `jsonParse` would produce for an
/// equivalent JSON document: `{tag, attributes, children: [...], text?}`.
pub fn xml_parse(input: &Value) -> Result<Value, VmError> {
    let text = as_string(input, "xmlParse")?;
    let doc = roxmltree::Document::parse(&text).map_err(|e| VmError::Runtime {
        message: format!("invalid XML: {e}"),
        op: Some("xmlParse".into()),
    })?;
    Ok(xml_node_to_value(doc.root_element()))
}

fn xml_node_to_value(node: roxmltree::Node) -> Value {
    let mut attributes = serde_json::Map::new();
    for attr in node.attributes() {
        attributes.insert(attr.name().to_string(), Value::String(attr.value().to_string()));
    }
    let mut children = Vec::new();
    let mut text = String::new();
    for child in node.children() {
        if child.is_element() {
            children.push(xml_node_to_value(child));
        } else if let Some(t) = child.text() {
            text.push_str(t);
        }
    }
    let mut obj = serde_json::Map::new();
    obj.insert("tag".to_string(), Value::String(node.tag_name().name().to_string()));
    obj.insert("attributes".to_string(), Value::Object(attributes));
    obj.insert("children".to_string(), Value::Array(children));
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        obj.insert("text".to_string(), Value::String(trimmed.to_string()));
    }
    Value::Object(obj)
}

pub fn len(target: &Value) -> Value {
    let n = match target {
        Value::Array(items) => items.len(),
        Value::String(s) => s.chars().count(),
        Value::Object(map) => map.len(),
        _ => 0,
    };
    Value::from(n)
}

pub fn pick(target: &Value, keys: &[String]) -> Value {
    let Value::Object(map) = target else {
        return Value::Null;
    };
    let mut out = serde_json::Map::with_capacity(keys.len());
    for key in keys {
        if let Some(v) = map.get(key) {
            out.insert(key.clone(), v.clone());
        }
    }
    Value::Object(out)
}

pub fn keys(target: &Value) -> Value {
    match target {
        Value::Object(map) => Value::Array(map.keys().map(|k| Value::String(k.clone())).collect()),
        _ => Value::Array(Vec::new()),
    }
}

pub fn merge(targets: &[Value]) -> Value {
    let mut out = serde_json::Map::new();
    for target in targets {
        if let Value::Object(map) = target {
            for (k, v) in map {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

pub fn join(list: &Value, separator: &Value) -> Result<Value, VmError> {
    let Value::Array(items) = list else {
        return Err(VmError::Runtime {
            message: "join() requires an array".into(),
            op: Some("join".into()),
        });
    };
    let sep = as_string(separator, "join")?;
    let joined = items
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(&sep);
    Ok(Value::String(joined))
}

pub fn split(input: &Value, separator: &Value) -> Result<Value, VmError> {
    let text = as_string(input, "split")?;
    let sep = as_string(separator, "split")?;
    let parts = if sep.is_empty() {
        text.chars().map(|c| Value::String(c.to_string())).collect()
    } else {
        text.split(sep.as_str()).map(|s| Value::String(s.to_string())).collect()
    };
    Ok(Value::Array(parts))
}

fn as_string(value: &Value, op: &str) -> Result<String, VmError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(VmError::Runtime {
            message: format!("'{op}' expected a string argument, got {other}"),
            op: Some(op.to_string()),
        }),
    }
}

/// A tiny arithmetic sublanguage for `mathCalc`: `+ - * / %`, unary `-`,
/// parentheses, numeric literals, and positional placeholders `$0`, `$1`,
/// ... referring to `args` by index (`spec.md` §3 lists `mathCalc` among
/// the built-ins without specifying its expression grammar).
pub fn math_calc(calc: &str, args: &[Value]) -> Result<Value, VmError> {
    let mut parser = CalcParser {
        chars: calc.chars().collect(),
        pos: 0,
        args,
    };
    let result = parser.parse_expr()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(VmError::Runtime {
            message: format!("unexpected trailing input in mathCalc expression '{calc}'"),
            op: Some("mathCalc".into()),
        });
    }
    Ok(serde_json::Number::from_f64(result).map(Value::Number).unwrap_or(Value::Null))
}

struct CalcParser<'a> {
    chars: Vec<char>,
    pos: usize,
    args: &'a [Value],
}

impl CalcParser<'_> {
    fn skip_ws(&mut self) {
        while matches!(self.chars.get(self.pos), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        self.skip_ws();
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn parse_expr(&mut self) -> Result<f64, VmError> {
        let mut value = self.parse_term()?;
        loop {
            match self.peek() {
                Some('+') => {
                    self.bump();
                    value += self.parse_term()?;
                }
                Some('-') => {
                    self.bump();
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> Result<f64, VmError> {
        let mut value = self.parse_unary()?;
        loop {
            match self.peek() {
                Some('*') => {
                    self.bump();
                    value *= self.parse_unary()?;
                }
                Some('/') => {
                    self.bump();
                    value /= self.parse_unary()?;
                }
                Some('%') => {
                    self.bump();
                    value %= self.parse_unary()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<f64, VmError> {
        if self.peek() == Some('-') {
            self.bump();
            return Ok(-self.parse_unary()?);
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<f64, VmError> {
        match self.peek() {
            Some('(') => {
                self.bump();
                let value = self.parse_expr()?;
                if self.bump() != Some(')') {
                    return Err(VmError::Runtime {
                        message: "expected ')' in mathCalc expression".into(),
                        op: Some("mathCalc".into()),
                    });
                }
                Ok(value)
            }
            Some('$') => {
                self.bump();
                let mut digits = String::new();
                while matches!(self.chars.get(self.pos), Some(c) if c.is_ascii_digit()) {
                    digits.push(self.chars[self.pos]);
                    self.pos += 1;
                }
                let index: usize = digits.parse().map_err(|_| VmError::Runtime {
                    message: "expected a placeholder index after '$' in mathCalc expression".into(),
                    op: Some("mathCalc".into()),
                })?;
                self.args.get(index).and_then(|v| v.as_f64()).ok_or_else(|| VmError::Runtime {
                    message: format!("mathCalc placeholder '${index}' has no matching numeric argument"),
                    op: Some("mathCalc".into()),
                })
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.chars.get(self.pos), Some(c) if c.is_ascii_digit() || *c == '.') {
                    self.pos += 1;
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                text.parse::<f64>().map_err(|_| VmError::Runtime {
                    message: format!("invalid number literal '{text}' in mathCalc expression"),
                    op: Some("mathCalc".into()),
                })
            }
            other => Err(VmError::Runtime {
                message: format!("unexpected character {other:?} in mathCalc expression"),
                op: Some("mathCalc".into()),
            }),
        }
    }
}
