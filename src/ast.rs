//! The Agent AST (`spec.md` §3): the lowered, serializable instruction tree
//! consumed by the VM, plus the expression-node tree evaluated purely by
//! the expression evaluator (`spec.md` §4.3).
//!
//! Both trees are plain `serde`-tagged enums. Every `Instruction` carries a
//! required `op` discriminant (via `#[serde(tag = "op")]`); every `Expr`
//! carries a required `$expr` discriminant. Neither tree holds references
//! into the source text or the JS-like parse tree — lowering fully detaches
//! the Agent AST from its origin (`spec.md` §3 invariant: "no references
//! into the source tree survive lowering").

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// How `varsImport`/`varsExport` name the scope bindings they touch:
/// either a flat list of names, or a rename map (`input name -> scope name`
/// for import, `scope name -> output name` for export).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameSpec {
    Keys { keys: Vec<String> },
    Map { map: IndexMap<String, String> },
}

/// A catch clause: `catch (param) { body }`. The catch parameter is
/// optional in the guest language (`catch { ... }` is also legal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchClause {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub body: Vec<Instruction>,
}

/// A tagged instruction node. The unit of VM execution (`spec.md` Glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Instruction {
    // ───────────────────────── Sequencing ─────────────────────────
    #[serde(rename = "seq")]
    Seq { steps: Vec<Instruction> },
    #[serde(rename = "scope")]
    Scope { steps: Vec<Instruction> },

    // ───────────────────────── Variables ─────────────────────────
    #[serde(rename = "varSet")]
    VarSet { key: String, value: Expr },
    #[serde(rename = "constSet")]
    ConstSet { key: String, value: Expr },
    #[serde(rename = "varGet")]
    VarGet { key: String, result: String },
    #[serde(rename = "varsImport")]
    VarsImport {
        #[serde(flatten)]
        spec: NameSpec,
    },
    #[serde(rename = "varsExport")]
    VarsExport {
        #[serde(flatten)]
        spec: NameSpec,
        result: String,
    },

    // ───────────────────────── Control ─────────────────────────
    #[serde(rename = "if")]
    If {
        condition: Expr,
        #[serde(rename = "then")]
        then_branch: Vec<Instruction>,
        #[serde(rename = "else", skip_serializing_if = "Option::is_none")]
        else_branch: Option<Vec<Instruction>>,
    },
    #[serde(rename = "while")]
    While { condition: Expr, body: Vec<Instruction> },
    #[serde(rename = "map")]
    Map {
        items: Expr,
        #[serde(rename = "as")]
        as_name: String,
        steps: Vec<Instruction>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    #[serde(rename = "filter")]
    Filter {
        items: Expr,
        #[serde(rename = "as")]
        as_name: String,
        steps: Vec<Instruction>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    #[serde(rename = "find")]
    Find {
        items: Expr,
        #[serde(rename = "as")]
        as_name: String,
        steps: Vec<Instruction>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    #[serde(rename = "reduce")]
    Reduce {
        items: Expr,
        #[serde(rename = "as")]
        as_name: String,
        accumulator: String,
        initial: Expr,
        steps: Vec<Instruction>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    #[serde(rename = "try")]
    Try {
        #[serde(rename = "try")]
        try_block: Vec<Instruction>,
        #[serde(rename = "catch", skip_serializing_if = "Option::is_none")]
        catch_block: Option<CatchClause>,
    },

    // ───────────────────────── Output ─────────────────────────
    #[serde(rename = "return")]
    Return { schema: Vec<String> },

    /// Parameter prelude validator emitted by lowering for required
    /// parameters (`spec.md` §4.6): passes an already-error-record-shaped
    /// binding through unchanged, else short-circuits with a `TypeError`
    /// if the named scope binding is missing or of the wrong structural
    /// kind.
    #[serde(rename = "typeCheck")]
    TypeCheck {
        param: String,
        #[serde(rename = "type")]
        type_desc: crate::types::TypeDescriptor,
        #[serde(default)]
        nullable: bool,
        path: String,
    },

    // ───────────────────────── Built-in ops ─────────────────────────
    #[serde(rename = "template")]
    Template {
        tmpl: String,
        vars: IndexMap<String, Expr>,
        result: String,
    },
    #[serde(rename = "jsonParse")]
    JsonParse { input: Expr, result: String },
    #[serde(rename = "jsonStringify")]
    JsonStringify { input: Expr, result: String },
    #[serde(rename = "regexMatch")]
    RegexMatch {
        input: Expr,
        pattern: Expr,
        #[serde(skip_serializing_if = "Option::is_none")]
        flags: Option<Expr>,
        result: String,
    },
    #[serde(rename = "hash")]
    Hash {
        input: Expr,
        #[serde(skip_serializing_if = "Option::is_none")]
        algorithm: Option<String>,
        result: String,
    },
    #[serde(rename = "uuid")]
    Uuid { result: String },
    #[serde(rename = "random")]
    Random { result: String },
    #[serde(rename = "httpFetch")]
    HttpFetch {
        url: Expr,
        #[serde(skip_serializing_if = "Option::is_none")]
        init: Option<Expr>,
        result: String,
    },
    #[serde(rename = "storeGet")]
    StoreGet { key: Expr, result: String },
    #[serde(rename = "storeSet")]
    StoreSet {
        key: Expr,
        value: Expr,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    #[serde(rename = "llmPredict")]
    LlmPredict { request: Expr, result: String },
    #[serde(rename = "xmlParse")]
    XmlParse { input: Expr, result: String },
    #[serde(rename = "push")]
    Push {
        list: String,
        value: Expr,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    #[serde(rename = "join")]
    Join {
        list: Expr,
        separator: Expr,
        result: String,
    },
    #[serde(rename = "split")]
    Split {
        input: Expr,
        separator: Expr,
        result: String,
    },
    #[serde(rename = "len")]
    Len { target: Expr, result: String },
    #[serde(rename = "pick")]
    Pick {
        target: Expr,
        keys: Vec<String>,
        result: String,
    },
    #[serde(rename = "keys")]
    Keys { target: Expr, result: String },
    #[serde(rename = "merge")]
    Merge { targets: Vec<Expr>, result: String },
    #[serde(rename = "mathCalc")]
    MathCalc {
        calc: String,
        args: Vec<Expr>,
        result: String,
    },
    #[serde(rename = "agentRun")]
    AgentRun {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<Expr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<Expr>,
        input: Expr,
        result: String,
    },

    /// Fallback for a call expression statement whose callee name is not one
    /// of the recognized built-ins above (`spec.md` §4.2: "Call expressions
    /// not bound to a result → generic op invocation with the callee name
    /// as `op`").
    #[serde(rename = "opCall")]
    OpCall {
        op: String,
        args: Vec<Expr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
}

/// A tagged expression node, evaluated purely against a [`crate::vm::scope::Scope`]
/// (`spec.md` §3 "Expression AST", §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "$expr")]
pub enum Expr {
    #[serde(rename = "literal")]
    Literal { value: serde_json::Value },
    #[serde(rename = "ident")]
    Ident { name: String },
    #[serde(rename = "member")]
    Member {
        object: Box<Expr>,
        /// The property name or computed index expression. Lowering
        /// guarantees this is a `Literal` for non-computed access and for
        /// any computed access (`spec.md` §4.3: "computed access with a
        /// dynamic index fails lowering, not evaluation").
        property: Box<Expr>,
        #[serde(default)]
        computed: bool,
        #[serde(default)]
        optional: bool,
    },
    #[serde(rename = "methodCall")]
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
        #[serde(default)]
        optional: bool,
    },
    #[serde(rename = "binary")]
    Binary {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    #[serde(rename = "logical")]
    Logical {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    #[serde(rename = "unary")]
    Unary { op: String, argument: Box<Expr> },
    #[serde(rename = "conditional")]
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    #[serde(rename = "array")]
    Array { elements: Vec<Expr> },
    #[serde(rename = "object")]
    Object { properties: Vec<ObjectProperty> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectProperty {
    pub key: String,
    pub value: Expr,
}

impl Expr {
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Ident { name: name.into() }
    }
}
