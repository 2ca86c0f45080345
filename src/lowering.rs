//! Lowering pass (`spec.md` §4.2): walks the JS-like program tree produced
//! by the parser and emits the Agent AST, extracting the function
//! signature and JSDoc documentation along the way.

use indexmap::IndexMap;
use serde_json::Value;

use crate::ast::{CatchClause, Expr, Instruction, NameSpec, ObjectProperty};
use crate::error::VmError;
use crate::parser::{ArrowBody, JsExpr, JsParam, JsProgram, JsStmt, PropKey, ReturnMarker};
use crate::types::{ParamDescriptor, Signature, TypeDescriptor};

/// The result of a successful lowering pass (`spec.md` §4.2 contract).
#[derive(Debug, Clone)]
pub struct LoweringOutput {
    pub ast: Instruction,
    pub signature: Signature,
    /// How the declared return-type annotation should be enforced at run
    /// time; `None` when the program declared no return type.
    pub return_marker: Option<ReturnMarker>,
    pub warnings: Vec<String>,
}

/// Method names with a dedicated Agent AST instruction rather than a
/// generic `methodCall` expression (`spec.md` §4.2).
const CALLBACK_METHODS: &[&str] = &["map", "filter", "find", "reduce"];
const PLAIN_LIST_METHODS: &[&str] = &["push", "join", "split"];

const SYNTHETIC_RESULT_KEY: &str = "__result__";
const CALLBACK_ITEM_KEY: &str = "__item__";

pub fn transform(program: &JsProgram) -> Result<LoweringOutput, VmError> {
    let func = &program.function;
    let mut lowerer = Lowerer::new();

    let mut prelude = Vec::new();
    let mut param_names = Vec::new();
    let mut parameters = IndexMap::new();

    for param in &func.params {
        match param {
            JsParam::Positional {
                name,
                required,
                default,
                ..
            } => {
                lowerer.lower_param(
                    name,
                    *required,
                    default.as_ref(),
                    &func.name,
                    &mut param_names,
                    &mut parameters,
                    &mut prelude,
                )?;
            }
            JsParam::Destructured { props, .. } => {
                for p in props {
                    lowerer.lower_param(
                        &p.name,
                        p.required,
                        p.default.as_ref(),
                        &func.name,
                        &mut param_names,
                        &mut parameters,
                        &mut prelude,
                    )?;
                }
            }
        }
    }

    let (description, param_docs) = extract_jsdoc(func.doc_comment.as_deref());
    for (pname, doc) in param_docs {
        if let Some(p) = parameters.get_mut(&pname) {
            p.description = Some(doc);
        } else {
            lowerer
                .warnings
                .push(format!("@param '{pname}' does not match any declared parameter"));
        }
    }

    let mut steps = Vec::new();
    if !param_names.is_empty() {
        steps.push(Instruction::VarsImport {
            spec: NameSpec::Keys { keys: param_names },
        });
    }
    steps.extend(prelude);
    steps.extend(lowerer.lower_stmts(&func.body, false)?);

    let signature = Signature {
        name: func.name.clone(),
        description,
        parameters,
        returns: func.return_type.clone(),
    };

    Ok(LoweringOutput {
        ast: Instruction::Seq { steps },
        signature,
        return_marker: func.return_marker,
        warnings: lowerer.warnings,
    })
}

struct Lowerer {
    warnings: Vec<String>,
    temp_counter: u32,
}

impl Lowerer {
    fn new() -> Self {
        Self {
            warnings: Vec::new(),
            temp_counter: 0,
        }
    }

    fn next_temp(&mut self) -> String {
        let name = format!("_t{}", self.temp_counter);
        self.temp_counter += 1;
        name
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_param(
        &mut self,
        name: &str,
        required: bool,
        default: Option<&JsExpr>,
        func_name: &str,
        param_names: &mut Vec<String>,
        parameters: &mut IndexMap<String, ParamDescriptor>,
        prelude: &mut Vec<Instruction>,
    ) -> Result<(), VmError> {
        param_names.push(name.to_string());
        let (type_desc, nullable) = match default {
            Some(expr) => classify_default_expr(expr),
            None => (TypeDescriptor::Any, false),
        };
        let default_value = if required {
            None
        } else {
            default.and_then(constant_fold)
        };
        parameters.insert(
            name.to_string(),
            ParamDescriptor {
                type_desc: type_desc.clone(),
                required,
                default: default_value.clone(),
                description: None,
                nullable,
            },
        );
        if required {
            prelude.push(Instruction::TypeCheck {
                param: name.to_string(),
                type_desc,
                nullable,
                path: format!("{func_name}.{name}"),
            });
        } else if let Some(dv) = default_value {
            prelude.push(Instruction::If {
                condition: Expr::Binary {
                    op: "===".into(),
                    left: Box::new(Expr::ident(name)),
                    right: Box::new(Expr::literal(Value::Null)),
                },
                then_branch: vec![Instruction::VarSet {
                    key: name.to_string(),
                    value: Expr::literal(dv),
                }],
                else_branch: None,
            });
        }
        Ok(())
    }

    // ─────────────────────────── Statements ───────────────────────────

    fn lower_stmts(&mut self, stmts: &[JsStmt], in_callback: bool) -> Result<Vec<Instruction>, VmError> {
        let mut out = Vec::new();
        for stmt in stmts {
            out.extend(self.lower_stmt(stmt, in_callback)?);
        }
        Ok(out)
    }

    fn lower_stmt(&mut self, stmt: &JsStmt, in_callback: bool) -> Result<Vec<Instruction>, VmError> {
        match stmt {
            JsStmt::Let { name, init } => self.lower_value_binding(name, init, false),
            JsStmt::Const { name, init } => self.lower_value_binding(name, init, true),
            JsStmt::Assign { name, value } => self.lower_value_binding(name, value, false),
            JsStmt::ExprStmt { expr } => self.lower_expr_stmt(expr),
            JsStmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut hoist = Vec::new();
                let condition = self.lower_expr(cond, &mut hoist)?;
                let then_instr = self.lower_stmts(then_branch, in_callback)?;
                let else_instr = else_branch
                    .as_ref()
                    .map(|b| self.lower_stmts(b, in_callback))
                    .transpose()?;
                hoist.push(Instruction::If {
                    condition,
                    then_branch: then_instr,
                    else_branch: else_instr,
                });
                Ok(hoist)
            }
            JsStmt::While { cond, body } => {
                let mut hoist = Vec::new();
                let condition = self.lower_expr(cond, &mut hoist)?;
                if !hoist.is_empty() {
                    self.warnings
                        .push("while-condition side effects are only evaluated once before the loop".into());
                }
                let body_instr = self.lower_stmts(body, in_callback)?;
                hoist.push(Instruction::While {
                    condition,
                    body: body_instr,
                });
                Ok(hoist)
            }
            JsStmt::ForOf {
                var_name,
                iterable,
                body,
            } => {
                let mut hoist = Vec::new();
                let items = self.lower_expr(iterable, &mut hoist)?;
                let steps = self.lower_stmts(body, false)?;
                hoist.push(Instruction::Map {
                    items,
                    as_name: var_name.clone(),
                    steps,
                    result: None,
                });
                Ok(hoist)
            }
            JsStmt::Try {
                try_block,
                catch_param,
                catch_block,
            } => {
                let try_instr = self.lower_stmts(try_block, in_callback)?;
                let catch_instr = match catch_block {
                    Some(cb) => Some(CatchClause {
                        param: catch_param.clone(),
                        body: self.lower_stmts(cb, in_callback)?,
                    }),
                    None => None,
                };
                Ok(vec![Instruction::Try {
                    try_block: try_instr,
                    catch_block: catch_instr,
                }])
            }
            JsStmt::Return { expr } => self.lower_return(expr.as_ref(), in_callback),
            JsStmt::Block { body } => Ok(vec![Instruction::Scope {
                steps: self.lower_stmts(body, in_callback)?,
            }]),
        }
    }

    fn lower_value_binding(
        &mut self,
        name: &str,
        init: &JsExpr,
        is_const: bool,
    ) -> Result<Vec<Instruction>, VmError> {
        if let Some(instrs) = self.try_lower_builtin(init, Some(name.to_string()))? {
            return Ok(instrs);
        }
        let mut hoist = Vec::new();
        let value = self.lower_expr(init, &mut hoist)?;
        hoist.push(if is_const {
            Instruction::ConstSet {
                key: name.to_string(),
                value,
            }
        } else {
            Instruction::VarSet {
                key: name.to_string(),
                value,
            }
        });
        Ok(hoist)
    }

    fn lower_expr_stmt(&mut self, expr: &JsExpr) -> Result<Vec<Instruction>, VmError> {
        if let Some(instrs) = self.try_lower_builtin(expr, None)? {
            return Ok(instrs);
        }
        if let JsExpr::Call {
            callee,
            args,
            optional,
        } = expr
        {
            if let JsExpr::Ident(name) = callee.as_ref() {
                let mut hoist = Vec::new();
                let lowered_args = self.lower_expr_list(args, &mut hoist)?;
                hoist.push(Instruction::OpCall {
                    op: name.clone(),
                    args: lowered_args,
                    result: None,
                });
                return Ok(hoist);
            }
            if let JsExpr::Member {
                object,
                property: PropKey::Name(method),
                optional: member_optional,
            } = callee.as_ref()
            {
                if !CALLBACK_METHODS.contains(&method.as_str())
                    && !PLAIN_LIST_METHODS.contains(&method.as_str())
                {
                    self.warnings
                        .push(format!("unknown method '{method}' used in a no-effect expression statement"));
                    let mut hoist = Vec::new();
                    let lowered_object = self.lower_expr(object, &mut hoist)?;
                    let lowered_args = self.lower_expr_list(args, &mut hoist)?;
                    let temp = self.next_temp();
                    hoist.push(Instruction::VarSet {
                        key: temp,
                        value: Expr::MethodCall {
                            object: Box::new(lowered_object),
                            method: method.clone(),
                            args: lowered_args,
                            optional: *optional || *member_optional,
                        },
                    });
                    return Ok(hoist);
                }
            }
        }
        self.warnings.push("no-effect expression statement".into());
        let mut hoist = Vec::new();
        let value = self.lower_expr(expr, &mut hoist)?;
        let temp = self.next_temp();
        hoist.push(Instruction::VarSet { key: temp, value });
        Ok(hoist)
    }

    fn lower_return(&mut self, expr: Option<&JsExpr>, in_callback: bool) -> Result<Vec<Instruction>, VmError> {
        if in_callback {
            let mut hoist = Vec::new();
            let value = match expr {
                Some(e) => self.lower_expr(e, &mut hoist)?,
                None => Expr::literal(Value::Null),
            };
            hoist.push(Instruction::VarSet {
                key: CALLBACK_ITEM_KEY.to_string(),
                value,
            });
            return Ok(hoist);
        }
        match expr {
            None => Ok(vec![Instruction::Return { schema: Vec::new() }]),
            Some(JsExpr::Object(props)) => {
                let mut hoist = Vec::new();
                let mut schema = Vec::new();
                for (key, value) in props {
                    let key_name = match key {
                        PropKey::Name(n) => n.clone(),
                        PropKey::Computed(_) => {
                            return Err(VmError::Runtime {
                                message: "computed keys are not supported in a return object literal".into(),
                                op: Some("return".into()),
                            })
                        }
                    };
                    let is_shorthand = matches!(value, JsExpr::Ident(n) if n == &key_name);
                    if !is_shorthand {
                        let lowered = self.lower_expr(value, &mut hoist)?;
                        hoist.push(Instruction::VarSet {
                            key: key_name.clone(),
                            value: lowered,
                        });
                    }
                    schema.push(key_name);
                }
                hoist.push(Instruction::Return { schema });
                Ok(hoist)
            }
            Some(other) => {
                if let Some(mut instrs) = self.try_lower_builtin(other, Some(SYNTHETIC_RESULT_KEY.to_string()))? {
                    instrs.push(Instruction::Return {
                        schema: vec![SYNTHETIC_RESULT_KEY.to_string()],
                    });
                    return Ok(instrs);
                }
                let mut hoist = Vec::new();
                let value = self.lower_expr(other, &mut hoist)?;
                hoist.push(Instruction::VarSet {
                    key: SYNTHETIC_RESULT_KEY.to_string(),
                    value,
                });
                hoist.push(Instruction::Return {
                    schema: vec![SYNTHETIC_RESULT_KEY.to_string()],
                });
                Ok(hoist)
            }
        }
    }

    // ─────────────────────────── Builtin-op recognition ───────────────────────────

    /// Recognizes a call expression shaped like a built-in op (free-standing
    /// name or one of the seven recognized method names) or a template
    /// literal, and lowers it directly to its dedicated instruction bound
    /// to `result` (`spec.md` §4.2). Returns `Ok(None)` for anything else.
    fn try_lower_builtin(
        &mut self,
        expr: &JsExpr,
        result: Option<String>,
    ) -> Result<Option<Vec<Instruction>>, VmError> {
        if let JsExpr::Template(_) = expr {
            let mut hoist = Vec::new();
            let name = result.unwrap_or_else(|| self.next_temp());
            let instr = self.lower_template(expr, &name, &mut hoist)?;
            hoist.push(instr);
            return Ok(Some(hoist));
        }
        let JsExpr::Call { callee, args, .. } = expr else {
            return Ok(None);
        };
        if let JsExpr::Ident(name) = callee.as_ref() {
            return self.try_lower_free_builtin(name, args, result);
        }
        if let JsExpr::Member {
            object,
            property: PropKey::Name(method),
            ..
        } = callee.as_ref()
        {
            return self.try_lower_method_builtin(method, object, args, result);
        }
        Ok(None)
    }

    fn try_lower_free_builtin(
        &mut self,
        name: &str,
        args: &[JsExpr],
        result: Option<String>,
    ) -> Result<Option<Vec<Instruction>>, VmError> {
        let mut hoist = Vec::new();
        let arg = |lowerer: &mut Self, hoist: &mut Vec<Instruction>, i: usize| -> Result<Expr, VmError> {
            match args.get(i) {
                Some(e) => lowerer.lower_expr(e, hoist),
                None => Ok(Expr::literal(Value::Null)),
            }
        };
        let instr = match name {
            "jsonParse" => Instruction::JsonParse {
                input: arg(self, &mut hoist, 0)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "jsonStringify" => Instruction::JsonStringify {
                input: arg(self, &mut hoist, 0)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "regexMatch" => Instruction::RegexMatch {
                input: arg(self, &mut hoist, 0)?,
                pattern: arg(self, &mut hoist, 1)?,
                flags: if args.len() > 2 {
                    Some(arg(self, &mut hoist, 2)?)
                } else {
                    None
                },
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "hash" => Instruction::Hash {
                input: arg(self, &mut hoist, 0)?,
                algorithm: match args.get(1) {
                    Some(JsExpr::String(s)) => Some(s.clone()),
                    _ => None,
                },
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "uuid" => Instruction::Uuid {
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "random" => Instruction::Random {
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "httpFetch" => Instruction::HttpFetch {
                url: arg(self, &mut hoist, 0)?,
                init: if args.len() > 1 {
                    Some(arg(self, &mut hoist, 1)?)
                } else {
                    None
                },
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "storeGet" => Instruction::StoreGet {
                key: arg(self, &mut hoist, 0)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "storeSet" => Instruction::StoreSet {
                key: arg(self, &mut hoist, 0)?,
                value: arg(self, &mut hoist, 1)?,
                result,
            },
            "llmPredict" => Instruction::LlmPredict {
                request: arg(self, &mut hoist, 0)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "xmlParse" => Instruction::XmlParse {
                input: arg(self, &mut hoist, 0)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "len" => Instruction::Len {
                target: arg(self, &mut hoist, 0)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "pick" => {
                let keys = match args.get(1) {
                    Some(JsExpr::Array(items)) => items
                        .iter()
                        .map(|e| match e {
                            JsExpr::String(s) => Ok(s.clone()),
                            _ => Err(VmError::Runtime {
                                message: "pick() key list must be an array of string literals".into(),
                                op: Some("pick".into()),
                            }),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => {
                        return Err(VmError::Runtime {
                            message: "pick() requires a literal array of key names".into(),
                            op: Some("pick".into()),
                        })
                    }
                };
                Instruction::Pick {
                    target: arg(self, &mut hoist, 0)?,
                    keys,
                    result: result.unwrap_or_else(|| self.next_temp()),
                }
            }
            "keys" => Instruction::Keys {
                target: arg(self, &mut hoist, 0)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "merge" => Instruction::Merge {
                targets: self.lower_expr_list(args, &mut hoist)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "mathCalc" => {
                let calc = match args.first() {
                    Some(JsExpr::String(s)) => s.clone(),
                    _ => {
                        return Err(VmError::Runtime {
                            message: "mathCalc() requires a literal expression string as its first argument".into(),
                            op: Some("mathCalc".into()),
                        })
                    }
                };
                let rest = args.get(1..).unwrap_or(&[]);
                Instruction::MathCalc {
                    calc,
                    args: self.lower_expr_list(rest, &mut hoist)?,
                    result: result.unwrap_or_else(|| self.next_temp()),
                }
            }
            "agentRun" => {
                let (agent_id, token) = match args.first() {
                    Some(JsExpr::Object(props)) => {
                        let mut agent_id_expr = None;
                        let mut token_expr = None;
                        for (key, value) in props {
                            if let PropKey::Name(k) = key {
                                match k.as_str() {
                                    "token" => token_expr = Some(self.lower_expr(value, &mut hoist)?),
                                    "agentId" => agent_id_expr = Some(self.lower_expr(value, &mut hoist)?),
                                    _ => {}
                                }
                            }
                        }
                        (agent_id_expr, token_expr)
                    }
                    Some(other) => (Some(self.lower_expr(other, &mut hoist)?), None),
                    None => (None, None),
                };
                Instruction::AgentRun {
                    agent_id,
                    token,
                    input: arg(self, &mut hoist, 1)?,
                    result: result.unwrap_or_else(|| self.next_temp()),
                }
            }
            _ => return Ok(None),
        };
        hoist.push(instr);
        Ok(Some(hoist))
    }

    fn try_lower_method_builtin(
        &mut self,
        method: &str,
        object: &JsExpr,
        args: &[JsExpr],
        result: Option<String>,
    ) -> Result<Option<Vec<Instruction>>, VmError> {
        if CALLBACK_METHODS.contains(&method) {
            return self.lower_callback_method(method, object, args, result).map(Some);
        }
        if !PLAIN_LIST_METHODS.contains(&method) {
            return Ok(None);
        }
        let mut hoist = Vec::new();
        let instr = match method {
            "push" => {
                let JsExpr::Ident(list_name) = object else {
                    return Err(VmError::Runtime {
                        message: "push() receiver must be a plain identifier naming a scope list".into(),
                        op: Some("push".into()),
                    });
                };
                let value = self.lower_expr(args.first().unwrap_or(&JsExpr::Null), &mut hoist)?;
                Instruction::Push {
                    list: list_name.clone(),
                    value,
                    result,
                }
            }
            "join" => Instruction::Join {
                list: self.lower_expr(object, &mut hoist)?,
                separator: self.lower_expr(args.first().unwrap_or(&JsExpr::String(String::new())), &mut hoist)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            "split" => Instruction::Split {
                input: self.lower_expr(object, &mut hoist)?,
                separator: self.lower_expr(args.first().unwrap_or(&JsExpr::String(String::new())), &mut hoist)?,
                result: result.unwrap_or_else(|| self.next_temp()),
            },
            _ => return Ok(None),
        };
        hoist.push(instr);
        Ok(Some(hoist))
    }

    fn lower_callback_method(
        &mut self,
        method: &str,
        object: &JsExpr,
        args: &[JsExpr],
        result: Option<String>,
    ) -> Result<Vec<Instruction>, VmError> {
        let mut hoist = Vec::new();
        let items = self.lower_expr(object, &mut hoist)?;

        if method == "reduce" {
            let callback = args.first().ok_or_else(|| VmError::Runtime {
                message: "reduce() requires a callback argument".into(),
                op: Some("reduce".into()),
            })?;
            let (params, body) = self.arrow_parts(callback, "reduce")?;
            let accumulator = params.first().cloned().unwrap_or_else(|| "acc".to_string());
            let as_name = params.get(1).cloned().unwrap_or_else(|| "item".to_string());
            let initial_expr = args.get(1).ok_or_else(|| VmError::Runtime {
                message: "reduce() requires an initial-value argument".into(),
                op: Some("reduce".into()),
            })?;
            let initial = self.lower_expr(initial_expr, &mut hoist)?;
            let steps = self.lower_callback_body(&body)?;
            hoist.push(Instruction::Reduce {
                items,
                as_name,
                accumulator,
                initial,
                steps,
                result,
            });
            return Ok(hoist);
        }

        let callback = args.first().ok_or_else(|| VmError::Runtime {
            message: format!("{method}() requires a callback argument"),
            op: Some(method.into()),
        })?;
        let (params, body) = self.arrow_parts(callback, method)?;
        let as_name = params.first().cloned().unwrap_or_else(|| "item".to_string());
        let steps = self.lower_callback_body(&body)?;
        let instr = match method {
            "map" => Instruction::Map {
                items,
                as_name,
                steps,
                result,
            },
            "filter" => Instruction::Filter {
                items,
                as_name,
                steps,
                result,
            },
            "find" => Instruction::Find {
                items,
                as_name,
                steps,
                result,
            },
            _ => {
                return Err(VmError::Runtime {
                    message: format!("'{method}' is not a recognized callback method"),
                    op: Some(method.into()),
                })
            }
        };
        hoist.push(instr);
        Ok(hoist)
    }

    fn arrow_parts(&self, expr: &JsExpr, method: &str) -> Result<(Vec<String>, Vec<JsStmt>), VmError> {
        match expr {
            JsExpr::Arrow { params, body } => {
                let body_stmts = match body {
                    ArrowBody::Block(stmts) => stmts.clone(),
                    ArrowBody::Expr(e) => vec![JsStmt::Return {
                        expr: Some((**e).clone()),
                    }],
                };
                Ok((params.clone(), body_stmts))
            }
            _ => Err(VmError::Runtime {
                message: format!("{method}() requires an inline arrow-function callback"),
                op: Some(method.into()),
            }),
        }
    }

    /// Lowers a callback body using the `__item__` convention: any `return`
    /// inside it rebinds `__item__` instead of terminating the run (a
    /// deliberate extension beyond `spec.md`'s literal text, since the
    /// Agent AST has no closure representation for callback bodies).
    fn lower_callback_body(&mut self, stmts: &[JsStmt]) -> Result<Vec<Instruction>, VmError> {
        self.lower_stmts(stmts, true)
    }

    // ─────────────────────────── Pure expressions ───────────────────────────

    fn lower_expr_list(&mut self, exprs: &[JsExpr], hoist: &mut Vec<Instruction>) -> Result<Vec<Expr>, VmError> {
        exprs.iter().map(|e| self.lower_expr(e, hoist)).collect()
    }

    fn lower_expr(&mut self, expr: &JsExpr, hoist: &mut Vec<Instruction>) -> Result<Expr, VmError> {
        match expr {
            JsExpr::Number(n) => Ok(Expr::literal(
                serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            JsExpr::String(s) => Ok(Expr::literal(s.clone())),
            JsExpr::Bool(b) => Ok(Expr::literal(*b)),
            JsExpr::Null => Ok(Expr::literal(Value::Null)),
            JsExpr::Template(_) => {
                let temp = self.next_temp();
                let instr = self.lower_template(expr, &temp, hoist)?;
                hoist.push(instr);
                Ok(Expr::ident(temp))
            }
            JsExpr::Ident(name) => Ok(Expr::ident(name.clone())),
            JsExpr::Member {
                object,
                property,
                optional,
            } => {
                let lowered_object = self.lower_expr(object, hoist)?;
                let (lowered_property, computed) = match property {
                    PropKey::Name(n) => (Expr::literal(n.clone()), false),
                    PropKey::Computed(e) => (self.lower_expr(e, hoist)?, true),
                };
                Ok(Expr::Member {
                    object: Box::new(lowered_object),
                    property: Box::new(lowered_property),
                    computed,
                    optional: *optional,
                })
            }
            JsExpr::Call { .. } => {
                if let Some(mut instrs) = self.try_lower_builtin(expr, None)? {
                    let Some(last) = instrs.last_mut() else {
                        return Err(VmError::Runtime {
                            message: "builtin lowering produced no instructions".into(),
                            op: None,
                        });
                    };
                    let temp = match extract_result_name(last) {
                        Some(name) => name,
                        None => {
                            let t = self.next_temp();
                            set_result_name(last, t.clone());
                            t
                        }
                    };
                    hoist.extend(instrs);
                    return Ok(Expr::ident(temp));
                }
                if let JsExpr::Call { callee, args, optional } = expr {
                    if let JsExpr::Member {
                        object,
                        property: PropKey::Name(method),
                        optional: member_optional,
                    } = callee.as_ref()
                    {
                        let lowered_object = self.lower_expr(object, hoist)?;
                        let lowered_args = self.lower_expr_list(args, hoist)?;
                        return Ok(Expr::MethodCall {
                            object: Box::new(lowered_object),
                            method: method.clone(),
                            args: lowered_args,
                            optional: *optional || *member_optional,
                        });
                    }
                    if let JsExpr::Ident(name) = callee.as_ref() {
                        let lowered_args = self.lower_expr_list(args, hoist)?;
                        let temp = self.next_temp();
                        hoist.push(Instruction::OpCall {
                            op: name.clone(),
                            args: lowered_args,
                            result: Some(temp.clone()),
                        });
                        return Ok(Expr::ident(temp));
                    }
                }
                Err(VmError::Runtime {
                    message: "unsupported call expression shape".into(),
                    op: None,
                })
            }
            JsExpr::Arrow { .. } => Err(VmError::Runtime {
                message: "arrow functions may only appear as an inline callback argument".into(),
                op: None,
            }),
            JsExpr::Binary { op, left, right } => Ok(Expr::Binary {
                op: op.clone(),
                left: Box::new(self.lower_expr(left, hoist)?),
                right: Box::new(self.lower_expr(right, hoist)?),
            }),
            JsExpr::Logical { op, left, right } => Ok(Expr::Logical {
                op: op.clone(),
                left: Box::new(self.lower_expr(left, hoist)?),
                right: Box::new(self.lower_expr(right, hoist)?),
            }),
            JsExpr::Unary { op, argument } => Ok(Expr::Unary {
                op: op.clone(),
                argument: Box::new(self.lower_expr(argument, hoist)?),
            }),
            JsExpr::Conditional {
                test,
                consequent,
                alternate,
            } => Ok(Expr::Conditional {
                test: Box::new(self.lower_expr(test, hoist)?),
                consequent: Box::new(self.lower_expr(consequent, hoist)?),
                alternate: Box::new(self.lower_expr(alternate, hoist)?),
            }),
            JsExpr::Array(items) => Ok(Expr::Array {
                elements: self.lower_expr_list(items, hoist)?,
            }),
            JsExpr::Object(props) => {
                let mut properties = Vec::with_capacity(props.len());
                for (key, value) in props {
                    let key_name = match key {
                        PropKey::Name(n) => n.clone(),
                        PropKey::Computed(_) => {
                            return Err(VmError::Runtime {
                                message: "computed keys are not supported in object literals".into(),
                                op: None,
                            })
                        }
                    };
                    let lowered = self.lower_expr(value, hoist)?;
                    properties.push(ObjectProperty {
                        key: key_name,
                        value: lowered,
                    });
                }
                Ok(Expr::Object { properties })
            }
        }
    }

    fn lower_template(
        &mut self,
        expr: &JsExpr,
        result: &str,
        hoist: &mut Vec<Instruction>,
    ) -> Result<Instruction, VmError> {
        let JsExpr::Template(parts) = expr else {
            return Err(VmError::Runtime {
                message: "expected a template literal".into(),
                op: None,
            });
        };
        let mut tmpl = String::new();
        let mut vars = IndexMap::new();
        let mut slot = 0u32;
        for part in parts {
            match part {
                crate::parser::TemplatePart::Literal(s) => tmpl.push_str(s),
                crate::parser::TemplatePart::Expr(e) => {
                    let name = format!("_{slot}");
                    slot += 1;
                    let lowered = self.lower_expr(e, hoist)?;
                    tmpl.push_str(&format!("{{{{{name}}}}}"));
                    vars.insert(name, lowered);
                }
            }
        }
        Ok(Instruction::Template {
            tmpl,
            vars,
            result: result.to_string(),
        })
    }
}

fn set_result_name(instr: &mut Instruction, name: String) {
    match instr {
        Instruction::Push { result, .. } | Instruction::StoreSet { result, .. } => {
            *result = Some(name);
        }
        _ => {}
    }
}

fn extract_result_name(instr: &Instruction) -> Option<String> {
    match instr {
        Instruction::JsonParse { result, .. }
        | Instruction::JsonStringify { result, .. }
        | Instruction::RegexMatch { result, .. }
        | Instruction::Hash { result, .. }
        | Instruction::Uuid { result }
        | Instruction::Random { result }
        | Instruction::HttpFetch { result, .. }
        | Instruction::StoreGet { result, .. }
        | Instruction::LlmPredict { result, .. }
        | Instruction::XmlParse { result, .. }
        | Instruction::Join { result, .. }
        | Instruction::Split { result, .. }
        | Instruction::Len { result, .. }
        | Instruction::Pick { result, .. }
        | Instruction::Keys { result, .. }
        | Instruction::Merge { result, .. }
        | Instruction::MathCalc { result, .. }
        | Instruction::AgentRun { result, .. }
        | Instruction::Template { result, .. } => Some(result.clone()),
        Instruction::Push { result, .. } | Instruction::StoreSet { result, .. } => result.clone(),
        _ => None,
    }
}

/// JS-truthiness, used to constant-fold `X || Y` parameter-default
/// expressions the same way the guest language would evaluate them.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Folds a literal (or `||`-chained literal) default expression into a
/// JSON value, or `None` if it is not a compile-time constant.
fn constant_fold(expr: &JsExpr) -> Option<Value> {
    match expr {
        JsExpr::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number),
        JsExpr::String(s) => Some(Value::String(s.clone())),
        JsExpr::Bool(b) => Some(Value::Bool(*b)),
        JsExpr::Null => Some(Value::Null),
        JsExpr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(constant_fold(item)?);
            }
            Some(Value::Array(out))
        }
        JsExpr::Object(props) => {
            let mut map = serde_json::Map::new();
            for (key, value) in props {
                let PropKey::Name(k) = key else { return None };
                map.insert(k.clone(), constant_fold(value)?);
            }
            Some(Value::Object(map))
        }
        JsExpr::Logical { op, left, right } if op == "||" => {
            let l = constant_fold(left)?;
            if truthy(&l) {
                Some(l)
            } else {
                constant_fold(right)
            }
        }
        _ => None,
    }
}

/// Infers `(TypeDescriptor, nullable)` from a parameter-default
/// expression, recognizing `X || null` (nullable) and `A || B` (union)
/// shapes structurally before falling back to literal inference
/// (`spec.md` §4.2 "Type inference").
fn classify_default_expr(expr: &JsExpr) -> (TypeDescriptor, bool) {
    if let JsExpr::Logical { op, left, right } = expr {
        if op == "||" {
            if matches!(right.as_ref(), JsExpr::Null) {
                let (base, _) = classify_default_expr(left);
                return (base, true);
            }
            let (a, a_nullable) = classify_default_expr(left);
            let (b, b_nullable) = classify_default_expr(right);
            let nullable = a_nullable || b_nullable;
            if a == b {
                return (a, nullable);
            }
            return (TypeDescriptor::Union { members: vec![a, b] }, nullable);
        }
    }
    let value = constant_fold(expr).unwrap_or(Value::Null);
    (TypeDescriptor::infer_from_literal(&value), false)
}

/// Extracts `{ description, [(param_name, doc)] }` from a `/** ... */`
/// doc comment: the first non-`@tag` line is the description; each
/// `@param NAME - TEXT` line documents a parameter (`spec.md` §4.2).
fn extract_jsdoc(doc_comment: Option<&str>) -> (Option<String>, Vec<(String, String)>) {
    let Some(raw) = doc_comment else {
        return (None, Vec::new());
    };
    let raw = raw.trim().trim_start_matches("/**").trim_end_matches("*/");
    let mut description = None;
    let mut params = Vec::new();
    for line in raw.lines() {
        let line = line.trim().trim_start_matches('*').trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("@param") {
            let rest = rest.trim();
            let mut parts = rest.splitn(2, char::is_whitespace);
            let Some(name) = parts.next() else { continue };
            let text = parts
                .next()
                .map(|s| s.trim().trim_start_matches('-').trim().to_string())
                .unwrap_or_default();
            params.push((name.to_string(), text));
        } else if !line.starts_with('@') && description.is_none() {
            description = Some(line.to_string());
        }
    }
    (description, params)
}
