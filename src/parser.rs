//! Source parser for the guest language (`spec.md` §4.1).
//!
//! Parses guest-language source into a standard JS-like tree (`JsProgram`),
//! preprocessing the colon-shorthand and return-type sublanguage inline
//! while parsing the parameter list (rather than as a textual rewrite, so
//! that `Span`s stay accurate). Collects the required-parameter set and
//! return-type annotation as it goes.

use std::collections::HashSet;

use crate::error::{SourceLocation, VmError};
use crate::lexer::{Lexer, Span, Token, TokenKind};
use crate::types::TypeDescriptor;

// ─────────────────────────── JS-like tree ───────────────────────────

#[derive(Debug, Clone)]
pub struct JsProgram {
    pub function: JsFunction,
    /// Parameter names using the `:` (required) colon-shorthand form,
    /// collected while parsing the parameter list (`spec.md` §4.1 contract).
    pub required_params: HashSet<String>,
    /// Reserved for parity with the distilled spec's `parse` contract; this
    /// crate's guest grammar has no construct that would populate it (no
    /// dynamic `eval`, no raw host-global access survives parsing), so it
    /// is always empty.
    pub unsafe_functions: Vec<String>,
}

/// `>` default (validate on mismatch only if declared), `?` force-validate
/// return, `!` skip-validate return (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnMarker {
    Default,
    ForceValidate,
    SkipValidate,
}

#[derive(Debug, Clone)]
pub struct JsFunction {
    pub name: String,
    pub params: Vec<JsParam>,
    pub body: Vec<JsStmt>,
    pub doc_comment: Option<String>,
    pub return_type: Option<TypeDescriptor>,
    pub return_marker: Option<ReturnMarker>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum JsParam {
    Positional {
        name: String,
        required: bool,
        default: Option<JsExpr>,
        span: Span,
    },
    Destructured {
        props: Vec<DestructuredProp>,
        span: Span,
    },
}

#[derive(Debug, Clone)]
pub struct DestructuredProp {
    pub name: String,
    pub required: bool,
    pub default: Option<JsExpr>,
}

#[derive(Debug, Clone)]
pub enum JsStmt {
    Let {
        name: String,
        init: JsExpr,
    },
    Const {
        name: String,
        init: JsExpr,
    },
    Assign {
        name: String,
        value: JsExpr,
    },
    ExprStmt {
        expr: JsExpr,
    },
    If {
        cond: JsExpr,
        then_branch: Vec<JsStmt>,
        else_branch: Option<Vec<JsStmt>>,
    },
    While {
        cond: JsExpr,
        body: Vec<JsStmt>,
    },
    ForOf {
        var_name: String,
        iterable: JsExpr,
        body: Vec<JsStmt>,
    },
    Try {
        try_block: Vec<JsStmt>,
        catch_param: Option<String>,
        catch_block: Option<Vec<JsStmt>>,
    },
    Return {
        expr: Option<JsExpr>,
    },
    Block {
        body: Vec<JsStmt>,
    },
}

#[derive(Debug, Clone)]
pub enum PropKey {
    Name(String),
    Computed(Box<JsExpr>),
}

#[derive(Debug, Clone)]
pub enum ArrowBody {
    Expr(Box<JsExpr>),
    Block(Vec<JsStmt>),
}

#[derive(Debug, Clone)]
pub enum JsExpr {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
    Template(Vec<TemplatePart>),
    Ident(String),
    Member {
        object: Box<JsExpr>,
        property: PropKey,
        optional: bool,
    },
    Call {
        callee: Box<JsExpr>,
        args: Vec<JsExpr>,
        optional: bool,
    },
    Arrow {
        params: Vec<String>,
        body: ArrowBody,
    },
    Binary {
        op: String,
        left: Box<JsExpr>,
        right: Box<JsExpr>,
    },
    Logical {
        op: String,
        left: Box<JsExpr>,
        right: Box<JsExpr>,
    },
    Unary {
        op: String,
        argument: Box<JsExpr>,
    },
    Conditional {
        test: Box<JsExpr>,
        consequent: Box<JsExpr>,
        alternate: Box<JsExpr>,
    },
    Array(Vec<JsExpr>),
    Object(Vec<(PropKey, JsExpr)>),
}

#[derive(Debug, Clone)]
pub enum TemplatePart {
    Literal(String),
    Expr(JsExpr),
}

// ─────────────────────────── Parser ───────────────────────────

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    pending_doc: Option<String>,
}

const FORBIDDEN_KEYWORDS: &[(&str, &str)] = &[
    ("class", "classes are not supported by the guest language"),
    ("new", "`new` is not supported by the guest language"),
    ("this", "`this` is not supported by the guest language"),
    ("super", "`super` is not supported by the guest language"),
    ("async", "`async`/`await` are not supported by the guest language"),
    ("await", "`async`/`await` are not supported by the guest language"),
    ("import", "`import` is not supported by the guest language"),
    ("export", "`export` is not supported by the guest language"),
    ("yield", "`yield` is not supported by the guest language"),
    ("var", "`var` is not supported by the guest language; use `let`/`const`"),
];

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Result<Self, VmError> {
        let mut lexer = Lexer::new(source);
        let pending_doc = lexer.take_preceding_doc_comment();
        let current = lexer.next_token()?;
        Ok(Self {
            lexer,
            current,
            pending_doc,
        })
    }

    fn forbidden_check(&self) -> Result<(), VmError> {
        let name = match &self.current.kind {
            TokenKind::Class => "class",
            TokenKind::New => "new",
            TokenKind::This => "this",
            TokenKind::Super => "super",
            TokenKind::Async => "async",
            TokenKind::Await => "await",
            TokenKind::Import => "import",
            TokenKind::Export => "export",
            TokenKind::Yield => "yield",
            TokenKind::Var => "var",
            _ => return Ok(()),
        };
        let message = FORBIDDEN_KEYWORDS
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, m)| m.to_string())
            .unwrap_or_else(|| format!("`{name}` is not supported"));
        Err(VmError::Syntax {
            message,
            location: self.current.span.location(),
        })
    }

    fn advance(&mut self) -> Result<Token, VmError> {
        self.forbidden_check()?;
        let doc = self.lexer.take_preceding_doc_comment();
        let next = self.lexer.next_token()?;
        let prev = std::mem::replace(&mut self.current, next);
        if doc.is_some() {
            self.pending_doc = doc;
        }
        Ok(prev)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, VmError> {
        if std::mem::discriminant(&self.current.kind) != std::mem::discriminant(kind) {
            return Err(VmError::Syntax {
                message: format!("expected {kind:?}, found {:?}", self.current.kind),
                location: self.current.span.location(),
            });
        }
        self.advance()
    }

    fn at(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn syntax_err(&self, message: impl Into<String>) -> VmError {
        VmError::Syntax {
            message: message.into(),
            location: self.current.span.location(),
        }
    }

    pub fn parse_program(&mut self) -> Result<JsProgram, VmError> {
        self.forbidden_check()?;
        let doc_comment = self.pending_doc.take();
        let span = self.current.span;
        self.expect(&TokenKind::Function)?;
        let name = self.parse_identifier_name()?;
        self.expect(&TokenKind::LParen)?;
        let (params, required_params) = self.parse_param_list()?;
        self.expect(&TokenKind::RParen)?;

        let (return_marker, return_type) = self.parse_return_type_annotation()?;

        self.expect(&TokenKind::LBrace)?;
        let body = self.parse_stmt_list_until_rbrace()?;
        self.expect(&TokenKind::RBrace)?;

        if !self.at(&TokenKind::Eof) {
            if self.at(&TokenKind::Function) {
                return Err(self.syntax_err(
                    "a guest program may declare exactly one top-level function",
                ));
            }
            return Err(self.syntax_err(format!(
                "unexpected trailing token {:?}",
                self.current.kind
            )));
        }

        Ok(JsProgram {
            function: JsFunction {
                name,
                params,
                body,
                doc_comment,
                return_type,
                return_marker,
                span,
            },
            required_params,
            unsafe_functions: Vec::new(),
        })
    }

    fn parse_identifier_name(&mut self) -> Result<String, VmError> {
        match self.current.kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance()?;
                Ok(name)
            }
            _ => Err(self.syntax_err(format!("expected identifier, found {:?}", self.current.kind))),
        }
    }

    /// Parses the parameter list, applying the colon-shorthand two-pass rule
    /// inline: `name: EXPR` is a required parameter (recorded in the
    /// returned set); `name = EXPR` is optional with default `EXPR`
    /// (`spec.md` §4.1).
    fn parse_param_list(&mut self) -> Result<(Vec<JsParam>, HashSet<String>), VmError> {
        let mut params = Vec::new();
        let mut required = HashSet::new();
        let mut seen_names = HashSet::new();
        let mut seen_optional = false;

        while !self.at(&TokenKind::RParen) {
            let span = self.current.span;
            if self.at(&TokenKind::LBrace) {
                let props = self.parse_destructured_param()?;
                for p in &props {
                    if !seen_names.insert(p.name.clone()) {
                        return Err(self.syntax_err(format!(
                            "duplicate parameter name '{}'",
                            p.name
                        )));
                    }
                    if p.required {
                        required.insert(p.name.clone());
                    }
                }
                params.push(JsParam::Destructured { props, span });
            } else {
                let name = self.parse_identifier_name()?;
                if !seen_names.insert(name.clone()) {
                    return Err(self.syntax_err(format!("duplicate parameter name '{name}'")));
                }
                if self.at(&TokenKind::Colon) {
                    if seen_optional {
                        return Err(self.syntax_err(format!(
                            "required parameter '{name}' may not follow an optional parameter"
                        )));
                    }
                    self.advance()?;
                    let default = self.parse_assignment_expr()?;
                    required.insert(name.clone());
                    params.push(JsParam::Positional {
                        name,
                        required: true,
                        default: Some(default),
                        span,
                    });
                } else if self.at(&TokenKind::Eq) {
                    seen_optional = true;
                    self.advance()?;
                    let default = self.parse_assignment_expr()?;
                    params.push(JsParam::Positional {
                        name,
                        required: false,
                        default: Some(default),
                        span,
                    });
                } else {
                    params.push(JsParam::Positional {
                        name,
                        required: true,
                        default: None,
                        span,
                    });
                }
            }
            if self.at(&TokenKind::Comma) {
                self.advance()?;
            } else {
                break;
            }
        }
        Ok((params, required))
    }

    fn parse_destructured_param(&mut self) -> Result<Vec<DestructuredProp>, VmError> {
        self.expect(&TokenKind::LBrace)?;
        let mut props = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let name = self.parse_identifier_name()?;
            if self.at(&TokenKind::Colon) {
                self.advance()?;
                let default = self.parse_assignment_expr()?;
                props.push(DestructuredProp {
                    name,
                    required: true,
                    default: Some(default),
                });
            } else if self.at(&TokenKind::Eq) {
                self.advance()?;
                let default = self.parse_assignment_expr()?;
                props.push(DestructuredProp {
                    name,
                    required: false,
                    default: Some(default),
                });
            } else {
                props.push(DestructuredProp {
                    name,
                    required: true,
                    default: None,
                });
            }
            if self.at(&TokenKind::Comma) {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(props)
    }

    fn parse_return_type_annotation(
        &mut self,
    ) -> Result<(Option<ReturnMarker>, Option<TypeDescriptor>), VmError> {
        if !self.at(&TokenKind::Minus) {
            return Ok((None, None));
        }
        self.advance()?;
        let marker = match self.current.kind {
            TokenKind::Gt => ReturnMarker::Default,
            TokenKind::Question => ReturnMarker::ForceValidate,
            TokenKind::Bang => ReturnMarker::SkipValidate,
            _ => {
                return Err(self.syntax_err(
                    "expected '>', '?', or '!' after '-' in return-type annotation",
                ))
            }
        };
        self.advance()?;
        let ty = self.parse_type_union()?;
        Ok((Some(marker), Some(ty)))
    }

    fn parse_type_union(&mut self) -> Result<TypeDescriptor, VmError> {
        let mut members = vec![self.parse_type_postfix()?];
        while self.at(&TokenKind::Pipe) {
            self.advance()?;
            members.push(self.parse_type_postfix()?);
        }
        if members.len() == 1 {
            Ok(members.into_iter().next().unwrap_or(TypeDescriptor::Any))
        } else {
            Ok(TypeDescriptor::Union { members })
        }
    }

    fn parse_type_postfix(&mut self) -> Result<TypeDescriptor, VmError> {
        let mut ty = self.parse_type_atom()?;
        while self.at(&TokenKind::LBracket) {
            self.advance()?;
            self.expect(&TokenKind::RBracket)?;
            ty = TypeDescriptor::Array { items: Box::new(ty) };
        }
        Ok(ty)
    }

    fn parse_type_atom(&mut self) -> Result<TypeDescriptor, VmError> {
        match self.current.kind.clone() {
            TokenKind::Null => {
                self.advance()?;
                Ok(TypeDescriptor::Null)
            }
            TokenKind::Identifier(name) => {
                self.advance()?;
                match name.as_str() {
                    "string" => Ok(TypeDescriptor::String),
                    "number" => Ok(TypeDescriptor::Number),
                    "boolean" => Ok(TypeDescriptor::Boolean),
                    "any" => Ok(TypeDescriptor::Any),
                    other => Err(self.syntax_err(format!("unknown return type '{other}'"))),
                }
            }
            TokenKind::LBrace => {
                self.advance()?;
                let mut shape = indexmap::IndexMap::new();
                while !self.at(&TokenKind::RBrace) {
                    let key = self.parse_identifier_name()?;
                    self.expect(&TokenKind::Colon)?;
                    let ty = self.parse_type_union()?;
                    shape.insert(key, ty);
                    if self.at(&TokenKind::Comma) {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace)?;
                Ok(TypeDescriptor::Object {
                    shape,
                    destructured_params: None,
                })
            }
            other => Err(self.syntax_err(format!("expected a type, found {other:?}"))),
        }
    }

    fn parse_stmt_list_until_rbrace(&mut self) -> Result<Vec<JsStmt>, VmError> {
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at(&TokenKind::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<JsStmt, VmError> {
        match &self.current.kind {
            TokenKind::Let => {
                self.advance()?;
                let name = self.parse_identifier_name()?;
                self.expect(&TokenKind::Eq)?;
                let init = self.parse_assignment_expr()?;
                self.consume_semi();
                Ok(JsStmt::Let { name, init })
            }
            TokenKind::Const => {
                self.advance()?;
                let name = self.parse_identifier_name()?;
                self.expect(&TokenKind::Eq)?;
                let init = self.parse_assignment_expr()?;
                self.consume_semi();
                Ok(JsStmt::Const { name, init })
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for_of(),
            TokenKind::Try => self.parse_try(),
            TokenKind::Return => {
                self.advance()?;
                let expr = if self.at(&TokenKind::Semi) || self.at(&TokenKind::RBrace) {
                    None
                } else {
                    Some(self.parse_assignment_expr()?)
                };
                self.consume_semi();
                Ok(JsStmt::Return { expr })
            }
            TokenKind::LBrace => {
                self.advance()?;
                let body = self.parse_stmt_list_until_rbrace()?;
                self.expect(&TokenKind::RBrace)?;
                Ok(JsStmt::Block { body })
            }
            _ => {
                let expr = self.parse_assignment_expr()?;
                let stmt = if let JsExpr::Ident(name) = &expr {
                    if self.at(&TokenKind::Eq) {
                        self.advance()?;
                        let value = self.parse_assignment_expr()?;
                        JsStmt::Assign {
                            name: name.clone(),
                            value,
                        }
                    } else {
                        JsStmt::ExprStmt { expr }
                    }
                } else {
                    JsStmt::ExprStmt { expr }
                };
                self.consume_semi();
                Ok(stmt)
            }
        }
    }

    fn consume_semi(&mut self) {
        if self.at(&TokenKind::Semi) {
            let _ = self.advance();
        }
    }

    fn parse_block(&mut self) -> Result<Vec<JsStmt>, VmError> {
        self.expect(&TokenKind::LBrace)?;
        let body = self.parse_stmt_list_until_rbrace()?;
        self.expect(&TokenKind::RBrace)?;
        Ok(body)
    }

    fn parse_if(&mut self) -> Result<JsStmt, VmError> {
        self.expect(&TokenKind::If)?;
        self.expect(&TokenKind::LParen)?;
        let cond = self.parse_assignment_expr()?;
        self.expect(&TokenKind::RParen)?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.at(&TokenKind::Else) {
            self.advance()?;
            if self.at(&TokenKind::If) {
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(JsStmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn parse_while(&mut self) -> Result<JsStmt, VmError> {
        self.expect(&TokenKind::While)?;
        self.expect(&TokenKind::LParen)?;
        let cond = self.parse_assignment_expr()?;
        self.expect(&TokenKind::RParen)?;
        let body = self.parse_block()?;
        Ok(JsStmt::While { cond, body })
    }

    fn parse_for_of(&mut self) -> Result<JsStmt, VmError> {
        self.expect(&TokenKind::For)?;
        self.expect(&TokenKind::LParen)?;
        self.expect(&TokenKind::Const)?;
        let var_name = self.parse_identifier_name()?;
        self.expect(&TokenKind::Of)?;
        let iterable = self.parse_assignment_expr()?;
        self.expect(&TokenKind::RParen)?;
        let body = self.parse_block()?;
        Ok(JsStmt::ForOf {
            var_name,
            iterable,
            body,
        })
    }

    fn parse_try(&mut self) -> Result<JsStmt, VmError> {
        self.expect(&TokenKind::Try)?;
        let try_block = self.parse_block()?;
        let mut catch_param = None;
        let mut catch_block = None;
        if self.at(&TokenKind::Catch) {
            self.advance()?;
            if self.at(&TokenKind::LParen) {
                self.advance()?;
                catch_param = Some(self.parse_identifier_name()?);
                self.expect(&TokenKind::RParen)?;
            }
            catch_block = Some(self.parse_block()?);
        }
        Ok(JsStmt::Try {
            try_block,
            catch_param,
            catch_block,
        })
    }

    // ─────────────────────────── Expressions ───────────────────────────

    fn parse_assignment_expr(&mut self) -> Result<JsExpr, VmError> {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> Result<JsExpr, VmError> {
        if self.at(&TokenKind::LParen) || matches!(self.current.kind, TokenKind::Identifier(_)) {
            if let Some(arrow) = self.try_parse_arrow()? {
                return Ok(arrow);
            }
        }
        let test = self.parse_nullish()?;
        if self.at(&TokenKind::Question) {
            self.advance()?;
            let consequent = self.parse_assignment_expr()?;
            self.expect(&TokenKind::Colon)?;
            let alternate = self.parse_assignment_expr()?;
            return Ok(JsExpr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            });
        }
        Ok(test)
    }

    /// Attempts to parse `ident => body` or `(params) => body`. Returns
    /// `Ok(None)` (without consuming input observably, via snapshot replay)
    /// when the lookahead does not resolve to an arrow function.
    fn try_parse_arrow(&mut self) -> Result<Option<JsExpr>, VmError> {
        // Single bare identifier arrow: `x => ...`
        if let TokenKind::Identifier(name) = self.current.kind.clone() {
            let snapshot = self.snapshot();
            self.advance()?;
            if self.at(&TokenKind::Arrow) {
                self.advance()?;
                let body = self.parse_arrow_body()?;
                return Ok(Some(JsExpr::Arrow {
                    params: vec![name],
                    body,
                }));
            }
            self.restore(snapshot);
            return Ok(None);
        }
        // Parenthesized params: `(a, b) => ...` — only committed to once we
        // see a matching `)` immediately followed by `=>`.
        if self.at(&TokenKind::LParen) {
            let snapshot = self.snapshot();
            self.advance()?;
            let mut params = Vec::new();
            let mut ok = true;
            while !self.at(&TokenKind::RParen) {
                match self.current.kind.clone() {
                    TokenKind::Identifier(name) => {
                        params.push(name);
                        if self.advance().is_err() {
                            ok = false;
                            break;
                        }
                    }
                    _ => {
                        ok = false;
                        break;
                    }
                }
                if self.at(&TokenKind::Comma) {
                    if self.advance().is_err() {
                        ok = false;
                        break;
                    }
                } else {
                    break;
                }
            }
            if ok && self.at(&TokenKind::RParen) {
                if self.advance().is_ok() && self.at(&TokenKind::Arrow) {
                    self.advance()?;
                    let body = self.parse_arrow_body()?;
                    return Ok(Some(JsExpr::Arrow { params, body }));
                }
            }
            self.restore(snapshot);
        }
        Ok(None)
    }

    fn parse_arrow_body(&mut self) -> Result<ArrowBody, VmError> {
        if self.at(&TokenKind::LBrace) {
            Ok(ArrowBody::Block(self.parse_block()?))
        } else {
            Ok(ArrowBody::Expr(Box::new(self.parse_assignment_expr()?)))
        }
    }

    fn snapshot(&self) -> (Lexer<'a>, Token, Option<String>) {
        (
            self.lexer.clone(),
            self.current.clone(),
            self.pending_doc.clone(),
        )
    }

    fn restore(&mut self, snapshot: (Lexer<'a>, Token, Option<String>)) {
        self.lexer = snapshot.0;
        self.current = snapshot.1;
        self.pending_doc = snapshot.2;
    }

    fn parse_nullish(&mut self) -> Result<JsExpr, VmError> {
        let mut left = self.parse_logical_or()?;
        while self.at(&TokenKind::QuestionQuestion) {
            self.advance()?;
            let right = self.parse_logical_or()?;
            left = JsExpr::Logical {
                op: "??".into(),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_logical_or(&mut self) -> Result<JsExpr, VmError> {
        let mut left = self.parse_logical_and()?;
        while self.at(&TokenKind::PipePipe) {
            self.advance()?;
            let right = self.parse_logical_and()?;
            left = JsExpr::Logical {
                op: "||".into(),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> Result<JsExpr, VmError> {
        let mut left = self.parse_equality()?;
        while self.at(&TokenKind::AmpAmp) {
            self.advance()?;
            let right = self.parse_equality()?;
            left = JsExpr::Logical {
                op: "&&".into(),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<JsExpr, VmError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.current.kind {
                TokenKind::EqEq => "==",
                TokenKind::BangEq => "!=",
                TokenKind::EqEqEq => "===",
                TokenKind::BangEqEq => "!==",
                _ => break,
            };
            self.advance()?;
            let right = self.parse_relational()?;
            left = JsExpr::Binary {
                op: op.into(),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<JsExpr, VmError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Lt => "<",
                TokenKind::LtEq => "<=",
                TokenKind::Gt => ">",
                TokenKind::GtEq => ">=",
                _ => break,
            };
            self.advance()?;
            let right = self.parse_additive()?;
            left = JsExpr::Binary {
                op: op.into(),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<JsExpr, VmError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => "+",
                TokenKind::Minus => "-",
                _ => break,
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = JsExpr::Binary {
                op: op.into(),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<JsExpr, VmError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Star => "*",
                TokenKind::Slash => "/",
                TokenKind::Percent => "%",
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = JsExpr::Binary {
                op: op.into(),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<JsExpr, VmError> {
        let op = match self.current.kind {
            TokenKind::Bang => Some("!"),
            TokenKind::Minus => Some("-"),
            TokenKind::Typeof => Some("typeof"),
            _ => None,
        };
        if let Some(op) = op {
            self.advance()?;
            let argument = self.parse_unary()?;
            return Ok(JsExpr::Unary {
                op: op.into(),
                argument: Box::new(argument),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<JsExpr, VmError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.at(&TokenKind::Dot) {
                self.advance()?;
                let name = self.parse_identifier_name()?;
                if self.at(&TokenKind::LParen) {
                    self.advance()?;
                    let args = self.parse_args()?;
                    expr = JsExpr::Call {
                        callee: Box::new(JsExpr::Member {
                            object: Box::new(expr),
                            property: PropKey::Name(name),
                            optional: false,
                        }),
                        args,
                        optional: false,
                    };
                } else {
                    expr = JsExpr::Member {
                        object: Box::new(expr),
                        property: PropKey::Name(name),
                        optional: false,
                    };
                }
            } else if self.at(&TokenKind::QuestionDot) {
                self.advance()?;
                let name = self.parse_identifier_name()?;
                if self.at(&TokenKind::LParen) {
                    self.advance()?;
                    let args = self.parse_args()?;
                    expr = JsExpr::Call {
                        callee: Box::new(JsExpr::Member {
                            object: Box::new(expr),
                            property: PropKey::Name(name),
                            optional: true,
                        }),
                        args,
                        optional: true,
                    };
                } else {
                    expr = JsExpr::Member {
                        object: Box::new(expr),
                        property: PropKey::Name(name),
                        optional: true,
                    };
                }
            } else if self.at(&TokenKind::LBracket) {
                self.advance()?;
                let index = self.parse_assignment_expr()?;
                self.expect(&TokenKind::RBracket)?;
                expr = JsExpr::Member {
                    object: Box::new(expr),
                    property: PropKey::Computed(Box::new(index)),
                    optional: false,
                };
            } else if self.at(&TokenKind::LParen) {
                self.advance()?;
                let args = self.parse_args()?;
                expr = JsExpr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<JsExpr>, VmError> {
        let mut args = Vec::new();
        while !self.at(&TokenKind::RParen) {
            args.push(self.parse_assignment_expr()?);
            if self.at(&TokenKind::Comma) {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<JsExpr, VmError> {
        match self.current.kind.clone() {
            TokenKind::Number(n) => {
                self.advance()?;
                Ok(JsExpr::Number(n))
            }
            TokenKind::String(s) => {
                self.advance()?;
                Ok(JsExpr::String(s))
            }
            TokenKind::Template(raw) => {
                self.advance()?;
                self.parse_template_parts(&raw)
            }
            TokenKind::True => {
                self.advance()?;
                Ok(JsExpr::Bool(true))
            }
            TokenKind::False => {
                self.advance()?;
                Ok(JsExpr::Bool(false))
            }
            TokenKind::Null => {
                self.advance()?;
                Ok(JsExpr::Null)
            }
            TokenKind::Identifier(name) => {
                self.advance()?;
                Ok(JsExpr::Ident(name))
            }
            TokenKind::LParen => {
                self.advance()?;
                let expr = self.parse_assignment_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance()?;
                let mut elements = Vec::new();
                while !self.at(&TokenKind::RBracket) {
                    elements.push(self.parse_assignment_expr()?);
                    if self.at(&TokenKind::Comma) {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket)?;
                Ok(JsExpr::Array(elements))
            }
            TokenKind::LBrace => {
                self.advance()?;
                let mut props = Vec::new();
                while !self.at(&TokenKind::RBrace) {
                    let key = self.parse_identifier_name()?;
                    if self.at(&TokenKind::Colon) {
                        self.advance()?;
                        let value = self.parse_assignment_expr()?;
                        props.push((PropKey::Name(key), value));
                    } else {
                        props.push((PropKey::Name(key.clone()), JsExpr::Ident(key)));
                    }
                    if self.at(&TokenKind::Comma) {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace)?;
                Ok(JsExpr::Object(props))
            }
            other => Err(self.syntax_err(format!("unexpected token {other:?} in expression"))),
        }
    }

    fn parse_template_parts(&mut self, raw: &str) -> Result<JsExpr, VmError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '$' && raw[i..].starts_with("${") {
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                chars.next(); // consume '{'
                let mut depth = 1i32;
                let expr_start = i + 2;
                let mut expr_end = expr_start;
                for (j, ch) in raw[expr_start..].char_indices() {
                    match ch {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                expr_end = expr_start + j;
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let inner = &raw[expr_start..expr_end];
                let mut sub = Parser::new(inner)?;
                let expr = sub.parse_assignment_expr()?;
                parts.push(TemplatePart::Expr(expr));
                // Skip consumed characters in the outer iterator.
                while let Some(&(k, _)) = chars.peek() {
                    if k >= expr_end + 1 {
                        break;
                    }
                    chars.next();
                }
            } else {
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }
        Ok(JsExpr::Template(parts))
    }
}

/// Parses guest-language source into a `JsProgram` (`spec.md` §4.1 contract).
pub fn parse(source: &str) -> Result<JsProgram, VmError> {
    let mut parser = Parser::new(source)?;
    parser.parse_program()
}
