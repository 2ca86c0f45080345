//! Tests for the lowering pass (`spec.md` §4.2): signature extraction,
//! JSDoc association, parameter prelude emission, and recognition of
//! dedicated instructions for template literals and callback methods.

use agentscript_vm::api::transpile;
use agentscript_vm::ast::Instruction;
use agentscript_vm::parser;
use agentscript_vm::types::TypeDescriptor;

fn top_level_steps(ast: &Instruction) -> &[Instruction] {
    match ast {
        Instruction::Seq { steps } => steps,
        other => panic!("expected a top-level seq, got {other:?}"),
    }
}

#[test]
fn signature_carries_parameter_types_and_requiredness() {
    let out = transpile("function greet(name: 'x', loud = false) { return name; }").unwrap();
    assert_eq!(out.signature.name, "greet");

    let name_param = &out.signature.parameters["name"];
    assert!(name_param.required);
    assert_eq!(name_param.type_desc, TypeDescriptor::String);

    let loud_param = &out.signature.parameters["loud"];
    assert!(!loud_param.required);
    assert_eq!(loud_param.type_desc, TypeDescriptor::Boolean);
    assert_eq!(loud_param.default, Some(serde_json::json!(false)));
}

#[test]
fn required_parameter_emits_a_type_check_prelude_step() {
    let out = transpile("function f(a: 0) { return a; }").unwrap();
    let steps = top_level_steps(&out.ast);
    let has_type_check = steps.iter().any(|s| {
        matches!(
            s,
            Instruction::TypeCheck { param, path, .. } if param == "a" && path == "f.a"
        )
    });
    assert!(has_type_check, "expected a typeCheck step for required parameter 'a'");
}

#[test]
fn optional_parameter_emits_a_default_fill_in_if_null() {
    let out = transpile("function f(b = 3) { return b; }").unwrap();
    let steps = top_level_steps(&out.ast);
    let has_default_fill = steps.iter().any(|s| matches!(s, Instruction::If { .. }));
    assert!(has_default_fill, "expected an if-null-default step for optional parameter 'b'");
}

#[test]
fn jsdoc_description_and_param_docs_are_attached() {
    let source = "/** Greets someone.\n * @param name - who to greet\n */\nfunction greet(name) { return name; }";
    let out = transpile(source).unwrap();
    assert_eq!(out.signature.description.as_deref(), Some("Greets someone."));
    assert_eq!(
        out.signature.parameters["name"].description.as_deref(),
        Some("who to greet")
    );
}

#[test]
fn unmatched_param_doc_produces_a_warning() {
    let source = "/**\n * @param missing - does not exist\n */\nfunction f(a) { return a; }";
    let out = transpile(source).unwrap();
    assert!(out.warnings.iter().any(|w| w.contains("missing")));
}

#[test]
fn template_literal_lowers_to_a_dedicated_instruction() {
    let program = parser::parse("function f(name) { let msg = `hi ${name}`; return msg; }").unwrap();
    let out = agentscript_vm::lowering::transform(&program).unwrap();
    let steps = top_level_steps(&out.ast);
    let has_template = steps.iter().any(|s| matches!(s, Instruction::Template { .. }));
    assert!(has_template, "expected a template instruction for the backtick literal");
}

#[test]
fn map_and_filter_calls_lower_to_dedicated_instructions() {
    let source = "function f(items) { \
                  let doubled = items.map(x => x * 2); \
                  let evens = doubled.filter(x => x % 2 === 0); \
                  return evens; }";
    let out = transpile(source).unwrap();
    let steps = top_level_steps(&out.ast);

    let map_step = steps.iter().find_map(|s| match s {
        Instruction::Map { as_name, .. } => Some(as_name.clone()),
        _ => None,
    });
    assert_eq!(map_step.as_deref(), Some("x"));

    let filter_step = steps.iter().find_map(|s| match s {
        Instruction::Filter { as_name, .. } => Some(as_name.clone()),
        _ => None,
    });
    assert_eq!(filter_step.as_deref(), Some("x"));
}

#[test]
fn reduce_call_lowers_with_accumulator_and_item_names() {
    let source = "function f(items) { let total = items.reduce((acc, x) => acc + x, 0); return total; }";
    let out = transpile(source).unwrap();
    let steps = top_level_steps(&out.ast);
    let reduce_step = steps.iter().find_map(|s| match s {
        Instruction::Reduce { accumulator, as_name, .. } => Some((accumulator.clone(), as_name.clone())),
        _ => None,
    });
    assert_eq!(reduce_step, Some(("acc".to_string(), "x".to_string())));
}

#[test]
fn scalar_return_wraps_in_synthetic_result_key() {
    let out = transpile("function f(a) { return a; }").unwrap();
    let steps = top_level_steps(&out.ast);
    let schema = steps.iter().find_map(|s| match s {
        Instruction::Return { schema } => Some(schema.clone()),
        _ => None,
    });
    assert_eq!(schema, Some(vec!["__result__".to_string()]));
}

#[test]
fn object_literal_return_uses_declared_property_names_as_schema() {
    let out = transpile("function f(a, b) { return {a, b}; }").unwrap();
    let steps = top_level_steps(&out.ast);
    let schema = steps.iter().find_map(|s| match s {
        Instruction::Return { schema } => Some(schema.clone()),
        _ => None,
    });
    assert_eq!(schema, Some(vec!["a".to_string(), "b".to_string()]));
}
