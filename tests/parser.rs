//! Tests for the source parser (`spec.md` §4.1): the colon-shorthand
//! parameter grammar, destructured parameters, the return-type annotation
//! sublanguage, and the guest language's forbidden-construct diagnostics.

use agentscript_vm::error::VmError;
use agentscript_vm::parser::{self, JsParam, ReturnMarker};
use agentscript_vm::types::TypeDescriptor;

#[test]
fn colon_marks_a_parameter_required_and_infers_its_type() {
    let program = parser::parse("function f(a: 'x') { return a; }").unwrap();
    match &program.function.params[0] {
        JsParam::Positional { name, required, default, .. } => {
            assert_eq!(name, "a");
            assert!(required);
            assert!(default.is_some());
        }
        other => panic!("expected a positional param, got {other:?}"),
    }
    assert!(program.required_params.contains("a"));
}

#[test]
fn eq_marks_a_parameter_optional_with_a_default() {
    let program = parser::parse("function f(b = 3) { return b; }").unwrap();
    match &program.function.params[0] {
        JsParam::Positional { name, required, default, .. } => {
            assert_eq!(name, "b");
            assert!(!required);
            assert!(default.is_some());
        }
        other => panic!("expected a positional param, got {other:?}"),
    }
    assert!(!program.required_params.contains("b"));
}

#[test]
fn bare_name_is_required_with_no_default() {
    let program = parser::parse("function f(x) { return x; }").unwrap();
    match &program.function.params[0] {
        JsParam::Positional { name, required, default, .. } => {
            assert_eq!(name, "x");
            assert!(required);
            assert!(default.is_none());
        }
        other => panic!("expected a positional param, got {other:?}"),
    }
    // `required_params` only tracks the `:` colon-shorthand form (spec.md §3's
    // "declared with `:` form" wording) — a bare name is required but not
    // recorded there.
    assert!(!program.required_params.contains("x"));
}

#[test]
fn colon_required_cannot_follow_optional() {
    let err = parser::parse("function f(a = 1, b: 2) { return a; }").unwrap_err();
    assert!(matches!(err, VmError::Syntax { .. }));
}

#[test]
fn duplicate_parameter_names_are_rejected() {
    let err = parser::parse("function f(a, a) { return a; }").unwrap_err();
    assert!(matches!(err, VmError::Syntax { .. }));
}

#[test]
fn destructured_object_parameter_is_parsed() {
    let program = parser::parse("function f({n, m = 1}) { return n; }").unwrap();
    match &program.function.params[0] {
        JsParam::Destructured { props, .. } => {
            assert_eq!(props.len(), 2);
            assert_eq!(props[0].name, "n");
            assert!(props[0].required);
            assert_eq!(props[1].name, "m");
            assert!(!props[1].required);
        }
        other => panic!("expected a destructured param, got {other:?}"),
    }
}

#[test]
fn return_type_annotation_recognizes_all_three_markers() {
    let default_marker = parser::parse("function f(x) -> number { return x; }").unwrap();
    assert_eq!(default_marker.function.return_marker, Some(ReturnMarker::Default));
    assert_eq!(default_marker.function.return_type, Some(TypeDescriptor::Number));

    let force_validate = parser::parse("function f(x) -? string { return x; }").unwrap();
    assert_eq!(force_validate.function.return_marker, Some(ReturnMarker::ForceValidate));
    assert_eq!(force_validate.function.return_type, Some(TypeDescriptor::String));

    let skip_validate = parser::parse("function f(x) -! boolean { return x; }").unwrap();
    assert_eq!(skip_validate.function.return_marker, Some(ReturnMarker::SkipValidate));
    assert_eq!(skip_validate.function.return_type, Some(TypeDescriptor::Boolean));
}

#[test]
fn return_type_annotation_accepts_array_and_union_and_shape() {
    let program = parser::parse("function f(x) -> number[] { return x; }").unwrap();
    assert!(matches!(program.function.return_type, Some(TypeDescriptor::Array { .. })));

    let program = parser::parse("function f(x) -> string | null { return x; }").unwrap();
    assert!(matches!(program.function.return_type, Some(TypeDescriptor::Union { .. })));

    let program = parser::parse("function f(x) -> {a: number} { return x; }").unwrap();
    assert!(matches!(program.function.return_type, Some(TypeDescriptor::Object { .. })));
}

#[test]
fn no_return_type_annotation_is_fine() {
    let program = parser::parse("function f(x) { return x; }").unwrap();
    assert_eq!(program.function.return_marker, None);
    assert_eq!(program.function.return_type, None);
}

#[test]
fn forbidden_keywords_are_rejected() {
    let err = parser::parse("function f() { class X {} }").unwrap_err();
    assert!(matches!(err, VmError::Syntax { .. }));

    let err = parser::parse("function f() { var x = 1; }").unwrap_err();
    assert!(matches!(err, VmError::Syntax { .. }));
}

#[test]
fn only_one_top_level_function_is_allowed() {
    let err = parser::parse("function f() { return 1; } function g() { return 2; }").unwrap_err();
    assert!(matches!(err, VmError::Syntax { .. }));
}

#[test]
fn doc_comment_is_captured() {
    let program = parser::parse(
        "/** Adds two numbers.\n * @param a - the first number\n */\nfunction add(a, b) { return a + b; }",
    )
    .unwrap();
    let doc = program.function.doc_comment.expect("doc comment should be captured");
    assert!(doc.contains("Adds two numbers"));
    assert!(doc.contains("@param a"));
}
