//! Diagnostic behavior: each recoverable failure must both report and leave
//! the stream in the documented fallback state.

use mixpp::engine::Preprocessor;
use mixpp::errors::{collected_sink, ErrorCategory, ErrorKind, PreprocError, SourceContext};
use mixpp::host;
use pretty_assertions::assert_eq;

fn run(source: &str) -> (Vec<String>, Vec<PreprocError>) {
    let sink = collected_sink();
    let mut pp = Preprocessor::new(SourceContext::from_file("test.c", source), sink.clone());
    let tokens = host::preprocess_source(&mut pp, source);
    let spellings = tokens.into_iter().map(|t| t.spelling).collect();
    let diagnostics = sink.borrow_mut().take();
    (spellings, diagnostics)
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn arity_mismatch_replays_the_call_unexpanded() {
    let (tokens, diags) = run("#define TWO(a, b) a b\nTWO(1)");

    assert_eq!(tokens, strs(&["TWO", "(", "1", ")"]));
    assert_eq!(diags.len(), 1);
    assert!(matches!(
        diags[0].kind,
        ErrorKind::ArityMismatch { ref macro_name, ref expected, actual: 1 }
            if macro_name == "TWO" && expected == "exactly 2"
    ));
    assert!(!diags[0].is_warning());
}

#[test]
fn arity_diagnostic_points_at_the_definition() {
    let (_, diags) = run("#define TWO(a, b) a b\nTWO(1)");

    let related = &diags[0].diagnostic_info.related;
    assert_eq!(related.len(), 1);
    assert!(related[0].label.contains("defined here"));
}

#[test]
fn variadic_arity_reports_a_minimum() {
    let (tokens, diags) = run("#define CALL(f, g, ...) f\nCALL(x)");

    assert_eq!(tokens, strs(&["CALL", "(", "x", ")"]));
    assert!(matches!(
        diags[0].kind,
        ErrorKind::ArityMismatch { ref expected, .. } if expected == "at least 2"
    ));
}

#[test]
fn unterminated_invocation_replays_consumed_tokens() {
    let (tokens, diags) = run("#define SQ(x) ((x) * (x))\nSQ(1 +");

    assert_eq!(tokens, strs(&["SQ", "(", "1", "+"]));
    assert_eq!(diags.len(), 1);
    assert!(matches!(
        diags[0].kind,
        ErrorKind::UntermInvocation { ref macro_name } if macro_name == "SQ"
    ));
}

#[test]
fn invalid_paste_keeps_both_operands() {
    let (tokens, diags) = run("#define BAD(a, b) a ## b\nBAD(<, >)");

    assert_eq!(tokens, strs(&["<", ">"]));
    assert_eq!(diags.len(), 1);
    assert!(matches!(
        diags[0].kind,
        ErrorKind::BadPaste { ref lhs, ref rhs } if lhs == "<" && rhs == ">"
    ));
    assert_eq!(diags[0].kind.category(), ErrorCategory::Invocation);
}

#[test]
fn self_reference_is_disabled_with_a_warning() {
    let (tokens, diags) = run("#define M a M b\nM");

    assert_eq!(tokens, strs(&["a", "M", "b"]));
    assert_eq!(diags.len(), 1);
    assert!(diags[0].is_warning());
    assert_eq!(diags[0].kind.category(), ErrorCategory::Hygiene);
    assert!(matches!(
        diags[0].kind,
        ErrorKind::DisabledExpansion { ref macro_name } if macro_name == "M"
    ));
}

#[test]
fn mutual_recursion_terminates() {
    let (tokens, diags) = run("#define A B\n#define B A\nA B");

    // Each chain stops where it re-enters itself, so every use comes back
    // to its own spelling.
    assert_eq!(tokens, strs(&["A", "B"]));
    assert_eq!(diags.len(), 2);
    assert!(diags.iter().all(|d| d.is_warning()));
    assert!(diags
        .iter()
        .all(|d| matches!(d.kind, ErrorKind::DisabledExpansion { .. })));
}

#[test]
fn runaway_nesting_hits_the_depth_ceiling() {
    let mut src = String::from("#define W(x) x\n");
    src.push_str(&"W(".repeat(200));
    src.push('1');
    src.push_str(&")".repeat(200));

    let (tokens, diags) = run(&src);

    assert!(diags
        .iter()
        .any(|d| matches!(d.kind, ErrorKind::ExpansionTooDeep { .. })));
    assert!(tokens.contains(&"1".to_string()));
}

#[test]
fn duplicate_parameter_rejects_the_definition() {
    let (tokens, diags) = run("#define D(a, a) a\nD(1)");

    // The definition never takes effect, so the use scans as plain tokens.
    assert_eq!(tokens, strs(&["D", "(", "1", ")"]));
    assert_eq!(diags.len(), 1);
    assert!(matches!(
        diags[0].kind,
        ErrorKind::DuplicateParameter { ref macro_name, ref param }
            if macro_name == "D" && param == "a"
    ));
}

#[test]
fn unsupported_directives_warn_and_are_skipped() {
    let (tokens, diags) = run("#define X 1\n#include <stdio.h>\nX");

    assert_eq!(tokens, strs(&["1"]));
    assert_eq!(diags.len(), 1);
    assert!(diags[0].is_warning());
    assert!(matches!(
        diags[0].kind,
        ErrorKind::UnsupportedDirective { ref directive } if directive == "include"
    ));
}

#[test]
fn error_codes_carry_the_phase() {
    let (_, diags) = run("#define TWO(a, b) a\nTWO(1)");

    assert_eq!(diags[0].diagnostic_info.error_code, "mixpp::expand::arity_mismatch");
}
