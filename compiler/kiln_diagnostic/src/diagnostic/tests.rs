use kiln_ir::Span;
use pretty_assertions::assert_eq;

use crate::{Diagnostic, ErrorCode, Severity};

#[test]
fn builder_collects_labels_in_order() {
    let diag = Diagnostic::error(ErrorCode::E5001)
        .with_message("cannot borrow `v` uniquely")
        .with_secondary_label(Span::new(1, 2), "first borrow here")
        .with_label(Span::new(10, 12), "second borrow here")
        .with_secondary_label(Span::new(20, 22), "first borrow used here");

    assert_eq!(diag.severity, Severity::Error);
    assert_eq!(diag.primary_span(), Some(Span::new(10, 12)));
    let causes: Vec<Span> = diag.causes().map(|l| l.span).collect();
    assert_eq!(causes, vec![Span::new(1, 2), Span::new(20, 22)]);
}

#[test]
fn display_renders_all_parts() {
    let diag = Diagnostic::error(ErrorCode::E5007)
        .with_message("use of moved binding `x`")
        .with_label(Span::new(5, 6), "used here")
        .with_note("`x` was moved earlier")
        .with_suggestion("clone `x` before moving it");

    assert_eq!(
        diag.to_string(),
        "error [E5007]: use of moved binding `x`\n  --> 5..6: used here\n  = note: `x` was moved earlier\n  = help: clone `x` before moving it"
    );
}

#[test]
fn warnings_are_not_errors() {
    let diag = Diagnostic::warning(ErrorCode::E5001).with_message("w");
    assert!(!diag.is_error());
    assert_eq!(diag.primary_span(), None);
}
