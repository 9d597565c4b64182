use kiln_ir::Span;
use pretty_assertions::assert_eq;

use super::*;

fn err(code: ErrorCode, start: u32, msg: &str) -> Diagnostic {
    Diagnostic::error(code)
        .with_message(msg)
        .with_label(Span::new(start, start + 1), "here")
}

#[test]
fn flush_sorts_by_primary_span() {
    let mut queue = DiagnosticQueue::with_config(DiagnosticConfig::unlimited());
    queue.add(err(ErrorCode::E5003, 40, "c"));
    queue.add(err(ErrorCode::E5001, 10, "a"));
    queue.add(err(ErrorCode::E5002, 25, "b"));

    let messages: Vec<String> = queue.flush().into_iter().map(|d| d.message).collect();
    assert_eq!(messages, vec!["a", "b", "c"]);
    assert_eq!(queue.error_count(), 0);
}

#[test]
fn same_span_keeps_insertion_order() {
    let mut queue = DiagnosticQueue::with_config(DiagnosticConfig::unlimited());
    queue.add(err(ErrorCode::E5005, 7, "first"));
    queue.add(err(ErrorCode::E5004, 7, "second"));
    let messages: Vec<String> = queue.flush().into_iter().map(|d| d.message).collect();
    assert_eq!(messages, vec!["first", "second"]);
}

#[test]
fn deduplicates_same_code_and_span() {
    let mut queue = DiagnosticQueue::new();
    assert!(queue.add(err(ErrorCode::E5001, 3, "x")));
    assert!(!queue.add(err(ErrorCode::E5001, 3, "x again")));
    assert!(queue.add(err(ErrorCode::E5002, 3, "different code")));
    assert_eq!(queue.error_count(), 2);
}

#[test]
fn filters_follow_on_errors() {
    let mut queue = DiagnosticQueue::new();
    assert!(!queue.add(err(ErrorCode::E5002, 3, "cannot project into `<error>`")));
    assert!(queue.has_errors().is_none());
}

#[test]
fn error_limit_appends_summary() {
    let mut queue = DiagnosticQueue::with_config(DiagnosticConfig {
        error_limit: 2,
        filter_follow_on: false,
        deduplicate: false,
    });
    queue.add(err(ErrorCode::E5001, 1, "a"));
    queue.add(err(ErrorCode::E5001, 2, "b"));
    assert!(queue.limit_reached());
    assert!(!queue.add(err(ErrorCode::E5001, 3, "c")));

    let flushed = queue.flush();
    assert_eq!(flushed.len(), 3);
    assert_eq!(flushed[2].code, ErrorCode::E9002);
    assert_eq!(flushed[2].primary_span(), Some(Span::new(3, 4)));
}

#[test]
fn emit_error_returns_guarantee() {
    let mut queue = DiagnosticQueue::new();
    let _proof = queue.emit_error(err(ErrorCode::E5007, 0, "moved"));
    assert!(queue.has_errors().is_some());
}
