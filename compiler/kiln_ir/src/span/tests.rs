use super::*;

#[test]
fn merge_covers_both() {
    let a = Span::new(4, 9);
    let b = Span::new(2, 6);
    assert_eq!(a.merge(b), Span::new(2, 9));
    assert_eq!(b.merge(a), Span::new(2, 9));
}

#[test]
fn contains_span_is_inclusive_of_edges() {
    let outer = Span::new(10, 20);
    assert!(outer.contains_span(Span::new(10, 20)));
    assert!(outer.contains_span(Span::new(12, 13)));
    assert!(!outer.contains_span(Span::new(9, 13)));
}

#[test]
fn try_from_range_rejects_overflow() {
    let big = u32::MAX as usize + 1;
    assert_eq!(
        Span::try_from_range(0..big),
        Err(SpanError::EndTooLarge(big))
    );
    assert_eq!(Span::try_from_range(3..7), Ok(Span::new(3, 7)));
}

#[test]
fn ordering_is_by_start_then_end() {
    let mut spans = vec![Span::new(5, 6), Span::new(1, 9), Span::new(1, 2)];
    spans.sort();
    assert_eq!(
        spans,
        vec![Span::new(1, 2), Span::new(1, 9), Span::new(5, 6)]
    );
}

#[test]
fn debug_format() {
    assert_eq!(format!("{:?}", Span::new(3, 8)), "3..8");
    assert!(Span::point(4).is_empty());
    assert_eq!(Span::new(3, 8).len(), 5);
}
