use kiln_types::Idx;
use pretty_assertions::assert_eq;

use crate::builder::{ModuleBuilder, OpSpec};
use crate::error::BorrowckErrorKind;
use crate::handlers::resolve_handlers;
use crate::ir::{Module, Multiplicity, OpId, Stmt};
use crate::layout::Layout;
use crate::loans::collect_loans;
use crate::output::{CaptureMode, ContinuationKey, DropKind};
use crate::summary::compute_summaries;
use crate::test_helpers::{kinds, Fixture};

use super::{classify_resumes, ResumeResult};

fn classify(fx: &Fixture, module: &Module) -> ResumeResult {
    let cx = fx.ctx(module);
    let func = &module.functions[0];
    let layout = Layout::compute(func);
    let handlers = resolve_handlers(&cx, func);
    let summaries = compute_summaries(&cx);
    let table = match collect_loans(&cx, func, &layout, &handlers.facts, &summaries) {
        Ok(table) => table,
        Err(e) => panic!("loan collection failed: {e}"),
    };
    classify_resumes(&cx, func, &layout, &handlers.facts, &table)
}

#[test]
fn single_tail_resume_is_tail_resumptive() {
    let fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(fx.name("Ask"), vec![OpSpec::new(fx.name("ask"), vec![], Idx::INT)]);
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let handled = f.block(vec![], Some(p));
    let v = f.lit(Idx::INT);
    let r = f.resume(v);
    let clause_body = f.block(vec![], Some(r));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, ask, handled, vec![clause], Idx::INT);
    let body = f.block(vec![], Some(handle));
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    let info = &result.continuations[0].info;
    assert_eq!(
        info.key,
        ContinuationKey {
            handler: h,
            op: OpId::new(0)
        }
    );
    assert_eq!(info.multiplicity, Multiplicity::Once);
    assert!(info.tail_resumptive);
    assert!(!info.requires_send);
}

#[test]
fn second_resume_violates_once() {
    let fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(fx.name("Ask"), vec![OpSpec::new(fx.name("ask"), vec![], Idx::INT)]);
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let handled = f.block(vec![], Some(p));
    let v1 = f.lit(Idx::INT);
    let r1 = f.resume(v1);
    let first_span = r1.span;
    let v2 = f.lit(Idx::INT);
    let r2 = f.resume(v2);
    let second_span = r2.span;
    let clause_body = f.block(vec![Stmt::Expr(r1)], Some(r2));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, ask, handled, vec![clause], Idx::INT);
    let body = f.block(vec![], Some(handle));
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert_eq!(kinds(&result.errors), vec![BorrowckErrorKind::ResumeMultiplicity]);
    let err = &result.errors[0];
    assert_eq!(err.span, second_span);
    assert_eq!(err.causes.first().map(|c| c.span), Some(first_span));
    let info = &result.continuations[0].info;
    assert_eq!(info.multiplicity, Multiplicity::Mut);
    assert_eq!(info.declared, Multiplicity::Once);
    assert!(!info.tail_resumptive);
}

#[test]
fn branches_resuming_once_each_stay_once() {
    let fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(fx.name("Ask"), vec![OpSpec::new(fx.name("ask"), vec![], Idx::INT)]);
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let handled = f.block(vec![], Some(p));
    let cond = f.lit(Idx::BOOL);
    let v1 = f.lit(Idx::INT);
    let r1 = f.resume(v1);
    let then_block = f.block(vec![], Some(r1));
    let v2 = f.lit(Idx::INT);
    let r2 = f.resume(v2);
    let else_block = f.block(vec![], Some(r2));
    let branch = f.if_(cond, then_block, Some(else_block), Idx::INT);
    let clause_body = f.block(vec![], Some(branch));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, ask, handled, vec![clause], Idx::INT);
    let body = f.block(vec![], Some(handle));
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    let info = &result.continuations[0].info;
    assert_eq!(info.multiplicity, Multiplicity::Once);
    assert!(info.tail_resumptive);
}

#[test]
fn moved_capture_in_reentrant_continuation() {
    let mut fx = Fixture::new();
    let boxed = fx.pool.boxed(Idx::STR);
    let mut mb = ModuleBuilder::new();
    let fork = mb.effect(
        fx.name("Fork"),
        vec![OpSpec::new(fx.name("fork"), vec![], Idx::BOOL).with_multiplicity(Multiplicity::Mut)],
    );
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let x = f.local(fx.name("x"), boxed, false);
    let b = f.local(fx.name("b"), Idx::BOOL, false);
    let init = f.lit(boxed);
    let s1 = f.let_(x, init);
    let p = f.perform(fork, 0, vec![], Idx::BOOL);
    let p_span = p.span;
    let s2 = f.let_(b, p);
    let cond = f.var(b);
    let moved = f.mov(x);
    let move_span = moved.span;
    let then_block = f.block(vec![Stmt::Expr(moved)], None);
    let else_block = f.block(vec![], None);
    let branch = f.if_(cond, then_block, Some(else_block), Idx::UNIT);
    let handled = f.block(vec![s1, s2, Stmt::Expr(branch)], None);
    let yes = f.lit(Idx::BOOL);
    let r1 = f.resume(yes);
    let no = f.lit(Idx::BOOL);
    let r2 = f.resume(no);
    let second_span = r2.span;
    let clause_body = f.block(vec![Stmt::Expr(r1)], Some(r2));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, fork, handled, vec![clause], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert_eq!(kinds(&result.errors), vec![BorrowckErrorKind::CaptureMove]);
    let err = &result.errors[0];
    assert_eq!(err.span, move_span);
    let causes: Vec<_> = err.causes.iter().map(|c| c.span).collect();
    assert_eq!(causes, vec![p_span, second_span]);

    let info = &result.continuations[0].info;
    assert_eq!(info.multiplicity, Multiplicity::Mut);
    assert_eq!(info.captures.len(), 1);
    assert_eq!(info.captures[0].var, x);
    assert_eq!(info.captures[0].mode, CaptureMode::ByValue);
}

#[test]
fn outer_bindings_are_captured_by_reference() {
    let fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(fx.name("Ask"), vec![OpSpec::new(fx.name("ask"), vec![], Idx::INT)]);
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let n = f.local(fx.name("n"), Idx::INT, false);
    let init = f.lit(Idx::INT);
    let s1 = f.let_(n, init);
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let use_n = f.var(n);
    let handled = f.block(vec![Stmt::Expr(p)], Some(use_n));
    let v = f.lit(Idx::INT);
    let r = f.resume(v);
    let clause_body = f.block(vec![], Some(r));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, ask, handled, vec![clause], Idx::INT);
    let body = f.block(vec![s1], Some(handle));
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    let info = &result.continuations[0].info;
    assert_eq!(info.captures.len(), 1);
    assert_eq!(info.captures[0].var, n);
    assert_eq!(info.captures[0].mode, CaptureMode::ByRef);
}

#[test]
fn unresumed_continuation_drops_its_captures() {
    let mut fx = Fixture::new();
    let boxed = fx.pool.boxed(Idx::STR);
    let mut mb = ModuleBuilder::new();
    let abort = mb.effect(fx.name("Abort"), vec![OpSpec::new(fx.name("abort"), vec![], Idx::NEVER)]);
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let x = f.local(fx.name("x"), boxed, false);
    let init = f.lit(boxed);
    let s1 = f.let_(x, init);
    let p = f.perform(abort, 0, vec![], Idx::NEVER);
    let moved = f.mov(x);
    let handled = f.block(vec![s1, Stmt::Expr(p), Stmt::Expr(moved)], None);
    let clause_body = f.block(vec![], None);
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, abort, handled, vec![clause], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    let key = ContinuationKey {
        handler: h,
        op: OpId::new(0),
    };
    let dropped: Vec<_> = result.drops.iter().map(|d| (d.var, d.kind)).collect();
    assert_eq!(dropped, vec![(x, DropKind::ContinuationDropped(key))]);
}

#[test]
fn spawned_resume_needs_sendable_captures() {
    let mut fx = Fixture::new();
    let shared = fx.pool.rc(Idx::INT);
    let mut mb = ModuleBuilder::new();
    let par = mb.effect(
        fx.name("Par"),
        vec![OpSpec::new(fx.name("split"), vec![], Idx::INT).with_multiplicity(Multiplicity::Many)],
    );
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let c = f.local(fx.name("c"), shared, false);
    let init = f.lit(shared);
    let s1 = f.let_(c, init);
    let p = f.perform(par, 0, vec![], Idx::INT);
    let use_c = f.var(c);
    let handled = f.block(vec![s1, Stmt::Expr(p)], Some(use_c));
    let v = f.lit(Idx::INT);
    let r = f.resume(v);
    let spawned_body = f.block(vec![Stmt::Expr(r)], None);
    let spawned = f.spawn(spawned_body);
    let clause_body = f.block(vec![Stmt::Expr(spawned)], None);
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, par, handled, vec![clause], shared);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert_eq!(kinds(&result.errors), vec![BorrowckErrorKind::NonSendCapture]);
    let info = &result.continuations[0].info;
    assert_eq!(info.multiplicity, Multiplicity::Many);
    assert!(info.requires_send);
}

#[test]
fn escaping_continuation_counts_as_reentrant() {
    let mut fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(fx.name("Ask"), vec![OpSpec::new(fx.name("ask"), vec![], Idx::INT)]);
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let k_ty = fx.pool.continuation(h.raw(), 0);
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let handled = f.block(vec![Stmt::Expr(p)], None);
    let k = f.resume_value(k_ty);
    let k_span = k.span;
    let clause_body = f.block(vec![Stmt::Expr(k)], None);
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, ask, handled, vec![clause], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert_eq!(kinds(&result.errors), vec![BorrowckErrorKind::ResumeMultiplicity]);
    assert_eq!(result.errors[0].span, k_span);
    assert_eq!(result.continuations[0].info.multiplicity, Multiplicity::Mut);
}

#[test]
fn resume_in_loop_is_recorded() {
    let fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let gen = mb.effect(
        fx.name("Gen"),
        vec![OpSpec::new(fx.name("next"), vec![], Idx::INT).with_multiplicity(Multiplicity::Mut)],
    );
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let p = f.perform(gen, 0, vec![], Idx::INT);
    let handled = f.block(vec![Stmt::Expr(p)], None);
    let v = f.lit(Idx::INT);
    let r = f.resume(v);
    let r_span = r.span;
    let loop_body = f.block(vec![Stmt::Expr(r)], None);
    let looped = f.loop_(loop_body);
    let clause_body = f.block(vec![Stmt::Expr(looped)], None);
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, gen, handled, vec![clause], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    let facts = &result.continuations[0];
    assert_eq!(facts.info.multiplicity, Multiplicity::Mut);
    assert_eq!(facts.resumed_in_loop, Some(r_span));
}

#[test]
fn returning_branch_does_not_resume_again() {
    let fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(fx.name("Ask"), vec![OpSpec::new(fx.name("ask"), vec![], Idx::INT)]);
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let handled = f.block(vec![], Some(p));
    let cond = f.lit(Idx::BOOL);
    let v1 = f.lit(Idx::INT);
    let r1 = f.resume(v1);
    let ret = f.ret(None);
    let then_block = f.block(vec![Stmt::Expr(r1)], Some(ret));
    let early = f.if_(cond, then_block, None, Idx::UNIT);
    let v2 = f.lit(Idx::INT);
    let r2 = f.resume(v2);
    let clause_body = f.block(vec![Stmt::Expr(early)], Some(r2));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, ask, handled, vec![clause], Idx::INT);
    let body = f.block(vec![], Some(handle));
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.continuations[0].info.multiplicity, Multiplicity::Once);
}

#[test]
fn break_after_resume_leaves_the_loop() {
    let fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(fx.name("Ask"), vec![OpSpec::new(fx.name("ask"), vec![], Idx::INT)]);
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let handled = f.block(vec![Stmt::Expr(p)], None);
    let v = f.lit(Idx::INT);
    let r = f.resume(v);
    let brk = f.brk();
    let loop_body = f.block(vec![Stmt::Expr(r)], Some(brk));
    let looped = f.loop_(loop_body);
    let clause_body = f.block(vec![Stmt::Expr(looped)], None);
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, ask, handled, vec![clause], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    let facts = &result.continuations[0];
    assert_eq!(facts.info.multiplicity, Multiplicity::Once);
    assert_eq!(facts.resumed_in_loop, None);
}

#[test]
fn handler_moving_a_capture_between_resumes() {
    let mut fx = Fixture::new();
    let boxed = fx.pool.boxed(Idx::STR);
    let mut mb = ModuleBuilder::new();
    let fork = mb.effect(
        fx.name("Fork"),
        vec![OpSpec::new(fx.name("fork"), vec![], Idx::BOOL).with_multiplicity(Multiplicity::Mut)],
    );
    let mut f = mb.function(fx.name("main"));
    let h = f.new_handler();
    let x = f.local(fx.name("x"), boxed, false);
    let init = f.lit(boxed);
    let s1 = f.let_(x, init);
    let p = f.perform(fork, 0, vec![], Idx::BOOL);
    let p_span = p.span;
    let use_x = f.var(x);
    let handled = f.block(vec![Stmt::Expr(p)], Some(use_x));
    let yes = f.lit(Idx::BOOL);
    let r1 = f.resume(yes);
    let moved = f.mov(x);
    let move_span = moved.span;
    let no = f.lit(Idx::BOOL);
    let r2 = f.resume(no);
    let second_span = r2.span;
    let clause_body = f.block(vec![Stmt::Expr(r1), Stmt::Expr(moved)], Some(r2));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, fork, handled, vec![clause], boxed);
    let body = f.block(vec![s1], Some(handle));
    f.finish(body);
    let module = mb.finish();

    let result = classify(&fx, &module);
    assert_eq!(kinds(&result.errors), vec![BorrowckErrorKind::CaptureMove]);
    let err = &result.errors[0];
    assert_eq!(err.span, move_span);
    let causes: Vec<_> = err.causes.iter().map(|c| c.span).collect();
    assert_eq!(causes, vec![p_span, second_span]);
    assert_eq!(result.continuations[0].info.multiplicity, Multiplicity::Mut);
}
