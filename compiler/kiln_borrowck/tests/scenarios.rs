//! End-to-end borrow checking scenarios.
//!
//! Each test builds a small module the way lowering would, runs the whole
//! checker on it, and looks only at the public output: diagnostics by error
//! code and the annotations code generation consumes.

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Tests can panic")]

use kiln_borrowck::ir::{ArmBinding, BindingMode, Place, Stmt};
use kiln_borrowck::{
    check_module, BorrowckConfig, BorrowckOutput, CallingConvention, CaptureMode, DropKind,
    Module, ModuleBuilder, Multiplicity, OpSpec,
};
use kiln_diagnostic::ErrorCode;
use kiln_ir::{Name, StringInterner};
use kiln_types::{Idx, Mutability, Pool, RefKind};
use pretty_assertions::assert_eq;

struct Session {
    interner: StringInterner,
    pool: Pool,
    config: BorrowckConfig,
}

impl Session {
    fn new() -> Self {
        Session {
            interner: StringInterner::new(),
            pool: Pool::new(),
            config: BorrowckConfig::unlimited(),
        }
    }

    fn name(&self, s: &str) -> Name {
        self.interner.intern(s)
    }

    fn check(&self, module: &Module) -> BorrowckOutput {
        check_module(module, &self.pool, &self.interner, &self.config)
    }
}

fn codes(output: &BorrowckOutput) -> Vec<ErrorCode> {
    output.diagnostics.iter().map(|d| d.code).collect()
}

/// `vec = [1, 2, 3]; r1 = &mut vec; r2 = &mut vec; push r1 4; push r2 5`,
/// optionally followed by `get r1 0`.
fn vec_aliasing(s: &mut Session, then_get: bool) -> Module {
    let ints = s.pool.vec(Idx::INT);
    let poly = s.pool.reference(RefKind::Polymorphic, Mutability::Mut, ints);
    let own = s.pool.reference(RefKind::Own, Mutability::Mut, ints);
    let mut mb = ModuleBuilder::new();

    let mut push = mb.function(s.name("push"));
    push.param(s.name("v"), poly);
    push.param(s.name("x"), Idx::INT);
    let body = push.block(vec![], None);
    let push = push.finish(body);

    let mut get = mb.function(s.name("get"));
    get.param(s.name("v"), own);
    get.param(s.name("i"), Idx::INT);
    get.returns(Idx::INT);
    let tail = get.lit(Idx::INT);
    let body = get.block(vec![], Some(tail));
    let get = get.finish(body);

    let mut f = mb.function(s.name("main"));
    let v = f.local(s.name("vec"), ints, true);
    let r1 = f.local(s.name("r1"), poly, false);
    let r2 = f.local(s.name("r2"), poly, false);
    let init = f.lit(ints);
    let mut stmts = vec![f.let_(v, init)];
    let first = f.borrow(Place::var(v), Mutability::Mut, poly);
    stmts.push(f.let_(r1, first));
    let second = f.borrow(Place::var(v), Mutability::Mut, poly);
    stmts.push(f.let_(r2, second));
    for r in [r1, r2] {
        let target = f.var(r);
        let value = f.lit(Idx::INT);
        stmts.push(Stmt::Expr(f.call(push, vec![target, value], Idx::UNIT)));
    }
    if then_get {
        let target = f.var(r1);
        let index = f.lit(Idx::INT);
        stmts.push(Stmt::Expr(f.call(get, vec![target, index], Idx::INT)));
    }
    let body = f.block(stmts, None);
    f.finish(body);
    mb.finish()
}

#[test]
fn aliased_pushes_compile() {
    let mut s = Session::new();
    let module = vec_aliasing(&mut s, false);
    let output = s.check(&module);
    assert_eq!(codes(&output), vec![]);

    let tags: Vec<_> = output.ref_tags.values().flatten().collect();
    assert_eq!(tags.len(), 2);
    for tag in tags {
        assert_eq!(tag.kind, RefKind::Shared);
        assert_eq!(tag.convention, CallingConvention::PointerAlias);
    }
}

#[test]
fn owning_call_on_aliased_reference_is_rejected() {
    let mut s = Session::new();
    let module = vec_aliasing(&mut s, true);
    let output = s.check(&module);
    assert_eq!(codes(&output), vec![ErrorCode::E5001]);
}

#[test]
fn moved_capture_in_forked_continuation_is_rejected() {
    let mut s = Session::new();
    let boxed = s.pool.boxed(Idx::STR);

    let mut mb = ModuleBuilder::new();
    let fork = mb.effect(
        s.name("Fork"),
        vec![OpSpec::new(s.name("fork"), vec![], Idx::BOOL).with_multiplicity(Multiplicity::Mut)],
    );
    let mut f = mb.function(s.name("main"));
    let h = f.new_handler();
    let x = f.local(s.name("x"), boxed, false);
    let b = f.local(s.name("b"), Idx::BOOL, false);
    let init = f.lit(boxed);
    let s1 = f.let_(x, init);
    let p = f.perform(fork, 0, vec![], Idx::BOOL);
    let s2 = f.let_(b, p);
    let cond = f.var(b);
    let moved = f.mov(x);
    let then_block = f.block(vec![Stmt::Expr(moved)], None);
    let branch = f.if_(cond, then_block, None, Idx::UNIT);
    let handled = f.block(vec![s1, s2, Stmt::Expr(branch)], None);
    let yes = f.lit(Idx::BOOL);
    let first = f.resume(yes);
    let no = f.lit(Idx::BOOL);
    let second = f.resume(no);
    let clause_body = f.block(vec![Stmt::Expr(first)], Some(second));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, fork, handled, vec![clause], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    f.finish(body);
    let module = mb.finish();

    let output = s.check(&module);
    assert_eq!(codes(&output), vec![ErrorCode::E5005]);
    let cont = &output.continuations[0];
    assert_eq!(cont.multiplicity, Multiplicity::Mut);
    assert!(!cont.tail_resumptive);
    assert_eq!(cont.captures.len(), 1);
    assert_eq!(cont.captures[0].mode, CaptureMode::ByValue);
}

/// `Tree = Leaf(int) | Node(Inner)`, `Inner = Small(int) | Big(int, int)`.
fn stable_tree(s: &mut Session, reassign: bool) -> Module {
    let inner = s.pool.enum_type(
        s.name("Inner"),
        &[
            (s.name("Small"), vec![Idx::INT]),
            (s.name("Big"), vec![Idx::INT, Idx::INT]),
        ],
    );
    let tree = s.pool.enum_type(
        s.name("Tree"),
        &[(s.name("Leaf"), vec![Idx::INT]), (s.name("Node"), vec![inner])],
    );
    let stable = s.pool.reference(RefKind::Stable, Mutability::Mut, tree);
    let leaf_ref = s.pool.reference(RefKind::Polymorphic, Mutability::Mut, Idx::INT);

    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(s.name("bump"));
    let r = f.param(s.name("t"), stable);
    let leaf = f.local(s.name("n"), leaf_ref, false);

    let one = f.lit(Idx::INT);
    let bump_leaf = f.assign(Place::var(leaf).deref(), one);
    let leaf_body = f.block(vec![Stmt::Expr(bump_leaf)], None);
    let leaf_arm = f.arm(
        0,
        vec![ArmBinding {
            var: leaf,
            field: 0,
            mode: BindingMode::Ref(Mutability::Mut),
        }],
        leaf_body,
    );
    let two = f.lit(Idx::INT);
    let bump_deep = f.assign(Place::var(r).deref().variant(1, 0).variant(1, 1), two);
    let node_body = f.block(vec![Stmt::Expr(bump_deep)], None);
    let node_arm = f.arm(1, vec![], node_body);
    let matched = f.match_(Place::var(r).deref(), vec![leaf_arm, node_arm], Idx::UNIT);

    let mut stmts = vec![Stmt::Expr(matched)];
    if reassign {
        let fresh = f.lit(tree);
        stmts.push(Stmt::Expr(f.assign(Place::var(r).deref(), fresh)));
    }
    let body = f.block(stmts, None);
    f.finish(body);
    mb.finish()
}

#[test]
fn stable_reference_updates_leaves_in_place() {
    let mut s = Session::new();
    let module = stable_tree(&mut s, false);
    let output = s.check(&module);
    assert_eq!(codes(&output), vec![]);

    let Some(tag) = output.ref_tags.values().flatten().find(|t| t.binding.is_some()) else {
        panic!("no tag for the arm binding");
    };
    assert_eq!(tag.kind, RefKind::Stable);
}

#[test]
fn stable_reference_cannot_change_variant() {
    let mut s = Session::new();
    let module = stable_tree(&mut s, true);
    let output = s.check(&module);
    assert_eq!(codes(&output), vec![ErrorCode::E5002]);
}

/// Two reads from a handler handing out `&own mut Box<str>`, both held.
/// With `through_helper`, the second read happens inside a callee.
fn two_owning_reads(s: &mut Session, through_helper: bool) -> Module {
    let boxed = s.pool.boxed(Idx::STR);
    let own = s.pool.reference(RefKind::Own, Mutability::Mut, boxed);
    let mut mb = ModuleBuilder::new();
    let store = mb.effect(s.name("Store"), vec![OpSpec::new(s.name("read"), vec![], own)]);

    let helper = if through_helper {
        let mut g = mb.function(s.name("peek"));
        g.declares(store);
        let p = g.perform(store, 0, vec![], own);
        let body = g.block(vec![Stmt::Expr(p)], None);
        Some(g.finish(body))
    } else {
        None
    };

    let mut f = mb.function(s.name("main"));
    let a = f.local(s.name("a"), own, false);
    let b = f.local(s.name("b"), own, false);
    let h = f.new_handler();
    let first = f.perform(store, 0, vec![], own);
    let mut stmts = vec![f.let_(a, first)];
    match helper {
        Some(peek) => stmts.push(Stmt::Expr(f.call(peek, vec![], Idx::UNIT))),
        None => {
            let second = f.perform(store, 0, vec![], own);
            stmts.push(f.let_(b, second));
            stmts.push(Stmt::Expr(f.var(b)));
        }
    }
    stmts.push(Stmt::Expr(f.var(a)));
    let handled = f.block(stmts, None);
    let v = f.lit(own);
    let resume = f.resume(v);
    let clause_body = f.block(vec![], Some(resume));
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, store, handled, vec![clause], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    f.finish(body);
    mb.finish()
}

#[test]
fn simultaneous_owning_reads_conflict() {
    let mut s = Session::new();
    let module = two_owning_reads(&mut s, false);
    let output = s.check(&module);
    assert_eq!(codes(&output), vec![ErrorCode::E5001]);
}

#[test]
fn owning_read_inside_callee_conflicts() {
    let mut s = Session::new();
    let module = two_owning_reads(&mut s, true);
    let output = s.check(&module);
    assert_eq!(codes(&output), vec![ErrorCode::E5001]);
    assert_eq!(output.classes.len(), 1);
}

#[test]
fn unhandled_effect_is_reported() {
    let s = Session::new();
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(s.name("Ask"), vec![OpSpec::new(s.name("ask"), vec![], Idx::INT)]);
    let mut f = mb.function(s.name("main"));
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let body = f.block(vec![Stmt::Expr(p)], None);
    f.finish(body);
    let module = mb.finish();

    let output = s.check(&module);
    assert_eq!(codes(&output), vec![ErrorCode::E5003]);
}

#[test]
fn resume_outside_clause_is_reported() {
    let s = Session::new();
    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(s.name("main"));
    let v = f.lit(Idx::UNIT);
    let r = f.resume(v);
    let body = f.block(vec![Stmt::Expr(r)], None);
    f.finish(body);
    let module = mb.finish();

    let output = s.check(&module);
    assert_eq!(codes(&output), vec![ErrorCode::E5010]);
}

#[test]
fn unresumed_handler_drops_captured_values() {
    let mut s = Session::new();
    let boxed = s.pool.boxed(Idx::STR);
    let mut mb = ModuleBuilder::new();
    let abort = mb.effect(s.name("Abort"), vec![OpSpec::new(s.name("abort"), vec![], Idx::UNIT)]);
    let mut f = mb.function(s.name("main"));
    let h = f.new_handler();
    let x = f.local(s.name("x"), boxed, false);
    let init = f.lit(boxed);
    let s1 = f.let_(x, init);
    let p = f.perform(abort, 0, vec![], Idx::UNIT);
    let use_x = f.mov(x);
    let handled = f.block(vec![s1, Stmt::Expr(p), Stmt::Expr(use_x)], None);
    let clause_body = f.block(vec![], None);
    let clause = f.clause(0, vec![], clause_body);
    let handle = f.handle(h, abort, handled, vec![clause], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(handle)], None);
    let main = f.finish(body);
    let module = mb.finish();

    let output = s.check(&module);
    assert_eq!(codes(&output), vec![]);
    let cont = &output.continuations[0];
    assert_eq!(cont.multiplicity, Multiplicity::Once);
    let dropped: Vec<_> = output.drops_of(main, x).map(|d| d.kind).collect();
    assert!(dropped.contains(&DropKind::ContinuationDropped(cont.key)), "{dropped:?}");
}

#[test]
fn errors_in_every_function_are_reported() {
    let mut s = Session::new();
    let boxed = s.pool.boxed(Idx::STR);
    let mut mb = ModuleBuilder::new();
    let ask = mb.effect(s.name("Ask"), vec![OpSpec::new(s.name("ask"), vec![], Idx::INT)]);

    let mut f = mb.function(s.name("consume"));
    let x = f.local(s.name("x"), boxed, false);
    let init = f.lit(boxed);
    let s1 = f.let_(x, init);
    let moved = f.mov(x);
    let again = f.var(x);
    let body = f.block(vec![s1, Stmt::Expr(moved), Stmt::Expr(again)], None);
    f.finish(body);

    let mut f = mb.function(s.name("query"));
    let p = f.perform(ask, 0, vec![], Idx::INT);
    let body = f.block(vec![Stmt::Expr(p)], None);
    f.finish(body);

    let mut f = mb.function(s.name("stray"));
    let v = f.lit(Idx::UNIT);
    let r = f.resume(v);
    let body = f.block(vec![Stmt::Expr(r)], None);
    f.finish(body);
    let module = mb.finish();

    let output = s.check(&module);
    let mut found = codes(&output);
    found.sort_by_key(|c| c.as_str());
    assert_eq!(found, vec![ErrorCode::E5003, ErrorCode::E5007, ErrorCode::E5010]);
}
