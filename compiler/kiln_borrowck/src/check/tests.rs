use kiln_diagnostic::ErrorCode;
use kiln_ir::Name;
use kiln_types::{Idx, Mutability, RefKind};
use pretty_assertions::assert_eq;

use crate::builder::ModuleBuilder;
use crate::config::BorrowckConfig;
use crate::ir::{Module, Place, Stmt};
use crate::output::{CallingConvention, Region};
use crate::test_helpers::Fixture;

use super::check_module;

/// `main` borrows `x` mutably into `a` and then `b`. With `overlap`, `a` is
/// written through after `b` exists.
fn two_borrows(fx: &mut Fixture, overlap: bool) -> (Module, Name) {
    let poly = fx.pool.reference(RefKind::Polymorphic, Mutability::Mut, Idx::INT);
    let mut mb = ModuleBuilder::new();
    let main = fx.name("main");
    let mut f = mb.function(main);
    let x = f.local(fx.name("x"), Idx::INT, true);
    let a = f.local(fx.name("a"), poly, false);
    let b = f.local(fx.name("b"), poly, false);
    let init = f.lit(Idx::INT);
    let s1 = f.let_(x, init);
    let first = f.borrow(Place::var(x), Mutability::Mut, poly);
    let s2 = f.let_(a, first);
    let second = f.borrow(Place::var(x), Mutability::Mut, poly);
    let s3 = f.let_(b, second);
    let mut stmts = vec![s1, s2, s3];
    let one = f.lit(Idx::INT);
    stmts.push(Stmt::Expr(f.assign(Place::var(b).deref(), one)));
    if overlap {
        let two = f.lit(Idx::INT);
        stmts.push(Stmt::Expr(f.assign(Place::var(a).deref(), two)));
    }
    let body = f.block(stmts, None);
    f.finish(body);
    (mb.finish(), main)
}

#[test]
fn empty_module_checks_clean() {
    let fx = Fixture::new();
    let module = ModuleBuilder::new().finish();
    let output = check_module(&module, &fx.pool, &fx.interner, &fx.config);
    assert!(!output.has_errors());
    assert!(output.ref_tags.is_empty());
    assert!(output.continuations.is_empty());
}

#[test]
fn lone_borrow_of_small_value_is_passed_by_value() {
    let mut fx = Fixture::new();
    let (module, main) = two_borrows(&mut fx, false);
    let output = check_module(&module, &fx.pool, &fx.interner, &fx.config);
    assert!(!output.has_errors(), "{:?}", output.diagnostics);

    let mut tags: Vec<_> = output.ref_tags.values().flatten().collect();
    tags.sort_by_key(|t| t.expr);
    assert_eq!(tags.len(), 2);
    for tag in tags {
        assert_eq!(tag.kind, RefKind::Own);
        assert_eq!(tag.convention, CallingConvention::ByValue);
        assert_eq!(tag.function, main);
        assert!(matches!(tag.region, Region::Scope { function, .. } if function == main));
        assert_eq!(tag.class, None);
    }
}

#[test]
fn overlapping_borrows_are_pointer_aliased() {
    let mut fx = Fixture::new();
    let (module, _) = two_borrows(&mut fx, true);
    let output = check_module(&module, &fx.pool, &fx.interner, &fx.config);
    assert!(!output.has_errors(), "{:?}", output.diagnostics);

    for tag in output.ref_tags.values().flatten() {
        assert_eq!(tag.kind, RefKind::Shared);
        assert_eq!(tag.convention, CallingConvention::PointerAlias);
    }
}

#[test]
fn parallel_run_matches_sequential() {
    let mut fx = Fixture::new();
    let own = fx.pool.reference(RefKind::Own, Mutability::Mut, Idx::INT);
    let mut mb = ModuleBuilder::new();
    for name in ["a", "b", "c"] {
        let mut f = mb.function(fx.name(name));
        let x = f.local(fx.name("x"), Idx::INT, true);
        let r = f.local(fx.name("r"), own, false);
        let s = f.local(fx.name("s"), own, false);
        let init = f.lit(Idx::INT);
        let s1 = f.let_(x, init);
        let first = f.borrow(Place::var(x), Mutability::Mut, own);
        let s2 = f.let_(r, first);
        let second = f.borrow(Place::var(x), Mutability::Mut, own);
        let s3 = f.let_(s, second);
        let use_r = f.var(r);
        let body = f.block(vec![s1, s2, s3, Stmt::Expr(use_r)], None);
        f.finish(body);
    }
    let module = mb.finish();

    let sequential = check_module(&module, &fx.pool, &fx.interner, &fx.config);
    let config = BorrowckConfig::unlimited().with_parallel(true);
    let parallel = check_module(&module, &fx.pool, &fx.interner, &config);

    assert_eq!(sequential.error_count(), 3);
    assert_eq!(sequential.diagnostics, parallel.diagnostics);
    assert_eq!(sequential.drops, parallel.drops);
    assert_eq!(sequential.ref_tags.len(), parallel.ref_tags.len());
}

#[test]
fn malformed_call_is_an_internal_diagnostic() {
    let fx = Fixture::new();
    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(fx.name("main"));
    let call = f.call(fx.name("missing"), vec![], Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(call)], None);
    f.finish(body);
    let module = mb.finish();

    let output = check_module(&module, &fx.pool, &fx.interner, &fx.config);
    assert!(output.has_errors());
    assert!(output.diagnostics.iter().all(|d| d.code == ErrorCode::E9001));
}

#[test]
fn diagnostics_are_limited_by_config() {
    let mut fx = Fixture::new();
    let own = fx.pool.reference(RefKind::Own, Mutability::Mut, Idx::INT);
    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(fx.name("main"));
    let x = f.local(fx.name("x"), Idx::INT, true);
    let init = f.lit(Idx::INT);
    let mut stmts = vec![f.let_(x, init)];
    let mut holders = Vec::new();
    for i in 0..4 {
        let r = f.local(fx.name(&format!("r{i}")), own, false);
        let borrow = f.borrow(Place::var(x), Mutability::Mut, own);
        stmts.push(f.let_(r, borrow));
        holders.push(r);
    }
    for r in holders {
        stmts.push(Stmt::Expr(f.var(r)));
    }
    let body = f.block(stmts, None);
    f.finish(body);
    let module = mb.finish();

    let unlimited = check_module(&module, &fx.pool, &fx.interner, &fx.config);
    assert!(unlimited.error_count() >= 3);

    let mut config = BorrowckConfig::default();
    config.diagnostics.error_limit = 1;
    let limited = check_module(&module, &fx.pool, &fx.interner, &config);
    let codes: Vec<ErrorCode> = limited.diagnostics.iter().map(|d| d.code).collect();
    assert_eq!(codes, vec![ErrorCode::E5001, ErrorCode::E9002]);
}
