use kiln_ir::Name;
use kiln_types::Idx;
use pretty_assertions::assert_eq;

use crate::builder::ModuleBuilder;
use crate::ir::{ExprKind, Stmt};

use super::{Layout, Pos, PosRange, UseKind};

#[test]
fn ticks_follow_evaluation_order() {
    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(Name::from_raw(1));
    let x = f.local(Name::from_raw(2), Idx::INT, false);
    let init = f.lit(Idx::INT);
    let stmt = f.let_(x, init);
    let tail = f.var(x);
    let body = f.block(vec![stmt], Some(tail));
    f.finish(body);
    let module = mb.finish();
    let func = &module.functions[0];
    let layout = Layout::compute(func);

    // block enter 1, lit 2..3, var 4..5, block exit 6
    assert_eq!(layout.body, PosRange::new(Pos::new(0), Pos::new(6)));
    let facts = &layout.bindings[x.index()];
    assert_eq!(facts.decl, Some(Pos::new(3)));
    assert_eq!(facts.uses.len(), 1);
    assert_eq!(facts.uses[0].kind, UseKind::Read);
    assert_eq!(facts.live_end, Pos::new(5));
}

#[test]
fn use_in_loop_extends_outer_binding() {
    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(Name::from_raw(1));
    let x = f.local(Name::from_raw(2), Idx::INT, false);
    let init = f.lit(Idx::INT);
    let stmt = f.let_(x, init);
    let read = f.var(x);
    let brk = f.brk();
    let loop_body = f.block(vec![Stmt::Expr(read)], Some(brk));
    let lp = f.loop_(loop_body);
    let body = f.block(vec![stmt], Some(lp));
    f.finish(body);
    let module = mb.finish();
    let func = &module.functions[0];
    let layout = Layout::compute(func);

    let Some(tail) = func.body.tail.as_deref() else {
        panic!("body should have a tail");
    };
    assert!(matches!(tail.kind, ExprKind::Loop { .. }));
    let loop_range = layout.expr_range(tail.id);
    assert_eq!(Some(layout.live_end(x)), loop_range.map(|r| r.end));
    assert_eq!(layout.loops.len(), 1);
}

#[test]
fn scopes_nest() {
    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(Name::from_raw(1));
    let inner = f.block(vec![], None);
    let inner_scope = inner.scope;
    let nested = f.block_expr(inner, Idx::UNIT);
    let other = f.block(vec![], None);
    let other_scope = other.scope;
    let other_expr = f.block_expr(other, Idx::UNIT);
    let body = f.block(vec![Stmt::Expr(nested)], Some(other_expr));
    let root = body.scope;
    f.finish(body);
    let module = mb.finish();
    let layout = Layout::compute(&module.functions[0]);

    assert!(layout.scope_within(inner_scope, root));
    assert!(!layout.scope_within(root, inner_scope));
    assert!(!layout.scope_within(other_scope, inner_scope));
    assert_eq!(layout.scopes[&inner_scope].depth, 1);
}

#[test]
fn params_are_declared_at_entry() {
    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(Name::from_raw(1));
    let p = f.param(Name::from_raw(2), Idx::INT);
    let body = f.block(vec![], None);
    f.finish(body);
    let module = mb.finish();
    let layout = Layout::compute(&module.functions[0]);
    assert_eq!(layout.bindings[p.index()].decl, Some(Pos::new(0)));
}
