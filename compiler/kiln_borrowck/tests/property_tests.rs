//! Property-based tests for reference classification.
//!
//! Random straight-line programs borrow one binding repeatedly and write
//! through the references in random order. Polymorphic references never
//! cause errors; each must come out `Own` exactly when no other reference to
//! the binding is live at the same time.

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Tests can panic")]

use kiln_borrowck::ir::{Place, Stmt};
use kiln_borrowck::{check_module, BorrowckConfig, ExprId, Module, ModuleBuilder};
use kiln_ir::StringInterner;
use kiln_types::{Idx, Mutability, Pool, RefKind};
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Op {
    /// `let r_n = &mut x` for the next unused `n`.
    Borrow,
    /// `*r_k = 0` for some already-borrowed `k`.
    Write(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Borrow), (0usize..8).prop_map(Op::Write)]
}

struct Program {
    module: Module,
    /// Creating expression of each reference, in borrow order.
    borrows: Vec<ExprId>,
    /// For each reference, the step that created it and the last step that
    /// used it.
    intervals: Vec<(usize, usize)>,
}

fn build(ops: &[Op], interner: &StringInterner, pool: &mut Pool) -> Program {
    let poly = pool.reference(RefKind::Polymorphic, Mutability::Mut, Idx::INT);
    let mut mb = ModuleBuilder::new();
    let mut f = mb.function(interner.intern("main"));
    let x = f.local(interner.intern("x"), Idx::INT, true);
    let init = f.lit(Idx::INT);
    let mut stmts = vec![f.let_(x, init)];
    let mut refs = Vec::new();
    let mut borrows = Vec::new();
    let mut intervals: Vec<(usize, usize)> = Vec::new();

    for (step, op) in ops.iter().enumerate() {
        match *op {
            Op::Borrow => {
                let r = f.local(interner.intern(&format!("r{}", refs.len())), poly, false);
                let borrow = f.borrow(Place::var(x), Mutability::Mut, poly);
                borrows.push(borrow.id);
                stmts.push(f.let_(r, borrow));
                refs.push(r);
                intervals.push((step, step));
            }
            Op::Write(k) if !refs.is_empty() => {
                let k = k % refs.len();
                let zero = f.lit(Idx::INT);
                stmts.push(Stmt::Expr(f.assign(Place::var(refs[k]).deref(), zero)));
                intervals[k].1 = step;
            }
            Op::Write(_) => {}
        }
    }
    let body = f.block(stmts, None);
    f.finish(body);
    Program {
        module: mb.finish(),
        borrows,
        intervals,
    }
}

fn expected_kinds(intervals: &[(usize, usize)]) -> Vec<RefKind> {
    intervals
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| {
            let aliased = intervals
                .iter()
                .enumerate()
                .any(|(j, &(s, e))| j != i && s <= end && start <= e);
            if aliased {
                RefKind::Shared
            } else {
                RefKind::Own
            }
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn polymorphic_borrows_resolve_by_overlap(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let interner = StringInterner::new();
        let mut pool = Pool::new();
        let program = build(&ops, &interner, &mut pool);
        let output = check_module(&program.module, &pool, &interner, &BorrowckConfig::unlimited());

        prop_assert!(!output.has_errors(), "{:?}", output.diagnostics);
        let kinds: Vec<RefKind> = program
            .borrows
            .iter()
            .map(|id| output.ref_tag(*id).map_or(RefKind::Polymorphic, |t| t.kind))
            .collect();
        prop_assert_eq!(kinds, expected_kinds(&program.intervals));
    }

    #[test]
    fn parallel_checking_is_deterministic(ops in prop::collection::vec(op_strategy(), 1..16)) {
        let interner = StringInterner::new();
        let mut pool = Pool::new();
        let program = build(&ops, &interner, &mut pool);
        let sequential = check_module(&program.module, &pool, &interner, &BorrowckConfig::unlimited());
        let parallel = check_module(
            &program.module,
            &pool,
            &interner,
            &BorrowckConfig::unlimited().with_parallel(true),
        );

        prop_assert_eq!(&sequential.diagnostics, &parallel.diagnostics);
        prop_assert_eq!(&sequential.drops, &parallel.drops);
        for id in &program.borrows {
            prop_assert_eq!(sequential.ref_tag(*id), parallel.ref_tag(*id));
        }
    }
}
