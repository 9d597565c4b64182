//! Reference kind classification.
//!
//! Runs in two steps over a function's loan table.
//!
//! 1. **Resolution** picks a kind for every `Polymorphic` loan. A loan is
//!    `Shared` iff some other loan into overlapping storage is live at any
//!    point of its own live interval; otherwise it is `Own`. Loans reborrowed
//!    through a `Shared` or `Stable` reference inherit that capability.
//!    Effect-sourced loans are left to the lifetime unifier, which sees every
//!    occurrence of their operation.
//!
//! 2. **Enforcement** walks the body in evaluation order with an
//!    [`OwnershipTracker`], forking it at branches and walking loop bodies
//!    twice. It rejects second borrows of storage that already has a live
//!    owning reference, projections a capability does not allow, mutation
//!    through immutable references, and owning-parameter calls that receive
//!    aliased references. Checks that depend on a deferred kind are handed
//!    to the unifier as [`Demand`]s.
//!
//! Classification never downgrades: once a loan is `Own`, a later alias is
//! the error, at the later site.

use rustc_hash::{FxHashMap, FxHashSet};

use kiln_ir::Span;
use kiln_types::{Idx, Mutability, RefKind, RefType};

use crate::context::CheckCtx;
use crate::error::{BorrowckError, BorrowckErrorKind, IrError};
use crate::ir::{
    BindingMode, Block, Expr, ExprKind, Function, Place, Projection, ScopeId, Stmt, VarId,
};
use crate::layout::Layout;
use crate::loans::{Loan, LoanOrigin, LoanTable};
use crate::output::{DropKind, DropPoint};
use crate::ownership::{
    DropOutcome, LoanId, LoanRequest, OwnershipError, OwnershipTracker, StorageRoot,
};
use crate::place::{type_place, Crossing, PlaceInfo};
use crate::shape::ShapeAnalyzer;

/// Why a deferred loan must end up owning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DemandReason {
    /// Passed to an `&own` parameter.
    OwnParam,
    /// Passed to a `&stable` parameter.
    StableParam,
    /// Projected into shape-unstable interior.
    Projection(Crossing),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Demand {
    pub loan: LoanId,
    pub reason: DemandReason,
    pub span: Span,
}

#[derive(Clone, Debug, Default)]
pub struct RefKinds {
    /// Indexed by `LoanId::index()`; `None` until the unifier resolves it.
    pub kinds: Vec<Option<RefKind>>,
    /// For loans resolved `Shared` by overlap, one overlapping loan.
    pub witnesses: FxHashMap<LoanId, LoanId>,
}

impl RefKinds {
    pub fn kind(&self, id: LoanId) -> Option<RefKind> {
        self.kinds.get(id.index()).copied().flatten()
    }

    pub fn set(&mut self, id: LoanId, kind: RefKind) {
        if let Some(slot) = self.kinds.get_mut(id.index()) {
            *slot = Some(kind);
        }
    }
}

pub(crate) struct RefKindResult {
    pub kinds: RefKinds,
    pub demands: Vec<Demand>,
    pub drops: Vec<DropPoint>,
    pub errors: Vec<BorrowckError>,
}

/// Kind of the reference a binding of type `ty` holds, if it is one.
pub(crate) fn binding_ref(cx: &CheckCtx<'_>, func: &Function, var: VarId) -> Option<RefType> {
    func.local(var)
        .and_then(|l| cx.pool.ref_type(cx.pool.strip_named(l.ty)))
}

/// Resolve one loan, given the kinds of every loan created before it.
///
/// Returns `None` for effect-sourced `Polymorphic` loans (and reborrows
/// of them) that are still waiting on the unifier.
pub(crate) fn resolve_kind(
    cx: &CheckCtx<'_>,
    func: &Function,
    table: &LoanTable,
    kinds: &mut RefKinds,
    loan: &Loan,
) -> Option<RefKind> {
    if loan.declared != RefKind::Polymorphic {
        return Some(loan.declared);
    }
    if let Some(parent) = loan.parent {
        match kinds.kind(parent) {
            Some(k @ (RefKind::Shared | RefKind::Stable)) => return Some(k),
            Some(_) => {}
            None => return None,
        }
    } else {
        match loan.root {
            StorageRoot::External(_) => return None,
            StorageRoot::Param(base) => match binding_ref(cx, func, base).map(|r| r.kind) {
                Some(RefKind::Own) => {}
                Some(k @ (RefKind::Shared | RefKind::Stable)) => return Some(k),
                Some(RefKind::Polymorphic) | None => return Some(RefKind::Shared),
            },
            StorageRoot::Binding(_) => {}
        }
    }
    let witness = table
        .loans
        .iter()
        .find(|other| table.conflicting(loan, other));
    match witness {
        Some(other) => {
            kinds.witnesses.insert(loan.id, other.id);
            Some(RefKind::Shared)
        }
        None => Some(RefKind::Own),
    }
}

pub(crate) fn classify_refs(
    cx: &CheckCtx<'_>,
    func: &Function,
    layout: &Layout,
    table: &LoanTable,
) -> Result<RefKindResult, IrError> {
    let mut kinds = RefKinds {
        kinds: vec![None; table.loans.len()],
        witnesses: FxHashMap::default(),
    };
    for loan in &table.loans {
        if let Some(kind) = resolve_kind(cx, func, table, &mut kinds, loan) {
            kinds.set(loan.id, kind);
        }
    }

    let mut scope_vars: FxHashMap<ScopeId, Vec<VarId>> = FxHashMap::default();
    for var in func.var_ids() {
        if let Some(scope) = layout.binding(var).and_then(|b| b.scope) {
            scope_vars.entry(scope).or_default().push(var);
        }
    }

    let mut checker = Enforcer {
        cx,
        func,
        layout,
        table,
        kinds: &kinds,
        shapes: cx.shapes(),
        scope_vars,
        tracker: OwnershipTracker::new(),
        loop_exits: Vec::new(),
        demands: Vec::new(),
        drops: Vec::new(),
        errors: Vec::new(),
        seen_errors: FxHashSet::default(),
        seen_drops: FxHashSet::default(),
    };
    for &param in &func.params {
        checker.tracker.declare(param);
    }
    checker.block(&func.body)?;

    let resolved = kinds.kinds.iter().filter(|k| k.is_some()).count();
    tracing::debug!(
        function = func.name.raw(),
        loans = table.loans.len(),
        resolved,
        errors = checker.errors.len(),
        "classified references"
    );
    Ok(RefKindResult {
        demands: checker.demands,
        drops: checker.drops,
        errors: checker.errors,
        kinds,
    })
}

/// Capability of the reference an access goes through.
#[derive(Clone, Copy, Debug)]
struct Governing {
    /// Index of the governing step; `None` for the owner itself.
    step: Option<usize>,
    kind: RefKind,
    mutability: Mutability,
    /// A deferred loan the governing capability depends on.
    deferred: Option<LoanId>,
    span: Option<Span>,
}

struct Enforcer<'a, 'cx> {
    cx: &'a CheckCtx<'cx>,
    func: &'a Function,
    layout: &'a Layout,
    table: &'a LoanTable,
    kinds: &'a RefKinds,
    shapes: ShapeAnalyzer<'cx>,
    scope_vars: FxHashMap<ScopeId, Vec<VarId>>,
    tracker: OwnershipTracker,
    /// State at the `break`s of each enclosing loop, innermost last.
    loop_exits: Vec<Option<OwnershipTracker>>,
    demands: Vec<Demand>,
    drops: Vec<DropPoint>,
    errors: Vec<BorrowckError>,
    seen_errors: FxHashSet<(BorrowckErrorKind, Span)>,
    seen_drops: FxHashSet<(VarId, DropKind)>,
}

impl Enforcer<'_, '_> {
    fn report(&mut self, err: BorrowckError) {
        if self.seen_errors.insert((err.kind, err.span)) {
            self.errors.push(err);
        }
    }

    fn demand(&mut self, loan: LoanId, reason: DemandReason, span: Span) {
        let demand = Demand { loan, reason, span };
        if !self.demands.contains(&demand) {
            self.demands.push(demand);
        }
    }

    fn var_name(&self, var: VarId) -> &'static str {
        self.func
            .local(var)
            .map_or("<unknown>", |l| self.cx.name(l.name))
    }

    fn place_name(&self, place: &Place) -> String {
        let mut out = self.var_name(place.base).to_string();
        let last = place.projections.len();
        for (i, proj) in place.projections.iter().enumerate() {
            match proj {
                Projection::Deref => {
                    out = if i + 1 < last {
                        format!("(*{out})")
                    } else {
                        format!("*{out}")
                    };
                }
                Projection::Field(f) => out = format!("{out}.{f}"),
                Projection::Variant { variant, field } => {
                    out = format!("{out}#{variant}.{field}");
                }
                Projection::Index => out.push_str("[_]"),
            }
        }
        out
    }

    fn ownership_error(&mut self, err: OwnershipError, span: Span, what: &str) {
        let report = match err {
            OwnershipError::UseAfterMove {
                var,
                moved_at,
                maybe,
            } => {
                let name = self.var_name(var);
                let cause = if maybe {
                    format!("`{name}` moved here on some paths")
                } else {
                    format!("`{name}` moved here")
                };
                BorrowckError::new(
                    BorrowckErrorKind::UseAfterMove,
                    span,
                    format!("use of moved value `{name}`"),
                )
                .with_label("value used here after move")
                .with_cause(moved_at, cause)
            }
            OwnershipError::MoveWhileBorrowed { var, loan_span } => {
                let name = self.var_name(var);
                BorrowckError::new(
                    BorrowckErrorKind::AliasConflict,
                    span,
                    format!("cannot move out of `{name}` while it is borrowed"),
                )
                .with_label(format!("`{name}` moved here"))
                .with_cause(loan_span, format!("`{name}` borrowed here"))
            }
            OwnershipError::Conflict {
                existing_span,
                existing_unique,
            } => {
                let (cause, note) = if existing_unique {
                    (
                        "owning reference created here",
                        "an owning reference must be the only live reference to its target",
                    )
                } else {
                    (
                        "aliasing reference created here",
                        "an owning reference cannot coexist with other references to its target",
                    )
                };
                BorrowckError::new(
                    BorrowckErrorKind::AliasConflict,
                    span,
                    format!("cannot {what} while it is already borrowed"),
                )
                .with_label("conflicting access here")
                .with_cause(existing_span, cause)
                .with_note(note)
            }
        };
        self.report(report);
    }

    fn use_var(&mut self, var: VarId, span: Span) {
        if let Err(err) = self.tracker.use_var(var) {
            self.ownership_error(err, span, "use this value");
        }
    }

    /// Direct access to a binding's storage (not through a reference).
    fn access(&mut self, place: &Place, span: Span) {
        if let Err(err) = self.tracker.access(place.base, &place.projections) {
            let what = format!("use `{}`", self.place_name(place));
            self.ownership_error(err, span, &what);
        }
    }

    fn governing(&self, place: &Place, info: &PlaceInfo, parent: Option<LoanId>) -> Governing {
        let Some(step) = info.governing_ref() else {
            let mutable = self.func.local(place.base).is_some_and(|l| l.mutable);
            return Governing {
                step: None,
                kind: RefKind::Own,
                mutability: if mutable { Mutability::Mut } else { Mutability::Imm },
                deferred: None,
                span: None,
            };
        };
        let reference = info.steps[step].reference;
        let mutability = reference.map_or(Mutability::Imm, |r| r.mutability);
        let declared = reference.map_or(RefKind::Shared, |r| r.kind);

        if step == 0 {
            let held: Vec<LoanId> = match parent {
                Some(p) => vec![p],
                None => self.table.held_by(place.base).to_vec(),
            };
            if !held.is_empty() {
                let mut kind = RefKind::Own;
                let mut deferred = None;
                let mut span = None;
                for id in held {
                    let loan_span = self.table.get(id).map(|l| l.span);
                    match self.kinds.kind(id) {
                        Some(RefKind::Shared) => {
                            kind = RefKind::Shared;
                            span = loan_span;
                        }
                        Some(RefKind::Stable) if kind != RefKind::Shared => {
                            kind = RefKind::Stable;
                            span = loan_span;
                        }
                        None => deferred = Some(id),
                        _ => {}
                    }
                    if span.is_none() {
                        span = loan_span;
                    }
                }
                return Governing {
                    step: Some(step),
                    kind,
                    mutability,
                    deferred,
                    span,
                };
            }
        }
        Governing {
            step: Some(step),
            kind: if declared == RefKind::Polymorphic {
                RefKind::Shared
            } else {
                declared
            },
            mutability,
            deferred: None,
            span: None,
        }
    }

    // === Traversal ===

    fn block(&mut self, block: &Block) -> Result<(), IrError> {
        for stmt in &block.stmts {
            if self.tracker.is_unreachable() {
                break;
            }
            match stmt {
                Stmt::Let { var, init, .. } => {
                    self.expr(init)?;
                    self.tracker.declare(*var);
                }
                Stmt::Expr(expr) => self.expr(expr)?,
            }
        }
        if let Some(tail) = block.tail.as_deref().filter(|_| !self.tracker.is_unreachable()) {
            self.expr(tail)?;
        }
        self.exit_scope(block);
        Ok(())
    }

    fn exit_scope(&mut self, block: &Block) {
        let Some(vars) = self.scope_vars.get(&block.scope).cloned() else {
            return;
        };
        for var in vars {
            let Some(local) = self.func.local(var) else {
                continue;
            };
            let ty = self.cx.pool.strip_named(local.ty);
            if self.cx.pool.is_copyable(ty) || self.cx.pool.ref_type(ty).is_some() {
                continue;
            }
            let kind = match self.tracker.drop_var(var) {
                DropOutcome::Dropped => DropKind::ScopeExit(block.scope),
                DropOutcome::Moved => DropKind::Moved,
                DropOutcome::MaybeMoved => DropKind::Conditional(block.scope),
            };
            if self.seen_drops.insert((var, kind)) {
                self.drops.push(DropPoint {
                    function: self.func.name,
                    var,
                    kind,
                    span: block.span,
                });
            }
        }
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), IrError> {
        if let Some(range) = self.layout.expr_range(expr.id) {
            self.tracker.release_expired(range.start);
        }
        match &expr.kind {
            ExprKind::Literal | ExprKind::ResumeValue => {}
            ExprKind::Break => {
                if let Some(exit) = self.loop_exits.last_mut() {
                    match exit {
                        Some(state) => state.join(&self.tracker),
                        None => *exit = Some(self.tracker.clone()),
                    }
                }
                self.tracker.mark_unreachable();
            }
            ExprKind::Var(v) => {
                self.use_var(*v, expr.span);
                self.access(&Place::var(*v), expr.span);
            }
            ExprKind::Move(v) => {
                if let Err(err) = self.tracker.move_out(*v, expr.span) {
                    let what = format!("move `{}`", self.var_name(*v));
                    self.ownership_error(err, expr.span, &what);
                }
            }
            ExprKind::Read(place) => {
                self.use_var(place.base, expr.span);
                if place.projections.first() != Some(&Projection::Deref) {
                    self.access(place, expr.span);
                }
            }
            ExprKind::Borrow { place, .. } => {
                self.use_var(place.base, expr.span);
                if let Some(&id) = self.table.by_expr.get(&expr.id) {
                    self.borrow(id, place, expr.span)?;
                }
            }
            ExprKind::Assign { place, value } => {
                self.expr(value)?;
                self.assign(place, expr.span)?;
            }
            ExprKind::Construct { args } => {
                for arg in args {
                    self.expr(arg)?;
                }
            }
            ExprKind::Call { callee, args } => {
                for arg in args {
                    self.expr(arg)?;
                }
                let Some(target) = self.cx.module.function(*callee) else {
                    return Err(IrError::UnknownFunction {
                        callee: *callee,
                        span: expr.span,
                    });
                };
                let params: Vec<Idx> = target
                    .params
                    .iter()
                    .filter_map(|&p| target.local(p).map(|l| l.ty))
                    .collect();
                let what = format!("`{}`", self.cx.name(*callee));
                self.check_args(expr, &params, &what);
            }
            ExprKind::Perform { effect, op, args } => {
                for arg in args {
                    self.expr(arg)?;
                }
                if let Some(decl) = self.cx.module.op(*effect, *op) {
                    let params = decl.params.clone();
                    let what = format!("`{}`", self.cx.op_path(*effect, *op));
                    self.check_args(expr, &params, &what);
                }
            }
            ExprKind::Handle { body, handler } => {
                let entry = self.tracker.clone();
                self.block(body)?;
                for clause in &handler.clauses {
                    let after = std::mem::replace(&mut self.tracker, entry.clone());
                    for &param in &clause.params {
                        self.tracker.declare(param);
                    }
                    self.block(&clause.body)?;
                    let clause_state = std::mem::replace(&mut self.tracker, after);
                    self.tracker.join(&clause_state);
                }
            }
            ExprKind::Resume { value } => self.expr(value)?,
            ExprKind::Spawn { body } | ExprKind::Block(body) => self.block(body)?,
            ExprKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond)?;
                let entry = self.tracker.clone();
                self.block(then_block)?;
                let after_then = std::mem::replace(&mut self.tracker, entry);
                if let Some(else_block) = else_block {
                    self.block(else_block)?;
                }
                self.tracker.join(&after_then);
            }
            ExprKind::Match { scrutinee, arms } => {
                self.use_var(scrutinee.base, expr.span);
                if scrutinee.projections.first() != Some(&Projection::Deref) {
                    self.access(scrutinee, expr.span);
                }
                let entry = self.tracker.clone();
                let mut joined: Option<OwnershipTracker> = None;
                for arm in arms {
                    self.tracker = entry.clone();
                    for binding in &arm.bindings {
                        self.tracker.declare(binding.var);
                        match binding.mode {
                            BindingMode::Ref(_) => {
                                if let Some(&id) = self.table.by_binding.get(&binding.var) {
                                    let place =
                                        scrutinee.clone().variant(arm.variant, binding.field);
                                    self.borrow(id, &place, arm.span)?;
                                }
                            }
                            BindingMode::Move => {
                                let ty = self.func.local(binding.var).map(|l| l.ty);
                                let owned = scrutinee.projections.first() != Some(&Projection::Deref);
                                if owned && ty.is_some_and(|t| !self.cx.pool.is_copyable(t)) {
                                    if let Err(err) = self.tracker.move_out(scrutinee.base, arm.span)
                                    {
                                        let what =
                                            format!("move out of `{}`", self.place_name(scrutinee));
                                        self.ownership_error(err, arm.span, &what);
                                    }
                                }
                            }
                            BindingMode::Copy => {}
                        }
                    }
                    self.block(&arm.body)?;
                    match joined.as_mut() {
                        Some(state) => state.join(&self.tracker),
                        None => joined = Some(self.tracker.clone()),
                    }
                }
                self.tracker = joined.unwrap_or(entry);
            }
            ExprKind::Loop { body } => {
                self.loop_exits.push(None);
                self.block(body)?;
                if !self.tracker.is_unreachable() {
                    if let Some(range) = self.layout.expr_range(expr.id) {
                        self.tracker.release_created_within(range);
                    }
                    // Second pass: what the first iteration left behind.
                    self.block(body)?;
                }
                // Only a `break` leaves the loop.
                match self.loop_exits.pop().flatten() {
                    Some(exit) => self.tracker = exit,
                    None => self.tracker.mark_unreachable(),
                }
            }
            ExprKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value)?;
                }
                self.tracker.mark_unreachable();
            }
        }
        Ok(())
    }

    // === Checks ===

    fn borrow(&mut self, id: LoanId, place: &Place, span: Span) -> Result<(), IrError> {
        let Some(loan) = self.table.get(id) else {
            return Ok(());
        };
        let info = type_place(self.cx.pool, self.func, place, span)?;
        let gov = self.governing(place, &info, loan.parent);
        let kind = self.kinds.kind(id);
        let place_name = self.place_name(place);

        if loan.mutability.is_mut() && !gov.mutability.is_mut() {
            let err = match gov.step {
                None => BorrowckError::new(
                    BorrowckErrorKind::ImmutableMutation,
                    span,
                    format!(
                        "cannot borrow `{place_name}` as mutable, as `{}` is not declared as mutable",
                        self.var_name(place.base)
                    ),
                )
                .with_label("mutable borrow of immutable binding"),
                Some(_) => BorrowckError::new(
                    BorrowckErrorKind::ImmutableMutation,
                    span,
                    format!("cannot borrow `{place_name}` as mutable through an immutable reference"),
                )
                .with_label("mutable borrow here"),
            };
            self.report(err);
        }

        if loan.declared == RefKind::Own && matches!(gov.kind, RefKind::Shared | RefKind::Stable) {
            let mut err = BorrowckError::new(
                BorrowckErrorKind::AliasConflict,
                span,
                format!(
                    "cannot take an owning reference to `{place_name}` through a {} reference",
                    gov.kind
                ),
            )
            .with_label("owning reference requested here");
            if let Some(gspan) = gov.span {
                err = err.with_cause(gspan, format!("{} reference created here", gov.kind));
            }
            self.report(err);
        }

        if let Some(crossing) = info.unstable_after(gov.step) {
            self.check_projection(loan, kind, &gov, crossing, &place_name, span);
        }

        if matches!(loan.origin, LoanOrigin::Borrow | LoanOrigin::ArmBinding(_)) {
            let req = LoanRequest {
                id,
                root: loan.root,
                path: &loan.path,
                ancestors: &loan.ancestors,
                start: loan.start,
                end: loan.end,
                span: loan.span,
            };
            let result = if kind == Some(RefKind::Own) {
                self.tracker.borrow_unique(req)
            } else {
                self.tracker.borrow_shared(req)
            };
            if let Err(err) = result {
                let what = format!("borrow `{place_name}`");
                self.ownership_error(err, span, &what);
            }
        }
        Ok(())
    }

    fn check_projection(
        &mut self,
        loan: &Loan,
        kind: Option<RefKind>,
        gov: &Governing,
        crossing: Crossing,
        place_name: &str,
        span: Span,
    ) {
        if let Some(deferred) = gov.deferred {
            self.demand(deferred, DemandReason::Projection(crossing), span);
        }
        if !gov.kind.can_project_unstable() {
            let mut err = BorrowckError::new(
                BorrowckErrorKind::ShapeProjection,
                span,
                format!(
                    "cannot borrow `{place_name}`: projecting {} requires an owning or stable reference",
                    crossing.describe()
                ),
            )
            .with_label(format!("projection through a {} reference", gov.kind))
            .with_note(
                "a shared reference may be aliased; mutation through an alias could invalidate this interior reference",
            );
            if let Some(gspan) = gov.span {
                err = err.with_cause(gspan, format!("{} reference created here", gov.kind));
            }
            self.report(err);
            return;
        }
        match kind {
            Some(RefKind::Shared) if loan.declared == RefKind::Polymorphic => {
                let mut err = BorrowckError::new(
                    BorrowckErrorKind::AliasConflict,
                    span,
                    format!(
                        "borrowing `{place_name}` needs an owning reference, but the storage is aliased"
                    ),
                )
                .with_label(format!("borrow {} here", crossing.describe()));
                if let Some(witness) = self
                    .kinds
                    .witnesses
                    .get(&loan.id)
                    .and_then(|w| self.table.get(*w))
                {
                    err = err.with_cause(witness.span, "overlapping reference created here");
                }
                self.report(err);
            }
            Some(RefKind::Shared) => {
                self.report(
                    BorrowckError::new(
                        BorrowckErrorKind::ShapeProjection,
                        span,
                        format!(
                            "a shared reference cannot point {}",
                            crossing.describe()
                        ),
                    )
                    .with_label(format!("shared borrow of `{place_name}`"))
                    .with_note("borrow it as owning or stable instead"),
                );
            }
            None => self.demand(loan.id, DemandReason::Projection(crossing), span),
            Some(_) => {}
        }
    }

    fn assign(&mut self, place: &Place, span: Span) -> Result<(), IrError> {
        let place_name = self.place_name(place);
        if place.is_whole_binding() {
            let mutable = self.func.local(place.base).is_some_and(|l| l.mutable);
            if !mutable {
                self.report(
                    BorrowckError::new(
                        BorrowckErrorKind::ImmutableMutation,
                        span,
                        format!("cannot assign twice to immutable binding `{place_name}`"),
                    )
                    .with_label("cannot assign twice"),
                );
            }
            if let Err(err) = self.tracker.access(place.base, &[]) {
                if !matches!(err, OwnershipError::UseAfterMove { .. }) {
                    let what = format!("assign to `{place_name}`");
                    self.ownership_error(err, span, &what);
                }
            }
            self.tracker.assign(place.base);
            return Ok(());
        }

        self.use_var(place.base, span);
        let info = type_place(self.cx.pool, self.func, place, span)?;
        let gov = self.governing(place, &info, None);
        if gov.step.is_none() {
            self.access(place, span);
        }

        if !gov.mutability.is_mut() {
            let message = match gov.step {
                None => format!(
                    "cannot assign to `{place_name}`, as `{}` is not declared as mutable",
                    self.var_name(place.base)
                ),
                Some(_) => format!("cannot assign to `{place_name}` through an immutable reference"),
            };
            self.report(
                BorrowckError::new(BorrowckErrorKind::ImmutableMutation, span, message)
                    .with_label("assignment here"),
            );
        }

        if let Some(crossing) = info.unstable_after(gov.step) {
            if let Some(deferred) = gov.deferred {
                self.demand(deferred, DemandReason::Projection(crossing), span);
            }
            if !gov.kind.can_project_unstable() {
                self.report(
                    BorrowckError::new(
                        BorrowckErrorKind::ShapeProjection,
                        span,
                        format!(
                            "cannot assign to `{place_name}`: projecting {} requires an owning or stable reference",
                            crossing.describe()
                        ),
                    )
                    .with_label(format!("write through a {} reference", gov.kind)),
                );
            }
        }

        if gov.kind == RefKind::Stable && !self.shapes.is_stable(info.ty) {
            let mut err = BorrowckError::new(
                BorrowckErrorKind::ShapeProjection,
                span,
                format!(
                    "cannot assign to `{place_name}` through a stable reference: `{}` is not shape-stable",
                    self.cx.ty(info.ty)
                ),
            )
            .with_label("shape-changing write here")
            .with_note(
                "a stable reference allows any projection, so writes through it must preserve the shape of the value",
            );
            if let Some(gspan) = gov.span {
                err = err.with_cause(gspan, "stable reference created here");
            }
            self.report(err);
        }
        Ok(())
    }

    /// Check reference arguments against the capabilities the callee asks for.
    fn check_args(&mut self, call: &Expr, params: &[Idx], what: &str) {
        let pool = self.cx.pool;
        let args: &[Expr] = match &call.kind {
            ExprKind::Call { args, .. } | ExprKind::Perform { args, .. } => args,
            _ => return,
        };
        for (i, (arg, &param_ty)) in args.iter().zip(params).enumerate() {
            let Some(param) = pool.ref_type(pool.strip_named(param_ty)) else {
                continue;
            };
            let i = u32::try_from(i).unwrap_or(u32::MAX);
            let loans: Vec<LoanId> = self.table.arg(call.id, i).to_vec();
            if loans.is_empty() {
                // A reference with no loan in this function: its type is
                // all we know.
                if let Some(r) = pool.ref_type(pool.strip_named(arg.ty)) {
                    let kind = if r.kind == RefKind::Polymorphic {
                        RefKind::Shared
                    } else {
                        r.kind
                    };
                    self.check_arg_kind(call, what, param, Some(kind), r.mutability, None, arg.span);
                }
                continue;
            }
            for id in loans {
                let Some(loan) = self.table.get(id) else {
                    continue;
                };
                let kind = self.kinds.kind(id);
                self.check_arg_kind(call, what, param, kind, loan.mutability, Some(loan), arg.span);
            }
        }
    }

    #[expect(clippy::too_many_arguments, reason = "argument check needs the call and the loan")]
    fn check_arg_kind(
        &mut self,
        call: &Expr,
        what: &str,
        param: RefType,
        kind: Option<RefKind>,
        mutability: Mutability,
        loan: Option<&Loan>,
        arg_span: Span,
    ) {
        let with_origin = |mut err: BorrowckError, this: &Self| {
            if let Some(loan) = loan {
                err = err.with_cause(loan.span, "reference created here");
                if let Some(w) = this.kinds.witnesses.get(&loan.id).and_then(|w| this.table.get(*w)) {
                    err = err.with_cause(w.span, "aliased by this reference");
                }
            }
            err.with_cause(arg_span, "passed here")
        };

        if param.mutability.is_mut() && !mutability.is_mut() {
            let err = BorrowckError::new(
                BorrowckErrorKind::ImmutableMutation,
                call.span,
                format!("{what} expects a mutable reference, but this argument is immutable"),
            )
            .with_label("mutable reference required here");
            let err = with_origin(err, self);
            self.report(err);
        }

        match (param.kind, kind) {
            (RefKind::Own, None) => {
                if let Some(loan) = loan {
                    self.demand(loan.id, DemandReason::OwnParam, call.span);
                }
            }
            (RefKind::Stable, None) => {
                if let Some(loan) = loan {
                    self.demand(loan.id, DemandReason::StableParam, call.span);
                }
            }
            (RefKind::Own, Some(RefKind::Shared)) => {
                let err = BorrowckError::new(
                    BorrowckErrorKind::AliasConflict,
                    call.span,
                    format!("{what} requires an owning reference, but this argument is aliased"),
                )
                .with_label("owning reference required here")
                .with_note("shared references are never implicitly upgraded or cloned");
                let err = with_origin(err, self);
                self.report(err);
            }
            (RefKind::Own, Some(RefKind::Stable)) => {
                let err = BorrowckError::new(
                    BorrowckErrorKind::ShapeProjection,
                    call.span,
                    format!("{what} requires an owning reference, but this argument is stable"),
                )
                .with_label("owning reference required here")
                .with_note("a stable reference only permits shape-preserving mutation");
                let err = with_origin(err, self);
                self.report(err);
            }
            (RefKind::Stable, Some(RefKind::Shared)) => {
                let err = BorrowckError::new(
                    BorrowckErrorKind::ShapeProjection,
                    call.span,
                    format!("{what} requires a stable reference, but this argument is shared"),
                )
                .with_label("stable reference required here")
                .with_note("a shared reference may only project into shape-stable interior");
                let err = with_origin(err, self);
                self.report(err);
            }
            (RefKind::Shared | RefKind::Polymorphic, Some(RefKind::Stable))
                if param.mutability.is_mut() && !self.shapes.is_stable(param.target) =>
            {
                let err = BorrowckError::new(
                    BorrowckErrorKind::ShapeProjection,
                    call.span,
                    format!(
                        "{what} may change the shape of `{}`, but this argument is a stable reference",
                        self.cx.ty(param.target)
                    ),
                )
                .with_label("shape-changing access here");
                let err = with_origin(err, self);
                self.report(err);
            }
            _ => {}
        }
    }
}
