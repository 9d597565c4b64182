//! Loan collection.
//!
//! A loan is one reference value created at one program point: a `&place`
//! borrow, a by-reference match binding, or a reference handed back by an
//! effect operation or a call. This pass finds every loan in a function,
//! works out which storage it points into, and follows the reference value
//! through bindings, calls and aggregates to find how long it stays live.
//!
//! # Live intervals
//!
//! A loan is live from the point it is created until the last point its
//! value is consumed (stored, passed, returned) or read back from any
//! binding holding it. A reborrow keeps the loan it was derived from alive
//! for at least as long as itself. A loan that is returned lives until the
//! end of the function.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use kiln_ir::{Name, Span};
use kiln_types::{Idx, Mutability, RefKind};

use crate::context::CheckCtx;
use crate::error::IrError;
use crate::handlers::HandlerFacts;
use crate::ir::{
    BindingMode, Block, EffectId, Expr, ExprId, ExprKind, Function, OpId, Place, Projection,
    Stmt, VarId,
};
use crate::layout::{Layout, Pos, PosRange};
use crate::ownership::{LoanId, StorageRoot};
use crate::place::holds_reference;
use crate::summary::{ReturnSource, Summaries};

/// Loans carried by one value.
pub type Carried = SmallVec<[LoanId; 2]>;

struct Located {
    root: StorageRoot,
    path: SmallVec<[Projection; 4]>,
    parent: Option<LoanId>,
    ancestors: SmallVec<[LoanId; 2]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoanOrigin {
    /// `&place`.
    Borrow,
    /// By-reference match binding.
    ArmBinding(VarId),
    /// Result of `perform effect.op`.
    Effect { effect: EffectId, op: OpId },
    /// Result of calling a function whose returned reference comes from an
    /// effect operation it leaves unhandled.
    CallEffect {
        callee: Name,
        effect: EffectId,
        op: OpId,
    },
}

impl LoanOrigin {
    pub fn effect_op(self) -> Option<(EffectId, OpId)> {
        match self {
            LoanOrigin::Effect { effect, op } | LoanOrigin::CallEffect { effect, op, .. } => {
                Some((effect, op))
            }
            LoanOrigin::Borrow | LoanOrigin::ArmBinding(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Loan {
    pub id: LoanId,
    /// Creating expression; the `match` for arm bindings.
    pub expr: ExprId,
    pub origin: LoanOrigin,
    pub root: StorageRoot,
    pub path: SmallVec<[Projection; 4]>,
    pub parent: Option<LoanId>,
    /// Every loan this one was transitively reborrowed from.
    pub ancestors: SmallVec<[LoanId; 2]>,
    /// Kind written in the reference type.
    pub declared: RefKind,
    pub mutability: Mutability,
    pub target: Idx,
    pub start: Pos,
    pub end: Pos,
    /// Bindings that hold the reference at some point.
    pub holders: SmallVec<[VarId; 2]>,
    pub returned: bool,
    pub span: Span,
}

impl Loan {
    pub fn interval(&self) -> PosRange {
        PosRange::new(self.start, self.end)
    }

    pub fn derives_from(&self, other: LoanId) -> bool {
        self.ancestors.contains(&other)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoanTable {
    pub loans: Vec<Loan>,
    /// Borrow, perform and call expressions that create a loan.
    pub by_expr: FxHashMap<ExprId, LoanId>,
    /// By-reference arm bindings.
    pub by_binding: FxHashMap<VarId, LoanId>,
    /// Loans carried by each argument of a call or perform.
    pub args: FxHashMap<(ExprId, u32), Carried>,
    /// Loans carried by the value of each expression, where non-empty.
    pub carried: FxHashMap<ExprId, Carried>,
    /// Every loan each binding holds at some point.
    pub holds: FxHashMap<VarId, Carried>,
}

impl LoanTable {
    pub fn get(&self, id: LoanId) -> Option<&Loan> {
        self.loans.get(id.index())
    }

    pub fn arg(&self, expr: ExprId, index: u32) -> &[LoanId] {
        self.args.get(&(expr, index)).map_or(&[], |c| c.as_slice())
    }

    pub fn held_by(&self, var: VarId) -> &[LoanId] {
        self.holds.get(&var).map_or(&[], |c| c.as_slice())
    }

    /// Whether `a` and `b` may point at the same memory at the same time,
    /// not counting reborrow chains.
    pub fn conflicting(&self, a: &Loan, b: &Loan) -> bool {
        a.id != b.id
            && a.root == b.root
            && !a.derives_from(b.id)
            && !b.derives_from(a.id)
            && crate::ir::paths_overlap(&a.path, &b.path)
            && a.interval().overlaps(b.interval())
    }
}

pub(crate) fn collect_loans(
    cx: &CheckCtx<'_>,
    func: &Function,
    layout: &Layout,
    handlers: &HandlerFacts,
    summaries: &Summaries,
) -> Result<LoanTable, IrError> {
    let mut collector = LoanCollector {
        cx,
        func,
        layout,
        handlers,
        summaries,
        table: LoanTable::default(),
        current: FxHashMap::default(),
    };
    let tail = collector.block(&func.body)?;
    let end = layout.body.end;
    for &id in &tail {
        collector.mark_returned(id);
    }
    collector.extend_all(&tail, end);
    collector.finish();

    tracing::debug!(
        function = func.name.raw(),
        loans = collector.table.loans.len(),
        "collected loans"
    );
    Ok(collector.table)
}

struct LoanCollector<'a, 'cx> {
    cx: &'a CheckCtx<'cx>,
    func: &'a Function,
    layout: &'a Layout,
    handlers: &'a HandlerFacts,
    summaries: &'a Summaries,
    table: LoanTable,
    /// Loans each binding holds at the current point.
    current: FxHashMap<VarId, Carried>,
}

impl LoanCollector<'_, '_> {
    fn exit_of(&self, expr: &Expr) -> Pos {
        self.layout.expr_range(expr.id).map_or(Pos::default(), |r| r.end)
    }

    fn extend_all(&mut self, carried: &[LoanId], pos: Pos) {
        for &id in carried {
            if let Some(loan) = self.table.loans.get_mut(id.index()) {
                loan.end = loan.end.max(pos);
            }
        }
    }

    fn mark_returned(&mut self, id: LoanId) {
        if let Some(loan) = self.table.loans.get_mut(id.index()) {
            loan.returned = true;
        }
    }

    /// `var` now holds exactly `carried`.
    fn bind(&mut self, var: VarId, carried: Carried) {
        for &id in &carried {
            if let Some(loan) = self.table.loans.get_mut(id.index()) {
                if !loan.holders.contains(&var) {
                    loan.holders.push(var);
                }
            }
            let all = self.table.holds.entry(var).or_default();
            if !all.contains(&id) {
                all.push(id);
            }
        }
        self.current.insert(var, carried);
    }

    fn current(&self, var: VarId) -> Carried {
        self.current.get(&var).cloned().unwrap_or_default()
    }

    fn ref_parts(&self, ty: Idx, expr: &Expr) -> Result<(RefKind, Mutability, Idx), IrError> {
        let pool = self.cx.pool;
        pool.ref_type(pool.strip_named(ty))
            .map(|r| (r.kind, r.mutability, r.target))
            .ok_or(IrError::NotAReference {
                expr: expr.id,
                span: expr.span,
            })
    }

    fn new_loan(&mut self, loan: Loan) -> LoanId {
        let id = loan.id;
        self.table.loans.push(loan);
        id
    }

    fn next_id(&self) -> LoanId {
        LoanId::new(u32::try_from(self.table.loans.len()).unwrap_or(u32::MAX))
    }

    /// Storage, path and ancestry of a reference to `place`.
    fn locate(&self, place: &Place) -> Located {
        if place.projections.first() != Some(&Projection::Deref) {
            return Located {
                root: StorageRoot::Binding(place.base),
                path: place.projections.iter().copied().collect(),
                parent: None,
                ancestors: SmallVec::new(),
            };
        }
        let rest = &place.projections[1..];
        let parents = self.current(place.base);
        let Some(parent) = parents.first().and_then(|&id| self.table.get(id)) else {
            return Located {
                root: StorageRoot::Param(place.base),
                path: rest.iter().copied().collect(),
                parent: None,
                ancestors: SmallVec::new(),
            };
        };
        let mut path = parent.path.clone();
        path.extend(rest.iter().copied());
        let mut ancestors = parent.ancestors.clone();
        for &p in &parents {
            if !ancestors.contains(&p) {
                ancestors.push(p);
            }
        }
        Located {
            root: parent.root,
            path,
            parent: Some(parent.id),
            ancestors,
        }
    }

    fn place_loan(
        &mut self,
        place: &Place,
        ref_ty: Idx,
        origin: LoanOrigin,
        expr: &Expr,
        start: Pos,
        span: Span,
    ) -> Result<LoanId, IrError> {
        let (declared, mutability, target) = self.ref_parts(ref_ty, expr)?;
        let located = self.locate(place);
        let id = self.next_id();
        Ok(self.new_loan(Loan {
            id,
            expr: expr.id,
            origin,
            root: located.root,
            path: located.path,
            parent: located.parent,
            ancestors: located.ancestors,
            declared,
            mutability,
            target,
            start,
            end: start,
            holders: SmallVec::new(),
            returned: false,
            span,
        }))
    }

    fn external_loan(&mut self, expr: &Expr, origin: LoanOrigin) -> Result<LoanId, IrError> {
        let (declared, mutability, target) = self.ref_parts(expr.ty, expr)?;
        let start = self.exit_of(expr);
        let id = self.next_id();
        Ok(self.new_loan(Loan {
            id,
            expr: expr.id,
            origin,
            root: StorageRoot::External(expr.id),
            path: SmallVec::new(),
            parent: None,
            ancestors: SmallVec::new(),
            declared,
            mutability,
            target,
            start,
            end: start,
            holders: SmallVec::new(),
            returned: false,
            span: expr.span,
        }))
    }

    fn block(&mut self, block: &Block) -> Result<Carried, IrError> {
        for stmt in &block.stmts {
            match stmt {
                Stmt::Let { var, init, .. } => {
                    let carried = self.expr(init)?;
                    self.bind(*var, carried);
                }
                Stmt::Expr(expr) => {
                    self.expr(expr)?;
                }
            }
        }
        match &block.tail {
            Some(tail) => self.expr(tail),
            None => Ok(Carried::new()),
        }
    }

    fn expr(&mut self, expr: &Expr) -> Result<Carried, IrError> {
        let carried = self.expr_kind(expr)?;
        if !carried.is_empty() {
            self.table.carried.insert(expr.id, carried.clone());
        }
        Ok(carried)
    }

    fn expr_kind(&mut self, expr: &Expr) -> Result<Carried, IrError> {
        let exit = self.exit_of(expr);
        let carries_refs = holds_reference(self.cx.pool, expr.ty);
        let carried = match &expr.kind {
            ExprKind::Literal | ExprKind::ResumeValue | ExprKind::Break => Carried::new(),
            ExprKind::Var(v) | ExprKind::Move(v) => {
                if carries_refs {
                    self.current(*v)
                } else {
                    Carried::new()
                }
            }
            ExprKind::Read(place) => {
                if carries_refs {
                    self.current(place.base)
                } else {
                    Carried::new()
                }
            }
            ExprKind::Borrow { place, .. } => {
                let id = self.place_loan(
                    place,
                    expr.ty,
                    LoanOrigin::Borrow,
                    expr,
                    exit,
                    expr.span,
                )?;
                self.table.by_expr.insert(expr.id, id);
                [id].into_iter().collect()
            }
            ExprKind::Assign { place, value } => {
                let carried = self.expr(value)?;
                self.extend_all(&carried, exit);
                if place.is_whole_binding() {
                    self.bind(place.base, carried);
                } else if !carried.is_empty() {
                    let mut merged = self.current(place.base);
                    merged.extend(carried);
                    self.bind(place.base, merged);
                }
                Carried::new()
            }
            ExprKind::Construct { args } => {
                let mut out = Carried::new();
                for arg in args {
                    let carried = self.expr(arg)?;
                    self.extend_all(&carried, exit);
                    out.extend(carried);
                }
                out
            }
            ExprKind::Call { callee, args } => {
                let mut arg_loans = Vec::with_capacity(args.len());
                for (i, arg) in args.iter().enumerate() {
                    let carried = self.expr(arg)?;
                    self.extend_all(&carried, exit);
                    let i = u32::try_from(i).unwrap_or(u32::MAX);
                    if !carried.is_empty() {
                        self.table.args.insert((expr.id, i), carried.clone());
                    }
                    arg_loans.push(carried);
                }
                let returns = self
                    .summaries
                    .get(callee)
                    .map_or(ReturnSource::None, |s| s.returns);
                match returns {
                    ReturnSource::None => Carried::new(),
                    ReturnSource::Param(i) => arg_loans.get(i as usize).cloned().unwrap_or_default(),
                    ReturnSource::Effect { effect, op } => {
                        if self.cx.pool.ref_type(self.cx.pool.strip_named(expr.ty)).is_none() {
                            Carried::new()
                        } else {
                            let origin = LoanOrigin::CallEffect {
                                callee: *callee,
                                effect,
                                op,
                            };
                            let id = self.external_loan(expr, origin)?;
                            self.table.by_expr.insert(expr.id, id);
                            [id].into_iter().collect()
                        }
                    }
                }
            }
            ExprKind::Perform { effect, op, args } => {
                for (i, arg) in args.iter().enumerate() {
                    let carried = self.expr(arg)?;
                    self.extend_all(&carried, exit);
                    let i = u32::try_from(i).unwrap_or(u32::MAX);
                    if !carried.is_empty() {
                        self.table.args.insert((expr.id, i), carried);
                    }
                }
                if self.cx.pool.ref_type(self.cx.pool.strip_named(expr.ty)).is_some() {
                    let origin = LoanOrigin::Effect {
                        effect: *effect,
                        op: *op,
                    };
                    let id = self.external_loan(expr, origin)?;
                    self.table.by_expr.insert(expr.id, id);
                    [id].into_iter().collect()
                } else {
                    Carried::new()
                }
            }
            ExprKind::Handle { body, handler } => {
                let mut out = self.block(body)?;
                for clause in &handler.clauses {
                    for (i, &param) in clause.params.iter().enumerate() {
                        let i = u32::try_from(i).unwrap_or(u32::MAX);
                        let mut incoming = Carried::new();
                        for site in self.handlers.sites_for(handler.id, clause.op) {
                            incoming.extend(self.table.arg(site.expr, i).iter().copied());
                        }
                        self.bind(param, incoming);
                    }
                    out.extend(self.block(&clause.body)?);
                }
                self.extend_all(&out, exit);
                out
            }
            ExprKind::Resume { value } => {
                let carried = self.expr(value)?;
                self.extend_all(&carried, exit);
                Carried::new()
            }
            ExprKind::Spawn { body } | ExprKind::Loop { body } => {
                self.block(body)?;
                Carried::new()
            }
            ExprKind::Block(body) => {
                let carried = self.block(body)?;
                self.extend_all(&carried, exit);
                carried
            }
            ExprKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond)?;
                let mut out = self.block(then_block)?;
                if let Some(else_block) = else_block {
                    out.extend(self.block(else_block)?);
                }
                self.extend_all(&out, exit);
                out
            }
            ExprKind::Match { scrutinee, arms } => {
                let mut out = Carried::new();
                for arm in arms {
                    let enter = self
                        .layout
                        .scope_range(arm.body.scope)
                        .map_or(exit, |r| r.start);
                    for binding in &arm.bindings {
                        let Some(local) = self.func.local(binding.var) else {
                            return Err(IrError::UnknownVar {
                                var: binding.var,
                                span: arm.span,
                            });
                        };
                        let ty = local.ty;
                        match binding.mode {
                            BindingMode::Ref(_) => {
                                let place = scrutinee.clone().variant(arm.variant, binding.field);
                                let origin = LoanOrigin::ArmBinding(binding.var);
                                let id = self.place_loan(
                                    &place,
                                    ty,
                                    origin,
                                    expr,
                                    enter,
                                    arm.span,
                                )?;
                                self.table.by_binding.insert(binding.var, id);
                                self.bind(binding.var, [id].into_iter().collect());
                            }
                            BindingMode::Copy | BindingMode::Move => {
                                if holds_reference(self.cx.pool, ty) {
                                    let carried = self.current(scrutinee.base);
                                    self.bind(binding.var, carried);
                                }
                            }
                        }
                    }
                    out.extend(self.block(&arm.body)?);
                }
                self.extend_all(&out, exit);
                out
            }
            ExprKind::Return(value) => {
                if let Some(value) = value {
                    let carried = self.expr(value)?;
                    for &id in &carried {
                        self.mark_returned(id);
                    }
                }
                Carried::new()
            }
        };
        Ok(dedup(carried))
    }

    fn finish(&mut self) {
        let body_end = self.layout.body.end;
        for loan in &mut self.table.loans {
            for &holder in &loan.holders {
                loan.end = loan.end.max(self.layout.live_end(holder));
            }
            if loan.returned {
                loan.end = body_end;
            }
        }
        // Reborrows are created after their parents, so one backward sweep
        // propagates ends up every chain.
        for i in (0..self.table.loans.len()).rev() {
            let (end, ancestors) = {
                let loan = &self.table.loans[i];
                (loan.end, loan.ancestors.clone())
            };
            for a in ancestors {
                if let Some(anc) = self.table.loans.get_mut(a.index()) {
                    anc.end = anc.end.max(end);
                }
            }
        }
    }
}

fn dedup(mut carried: Carried) -> Carried {
    carried.sort_unstable();
    carried.dedup();
    carried
}
