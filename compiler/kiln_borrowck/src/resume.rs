//! Resume multiplicity and continuation capture sets.
//!
//! For every handler clause this pass counts how often the clause's
//! continuation may be resumed on one path, infers a multiplicity from that
//! count, and checks it against the operation's declared contract. It then
//! computes what the continuation captures from the suspended computation
//! at each `perform` site the clause handles.
//!
//! # Counting
//!
//! Counts are upper bounds per path: a sequence adds, a branch takes the
//! larger side, and a loop around a `resume` makes the count unbounded. A
//! `resume` inside `spawn` may run concurrently with the clause; a
//! first-class `resume` value escapes the clause and may be called any
//! number of times.
//!
//! # Captures
//!
//! A binding is captured when it is visible at the suspension point,
//! declared before it, and used again inside the handled computation after
//! it (or anywhere in a loop around it, which re-executes). Bindings
//! declared inside the handled computation are captured by value, as are
//! outer bindings the continuation moves; the rest are captured by
//! reference.

use rustc_hash::{FxHashMap, FxHashSet};

use kiln_ir::Span;

use crate::context::CheckCtx;
use crate::error::{BorrowckError, BorrowckErrorKind};
use crate::handlers::{HandlerFacts, PerformSite};
use crate::ir::{
    Block, Clause, Expr, ExprId, ExprKind, Function, Handler, HandlerId, Multiplicity, OpId,
    ScopeId, Stmt, VarId,
};
use crate::layout::{Layout, Pos, PosRange, UseKind};
use crate::loans::LoanTable;
use crate::output::{
    Capture, CaptureMode, ContinuationInfo, ContinuationKey, DropKind, DropPoint, Region,
};
use crate::ownership::StorageRoot;
use crate::send::SendAnalyzer;

const UNBOUNDED: u32 = u32::MAX;

/// Upper bound on the resumes of one clause along a single path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResumeCount {
    /// Over every path, including ones that already left the clause.
    pub max: u32,
    /// Over the paths still running; `None` when all of them have returned
    /// or broken out.
    pub through: Option<u32>,
    /// Over the paths that broke out of the innermost enclosing loop.
    pub broke: Option<u32>,
    /// First resume on the path.
    pub first: Option<Span>,
    /// A resume that may run after another one.
    pub repeat: Option<Span>,
    /// A resume that may run concurrently with the clause.
    pub concurrent: Option<Span>,
    /// A resume inside a loop.
    pub looped: Option<Span>,
}

impl Default for ResumeCount {
    fn default() -> Self {
        ResumeCount {
            max: 0,
            through: Some(0),
            broke: None,
            first: None,
            repeat: None,
            concurrent: None,
            looped: None,
        }
    }
}

fn max_opt(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl ResumeCount {
    /// No path reaches this point.
    fn unreachable() -> Self {
        ResumeCount {
            through: None,
            ..Self::default()
        }
    }

    fn broken() -> Self {
        ResumeCount {
            broke: Some(0),
            ..Self::unreachable()
        }
    }

    fn single(span: Span) -> Self {
        ResumeCount {
            max: 1,
            through: Some(1),
            first: Some(span),
            ..Self::default()
        }
    }

    fn escaping(span: Span) -> Self {
        ResumeCount {
            max: UNBOUNDED,
            through: Some(UNBOUNDED),
            first: Some(span),
            repeat: Some(span),
            ..Self::default()
        }
    }

    fn then(self, next: Self) -> Self {
        let Some(so_far) = self.through else {
            return self;
        };
        ResumeCount {
            max: self.max.max(so_far.saturating_add(next.max)),
            through: next.through.map(|n| so_far.saturating_add(n)),
            broke: max_opt(self.broke, next.broke.map(|n| so_far.saturating_add(n))),
            first: self.first.or(next.first),
            repeat: self
                .repeat
                .or(next.repeat)
                .or(if so_far > 0 { next.first } else { None }),
            concurrent: self.concurrent.or(next.concurrent),
            looped: self.looped.or(next.looped),
        }
    }

    fn either(self, other: Self) -> Self {
        ResumeCount {
            max: self.max.max(other.max),
            through: max_opt(self.through, other.through),
            broke: max_opt(self.broke, other.broke),
            first: self.first.or(other.first),
            repeat: self.repeat.or(other.repeat),
            concurrent: self.concurrent.or(other.concurrent),
            looped: self.looped.or(other.looped),
        }
    }

    /// A loop around `self`. Iterations that fall through run the body
    /// again; the loop is left only by `break`.
    fn repeated(self) -> Self {
        let reenters = self.through.is_some_and(|n| n > 0);
        if !reenters {
            return ResumeCount {
                through: self.broke,
                broke: None,
                ..self
            };
        }
        ResumeCount {
            max: UNBOUNDED,
            through: self.broke.map(|_| UNBOUNDED),
            broke: None,
            repeat: self.repeat.or(self.first),
            looped: self.looped.or(self.first),
            ..self
        }
    }

    /// The spawned body runs on its own; its exits do not leave the clause.
    fn spawned(self) -> Self {
        ResumeCount {
            through: Some(self.max),
            broke: None,
            concurrent: self.concurrent.or(self.first),
            ..self
        }
    }

    pub(crate) fn multiplicity(&self) -> Multiplicity {
        if self.concurrent.is_some() {
            Multiplicity::Many
        } else if self.max >= 2 {
            Multiplicity::Mut
        } else {
            Multiplicity::Once
        }
    }
}

/// One continuation, plus what later phases need beyond the public info.
#[derive(Clone, Debug)]
pub(crate) struct ContinuationFacts {
    pub info: ContinuationInfo,
    /// Scope of the handled computation.
    pub body_scope: ScopeId,
    /// Captures a live reference held by another capture points into;
    /// moving them to the heap would leave that reference dangling.
    pub pinned: FxHashSet<VarId>,
    pub resumed_in_loop: Option<Span>,
}

pub(crate) struct ResumeResult {
    pub continuations: Vec<ContinuationFacts>,
    pub drops: Vec<DropPoint>,
    pub errors: Vec<BorrowckError>,
}

pub(crate) fn classify_resumes(
    cx: &CheckCtx<'_>,
    func: &Function,
    layout: &Layout,
    handlers: &HandlerFacts,
    table: &LoanTable,
) -> ResumeResult {
    let resumes: FxHashMap<ExprId, (HandlerId, OpId)> = handlers
        .resumes
        .iter()
        .map(|r| (r.expr, (r.handler, r.op)))
        .collect();
    let mut clauses = Vec::new();
    collect_clauses(&func.body, &mut clauses);

    let mut pass = ResumePass {
        cx,
        func,
        layout,
        handlers,
        table,
        resumes,
        sends: SendAnalyzer::new(cx.pool),
        result: ResumeResult {
            continuations: Vec::new(),
            drops: Vec::new(),
            errors: Vec::new(),
        },
    };
    for (handler, clause) in clauses {
        pass.clause(handler, clause);
    }

    tracing::debug!(
        function = func.name.raw(),
        continuations = pass.result.continuations.len(),
        errors = pass.result.errors.len(),
        "classified continuations"
    );
    pass.result
}

fn collect_clauses<'f>(block: &'f Block, out: &mut Vec<(&'f Handler, &'f Clause)>) {
    for stmt in &block.stmts {
        match stmt {
            Stmt::Let { init, .. } => collect_in_expr(init, out),
            Stmt::Expr(expr) => collect_in_expr(expr, out),
        }
    }
    if let Some(tail) = &block.tail {
        collect_in_expr(tail, out);
    }
}

fn collect_in_expr<'f>(expr: &'f Expr, out: &mut Vec<(&'f Handler, &'f Clause)>) {
    match &expr.kind {
        ExprKind::Literal
        | ExprKind::Var(_)
        | ExprKind::Move(_)
        | ExprKind::Borrow { .. }
        | ExprKind::Read(_)
        | ExprKind::ResumeValue
        | ExprKind::Break => {}
        ExprKind::Assign { value, .. } | ExprKind::Resume { value } => collect_in_expr(value, out),
        ExprKind::Construct { args }
        | ExprKind::Call { args, .. }
        | ExprKind::Perform { args, .. } => {
            for arg in args {
                collect_in_expr(arg, out);
            }
        }
        ExprKind::Handle { body, handler } => {
            collect_clauses(body, out);
            for clause in &handler.clauses {
                out.push((handler, clause));
                collect_clauses(&clause.body, out);
            }
        }
        ExprKind::Spawn { body } | ExprKind::Loop { body } | ExprKind::Block(body) => {
            collect_clauses(body, out);
        }
        ExprKind::If {
            cond,
            then_block,
            else_block,
        } => {
            collect_in_expr(cond, out);
            collect_clauses(then_block, out);
            if let Some(else_block) = else_block {
                collect_clauses(else_block, out);
            }
        }
        ExprKind::Match { arms, .. } => {
            for arm in arms {
                collect_clauses(&arm.body, out);
            }
        }
        ExprKind::Return(value) => {
            if let Some(value) = value {
                collect_in_expr(value, out);
            }
        }
    }
}

/// Whether `block` ends in a `resume` on every path, with nothing after it.
fn is_tail_resume_block(block: &Block) -> bool {
    block.tail.as_deref().is_some_and(is_tail_resume)
}

fn is_tail_resume(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Resume { .. } => true,
        ExprKind::Block(block) => is_tail_resume_block(block),
        ExprKind::If {
            then_block,
            else_block: Some(else_block),
            ..
        } => is_tail_resume_block(then_block) && is_tail_resume_block(else_block),
        ExprKind::Match { arms, .. } => {
            !arms.is_empty() && arms.iter().all(|arm| is_tail_resume_block(&arm.body))
        }
        ExprKind::Return(Some(inner)) => is_tail_resume(inner),
        _ => false,
    }
}

struct ResumePass<'a, 'cx> {
    cx: &'a CheckCtx<'cx>,
    func: &'a Function,
    layout: &'a Layout,
    handlers: &'a HandlerFacts,
    table: &'a LoanTable,
    resumes: FxHashMap<ExprId, (HandlerId, OpId)>,
    sends: SendAnalyzer<'cx>,
    result: ResumeResult,
}

/// A capture candidate seen from one suspension point.
struct SiteCapture {
    capture: Capture,
    /// A move of the binding in the re-executed part of the computation.
    moved_at: Option<Span>,
    site: Span,
}

impl ResumePass<'_, '_> {
    fn clause(&mut self, handler: &Handler, clause: &Clause) {
        let key = ContinuationKey {
            handler: handler.id,
            op: clause.op,
        };
        let Some(handle) = self.handlers.handle(handler.id) else {
            return;
        };
        let body_scope = handle.body_scope;
        let count = self.count_block(&clause.body, key);
        let inferred = count.multiplicity();
        let declared = self.cx.declared_multiplicity(handler.effect, clause.op);
        let tail_resumptive =
            count.max == 1 && count.concurrent.is_none() && is_tail_resume_block(&clause.body);
        let op_path = self.cx.op_path(handler.effect, clause.op);

        tracing::trace!(
            function = self.func.name.raw(),
            handler = handler.id.raw(),
            op = clause.op.raw(),
            max = count.max,
            ?inferred,
            ?declared,
            tail_resumptive,
            "counted resumes"
        );

        if inferred > declared {
            self.multiplicity_violation(&op_path, declared, inferred, &count, clause.span);
        }

        let site_captures = self.captures(key, body_scope);
        let mut captures: Vec<Capture> = Vec::new();
        for sc in &site_captures {
            match captures.iter_mut().find(|c| c.var == sc.capture.var) {
                Some(existing) => {
                    if sc.capture.mode == CaptureMode::ByValue {
                        existing.mode = CaptureMode::ByValue;
                    }
                }
                None => captures.push(sc.capture.clone()),
            }
        }

        if inferred >= Multiplicity::Mut {
            for sc in &site_captures {
                let Some(moved_at) = sc.moved_at else {
                    continue;
                };
                let name = self.cx.name(sc.capture.name);
                let mut err = BorrowckError::new(
                    BorrowckErrorKind::CaptureMove,
                    moved_at,
                    format!(
                        "`{name}` is moved inside a continuation of `{op_path}` that may be resumed more than once"
                    ),
                )
                .with_label(format!("`{name}` moved here"))
                .with_cause(sc.site, "computation suspended here");
                if let Some(repeat) = count.repeat.or(count.concurrent) {
                    err = err.with_cause(repeat, "continuation resumed again here");
                }
                self.result.errors.push(
                    err.with_note("a moved value would be missing the next time the continuation runs"),
                );
            }
            self.clause_moves(clause, &captures, &site_captures, &op_path, &count);
        }

        if inferred == Multiplicity::Many {
            for capture in &captures {
                if self.sends.is_send(capture.ty) {
                    continue;
                }
                let name = self.cx.name(capture.name);
                let mut err = BorrowckError::new(
                    BorrowckErrorKind::NonSendCapture,
                    handle.span,
                    format!(
                        "continuation of `{op_path}` may run concurrently but captures `{name}` of type `{}`",
                        self.cx.ty(capture.ty)
                    ),
                )
                .with_label(format!("`{name}` captured here"));
                if let Some(spawned) = count.concurrent {
                    err = err.with_cause(spawned, "resumed on another thread here");
                }
                self.result.errors.push(
                    err.with_note("captures of a concurrently resumed continuation must be sendable"),
                );
            }
        }

        let drop_kind = if count.max == 0 {
            Some(DropKind::ContinuationDropped(key))
        } else if inferred == Multiplicity::Once && !tail_resumptive {
            Some(DropKind::AfterResume(key))
        } else {
            None
        };
        if let Some(kind) = drop_kind {
            for capture in &captures {
                if capture.mode == CaptureMode::ByValue && !self.cx.pool.is_copyable(capture.ty) {
                    self.result.drops.push(DropPoint {
                        function: self.func.name,
                        var: capture.var,
                        kind,
                        span: clause.span,
                    });
                }
            }
        }

        let pinned = self.pinned(key, &captures);
        self.result.continuations.push(ContinuationFacts {
            info: ContinuationInfo {
                key,
                function: self.func.name,
                effect: handler.effect,
                declared,
                multiplicity: inferred,
                tail_resumptive,
                captures,
                requires_send: inferred == Multiplicity::Many,
                boxed: false,
                region: Region::Scope {
                    function: self.func.name,
                    scope: body_scope,
                },
                span: clause.span,
            },
            body_scope,
            pinned,
            resumed_in_loop: count.looped,
        });
    }

    /// Moves of captured bindings made by the clause itself. The next resume
    /// re-runs code that still expects them.
    fn clause_moves(
        &mut self,
        clause: &Clause,
        captures: &[Capture],
        site_captures: &[SiteCapture],
        op_path: &str,
        count: &ResumeCount,
    ) {
        let Some(clause_range) = self.layout.scope_range(clause.body.scope) else {
            return;
        };
        for capture in captures {
            let Some(moved) = self.layout.binding(capture.var).and_then(|b| {
                b.uses
                    .iter()
                    .find(|u| u.kind == UseKind::Move && clause_range.contains(u.pos))
            }) else {
                continue;
            };
            let name = self.cx.name(capture.name);
            let mut err = BorrowckError::new(
                BorrowckErrorKind::CaptureMove,
                moved.span,
                format!(
                    "handler for `{op_path}` moves `{name}` out of a continuation that may be resumed more than once"
                ),
            )
            .with_label(format!("`{name}` moved here"));
            if let Some(sc) = site_captures.iter().find(|sc| sc.capture.var == capture.var) {
                err = err.with_cause(sc.site, format!("`{name}` is captured by the computation suspended here"));
            }
            if let Some(repeat) = count.repeat.or(count.concurrent) {
                err = err.with_cause(repeat, "continuation resumed again here");
            }
            self.result.errors.push(
                err.with_note("the resumed computation would read a moved value"),
            );
        }
    }

    fn multiplicity_violation(
        &mut self,
        op_path: &str,
        declared: Multiplicity,
        inferred: Multiplicity,
        count: &ResumeCount,
        clause_span: Span,
    ) {
        let (witness, label) = match inferred {
            Multiplicity::Many => (count.concurrent, "may be resumed concurrently here"),
            _ => (count.repeat, "may be resumed again here"),
        };
        let span = witness.unwrap_or(clause_span);
        let mut err = BorrowckError::new(
            BorrowckErrorKind::ResumeMultiplicity,
            span,
            format!(
                "handler for `{op_path}` resumes its continuation {} but the operation is declared `{}`",
                match inferred {
                    Multiplicity::Many => "concurrently",
                    _ => "more than once",
                },
                declared.as_str()
            ),
        )
        .with_label(label);
        if let Some(first) = count.first.filter(|&f| f != span) {
            err = err.with_cause(first, "first resumed here");
        }
        self.result.errors.push(err.with_cause(clause_span, "in this handler clause"));
    }

    // === Counting ===

    fn count_block(&self, block: &Block, key: ContinuationKey) -> ResumeCount {
        let mut count = ResumeCount::default();
        for stmt in &block.stmts {
            let expr = match stmt {
                Stmt::Let { init, .. } => init,
                Stmt::Expr(expr) => expr,
            };
            count = count.then(self.count_expr(expr, key));
        }
        if let Some(tail) = &block.tail {
            count = count.then(self.count_expr(tail, key));
        }
        count
    }

    fn is_ours(&self, expr: &Expr, key: ContinuationKey) -> bool {
        self.resumes.get(&expr.id) == Some(&(key.handler, key.op))
    }

    fn count_exprs(&self, exprs: &[Expr], key: ContinuationKey) -> ResumeCount {
        exprs
            .iter()
            .fold(ResumeCount::default(), |acc, e| acc.then(self.count_expr(e, key)))
    }

    fn count_expr(&self, expr: &Expr, key: ContinuationKey) -> ResumeCount {
        match &expr.kind {
            ExprKind::Literal
            | ExprKind::Var(_)
            | ExprKind::Move(_)
            | ExprKind::Borrow { .. }
            | ExprKind::Read(_) => ResumeCount::default(),
            ExprKind::Break => ResumeCount::broken(),
            ExprKind::ResumeValue => {
                if self.is_ours(expr, key) {
                    ResumeCount::escaping(expr.span)
                } else {
                    ResumeCount::default()
                }
            }
            ExprKind::Resume { value } => {
                let inner = self.count_expr(value, key);
                if self.is_ours(expr, key) {
                    inner.then(ResumeCount::single(expr.span))
                } else {
                    inner
                }
            }
            ExprKind::Assign { value, .. } => self.count_expr(value, key),
            ExprKind::Construct { args }
            | ExprKind::Call { args, .. }
            | ExprKind::Perform { args, .. } => self.count_exprs(args, key),
            ExprKind::Handle { body, handler } => {
                let handled = self.count_block(body, key);
                // A clause may run before the handled body returns.
                let clauses = handler
                    .clauses
                    .iter()
                    .fold(ResumeCount::default(), |acc, c| {
                        acc.either(self.count_block(&c.body, key))
                    });
                handled.either(ResumeCount::default()).then(clauses)
            }
            ExprKind::Spawn { body } => self.count_block(body, key).spawned(),
            ExprKind::Loop { body } => self.count_block(body, key).repeated(),
            ExprKind::Block(body) => self.count_block(body, key),
            ExprKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let branches = match else_block {
                    Some(else_block) => self
                        .count_block(then_block, key)
                        .either(self.count_block(else_block, key)),
                    None => self.count_block(then_block, key).either(ResumeCount::default()),
                };
                self.count_expr(cond, key).then(branches)
            }
            ExprKind::Match { arms, .. } => arms
                .iter()
                .fold(ResumeCount::unreachable(), |acc, arm| {
                    acc.either(self.count_block(&arm.body, key))
                }),
            ExprKind::Return(value) => value
                .as_deref()
                .map_or(ResumeCount::default(), |v| self.count_expr(v, key))
                .then(ResumeCount::unreachable()),
        }
    }

    // === Captures ===

    fn captures(&self, key: ContinuationKey, body_scope: ScopeId) -> Vec<SiteCapture> {
        let Some(body) = self.layout.scope_range(body_scope) else {
            return Vec::new();
        };
        let sites: Vec<PerformSite> = self.handlers.sites_for(key.handler, key.op).copied().collect();
        let mut out = Vec::new();
        for site in &sites {
            let Some(range) = self.layout.expr_range(site.expr) else {
                continue;
            };
            let Some(site_scope) = self.layout.expr_scope(site.expr) else {
                continue;
            };
            let resumed_at = range.end;
            // A loop inside the handled computation re-runs its whole body.
            let replay = self
                .layout
                .enclosing_loop(resumed_at)
                .map(|(_, r)| r)
                .filter(|r| body.contains_range(*r));
            for var in self.func.var_ids() {
                if let Some(capture) =
                    self.site_capture(var, site, site_scope, resumed_at, body, body_scope, replay)
                {
                    out.push(capture);
                }
            }
        }
        out
    }

    #[expect(clippy::too_many_arguments, reason = "one capture query per binding and site")]
    fn site_capture(
        &self,
        var: VarId,
        site: &PerformSite,
        site_scope: ScopeId,
        resumed_at: Pos,
        body: PosRange,
        body_scope: ScopeId,
        replay: Option<PosRange>,
    ) -> Option<SiteCapture> {
        let facts = self.layout.binding(var)?;
        let decl = facts.decl?;
        let scope = facts.scope?;
        if decl >= resumed_at || !self.layout.scope_within(site_scope, scope) {
            return None;
        }
        let in_segment = |pos: Pos| {
            (pos > resumed_at && pos <= body.end) || replay.is_some_and(|r| r.contains(pos))
        };
        let mut used = false;
        let mut moved_at = None;
        for u in &facts.uses {
            if in_segment(u.pos) {
                used = true;
                if u.kind == UseKind::Move && moved_at.is_none() {
                    moved_at = Some(u.span);
                }
            }
        }
        if !used {
            return None;
        }
        let local = self.func.local(var)?;
        let inside = self.layout.scope_within(scope, body_scope);
        let mode = if inside || moved_at.is_some() {
            CaptureMode::ByValue
        } else {
            CaptureMode::ByRef
        };
        Some(SiteCapture {
            capture: Capture {
                var,
                name: local.name,
                ty: local.ty,
                mode,
                boxed: false,
            },
            moved_at,
            site: site.span,
        })
    }

    /// Captures that another capture holds a live reference into at a
    /// suspension point.
    fn pinned(&self, key: ContinuationKey, captures: &[Capture]) -> FxHashSet<VarId> {
        let captured: FxHashSet<VarId> = captures.iter().map(|c| c.var).collect();
        let mut pinned = FxHashSet::default();
        for site in self.handlers.sites_for(key.handler, key.op) {
            let Some(at) = self.layout.expr_range(site.expr).map(|r| r.end) else {
                continue;
            };
            for loan in &self.table.loans {
                let StorageRoot::Binding(owner) = loan.root else {
                    continue;
                };
                if captured.contains(&owner)
                    && loan.interval().contains(at)
                    && loan.holders.iter().any(|h| captured.contains(h))
                {
                    pinned.insert(owner);
                }
            }
        }
        pinned
    }
}

#[cfg(test)]
mod tests;
