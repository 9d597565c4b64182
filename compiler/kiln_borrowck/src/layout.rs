//! Program-point layout of a function body.
//!
//! Numbers every expression and block with an enter and an exit tick in
//! evaluation order, builds the lexical scope tree, and records each
//! binding's declaration point and uses. All later phases reason about
//! liveness as intervals on this single timeline.
//!
//! # Liveness
//!
//! A binding is live from its declaration to its last use. A use inside a
//! loop that does not contain the declaration keeps the binding live until
//! that loop exits, since the next iteration may read it again.

use rustc_hash::FxHashMap;

use kiln_ir::Span;

use crate::ir::{Block, Expr, ExprId, ExprKind, Function, Place, Projection, ScopeId, Stmt, VarId};

/// A program point. Ticks increase in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pos(u32);

impl Pos {
    #[cfg(test)]
    pub const fn new(raw: u32) -> Self {
        Pos(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Closed interval of program points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PosRange {
    pub start: Pos,
    pub end: Pos,
}

impl PosRange {
    pub const fn new(start: Pos, end: Pos) -> Self {
        PosRange { start, end }
    }

    #[inline]
    pub fn contains(self, pos: Pos) -> bool {
        self.start <= pos && pos <= self.end
    }

    #[inline]
    pub fn contains_range(self, other: PosRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    #[inline]
    pub fn overlaps(self, other: PosRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExprFacts {
    pub range: PosRange,
    /// Innermost block scope containing the expression.
    pub scope: ScopeId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScopeInfo {
    pub parent: Option<ScopeId>,
    pub depth: u32,
    pub range: PosRange,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseKind {
    Read,
    Move,
    Borrow,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Use {
    pub pos: Pos,
    pub kind: UseKind,
    pub expr: ExprId,
    pub span: Span,
}

#[derive(Clone, Debug, Default)]
pub struct BindingFacts {
    /// `None` for locals the body never declares.
    pub decl: Option<Pos>,
    pub scope: Option<ScopeId>,
    pub uses: Vec<Use>,
    /// Last point at which the binding may still be read.
    pub live_end: Pos,
}

#[derive(Clone, Debug)]
pub struct Layout {
    pub exprs: FxHashMap<ExprId, ExprFacts>,
    pub scopes: FxHashMap<ScopeId, ScopeInfo>,
    /// Loop expressions and the ranges they cover.
    pub loops: Vec<(ExprId, PosRange)>,
    /// Indexed by `VarId::index()`.
    pub bindings: Vec<BindingFacts>,
    pub body: PosRange,
    pub root: ScopeId,
}

impl Layout {
    pub fn compute(func: &Function) -> Layout {
        let mut builder = LayoutBuilder {
            next: 1,
            scope_stack: Vec::new(),
            layout: Layout {
                exprs: FxHashMap::default(),
                scopes: FxHashMap::default(),
                loops: Vec::new(),
                bindings: vec![BindingFacts::default(); func.locals.len()],
                body: PosRange::new(Pos(0), Pos(0)),
                root: func.body.scope,
            },
        };
        for &param in &func.params {
            builder.declare(param, Pos(0), func.body.scope);
        }
        let body = builder.block(&func.body, &[]);
        builder.layout.body = PosRange::new(Pos(0), body.end);
        builder.layout.finish_liveness();

        tracing::trace!(
            function = func.name.raw(),
            exprs = builder.layout.exprs.len(),
            scopes = builder.layout.scopes.len(),
            "computed layout"
        );
        builder.layout
    }

    pub fn expr_range(&self, id: ExprId) -> Option<PosRange> {
        self.exprs.get(&id).map(|f| f.range)
    }

    pub fn expr_scope(&self, id: ExprId) -> Option<ScopeId> {
        self.exprs.get(&id).map(|f| f.scope)
    }

    pub fn binding(&self, var: VarId) -> Option<&BindingFacts> {
        self.bindings.get(var.index())
    }

    pub fn live_end(&self, var: VarId) -> Pos {
        self.binding(var).map_or(Pos(0), |b| b.live_end)
    }

    pub fn scope_range(&self, scope: ScopeId) -> Option<PosRange> {
        self.scopes.get(&scope).map(|s| s.range)
    }

    /// Whether `inner` is `outer` or nested inside it.
    pub fn scope_within(&self, inner: ScopeId, outer: ScopeId) -> bool {
        let mut current = Some(inner);
        while let Some(scope) = current {
            if scope == outer {
                return true;
            }
            current = self.scopes.get(&scope).and_then(|s| s.parent);
        }
        false
    }

    /// Innermost loop containing `pos`.
    pub fn enclosing_loop(&self, pos: Pos) -> Option<(ExprId, PosRange)> {
        self.loops
            .iter()
            .filter(|(_, range)| range.contains(pos))
            .min_by_key(|(_, range)| range.end.raw() - range.start.raw())
            .copied()
    }

    fn finish_liveness(&mut self) {
        let loops = &self.loops;
        for binding in &mut self.bindings {
            let Some(decl) = binding.decl else {
                continue;
            };
            let mut end = decl;
            for u in &binding.uses {
                end = end.max(u.pos);
                for (_, range) in loops {
                    if range.contains(u.pos) && !range.contains(decl) {
                        end = end.max(range.end);
                    }
                }
            }
            binding.live_end = end;
        }
    }
}

struct LayoutBuilder {
    next: u32,
    scope_stack: Vec<ScopeId>,
    layout: Layout,
}

impl LayoutBuilder {
    fn tick(&mut self) -> Pos {
        let pos = Pos(self.next);
        self.next += 1;
        pos
    }

    fn current_scope(&self) -> ScopeId {
        self.scope_stack
            .last()
            .copied()
            .unwrap_or(self.layout.root)
    }

    fn declare(&mut self, var: VarId, pos: Pos, scope: ScopeId) {
        if let Some(b) = self.layout.bindings.get_mut(var.index()) {
            b.decl = Some(pos);
            b.scope = Some(scope);
            b.live_end = pos;
        }
    }

    fn record_use(&mut self, var: VarId, kind: UseKind, expr: &Expr, pos: Pos) {
        if let Some(b) = self.layout.bindings.get_mut(var.index()) {
            b.uses.push(Use {
                pos,
                kind,
                expr: expr.id,
                span: expr.span,
            });
        }
    }

    fn place_use(&mut self, place: &Place, kind: UseKind, expr: &Expr, pos: Pos) {
        // Writing through a reference reads the reference binding itself.
        let kind = if kind == UseKind::Write && !place.is_whole_binding() {
            if place.projections.first() == Some(&Projection::Deref) {
                UseKind::Read
            } else {
                UseKind::Write
            }
        } else {
            kind
        };
        self.record_use(place.base, kind, expr, pos);
    }

    /// Lay out a block, declaring `entry_bindings` at its entry.
    fn block(&mut self, block: &Block, entry_bindings: &[VarId]) -> PosRange {
        let enter = self.tick();
        let parent = self.scope_stack.last().copied();
        let depth = u32::try_from(self.scope_stack.len()).unwrap_or(u32::MAX);
        self.scope_stack.push(block.scope);
        for &var in entry_bindings {
            self.declare(var, enter, block.scope);
        }

        for stmt in &block.stmts {
            match stmt {
                Stmt::Let { var, init, .. } => {
                    let range = self.expr(init);
                    self.declare(*var, range.end, block.scope);
                }
                Stmt::Expr(expr) => {
                    self.expr(expr);
                }
            }
        }
        if let Some(tail) = &block.tail {
            self.expr(tail);
        }

        self.scope_stack.pop();
        let exit = self.tick();
        let range = PosRange::new(enter, exit);
        self.layout.scopes.insert(
            block.scope,
            ScopeInfo {
                parent,
                depth,
                range,
                span: block.span,
            },
        );
        range
    }

    fn expr(&mut self, expr: &Expr) -> PosRange {
        let enter = self.tick();
        let scope = self.current_scope();

        match &expr.kind {
            ExprKind::Literal
            | ExprKind::ResumeValue
            | ExprKind::Break
            | ExprKind::Var(_)
            | ExprKind::Move(_)
            | ExprKind::Borrow { .. }
            | ExprKind::Read(_) => {}
            ExprKind::Assign { value, .. } => {
                self.expr(value);
            }
            ExprKind::Construct { args }
            | ExprKind::Call { args, .. }
            | ExprKind::Perform { args, .. } => {
                for arg in args {
                    self.expr(arg);
                }
            }
            ExprKind::Handle { body, handler } => {
                self.block(body, &[]);
                for clause in &handler.clauses {
                    self.block(&clause.body, &clause.params);
                }
            }
            ExprKind::Resume { value } => {
                self.expr(value);
            }
            ExprKind::Spawn { body } | ExprKind::Loop { body } | ExprKind::Block(body) => {
                self.block(body, &[]);
            }
            ExprKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond);
                self.block(then_block, &[]);
                if let Some(else_block) = else_block {
                    self.block(else_block, &[]);
                }
            }
            ExprKind::Match { scrutinee, arms } => {
                self.place_use(scrutinee, UseKind::Read, expr, enter);
                for arm in arms {
                    let vars: Vec<VarId> = arm.bindings.iter().map(|b| b.var).collect();
                    self.block(&arm.body, &vars);
                }
            }
            ExprKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
        }

        let exit = self.tick();
        match &expr.kind {
            ExprKind::Var(v) => self.record_use(*v, UseKind::Read, expr, exit),
            ExprKind::Move(v) => self.record_use(*v, UseKind::Move, expr, exit),
            ExprKind::Borrow { place, .. } => self.place_use(place, UseKind::Borrow, expr, exit),
            ExprKind::Read(place) => self.place_use(place, UseKind::Read, expr, exit),
            ExprKind::Assign { place, .. } => self.place_use(place, UseKind::Write, expr, exit),
            _ => {}
        }

        let range = PosRange::new(enter, exit);
        if matches!(expr.kind, ExprKind::Loop { .. }) {
            self.layout.loops.push((expr.id, range));
        }
        self.layout
            .exprs
            .insert(expr.id, ExprFacts { range, scope });
        range
    }
}

#[cfg(test)]
mod tests;
