//! Effect handler resolution.
//!
//! Resolution is purely lexical. The traversal threads an explicit
//! [`HandlerContext`] down the tree: entering a `handle` body pushes one
//! [`HandlerFrame`] that links to the next-outer frame, and each recursive
//! call only ever sees an immutable snapshot of the stack above it.
//!
//! Every effect obligation resolves to the innermost frame whose handler has
//! a clause for the operation. With no such frame, the obligation leaves the
//! function through its declared effect set; an undeclared effect is an
//! [`UnhandledEffect`](BorrowckErrorKind::UnhandledEffect) error.
//!
//! Calling a function is an obligation for every operation of every effect
//! the callee declares. Clause bodies run under the handlers outside their
//! own `handle` node, so they are resolved against the outer frame.

use rustc_hash::FxHashSet;

use kiln_ir::{Name, Span};

use crate::context::CheckCtx;
use crate::error::{BorrowckError, BorrowckErrorKind, IrError};
use crate::ir::{
    Block, EffectId, Expr, ExprId, ExprKind, Function, Handler, HandlerId, OpId, ScopeId, Stmt,
};

/// Where an effect obligation is discharged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum HandlerTarget {
    /// A clause of a `handle` node in the same function.
    Handler(HandlerId),
    /// Propagated to the callers of `function`.
    Boundary { function: Name, effect: EffectId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerformSite {
    /// The `perform` or call expression.
    pub expr: ExprId,
    pub effect: EffectId,
    pub op: OpId,
    pub target: HandlerTarget,
    /// Set when the obligation comes from calling this function.
    pub via: Option<Name>,
    /// Number of handler frames enclosing the site.
    pub depth: u32,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleInfo {
    pub expr: ExprId,
    pub handler: HandlerId,
    pub effect: EffectId,
    pub body_scope: ScopeId,
    pub depth: u32,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeSite {
    pub expr: ExprId,
    pub handler: HandlerId,
    pub op: OpId,
    pub span: Span,
}

#[derive(Clone, Debug, Default)]
pub struct HandlerFacts {
    pub performs: Vec<PerformSite>,
    pub handles: Vec<HandleInfo>,
    pub resumes: Vec<ResumeSite>,
}

impl HandlerFacts {
    pub fn handle(&self, handler: HandlerId) -> Option<&HandleInfo> {
        self.handles.iter().find(|h| h.handler == handler)
    }

    /// Sites resolved to the clause for `op` of `handler`.
    pub fn sites_for(&self, handler: HandlerId, op: OpId) -> impl Iterator<Item = &PerformSite> {
        self.performs
            .iter()
            .filter(move |s| s.target == HandlerTarget::Handler(handler) && s.op == op)
    }

    pub fn sites_at(&self, expr: ExprId) -> impl Iterator<Item = &PerformSite> {
        self.performs.iter().filter(move |s| s.expr == expr)
    }
}

/// One active `handle` node.
#[derive(Clone, Copy)]
pub(crate) struct HandlerFrame<'f> {
    handler: &'f Handler,
    depth: u32,
    parent: Option<&'f HandlerFrame<'f>>,
}

#[derive(Clone, Copy, Default)]
pub(crate) struct HandlerContext<'f> {
    frame: Option<&'f HandlerFrame<'f>>,
    /// The clause whose body is being visited, if any.
    clause: Option<(HandlerId, OpId)>,
}

impl<'f> HandlerContext<'f> {
    fn depth(&self) -> u32 {
        self.frame.map_or(0, |f| f.depth)
    }

    /// Innermost enclosing handler with a clause for `op`. A handler of the
    /// same effect that does not handle `op` forwards it outward.
    fn lookup(&self, effect: EffectId, op: OpId) -> Option<HandlerId> {
        let mut current = self.frame;
        while let Some(frame) = current {
            if frame.handler.effect == effect && frame.handler.clause(op).is_some() {
                return Some(frame.handler.id);
            }
            current = frame.parent;
        }
        None
    }
}

pub(crate) struct HandlerResolution {
    pub facts: HandlerFacts,
    pub errors: Vec<BorrowckError>,
}

pub(crate) fn resolve_handlers(cx: &CheckCtx<'_>, func: &Function) -> HandlerResolution {
    let mut resolver = Resolver {
        cx,
        func,
        facts: HandlerFacts::default(),
        errors: Vec::new(),
        reported: FxHashSet::default(),
    };
    resolver.block(&func.body, HandlerContext::default());

    tracing::debug!(
        function = func.name.raw(),
        performs = resolver.facts.performs.len(),
        handles = resolver.facts.handles.len(),
        resumes = resolver.facts.resumes.len(),
        "resolved effect handlers"
    );
    HandlerResolution {
        facts: resolver.facts,
        errors: resolver.errors,
    }
}

struct Resolver<'a, 'cx> {
    cx: &'a CheckCtx<'cx>,
    func: &'a Function,
    facts: HandlerFacts,
    errors: Vec<BorrowckError>,
    /// `(site, effect)` pairs already reported as unhandled.
    reported: FxHashSet<(ExprId, EffectId)>,
}

impl Resolver<'_, '_> {
    fn block(&mut self, block: &Block, ctx: HandlerContext<'_>) {
        for stmt in &block.stmts {
            match stmt {
                Stmt::Let { init, .. } => self.expr(init, ctx),
                Stmt::Expr(expr) => self.expr(expr, ctx),
            }
        }
        if let Some(tail) = &block.tail {
            self.expr(tail, ctx);
        }
    }

    fn expr(&mut self, expr: &Expr, ctx: HandlerContext<'_>) {
        match &expr.kind {
            ExprKind::Literal
            | ExprKind::Var(_)
            | ExprKind::Move(_)
            | ExprKind::Borrow { .. }
            | ExprKind::Read(_)
            | ExprKind::Break => {}
            ExprKind::Assign { value, .. } => self.expr(value, ctx),
            ExprKind::Construct { args } => {
                for arg in args {
                    self.expr(arg, ctx);
                }
            }
            ExprKind::Call { callee, args } => {
                for arg in args {
                    self.expr(arg, ctx);
                }
                self.call(expr, *callee, ctx);
            }
            ExprKind::Perform { effect, op, args } => {
                for arg in args {
                    self.expr(arg, ctx);
                }
                if self.cx.module.op(*effect, *op).is_none() {
                    let err = if self.cx.module.effect(*effect).is_none() {
                        IrError::UnknownEffect {
                            effect: *effect,
                            span: expr.span,
                        }
                    } else {
                        IrError::UnknownOp {
                            effect: *effect,
                            op: *op,
                            span: expr.span,
                        }
                    };
                    self.errors.push(err.into());
                    return;
                }
                self.obligation(expr, *effect, *op, None, ctx);
            }
            ExprKind::Handle { body, handler } => self.handle(expr, body, handler, ctx),
            ExprKind::Resume { value } => {
                self.expr(value, ctx);
                self.resume(expr, ctx);
            }
            ExprKind::ResumeValue => self.resume(expr, ctx),
            ExprKind::Spawn { body } | ExprKind::Loop { body } | ExprKind::Block(body) => {
                self.block(body, ctx);
            }
            ExprKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond, ctx);
                self.block(then_block, ctx);
                if let Some(else_block) = else_block {
                    self.block(else_block, ctx);
                }
            }
            ExprKind::Match { arms, .. } => {
                for arm in arms {
                    self.block(&arm.body, ctx);
                }
            }
            ExprKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value, ctx);
                }
            }
        }
    }

    fn handle(&mut self, expr: &Expr, body: &Block, handler: &Handler, ctx: HandlerContext<'_>) {
        if self.cx.module.effect(handler.effect).is_none() {
            self.errors.push(
                IrError::UnknownEffect {
                    effect: handler.effect,
                    span: expr.span,
                }
                .into(),
            );
        }
        let depth = ctx.depth() + 1;
        self.facts.handles.push(HandleInfo {
            expr: expr.id,
            handler: handler.id,
            effect: handler.effect,
            body_scope: body.scope,
            depth,
            span: expr.span,
        });

        let frame = HandlerFrame {
            handler,
            depth,
            parent: ctx.frame,
        };
        let inner = HandlerContext {
            frame: Some(&frame),
            clause: ctx.clause,
        };
        self.block(body, inner);

        for clause in &handler.clauses {
            let clause_ctx = HandlerContext {
                frame: ctx.frame,
                clause: Some((handler.id, clause.op)),
            };
            self.block(&clause.body, clause_ctx);
        }
    }

    fn call(&mut self, expr: &Expr, callee: Name, ctx: HandlerContext<'_>) {
        let Some(target) = self.cx.module.function(callee) else {
            self.errors.push(
                IrError::UnknownFunction {
                    callee,
                    span: expr.span,
                }
                .into(),
            );
            return;
        };
        for &effect in &target.effects {
            let Some(decl) = self.cx.module.effect(effect) else {
                continue;
            };
            for op in decl.op_ids() {
                self.obligation(expr, effect, op, Some(callee), ctx);
            }
        }
    }

    fn obligation(
        &mut self,
        expr: &Expr,
        effect: EffectId,
        op: OpId,
        via: Option<Name>,
        ctx: HandlerContext<'_>,
    ) {
        let target = if let Some(handler) = ctx.lookup(effect, op) {
            HandlerTarget::Handler(handler)
        } else if self.func.declares(effect) {
            HandlerTarget::Boundary {
                function: self.func.name,
                effect,
            }
        } else {
            if self.reported.insert((expr.id, effect)) {
                let err = self.unhandled(expr, effect, op, via);
                self.errors.push(err);
            }
            return;
        };
        self.facts.performs.push(PerformSite {
            expr: expr.id,
            effect,
            op,
            target,
            via,
            depth: ctx.depth(),
            span: expr.span,
        });
    }

    fn unhandled(&self, expr: &Expr, effect: EffectId, op: OpId, via: Option<Name>) -> BorrowckError {
        let effect_name = self.cx.effect_name(effect);
        let func_name = self.cx.name(self.func.name);
        let mut err = match via {
            Some(callee) => BorrowckError::new(
                BorrowckErrorKind::UnhandledEffect,
                expr.span,
                format!(
                    "call to `{}` may perform `{effect_name}`, which is not handled",
                    self.cx.name(callee)
                ),
            )
            .with_label(format!("`{effect_name}` escapes here")),
            None => BorrowckError::new(
                BorrowckErrorKind::UnhandledEffect,
                expr.span,
                format!("effect operation `{}` is not handled", self.cx.op_path(effect, op)),
            )
            .with_label("no enclosing handler for this operation"),
        };
        if let Some(decl) = self.cx.module.effect(effect) {
            err = err.with_cause(decl.span, format!("`{effect_name}` declared here"));
        }
        err.with_note(format!(
            "handle `{effect_name}` here, or add it to the effect set of `{func_name}`"
        ))
    }

    fn resume(&mut self, expr: &Expr, ctx: HandlerContext<'_>) {
        match ctx.clause {
            Some((handler, op)) => self.facts.resumes.push(ResumeSite {
                expr: expr.id,
                handler,
                op,
                span: expr.span,
            }),
            None => self.errors.push(
                BorrowckError::new(
                    BorrowckErrorKind::ResumeOutsideHandler,
                    expr.span,
                    "`resume` used outside of a handler clause",
                )
                .with_label("no continuation to resume here")
                .with_note("`resume` is only bound inside the clauses of a `handle` expression"),
            ),
        }
    }
}
