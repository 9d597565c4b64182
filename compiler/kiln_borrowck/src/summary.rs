//! Per-function return summaries.
//!
//! A summary says where a function's returned reference comes from, so a
//! caller can give the call result the right storage and region without
//! looking into the callee. Summaries depend on each other through calls;
//! they are computed together by fixed-point iteration, starting from
//! "returns nothing" for every function.

use rustc_hash::{FxHashMap, FxHashSet};

use kiln_ir::Name;
use kiln_types::RefKind;

use crate::context::CheckCtx;
use crate::ir::{Block, EffectId, Expr, ExprKind, Function, Handler, OpId, Place, Projection, Stmt, VarId};
use crate::place::holds_reference;

/// Origin of a function's returned reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum ReturnSource {
    /// Nothing reference-like, or nothing the caller can observe.
    #[default]
    None,
    /// Derived from the i-th parameter.
    Param(u32),
    /// Produced by an effect operation the function leaves unhandled.
    Effect { effect: EffectId, op: OpId },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct FnSummary {
    pub returns: ReturnSource,
    /// Propagated operations whose owning references the function creates
    /// internally, directly or through its callees. Sorted.
    pub own_effect_ops: Vec<(EffectId, OpId)>,
}

pub type Summaries = FxHashMap<Name, FnSummary>;

/// Abstract origin of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Source {
    Param(u32),
    Effect(EffectId, OpId),
    Local,
}

type Sources = FxHashSet<Source>;

pub(crate) fn compute_summaries(cx: &CheckCtx<'_>) -> Summaries {
    let mut summaries: Summaries = cx
        .module
        .functions
        .iter()
        .map(|f| (f.name, FnSummary::default()))
        .collect();

    // Summaries only climb towards effect sources in practice; the cap
    // guards against recursion that flips a choice back and forth.
    let max_iterations = 4 * cx.module.functions.len() + 4;
    let mut iterations = 0usize;
    let mut changed = true;
    while changed && iterations < max_iterations {
        changed = false;
        iterations += 1;
        for func in &cx.module.functions {
            let summary = summarize(cx, func, &summaries);
            if summaries.get(&func.name) != Some(&summary) {
                summaries.insert(func.name, summary);
                changed = true;
            }
        }
    }

    tracing::debug!(
        functions = summaries.len(),
        iterations,
        "return summaries converged"
    );
    summaries
}

fn summarize(cx: &CheckCtx<'_>, func: &Function, summaries: &Summaries) -> FnSummary {
    let mut walker = SummaryWalker {
        cx,
        func,
        summaries,
        vars: FxHashMap::default(),
        handled: Vec::new(),
        returned: Sources::default(),
        own_ops: FxHashSet::default(),
    };
    for (i, &param) in func.params.iter().enumerate() {
        let i = u32::try_from(i).unwrap_or(u32::MAX);
        walker.vars.insert(param, [Source::Param(i)].into_iter().collect());
    }
    let tail = walker.block(&func.body);
    walker.returned.extend(tail);

    let returns = if holds_reference(cx.pool, func.return_type) {
        let effect = walker
            .returned
            .iter()
            .filter_map(|s| match *s {
                Source::Effect(effect, op) => Some(ReturnSource::Effect { effect, op }),
                _ => None,
            })
            .min();
        let param = walker
            .returned
            .iter()
            .filter_map(|s| match *s {
                Source::Param(i) => Some(ReturnSource::Param(i)),
                _ => None,
            })
            .min();
        effect.or(param).unwrap_or_default()
    } else {
        ReturnSource::None
    };

    let mut own_effect_ops: Vec<(EffectId, OpId)> = walker.own_ops.into_iter().collect();
    own_effect_ops.sort();
    FnSummary {
        returns,
        own_effect_ops,
    }
}

struct SummaryWalker<'a, 'cx> {
    cx: &'a CheckCtx<'cx>,
    func: &'a Function,
    summaries: &'a Summaries,
    vars: FxHashMap<VarId, Sources>,
    /// Handlers whose bodies enclose the current point.
    handled: Vec<&'a Handler>,
    returned: Sources,
    own_ops: FxHashSet<(EffectId, OpId)>,
}

impl<'a> SummaryWalker<'a, '_> {
    fn handled_locally(&self, effect: EffectId, op: OpId) -> bool {
        self.handled
            .iter()
            .any(|h| h.effect == effect && h.clause(op).is_some())
    }

    /// Effect-sourced value: propagated if the function lets the operation
    /// escape, local otherwise.
    fn effect_source(&self, effect: EffectId, op: OpId) -> Source {
        if !self.handled_locally(effect, op) && self.func.declares(effect) {
            Source::Effect(effect, op)
        } else {
            Source::Local
        }
    }

    fn var(&self, var: VarId) -> Sources {
        self.vars.get(&var).cloned().unwrap_or_default()
    }

    fn place(&self, place: &Place) -> Sources {
        if place.projections.first() == Some(&Projection::Deref) {
            self.var(place.base)
        } else {
            [Source::Local].into_iter().collect()
        }
    }

    fn block(&mut self, block: &'a Block) -> Sources {
        for stmt in &block.stmts {
            match stmt {
                Stmt::Let { var, init, .. } => {
                    let sources = self.expr(init);
                    self.vars.insert(*var, sources);
                }
                Stmt::Expr(expr) => {
                    self.expr(expr);
                }
            }
        }
        match &block.tail {
            Some(tail) => self.expr(tail),
            None => Sources::default(),
        }
    }

    fn expr(&mut self, expr: &'a Expr) -> Sources {
        match &expr.kind {
            ExprKind::Literal | ExprKind::ResumeValue | ExprKind::Break => Sources::default(),
            ExprKind::Var(v) | ExprKind::Move(v) => self.var(*v),
            ExprKind::Read(place) => self.var(place.base),
            ExprKind::Borrow { place, .. } => self.place(place),
            ExprKind::Assign { place, value } => {
                let sources = self.expr(value);
                if place.is_whole_binding() {
                    self.vars.insert(place.base, sources);
                }
                Sources::default()
            }
            ExprKind::Construct { args } => {
                let mut out = Sources::default();
                for arg in args {
                    out.extend(self.expr(arg));
                }
                out
            }
            ExprKind::Call { callee, args } => {
                let arg_sources: Vec<Sources> = args.iter().map(|a| self.expr(a)).collect();
                let Some(summary) = self.summaries.get(callee) else {
                    return Sources::default();
                };
                for &(effect, op) in &summary.own_effect_ops {
                    if let Source::Effect(..) = self.effect_source(effect, op) {
                        self.own_ops.insert((effect, op));
                    }
                }
                match summary.returns {
                    ReturnSource::None => Sources::default(),
                    ReturnSource::Param(i) => {
                        arg_sources.get(i as usize).cloned().unwrap_or_default()
                    }
                    ReturnSource::Effect { effect, op } => {
                        [self.effect_source(effect, op)].into_iter().collect()
                    }
                }
            }
            ExprKind::Perform { effect, op, args } => {
                for arg in args {
                    self.expr(arg);
                }
                let source = self.effect_source(*effect, *op);
                if let Source::Effect(..) = source {
                    if returns_own(self.cx, *effect, *op) {
                        self.own_ops.insert((*effect, *op));
                    }
                }
                [source].into_iter().collect()
            }
            ExprKind::Handle { body, handler } => {
                self.handled.push(handler);
                let mut out = self.block(body);
                self.handled.pop();
                for clause in &handler.clauses {
                    out.extend(self.block(&clause.body));
                }
                out
            }
            ExprKind::Resume { value } => {
                self.expr(value);
                Sources::default()
            }
            ExprKind::Spawn { body } | ExprKind::Loop { body } => {
                self.block(body);
                Sources::default()
            }
            ExprKind::Block(body) => self.block(body),
            ExprKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond);
                let mut out = self.block(then_block);
                if let Some(else_block) = else_block {
                    out.extend(self.block(else_block));
                }
                out
            }
            ExprKind::Match { arms, .. } => {
                let mut out = Sources::default();
                for arm in arms {
                    out.extend(self.block(&arm.body));
                }
                out
            }
            ExprKind::Return(value) => {
                if let Some(value) = value {
                    let sources = self.expr(value);
                    self.returned.extend(sources);
                }
                Sources::default()
            }
        }
    }
}

/// Whether an operation's declared result is an owning reference.
pub(crate) fn returns_own(cx: &CheckCtx<'_>, effect: EffectId, op: OpId) -> bool {
    cx.module
        .op(effect, op)
        .and_then(|o| cx.pool.ref_type(cx.pool.strip_named(o.ret)))
        .is_some_and(|r| r.kind == RefKind::Own)
}
