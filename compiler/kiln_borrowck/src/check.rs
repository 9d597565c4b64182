//! Checker driver.
//!
//! Per-function phases (scope layout, handler resolution, loan collection,
//! reference classification, resume analysis) are independent of each other
//! once callee summaries exist, and run on the rayon pool when configured.
//! Lifetime unification and continuation boxing need the whole unit and run
//! afterwards on the collected facts.

use rayon::prelude::*;
use smallvec::SmallVec;

use kiln_diagnostic::DiagnosticQueue;
use kiln_ir::StringInterner;
use kiln_types::{Idx, Pool, RefKind};

use crate::boxing::plan_boxes;
use crate::config::BorrowckConfig;
use crate::context::CheckCtx;
use crate::error::BorrowckError;
use crate::handlers::{resolve_handlers, HandlerFacts};
use crate::ir::{Function, Module};
use crate::layout::Layout;
use crate::lifetime::{unify_lifetimes, FunctionView};
use crate::loans::{collect_loans, LoanOrigin, LoanTable};
use crate::output::{BorrowckOutput, CallingConvention, DropKind, DropPoint, RefTag, Region};
use crate::refkind::{classify_refs, Demand, RefKinds};
use crate::resume::{classify_resumes, ContinuationFacts};
use crate::summary::{compute_summaries, Summaries};

/// Facts gathered for one function before unification.
pub(crate) struct FunctionFacts {
    pub layout: Layout,
    pub handlers: HandlerFacts,
    pub loans: LoanTable,
    pub kinds: RefKinds,
    pub demands: Vec<Demand>,
    pub continuations: Vec<ContinuationFacts>,
    pub drops: Vec<DropPoint>,
    pub errors: Vec<BorrowckError>,
}

impl FunctionFacts {
    pub(crate) fn view<'a>(&'a mut self, func: &'a Function) -> FunctionView<'a> {
        FunctionView {
            func,
            layout: &self.layout,
            handlers: &self.handlers,
            loans: &self.loans,
            kinds: &mut self.kinds,
            demands: &self.demands,
            continuations: &mut self.continuations,
        }
    }
}

pub(crate) fn analyze_function(
    cx: &CheckCtx<'_>,
    func: &Function,
    summaries: &Summaries,
) -> FunctionFacts {
    let layout = Layout::compute(func);
    let resolution = resolve_handlers(cx, func);
    let mut errors = resolution.errors;
    let handlers = resolution.facts;

    let loans = match collect_loans(cx, func, &layout, &handlers, summaries) {
        Ok(table) => table,
        Err(err) => {
            errors.push(err.into());
            LoanTable::default()
        }
    };

    let (kinds, demands, mut drops) = match classify_refs(cx, func, &layout, &loans) {
        Ok(result) => {
            errors.extend(result.errors);
            (result.kinds, result.demands, result.drops)
        }
        Err(err) => {
            errors.push(err.into());
            let kinds = RefKinds {
                kinds: vec![None; loans.loans.len()],
                ..RefKinds::default()
            };
            (kinds, Vec::new(), Vec::new())
        }
    };

    let resumes = classify_resumes(cx, func, &layout, &handlers, &loans);
    errors.extend(resumes.errors);
    // A value captured into a continuation is released by the continuation,
    // not by the scope it was declared in.
    drops.retain(|d| {
        !matches!(d.kind, DropKind::ScopeExit(_))
            || !resumes.drops.iter().any(|r| r.var == d.var)
    });
    drops.extend(resumes.drops);

    tracing::debug!(
        function = func.name.raw(),
        loans = loans.loans.len(),
        continuations = resumes.continuations.len(),
        errors = errors.len(),
        "analyzed function"
    );
    FunctionFacts {
        layout,
        handlers,
        loans,
        kinds,
        demands,
        continuations: resumes.continuations,
        drops,
        errors,
    }
}

/// Borrow-check every function of `module`.
///
/// Never fails: problems are reported through
/// [`BorrowckOutput::diagnostics`], and the annotations are filled in as far
/// as the analysis got.
pub fn check_module(
    module: &Module,
    pool: &Pool,
    interner: &StringInterner,
    config: &BorrowckConfig,
) -> BorrowckOutput {
    let cx = CheckCtx {
        module,
        pool,
        interner,
        config,
    };
    let summaries = compute_summaries(&cx);

    let mut facts: Vec<FunctionFacts> = if config.parallel {
        module
            .functions
            .par_iter()
            .map(|func| analyze_function(&cx, func, &summaries))
            .collect()
    } else {
        module
            .functions
            .iter()
            .map(|func| analyze_function(&cx, func, &summaries))
            .collect()
    };

    let lifetimes = {
        let mut views: Vec<FunctionView<'_>> = facts
            .iter_mut()
            .zip(&module.functions)
            .map(|(f, func)| f.view(func))
            .collect();
        unify_lifetimes(&cx, &summaries, &mut views)
    };

    let mut continuations: Vec<ContinuationFacts> = facts
        .iter_mut()
        .flat_map(|f| std::mem::take(&mut f.continuations))
        .collect();
    let plan = plan_boxes(&cx, &mut continuations);

    let mut output = BorrowckOutput::default();
    let shapes = cx.shapes();
    for ((func, f), (regions, classes)) in module
        .functions
        .iter()
        .zip(&facts)
        .zip(lifetimes.loan_regions.iter().zip(&lifetimes.loan_classes))
    {
        for loan in &f.loans.loans {
            let kind = f.kinds.kind(loan.id).unwrap_or(RefKind::Shared);
            let convention = match kind {
                RefKind::Shared | RefKind::Polymorphic => CallingConvention::PointerAlias,
                RefKind::Own | RefKind::Stable => {
                    if is_small(loan.target) && shapes.is_stable(loan.target) {
                        CallingConvention::ByValue
                    } else {
                        CallingConvention::ByPointer
                    }
                }
            };
            let binding = match loan.origin {
                LoanOrigin::ArmBinding(var) => Some(var),
                _ => None,
            };
            let tag = RefTag {
                function: func.name,
                expr: loan.expr,
                binding,
                kind,
                mutability: loan.mutability,
                region: regions
                    .get(loan.id.index())
                    .copied()
                    .unwrap_or(Region::Caller(func.name)),
                convention,
                class: classes.get(loan.id.index()).copied().flatten(),
            };
            output
                .ref_tags
                .entry(loan.expr)
                .or_insert_with(SmallVec::new)
                .push(tag);
        }
        output.drops.extend(f.drops.iter().copied());
    }

    output.continuations = continuations.into_iter().map(|c| c.info).collect();
    output.boxes = plan.boxes;
    output.regions = lifetimes.regions;
    output.classes = lifetimes.classes;

    let mut queue = DiagnosticQueue::with_config(config.diagnostics.clone());
    let errors = facts
        .into_iter()
        .flat_map(|f| f.errors)
        .chain(lifetimes.errors)
        .chain(plan.errors);
    for err in errors {
        queue.add(err.into_diagnostic());
    }
    output.diagnostics = queue.flush();

    tracing::debug!(
        functions = module.functions.len(),
        references = output.ref_tags.len(),
        continuations = output.continuations.len(),
        boxes = output.boxes.len(),
        diagnostics = output.diagnostics.len(),
        "borrow check complete"
    );
    output
}

/// Targets passed in a register rather than through memory.
fn is_small(target: Idx) -> bool {
    target.is_primitive() && target != Idx::STR
}

#[cfg(test)]
mod tests;
