//! Lifetime unification.
//!
//! References produced by effect operations do not point into storage the
//! function owns, so their aliasing cannot be judged one function at a time.
//! Every such reference belongs to a **unification class** keyed by the
//! handler (or function boundary) that discharges the operation. Calling a
//! function that leaves an operation unhandled links the callee's boundary
//! class to whatever discharges the same operation at the call site, so an
//! owning reference handed out by one handler is tracked through every
//! function that reaches it.
//!
//! With classes in place this pass:
//! - resolves `Polymorphic` effect-sourced references (owning unless another
//!   occurrence of the class overlaps it),
//! - rejects a second owning occurrence of a class while another is live,
//!   including owning references a callee creates internally,
//! - settles the capability checks the per-function classifier deferred,
//! - rejects references that outlive the storage or handler they point into,
//! - assigns every reference and continuation a region.

use rustc_hash::FxHashMap;

use kiln_ir::{Name, Span};
use kiln_types::RefKind;

use crate::context::CheckCtx;
use crate::error::{BorrowckError, BorrowckErrorKind};
use crate::handlers::{HandlerFacts, HandlerTarget};
use crate::ir::{EffectId, Function, HandlerId, OpId, ScopeId};
use crate::layout::{Layout, PosRange};
use crate::loans::{LoanOrigin, LoanTable};
use crate::output::Region;
use crate::ownership::{LoanId, StorageRoot};
use crate::refkind::{resolve_kind, Demand, DemandReason, RefKinds};
use crate::resume::ContinuationFacts;
use crate::summary::Summaries;

/// Identity of a unification class member.
pub type ClassKey = (HandlerTarget, EffectId, OpId);

/// Everything one function contributes to unification.
pub(crate) struct FunctionView<'a> {
    pub func: &'a Function,
    pub layout: &'a Layout,
    pub handlers: &'a HandlerFacts,
    pub loans: &'a LoanTable,
    pub kinds: &'a mut RefKinds,
    pub demands: &'a [Demand],
    pub continuations: &'a mut [ContinuationFacts],
}

pub(crate) struct LifetimeResult {
    /// Per function view, indexed by `LoanId::index()`.
    pub loan_regions: Vec<Vec<Region>>,
    pub loan_classes: Vec<Vec<Option<u32>>>,
    pub regions: FxHashMap<u32, Region>,
    pub classes: FxHashMap<u32, Vec<ClassKey>>,
    pub errors: Vec<BorrowckError>,
}

/// Disjoint sets with path compression and union by rank.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind {
            parent: Vec::new(),
            rank: Vec::new(),
        }
    }

    fn push(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = x;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    fn union(&mut self, x: usize, y: usize) {
        let (rx, ry) = (self.find(x), self.find(y));
        if rx == ry {
            return;
        }
        match self.rank[rx].cmp(&self.rank[ry]) {
            std::cmp::Ordering::Less => self.parent[rx] = ry,
            std::cmp::Ordering::Greater => self.parent[ry] = rx,
            std::cmp::Ordering::Equal => {
                self.parent[ry] = rx;
                self.rank[rx] += 1;
            }
        }
    }
}

#[derive(Default)]
struct ClassTable {
    keys: Vec<ClassKey>,
    index: FxHashMap<ClassKey, usize>,
    sets: Option<UnionFind>,
}

impl ClassTable {
    fn sets(&mut self) -> &mut UnionFind {
        self.sets.get_or_insert_with(UnionFind::new)
    }

    fn intern(&mut self, key: ClassKey) -> usize {
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.sets().push();
        self.keys.push(key);
        self.index.insert(key, id);
        id
    }

    fn class_of(&mut self, key: ClassKey) -> usize {
        let id = self.intern(key);
        self.sets().find(id)
    }

    /// Dense, deterministic class numbering: by first-interned member.
    fn numbering(&mut self) -> (FxHashMap<usize, u32>, FxHashMap<u32, Vec<ClassKey>>) {
        let mut dense: FxHashMap<usize, u32> = FxHashMap::default();
        let mut members: FxHashMap<u32, Vec<ClassKey>> = FxHashMap::default();
        for i in 0..self.keys.len() {
            let root = self.sets().find(i);
            let next = u32::try_from(dense.len()).unwrap_or(u32::MAX);
            let id = *dense.entry(root).or_insert(next);
            members.entry(id).or_default().push(self.keys[i]);
        }
        (dense, members)
    }
}

/// One effect-sourced reference, or the owning reference a callee takes
/// internally during a call.
#[derive(Clone, Copy, Debug)]
struct Occurrence {
    loan: Option<LoanId>,
    class: usize,
    effect: EffectId,
    op: OpId,
    range: PosRange,
    /// Callee, for call-through occurrences.
    callee: Option<Name>,
    span: Span,
}

pub(crate) fn unify_lifetimes(
    cx: &CheckCtx<'_>,
    summaries: &Summaries,
    views: &mut [FunctionView<'_>],
) -> LifetimeResult {
    let mut classes = ClassTable::default();
    for view in views.iter() {
        for site in &view.handlers.performs {
            let id = classes.intern((site.target, site.effect, site.op));
            if let Some(callee) = site.via {
                let boundary = HandlerTarget::Boundary {
                    function: callee,
                    effect: site.effect,
                };
                let inner = classes.intern((boundary, site.effect, site.op));
                classes.sets().union(id, inner);
            }
        }
    }

    let layouts: FxHashMap<Name, &Layout> = views.iter().map(|v| (v.func.name, v.layout)).collect();
    let handles: FxHashMap<HandlerId, (Name, ScopeId)> = views
        .iter()
        .flat_map(|v| {
            let name = v.func.name;
            v.handlers
                .handles
                .iter()
                .map(move |h| (h.handler, (name, h.body_scope)))
        })
        .collect();
    let regions = RegionTree { layouts: &layouts };

    let mut errors = Vec::new();
    let mut occurrences_per_view = Vec::with_capacity(views.len());
    for view in views.iter_mut() {
        let occurrences = collect_occurrences(view, summaries, &mut classes);
        resolve_deferred(cx, view, &occurrences);
        check_class_conflicts(cx, view, &occurrences, &mut errors);
        check_demands(cx, view, &mut errors);
        check_dangling(cx, view, &mut errors);
        occurrences_per_view.push(occurrences);
    }

    let (dense, members) = classes.numbering();
    let mut class_regions: FxHashMap<u32, Region> = FxHashMap::default();
    for (&id, keys) in &members {
        let region = keys
            .iter()
            .map(|(target, _, _)| match *target {
                HandlerTarget::Handler(h) => handles.get(&h).map_or(Region::Static, |&(f, s)| {
                    Region::Scope {
                        function: f,
                        scope: s,
                    }
                }),
                HandlerTarget::Boundary { function, .. } => Region::Caller(function),
            })
            .reduce(|a, b| regions.merge(a, b))
            .unwrap_or(Region::Static);
        class_regions.insert(id, region);
    }

    let mut loan_regions = Vec::with_capacity(views.len());
    let mut loan_classes = Vec::with_capacity(views.len());
    for (view, occurrences) in views.iter_mut().zip(&occurrences_per_view) {
        let mut by_loan: FxHashMap<LoanId, u32> = FxHashMap::default();
        for occ in occurrences {
            if let (Some(loan), Some(&class)) = (occ.loan, dense.get(&occ.class)) {
                by_loan.insert(loan, class);
            }
        }
        let mut lr = Vec::with_capacity(view.loans.loans.len());
        let mut lc = Vec::with_capacity(view.loans.loans.len());
        for loan in &view.loans.loans {
            // Reborrows live in the class of the reference they came from.
            let top = loan.ancestors.first().copied().unwrap_or(loan.id);
            let class = by_loan.get(&top).copied();
            let region = match loan.root {
                StorageRoot::Binding(owner) => view
                    .layout
                    .binding(owner)
                    .and_then(|b| b.scope)
                    .map_or(Region::Caller(view.func.name), |scope| Region::Scope {
                        function: view.func.name,
                        scope,
                    }),
                StorageRoot::Param(_) => Region::Caller(view.func.name),
                StorageRoot::External(_) => class
                    .and_then(|c| class_regions.get(&c).copied())
                    .unwrap_or(Region::Caller(view.func.name)),
            };
            lr.push(region);
            lc.push(class);
        }
        loan_regions.push(lr);
        loan_classes.push(lc);

        for cont in view.continuations.iter_mut() {
            cont.info.region = continuation_region(view.func, view.layout, cont, &regions);
        }
    }

    tracing::debug!(
        classes = members.len(),
        errors = errors.len(),
        "unified effect lifetimes"
    );
    LifetimeResult {
        loan_regions,
        loan_classes,
        regions: class_regions,
        classes: members,
        errors,
    }
}

fn collect_occurrences(
    view: &FunctionView<'_>,
    summaries: &Summaries,
    classes: &mut ClassTable,
) -> Vec<Occurrence> {
    let mut out = Vec::new();
    for loan in &view.loans.loans {
        if loan.parent.is_some() {
            continue;
        }
        let Some((effect, op)) = loan.origin.effect_op() else {
            continue;
        };
        let via = match loan.origin {
            LoanOrigin::CallEffect { callee, .. } => Some(callee),
            _ => None,
        };
        let Some(site) = view
            .handlers
            .sites_at(loan.expr)
            .find(|s| s.effect == effect && s.op == op && s.via == via)
        else {
            continue;
        };
        out.push(Occurrence {
            loan: Some(loan.id),
            class: classes.class_of((site.target, effect, op)),
            effect,
            op,
            range: loan.interval(),
            callee: None,
            span: loan.span,
        });
    }

    for site in &view.handlers.performs {
        let Some(callee) = site.via else {
            continue;
        };
        let owns = summaries
            .get(&callee)
            .is_some_and(|s| s.own_effect_ops.contains(&(site.effect, site.op)));
        if !owns {
            continue;
        }
        // The call's own result is already an occurrence.
        let returned = view
            .loans
            .by_expr
            .get(&site.expr)
            .and_then(|id| view.loans.get(*id))
            .and_then(|l| l.origin.effect_op())
            == Some((site.effect, site.op));
        if returned {
            continue;
        }
        let Some(range) = view.layout.expr_range(site.expr) else {
            continue;
        };
        out.push(Occurrence {
            loan: None,
            class: classes.class_of((site.target, site.effect, site.op)),
            effect: site.effect,
            op: site.op,
            range: PosRange::new(range.end, range.end),
            callee: Some(callee),
            span: site.span,
        });
    }
    out
}

fn occurrence_kind(kinds: &RefKinds, occ: &Occurrence) -> Option<RefKind> {
    match occ.loan {
        Some(id) => kinds.kind(id),
        None => Some(RefKind::Own),
    }
}

fn resolve_deferred(cx: &CheckCtx<'_>, view: &mut FunctionView<'_>, occurrences: &[Occurrence]) {
    for occ in occurrences {
        let Some(id) = occ.loan else {
            continue;
        };
        if view.kinds.kind(id).is_some() {
            continue;
        }
        let witness = occurrences.iter().find(|other| {
            other.loan != occ.loan && other.class == occ.class && other.range.overlaps(occ.range)
        });
        match witness {
            Some(other) => {
                if let Some(w) = other.loan {
                    view.kinds.witnesses.insert(id, w);
                }
                view.kinds.set(id, RefKind::Shared);
            }
            None => view.kinds.set(id, RefKind::Own),
        }
    }
    // Reborrows of effect references, now that their parents are known.
    for loan in &view.loans.loans {
        if view.kinds.kind(loan.id).is_none() {
            let kind =
                resolve_kind(cx, view.func, view.loans, view.kinds, loan).unwrap_or(RefKind::Shared);
            view.kinds.set(loan.id, kind);
        }
    }
}

fn check_class_conflicts(
    cx: &CheckCtx<'_>,
    view: &FunctionView<'_>,
    occurrences: &[Occurrence],
    errors: &mut Vec<BorrowckError>,
) {
    let mut reported: Vec<Span> = Vec::new();
    for (i, a) in occurrences.iter().enumerate() {
        for b in &occurrences[i + 1..] {
            if a.class != b.class || !a.range.overlaps(b.range) {
                continue;
            }
            let kinds = &*view.kinds;
            let owning = occurrence_kind(kinds, a) == Some(RefKind::Own)
                || occurrence_kind(kinds, b) == Some(RefKind::Own);
            if !owning {
                continue;
            }
            let (earlier, later) = if b.range.start < a.range.start {
                (b, a)
            } else {
                (a, b)
            };
            if reported.contains(&later.span) {
                continue;
            }
            reported.push(later.span);
            let op_path = cx.op_path(later.effect, later.op);
            let message = match later.callee {
                Some(callee) => format!(
                    "calling `{}` takes an owning reference from `{op_path}` while another reference from the same handler is live",
                    cx.name(callee)
                ),
                None => format!(
                    "cannot obtain a reference from `{op_path}` while an owning reference from the same handler is live"
                ),
            };
            let cause = match earlier.callee {
                Some(callee) => format!("`{}` takes an owning reference here", cx.name(callee)),
                None => "first reference obtained here".to_string(),
            };
            errors.push(
                BorrowckError::new(BorrowckErrorKind::AliasConflict, later.span, message)
                    .with_label("second reference obtained here")
                    .with_cause(earlier.span, cause)
                    .with_note(format!(
                        "references from `{op_path}` point into storage owned by the same handler"
                    )),
            );
            tracing::trace!(
                function = view.func.name.raw(),
                class = a.class,
                "owning effect references overlap"
            );
        }
    }
}

fn check_demands(cx: &CheckCtx<'_>, view: &FunctionView<'_>, errors: &mut Vec<BorrowckError>) {
    for demand in view.demands {
        let Some(loan) = view.loans.get(demand.loan) else {
            continue;
        };
        let kind = view.kinds.kind(demand.loan);
        let what = loan
            .origin
            .effect_op()
            .map_or_else(|| "this reference".to_string(), |(e, o)| {
                format!("the reference from `{}`", cx.op_path(e, o))
            });
        let err = match (demand.reason, kind) {
            (DemandReason::OwnParam, Some(RefKind::Shared)) => BorrowckError::new(
                BorrowckErrorKind::AliasConflict,
                demand.span,
                format!("an owning reference is required, but {what} is aliased"),
            )
            .with_label("owning reference required here"),
            (DemandReason::OwnParam, Some(RefKind::Stable)) => BorrowckError::new(
                BorrowckErrorKind::ShapeProjection,
                demand.span,
                format!("an owning reference is required, but {what} is stable"),
            )
            .with_label("owning reference required here"),
            (DemandReason::StableParam, Some(RefKind::Shared)) => BorrowckError::new(
                BorrowckErrorKind::ShapeProjection,
                demand.span,
                format!("a stable reference is required, but {what} is shared"),
            )
            .with_label("stable reference required here"),
            (DemandReason::Projection(crossing), Some(RefKind::Shared)) => BorrowckError::new(
                BorrowckErrorKind::AliasConflict,
                demand.span,
                format!(
                    "projecting {} needs an owning reference, but {what} is aliased",
                    crossing.describe()
                ),
            )
            .with_label("projection here"),
            _ => continue,
        };
        let mut err = err.with_cause(loan.span, "reference obtained here");
        if let Some(w) = view
            .kinds
            .witnesses
            .get(&demand.loan)
            .and_then(|w| view.loans.get(*w))
        {
            err = err.with_cause(w.span, "aliased by this reference");
        }
        errors.push(err);
    }
}

fn check_dangling(
    cx: &CheckCtx<'_>,
    view: &FunctionView<'_>,
    errors: &mut Vec<BorrowckError>,
) {
    let func = view.func;
    let layout = view.layout;
    let local_name = |var| func.local(var).map_or("<unknown>", |l| cx.name(l.name));

    for loan in &view.loans.loans {
        match loan.root {
            StorageRoot::Binding(owner) => {
                let name = local_name(owner);
                if loan.returned && loan.parent.is_none() {
                    errors.push(
                        BorrowckError::new(
                            BorrowckErrorKind::DanglingReference,
                            loan.span,
                            format!("cannot return a reference to local `{name}`"),
                        )
                        .with_label("returns a reference to data owned by this function")
                        .with_note(format!("`{name}` is dropped when the function returns")),
                    );
                    continue;
                }
                let Some(scope) = layout.binding(owner).and_then(|b| b.scope) else {
                    continue;
                };
                let Some(info) = layout.scopes.get(&scope) else {
                    continue;
                };
                let escaping = loan.holders.iter().find_map(|&h| {
                    layout
                        .binding(h)
                        .and_then(|b| b.uses.iter().find(|u| u.pos > info.range.end))
                        .map(|u| (h, u.span))
                });
                if let Some((holder, use_span)) = escaping {
                    errors.push(
                        BorrowckError::new(
                            BorrowckErrorKind::DanglingReference,
                            info.span,
                            format!("`{name}` does not live long enough"),
                        )
                        .with_label(format!("`{name}` dropped here while still borrowed"))
                        .with_cause(loan.span, format!("`{name}` borrowed here"))
                        .with_cause(
                            use_span,
                            format!("borrow later used here, through `{}`", local_name(holder)),
                        ),
                    );
                }
            }
            StorageRoot::External(_) if loan.parent.is_none() => {
                let Some((effect, op)) = loan.origin.effect_op() else {
                    continue;
                };
                let target = view
                    .handlers
                    .sites_at(loan.expr)
                    .find(|s| s.effect == effect && s.op == op)
                    .map(|s| s.target);
                let Some(HandlerTarget::Handler(h)) = target else {
                    continue;
                };
                let Some(handle) = view.handlers.handle(h) else {
                    continue;
                };
                let Some(body) = layout.scope_range(handle.body_scope) else {
                    continue;
                };
                if loan.end > body.end {
                    errors.push(
                        BorrowckError::new(
                            BorrowckErrorKind::DanglingReference,
                            loan.span,
                            format!(
                                "reference from `{}` outlives its handler",
                                cx.op_path(effect, op)
                            ),
                        )
                        .with_label("reference obtained here")
                        .with_cause(handle.span, "handler ends here")
                        .with_note("the handler owns the storage this reference points into"),
                    );
                }
            }
            StorageRoot::Param(_) | StorageRoot::External(_) => {}
        }
    }
}

fn continuation_region(
    func: &Function,
    layout: &Layout,
    cont: &ContinuationFacts,
    regions: &RegionTree<'_>,
) -> Region {
    cont.info
        .captures
        .iter()
        .map(|c| {
            if func.params.contains(&c.var) {
                return Region::Caller(func.name);
            }
            layout
                .binding(c.var)
                .and_then(|b| b.scope)
                .map_or(Region::Caller(func.name), |scope| Region::Scope {
                    function: func.name,
                    scope,
                })
        })
        .reduce(|a, b| regions.merge(a, b))
        .unwrap_or(Region::Scope {
            function: func.name,
            scope: cont.body_scope,
        })
}

/// Static, then each function's caller region, then its scopes.
struct RegionTree<'a> {
    layouts: &'a FxHashMap<Name, &'a Layout>,
}

impl RegionTree<'_> {
    fn parent(&self, region: Region) -> Option<Region> {
        match region {
            Region::Static => None,
            Region::Caller(_) => Some(Region::Static),
            Region::Scope { function, scope } => Some(
                self.layouts
                    .get(&function)
                    .and_then(|l| l.scopes.get(&scope))
                    .and_then(|s| s.parent)
                    .map_or(Region::Caller(function), |parent| Region::Scope {
                        function,
                        scope: parent,
                    }),
            ),
        }
    }

    /// Smallest region enclosing both.
    pub(crate) fn merge(&self, a: Region, b: Region) -> Region {
        let mut chain = vec![a];
        let mut current = a;
        while let Some(next) = self.parent(current) {
            chain.push(next);
            current = next;
        }
        let mut current = Some(b);
        while let Some(region) = current {
            if chain.contains(&region) {
                return region;
            }
            current = self.parent(region);
        }
        Region::Static
    }
}
