//! Continuation boxing.
//!
//! Every handler clause gets one synthesized continuation type, identified by
//! its [`ContinuationKey`]. A continuation that captures, by value and
//! without indirection, a continuation of a type that in turn reaches back
//! to the first has no finite size. The planner walks the capture graph to
//! a fixed point, breaking each cycle by heap-allocating one of its
//! captures.
//!
//! A capture cannot be moved to the heap while another capture of the same
//! continuation holds a live reference into it; a cycle made only of such
//! captures is an [`UnboundedContinuation`](BorrowckErrorKind::UnboundedContinuation)
//! error.

use rustc_hash::FxHashMap;

use kiln_types::{Idx, Pool, Tag};

use crate::config::LoopResumePolicy;
use crate::context::CheckCtx;
use crate::error::{BorrowckError, BorrowckErrorKind};
use crate::ir::{HandlerId, Multiplicity, OpId, VarId};
use crate::output::{BoxDecision, BoxReason, CaptureMode, ContinuationKey};
use crate::resume::ContinuationFacts;

pub(crate) struct BoxPlan {
    pub boxes: Vec<BoxDecision>,
    pub errors: Vec<BorrowckError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EdgeState {
    Inline,
    Boxed,
    /// Part of a cycle that could not be broken; already reported.
    Rejected,
}

#[derive(Clone, Copy, Debug)]
struct Edge {
    from: usize,
    to: usize,
    var: VarId,
    state: EdgeState,
}

/// Continuation types `ty` stores inline, not behind a pointer.
fn inline_continuations(pool: &Pool, ty: Idx, out: &mut Vec<ContinuationKey>, seen: &mut Vec<Idx>) {
    let ty = pool.strip_named(ty);
    if seen.contains(&ty) {
        return;
    }
    seen.push(ty);
    match pool.tag(ty) {
        Tag::Continuation => {
            if let Some((handler, op)) = pool.continuation_parts(ty) {
                out.push(ContinuationKey {
                    handler: HandlerId::new(handler),
                    op: OpId::new(op),
                });
            }
        }
        Tag::Tuple => {
            for elem in pool.tuple_elems(ty) {
                inline_continuations(pool, elem, out, seen);
            }
        }
        Tag::Struct => {
            for (_, field) in pool.struct_fields(ty) {
                inline_continuations(pool, field, out, seen);
            }
        }
        Tag::Enum => {
            for (_, fields) in pool.enum_variants(ty) {
                for field in fields {
                    inline_continuations(pool, field, out, seen);
                }
            }
        }
        _ => {}
    }
}

pub(crate) fn plan_boxes(cx: &CheckCtx<'_>, continuations: &mut [ContinuationFacts]) -> BoxPlan {
    let mut plan = BoxPlan {
        boxes: Vec::new(),
        errors: Vec::new(),
    };
    let index: FxHashMap<ContinuationKey, usize> = continuations
        .iter()
        .enumerate()
        .map(|(i, c)| (c.info.key, i))
        .collect();

    let mut edges = Vec::new();
    for (from, cont) in continuations.iter().enumerate() {
        for capture in &cont.info.captures {
            if capture.mode != CaptureMode::ByValue {
                continue;
            }
            let mut keys = Vec::new();
            inline_continuations(cx.pool, capture.ty, &mut keys, &mut Vec::new());
            for key in keys {
                if let Some(&to) = index.get(&key) {
                    edges.push(Edge {
                        from,
                        to,
                        var: capture.var,
                        state: EdgeState::Inline,
                    });
                }
            }
        }
    }

    let mut rounds = 0usize;
    while let Some(cycle) = find_cycle(continuations.len(), &edges) {
        rounds += 1;
        let breakable = cycle
            .iter()
            .copied()
            .find(|&e| !continuations[edges[e].from].pinned.contains(&edges[e].var));
        match breakable {
            Some(e) => {
                let Edge { from, to, var, .. } = edges[e];
                // Every inline edge through this capture goes away with it.
                for edge in &mut edges {
                    if edge.from == from && edge.var == var {
                        edge.state = EdgeState::Boxed;
                    }
                }
                let via = continuations[to].info.key;
                let cont = &mut continuations[from];
                for capture in &mut cont.info.captures {
                    if capture.var == var {
                        capture.boxed = true;
                    }
                }
                tracing::trace!(
                    handler = cont.info.key.handler.raw(),
                    op = cont.info.key.op.raw(),
                    var = var.raw(),
                    "boxing recursive capture"
                );
                plan.boxes.push(BoxDecision {
                    key: cont.info.key,
                    capture: Some(var),
                    reason: BoxReason::RecursiveCapture { via },
                    region: cont.info.region,
                });
            }
            None => {
                plan.errors.push(unbounded_cycle(cx, continuations, &edges, &cycle));
                for &e in &cycle {
                    edges[e].state = EdgeState::Rejected;
                }
            }
        }
    }

    for cont in continuations.iter_mut() {
        let Some(loop_span) = cont.resumed_in_loop else {
            continue;
        };
        if cont.info.multiplicity != Multiplicity::Mut || cont.info.tail_resumptive {
            continue;
        }
        match cx.config.loop_resume {
            LoopResumePolicy::BoxFallback => {
                cont.info.boxed = true;
                plan.boxes.push(BoxDecision {
                    key: cont.info.key,
                    capture: None,
                    reason: BoxReason::LoopReentry,
                    region: cont.info.region,
                });
            }
            LoopResumePolicy::RequireTail => {
                let op_path = cx.op_path(cont.info.effect, cont.info.key.op);
                plan.errors.push(
                    BorrowckError::new(
                        BorrowckErrorKind::UnboundedContinuation,
                        loop_span,
                        format!("continuation of `{op_path}` is resumed inside a loop"),
                    )
                    .with_label("resumed on every iteration here")
                    .with_cause(cont.info.span, "in this handler clause")
                    .with_note("only tail resumes are allowed in loops under the current policy"),
                );
            }
        }
    }

    tracing::debug!(
        continuations = continuations.len(),
        boxes = plan.boxes.len(),
        rounds,
        "planned continuation boxing"
    );
    plan
}

fn unbounded_cycle(
    cx: &CheckCtx<'_>,
    continuations: &[ContinuationFacts],
    edges: &[Edge],
    cycle: &[usize],
) -> BorrowckError {
    let first = &continuations[edges[cycle[0]].from];
    let op_path = cx.op_path(first.info.effect, first.info.key.op);
    let mut err = BorrowckError::new(
        BorrowckErrorKind::UnboundedContinuation,
        first.info.span,
        format!("continuation of `{op_path}` contains itself and cannot be boxed"),
    )
    .with_label("recursive continuation type");
    for &e in cycle {
        let edge = edges[e];
        let cont = &continuations[edge.from];
        let name = cont
            .info
            .captures
            .iter()
            .find(|c| c.var == edge.var)
            .map_or("<unknown>", |c| cx.name(c.name));
        err = err.with_cause(
            cont.info.span,
            format!("captures `{name}`, which a live reference points into"),
        );
    }
    err.with_note("a borrowed capture cannot be moved to the heap")
}

/// Edge indices of some cycle of inline edges.
fn find_cycle(nodes: usize, edges: &[Edge]) -> Option<Vec<usize>> {
    let mut state = vec![Visit::New; nodes];
    let mut path = Vec::new();
    (0..nodes).find_map(|start| {
        if state[start] == Visit::New {
            visit(start, edges, &mut state, &mut path)
        } else {
            None
        }
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    OnStack,
    Done,
}

fn visit(node: usize, edges: &[Edge], state: &mut [Visit], path: &mut Vec<usize>) -> Option<Vec<usize>> {
    state[node] = Visit::OnStack;
    for (e, edge) in edges.iter().enumerate() {
        if edge.from != node || edge.state != EdgeState::Inline {
            continue;
        }
        match state[edge.to] {
            Visit::OnStack => {
                let begin = path
                    .iter()
                    .position(|&p| edges[p].from == edge.to)
                    .unwrap_or(path.len());
                let mut cycle = path[begin..].to_vec();
                cycle.push(e);
                return Some(cycle);
            }
            Visit::New => {
                path.push(e);
                if let Some(cycle) = visit(edge.to, edges, state, path) {
                    return Some(cycle);
                }
                path.pop();
            }
            Visit::Done => {}
        }
    }
    state[node] = Visit::Done;
    None
}
