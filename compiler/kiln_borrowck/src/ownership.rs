//! Per-binding ownership state.
//!
//! [`OwnershipTracker`] is the linear state machine behind every binding:
//!
//! ```text
//! Owned ⇄ SharedBorrowed(n)      Owned ⇄ UniqueBorrowed      Owned → Moved
//! ```
//!
//! `Moved` is terminal until the binding is reassigned as a whole.
//!
//! Borrows are tracked as live loans on a [`StorageRoot`] plus a projection
//! path, so borrows of disjoint fields never conflict, and a reborrow never
//! conflicts with the loans it was derived from. The tracker is `Clone`: the
//! checker forks it at branches and [`join`](OwnershipTracker::join)s the
//! arms afterwards.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use kiln_ir::Span;

use crate::ir::{paths_overlap, ExprId, Projection, VarId};
use crate::layout::{Pos, PosRange};

/// Index into the function's loan table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct LoanId(u32);

impl LoanId {
    pub const fn new(raw: u32) -> Self {
        LoanId(raw)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The storage a loan points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum StorageRoot {
    /// A binding owned by this function.
    Binding(VarId),
    /// Whatever a reference-typed parameter points at.
    Param(VarId),
    /// Storage reached through a reference returned by a call or effect
    /// operation.
    External(ExprId),
}

/// Observable state of one binding.
#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnershipState {
    Owned,
    Moved,
    SharedBorrowed(u32),
    UniqueBorrowed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MoveState {
    Owned,
    Moved(Span),
    /// Moved on at least one path into a join.
    MaybeMoved(Span),
}

#[derive(Clone, Debug)]
struct ActiveLoan {
    id: LoanId,
    root: StorageRoot,
    path: SmallVec<[Projection; 4]>,
    unique: bool,
    start: Pos,
    end: Pos,
    span: Span,
}

/// A loan about to become live.
#[derive(Clone, Copy, Debug)]
pub struct LoanRequest<'a> {
    pub id: LoanId,
    pub root: StorageRoot,
    pub path: &'a [Projection],
    /// Loans this one was reborrowed from.
    pub ancestors: &'a [LoanId],
    pub start: Pos,
    pub end: Pos,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipError {
    UseAfterMove {
        var: VarId,
        moved_at: Span,
        /// Moved on some paths only.
        maybe: bool,
    },
    MoveWhileBorrowed {
        var: VarId,
        loan_span: Span,
    },
    /// The request overlaps a live loan it is not derived from.
    Conflict {
        existing_span: Span,
        existing_unique: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropOutcome {
    Dropped,
    Moved,
    MaybeMoved,
}

#[derive(Clone, Debug, Default)]
pub struct OwnershipTracker {
    moves: FxHashMap<VarId, MoveState>,
    loans: Vec<ActiveLoan>,
    /// Control left this path through `return` or `break`.
    unreachable: bool,
}

impl OwnershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, var: VarId) {
        self.moves.insert(var, MoveState::Owned);
    }

    /// Check that `var` still holds a value.
    pub fn use_var(&self, var: VarId) -> Result<(), OwnershipError> {
        match self.moves.get(&var) {
            Some(&MoveState::Moved(span)) => Err(OwnershipError::UseAfterMove {
                var,
                moved_at: span,
                maybe: false,
            }),
            Some(&MoveState::MaybeMoved(span)) => Err(OwnershipError::UseAfterMove {
                var,
                moved_at: span,
                maybe: true,
            }),
            _ => Ok(()),
        }
    }

    /// Direct access to a binding's own storage, bypassing its loans.
    pub fn access(&self, var: VarId, path: &[Projection]) -> Result<(), OwnershipError> {
        self.use_var(var)?;
        let root = StorageRoot::Binding(var);
        match self
            .loans
            .iter()
            .find(|l| l.unique && l.root == root && paths_overlap(&l.path, path))
        {
            Some(l) => Err(conflict(l)),
            None => Ok(()),
        }
    }

    pub fn move_out(&mut self, var: VarId, span: Span) -> Result<(), OwnershipError> {
        self.use_var(var)?;
        let root = StorageRoot::Binding(var);
        if let Some(l) = self.loans.iter().find(|l| l.root == root) {
            return Err(OwnershipError::MoveWhileBorrowed {
                var,
                loan_span: l.span,
            });
        }
        self.moves.insert(var, MoveState::Moved(span));
        Ok(())
    }

    /// Take a shared loan. Fails against an overlapping unique loan.
    pub fn borrow_shared(&mut self, req: LoanRequest<'_>) -> Result<(), OwnershipError> {
        self.borrow(req, false)
    }

    /// Take a unique loan. Fails against any overlapping loan.
    pub fn borrow_unique(&mut self, req: LoanRequest<'_>) -> Result<(), OwnershipError> {
        self.borrow(req, true)
    }

    fn borrow(&mut self, req: LoanRequest<'_>, unique: bool) -> Result<(), OwnershipError> {
        self.release(req.id);
        let blocker = self.loans.iter().find(|l| {
            l.root == req.root
                && (unique || l.unique)
                && !req.ancestors.contains(&l.id)
                && paths_overlap(&l.path, req.path)
        });
        if let Some(l) = blocker {
            return Err(conflict(l));
        }
        self.loans.push(ActiveLoan {
            id: req.id,
            root: req.root,
            path: req.path.iter().copied().collect(),
            unique,
            start: req.start,
            end: req.end,
            span: req.span,
        });
        Ok(())
    }

    pub fn release(&mut self, id: LoanId) {
        self.loans.retain(|l| l.id != id);
    }

    /// Release every loan whose live interval ended before `pos`.
    pub fn release_expired(&mut self, pos: Pos) {
        self.loans.retain(|l| l.end >= pos);
    }

    /// Release loans created inside `range` that do not outlive it.
    pub fn release_created_within(&mut self, range: PosRange) {
        self.loans
            .retain(|l| !(range.contains(l.start) && l.end <= range.end));
    }

    /// Whole-binding assignment: the binding holds a fresh value again.
    pub fn assign(&mut self, var: VarId) {
        self.moves.insert(var, MoveState::Owned);
    }

    /// Scope exit.
    pub fn drop_var(&mut self, var: VarId) -> DropOutcome {
        match self.moves.remove(&var) {
            Some(MoveState::Moved(_)) => DropOutcome::Moved,
            Some(MoveState::MaybeMoved(_)) => DropOutcome::MaybeMoved,
            _ => DropOutcome::Dropped,
        }
    }

    #[cfg(test)]
    pub fn state(&self, var: VarId) -> OwnershipState {
        if matches!(self.moves.get(&var), Some(MoveState::Moved(_))) {
            return OwnershipState::Moved;
        }
        let root = StorageRoot::Binding(var);
        let mut shared = 0;
        for l in self.loans.iter().filter(|l| l.root == root) {
            if l.unique {
                return OwnershipState::UniqueBorrowed;
            }
            shared += 1;
        }
        if shared == 0 {
            OwnershipState::Owned
        } else {
            OwnershipState::SharedBorrowed(shared)
        }
    }

    pub fn is_live(&self, id: LoanId) -> bool {
        self.loans.iter().any(|l| l.id == id)
    }

    /// Number of live unique loans on `root`.
    #[cfg(test)]
    pub fn unique_count(&self, root: StorageRoot) -> usize {
        self.loans
            .iter()
            .filter(|l| l.unique && l.root == root)
            .count()
    }

    /// The path ends here; a later [`join`](Self::join) ignores it.
    pub fn mark_unreachable(&mut self) {
        self.unreachable = true;
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    /// Merge the state flowing in from another control-flow path.
    pub fn join(&mut self, other: &OwnershipTracker) {
        if other.unreachable {
            return;
        }
        if self.unreachable {
            *self = other.clone();
            return;
        }
        for (&var, &theirs) in &other.moves {
            let merged = match (self.moves.get(&var).copied(), theirs) {
                (Some(MoveState::Moved(a)), MoveState::Moved(_)) => MoveState::Moved(a),
                (Some(MoveState::Owned) | None, MoveState::Owned) => MoveState::Owned,
                (Some(MoveState::Moved(s) | MoveState::MaybeMoved(s)), _)
                | (_, MoveState::Moved(s) | MoveState::MaybeMoved(s)) => MoveState::MaybeMoved(s),
            };
            self.moves.insert(var, merged);
        }
        for (&var, &ours) in &self.moves.clone() {
            if !other.moves.contains_key(&var) {
                if let MoveState::Moved(s) = ours {
                    self.moves.insert(var, MoveState::MaybeMoved(s));
                }
            }
        }
        for loan in &other.loans {
            if !self.is_live(loan.id) {
                self.loans.push(loan.clone());
            }
        }
    }
}

fn conflict(l: &ActiveLoan) -> OwnershipError {
    OwnershipError::Conflict {
        existing_span: l.span,
        existing_unique: l.unique,
    }
}
