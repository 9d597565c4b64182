//! Annotations handed to code generation.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use kiln_diagnostic::{Diagnostic, ErrorGuaranteed};
use kiln_ir::{Name, Span};
use kiln_types::{Idx, Mutability, RefKind};

use crate::handlers::HandlerTarget;
use crate::ir::{EffectId, ExprId, HandlerId, Multiplicity, OpId, ScopeId, VarId};

/// How a reference is passed at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum CallingConvention {
    /// The referent is small and nothing else can observe it; pass a copy.
    ByValue,
    /// Exclusive or stable access through a pointer.
    ByPointer,
    /// Possibly aliased: every access goes through the shared storage.
    PointerAlias,
}

/// Abstract lifetime of a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Region {
    /// Outlives every function.
    Static,
    /// Supplied by the caller of `function`.
    Caller(Name),
    /// Ends when `scope` of `function` exits.
    Scope { function: Name, scope: ScopeId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct RefTag {
    pub function: Name,
    /// Creating expression; the `match` for by-reference arm bindings.
    pub expr: ExprId,
    /// Set for by-reference arm bindings.
    pub binding: Option<VarId>,
    pub kind: RefKind,
    pub mutability: Mutability,
    pub region: Region,
    pub convention: CallingConvention,
    /// Unification class, for effect-sourced references.
    pub class: Option<u32>,
}

/// Descriptor identity: one synthesized closure type per handler clause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct ContinuationKey {
    pub handler: HandlerId,
    pub op: OpId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum CaptureMode {
    /// Moved into the continuation's environment.
    ByValue,
    /// Borrowed from the enclosing frame.
    ByRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct Capture {
    pub var: VarId,
    pub name: Name,
    pub ty: Idx,
    pub mode: CaptureMode,
    /// Stored behind a heap indirection to bound the environment's size.
    pub boxed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct ContinuationInfo {
    pub key: ContinuationKey,
    pub function: Name,
    pub effect: EffectId,
    pub declared: Multiplicity,
    pub multiplicity: Multiplicity,
    /// Exactly one resume on every path, in tail position: no
    /// continuation object is materialized.
    pub tail_resumptive: bool,
    pub captures: Vec<Capture>,
    pub requires_send: bool,
    /// The whole continuation lives on the heap.
    pub boxed: bool,
    pub region: Region,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum BoxReason {
    /// A capture holds a continuation of a type on the same cycle.
    RecursiveCapture { via: ContinuationKey },
    /// A non-tail reentrant continuation resumed inside a loop.
    LoopReentry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct BoxDecision {
    pub key: ContinuationKey,
    /// Boxed capture; `None` boxes the whole continuation.
    pub capture: Option<VarId>,
    pub reason: BoxReason,
    pub region: Region,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum DropKind {
    /// Dropped when its scope exits.
    ScopeExit(ScopeId),
    /// Ownership left before scope exit; nothing to drop.
    Moved,
    /// Moved on some paths only: needs a runtime drop flag.
    Conditional(ScopeId),
    /// Captured by value into a `Once` continuation; dropped after its
    /// single invocation.
    AfterResume(ContinuationKey),
    /// Captured by a continuation its clause never resumes; released on
    /// clause entry.
    ContinuationDropped(ContinuationKey),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct DropPoint {
    pub function: Name,
    pub var: VarId,
    pub kind: DropKind,
    pub span: Span,
}

/// Everything the checker produces for one compilation unit.
#[derive(Clone, Debug, Default)]
pub struct BorrowckOutput {
    pub ref_tags: FxHashMap<ExprId, SmallVec<[RefTag; 1]>>,
    pub continuations: Vec<ContinuationInfo>,
    pub boxes: Vec<BoxDecision>,
    pub drops: Vec<DropPoint>,
    /// Region of each unification class.
    pub regions: FxHashMap<u32, Region>,
    /// Members of each unification class.
    pub classes: FxHashMap<u32, Vec<(HandlerTarget, EffectId, OpId)>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BorrowckOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    pub fn into_result(self) -> Result<Self, ErrorGuaranteed> {
        match ErrorGuaranteed::from_error_count(self.error_count()) {
            Some(guarantee) => Err(guarantee),
            None => Ok(self),
        }
    }

    /// The reference created by `expr` (the first, for a `match`).
    pub fn ref_tag(&self, expr: ExprId) -> Option<&RefTag> {
        self.ref_tags.get(&expr).and_then(|tags| tags.first())
    }

    pub fn continuation(&self, key: ContinuationKey) -> Option<&ContinuationInfo> {
        self.continuations.iter().find(|c| c.key == key)
    }

    pub fn drops_of(&self, function: Name, var: VarId) -> impl Iterator<Item = &DropPoint> {
        self.drops
            .iter()
            .filter(move |d| d.function == function && d.var == var)
    }
}
