//! Effect-aware borrow checking for the Kiln compiler.
//!
//! The checker runs after type inference and before code generation. It
//! consumes a typed module ([`ir::Module`]) and produces a
//! [`BorrowckOutput`]: a capability for every reference, capture sets and
//! boxing decisions for every handler continuation, drop points for owned
//! bindings, and the diagnostics for everything it rejects.
//!
//! # Reference kinds
//!
//! References carry one of four capabilities ([`RefKind`]):
//!
//! - **Own**: the only live reference to its target. May project into
//!   union payloads and container elements, and may change the target's
//!   shape.
//! - **Shared**: possibly aliased. May mutate, but only through
//!   shape-preserving projections.
//! - **Stable**: may project anywhere, but only shape-preserving writes.
//! - **Polymorphic**: undecided in the source; the checker picks `Own` when
//!   nothing overlaps the reference and `Shared` otherwise.
//!
//! # Phases
//!
//! 1. [`summary`]: what each function returns and which owning effect
//!    references it takes internally (fixed point over the call graph).
//! 2. Per function, in parallel when configured: scope [`layout`], handler
//!    resolution ([`handlers`]), loan collection ([`loans`]), reference
//!    classification and ownership enforcement ([`refkind`]), and resume
//!    multiplicity and capture analysis ([`resume`]).
//! 3. [`lifetime`]: unification of effect-sourced references across
//!    functions, region assignment and dangling-reference detection.
//! 4. [`boxing`]: heap allocation for recursive and loop-reentered
//!    continuations.
//!
//! # Crate Dependencies
//!
//! `kiln_borrowck` depends on `kiln_types` (for `Pool`/`Idx`/`RefKind`),
//! `kiln_ir` (for `Name`, `Span` and the interner) and `kiln_diagnostic`
//! for reporting.
//!
//! [`RefKind`]: kiln_types::RefKind

mod boxing;
pub mod builder;
mod check;
pub mod config;
mod context;
pub mod error;
mod handlers;
pub mod ir;
mod layout;
mod lifetime;
mod loans;
pub mod output;
mod ownership;
mod place;
mod refkind;
mod resume;
mod send;
mod shape;
mod summary;

#[cfg(test)]
mod test_helpers;

pub use builder::{FunctionBuilder, ModuleBuilder, OpSpec};
pub use check::check_module;
pub use config::{BorrowckConfig, LoopResumePolicy};
pub use error::{BorrowckError, BorrowckErrorKind, CauseLink, IrError};
pub use handlers::HandlerTarget;
pub use ir::{EffectId, ExprId, HandlerId, Module, Multiplicity, OpId, ScopeId, VarId};
pub use output::{
    BorrowckOutput, BoxDecision, BoxReason, CallingConvention, Capture, CaptureMode,
    ContinuationInfo, ContinuationKey, DropKind, DropPoint, RefTag, Region,
};
pub use shape::{ShapeAnalyzer, ShapeStability};
pub use summary::{FnSummary, ReturnSource};
