//! Borrow checking errors.
//!
//! Phases report [`BorrowckError`] values; the driver converts them into
//! [`Diagnostic`]s once the whole unit has been visited. Malformed input is an
//! [`IrError`], reported as an internal diagnostic rather than a panic.

use std::fmt;

use kiln_diagnostic::{Diagnostic, ErrorCode};
use kiln_ir::{Name, Span};

use crate::ir::{EffectId, ExprId, OpId, VarId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BorrowckErrorKind {
    AliasConflict,
    ShapeProjection,
    UnhandledEffect,
    ResumeMultiplicity,
    CaptureMove,
    UnboundedContinuation,
    UseAfterMove,
    DanglingReference,
    NonSendCapture,
    ResumeOutsideHandler,
    ImmutableMutation,
    Internal,
}

impl BorrowckErrorKind {
    pub fn code(self) -> ErrorCode {
        match self {
            BorrowckErrorKind::AliasConflict => ErrorCode::E5001,
            BorrowckErrorKind::ShapeProjection => ErrorCode::E5002,
            BorrowckErrorKind::UnhandledEffect => ErrorCode::E5003,
            BorrowckErrorKind::ResumeMultiplicity => ErrorCode::E5004,
            BorrowckErrorKind::CaptureMove => ErrorCode::E5005,
            BorrowckErrorKind::UnboundedContinuation => ErrorCode::E5006,
            BorrowckErrorKind::UseAfterMove => ErrorCode::E5007,
            BorrowckErrorKind::DanglingReference => ErrorCode::E5008,
            BorrowckErrorKind::NonSendCapture => ErrorCode::E5009,
            BorrowckErrorKind::ResumeOutsideHandler => ErrorCode::E5010,
            BorrowckErrorKind::ImmutableMutation => ErrorCode::E5011,
            BorrowckErrorKind::Internal => ErrorCode::E9001,
        }
    }
}

impl fmt::Display for BorrowckErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BorrowckErrorKind::AliasConflict => "alias conflict",
            BorrowckErrorKind::ShapeProjection => "shape projection error",
            BorrowckErrorKind::UnhandledEffect => "unhandled effect",
            BorrowckErrorKind::ResumeMultiplicity => "resume multiplicity violation",
            BorrowckErrorKind::CaptureMove => "capture move violation",
            BorrowckErrorKind::UnboundedContinuation => "unbounded continuation",
            BorrowckErrorKind::UseAfterMove => "use after move",
            BorrowckErrorKind::DanglingReference => "dangling reference",
            BorrowckErrorKind::NonSendCapture => "non-sendable capture",
            BorrowckErrorKind::ResumeOutsideHandler => "resume outside handler",
            BorrowckErrorKind::ImmutableMutation => "immutable mutation",
            BorrowckErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// One step of the causal chain behind an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CauseLink {
    pub span: Span,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BorrowckError {
    pub kind: BorrowckErrorKind,
    pub message: String,
    pub span: Span,
    pub label: String,
    /// Originating borrow/effect sites, oldest first.
    pub causes: Vec<CauseLink>,
    pub notes: Vec<String>,
}

impl BorrowckError {
    pub fn new(kind: BorrowckErrorKind, span: Span, message: impl Into<String>) -> Self {
        BorrowckError {
            kind,
            message: message.into(),
            span,
            label: String::new(),
            causes: Vec::new(),
            notes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn with_cause(mut self, span: Span, message: impl Into<String>) -> Self {
        self.causes.push(CauseLink {
            span,
            message: message.into(),
        });
        self
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        let label = if self.label.is_empty() {
            self.kind.to_string()
        } else {
            self.label
        };
        let mut diag = Diagnostic::error(self.kind.code())
            .with_message(self.message)
            .with_label(self.span, label);
        for cause in self.causes {
            diag = diag.with_secondary_label(cause.span, cause.message);
        }
        for note in self.notes {
            diag = diag.with_note(note);
        }
        diag
    }
}

/// Malformed input: the IR violates an invariant upstream lowering promises.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IrError {
    #[error("unknown effect #{effect:?}")]
    UnknownEffect { effect: EffectId, span: Span },
    #[error("effect #{effect:?} has no operation #{op:?}")]
    UnknownOp {
        effect: EffectId,
        op: OpId,
        span: Span,
    },
    #[error("call to unknown function {callee:?}")]
    UnknownFunction { callee: Name, span: Span },
    #[error("binding {var:?} is not declared in this function")]
    UnknownVar { var: VarId, span: Span },
    #[error("projection does not match the type of the place")]
    BadProjection { span: Span },
    #[error("expression {expr:?} should have a reference type")]
    NotAReference { expr: ExprId, span: Span },
}

impl IrError {
    pub fn span(&self) -> Span {
        match self {
            IrError::UnknownEffect { span, .. }
            | IrError::UnknownOp { span, .. }
            | IrError::UnknownFunction { span, .. }
            | IrError::UnknownVar { span, .. }
            | IrError::BadProjection { span }
            | IrError::NotAReference { span, .. } => *span,
        }
    }
}

impl From<IrError> for BorrowckError {
    fn from(err: IrError) -> Self {
        BorrowckError::new(
            BorrowckErrorKind::Internal,
            err.span(),
            format!("malformed borrow-check input: {err}"),
        )
        .with_note("this is a bug in an earlier compiler phase")
    }
}
