//! Typed, tree-shaped input IR.
//!
//! Upstream lowering hands the checker fully type-inferred, trait-resolved
//! functions. Every expression carries its type from the shared [`Pool`]
//! and a module-unique [`ExprId`]; bindings are function-local [`VarId`]s
//! indexing into [`Function::locals`].
//!
//! [`Pool`]: kiln_types::Pool

use kiln_ir::{Name, Span};
use kiln_types::{Idx, Mutability};
use smallvec::SmallVec;

macro_rules! index_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }

            /// Get the index as `usize` (for indexing into `Vec`s).
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

index_newtype!(
    /// Function-local binding, an index into [`Function::locals`].
    VarId
);
index_newtype!(
    /// Module-unique expression identity.
    ExprId
);
index_newtype!(
    /// Function-local lexical scope, one per [`Block`].
    ScopeId
);
index_newtype!(
    /// Index into [`Module::effects`].
    EffectId
);
index_newtype!(
    /// Operation index within its effect declaration.
    OpId
);
index_newtype!(
    /// Module-unique identity of a `handle` node.
    HandlerId
);

/// How many times a continuation may be resumed.
///
/// Ordered from most to least restrictive, so `inferred > declared` is a
/// contract violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Multiplicity {
    /// At most one resume.
    Once,
    /// Reentrant, sequential resumes.
    Mut,
    /// Concurrent resumes; captures must be sendable.
    Many,
}

impl Multiplicity {
    pub fn as_str(self) -> &'static str {
        match self {
            Multiplicity::Once => "once",
            Multiplicity::Mut => "mut",
            Multiplicity::Many => "many",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Module {
    pub effects: Vec<EffectDecl>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn effect(&self, id: EffectId) -> Option<&EffectDecl> {
        self.effects.get(id.index())
    }

    pub fn op(&self, effect: EffectId, op: OpId) -> Option<&OpDecl> {
        self.effect(effect).and_then(|e| e.ops.get(op.index()))
    }

    pub fn function(&self, name: Name) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Clone, Debug)]
pub struct EffectDecl {
    pub id: EffectId,
    pub name: Name,
    pub ops: Vec<OpDecl>,
    pub span: Span,
}

impl EffectDecl {
    pub fn op_ids(&self) -> impl Iterator<Item = OpId> + '_ {
        (0..self.ops.len()).map(|i| OpId::new(u32::try_from(i).unwrap_or(u32::MAX)))
    }
}

#[derive(Clone, Debug)]
pub struct OpDecl {
    pub name: Name,
    pub params: Vec<Idx>,
    pub ret: Idx,
    /// Declared resume contract; `None` takes the configured default.
    pub multiplicity: Option<Multiplicity>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct Local {
    pub name: Name,
    pub ty: Idx,
    pub mutable: bool,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: Name,
    pub params: Vec<VarId>,
    pub return_type: Idx,
    /// Declared effect set: effects this function may leave unhandled.
    pub effects: Vec<EffectId>,
    pub locals: Vec<Local>,
    pub body: Block,
    pub span: Span,
}

impl Function {
    pub fn local(&self, var: VarId) -> Option<&Local> {
        self.locals.get(var.index())
    }

    pub fn declares(&self, effect: EffectId) -> bool {
        self.effects.contains(&effect)
    }

    pub fn var_ids(&self) -> impl Iterator<Item = VarId> {
        (0..self.locals.len()).map(|i| VarId::new(u32::try_from(i).unwrap_or(u32::MAX)))
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub scope: ScopeId,
    pub stmts: Vec<Stmt>,
    pub tail: Option<Box<Expr>>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Let { var: VarId, init: Expr, span: Span },
    Expr(Expr),
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
    pub ty: Idx,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Literal,
    /// Copying read of a whole binding.
    Var(VarId),
    /// Explicit move out of a binding.
    Move(VarId),
    /// Create a reference to a place. The expression type is the reference type.
    Borrow {
        place: Place,
        mutability: Mutability,
    },
    /// Read the value at a place.
    Read(Place),
    Assign {
        place: Place,
        value: Box<Expr>,
    },
    /// Build an aggregate (struct, tuple, variant) from its parts.
    Construct {
        args: Vec<Expr>,
    },
    Call {
        callee: Name,
        args: Vec<Expr>,
    },
    Perform {
        effect: EffectId,
        op: OpId,
        args: Vec<Expr>,
    },
    Handle {
        body: Block,
        handler: Handler,
    },
    /// Invoke the current clause's continuation.
    Resume {
        value: Box<Expr>,
    },
    /// The current clause's continuation as a first-class value.
    ResumeValue,
    /// Run a block on another thread.
    Spawn {
        body: Block,
    },
    If {
        cond: Box<Expr>,
        then_block: Block,
        else_block: Option<Block>,
    },
    Match {
        scrutinee: Place,
        arms: Vec<MatchArm>,
    },
    Loop {
        body: Block,
    },
    Break,
    Return(Option<Box<Expr>>),
    Block(Block),
}

#[derive(Clone, Debug)]
pub struct Handler {
    pub id: HandlerId,
    pub effect: EffectId,
    pub clauses: Vec<Clause>,
}

impl Handler {
    pub fn clause(&self, op: OpId) -> Option<&Clause> {
        self.clauses.iter().find(|c| c.op == op)
    }
}

#[derive(Clone, Debug)]
pub struct Clause {
    pub op: OpId,
    pub params: Vec<VarId>,
    pub body: Block,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct MatchArm {
    pub variant: u32,
    pub bindings: Vec<ArmBinding>,
    pub body: Block,
    pub span: Span,
}

#[derive(Clone, Copy, Debug)]
pub struct ArmBinding {
    pub var: VarId,
    /// Payload field of the matched variant.
    pub field: u32,
    pub mode: BindingMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingMode {
    Copy,
    Move,
    Ref(Mutability),
}

/// A memory location: a binding followed by projections.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Place {
    pub base: VarId,
    pub projections: SmallVec<[Projection; 2]>,
}

impl Place {
    pub fn var(base: VarId) -> Self {
        Place {
            base,
            projections: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn deref(mut self) -> Self {
        self.projections.push(Projection::Deref);
        self
    }

    #[must_use]
    pub fn field(mut self, index: u32) -> Self {
        self.projections.push(Projection::Field(index));
        self
    }

    #[must_use]
    pub fn variant(mut self, variant: u32, field: u32) -> Self {
        self.projections.push(Projection::Variant { variant, field });
        self
    }

    #[must_use]
    pub fn index(mut self) -> Self {
        self.projections.push(Projection::Index);
        self
    }

    pub fn is_whole_binding(&self) -> bool {
        self.projections.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Projection {
    /// Through a reference, box or rc.
    Deref,
    /// Struct field or tuple element.
    Field(u32),
    /// Payload field of a specific union variant.
    Variant { variant: u32, field: u32 },
    /// Container element.
    Index,
}

impl Projection {
    /// Whether two projections at the same depth may address overlapping memory.
    pub fn may_overlap(self, other: Projection) -> bool {
        match (self, other) {
            (Projection::Field(a), Projection::Field(b)) => a == b,
            (
                Projection::Variant {
                    variant: va,
                    field: fa,
                },
                Projection::Variant {
                    variant: vb,
                    field: fb,
                },
            ) => va != vb || fa == fb,
            _ => true,
        }
    }
}

/// Whether two projection paths from the same storage overlap: one is a
/// prefix of the other, modulo disjoint fields.
pub fn paths_overlap(a: &[Projection], b: &[Projection]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x.may_overlap(*y))
}
