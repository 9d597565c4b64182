//! Reference capabilities.

use std::fmt;

use crate::Idx;

/// Capability of a reference.
///
/// - `Own`: the only live reference to its target; may project anywhere.
/// - `Shared`: possibly aliased; may mutate, projects only shape-preserving.
/// - `Stable`: may project anywhere, mutates only shape-preserving.
/// - `Polymorphic`: not yet decided; the borrow checker picks `Own` or `Shared`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum RefKind {
    Own,
    Shared,
    Stable,
    Polymorphic,
}

impl RefKind {
    pub(crate) const fn to_raw(self) -> u32 {
        match self {
            RefKind::Own => 0,
            RefKind::Shared => 1,
            RefKind::Stable => 2,
            RefKind::Polymorphic => 3,
        }
    }

    pub(crate) const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => RefKind::Own,
            1 => RefKind::Shared,
            2 => RefKind::Stable,
            _ => RefKind::Polymorphic,
        }
    }

    /// Whether a reference of this kind may project into shape-unstable
    /// interior (union payloads, container elements, through boxes).
    #[inline]
    pub const fn can_project_unstable(self) -> bool {
        matches!(self, RefKind::Own | RefKind::Stable)
    }

    /// Whether a reference of this kind may perform shape-changing mutation.
    #[inline]
    pub const fn can_mutate_unstable(self) -> bool {
        matches!(self, RefKind::Own | RefKind::Shared)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RefKind::Own => "own",
            RefKind::Shared => "shared",
            RefKind::Stable => "stable",
            RefKind::Polymorphic => "poly",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum Mutability {
    Mut,
    Imm,
}

impl Mutability {
    #[inline]
    pub const fn is_mut(self) -> bool {
        matches!(self, Mutability::Mut)
    }
}

/// Decoded view of a `Tag::Ref` pool item.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct RefType {
    pub kind: RefKind,
    pub mutability: Mutability,
    pub target: Idx,
}
