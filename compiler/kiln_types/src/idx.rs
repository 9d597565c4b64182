//! Type index handle.

use std::fmt;

/// A 32-bit index into the type pool.
///
/// Primitive types have fixed indices so they can be named without a pool.
/// Equality is index equality: structurally identical compound types are
/// deduplicated at construction.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Idx(u32);

impl Idx {
    // === Primitive Types (indices 0-8) ===

    /// The `int` type (64-bit signed integer).
    pub const INT: Self = Self(0);
    /// The `float` type.
    pub const FLOAT: Self = Self(1);
    /// The `bool` type.
    pub const BOOL: Self = Self(2);
    /// The growable UTF-8 `str` type.
    pub const STR: Self = Self(3);
    /// The `char` type.
    pub const CHAR: Self = Self(4);
    /// The `byte` type.
    pub const BYTE: Self = Self(5);
    /// The unit type `()`.
    pub const UNIT: Self = Self(6);
    /// The never type.
    pub const NEVER: Self = Self(7);
    /// Placeholder for upstream type errors.
    pub const ERROR: Self = Self(8);

    /// Number of pre-interned primitive types.
    pub const PRIMITIVE_COUNT: u32 = 9;

    /// Sentinel value indicating no type.
    pub const NONE: Self = Self(u32::MAX);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_primitive(self) -> bool {
        self.0 < Self::PRIMITIVE_COUNT
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Human-readable name for primitive types.
    pub const fn name(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("int"),
            1 => Some("float"),
            2 => Some("bool"),
            3 => Some("str"),
            4 => Some("char"),
            5 => Some("byte"),
            6 => Some("()"),
            7 => Some("never"),
            8 => Some("<error>"),
            _ => None,
        }
    }
}

impl fmt::Debug for Idx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Idx::{name}"),
            None if self.is_none() => write!(f, "Idx::NONE"),
            None => write!(f, "Idx({})", self.0),
        }
    }
}
