//! Type kind tag.
//!
//! Tags are grouped by how an `Item`'s data word is interpreted:
//! - 0-15: Primitives (data unused)
//! - 16-31: Single-child wrappers (data = child `Idx`)
//! - 32-63: Compound types (data = index into `extra`)
//! - 80-95: Named types (data = index into `extra`)

use std::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u8)]
pub enum Tag {
    // === Primitives (0-15) ===
    Int = 0,
    Float = 1,
    Bool = 2,
    Str = 3,
    Char = 4,
    Byte = 5,
    Unit = 6,
    Never = 7,
    Error = 8,

    // === Single-child wrappers (16-31) ===
    /// Growable vector `[T]`.
    Vec = 16,
    /// Owned heap box `box<T>`.
    Box = 17,
    /// Reference-counted shared pointer `rc<T>`.
    Rc = 18,

    // === Compound (32-63) ===
    /// Hash map `{K: V}`. Extra: `[key, value]`.
    Map = 32,
    /// Reference `&kind mut? T`. Extra: `[kind, mutability, target]`.
    Ref = 33,
    /// Tuple. Extra: `[len, elems...]`.
    Tuple = 34,
    /// Struct. Extra: `[name, len, (field_name, field_ty)*]`.
    Struct = 35,
    /// Tagged union. Extra: `[name, variant_count, (variant_name, field_count, fields*)*]`.
    Enum = 36,
    /// Resume continuation `cont<handler, op>`. Extra: `[handler, op]`.
    Continuation = 37,

    // === Named (80-95) ===
    /// Nominal type, possibly recursive. Extra: `[name, body]`.
    Named = 80,
}

impl Tag {
    /// Wrappers that place their child behind a pointer.
    #[inline]
    pub const fn is_indirection(self) -> bool {
        matches!(self, Tag::Box | Tag::Rc | Tag::Ref)
    }

    /// Containers whose storage may reallocate on mutation.
    #[inline]
    pub const fn is_growable(self) -> bool {
        matches!(self, Tag::Str | Tag::Vec | Tag::Map)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Tag::Int => "int",
            Tag::Float => "float",
            Tag::Bool => "bool",
            Tag::Str => "str",
            Tag::Char => "char",
            Tag::Byte => "byte",
            Tag::Unit => "unit",
            Tag::Never => "never",
            Tag::Error => "error",
            Tag::Vec => "vec",
            Tag::Box => "box",
            Tag::Rc => "rc",
            Tag::Map => "map",
            Tag::Ref => "ref",
            Tag::Tuple => "tuple",
            Tag::Struct => "struct",
            Tag::Enum => "enum",
            Tag::Continuation => "cont",
            Tag::Named => "named",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
