//! Compact type item storage.

use crate::{Idx, Tag};

/// A single type item in the pool.
///
/// `data` is a child `Idx` for wrapper tags and an index into the pool's
/// `extra` array for compound and named tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Item {
    pub tag: Tag,
    pub data: u32,
}

impl Item {
    #[inline]
    pub const fn new(tag: Tag, data: u32) -> Self {
        Self { tag, data }
    }

    #[inline]
    pub const fn primitive(tag: Tag) -> Self {
        Self { tag, data: 0 }
    }

    #[inline]
    pub const fn wrapper(tag: Tag, child: Idx) -> Self {
        Self {
            tag,
            data: child.raw(),
        }
    }

    /// The child type of a wrapper item.
    #[inline]
    pub const fn child(self) -> Idx {
        Idx::from_raw(self.data)
    }
}
