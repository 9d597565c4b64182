//! The type pool.
//!
//! Structural types are hash-consed: building the same type twice yields the
//! same `Idx`. Named types are nominal and are created empty, then given a
//! body with [`Pool::define`], which is how recursive types are tied.

mod construct;
mod format;

use kiln_ir::Name;
use rustc_hash::FxHashMap;

use crate::{Idx, Item, Mutability, RefKind, RefType, Tag};

/// Unified storage for every type in a compilation unit.
#[derive(Clone, Debug)]
pub struct Pool {
    items: Vec<Item>,
    extra: Vec<u32>,
    wrappers: FxHashMap<Item, Idx>,
    compounds: FxHashMap<(Tag, Vec<u32>), Idx>,
}

const PRIMITIVE_TAGS: [Tag; Idx::PRIMITIVE_COUNT as usize] = [
    Tag::Int,
    Tag::Float,
    Tag::Bool,
    Tag::Str,
    Tag::Char,
    Tag::Byte,
    Tag::Unit,
    Tag::Never,
    Tag::Error,
];

impl Pool {
    /// Create a pool with the primitive types pre-interned.
    pub fn new() -> Self {
        Self {
            items: PRIMITIVE_TAGS.iter().map(|&t| Item::primitive(t)).collect(),
            extra: Vec::new(),
            wrappers: FxHashMap::default(),
            compounds: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn next_idx(&self) -> Idx {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "pool sizes beyond u32::MAX are not supported"
        )]
        let raw = self.items.len() as u32;
        Idx::from_raw(raw)
    }

    fn next_extra(&self) -> u32 {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "extra array sizes beyond u32::MAX are not supported"
        )]
        let start = self.extra.len() as u32;
        start
    }

    /// Intern a single-child wrapper.
    pub(crate) fn intern(&mut self, tag: Tag, child: Idx) -> Idx {
        let item = Item::wrapper(tag, child);
        if let Some(&idx) = self.wrappers.get(&item) {
            return idx;
        }
        let idx = self.next_idx();
        self.items.push(item);
        self.wrappers.insert(item, idx);
        idx
    }

    /// Intern a compound type whose payload lives in `extra`.
    pub(crate) fn intern_complex(&mut self, tag: Tag, payload: &[u32]) -> Idx {
        if let Some(&idx) = self.compounds.get(&(tag, payload.to_vec())) {
            return idx;
        }
        let idx = self.push_extra(tag, payload);
        self.compounds.insert((tag, payload.to_vec()), idx);
        idx
    }

    /// Append an item without deduplication.
    fn push_extra(&mut self, tag: Tag, payload: &[u32]) -> Idx {
        let idx = self.next_idx();
        let start = self.next_extra();
        self.extra.extend_from_slice(payload);
        self.items.push(Item::new(tag, start));
        idx
    }

    fn push_named(&mut self, name: Name) -> Idx {
        self.push_extra(Tag::Named, &[name.raw(), Idx::NONE.raw()])
    }

    fn set_extra(&mut self, pos: u32, value: u32) {
        if let Some(slot) = self.extra.get_mut(pos as usize) {
            *slot = value;
        }
    }

    /// Get the item for an index. Unknown indices read as the error type.
    #[inline]
    pub fn item(&self, idx: Idx) -> Item {
        self.items
            .get(idx.index())
            .copied()
            .unwrap_or(Item::primitive(Tag::Error))
    }

    #[inline]
    pub fn tag(&self, idx: Idx) -> Tag {
        self.item(idx).tag
    }

    #[inline]
    fn extra_at(&self, pos: u32) -> u32 {
        self.extra.get(pos as usize).copied().unwrap_or(u32::MAX)
    }

    // === Accessors ===

    /// Child of a `Vec`, `Box` or `Rc`.
    pub fn wrapper_child(&self, idx: Idx) -> Idx {
        let item = self.item(idx);
        match item.tag {
            Tag::Vec | Tag::Box | Tag::Rc => item.child(),
            _ => Idx::NONE,
        }
    }

    /// Key and value types of a map.
    pub fn map_entry(&self, idx: Idx) -> (Idx, Idx) {
        let item = self.item(idx);
        debug_assert_eq!(item.tag, Tag::Map);
        (
            Idx::from_raw(self.extra_at(item.data)),
            Idx::from_raw(self.extra_at(item.data + 1)),
        )
    }

    /// Decode a reference type. Returns `None` for non-reference types.
    pub fn ref_type(&self, idx: Idx) -> Option<RefType> {
        let item = self.item(idx);
        if item.tag != Tag::Ref {
            return None;
        }
        let mutability = if self.extra_at(item.data + 1) == 0 {
            Mutability::Mut
        } else {
            Mutability::Imm
        };
        Some(RefType {
            kind: RefKind::from_raw(self.extra_at(item.data)),
            mutability,
            target: Idx::from_raw(self.extra_at(item.data + 2)),
        })
    }

    pub fn tuple_elems(&self, idx: Idx) -> Vec<Idx> {
        let item = self.item(idx);
        debug_assert_eq!(item.tag, Tag::Tuple);
        let len = self.extra_at(item.data);
        (0..len)
            .map(|i| Idx::from_raw(self.extra_at(item.data + 1 + i)))
            .collect()
    }

    pub fn struct_name(&self, idx: Idx) -> Name {
        let item = self.item(idx);
        debug_assert_eq!(item.tag, Tag::Struct);
        Name::from_raw(self.extra_at(item.data))
    }

    pub fn struct_fields(&self, idx: Idx) -> Vec<(Name, Idx)> {
        let item = self.item(idx);
        debug_assert_eq!(item.tag, Tag::Struct);
        let len = self.extra_at(item.data + 1);
        let base = item.data + 2;
        (0..len)
            .map(|i| {
                (
                    Name::from_raw(self.extra_at(base + 2 * i)),
                    Idx::from_raw(self.extra_at(base + 2 * i + 1)),
                )
            })
            .collect()
    }

    pub fn enum_name(&self, idx: Idx) -> Name {
        let item = self.item(idx);
        debug_assert_eq!(item.tag, Tag::Enum);
        Name::from_raw(self.extra_at(item.data))
    }

    /// Variants of a tagged union, each with its payload field types.
    pub fn enum_variants(&self, idx: Idx) -> Vec<(Name, Vec<Idx>)> {
        let item = self.item(idx);
        debug_assert_eq!(item.tag, Tag::Enum);
        let count = self.extra_at(item.data + 1);
        let mut pos = item.data + 2;
        let mut variants = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = Name::from_raw(self.extra_at(pos));
            let fields = self.extra_at(pos + 1);
            let tys = (0..fields)
                .map(|i| Idx::from_raw(self.extra_at(pos + 2 + i)))
                .collect();
            variants.push((name, tys));
            pos += 2 + fields;
        }
        variants
    }

    /// Handler and operation ids of a continuation type.
    pub fn continuation_parts(&self, idx: Idx) -> Option<(u32, u32)> {
        let item = self.item(idx);
        (item.tag == Tag::Continuation)
            .then(|| (self.extra_at(item.data), self.extra_at(item.data + 1)))
    }

    pub fn named_name(&self, idx: Idx) -> Name {
        let item = self.item(idx);
        debug_assert_eq!(item.tag, Tag::Named);
        Name::from_raw(self.extra_at(item.data))
    }

    /// Body of a named type, if it has been defined.
    pub fn resolve(&self, idx: Idx) -> Option<Idx> {
        let item = self.item(idx);
        if item.tag != Tag::Named {
            return None;
        }
        let body = Idx::from_raw(self.extra_at(item.data + 1));
        (!body.is_none()).then_some(body)
    }

    /// Follow named types to their structural definition.
    ///
    /// Undefined names and alias cycles stop at the last named type reached.
    pub fn strip_named(&self, idx: Idx) -> Idx {
        let mut current = idx;
        for _ in 0..64 {
            match self.resolve(current) {
                Some(body) => current = body,
                None => return current,
            }
        }
        current
    }

    /// Whether a value of this type is shallowly copied on read.
    ///
    /// Scalars and immutable non-owning references are copyable; everything
    /// else moves.
    pub fn is_copyable(&self, idx: Idx) -> bool {
        let idx = self.strip_named(idx);
        match self.tag(idx) {
            Tag::Int | Tag::Float | Tag::Bool | Tag::Char | Tag::Byte | Tag::Unit | Tag::Never => {
                true
            }
            Tag::Ref => self
                .ref_type(idx)
                .is_some_and(|r| !r.mutability.is_mut() && r.kind != RefKind::Own),
            _ => false,
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}
