//! Type construction helpers for the Pool.

use kiln_ir::Name;

use crate::{Idx, Mutability, Pool, RefKind, Tag};

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Pool {
    // === Wrappers ===

    /// Create a growable vector type `[elem]`.
    pub fn vec(&mut self, elem: Idx) -> Idx {
        self.intern(Tag::Vec, elem)
    }

    /// Create an owned box `box<inner>`.
    pub fn boxed(&mut self, inner: Idx) -> Idx {
        self.intern(Tag::Box, inner)
    }

    /// Create a refcounted pointer `rc<inner>`.
    pub fn rc(&mut self, inner: Idx) -> Idx {
        self.intern(Tag::Rc, inner)
    }

    // === Compounds ===

    pub fn map(&mut self, key: Idx, value: Idx) -> Idx {
        self.intern_complex(Tag::Map, &[key.raw(), value.raw()])
    }

    /// Create a reference type.
    pub fn reference(&mut self, kind: RefKind, mutability: Mutability, target: Idx) -> Idx {
        let mutability = match mutability {
            Mutability::Mut => 0,
            Mutability::Imm => 1,
        };
        self.intern_complex(Tag::Ref, &[kind.to_raw(), mutability, target.raw()])
    }

    pub fn tuple(&mut self, elems: &[Idx]) -> Idx {
        let mut payload = Vec::with_capacity(elems.len() + 1);
        payload.push(len_u32(elems.len()));
        payload.extend(elems.iter().map(|e| e.raw()));
        self.intern_complex(Tag::Tuple, &payload)
    }

    /// Create a struct type with named fields.
    pub fn struct_type(&mut self, name: Name, fields: &[(Name, Idx)]) -> Idx {
        let mut payload = Vec::with_capacity(2 + 2 * fields.len());
        payload.push(name.raw());
        payload.push(len_u32(fields.len()));
        for &(field, ty) in fields {
            payload.push(field.raw());
            payload.push(ty.raw());
        }
        self.intern_complex(Tag::Struct, &payload)
    }

    /// Create a tagged union. Each variant lists its inline payload types.
    pub fn enum_type(&mut self, name: Name, variants: &[(Name, Vec<Idx>)]) -> Idx {
        let mut payload = vec![name.raw(), len_u32(variants.len())];
        for (variant, fields) in variants {
            payload.push(variant.raw());
            payload.push(len_u32(fields.len()));
            payload.extend(fields.iter().map(|f| f.raw()));
        }
        self.intern_complex(Tag::Enum, &payload)
    }

    /// Create the type of a resume continuation for `op` of `handler`.
    pub fn continuation(&mut self, handler: u32, op: u32) -> Idx {
        self.intern_complex(Tag::Continuation, &[handler, op])
    }

    // === Named types ===

    /// Create a fresh nominal type with no body yet.
    pub fn named(&mut self, name: Name) -> Idx {
        self.push_named(name)
    }

    /// Give a named type its body. Redefinition overwrites the previous body.
    pub fn define(&mut self, named: Idx, body: Idx) {
        let item = self.item(named);
        if item.tag == Tag::Named {
            self.set_extra(item.data + 1, body.raw());
        }
    }
}
