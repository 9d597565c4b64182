//! Thread-transferability of captured values.
//!
//! A `Many` continuation may run on several threads at once, so everything
//! it captures must be safe to send. Refcounted pointers are not (their count
//! is unsynchronized), nor are possibly-aliased mutable references.

use std::cell::RefCell;

use rustc_hash::{FxHashMap, FxHashSet};

use kiln_types::{Idx, Pool, RefKind, Tag};

pub struct SendAnalyzer<'pool> {
    pool: &'pool Pool,
    cache: RefCell<FxHashMap<Idx, bool>>,
    in_progress: RefCell<FxHashSet<Idx>>,
}

impl<'pool> SendAnalyzer<'pool> {
    pub fn new(pool: &'pool Pool) -> Self {
        Self {
            pool,
            cache: RefCell::new(FxHashMap::default()),
            in_progress: RefCell::new(FxHashSet::default()),
        }
    }

    pub fn is_send(&self, idx: Idx) -> bool {
        if idx.is_primitive() {
            return true;
        }
        if let Some(&cached) = self.cache.borrow().get(&idx) {
            return cached;
        }
        // A recursive type is sendable iff its non-recursive parts are.
        if !self.in_progress.borrow_mut().insert(idx) {
            return true;
        }

        let result = self.classify(idx);

        self.in_progress.borrow_mut().remove(&idx);
        self.cache.borrow_mut().insert(idx, result);
        result
    }

    fn classify(&self, idx: Idx) -> bool {
        match self.pool.tag(idx) {
            Tag::Rc => false,
            Tag::Ref => match self.pool.ref_type(idx) {
                Some(r) => {
                    let aliased_mut = r.mutability.is_mut()
                        && matches!(r.kind, RefKind::Shared | RefKind::Polymorphic);
                    !aliased_mut && self.is_send(r.target)
                }
                None => false,
            },
            Tag::Vec | Tag::Box => self.is_send(self.pool.wrapper_child(idx)),
            Tag::Map => {
                let (key, value) = self.pool.map_entry(idx);
                self.is_send(key) && self.is_send(value)
            }
            Tag::Tuple => self.pool.tuple_elems(idx).into_iter().all(|e| self.is_send(e)),
            Tag::Struct => self
                .pool
                .struct_fields(idx)
                .into_iter()
                .all(|(_, ty)| self.is_send(ty)),
            Tag::Enum => self
                .pool
                .enum_variants(idx)
                .into_iter()
                .flat_map(|(_, fields)| fields)
                .all(|ty| self.is_send(ty)),
            Tag::Named => self.pool.resolve(idx).is_some_and(|body| self.is_send(body)),
            Tag::Int
            | Tag::Float
            | Tag::Bool
            | Tag::Str
            | Tag::Char
            | Tag::Byte
            | Tag::Unit
            | Tag::Never
            | Tag::Error
            | Tag::Continuation => true,
        }
    }
}

#[cfg(test)]
mod tests;
