//! Shape-stability analysis.
//!
//! A type is shape-stable when mutating a value of that type can never
//! invalidate a reference previously taken into its interior. Pointer
//! indirection (`box`, `rc`, references) is always a stable boundary: the
//! pointer itself stays put no matter what happens to the pointee.
//!
//! Unstable: tagged unions with inline payloads (reassigning the variant
//! repurposes the payload bytes), growable containers (mutation may
//! reallocate), and aggregates containing either inline.

use std::cell::RefCell;

use rustc_hash::{FxHashMap, FxHashSet};

use kiln_types::{Idx, Pool, Tag};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum ShapeStability {
    Stable,
    Unstable,
}

/// Memoized shape classifier over a type pool.
///
/// Uses `RefCell` for the cache so queries take `&self`; create one per
/// thread.
pub struct ShapeAnalyzer<'pool> {
    pool: &'pool Pool,
    cache: RefCell<FxHashMap<Idx, ShapeStability>>,
    /// Types currently being classified. Reaching one again means a
    /// recursive type with no indirection on the cycle.
    in_progress: RefCell<FxHashSet<Idx>>,
}

impl<'pool> ShapeAnalyzer<'pool> {
    pub fn new(pool: &'pool Pool) -> Self {
        Self {
            pool,
            cache: RefCell::new(FxHashMap::default()),
            in_progress: RefCell::new(FxHashSet::default()),
        }
    }

    pub fn is_stable(&self, idx: Idx) -> bool {
        self.stability(idx) == ShapeStability::Stable
    }

    pub fn stability(&self, idx: Idx) -> ShapeStability {
        if idx.is_primitive() {
            return if idx == Idx::STR {
                ShapeStability::Unstable
            } else {
                ShapeStability::Stable
            };
        }

        if let Some(&cached) = self.cache.borrow().get(&idx) {
            return cached;
        }

        if !self.in_progress.borrow_mut().insert(idx) {
            return ShapeStability::Unstable;
        }

        let result = self.classify_by_tag(idx);

        self.in_progress.borrow_mut().remove(&idx);
        self.cache.borrow_mut().insert(idx, result);
        result
    }

    fn classify_by_tag(&self, idx: Idx) -> ShapeStability {
        match self.pool.tag(idx) {
            Tag::Int
            | Tag::Float
            | Tag::Bool
            | Tag::Char
            | Tag::Byte
            | Tag::Unit
            | Tag::Never
            | Tag::Error => ShapeStability::Stable,

            Tag::Box | Tag::Rc | Tag::Ref => ShapeStability::Stable,

            // Captured environments are fixed once built; recursion is
            // bounded separately by boxing.
            Tag::Continuation => ShapeStability::Stable,

            Tag::Str | Tag::Vec | Tag::Map => ShapeStability::Unstable,

            Tag::Tuple => self.all_stable(&self.pool.tuple_elems(idx)),

            Tag::Struct => {
                let fields: Vec<Idx> = self
                    .pool
                    .struct_fields(idx)
                    .into_iter()
                    .map(|(_, ty)| ty)
                    .collect();
                self.all_stable(&fields)
            }

            // A pure tag can be overwritten freely; any payload makes the
            // layout variant-dependent.
            Tag::Enum => {
                let has_payload = self
                    .pool
                    .enum_variants(idx)
                    .iter()
                    .any(|(_, fields)| !fields.is_empty());
                if has_payload {
                    ShapeStability::Unstable
                } else {
                    ShapeStability::Stable
                }
            }

            Tag::Named => match self.pool.resolve(idx) {
                Some(body) => self.stability(body),
                None => ShapeStability::Unstable,
            },
        }
    }

    fn all_stable(&self, children: &[Idx]) -> ShapeStability {
        if children.iter().all(|&c| self.is_stable(c)) {
            ShapeStability::Stable
        } else {
            ShapeStability::Unstable
        }
    }
}

#[cfg(test)]
mod tests;
