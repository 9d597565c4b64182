//! Kiln type pool.
//!
//! All types live in a single [`Pool`] and are referenced by a 32-bit
//! [`Idx`]. Each entry is an [`Item`] (a [`Tag`] plus one data word); compound
//! types spill their children into the pool's `extra` array.
//!
//! Reference types carry a capability ([`RefKind`]) and a [`Mutability`].
//! Both are decided by upstream inference except `RefKind::Polymorphic`,
//! which the borrow checker resolves.

mod idx;
mod item;
mod pool;
mod reference;
mod tag;

pub use idx::Idx;
pub use item::Item;
pub use pool::Pool;
pub use reference::{Mutability, RefKind, RefType};
pub use tag::Tag;
