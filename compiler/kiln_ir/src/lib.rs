//! Kiln IR primitives.
//!
//! The pieces every compiler crate agrees on:
//! - `Span` for source locations
//! - `Name` for interned identifiers
//! - `StringInterner`, the sharded table behind `Name`
//!
//! Higher-level program representations (the typed tree consumed by the
//! borrow checker, the type pool) live in their own crates and build on these.

mod interner;
mod name;
mod span;

pub use interner::{InternError, StringInterner};
pub use name::Name;
pub use span::{Span, SpanError};
