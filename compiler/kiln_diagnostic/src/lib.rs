//! Diagnostic system for rich error reporting.
//!
//! Every diagnostic carries:
//! - an error code for searchability
//! - a message saying what went wrong
//! - a primary span saying where
//! - secondary labels and notes tracing the cause back to its origin
//!
//! # Error Guarantees
//!
//! `ErrorGuaranteed` is type-level proof that at least one error was
//! emitted. Passes return `Result<T, ErrorGuaranteed>` so a failure can never
//! be reported without a diagnostic behind it.
//!
//! ```text
//! let guarantee = queue.emit_error(diagnostic);
//! fn check() -> Result<Annotated, ErrorGuaranteed> { ... }
//! ```

mod diagnostic;
mod error_code;
mod guarantee;
pub mod queue;

pub use diagnostic::{Diagnostic, Label, Severity};
pub use error_code::ErrorCode;
pub use guarantee::ErrorGuaranteed;
pub use queue::{DiagnosticConfig, DiagnosticQueue};
