//! Shared test utilities for the checker phases.
//!
//! Only compiled in test builds.

use kiln_ir::{Name, StringInterner};
use kiln_types::Pool;

use crate::config::BorrowckConfig;
use crate::context::CheckCtx;
use crate::error::{BorrowckError, BorrowckErrorKind};
use crate::ir::Module;

/// Owns everything a [`CheckCtx`] borrows.
pub(crate) struct Fixture {
    pub interner: StringInterner,
    pub pool: Pool,
    pub config: BorrowckConfig,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Fixture {
            interner: StringInterner::new(),
            pool: Pool::new(),
            config: BorrowckConfig::unlimited(),
        }
    }

    pub(crate) fn name(&self, s: &str) -> Name {
        self.interner.intern(s)
    }

    pub(crate) fn ctx<'a>(&'a self, module: &'a Module) -> CheckCtx<'a> {
        CheckCtx {
            module,
            pool: &self.pool,
            interner: &self.interner,
            config: &self.config,
        }
    }
}

/// Error kinds in report order.
pub(crate) fn kinds(errors: &[BorrowckError]) -> Vec<BorrowckErrorKind> {
    errors.iter().map(|e| e.kind).collect()
}
