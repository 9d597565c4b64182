//! Checker configuration.

use kiln_diagnostic::DiagnosticConfig;

use crate::ir::Multiplicity;

/// What to do with a non-tail `Mut` continuation resumed inside a loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LoopResumePolicy {
    /// Heap-box the continuation and accept the program.
    #[default]
    BoxFallback,
    /// Reject it; loops may only resume in tail position.
    RequireTail,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BorrowckConfig {
    /// Contract for operations that declare no multiplicity.
    pub default_multiplicity: Multiplicity,
    pub loop_resume: LoopResumePolicy,
    /// Run per-function phases on the rayon pool.
    pub parallel: bool,
    pub diagnostics: DiagnosticConfig,
}

impl Default for BorrowckConfig {
    fn default() -> Self {
        BorrowckConfig {
            default_multiplicity: Multiplicity::Once,
            loop_resume: LoopResumePolicy::BoxFallback,
            parallel: false,
            diagnostics: DiagnosticConfig::default(),
        }
    }
}

impl BorrowckConfig {
    /// Report every diagnostic, unfiltered (for testing).
    pub fn unlimited() -> Self {
        BorrowckConfig {
            diagnostics: DiagnosticConfig::unlimited(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_default_multiplicity(mut self, multiplicity: Multiplicity) -> Self {
        self.default_multiplicity = multiplicity;
        self
    }

    #[must_use]
    pub fn with_loop_resume(mut self, policy: LoopResumePolicy) -> Self {
        self.loop_resume = policy;
        self
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}
