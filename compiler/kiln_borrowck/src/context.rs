//! Read-only inputs shared by every phase.

use kiln_ir::{Name, StringInterner};
use kiln_types::{Idx, Pool};

use crate::config::BorrowckConfig;
use crate::ir::{EffectId, Module, Multiplicity, OpId};
use crate::shape::ShapeAnalyzer;

#[derive(Clone, Copy)]
pub(crate) struct CheckCtx<'a> {
    pub module: &'a Module,
    pub pool: &'a Pool,
    pub interner: &'a StringInterner,
    pub config: &'a BorrowckConfig,
}

impl<'a> CheckCtx<'a> {
    pub(crate) fn name(&self, name: Name) -> &'static str {
        self.interner.lookup(name)
    }

    pub(crate) fn ty(&self, idx: Idx) -> String {
        self.pool.format_type(idx, self.interner)
    }

    pub(crate) fn effect_name(&self, effect: EffectId) -> &'static str {
        self.module
            .effect(effect)
            .map_or("<unknown effect>", |e| self.name(e.name))
    }

    /// `Effect.op`, for messages.
    pub(crate) fn op_path(&self, effect: EffectId, op: OpId) -> String {
        let op_name = self
            .module
            .op(effect, op)
            .map_or("<unknown op>", |o| self.name(o.name));
        format!("{}.{}", self.effect_name(effect), op_name)
    }

    /// Declared contract of an operation, or the configured default.
    pub(crate) fn declared_multiplicity(&self, effect: EffectId, op: OpId) -> Multiplicity {
        self.module
            .op(effect, op)
            .and_then(|o| o.multiplicity)
            .unwrap_or(self.config.default_multiplicity)
    }

    pub(crate) fn shapes(&self) -> ShapeAnalyzer<'a> {
        ShapeAnalyzer::new(self.pool)
    }
}
