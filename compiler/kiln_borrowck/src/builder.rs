//! Construction helpers for well-formed IR.
//!
//! Lowering and tests build modules through [`ModuleBuilder`], which hands
//! out module-unique expression and handler ids and a fresh synthetic span
//! per node. Spans increase in construction order, so nodes built earlier
//! sort earlier in diagnostics.

use kiln_ir::{Name, Span};
use kiln_types::{Idx, Mutability};

use crate::ir::{
    ArmBinding, Block, Clause, EffectDecl, EffectId, Expr, ExprId, ExprKind, Function, Handler,
    HandlerId, Local, MatchArm, Module, Multiplicity, OpDecl, OpId, Place, ScopeId, Stmt, VarId,
};

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[derive(Debug)]
pub struct ModuleBuilder {
    effects: Vec<EffectDecl>,
    functions: Vec<Function>,
    next_expr: u32,
    next_handler: u32,
    next_span: u32,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            effects: Vec::new(),
            functions: Vec::new(),
            next_expr: 0,
            next_handler: 0,
            next_span: 1,
        }
    }

    fn span(&mut self) -> Span {
        let start = self.next_span;
        self.next_span += 2;
        Span::new(start, start + 1)
    }

    /// Declare an effect with the given operations.
    pub fn effect(&mut self, name: Name, ops: Vec<OpSpec>) -> EffectId {
        let id = EffectId::new(to_u32(self.effects.len()));
        let span = self.span();
        let ops = ops
            .into_iter()
            .map(|op| OpDecl {
                name: op.name,
                params: op.params,
                ret: op.ret,
                multiplicity: op.multiplicity,
                span: self.span(),
            })
            .collect();
        self.effects.push(EffectDecl {
            id,
            name,
            ops,
            span,
        });
        id
    }

    /// Start building a function. It is added to the module by
    /// [`FunctionBuilder::finish`].
    pub fn function(&mut self, name: Name) -> FunctionBuilder<'_> {
        let span = self.span();
        FunctionBuilder {
            module: self,
            name,
            params: Vec::new(),
            return_type: Idx::UNIT,
            effects: Vec::new(),
            locals: Vec::new(),
            next_scope: 0,
            span,
        }
    }

    pub fn finish(self) -> Module {
        Module {
            effects: self.effects,
            functions: self.functions,
        }
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation signature for [`ModuleBuilder::effect`].
#[derive(Clone, Debug)]
pub struct OpSpec {
    pub name: Name,
    pub params: Vec<Idx>,
    pub ret: Idx,
    pub multiplicity: Option<Multiplicity>,
}

impl OpSpec {
    pub fn new(name: Name, params: Vec<Idx>, ret: Idx) -> Self {
        OpSpec {
            name,
            params,
            ret,
            multiplicity: None,
        }
    }

    #[must_use]
    pub fn with_multiplicity(mut self, multiplicity: Multiplicity) -> Self {
        self.multiplicity = Some(multiplicity);
        self
    }
}

pub struct FunctionBuilder<'m> {
    module: &'m mut ModuleBuilder,
    name: Name,
    params: Vec<VarId>,
    return_type: Idx,
    effects: Vec<EffectId>,
    locals: Vec<Local>,
    next_scope: u32,
    span: Span,
}

impl FunctionBuilder<'_> {
    fn expr(&mut self, kind: ExprKind, ty: Idx) -> Expr {
        let id = ExprId::new(self.module.next_expr);
        self.module.next_expr += 1;
        Expr {
            id,
            kind,
            ty,
            span: self.module.span(),
        }
    }

    fn local_ty(&self, var: VarId) -> Idx {
        self.locals.get(var.index()).map_or(Idx::ERROR, |l| l.ty)
    }

    // === Signature ===

    pub fn param(&mut self, name: Name, ty: Idx) -> VarId {
        let var = self.local(name, ty, false);
        self.params.push(var);
        var
    }

    pub fn local(&mut self, name: Name, ty: Idx, mutable: bool) -> VarId {
        let var = VarId::new(to_u32(self.locals.len()));
        let span = self.module.span();
        self.locals.push(Local {
            name,
            ty,
            mutable,
            span,
        });
        var
    }

    pub fn returns(&mut self, ty: Idx) {
        self.return_type = ty;
    }

    pub fn declares(&mut self, effect: EffectId) {
        if !self.effects.contains(&effect) {
            self.effects.push(effect);
        }
    }

    /// Reserve a handler id, so clause bodies can mention `cont<handler, op>`
    /// types before the `handle` node exists.
    pub fn new_handler(&mut self) -> HandlerId {
        let id = HandlerId::new(self.module.next_handler);
        self.module.next_handler += 1;
        id
    }

    // === Blocks and statements ===

    pub fn block(&mut self, stmts: Vec<Stmt>, tail: Option<Expr>) -> Block {
        let scope = ScopeId::new(self.next_scope);
        self.next_scope += 1;
        Block {
            scope,
            stmts,
            tail: tail.map(Box::new),
            span: self.module.span(),
        }
    }

    pub fn let_(&mut self, var: VarId, init: Expr) -> Stmt {
        let span = self.module.span();
        Stmt::Let { var, init, span }
    }

    // === Expressions ===

    pub fn lit(&mut self, ty: Idx) -> Expr {
        self.expr(ExprKind::Literal, ty)
    }

    pub fn var(&mut self, var: VarId) -> Expr {
        let ty = self.local_ty(var);
        self.expr(ExprKind::Var(var), ty)
    }

    pub fn mov(&mut self, var: VarId) -> Expr {
        let ty = self.local_ty(var);
        self.expr(ExprKind::Move(var), ty)
    }

    /// Borrow a place; `ty` is the resulting reference type.
    pub fn borrow(&mut self, place: Place, mutability: Mutability, ty: Idx) -> Expr {
        self.expr(ExprKind::Borrow { place, mutability }, ty)
    }

    pub fn read(&mut self, place: Place, ty: Idx) -> Expr {
        self.expr(ExprKind::Read(place), ty)
    }

    pub fn assign(&mut self, place: Place, value: Expr) -> Expr {
        self.expr(
            ExprKind::Assign {
                place,
                value: Box::new(value),
            },
            Idx::UNIT,
        )
    }

    pub fn construct(&mut self, args: Vec<Expr>, ty: Idx) -> Expr {
        self.expr(ExprKind::Construct { args }, ty)
    }

    pub fn call(&mut self, callee: Name, args: Vec<Expr>, ty: Idx) -> Expr {
        self.expr(ExprKind::Call { callee, args }, ty)
    }

    pub fn perform(&mut self, effect: EffectId, op: u32, args: Vec<Expr>, ty: Idx) -> Expr {
        self.expr(
            ExprKind::Perform {
                effect,
                op: OpId::new(op),
                args,
            },
            ty,
        )
    }

    pub fn clause(&mut self, op: u32, params: Vec<VarId>, body: Block) -> Clause {
        Clause {
            op: OpId::new(op),
            params,
            body,
            span: self.module.span(),
        }
    }

    pub fn handle(
        &mut self,
        id: HandlerId,
        effect: EffectId,
        body: Block,
        clauses: Vec<Clause>,
        ty: Idx,
    ) -> Expr {
        self.expr(
            ExprKind::Handle {
                body,
                handler: Handler {
                    id,
                    effect,
                    clauses,
                },
            },
            ty,
        )
    }

    pub fn resume(&mut self, value: Expr) -> Expr {
        self.expr(
            ExprKind::Resume {
                value: Box::new(value),
            },
            Idx::UNIT,
        )
    }

    /// First-class continuation; `ty` should be `cont<handler, op>`.
    pub fn resume_value(&mut self, ty: Idx) -> Expr {
        self.expr(ExprKind::ResumeValue, ty)
    }

    pub fn spawn(&mut self, body: Block) -> Expr {
        self.expr(ExprKind::Spawn { body }, Idx::UNIT)
    }

    pub fn if_(&mut self, cond: Expr, then_block: Block, else_block: Option<Block>, ty: Idx) -> Expr {
        self.expr(
            ExprKind::If {
                cond: Box::new(cond),
                then_block,
                else_block,
            },
            ty,
        )
    }

    pub fn arm(&mut self, variant: u32, bindings: Vec<ArmBinding>, body: Block) -> MatchArm {
        MatchArm {
            variant,
            bindings,
            body,
            span: self.module.span(),
        }
    }

    pub fn match_(&mut self, scrutinee: Place, arms: Vec<MatchArm>, ty: Idx) -> Expr {
        self.expr(ExprKind::Match { scrutinee, arms }, ty)
    }

    pub fn loop_(&mut self, body: Block) -> Expr {
        self.expr(ExprKind::Loop { body }, Idx::UNIT)
    }

    pub fn brk(&mut self) -> Expr {
        self.expr(ExprKind::Break, Idx::NEVER)
    }

    pub fn ret(&mut self, value: Option<Expr>) -> Expr {
        self.expr(ExprKind::Return(value.map(Box::new)), Idx::NEVER)
    }

    pub fn block_expr(&mut self, block: Block, ty: Idx) -> Expr {
        self.expr(ExprKind::Block(block), ty)
    }

    /// Finish the function with `body` and add it to the module.
    pub fn finish(self, body: Block) -> Name {
        let name = self.name;
        self.module.functions.push(Function {
            name,
            params: self.params,
            return_type: self.return_type,
            effects: self.effects,
            locals: self.locals,
            body,
            span: self.span,
        });
        name
    }
}
