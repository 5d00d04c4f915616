//! Region lowering: walks the directive tree of a target region and emits
//! it through the capability set of an [`OpenMpRuntime`].

use std::collections::HashMap;

use crate::{
    codegen::CodeGenModule,
    directive::{
        CapturedVar, DataSharing, ExecutableDirective, Expr, ExprOp, LeafConstruct, Place, Stmt,
        TargetRegion, VarId,
    },
    error::{ErrorKind, Result},
    ir::{BinOp, CmpPred, CountedLoop, FunctionBuilder, Operand},
    outline::{self, ContextLayout, OutlinedFunction, BOUND_TID_PARAM},
    runtime::OpenMpRuntime,
};

mod loops;
mod reduction;

pub use loops::{select_loop_schedule, LoopSchedule};
pub use reduction::reduction_leaf;

/// Who executes the code being lowered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecContext {
    /// A single thread outside of any parallel region.
    Sequential,
    /// Every member of a parallel team.
    Team,
}

/// What the code being lowered can see: its OpenMP identity, the storage
/// of the variables and the innermost loop index.
#[derive(Clone, Debug)]
pub struct Scope {
    /// Who runs the code.
    pub exec: ExecContext,
    /// `omp_get_thread_num()`
    pub thread_num: Operand,
    /// `omp_get_num_threads()`
    pub num_threads: Operand,
    /// `omp_get_team_num()`
    pub team_num: Operand,
    /// `omp_get_num_teams()`
    pub num_teams: Operand,
    vars: HashMap<VarId, Operand>,
    loop_index: Option<Operand>,
}

impl Scope {
    /// Thread 0 of a team of one, as seen by the directing thread.
    #[must_use]
    pub fn sequential(team_num: Operand, num_teams: Operand) -> Self {
        Self {
            exec: ExecContext::Sequential,
            thread_num: Operand::i64(0),
            num_threads: Operand::i64(1),
            team_num,
            num_teams,
            vars: HashMap::new(),
            loop_index: None,
        }
    }

    /// A member of a parallel team.
    #[must_use]
    pub fn team(
        thread_num: Operand,
        num_threads: Operand,
        team_num: Operand,
        num_teams: Operand,
    ) -> Self {
        Self {
            exec: ExecContext::Team,
            thread_num,
            num_threads,
            team_num,
            num_teams,
            vars: HashMap::new(),
            loop_index: None,
        }
    }

    /// Makes `var` live at `address`, shadowing any earlier binding.
    pub fn bind(&mut self, var: VarId, address: Operand) {
        self.vars.insert(var, address);
    }

    /// Address of slot 0 of `var`.
    pub fn address(&self, var: VarId) -> Result<Operand> {
        self.vars
            .get(&var)
            .copied()
            .ok_or_else(|| ErrorKind::UnboundVariable(var.0).into())
    }

    /// Index of the innermost enclosing loop.
    pub fn loop_index(&self) -> Result<Operand> {
        self.loop_index
            .ok_or_else(|| ErrorKind::UnboundLoopIndex.into())
    }
}

/// Lowers one target region; outlined functions are added to the module as
/// their parallel constructs are reached.
pub struct RegionLowering<'a, R: OpenMpRuntime> {
    cgm: &'a mut CodeGenModule,
    rt: &'a R,
    state: &'a mut R::RegionState,
    region: &'a TargetRegion,
    parent: &'a str,
}

impl<'a, R: OpenMpRuntime> RegionLowering<'a, R> {
    /// `parent` names the function the region was emitted into; outlined
    /// functions are named after it.
    pub fn new(
        cgm: &'a mut CodeGenModule,
        rt: &'a R,
        state: &'a mut R::RegionState,
        region: &'a TargetRegion,
        parent: &'a str,
    ) -> Self {
        Self {
            cgm,
            rt,
            state,
            region,
            parent,
        }
    }

    /// Binds the region variables to `addresses` and lowers everything
    /// below the `target` leaf.
    pub fn lower_target_body(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &mut Scope,
        addresses: &[Operand],
    ) -> Result<()> {
        let region = self.region;

        for (var, address) in region.vars.iter().zip(addresses) {
            scope.bind(var.id, *address);
        }

        match region.directive.kind.leaves().split_first() {
            Some((LeafConstruct::Target, rest)) => {
                self.lower_leaves(cgf, scope, &region.directive, rest, None)
            },
            _ => Err(ErrorKind::UnsupportedConstruct(format!(
                "a {:?} directive outside of a target construct",
                region.directive.kind
            ))
            .into()),
        }
    }

    fn len_of(&self) -> impl Fn(VarId) -> u32 + 'a {
        let region = self.region;
        move |var| region.var(var).map_or(1, |decl| decl.len)
    }

    /// Lowers the remaining `leaves` of `directive`; `range` is the
    /// iteration space narrowed by an enclosing leaf.
    fn lower_leaves(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &mut Scope,
        directive: &ExecutableDirective,
        leaves: &[LeafConstruct],
        range: Option<(Operand, Operand)>,
    ) -> Result<()> {
        let Some((&leaf, rest)) = leaves.split_first() else {
            return self.lower_stmts(cgf, scope, &directive.body);
        };

        let privatized = match leaf {
            LeafConstruct::Target | LeafConstruct::Parallel => None,
            _ if reduction_leaf(directive) == Some(leaf) => Some(reduction::privatize(
                cgf,
                scope,
                directive,
                self.len_of(),
            )?),
            _ => None,
        };

        match leaf {
            LeafConstruct::Target => crate::bail!(ErrorKind::UnsupportedConstruct(
                String::from("a target construct nested in a target region")
            )),
            LeafConstruct::Parallel => {
                return self.lower_parallel(cgf, scope, directive, rest, range);
            },
            LeafConstruct::Teams => {
                if scope.exec == ExecContext::Team {
                    crate::bail!(ErrorKind::UnsupportedConstruct(String::from(
                        "a teams construct nested in a parallel region"
                    )));
                }
                self.lower_leaves(cgf, scope, directive, rest, range)?;
            },
            LeafConstruct::Distribute => self.lower_distribute(cgf, scope, directive, rest, range)?,
            LeafConstruct::For => self.lower_for(cgf, scope, directive, rest, range)?,
            LeafConstruct::Simd => self.lower_simd(cgf, scope, directive, rest, range)?,
        }

        if let Some(privatized) = privatized {
            privatized.combine(cgf, scope)?;
        }

        Ok(())
    }

    /// Explicit captures first, then every other referenced variable as
    /// shared.
    fn captures_of(directive: &ExecutableDirective) -> Vec<CapturedVar> {
        let mut captures = directive.captures.clone();

        for var in directive.referenced_vars() {
            if !captures.iter().any(|capture| capture.var == var) {
                captures.push(CapturedVar {
                    var,
                    sharing: DataSharing::Shared,
                });
            }
        }

        captures
    }

    fn lower_parallel(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &Scope,
        directive: &ExecutableDirective,
        rest: &[LeafConstruct],
        range: Option<(Operand, Operand)>,
    ) -> Result<()> {
        let layout = ContextLayout::new(Self::captures_of(directive), range.is_some());

        let if_cond = directive
            .if_condition(LeafConstruct::Parallel)
            .map(|condition| self.lower_condition(cgf, scope, condition))
            .transpose()?;
        let context = self.rt.emit_captured_vars(cgf, scope, &layout, range)?;

        let OutlinedFunction {
            id: outlined,
            cgf: mut body,
        } = self.rt.emit_outlined_function(self.cgm, self.parent)?;

        let prologue = outline::emit_prologue(&mut body, &layout, self.len_of())?;
        let num_teams = self.rt.emit_num_teams(&mut body)?;

        let mut team = Scope::team(
            prologue.thread_num,
            prologue.num_threads,
            BOUND_TID_PARAM,
            num_teams,
        );
        for (var, storage) in prologue.vars {
            team.bind(var, storage);
        }

        let privatized = if reduction_leaf(directive) == Some(LeafConstruct::Parallel) {
            Some(reduction::privatize(
                &mut body,
                &mut team,
                directive,
                self.len_of(),
            )?)
        } else {
            None
        };

        self.lower_leaves(&mut body, &mut team, directive, rest, prologue.bounds)?;

        if let Some(privatized) = privatized {
            privatized.combine(&mut body, &mut team)?;
        }

        body.ret()?;
        self.cgm.module.define_function(outlined, body.finish()?)?;

        self.rt
            .emit_parallel_call(cgf, scope, self.state, outlined, context, if_cond)
    }

    fn lower_stmts(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &mut Scope,
        stmts: &[Stmt],
    ) -> Result<()> {
        for stmt in stmts {
            self.lower_stmt(cgf, scope, stmt)?;
        }

        Ok(())
    }

    fn lower_stmt(&mut self, cgf: &mut FunctionBuilder, scope: &mut Scope, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign { place, value } => {
                let value = self.lower_expr(cgf, scope, value)?;
                let address = self.place_address(cgf, scope, place)?;
                cgf.store(address, value)
            },
            Stmt::AtomicUpdate { op, place, value } => {
                let value = self.lower_expr(cgf, scope, value)?;
                let address = self.place_address(cgf, scope, place)?;
                cgf.atomic_rmw(reduction::atomic_op(*op), address, value)
                    .map(drop)
            },
            Stmt::If {
                condition,
                then,
                otherwise,
            } => {
                let condition = self.lower_condition(cgf, scope, condition)?;

                let then_block = cgf.new_block("if.then");
                let else_block = cgf.new_block("if.else");
                let end_block = cgf.new_block("if.end");
                cgf.cond_br(condition, then_block, else_block)?;

                cgf.switch_to(then_block);
                self.lower_stmts(cgf, scope, then)?;
                cgf.br(end_block)?;

                cgf.switch_to(else_block);
                self.lower_stmts(cgf, scope, otherwise)?;
                cgf.br(end_block)?;

                cgf.switch_to(end_block);
                Ok(())
            },
            Stmt::Loop { bounds, body } => {
                let lower = self.lower_expr(cgf, scope, &bounds.lower)?;
                let upper = self.lower_expr(cgf, scope, &bounds.upper)?;

                let (lp, index) = CountedLoop::begin(cgf, "loop", lower, upper, Operand::i64(1))?;
                let outer = scope.loop_index.replace(index);
                self.lower_stmts(cgf, scope, body)?;
                scope.loop_index = outer;
                lp.end(cgf)
            },
            Stmt::Barrier => self.rt.emit_barrier(cgf, scope),
            Stmt::Directive(directive) => {
                self.lower_leaves(cgf, scope, directive, directive.kind.leaves(), None)
            },
        }
    }

    fn place_address(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &Scope,
        place: &Place,
    ) -> Result<Operand> {
        let base = scope.address(place.var)?;
        let index = self.lower_expr(cgf, scope, &place.index)?;
        cgf.field_addr(base, index)
    }

    fn lower_expr(&mut self, cgf: &mut FunctionBuilder, scope: &Scope, expr: &Expr) -> Result<Operand> {
        match expr {
            Expr::Int(value) => Ok(Operand::i64(*value)),
            Expr::Load(place) => {
                let address = self.place_address(cgf, scope, place)?;
                cgf.load(address)
            },
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.lower_expr(cgf, scope, lhs)?;
                let rhs = self.lower_expr(cgf, scope, rhs)?;

                match classify(*op) {
                    OpKind::Arith(op) => cgf.binary(op, lhs, rhs),
                    OpKind::Compare(pred) => {
                        let flag = cgf.cmp(pred, lhs, rhs)?;
                        cgf.select(flag, Operand::i64(1), Operand::i64(0))
                    },
                }
            },
            Expr::ThreadNum => Ok(scope.thread_num),
            Expr::NumThreads => Ok(scope.num_threads),
            Expr::TeamNum => Ok(scope.team_num),
            Expr::NumTeams => Ok(scope.num_teams),
            Expr::GlobalThreadNum => self.rt.compute_thread_id(cgf),
            Expr::LoopIndex => scope.loop_index(),
        }
    }

    /// Lowers `expr` to an `i1` branch condition, folding constants.
    fn lower_condition(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &Scope,
        expr: &Expr,
    ) -> Result<Operand> {
        match expr {
            Expr::Int(value) => Ok(Operand::bool(*value != 0)),
            Expr::Binary { op, lhs, rhs } => match classify(*op) {
                OpKind::Compare(pred) => {
                    let lhs = self.lower_expr(cgf, scope, lhs)?;
                    let rhs = self.lower_expr(cgf, scope, rhs)?;
                    cgf.cmp(pred, lhs, rhs)
                },
                OpKind::Arith(_) => {
                    let value = self.lower_expr(cgf, scope, expr)?;
                    cgf.cmp(CmpPred::Ne, value, Operand::i64(0))
                },
            },
            _ => {
                let value = self.lower_expr(cgf, scope, expr)?;
                cgf.cmp(CmpPred::Ne, value, Operand::i64(0))
            },
        }
    }
}

enum OpKind {
    Arith(BinOp),
    Compare(CmpPred),
}

const fn classify(op: ExprOp) -> OpKind {
    match op {
        ExprOp::Add => OpKind::Arith(BinOp::Add),
        ExprOp::Sub => OpKind::Arith(BinOp::Sub),
        ExprOp::Mul => OpKind::Arith(BinOp::Mul),
        ExprOp::Div => OpKind::Arith(BinOp::SDiv),
        ExprOp::Rem => OpKind::Arith(BinOp::SRem),
        ExprOp::Min => OpKind::Arith(BinOp::SMin),
        ExprOp::Max => OpKind::Arith(BinOp::SMax),
        ExprOp::Lt => OpKind::Compare(CmpPred::Slt),
        ExprOp::Le => OpKind::Compare(CmpPred::Sle),
        ExprOp::Gt => OpKind::Compare(CmpPred::Sgt),
        ExprOp::Ge => OpKind::Compare(CmpPred::Sge),
        ExprOp::Eq => OpKind::Compare(CmpPred::Eq),
        ExprOp::Ne => OpKind::Compare(CmpPred::Ne),
    }
}
