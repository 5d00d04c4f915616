//! The abstract executable-directive representation handed over by the
//! front-end once pragmas have been parsed and checked.
//!
//! All values are 64-bit integers and every variable is an array of `len`
//! slots; scalars have `len == 1`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
/// Identifies a variable mapped into a target region.
pub struct VarId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// A variable mapped into a target region.
pub struct VarDecl {
    /// Unique within the region.
    pub id: VarId,
    /// Source name, used for kernel parameter names.
    pub name: String,
    /// Number of 64-bit slots.
    pub len: u32,
}

/// One `#pragma omp target` region of a translation unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRegion {
    /// Name of the function containing the region, possibly mangled or
    /// templated.
    pub parent_name: String,
    /// Source file of the pragma, hashed into the entry name.
    pub file: String,
    /// Line of the pragma.
    pub line: u32,
    /// Variables mapped into the region, passed to the kernel by address.
    pub vars: Vec<VarDecl>,
    /// The outermost directive, always one with a `target` leaf.
    pub directive: ExecutableDirective,
}

impl TargetRegion {
    /// Looks up the declaration of a mapped variable.
    #[must_use]
    pub fn var(&self, id: VarId) -> Option<&VarDecl> {
        self.vars.iter().find(|var| var.id == id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
/// The single constructs that combined directives are built from.
pub enum LeafConstruct {
    Target,
    Teams,
    Distribute,
    Parallel,
    For,
    Simd,
}

/// Combined and composite constructs, decomposed into their leaves.
///
/// Each variant is named after the leaves it spells out, see
/// [`DirectiveKind::leaves`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum DirectiveKind {
    Target,
    TargetParallel,
    TargetParallelFor,
    TargetTeams,
    TargetTeamsDistribute,
    TargetTeamsDistributeParallelFor,
    TargetTeamsDistributeParallelForSimd,
    Teams,
    Distribute,
    DistributeParallelFor,
    Parallel,
    ParallelFor,
    For,
    Simd,
}

impl DirectiveKind {
    /// The leaf constructs, outermost first.
    #[must_use]
    pub const fn leaves(self) -> &'static [LeafConstruct] {
        use LeafConstruct::{Distribute, For, Parallel, Simd, Target, Teams};

        match self {
            Self::Target => &[Target],
            Self::TargetParallel => &[Target, Parallel],
            Self::TargetParallelFor => &[Target, Parallel, For],
            Self::TargetTeams => &[Target, Teams],
            Self::TargetTeamsDistribute => &[Target, Teams, Distribute],
            Self::TargetTeamsDistributeParallelFor => &[Target, Teams, Distribute, Parallel, For],
            Self::TargetTeamsDistributeParallelForSimd => {
                &[Target, Teams, Distribute, Parallel, For, Simd]
            },
            Self::Teams => &[Teams],
            Self::Distribute => &[Distribute],
            Self::DistributeParallelFor => &[Distribute, Parallel, For],
            Self::Parallel => &[Parallel],
            Self::ParallelFor => &[Parallel, For],
            Self::For => &[For],
            Self::Simd => &[Simd],
        }
    }

    #[must_use]
    /// Whether `leaf` is one of the constructs this directive combines.
    pub fn has_leaf(self, leaf: LeafConstruct) -> bool {
        self.leaves().contains(&leaf)
    }

    /// Whether the construct distributes iterations of its associated loop.
    #[must_use]
    pub fn is_loop(self) -> bool {
        self.leaves().iter().any(|leaf| {
            matches!(
                leaf,
                LeafConstruct::Distribute | LeafConstruct::For | LeafConstruct::Simd
            )
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The kind argument of a `schedule` clause.
pub enum ScheduleKind {
    /// Fixed chunks assigned round-robin before the loop starts.
    Static,
    /// Chunks handed out on request.
    Dynamic,
    /// Chunks that shrink as the remaining iterations do.
    Guided,
    /// Left to the implementation.
    Auto,
    /// Read from `OMP_SCHEDULE` when the loop starts.
    Runtime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Operators of `reduction` clauses and atomic updates.
pub enum ReductionOp {
    /// `+`
    Add,
    /// `min`
    Min,
    /// `max`
    Max,
}

impl ReductionOp {
    /// The value private reduction copies start from.
    #[must_use]
    pub const fn identity(self) -> i64 {
        match self {
            Self::Add => 0,
            Self::Min => i64::MAX,
            Self::Max => i64::MIN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// A clause attached to an executable directive.
pub enum Clause {
    /// `if([modifier:] condition)`, a missing modifier applies to every leaf
    /// that accepts an `if` clause.
    If {
        /// The leaf the clause applies to.
        modifier: Option<LeafConstruct>,
        /// Non-zero to enable the leaf.
        condition: Expr,
    },
    /// `schedule(kind[, chunk])`
    Schedule {
        /// The schedule kind.
        kind: ScheduleKind,
        /// The chunk size; each schedule kind has its own default.
        chunk: Option<Expr>,
    },
    /// `dist_schedule(static[, chunk])`
    DistSchedule {
        /// Iterations per team and round, a single block per team when
        /// missing.
        chunk: Option<Expr>,
    },
    /// `ordered`
    Ordered,
    /// `nowait`
    Nowait,
    /// `reduction(op: var)`
    Reduction {
        /// The combining operator.
        op: ReductionOp,
        /// The reduced variable, combined slot by slot.
        var: VarId,
    },
}

/// Clause kinds without their arguments, as used by capability tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ClauseKind {
    If,
    Schedule,
    DistSchedule,
    Ordered,
    Nowait,
    Reduction,
}

impl Clause {
    /// The clause without its arguments.
    #[must_use]
    pub const fn kind(&self) -> ClauseKind {
        match self {
            Self::If { .. } => ClauseKind::If,
            Self::Schedule { .. } => ClauseKind::Schedule,
            Self::DistSchedule { .. } => ClauseKind::DistSchedule,
            Self::Ordered => ClauseKind::Ordered,
            Self::Nowait => ClauseKind::Nowait,
            Self::Reduction { .. } => ClauseKind::Reduction,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How an outlined region receives a captured variable.
pub enum DataSharing {
    /// Passed by reference; also used for mapped variables.
    Shared,
    /// Copied into private storage when the region starts.
    FirstPrivate,
    /// Fresh, uninitialised private storage.
    Private,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// An explicit data-sharing attribute.
pub struct CapturedVar {
    #[allow(missing_docs)]
    pub var: VarId,
    /// How the variable reaches the outlined function.
    pub sharing: DataSharing,
}

/// The half-open iteration space `[lower, upper)` of a loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopBounds {
    /// First iteration.
    pub lower: Expr,
    /// One past the last iteration.
    pub upper: Expr,
}

impl LoopBounds {
    /// Constant bounds.
    #[must_use]
    pub const fn new(lower: i64, upper: i64) -> Self {
        Self {
            lower: Expr::Int(lower),
            upper: Expr::Int(upper),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// A directive together with its clauses and the statements it applies to.
pub struct ExecutableDirective {
    /// The construct, with all of its leaves.
    pub kind: DirectiveKind,
    /// Clauses in source order.
    pub clauses: Vec<Clause>,
    /// Explicit data-sharing attributes; variables referenced by the region
    /// but not listed here are shared.
    pub captures: Vec<CapturedVar>,
    /// The associated loop of a loop construct.
    pub bounds: Option<LoopBounds>,
    /// The structured block, or the loop body of a loop construct.
    pub body: Vec<Stmt>,
}

impl ExecutableDirective {
    /// A directive with no clauses and an empty body.
    #[must_use]
    pub const fn new(kind: DirectiveKind) -> Self {
        Self {
            kind,
            clauses: Vec::new(),
            captures: Vec::new(),
            bounds: None,
            body: Vec::new(),
        }
    }

    /// Appends a clause.
    #[must_use]
    pub fn with_clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Appends an explicit data-sharing attribute.
    #[must_use]
    pub fn with_capture(mut self, var: VarId, sharing: DataSharing) -> Self {
        self.captures.push(CapturedVar { var, sharing });
        self
    }

    /// Sets the associated loop.
    #[must_use]
    pub fn with_bounds(mut self, bounds: LoopBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: Vec<Stmt>) -> Self {
        self.body = body;
        self
    }

    /// Whether a clause of this kind is present.
    #[must_use]
    pub fn has_clause(&self, kind: ClauseKind) -> bool {
        self.clauses.iter().any(|clause| clause.kind() == kind)
    }

    /// The `if` clause applying to `leaf`, if any.
    #[must_use]
    pub fn if_condition(&self, leaf: LeafConstruct) -> Option<&Expr> {
        self.clauses.iter().find_map(|clause| match clause {
            Clause::If {
                modifier,
                condition,
            } if modifier.map_or(true, |modifier| modifier == leaf) => Some(condition),
            _ => None,
        })
    }

    /// The first `schedule` clause, as its kind and chunk.
    #[must_use]
    pub fn schedule(&self) -> Option<(ScheduleKind, Option<&Expr>)> {
        self.clauses.iter().find_map(|clause| match clause {
            Clause::Schedule { kind, chunk } => Some((*kind, chunk.as_ref())),
            _ => None,
        })
    }

    /// The chunk of the `dist_schedule` clause, if it has one.
    #[must_use]
    pub fn dist_schedule_chunk(&self) -> Option<&Expr> {
        self.clauses.iter().find_map(|clause| match clause {
            Clause::DistSchedule { chunk } => chunk.as_ref(),
            _ => None,
        })
    }

    /// The `reduction` clauses in source order.
    pub fn reductions(&self) -> impl Iterator<Item = (ReductionOp, VarId)> + '_ {
        self.clauses.iter().filter_map(|clause| match clause {
            Clause::Reduction { op, var } => Some((*op, *var)),
            _ => None,
        })
    }

    /// Every variable the directive refers to, in its clauses, its loop
    /// bounds, its explicit captures or its body, nested directives included.
    #[must_use]
    pub fn referenced_vars(&self) -> BTreeSet<VarId> {
        let mut vars = BTreeSet::new();
        self.collect_vars(&mut vars);
        vars
    }

    fn collect_vars(&self, vars: &mut BTreeSet<VarId>) {
        vars.extend(self.captures.iter().map(|capture| capture.var));
        for clause in &self.clauses {
            match clause {
                Clause::If { condition, .. } => condition.collect_vars(vars),
                Clause::Schedule { chunk, .. } | Clause::DistSchedule { chunk } => {
                    if let Some(chunk) = chunk {
                        chunk.collect_vars(vars);
                    }
                },
                Clause::Reduction { var, .. } => {
                    vars.insert(*var);
                },
                Clause::Ordered | Clause::Nowait => (),
            }
        }
        if let Some(bounds) = &self.bounds {
            bounds.lower.collect_vars(vars);
            bounds.upper.collect_vars(vars);
        }
        for stmt in &self.body {
            stmt.collect_vars(vars);
        }
    }
}

/// A memory location: slot `index` of variable `var`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    #[allow(missing_docs)]
    pub var: VarId,
    /// Slot index, not bounds checked.
    pub index: Expr,
}

impl Place {
    /// Slot 0 of `var`.
    #[must_use]
    pub const fn scalar(var: VarId) -> Self {
        Self {
            var,
            index: Expr::Int(0),
        }
    }

    #[must_use]
    /// Slot `index` of `var`.
    pub const fn element(var: VarId, index: Expr) -> Self {
        Self { var, index }
    }

    fn collect_vars(&self, vars: &mut BTreeSet<VarId>) {
        vars.insert(self.var);
        self.index.collect_vars(vars);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Statements of a structured block.
pub enum Stmt {
    /// `place = value`
    Assign {
        #[allow(missing_docs)]
        place: Place,
        #[allow(missing_docs)]
        value: Expr,
    },
    /// `#pragma omp atomic update`
    #[allow(missing_docs)]
    AtomicUpdate {
        op: ReductionOp,
        place: Place,
        value: Expr,
    },
    /// Runs `then` when `condition` is non-zero, `otherwise` when it is not.
    #[allow(missing_docs)]
    If {
        condition: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    /// A sequential loop executed by every thread that reaches it.
    #[allow(missing_docs)]
    Loop {
        bounds: LoopBounds,
        body: Vec<Stmt>,
    },
    /// `#pragma omp barrier`
    Barrier,
    /// A nested directive.
    Directive(Box<ExecutableDirective>),
}

impl Stmt {
    fn collect_vars(&self, vars: &mut BTreeSet<VarId>) {
        match self {
            Self::Assign { place, value } | Self::AtomicUpdate { place, value, .. } => {
                place.collect_vars(vars);
                value.collect_vars(vars);
            },
            Self::If {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_vars(vars);
                for stmt in then.iter().chain(otherwise) {
                    stmt.collect_vars(vars);
                }
            },
            Self::Loop { bounds, body } => {
                bounds.lower.collect_vars(vars);
                bounds.upper.collect_vars(vars);
                for stmt in body {
                    stmt.collect_vars(vars);
                }
            },
            Self::Barrier => (),
            Self::Directive(directive) => directive.collect_vars(vars),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
/// Binary operators; comparisons produce 0 or 1.
pub enum ExprOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Integer expressions.
pub enum Expr {
    /// A constant.
    Int(i64),
    /// Reads a slot.
    Load(Box<Place>),
    /// `lhs op rhs`
    #[allow(missing_docs)]
    Binary {
        op: ExprOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `omp_get_thread_num()`
    ThreadNum,
    /// `omp_get_num_threads()`
    NumThreads,
    /// `omp_get_team_num()`
    TeamNum,
    /// `omp_get_num_teams()`
    NumTeams,
    /// The flattened thread id the OpenMP runtime uses to identify callers.
    GlobalThreadNum,
    /// Index of the innermost enclosing loop.
    LoopIndex,
}

impl Expr {
    /// Reads `place`.
    #[must_use]
    pub fn load(place: Place) -> Self {
        Self::Load(Box::new(place))
    }

    #[must_use]
    /// `lhs op rhs`
    pub fn binary(op: ExprOp, lhs: Self, rhs: Self) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Whether this is a comparison, which lowers to a predicate.
    #[must_use]
    pub const fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Binary {
                op: ExprOp::Lt | ExprOp::Le | ExprOp::Gt | ExprOp::Ge | ExprOp::Eq | ExprOp::Ne,
                ..
            }
        )
    }

    fn collect_vars(&self, vars: &mut BTreeSet<VarId>) {
        match self {
            Self::Load(place) => place.collect_vars(vars),
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_vars(vars);
                rhs.collect_vars(vars);
            },
            Self::Int(_)
            | Self::ThreadNum
            | Self::NumThreads
            | Self::TeamNum
            | Self::NumTeams
            | Self::GlobalThreadNum
            | Self::LoopIndex => (),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{
        Clause, DirectiveKind, ExecutableDirective, Expr, ExprOp, LeafConstruct, LoopBounds,
        Place, ReductionOp, Stmt, VarId,
    };

    fn reduction_loop() -> ExecutableDirective {
        let red = VarId(0);
        ExecutableDirective::new(DirectiveKind::TargetTeamsDistributeParallelForSimd)
            .with_clause(Clause::Reduction {
                op: ReductionOp::Add,
                var: red,
            })
            .with_bounds(LoopBounds::new(0, 64))
            .with_body(vec![Stmt::Assign {
                place: Place::element(red, Expr::Int(1)),
                value: Expr::binary(
                    ExprOp::Add,
                    Expr::load(Place::element(red, Expr::Int(1))),
                    Expr::Int(1),
                ),
            }])
    }

    #[test]
    fn combined_constructs_decompose_into_leaves() {
        let kind = DirectiveKind::TargetTeamsDistributeParallelFor;
        assert_eq!(
            kind.leaves(),
            [
                LeafConstruct::Target,
                LeafConstruct::Teams,
                LeafConstruct::Distribute,
                LeafConstruct::Parallel,
                LeafConstruct::For
            ]
        );
        assert!(kind.is_loop());
        assert!(!DirectiveKind::TargetTeams.is_loop());
    }

    #[test]
    fn if_modifiers_select_their_leaf() {
        let directive = ExecutableDirective::new(DirectiveKind::TargetParallel).with_clause(
            Clause::If {
                modifier: Some(LeafConstruct::Parallel),
                condition: Expr::Int(0),
            },
        );

        assert_eq!(
            directive.if_condition(LeafConstruct::Parallel),
            Some(&Expr::Int(0))
        );
        assert_eq!(directive.if_condition(LeafConstruct::Target), None);
    }

    #[test]
    fn referenced_vars_include_nested_directives() {
        let inner = ExecutableDirective::new(DirectiveKind::Parallel).with_body(vec![Stmt::Assign {
            place: Place::scalar(VarId(7)),
            value: Expr::Int(1),
        }]);
        let outer = reduction_loop().with_body(vec![Stmt::Directive(Box::new(inner))]);

        assert_eq!(
            outer.referenced_vars().into_iter().collect::<Vec<_>>(),
            [VarId(0), VarId(7)]
        );
    }

    #[test]
    fn directives_are_exchanged_as_json() {
        let directive = reduction_loop();
        let json = serde_json::to_string(&directive).unwrap();
        assert!(json.contains("\"target_teams_distribute_parallel_for_simd\""));

        let back: ExecutableDirective = serde_json::from_str(&json).unwrap();
        assert_eq!(back, directive);
    }
}
