//! The structured IR consumed by the instruction-selection backend.
//!
//! Functions are lists of basic blocks; blocks hold straight-line
//! instructions producing SSA values and end in exactly one terminator.
//! There are no phi nodes: values that change across loop iterations live in
//! `alloca` slots. Memory is addressed in 64-bit slots.

use std::collections::HashMap;

pub use crate::device::nvptx::SpecialRegister;
pub use crate::runtime::RuntimeFunction;

mod builder;
mod print;
mod symbol;
mod verify;

pub use builder::{CountedLoop, FunctionBuilder};
pub use symbol::{is_valid_symbol, sanitize_symbol};
pub use verify::verify_module;

use crate::error::{ErrorKind, Result};

/// Value types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    /// Booleans, produced by comparisons.
    I1,
    /// 32-bit integers, used for thread ids and registers.
    I32,
    /// 64-bit integers, the type of every slot.
    I64,
    /// Slot addresses and function references.
    Ptr,
    /// The return type of calls that produce nothing.
    Void,
}

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// Position in the owning list.
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            #[allow(clippy::cast_possible_truncation)]
            pub(crate) const fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }
    };
}

id_type!(
    /// An SSA value defined by an instruction of the enclosing function.
    ValueId
);
id_type!(
    /// A basic block of the enclosing function.
    BlockId
);
id_type!(
    /// A function of a [`Module`].
    FuncId
);
id_type!(
    /// A global variable of a [`Module`].
    GlobalId
);

/// Instruction operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// The result of an earlier instruction.
    Value(ValueId),
    /// A parameter of the enclosing function.
    Param(u32),
    /// An integer constant of type `ty`.
    #[allow(missing_docs)]
    Const { value: i64, ty: Ty },
    /// Address of a global variable.
    Global(GlobalId),
    /// A function reference used as a first-class value.
    Function(FuncId),
    /// The null pointer.
    Null,
}

impl Operand {
    /// An `i32` constant.
    #[must_use]
    pub const fn i32(value: i32) -> Self {
        Self::Const {
            value: value as i64,
            ty: Ty::I32,
        }
    }

    /// An `i64` constant.
    #[must_use]
    pub const fn i64(value: i64) -> Self {
        Self::Const {
            value,
            ty: Ty::I64,
        }
    }

    /// An `i1` constant.
    #[must_use]
    pub const fn bool(value: bool) -> Self {
        Self::Const {
            value: value as i64,
            ty: Ty::I1,
        }
    }

    /// The value of a constant operand.
    #[must_use]
    pub const fn as_const(self) -> Option<i64> {
        match self {
            Self::Const { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Integer arithmetic on two operands of the same type, named after the
/// LLVM instruction or intrinsic it prints as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    UDiv,
    URem,
    SMin,
    SMax,
    And,
    Or,
}

/// `icmp` predicates: `s` compares signed, `u` unsigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Uge,
}

/// `atomicrmw` operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    /// `add`
    Add,
    /// `min`, signed.
    SMin,
    /// `max`, signed.
    SMax,
}

/// The two barrier flavours of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    /// Every thread of the block.
    Block,
    /// A named barrier waited on by `participants` threads.
    #[allow(missing_docs)]
    Numbered { id: u32, participants: Operand },
}

/// The target of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callee {
    /// A function of the module.
    Direct(FuncId),
    /// A function reference computed at run time.
    Indirect(Operand),
    /// An entry point of the OpenMP runtime.
    Runtime(RuntimeFunction),
}

/// Straight-line instructions; `dst` is the value an instruction defines.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Inst {
    /// Reads a hardware register.
    ReadSpecial {
        dst: ValueId,
        reg: SpecialRegister,
    },
    /// `lhs op rhs`
    Binary {
        dst: ValueId,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Compares to an `i1`.
    Cmp {
        dst: ValueId,
        pred: CmpPred,
        lhs: Operand,
        rhs: Operand,
    },
    /// `cond ? on_true : on_false`
    Select {
        dst: ValueId,
        cond: Operand,
        on_true: Operand,
        on_false: Operand,
    },
    /// Thread-private storage of `slots` slots, live until the function
    /// returns.
    Alloca {
        dst: ValueId,
        slots: u32,
    },
    /// Address of slot `index` of `base`.
    FieldAddr {
        dst: ValueId,
        base: Operand,
        index: Operand,
    },
    Load {
        dst: ValueId,
        ptr: Operand,
    },
    Store {
        ptr: Operand,
        value: Operand,
    },
    /// Atomically combines `value` into `*ptr`, yielding the old value.
    AtomicRmw {
        dst: ValueId,
        op: AtomicOp,
        ptr: Operand,
        value: Operand,
    },
    /// `dst` is set when the callee returns a value.
    Call {
        dst: Option<ValueId>,
        callee: Callee,
        args: Vec<Operand>,
    },
    Barrier(BarrierKind),
}

impl Inst {
    /// The value defined by the instruction.
    #[must_use]
    pub const fn dst(&self) -> Option<ValueId> {
        match self {
            Self::ReadSpecial { dst, .. }
            | Self::Binary { dst, .. }
            | Self::Cmp { dst, .. }
            | Self::Select { dst, .. }
            | Self::Alloca { dst, .. }
            | Self::FieldAddr { dst, .. }
            | Self::Load { dst, .. }
            | Self::AtomicRmw { dst, .. } => Some(*dst),
            Self::Call { dst, .. } => *dst,
            Self::Store { .. } | Self::Barrier(_) => None,
        }
    }

    /// Every operand read, in evaluation order.
    #[must_use]
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Self::ReadSpecial { .. } | Self::Alloca { .. } => Vec::new(),
            Self::Binary { lhs, rhs, .. } | Self::Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Self::Select {
                cond,
                on_true,
                on_false,
                ..
            } => vec![*cond, *on_true, *on_false],
            Self::FieldAddr { base, index, .. } => vec![*base, *index],
            Self::Load { ptr, .. } => vec![*ptr],
            Self::Store { ptr, value } | Self::AtomicRmw { ptr, value, .. } => vec![*ptr, *value],
            Self::Call { callee, args, .. } => {
                let mut operands = args.clone();
                if let Callee::Indirect(target) = callee {
                    operands.push(*target);
                }
                operands
            },
            Self::Barrier(BarrierKind::Block) => Vec::new(),
            Self::Barrier(BarrierKind::Numbered { participants, .. }) => vec![*participants],
        }
    }
}

/// The instruction that ends a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminator {
    /// Unconditional branch.
    Br(BlockId),
    /// Branches on an `i1`.
    #[allow(missing_docs)]
    CondBr {
        cond: Operand,
        on_true: BlockId,
        on_false: BlockId,
    },
    /// Returns from a `void` function.
    Ret,
    /// Traps when reached.
    Unreachable,
}

impl Terminator {
    /// Blocks control may continue in.
    #[must_use]
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Br(target) => vec![*target],
            Self::CondBr {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            Self::Ret | Self::Unreachable => Vec::new(),
        }
    }
}

/// A basic block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Printed label; not required to be unique.
    pub label: String,
    /// Instructions in execution order.
    pub insts: Vec<Inst>,
    /// Set once the block is closed; every block of a finished body has one.
    pub terminator: Option<Terminator>,
}

/// What a function is for; decides how it is annotated and printed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    /// Device kernel entry of a target region.
    Kernel,
    /// Worker loop of a target region.
    Worker,
    /// Outlined parallel or teams region body.
    Outlined,
    /// Host fallback of a target region.
    HostEntry,
}

/// Symbol visibility outside the module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    /// Visible to the linker.
    External,
    /// Local to the module.
    Internal,
}

/// Parameter types; every function returns `void`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    #[allow(missing_docs)]
    pub params: Vec<Ty>,
}

/// The body of a defined function, as produced by [`FunctionBuilder::finish`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionBody {
    /// Blocks indexed by [`BlockId`], the entry block first.
    pub blocks: Vec<Block>,
    /// Types indexed by [`ValueId`].
    pub value_types: Vec<Ty>,
}

/// A declared function, defined once it has a body.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub linkage: Linkage,
    pub sig: Signature,
    pub body: Option<FunctionBody>,
}

impl Function {
    /// Whether the function has a body.
    #[must_use]
    pub const fn is_defined(&self) -> bool {
        self.body.is_some()
    }

    /// The blocks of the body, none for declarations.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        self.body.as_ref().map_or(&[], |body| body.blocks.as_slice())
    }

    #[must_use]
    /// A block of the body.
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks().get(id.index())
    }

    /// The block execution starts in, the first one of the body.
    #[must_use]
    pub fn entry_block(&self) -> Option<BlockId> {
        (!self.blocks().is_empty()).then_some(BlockId::from_index(0))
    }
}

/// Where a global lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    /// Device memory, one instance per module.
    Global,
    /// Block-shared memory, instantiated once per thread block.
    Shared,
}

/// Initializer of a global slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constant {
    /// An integer.
    Int(i64),
    /// The address of a function.
    Function(FuncId),
}

/// A global variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Global {
    /// Unique symbol.
    pub name: String,
    #[allow(missing_docs)]
    pub space: AddressSpace,
    #[allow(missing_docs)]
    pub linkage: Linkage,
    /// Size in 64-bit slots.
    pub slots: u32,
    /// Missing trailing slots are zero-initialised.
    pub init: Vec<Constant>,
    /// Object file section, the default one when `None`.
    pub section: Option<String>,
}

/// Module-level metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Annotation {
    /// `!nvvm.annotations = !{ptr @kernel, !"kernel", i32 1}`
    Kernel(FuncId),
}

/// A translation unit: functions, globals and annotations, each with a
/// unique symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// Module identifier.
    pub name: String,
    /// Target triple.
    pub triple: String,
    functions: Vec<Function>,
    globals: Vec<Global>,
    annotations: Vec<Annotation>,
    function_names: HashMap<String, FuncId>,
    global_names: HashMap<String, GlobalId>,
}

impl Module {
    /// An empty module.
    #[must_use]
    pub fn new(name: impl Into<String>, triple: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triple: triple.into(),
            functions: Vec::new(),
            globals: Vec::new(),
            annotations: Vec::new(),
            function_names: HashMap::new(),
            global_names: HashMap::new(),
        }
    }

    /// Declares a function without a body.
    ///
    /// Fails on invalid or already used symbols.
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        kind: FunctionKind,
        linkage: Linkage,
        params: Vec<Ty>,
    ) -> Result<FuncId> {
        let name = name.into();

        if !is_valid_symbol(&name) {
            crate::bail!(ErrorKind::InvalidSymbol(name));
        }
        if self.function_names.contains_key(&name) || self.global_names.contains_key(&name) {
            crate::bail!(ErrorKind::InternalError(format!(
                "symbol '{name}' is already defined"
            )));
        }

        let id = FuncId::from_index(self.functions.len());
        self.function_names.insert(name.clone(), id);
        self.functions.push(Function {
            name,
            kind,
            linkage,
            sig: Signature { params },
            body: None,
        });

        Ok(id)
    }

    /// Gives a declared function its body, exactly once.
    pub fn define_function(&mut self, id: FuncId, body: FunctionBody) -> Result<()> {
        let Some(function) = self.functions.get_mut(id.index()) else {
            crate::bail!(ErrorKind::InternalError(format!(
                "cannot define unknown function #{}",
                id.index()
            )));
        };

        if function.body.is_some() {
            crate::bail!(ErrorKind::MalformedIr {
                function: function.name.clone(),
                reason: String::from("function is defined twice"),
            });
        }

        function.body = Some(body);

        Ok(())
    }

    /// Adds a global; fails on invalid or already used symbols.
    pub fn add_global(&mut self, global: Global) -> Result<GlobalId> {
        if !is_valid_symbol(&global.name) {
            crate::bail!(ErrorKind::InvalidSymbol(global.name));
        }
        if self.function_names.contains_key(&global.name)
            || self.global_names.contains_key(&global.name)
        {
            crate::bail!(ErrorKind::InternalError(format!(
                "symbol '{}' is already defined",
                global.name
            )));
        }

        let id = GlobalId::from_index(self.globals.len());
        self.global_names.insert(global.name.clone(), id);
        self.globals.push(global);

        Ok(id)
    }

    /// Adds an annotation unless it is already present.
    pub fn annotate(&mut self, annotation: Annotation) {
        if !self.annotations.contains(&annotation) {
            self.annotations.push(annotation);
        }
    }

    #[must_use]
    /// The function `id`, if it belongs to this module.
    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.index())
    }

    #[must_use]
    /// The global `id`, if it belongs to this module.
    pub fn global(&self, id: GlobalId) -> Option<&Global> {
        self.globals.get(id.index())
    }

    /// Looks up a function by symbol.
    #[must_use]
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.function_names.get(name).copied()
    }

    /// Looks up a global by symbol.
    #[must_use]
    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.global_names.get(name).copied()
    }

    /// Functions in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(index, function)| (FuncId::from_index(index), function))
    }

    /// Globals in declaration order.
    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &Global)> {
        self.globals
            .iter()
            .enumerate()
            .map(|(index, global)| (GlobalId::from_index(index), global))
    }

    #[must_use]
    /// Annotations in insertion order.
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Name of a function, or a placeholder for dangling ids.
    #[must_use]
    pub fn function_name(&self, id: FuncId) -> &str {
        self.function(id).map_or("<unknown>", |function| &function.name)
    }

    /// Name of a global, or a placeholder for dangling ids.
    #[must_use]
    pub fn global_name(&self, id: GlobalId) -> &str {
        self.global(id).map_or("<unknown>", |global| &global.name)
    }
}
