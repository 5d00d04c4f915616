use std::collections::HashSet;

use crate::error::{ErrorKind, Result};

use super::{
    AtomicOp, BarrierKind, BinOp, Block, BlockId, Callee, CmpPred, FuncId, FunctionBody, Inst,
    Operand, RuntimeFunction, SpecialRegister, Terminator, Ty, ValueId,
};

/// Insert-point builder for the body of one function.
///
/// The body is built detached from the [`Module`](super::Module) so that
/// several functions (a kernel and the regions outlined from it) can be under
/// construction at the same time. It is attached with
/// [`Module::define_function`](super::Module::define_function).
///
/// Every emitting method fails with [`ErrorKind::MalformedIr`] once the
/// current block has its terminator.
#[derive(Debug)]
pub struct FunctionBuilder {
    id: FuncId,
    name: String,
    blocks: Vec<Block>,
    labels: HashSet<String>,
    value_types: Vec<Ty>,
    current: BlockId,
}

impl FunctionBuilder {
    /// A body consisting of an open `entry` block.
    #[must_use]
    pub fn new(id: FuncId, name: impl Into<String>) -> Self {
        let mut builder = Self {
            id,
            name: name.into(),
            blocks: Vec::new(),
            labels: HashSet::new(),
            value_types: Vec::new(),
            current: BlockId::from_index(0),
        };
        builder.current = builder.new_block("entry");
        builder
    }

    #[must_use]
    /// The function being built.
    pub const fn id(&self) -> FuncId {
        self.id
    }

    #[must_use]
    /// Symbol of the function being built.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a new, empty block. Labels are made unique with a numeric
    /// suffix.
    pub fn new_block(&mut self, label: &str) -> BlockId {
        let mut unique = String::from(label);
        let mut suffix = 1_usize;
        while self.labels.contains(&unique) {
            unique = format!("{label}{suffix}");
            suffix += 1;
        }
        self.labels.insert(unique.clone());

        let id = BlockId::from_index(self.blocks.len());
        self.blocks.push(Block {
            label: unique,
            insts: Vec::new(),
            terminator: None,
        });
        id
    }

    /// Moves the insert point to the end of `block`.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    #[must_use]
    /// The block instructions are appended to.
    pub const fn current_block(&self) -> BlockId {
        self.current
    }

    /// Whether the current block is closed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.blocks
            .get(self.current.index())
            .map_or(true, |block| block.terminator.is_some())
    }

    fn current_mut(&mut self) -> Result<&mut Block> {
        let name = &self.name;
        let current = self.current;
        match self.blocks.get_mut(current.index()) {
            Some(block) if block.terminator.is_none() => Ok(block),
            Some(block) => Err(ErrorKind::MalformedIr {
                function: name.clone(),
                reason: format!("instruction emitted after the terminator of '{}'", block.label),
            }
            .into()),
            None => Err(ErrorKind::MalformedIr {
                function: name.clone(),
                reason: format!("insert point #{} does not exist", current.index()),
            }
            .into()),
        }
    }

    fn fresh(&mut self, ty: Ty) -> ValueId {
        let id = ValueId::from_index(self.value_types.len());
        self.value_types.push(ty);
        id
    }

    fn push_value(&mut self, ty: Ty, inst: impl FnOnce(ValueId) -> Inst) -> Result<Operand> {
        // check the insert point before allocating the value
        self.current_mut()?;
        let dst = self.fresh(ty);
        self.current_mut()?.insts.push(inst(dst));
        Ok(Operand::Value(dst))
    }

    fn push(&mut self, inst: Inst) -> Result<()> {
        self.current_mut()?.insts.push(inst);
        Ok(())
    }

    /// Reads a hardware register as an `i32`.
    pub fn read_special(&mut self, reg: SpecialRegister) -> Result<Operand> {
        self.push_value(Ty::I32, |dst| Inst::ReadSpecial { dst, reg })
    }

    /// `lhs op rhs` as an `i64`.
    pub fn binary(&mut self, op: BinOp, lhs: Operand, rhs: Operand) -> Result<Operand> {
        self.push_value(Ty::I64, |dst| Inst::Binary { dst, op, lhs, rhs })
    }

    /// `lhs + rhs`
    pub fn add(&mut self, lhs: Operand, rhs: Operand) -> Result<Operand> {
        self.binary(BinOp::Add, lhs, rhs)
    }

    /// `lhs - rhs`
    pub fn sub(&mut self, lhs: Operand, rhs: Operand) -> Result<Operand> {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    /// `lhs * rhs`
    pub fn mul(&mut self, lhs: Operand, rhs: Operand) -> Result<Operand> {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    /// Compares to an `i1`.
    pub fn cmp(&mut self, pred: CmpPred, lhs: Operand, rhs: Operand) -> Result<Operand> {
        self.push_value(Ty::I1, |dst| Inst::Cmp {
            dst,
            pred,
            lhs,
            rhs,
        })
    }

    /// `cond ? on_true : on_false`
    pub fn select(&mut self, cond: Operand, on_true: Operand, on_false: Operand) -> Result<Operand> {
        self.push_value(Ty::I64, |dst| Inst::Select {
            dst,
            cond,
            on_true,
            on_false,
        })
    }

    /// Thread-private storage of `slots` slots.
    pub fn alloca(&mut self, slots: u32) -> Result<Operand> {
        self.push_value(Ty::Ptr, |dst| Inst::Alloca { dst, slots })
    }

    /// Address of slot `index` of `base`; index zero is `base` itself.
    pub fn field_addr(&mut self, base: Operand, index: Operand) -> Result<Operand> {
        if index == Operand::i64(0) || index == Operand::i32(0) {
            return Ok(base);
        }
        self.push_value(Ty::Ptr, |dst| Inst::FieldAddr { dst, base, index })
    }

    /// Reads the slot at `ptr`.
    pub fn load(&mut self, ptr: Operand) -> Result<Operand> {
        self.push_value(Ty::I64, |dst| Inst::Load { dst, ptr })
    }

    /// Writes `value` to the slot at `ptr`.
    pub fn store(&mut self, ptr: Operand, value: Operand) -> Result<()> {
        self.push(Inst::Store { ptr, value })
    }

    /// Atomically combines `value` into the slot at `ptr`, yielding the
    /// old value.
    pub fn atomic_rmw(&mut self, op: AtomicOp, ptr: Operand, value: Operand) -> Result<Operand> {
        self.push_value(Ty::I64, |dst| Inst::AtomicRmw {
            dst,
            op,
            ptr,
            value,
        })
    }

    /// Calls a function that returns nothing.
    pub fn call(&mut self, callee: Callee, args: Vec<Operand>) -> Result<()> {
        self.push(Inst::Call {
            dst: None,
            callee,
            args,
        })
    }

    /// Calls into the external OpenMP runtime, returning the result for
    /// non-`void` entry points.
    pub fn call_runtime(
        &mut self,
        function: RuntimeFunction,
        args: Vec<Operand>,
    ) -> Result<Option<Operand>> {
        if function.params().len() != args.len() {
            crate::bail!(ErrorKind::MalformedIr {
                function: self.name.clone(),
                reason: format!(
                    "{function} expects {} argument(s) but got {}",
                    function.params().len(),
                    args.len()
                ),
            });
        }

        match function.ret() {
            Ty::Void => {
                self.call(Callee::Runtime(function), args)?;
                Ok(None)
            },
            ty => self
                .push_value(ty, |dst| Inst::Call {
                    dst: Some(dst),
                    callee: Callee::Runtime(function),
                    args,
                })
                .map(Some),
        }
    }

    /// Waits on a block-wide or named barrier.
    pub fn barrier(&mut self, kind: BarrierKind) -> Result<()> {
        self.push(Inst::Barrier(kind))
    }

    fn terminate(&mut self, terminator: Terminator) -> Result<()> {
        self.current_mut()?.terminator = Some(terminator);
        Ok(())
    }

    /// Closes the block with an unconditional branch.
    pub fn br(&mut self, target: BlockId) -> Result<()> {
        self.terminate(Terminator::Br(target))
    }

    /// Closes the block with a branch on an `i1`.
    pub fn cond_br(&mut self, cond: Operand, on_true: BlockId, on_false: BlockId) -> Result<()> {
        self.terminate(Terminator::CondBr {
            cond,
            on_true,
            on_false,
        })
    }

    /// Closes the block with a return.
    pub fn ret(&mut self) -> Result<()> {
        self.terminate(Terminator::Ret)
    }

    /// Closes the block with a trap.
    pub fn unreachable(&mut self) -> Result<()> {
        self.terminate(Terminator::Unreachable)
    }

    /// The finished body; fails if a block is still open.
    pub fn finish(self) -> Result<FunctionBody> {
        if let Some(block) = self.blocks.iter().find(|block| block.terminator.is_none()) {
            crate::bail!(ErrorKind::MalformedIr {
                function: self.name,
                reason: format!("block '{}' has no terminator", block.label),
            });
        }

        Ok(FunctionBody {
            blocks: self.blocks,
            value_types: self.value_types,
        })
    }
}

/// A counted loop `for (iv = lower; iv < upper; iv += step)` with the
/// induction variable kept in an `alloca` slot.
///
/// [`CountedLoop::begin`] leaves the builder in the loop body and returns
/// the current index; [`CountedLoop::end`] closes the body at the current
/// insert point and continues after the loop.
#[derive(Debug)]
#[must_use]
pub struct CountedLoop {
    iv: Operand,
    step: Operand,
    header: BlockId,
    exit: BlockId,
}

impl CountedLoop {
    /// Opens the loop, the blocks labelled after `label`.
    pub fn begin(
        cgf: &mut FunctionBuilder,
        label: &str,
        lower: Operand,
        upper: Operand,
        step: Operand,
    ) -> Result<(Self, Operand)> {
        let iv = cgf.alloca(1)?;
        cgf.store(iv, lower)?;

        let header = cgf.new_block(&format!("{label}.cond"));
        let body = cgf.new_block(&format!("{label}.body"));
        let exit = cgf.new_block(&format!("{label}.end"));

        cgf.br(header)?;
        cgf.switch_to(header);
        let index = cgf.load(iv)?;
        let in_range = cgf.cmp(CmpPred::Slt, index, upper)?;
        cgf.cond_br(in_range, body, exit)?;

        cgf.switch_to(body);
        let index = cgf.load(iv)?;

        Ok((
            Self {
                iv,
                step,
                header,
                exit,
            },
            index,
        ))
    }

    /// Steps the index and continues after the loop.
    pub fn end(self, cgf: &mut FunctionBuilder) -> Result<()> {
        let index = cgf.load(self.iv)?;
        let next = cgf.add(index, self.step)?;
        cgf.store(self.iv, next)?;
        cgf.br(self.header)?;
        cgf.switch_to(self.exit);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{CountedLoop, FunctionBuilder};
    use crate::ir::{FuncId, Operand, Terminator};

    #[test]
    fn labels_are_made_unique() {
        let mut cgf = FunctionBuilder::new(FuncId::from_index(0), "f");
        let a = cgf.new_block("loop");
        let b = cgf.new_block("loop");
        cgf.ret().unwrap();
        for block in [a, b] {
            cgf.switch_to(block);
            cgf.ret().unwrap();
        }

        let body = cgf.finish().unwrap();
        let labels: Vec<_> = body.blocks.iter().map(|block| block.label.as_str()).collect();
        assert_eq!(labels, ["entry", "loop", "loop1"]);
    }

    #[test]
    fn emitting_after_a_terminator_is_rejected() {
        let mut cgf = FunctionBuilder::new(FuncId::from_index(0), "f");
        cgf.ret().unwrap();

        let err = cgf.load(Operand::Null).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn unterminated_blocks_are_rejected() {
        let mut cgf = FunctionBuilder::new(FuncId::from_index(0), "f");
        let _dangling = cgf.new_block("dangling");
        cgf.ret().unwrap();

        assert!(cgf.finish().unwrap_err().is_internal());
    }

    #[test]
    fn counted_loop_closes_back_to_its_header() {
        let mut cgf = FunctionBuilder::new(FuncId::from_index(0), "f");
        let (lp, _index) =
            CountedLoop::begin(&mut cgf, "for", Operand::i64(0), Operand::i64(4), Operand::i64(1))
                .unwrap();
        lp.end(&mut cgf).unwrap();
        cgf.ret().unwrap();

        let body = cgf.finish().unwrap();
        let header = body
            .blocks
            .iter()
            .position(|block| block.label == "for.cond")
            .unwrap();
        let latch = body
            .blocks
            .iter()
            .find(|block| block.label == "for.body")
            .unwrap();
        assert_eq!(
            latch.terminator,
            Some(Terminator::Br(crate::ir::BlockId::from_index(header)))
        );
    }
}
