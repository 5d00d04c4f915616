//! Execution of single instructions and terminators.

use omp_nvptx::ir::{
    AtomicOp, BarrierKind, BinOp, Block, Callee, CmpPred, FuncId, Function, Inst, Operand,
    RuntimeFunction, SpecialRegister, Terminator, ValueId,
};

use crate::{
    error::{Result, SimError},
    machine::{function_address, Frame, HostTeam, Machine, TeamMember, ThreadState, Wait},
    stats::ThreadKey,
};

#[expect(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
const fn binary(op: BinOp, lhs: i64, rhs: i64) -> Option<i64> {
    Some(match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::SDiv if rhs == 0 => return None,
        BinOp::SDiv => lhs.wrapping_div(rhs),
        BinOp::SRem if rhs == 0 => return None,
        BinOp::SRem => lhs.wrapping_rem(rhs),
        BinOp::UDiv if rhs == 0 => return None,
        BinOp::UDiv => ((lhs as u64) / (rhs as u64)) as i64,
        BinOp::URem if rhs == 0 => return None,
        BinOp::URem => ((lhs as u64) % (rhs as u64)) as i64,
        BinOp::SMin => if lhs < rhs { lhs } else { rhs },
        BinOp::SMax => if lhs > rhs { lhs } else { rhs },
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
    })
}

#[expect(clippy::cast_sign_loss)]
const fn compare(pred: CmpPred, lhs: i64, rhs: i64) -> bool {
    match pred {
        CmpPred::Eq => lhs == rhs,
        CmpPred::Ne => lhs != rhs,
        CmpPred::Slt => lhs < rhs,
        CmpPred::Sle => lhs <= rhs,
        CmpPred::Sgt => lhs > rhs,
        CmpPred::Sge => lhs >= rhs,
        CmpPred::Ult => (lhs as u64) < (rhs as u64),
        CmpPred::Uge => (lhs as u64) >= (rhs as u64),
    }
}

const fn atomic(op: AtomicOp, old: i64, value: i64) -> i64 {
    match op {
        AtomicOp::Add => old.wrapping_add(value),
        AtomicOp::SMin => if value < old { value } else { old },
        AtomicOp::SMax => if value > old { value } else { old },
    }
}

impl<'m> Machine<'m> {
    fn key(&self, index: usize) -> ThreadKey {
        self.threads
            .get(index)
            .map_or(ThreadKey { block: 0, thread: 0 }, |thread| thread.key)
    }

    fn frame(&self, index: usize) -> Option<&Frame> {
        self.threads.get(index)?.frames.last()
    }

    fn frame_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.threads.get_mut(index)?.frames.last_mut()
    }

    fn malformed(&self, index: usize, reason: impl Into<String>) -> SimError {
        let function = self
            .frame(index)
            .map_or("<none>", |frame| self.module.function_name(frame.function));
        SimError::MalformedIr {
            function: function.to_owned(),
            reason: reason.into(),
        }
    }

    /// Calls `function` on thread `index` with `args`.
    pub(crate) fn enter(&mut self, index: usize, function: FuncId, args: Vec<i64>) -> Result<()> {
        let module = self.module;
        let callee = module.function(function);

        let Some((callee, body)) = callee.and_then(|callee| Some((callee, callee.body.as_ref()?)))
        else {
            return Err(SimError::InvalidCall {
                reason: format!("'{}' has no body", module.function_name(function)),
                thread: self.key(index),
            });
        };
        if callee.sig.params.len() != args.len() {
            return Err(SimError::InvalidCall {
                reason: format!(
                    "'{}' called with {} argument(s)",
                    module.function_name(function),
                    args.len()
                ),
                thread: self.key(index),
            });
        }

        self.stats.record_invocation(module.function_name(function));

        let Some(entry) = callee.entry_block() else {
            return Err(self.malformed(index, format!("'{}' has no blocks", callee.name)));
        };
        let frame = Frame {
            function,
            block: entry,
            inst: 0,
            values: vec![0; body.value_types.len()],
            params: args,
        };

        if let Some(thread) = self.threads.get_mut(index) {
            thread.frames.push(frame);
        }
        Ok(())
    }

    fn eval(&self, index: usize, operand: Operand) -> Result<i64> {
        let frame = self
            .frame(index)
            .ok_or_else(|| self.malformed(index, "no active frame"))?;

        let value = match operand {
            Operand::Value(value) => frame.values.get(value.index()).copied(),
            Operand::Param(param) => usize::try_from(param)
                .ok()
                .and_then(|param| frame.params.get(param).copied()),
            Operand::Const { value, .. } => Some(value),
            Operand::Global(global) => self.global_instance(global),
            Operand::Function(function) => Some(function_address(function)),
            Operand::Null => Some(0),
        };

        value.ok_or_else(|| self.malformed(index, format!("invalid operand {operand:?}")))
    }

    fn eval_all(&self, index: usize, operands: &[Operand]) -> Result<Vec<i64>> {
        operands
            .iter()
            .map(|operand| self.eval(index, *operand))
            .collect()
    }

    fn define(&mut self, index: usize, dst: ValueId, value: i64) -> Result<()> {
        let slot = self
            .frame_mut(index)
            .and_then(|frame| frame.values.get_mut(dst.index()));

        match slot {
            Some(slot) => {
                *slot = value;
                Ok(())
            },
            None => Err(self.malformed(index, format!("undefined value %{}", dst.index()))),
        }
    }

    fn advance(&mut self, index: usize) {
        if let Some(frame) = self.frame_mut(index) {
            frame.inst += 1;
        }
    }

    fn load(&self, index: usize, address: i64) -> Result<i64> {
        self.memory.load(address).ok_or(SimError::InvalidAddress {
            address,
            thread: self.key(index),
        })
    }

    fn store(&mut self, index: usize, address: i64, value: i64) -> Result<()> {
        if self.memory.store(address, value).is_none() {
            return Err(SimError::InvalidAddress {
                address,
                thread: self.key(index),
            });
        }

        if let Some((global, slot)) = self.global_slot(address) {
            self.stats.record_global_store(global, slot);
        }
        Ok(())
    }

    fn special(&self, index: usize, reg: SpecialRegister) -> i64 {
        let Some(thread) = self.threads.get(index) else {
            return 0;
        };

        match reg {
            SpecialRegister::ThreadIdX => i64::from(thread.tid),
            SpecialRegister::BlockIdX => i64::from(thread.block),
            SpecialRegister::BlockDimX => i64::from(self.config.block_threads()),
            SpecialRegister::GridDimX => i64::from(self.config.grid()),
            SpecialRegister::WarpSize => i64::from(self.config.warp_size()),
            SpecialRegister::LaneId => i64::from(thread.tid % self.config.warp_size()),
        }
    }

    /// Executes the next instruction or terminator of thread `index`.
    pub(crate) fn step(&mut self, index: usize) -> Result<()> {
        let steps = self.stats.record_step();
        if steps > self.config.step_limit() {
            return Err(SimError::StepLimitExceeded(self.config.step_limit()));
        }

        let module = self.module;
        let frame = self
            .frame(index)
            .ok_or_else(|| self.malformed(index, "no active frame"))?;
        let (function, block, inst) = (frame.function, frame.block, frame.inst);

        let Some(function) = module.function(function) else {
            return Err(self.malformed(index, "unknown function"));
        };
        let Some(block) = function.block(block) else {
            return Err(self.malformed(index, format!("unknown block #{}", block.index())));
        };

        match block.insts.get(inst) {
            Some(inst) => self.execute(index, function, inst),
            None => self.terminate(index, function, block),
        }
    }

    #[expect(clippy::too_many_lines)]
    fn execute(&mut self, index: usize, function: &Function, inst: &Inst) -> Result<()> {
        match inst {
            Inst::ReadSpecial { dst, reg } => {
                let value = self.special(index, *reg);
                self.define(index, *dst, value)?;
            },
            Inst::Binary { dst, op, lhs, rhs } => {
                let (lhs, rhs) = (self.eval(index, *lhs)?, self.eval(index, *rhs)?);
                let value = binary(*op, lhs, rhs).ok_or_else(|| SimError::DivisionByZero {
                    function: function.name.clone(),
                    thread: self.key(index),
                })?;
                self.define(index, *dst, value)?;
            },
            Inst::Cmp {
                dst,
                pred,
                lhs,
                rhs,
            } => {
                let (lhs, rhs) = (self.eval(index, *lhs)?, self.eval(index, *rhs)?);
                self.define(index, *dst, i64::from(compare(*pred, lhs, rhs)))?;
            },
            Inst::Select {
                dst,
                cond,
                on_true,
                on_false,
            } => {
                let value = if self.eval(index, *cond)? == 0 {
                    self.eval(index, *on_false)?
                } else {
                    self.eval(index, *on_true)?
                };
                self.define(index, *dst, value)?;
            },
            Inst::Alloca { dst, slots } => {
                let address = self.memory.alloc(*slots);
                self.define(index, *dst, address)?;
            },
            Inst::FieldAddr { dst, base, index: field } => {
                let (base, field) = (self.eval(index, *base)?, self.eval(index, *field)?);
                self.define(index, *dst, base.wrapping_add(field))?;
            },
            Inst::Load { dst, ptr } => {
                let address = self.eval(index, *ptr)?;
                let value = self.load(index, address)?;
                self.define(index, *dst, value)?;
            },
            Inst::Store { ptr, value } => {
                let (address, value) = (self.eval(index, *ptr)?, self.eval(index, *value)?);
                self.store(index, address, value)?;
            },
            Inst::AtomicRmw {
                dst,
                op,
                ptr,
                value,
            } => {
                let (address, value) = (self.eval(index, *ptr)?, self.eval(index, *value)?);
                let old = self.load(index, address)?;
                self.store(index, address, atomic(*op, old, value))?;
                self.stats.record_atomic(address);
                self.define(index, *dst, old)?;
            },
            Inst::Call { dst, callee, args } => {
                let args = self.eval_all(index, args)?;
                self.advance(index);

                let result = match callee {
                    Callee::Direct(callee) => {
                        self.enter(index, *callee, args)?;
                        None
                    },
                    Callee::Indirect(target) => {
                        let target = self.eval(index, *target)?;
                        let callee = self.function_at(target).ok_or_else(|| SimError::InvalidCall {
                            reason: format!("{target:#x} is not a function"),
                            thread: self.key(index),
                        })?;
                        self.enter(index, callee, args)?;
                        None
                    },
                    Callee::Runtime(runtime) => self.call_runtime(index, *runtime, &args)?,
                };

                if let (Some(dst), Some(result)) = (dst, result) {
                    self.define(index, *dst, result)?;
                }
                return Ok(());
            },
            Inst::Barrier(kind) => {
                let wait = match kind {
                    BarrierKind::Block => Wait::Block,
                    BarrierKind::Numbered { id, participants } => Wait::Numbered {
                        id: *id,
                        participants: self.eval(index, *participants)?,
                    },
                };
                self.advance(index);
                self.set_state(index, ThreadState::Waiting(wait));
                return Ok(());
            },
        }

        self.advance(index);
        Ok(())
    }

    fn terminate(&mut self, index: usize, function: &Function, block: &Block) -> Result<()> {
        let next = match block.terminator {
            Some(Terminator::Br(target)) => target,
            Some(Terminator::CondBr {
                cond,
                on_true,
                on_false,
            }) => {
                if self.eval(index, cond)? == 0 {
                    on_false
                } else {
                    on_true
                }
            },
            Some(Terminator::Ret) => {
                let frames = self.threads.get_mut(index).map(|thread| {
                    thread.frames.pop();
                    thread.frames.len()
                });
                if frames == Some(0) {
                    self.exit(index);
                }
                return Ok(());
            },
            Some(Terminator::Unreachable) => {
                return Err(SimError::Trap {
                    function: function.name.clone(),
                    thread: self.key(index),
                });
            },
            None => {
                return Err(self.malformed(index, format!("block '{}' has no terminator", block.label)));
            },
        };

        if let Some(frame) = self.frame_mut(index) {
            frame.block = next;
            frame.inst = 0;
        }
        Ok(())
    }

    fn call_runtime(
        &mut self,
        index: usize,
        function: RuntimeFunction,
        args: &[i64],
    ) -> Result<Option<i64>> {
        self.stats.record_runtime_call(function);

        let member = self.threads.get(index).and_then(|thread| thread.team);

        match function {
            RuntimeFunction::KernelInit
            | RuntimeFunction::KernelDeinit
            | RuntimeFunction::SerializedParallel
            | RuntimeFunction::EndSerializedParallel => Ok(None),
            RuntimeFunction::GlobalThreadNum => {
                Ok(Some(member.map_or(0, |member| i64::from(member.index))))
            },
            RuntimeFunction::MaxThreads => Ok(Some(i64::from(self.config.host_threads()))),
            RuntimeFunction::Barrier => {
                if let Some(member) = member {
                    self.set_state(index, ThreadState::Waiting(Wait::Team(member.team)));
                }
                Ok(None)
            },
            RuntimeFunction::ForkCall => {
                let (Some(outlined), Some(context)) = (args.first(), args.get(1)) else {
                    return Err(SimError::InvalidCall {
                        reason: format!("{function} called with {} argument(s)", args.len()),
                        thread: self.key(index),
                    });
                };
                let outlined = self.function_at(*outlined).ok_or_else(|| SimError::InvalidCall {
                    reason: format!("{outlined:#x} forked but is not a function"),
                    thread: self.key(index),
                })?;
                self.fork(index, outlined, *context)?;
                Ok(None)
            },
        }
    }

    /// Runs `outlined` on a new host team while thread `parent` waits.
    fn fork(&mut self, parent: usize, outlined: FuncId, context: i64) -> Result<()> {
        let team = self.teams.len();
        let size = self.config.host_threads();
        self.teams.push(HostTeam {
            parent,
            live: usize::try_from(size).unwrap_or(usize::MAX),
        });
        self.set_state(parent, ThreadState::Waiting(Wait::Join(team)));

        tracing::trace!(team, threads = size, "forking host team");

        for member in 0..size {
            let tid_slot = self.memory.alloc(1);
            self.store(parent, tid_slot, i64::from(member))?;

            let key = ThreadKey {
                block: 0,
                thread: u32::try_from(self.threads.len()).unwrap_or(u32::MAX),
            };
            let thread = self.spawn(key, 0, 0, Some(TeamMember { team, index: member }));
            self.enter(thread, outlined, vec![tid_slot, 0, context])?;
        }

        Ok(())
    }
}
