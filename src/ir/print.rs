use std::fmt::{self, Write};

use super::{
    AddressSpace, Annotation, AtomicOp, BarrierKind, BinOp, Callee, CmpPred, Constant, Function,
    FunctionKind, Inst, Linkage, Module, Operand, Terminator, Ty,
};
use crate::device::nvptx::{BLOCK_BARRIER_INTRINSIC, NUMBERED_BARRIER_INTRINSIC};

impl fmt::Display for Ty {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I1 => fmt.write_str("i1"),
            Self::I32 => fmt.write_str("i32"),
            Self::I64 => fmt.write_str("i64"),
            Self::Ptr => fmt.write_str("ptr"),
            Self::Void => fmt.write_str("void"),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::SDiv => "sdiv",
            Self::SRem => "srem",
            Self::UDiv => "udiv",
            Self::URem => "urem",
            Self::SMin => "smin",
            Self::SMax => "smax",
            Self::And => "and",
            Self::Or => "or",
        })
    }
}

impl fmt::Display for CmpPred {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Slt => "slt",
            Self::Sle => "sle",
            Self::Sgt => "sgt",
            Self::Sge => "sge",
            Self::Ult => "ult",
            Self::Uge => "uge",
        })
    }
}

impl fmt::Display for AtomicOp {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match self {
            Self::Add => "add",
            Self::SMin => "min",
            Self::SMax => "max",
        })
    }
}

struct OperandPrinter<'a> {
    module: &'a Module,
    operand: Operand,
}

impl fmt::Display for OperandPrinter<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.operand {
            Operand::Value(value) => write!(fmt, "%{}", value.index()),
            Operand::Param(index) => write!(fmt, "%arg{index}"),
            Operand::Const { value, ty } => write!(fmt, "{ty} {value}"),
            Operand::Global(global) => write!(fmt, "@{}", self.module.global_name(global)),
            Operand::Function(function) => {
                write!(fmt, "@{}", self.module.function_name(function))
            },
            Operand::Null => fmt.write_str("null"),
        }
    }
}

impl Module {
    fn op(&self, operand: Operand) -> OperandPrinter<'_> {
        OperandPrinter {
            module: self,
            operand,
        }
    }

    fn print_inst(&self, out: &mut String, inst: &Inst) -> fmt::Result {
        out.push_str("  ");
        if let Some(dst) = inst.dst() {
            write!(out, "%{} = ", dst.index())?;
        }

        match inst {
            Inst::ReadSpecial { reg, .. } => write!(out, "call i32 @{reg}()"),
            Inst::Binary { op, lhs, rhs, .. } => {
                write!(out, "{op} {}, {}", self.op(*lhs), self.op(*rhs))
            },
            Inst::Cmp { pred, lhs, rhs, .. } => {
                write!(out, "icmp {pred} {}, {}", self.op(*lhs), self.op(*rhs))
            },
            Inst::Select {
                cond,
                on_true,
                on_false,
                ..
            } => write!(
                out,
                "select {}, {}, {}",
                self.op(*cond),
                self.op(*on_true),
                self.op(*on_false)
            ),
            Inst::Alloca { slots, .. } => write!(out, "alloca [{slots} x i64]"),
            Inst::FieldAddr { base, index, .. } => write!(
                out,
                "getelementptr i64, {}, {}",
                self.op(*base),
                self.op(*index)
            ),
            Inst::Load { ptr, .. } => write!(out, "load i64, {}", self.op(*ptr)),
            Inst::Store { ptr, value } => {
                write!(out, "store {}, {}", self.op(*value), self.op(*ptr))
            },
            Inst::AtomicRmw { op, ptr, value, .. } => write!(
                out,
                "atomicrmw {op} {}, {} monotonic",
                self.op(*ptr),
                self.op(*value)
            ),
            Inst::Call { callee, args, .. } => {
                match callee {
                    Callee::Direct(function) => {
                        write!(out, "call void @{}(", self.function_name(*function))?;
                    },
                    Callee::Indirect(target) => write!(out, "call void {}(", self.op(*target))?,
                    Callee::Runtime(function) => {
                        write!(out, "call {} @{function}(", function.ret())?;
                    },
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write!(out, "{}", self.op(*arg))?;
                }
                out.push(')');
                Ok(())
            },
            Inst::Barrier(BarrierKind::Block) => write!(out, "call void @{BLOCK_BARRIER_INTRINSIC}()"),
            Inst::Barrier(BarrierKind::Numbered { id, participants }) => write!(
                out,
                "call void @{NUMBERED_BARRIER_INTRINSIC}(i32 {id}, {})",
                self.op(*participants)
            ),
        }?;

        out.push('\n');
        Ok(())
    }

    fn print_function(&self, out: &mut String, function: &Function) -> fmt::Result {
        let params = function
            .sig
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("{ty} %arg{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let linkage = match function.linkage {
            Linkage::External => "",
            Linkage::Internal => "internal ",
        };
        let kind = match function.kind {
            FunctionKind::Kernel => "kernel",
            FunctionKind::Worker => "worker",
            FunctionKind::Outlined => "outlined",
            FunctionKind::HostEntry => "host",
        };

        let Some(body) = &function.body else {
            return writeln!(out, "declare void @{}({params})", function.name);
        };

        writeln!(
            out,
            "; {kind}\ndefine {linkage}void @{}({params}) {{",
            function.name
        )?;

        for (i, block) in body.blocks.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            writeln!(out, "{}:", block.label)?;
            for inst in &block.insts {
                self.print_inst(out, inst)?;
            }

            let label = |id: super::BlockId| {
                body.blocks
                    .get(id.index())
                    .map_or("<unknown>", |block| block.label.as_str())
            };
            match block.terminator {
                Some(Terminator::Br(target)) => writeln!(out, "  br label %{}", label(target))?,
                Some(Terminator::CondBr {
                    cond,
                    on_true,
                    on_false,
                }) => writeln!(
                    out,
                    "  br {}, label %{}, label %{}",
                    self.op(cond),
                    label(on_true),
                    label(on_false)
                )?,
                Some(Terminator::Ret) => writeln!(out, "  ret void")?,
                Some(Terminator::Unreachable) => writeln!(out, "  unreachable")?,
                None => writeln!(out, "  ; <unterminated>")?,
            }
        }

        writeln!(out, "}}")
    }

    fn print(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "; ModuleID = '{}'", self.name)?;
        writeln!(out, "target triple = \"{}\"", self.triple)?;

        for (_, global) in self.globals() {
            out.push('\n');
            let space = match global.space {
                AddressSpace::Global => "",
                AddressSpace::Shared => " addrspace(3)",
            };
            let linkage = match global.linkage {
                Linkage::External => "",
                Linkage::Internal => " internal",
            };
            write!(out, "@{} ={linkage}{space} global [{} x i64] ", global.name, global.slots)?;
            if global.init.is_empty() {
                out.push_str("zeroinitializer");
            } else {
                out.push('[');
                for (i, constant) in global.init.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match constant {
                        Constant::Int(value) => write!(out, "i64 {value}")?,
                        Constant::Function(function) => {
                            write!(out, "ptr @{}", self.function_name(*function))?;
                        },
                    }
                }
                out.push(']');
            }
            if let Some(section) = &global.section {
                write!(out, ", section \"{section}\"")?;
            }
            out.push('\n');
        }

        let mut declared = std::collections::BTreeSet::new();
        for (_, function) in self.functions() {
            out.push('\n');
            self.print_function(out, function)?;

            for block in function.blocks() {
                for inst in &block.insts {
                    match inst {
                        Inst::Call {
                            callee: Callee::Runtime(runtime),
                            ..
                        } => {
                            declared.insert(runtime.symbol());
                        },
                        Inst::ReadSpecial { reg, .. } => {
                            declared.insert(reg.intrinsic());
                        },
                        Inst::Barrier(BarrierKind::Block) => {
                            declared.insert(BLOCK_BARRIER_INTRINSIC);
                        },
                        Inst::Barrier(BarrierKind::Numbered { .. }) => {
                            declared.insert(NUMBERED_BARRIER_INTRINSIC);
                        },
                        _ => (),
                    }
                }
            }
        }

        if !declared.is_empty() {
            out.push('\n');
        }
        for symbol in declared {
            writeln!(out, "declare @{symbol}")?;
        }

        if !self.annotations().is_empty() {
            out.push_str("\n!nvvm.annotations = !{");
            for (i, annotation) in self.annotations().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                match annotation {
                    Annotation::Kernel(function) => write!(
                        out,
                        "!{{ptr @{}, !\"kernel\", i32 1}}",
                        self.function_name(*function)
                    )?,
                }
            }
            out.push_str("}\n");
        }

        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut out = String::new();
        self.print(&mut out)?;
        fmt.write_str(&out)
    }
}
