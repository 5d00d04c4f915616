use crate::error::{ErrorKind, Result};

use super::{Annotation, Callee, Constant, Function, Inst, Module, Operand, Terminator};

/// Structural checks on a finished module: every block is terminated, every
/// operand refers to something that exists and every call matches the arity
/// of its callee.
pub fn verify_module(module: &Module) -> Result<()> {
    for (_, function) in module.functions() {
        verify_function(module, function)?;
    }

    for (_, global) in module.globals() {
        if global.init.len() > global.slots as usize {
            crate::bail!(ErrorKind::MalformedIr {
                function: global.name.clone(),
                reason: format!(
                    "initialiser has {} slot(s) but the global only {}",
                    global.init.len(),
                    global.slots
                ),
            });
        }
        for constant in &global.init {
            if let Constant::Function(function) = constant {
                if module.function(*function).is_none() {
                    crate::bail!(ErrorKind::MalformedIr {
                        function: global.name.clone(),
                        reason: format!("initialiser refers to unknown function #{}", function.index()),
                    });
                }
            }
        }
    }

    for annotation in module.annotations() {
        match annotation {
            Annotation::Kernel(function) => {
                if !module.function(*function).is_some_and(Function::is_defined) {
                    crate::bail!(ErrorKind::MalformedIr {
                        function: module.function_name(*function).to_owned(),
                        reason: String::from("kernel annotation on an undefined function"),
                    });
                }
            },
        }
    }

    Ok(())
}

fn verify_function(module: &Module, function: &Function) -> Result<()> {
    let Some(body) = &function.body else {
        return Ok(());
    };

    let malformed = |reason: String| ErrorKind::MalformedIr {
        function: function.name.clone(),
        reason,
    };

    if body.blocks.is_empty() {
        crate::bail!(malformed(String::from("defined function has no blocks")));
    }

    let check_operand = |operand: Operand| -> Result<()> {
        match operand {
            Operand::Value(value) if value.index() >= body.value_types.len() => Err(malformed(
                format!("use of undefined value %{}", value.index()),
            )
            .into()),
            Operand::Param(index) if index as usize >= function.sig.params.len() => Err(
                malformed(format!("use of missing parameter %arg{index}")).into(),
            ),
            Operand::Global(global) if module.global(global).is_none() => Err(malformed(
                format!("use of unknown global #{}", global.index()),
            )
            .into()),
            Operand::Function(callee) if module.function(callee).is_none() => Err(malformed(
                format!("use of unknown function #{}", callee.index()),
            )
            .into()),
            _ => Ok(()),
        }
    };

    for block in &body.blocks {
        for inst in &block.insts {
            for operand in inst.operands() {
                check_operand(operand)?;
            }

            if let Inst::Call { callee, args, .. } = inst {
                let expected = match callee {
                    Callee::Direct(callee) => match module.function(*callee) {
                        Some(callee) => Some(callee.sig.params.len()),
                        None => crate::bail!(malformed(format!(
                            "call to unknown function #{}",
                            callee.index()
                        ))),
                    },
                    Callee::Runtime(runtime) => Some(runtime.params().len()),
                    Callee::Indirect(_) => None,
                };
                if let Some(expected) = expected {
                    if expected != args.len() {
                        crate::bail!(malformed(format!(
                            "call in '{}' passes {} argument(s) where {} are expected",
                            block.label,
                            args.len(),
                            expected
                        )));
                    }
                }
            }
        }

        let Some(terminator) = &block.terminator else {
            crate::bail!(malformed(format!("block '{}' has no terminator", block.label)));
        };
        if let Terminator::CondBr { cond, .. } = terminator {
            check_operand(*cond)?;
        }
        for successor in terminator.successors() {
            if successor.index() >= body.blocks.len() {
                crate::bail!(malformed(format!(
                    "block '{}' branches to missing block #{}",
                    block.label,
                    successor.index()
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::verify_module;
    use crate::ir::{
        Callee, FunctionBuilder, FunctionKind, Linkage, Module, Operand, RuntimeFunction, Ty,
    };

    fn module_with(f: impl FnOnce(&mut FunctionBuilder)) -> Module {
        let mut module = Module::new("m", "nvptx64-nvidia-cuda");
        let callee = module
            .declare_function("callee", FunctionKind::Outlined, Linkage::Internal, vec![Ty::Ptr])
            .unwrap();
        let id = module
            .declare_function("f", FunctionKind::Kernel, Linkage::External, vec![Ty::I32])
            .unwrap();
        let mut cgf = FunctionBuilder::new(id, "f");
        cgf.call(Callee::Direct(callee), vec![Operand::Null]).unwrap();
        f(&mut cgf);
        cgf.ret().unwrap();
        module.define_function(id, cgf.finish().unwrap()).unwrap();
        module
    }

    #[test]
    fn accepts_well_formed_module() {
        let module = module_with(|cgf| {
            let x = cgf.add(Operand::Param(0), Operand::i64(1)).unwrap();
            cgf.call_runtime(RuntimeFunction::KernelInit, vec![x]).unwrap();
        });
        verify_module(&module).unwrap();
    }

    #[test]
    fn rejects_missing_parameters() {
        let module = module_with(|cgf| {
            cgf.add(Operand::Param(3), Operand::i64(1)).unwrap();
        });
        assert!(verify_module(&module).unwrap_err().is_internal());
    }

    #[test]
    fn rejects_arity_mismatch() {
        let module = module_with(|cgf| {
            let callee = crate::ir::FuncId::from_index(0);
            cgf.call(Callee::Direct(callee), Vec::new()).unwrap();
        });
        assert!(verify_module(&module).unwrap_err().is_internal());
    }
}
