use std::fmt;

use crate::ir::Ty;

/// Entry points of the OpenMP runtime libraries that generated code calls.
///
/// The libraries themselves are external; only their symbol names and
/// signatures are fixed here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeFunction {
    /// `void __kmpc_kernel_init(i32 thread_limit)`
    KernelInit,
    /// `void __kmpc_kernel_deinit()`
    KernelDeinit,
    /// `void __kmpc_fork_call(ptr outlined, ptr context)`
    ForkCall,
    /// `void __kmpc_serialized_parallel(i32 gtid)`
    SerializedParallel,
    /// `void __kmpc_end_serialized_parallel(i32 gtid)`
    EndSerializedParallel,
    /// `void __kmpc_barrier(i32 gtid)`
    Barrier,
    /// `i32 __kmpc_global_thread_num()`
    GlobalThreadNum,
    /// `i32 omp_get_max_threads()`
    MaxThreads,
}

impl RuntimeFunction {
    /// The linker-visible name.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::KernelInit => "__kmpc_kernel_init",
            Self::KernelDeinit => "__kmpc_kernel_deinit",
            Self::ForkCall => "__kmpc_fork_call",
            Self::SerializedParallel => "__kmpc_serialized_parallel",
            Self::EndSerializedParallel => "__kmpc_end_serialized_parallel",
            Self::Barrier => "__kmpc_barrier",
            Self::GlobalThreadNum => "__kmpc_global_thread_num",
            Self::MaxThreads => "omp_get_max_threads",
        }
    }

    #[must_use]
    /// Parameter types, in call order.
    pub const fn params(self) -> &'static [Ty] {
        match self {
            Self::KernelInit
            | Self::SerializedParallel
            | Self::EndSerializedParallel
            | Self::Barrier => &[Ty::I32],
            Self::ForkCall => &[Ty::Ptr, Ty::Ptr],
            Self::KernelDeinit | Self::GlobalThreadNum | Self::MaxThreads => &[],
        }
    }

    #[must_use]
    /// Return type, [`Ty::Void`] for procedures.
    pub const fn ret(self) -> Ty {
        match self {
            Self::GlobalThreadNum | Self::MaxThreads => Ty::I32,
            _ => Ty::Void,
        }
    }
}

impl fmt::Display for RuntimeFunction {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.symbol())
    }
}
