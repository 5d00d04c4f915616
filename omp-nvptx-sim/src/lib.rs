//! A SIMT simulator for the modules emitted by `omp-nvptx`.
//!
//! Kernels run block by block over a flat slot-addressed memory, with
//! warp-granular named barriers and block-wide `bar.sync 0`. Host fallback
//! functions run on a single initial thread that forks teams through the
//! modelled host runtime. Every launch reports what it did in [`Stats`].

mod config;
mod error;
mod interp;
mod machine;
mod memory;
mod stats;

pub use config::LaunchConfig;
pub use error::{Result, SimError};
pub use machine::Machine;
pub use memory::FUNC_BASE;
pub use stats::{Stats, ThreadKey};
