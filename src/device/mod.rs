//! Device-side building blocks: the NVPTX hardware surface, the barrier
//! primitives and the derivation of OpenMP identities from hardware ones.

pub mod nvptx;
pub mod sync;
pub mod thread;
