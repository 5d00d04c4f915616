use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use omp_nvptx::ir::RuntimeFunction;

/// Identifies a simulated thread: its block and its thread id in the block.
///
/// Host threads all live in block `0`, numbered in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey {
    /// `%ctaid.x`
    pub block: u32,
    /// `%tid.x`
    pub thread: u32,
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "thread {} of block {}", self.thread, self.block)
    }
}

/// What a launch did, counted per function, thread and address.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    invocations: HashMap<String, u64>,
    block_barriers: BTreeMap<ThreadKey, u64>,
    numbered_barriers: BTreeMap<ThreadKey, u64>,
    atomics: HashMap<i64, u64>,
    global_stores: HashMap<(String, i64), u64>,
    runtime_calls: HashMap<RuntimeFunction, u64>,
    steps: u64,
}

impl Stats {
    pub(crate) fn record_invocation(&mut self, function: &str) {
        *self.invocations.entry(function.to_owned()).or_default() += 1;
    }

    pub(crate) fn record_block_barrier(&mut self, thread: ThreadKey) {
        *self.block_barriers.entry(thread).or_default() += 1;
    }

    pub(crate) fn record_numbered_barrier(&mut self, thread: ThreadKey) {
        *self.numbered_barriers.entry(thread).or_default() += 1;
    }

    pub(crate) fn record_atomic(&mut self, address: i64) {
        *self.atomics.entry(address).or_default() += 1;
    }

    pub(crate) fn record_global_store(&mut self, global: &str, slot: i64) {
        *self
            .global_stores
            .entry((global.to_owned(), slot))
            .or_default() += 1;
    }

    pub(crate) fn record_runtime_call(&mut self, function: RuntimeFunction) {
        *self.runtime_calls.entry(function).or_default() += 1;
    }

    pub(crate) fn record_step(&mut self) -> u64 {
        self.steps += 1;
        self.steps
    }

    /// How often `function` was called, by any thread.
    #[must_use]
    pub fn invocations(&self, function: &str) -> u64 {
        self.invocations.get(function).copied().unwrap_or_default()
    }

    /// Calls of every function whose name satisfies `filter`.
    pub fn invocations_where(&self, filter: impl Fn(&str) -> bool) -> u64 {
        self.invocations
            .iter()
            .filter(|(name, _)| filter(name))
            .map(|(_, count)| count)
            .sum()
    }

    /// Block barriers crossed by every thread that crossed at least one.
    #[must_use]
    pub const fn block_barriers(&self) -> &BTreeMap<ThreadKey, u64> {
        &self.block_barriers
    }

    /// Numbered barriers crossed by every thread that crossed at least one.
    #[must_use]
    pub const fn numbered_barriers(&self) -> &BTreeMap<ThreadKey, u64> {
        &self.numbered_barriers
    }

    /// Atomic updates of the slot at `address`.
    #[must_use]
    pub fn atomic_updates(&self, address: i64) -> u64 {
        self.atomics.get(&address).copied().unwrap_or_default()
    }

    /// Stores to `slot` of the global `global`, summed over its instances.
    #[must_use]
    pub fn global_stores(&self, global: &str, slot: i64) -> u64 {
        self.global_stores
            .get(&(global.to_owned(), slot))
            .copied()
            .unwrap_or_default()
    }

    /// Calls of `function` over all threads.
    #[must_use]
    pub fn runtime_calls(&self, function: RuntimeFunction) -> u64 {
        self.runtime_calls.get(&function).copied().unwrap_or_default()
    }

    /// Instructions executed over all threads.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }
}
