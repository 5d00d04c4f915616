//! Flat, slot-addressed device memory.
//!
//! Every allocation is a run of 64-bit slots; addresses count slots, so
//! `base + i` is slot `i` of an allocation. Function references live in a
//! separate range starting at [`FUNC_BASE`] and are never dereferenced.

use std::collections::{BTreeMap, HashMap};

/// Address of function `0`; function `i` is at `FUNC_BASE + i`.
pub const FUNC_BASE: i64 = 1 << 40;

const HEAP_BASE: i64 = 0x1000;

#[derive(Debug)]
pub struct Memory {
    cells: HashMap<i64, i64>,
    allocations: BTreeMap<i64, u32>,
    next: i64,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            cells: HashMap::new(),
            allocations: BTreeMap::new(),
            next: HEAP_BASE,
        }
    }
}

impl Memory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh zeroed allocation of `slots` slots, at least one.
    pub fn alloc(&mut self, slots: u32) -> i64 {
        let slots = slots.max(1);
        let base = self.next;
        self.allocations.insert(base, slots);
        // keep a guard slot between allocations
        self.next += i64::from(slots) + 1;
        base
    }

    #[must_use]
    pub fn is_valid(&self, address: i64) -> bool {
        self.allocations
            .range(..=address)
            .next_back()
            .is_some_and(|(base, slots)| address < base + i64::from(*slots))
    }

    #[must_use]
    pub fn load(&self, address: i64) -> Option<i64> {
        self.is_valid(address)
            .then(|| self.cells.get(&address).copied().unwrap_or_default())
    }

    #[must_use]
    pub fn store(&mut self, address: i64, value: i64) -> Option<()> {
        self.is_valid(address).then(|| {
            self.cells.insert(address, value);
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{Memory, FUNC_BASE};

    #[test]
    fn accesses_are_bounded_by_their_allocation() {
        let mut memory = Memory::new();
        let a = memory.alloc(2);
        let b = memory.alloc(1);

        assert_eq!(memory.load(a + 1), Some(0));
        memory.store(a + 1, 7).unwrap();
        assert_eq!(memory.load(a + 1), Some(7));

        assert_eq!(memory.load(a + 2), None);
        assert_eq!(memory.store(b + 1, 0), None);
        assert_eq!(memory.load(0), None);
        assert_eq!(memory.load(FUNC_BASE), None);
    }
}
