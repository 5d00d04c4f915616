//! The simulated device: threads, their scheduling and barrier resolution.
//!
//! Threads run one at a time until they wait on a barrier, exit or trap.
//! Once no thread can make progress, every barrier whose participants have
//! all arrived is released. Nothing left to release means a deadlock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use omp_nvptx::ir::{AddressSpace, BlockId, Constant, FuncId, GlobalId, Module};

use crate::{
    config::LaunchConfig,
    error::{Result, SimError},
    memory::{Memory, FUNC_BASE},
    stats::{Stats, ThreadKey},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    Block,
    Numbered { id: u32, participants: i64 },
    /// `__kmpc_barrier` of a host team.
    Team(usize),
    /// A forking host thread waiting for its team.
    Join(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ThreadState {
    Running,
    Waiting(Wait),
    Exited,
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub function: FuncId,
    pub block: BlockId,
    pub inst: usize,
    pub values: Vec<i64>,
    pub params: Vec<i64>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct TeamMember {
    pub team: usize,
    pub index: u32,
}

#[derive(Debug)]
pub(crate) struct Thread {
    pub key: ThreadKey,
    pub tid: u32,
    pub block: u32,
    pub team: Option<TeamMember>,
    pub frames: Vec<Frame>,
    pub state: ThreadState,
}

#[derive(Debug)]
pub(crate) struct HostTeam {
    pub parent: usize,
    pub live: usize,
}

/// Executes the functions of one module.
#[derive(Debug)]
pub struct Machine<'m> {
    pub(crate) module: &'m Module,
    pub(crate) config: LaunchConfig,
    pub(crate) memory: Memory,
    globals: HashMap<GlobalId, i64>,
    shared: HashMap<GlobalId, i64>,
    pub(crate) threads: Vec<Thread>,
    pub(crate) teams: Vec<HostTeam>,
    pub(crate) stats: Stats,
}

impl<'m> Machine<'m> {
    /// Instantiates the global-space globals of `module` with their
    /// initializers.
    pub fn new(module: &'m Module, config: LaunchConfig) -> Result<Self> {
        let mut machine = Self {
            module,
            config,
            memory: Memory::new(),
            globals: HashMap::new(),
            shared: HashMap::new(),
            threads: Vec::new(),
            teams: Vec::new(),
            stats: Stats::default(),
        };

        for (id, global) in module.globals() {
            if global.space == AddressSpace::Global {
                let base = machine.instantiate(id)?;
                machine.globals.insert(id, base);
            }
        }

        Ok(machine)
    }

    fn instantiate(&mut self, id: GlobalId) -> Result<i64> {
        let module = self.module;
        let Some(global) = module.global(id) else {
            return Err(SimError::MalformedIr {
                function: String::from("<module>"),
                reason: format!("unknown global #{}", id.index()),
            });
        };

        let base = self.memory.alloc(global.slots);
        for (address, init) in (base..).zip(&global.init) {
            let value = match init {
                Constant::Int(value) => *value,
                Constant::Function(function) => function_address(*function),
            };
            self.write(address, value)?;
        }

        Ok(base)
    }

    /// The shape every launch of this machine uses.
    #[must_use]
    pub const fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// A zeroed buffer of `slots` slots for the kernel arguments.
    pub fn alloc(&mut self, slots: u32) -> i64 {
        self.memory.alloc(slots)
    }

    /// Reads the slot at `address`.
    pub fn read(&self, address: i64) -> Result<i64> {
        self.memory
            .load(address)
            .ok_or(SimError::InvalidHostAddress(address))
    }

    /// Reads `slots` consecutive slots starting at `address`.
    pub fn read_slice(&self, address: i64, slots: u32) -> Result<Vec<i64>> {
        (address..address + i64::from(slots))
            .map(|address| self.read(address))
            .collect()
    }

    /// Writes the slot at `address`.
    pub fn write(&mut self, address: i64, value: i64) -> Result<()> {
        self.memory
            .store(address, value)
            .ok_or(SimError::InvalidHostAddress(address))
    }

    /// Address of the global-space global `name`.
    #[must_use]
    pub fn global_address(&self, name: &str) -> Option<i64> {
        let id = self.module.global_by_name(name)?;
        self.globals.get(&id).copied()
    }

    /// The global instance of the running block or of the module.
    pub(crate) fn global_instance(&self, id: GlobalId) -> Option<i64> {
        self.shared
            .get(&id)
            .or_else(|| self.globals.get(&id))
            .copied()
    }

    /// Name and slot of the global instance containing `address`.
    pub(crate) fn global_slot(&self, address: i64) -> Option<(&'m str, i64)> {
        let module = self.module;
        self.shared
            .iter()
            .chain(&self.globals)
            .find_map(|(id, base)| {
                let global = module.global(*id)?;
                let slot = address - base;
                (0..i64::from(global.slots))
                    .contains(&slot)
                    .then_some((global.name.as_str(), slot))
            })
    }

    pub(crate) fn function_at(&self, address: i64) -> Option<FuncId> {
        let index = usize::try_from(address.checked_sub(FUNC_BASE)?).ok()?;
        self.module.functions().nth(index).map(|(id, _)| id)
    }

    fn lookup(&self, name: &str) -> Result<FuncId> {
        self.module
            .function_by_name(name)
            .filter(|id| {
                self.module
                    .function(*id)
                    .is_some_and(omp_nvptx::ir::Function::is_defined)
            })
            .ok_or_else(|| SimError::UnknownFunction(name.to_owned()))
    }

    /// Runs `kernel` on every block of the grid, one block after another.
    ///
    /// Block-shared globals are instantiated afresh for every block.
    pub fn launch(&mut self, kernel: &str, args: &[i64]) -> Result<Stats> {
        let function = self.lookup(kernel)?;
        let module = self.module;

        for block in 0..self.config.grid() {
            self.shared.clear();
            for (id, global) in module.globals() {
                if global.space == AddressSpace::Shared {
                    let base = self.instantiate(id)?;
                    self.shared.insert(id, base);
                }
            }

            self.threads.clear();
            self.teams.clear();
            for tid in 0..self.config.block_threads() {
                let index = self.spawn(ThreadKey { block, thread: tid }, tid, block, None);
                self.enter(index, function, args.to_vec())?;
            }

            tracing::debug!(kernel, block, threads = self.threads.len(), "running block");

            self.run()?;
        }

        Ok(std::mem::take(&mut self.stats))
    }

    /// Runs the host function `function` on one initial thread.
    pub fn run_host(&mut self, function: &str, args: &[i64]) -> Result<Stats> {
        let function = self.lookup(function)?;

        self.shared.clear();
        self.threads.clear();
        self.teams.clear();
        let index = self.spawn(ThreadKey { block: 0, thread: 0 }, 0, 0, None);
        self.enter(index, function, args.to_vec())?;

        self.run()?;

        Ok(std::mem::take(&mut self.stats))
    }

    pub(crate) fn spawn(
        &mut self,
        key: ThreadKey,
        tid: u32,
        block: u32,
        team: Option<TeamMember>,
    ) -> usize {
        self.threads.push(Thread {
            key,
            tid,
            block,
            team,
            frames: Vec::new(),
            state: ThreadState::Running,
        });
        self.threads.len() - 1
    }

    fn state(&self, index: usize) -> Option<ThreadState> {
        self.threads.get(index).map(|thread| thread.state)
    }

    pub(crate) fn set_state(&mut self, index: usize, state: ThreadState) {
        if let Some(thread) = self.threads.get_mut(index) {
            thread.state = state;
        }
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let mut index = 0;
            while index < self.threads.len() {
                while self.state(index) == Some(ThreadState::Running) {
                    self.step(index)?;
                }
                index += 1;
            }

            if self
                .threads
                .iter()
                .all(|thread| thread.state == ThreadState::Exited)
            {
                return Ok(());
            }

            // a joined fork call resumes its parent
            if self
                .threads
                .iter()
                .any(|thread| thread.state == ThreadState::Running)
            {
                continue;
            }

            if !self.release_barriers()? {
                return Err(SimError::Deadlock {
                    waiting: self
                        .threads
                        .iter()
                        .filter_map(|thread| match thread.state {
                            ThreadState::Waiting(wait) => Some(format!("{}: {wait:?}", thread.key)),
                            _ => None,
                        })
                        .collect(),
                });
            }
        }
    }

    fn release(&mut self, threads: &[usize], record: fn(&mut Stats, ThreadKey)) {
        for index in threads {
            if let Some(thread) = self.threads.get_mut(*index) {
                thread.state = ThreadState::Running;
                record(&mut self.stats, thread.key);
            }
        }
    }

    fn waiting_on(&self, filter: impl Fn(Wait) -> bool) -> Vec<usize> {
        self.threads
            .iter()
            .enumerate()
            .filter_map(|(index, thread)| match thread.state {
                ThreadState::Waiting(wait) if filter(wait) => Some(index),
                _ => None,
            })
            .collect()
    }

    fn release_barriers(&mut self) -> Result<bool> {
        let mut released = false;

        let live = self
            .threads
            .iter()
            .filter(|thread| thread.state != ThreadState::Exited)
            .count();
        let at_block_barrier = self.waiting_on(|wait| wait == Wait::Block);
        if live > 0 && at_block_barrier.len() == live {
            tracing::trace!(threads = live, "releasing block barrier");
            self.release(&at_block_barrier, Stats::record_block_barrier);
            released = true;
        }

        let mut named = BTreeMap::<u32, Vec<usize>>::new();
        for index in self.waiting_on(|wait| matches!(wait, Wait::Numbered { .. })) {
            if let Some(ThreadState::Waiting(Wait::Numbered { id, .. })) = self.state(index) {
                named.entry(id).or_default().push(index);
            }
        }
        for (id, threads) in named {
            if self.numbered_barrier_is_complete(id, &threads)? {
                tracing::trace!(id, threads = threads.len(), "releasing numbered barrier");
                self.release(&threads, Stats::record_numbered_barrier);
                released = true;
            }
        }

        for team in 0..self.teams.len() {
            let members = self
                .threads
                .iter()
                .enumerate()
                .filter(|(_, thread)| {
                    thread.state != ThreadState::Exited
                        && thread.team.is_some_and(|member| member.team == team)
                })
                .map(|(index, _)| index)
                .collect::<Vec<_>>();
            let all_waiting = members
                .iter()
                .all(|index| self.state(*index) == Some(ThreadState::Waiting(Wait::Team(team))));

            if !members.is_empty() && all_waiting {
                tracing::trace!(team, threads = members.len(), "releasing host team barrier");
                self.release(&members, |_, _| ());
                released = true;
            }
        }

        Ok(released)
    }

    /// A numbered barrier counts arrivals per warp: it completes once the
    /// warps with a waiting thread cover its participant count.
    fn numbered_barrier_is_complete(&self, id: u32, threads: &[usize]) -> Result<bool> {
        let mut expected = None;
        let mut warps = BTreeSet::new();

        for index in threads {
            let Some(thread) = self.threads.get(*index) else {
                continue;
            };
            if let ThreadState::Waiting(Wait::Numbered { participants, .. }) = thread.state {
                match expected {
                    Some(expected) if expected != participants => {
                        return Err(SimError::BarrierParticipantMismatch {
                            id,
                            expected,
                            found: participants,
                        });
                    },
                    _ => expected = Some(participants),
                }
                warps.insert(thread.tid / self.config.warp_size());
            }
        }

        let covered = i64::try_from(warps.len()).unwrap_or(i64::MAX)
            * i64::from(self.config.warp_size());
        Ok(expected.is_some_and(|participants| covered >= participants))
    }

    /// Marks thread `index` as exited and joins its host team.
    pub(crate) fn exit(&mut self, index: usize) {
        self.set_state(index, ThreadState::Exited);

        let Some(member) = self.threads.get(index).and_then(|thread| thread.team) else {
            return;
        };
        let Some(team) = self.teams.get_mut(member.team) else {
            return;
        };

        team.live = team.live.saturating_sub(1);
        if team.live == 0 {
            let parent = team.parent;
            self.set_state(parent, ThreadState::Running);
        }
    }
}

pub(crate) fn function_address(function: FuncId) -> i64 {
    FUNC_BASE + i64::try_from(function.index()).unwrap_or(i64::MAX - FUNC_BASE)
}
