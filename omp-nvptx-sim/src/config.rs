use crate::error::{Result, SimError};

/// Shape of a simulated launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    grid: u32,
    block_threads: u32,
    warp_size: u32,
    host_threads: u32,
    step_limit: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            grid: 1,
            block_threads: 64,
            warp_size: 32,
            host_threads: 4,
            step_limit: 10_000_000,
        }
    }
}

impl LaunchConfig {
    /// A one-dimensional grid of `grid` blocks of `block_threads` threads.
    pub fn new(grid: u32, block_threads: u32) -> Result<Self> {
        Self::default().set_grid(grid)?.set_block_threads(block_threads)
    }

    /// Blocks per grid, at least one.
    pub fn set_grid(mut self, grid: u32) -> Result<Self> {
        if grid == 0 {
            return Err(SimError::InvalidLaunch(String::from("the grid is empty")));
        }
        self.grid = grid;
        Ok(self)
    }

    /// Threads per block, at least one.
    pub fn set_block_threads(mut self, block_threads: u32) -> Result<Self> {
        if block_threads == 0 {
            return Err(SimError::InvalidLaunch(String::from("blocks have no threads")));
        }
        self.block_threads = block_threads;
        Ok(self)
    }

    /// Threads per warp, a power of two.
    pub fn set_warp_size(mut self, warp_size: u32) -> Result<Self> {
        if !warp_size.is_power_of_two() {
            return Err(SimError::InvalidLaunch(format!(
                "warp size {warp_size} is not a power of two"
            )));
        }
        self.warp_size = warp_size;
        Ok(self)
    }

    /// Size of the teams forked by the host runtime.
    pub fn set_host_threads(mut self, host_threads: u32) -> Result<Self> {
        if host_threads == 0 {
            return Err(SimError::InvalidLaunch(String::from("host teams have no threads")));
        }
        self.host_threads = host_threads;
        Ok(self)
    }

    /// Instructions a launch may execute over all its threads.
    #[must_use]
    pub const fn set_step_limit(mut self, step_limit: u64) -> Self {
        self.step_limit = step_limit;
        self
    }

    #[must_use]
    /// Blocks per grid.
    pub const fn grid(&self) -> u32 {
        self.grid
    }

    #[must_use]
    /// Threads per block.
    pub const fn block_threads(&self) -> u32 {
        self.block_threads
    }

    #[must_use]
    /// Threads per warp.
    pub const fn warp_size(&self) -> u32 {
        self.warp_size
    }

    #[must_use]
    /// Size of the teams forked by the host runtime.
    pub const fn host_threads(&self) -> u32 {
        self.host_threads
    }

    #[must_use]
    /// Instructions a launch may execute.
    pub const fn step_limit(&self) -> u64 {
        self.step_limit
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::LaunchConfig;
    use crate::error::SimError;

    #[test]
    fn rejects_degenerate_launches() {
        assert!(matches!(LaunchConfig::new(0, 32), Err(SimError::InvalidLaunch(_))));
        assert!(matches!(LaunchConfig::new(1, 0), Err(SimError::InvalidLaunch(_))));
        assert!(LaunchConfig::default().set_warp_size(24).is_err());

        let config = LaunchConfig::new(2, 96).unwrap();
        assert_eq!((config.grid(), config.block_threads(), config.warp_size()), (2, 96, 32));
    }
}
