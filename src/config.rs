use std::path::{Path, PathBuf};

use crate::fde_cache::DEFAULT_FDE_CACHE_CAPACITY;

/// How many rows each FDE contributes to a plan table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RowGranularity {
    /// One row per FDE, taken from the first instruction context, i.e. the
    /// unwind state at function entry.
    #[default]
    FirstPerFde,
    /// One row per instruction context. Larger tables, but correct at every
    /// instruction of the function.
    AllContexts,
}

/// Settings for a [`PlanTableBuilder`](crate::PlanTableBuilder).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Maximum number of binaries kept by an [`FdeCache`](crate::FdeCache)
    /// created through [`BuilderConfig::new_fde_cache`].
    pub fde_cache_capacity: usize,
    /// The procfs mount point used to reach a process's mount namespace.
    pub proc_root: PathBuf,
    pub granularity: RowGranularity,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            fde_cache_capacity: DEFAULT_FDE_CACHE_CAPACITY,
            proc_root: PathBuf::from("/proc"),
            granularity: RowGranularity::default(),
        }
    }
}

impl BuilderConfig {
    pub fn with_fde_cache_capacity(mut self, capacity: usize) -> Self {
        self.fde_cache_capacity = capacity;
        self
    }

    pub fn with_proc_root(mut self, proc_root: impl AsRef<Path>) -> Self {
        self.proc_root = proc_root.as_ref().to_owned();
        self
    }

    pub fn with_granularity(mut self, granularity: RowGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn new_fde_cache(&self) -> crate::FdeCache {
        crate::FdeCache::new(self.fde_cache_capacity)
    }
}
