//! Immutable runtime configuration.
//!
//! The process-wide choice between single-node and distributed execution is
//! made once, at startup, and never changes afterward. [`Config`] is read
//! from the environment (or built programmatically for tests) and injected
//! into every component that needs it; nothing in the crate consults the
//! environment after construction.
//!
//! Recognized environment toggles:
//!
//! | Variable                        | Meaning                                    |
//! |---------------------------------|--------------------------------------------|
//! | `MESHFLOW_VERBOSE_LOGGING`      | per-launch dependency dumps                |
//! | `MESHFLOW_EXPERIMENTAL_SIGNALS` | enable the distributed scheduler mode      |
//! | `MESHFLOW_DEV_PTX_DUMP`        | write device-pass intermediate to stderr   |
//! | `MESHFLOW_NUM_PARTITIONS`       | controller-side fleet size (compute nodes) |

use std::env;

/// Which runtime the process runs: a single node, or the signal-graph
/// distributed controller. Fixed for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeMode {
    SingleNode,
    Distributed,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: RuntimeMode,
    /// Print per-launch dependency dumps (accessed fields, privileges,
    /// signal inputs).
    pub verbose_logging: bool,
    /// Write the lowered device form of compiled kernels to stderr.
    pub ptx_dump: bool,
    /// Compute-node count in distributed mode (control node excluded).
    pub num_partitions: usize,
    /// Device block size for tree reductions. Must be a power of two.
    pub gpu_block_size: usize,
    /// Ghost strip width per displaced axis.
    pub ghost_depth: usize,
    /// Row chunks for parallel CPU launches.
    pub cpu_partitions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::SingleNode,
            verbose_logging: false,
            ptx_dump: false,
            num_partitions: 1,
            gpu_block_size: 256,
            ghost_depth: 2,
            cpu_partitions: 2 * num_cpus::get().max(2),
        }
    }
}

impl Config {
    /// Read the configuration from the process environment. Call once at
    /// startup; the returned value is immutable.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            env::var(name)
                .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
                .unwrap_or(false)
        };
        let mut cfg = Self::default();
        cfg.verbose_logging = flag("MESHFLOW_VERBOSE_LOGGING");
        cfg.ptx_dump = flag("MESHFLOW_DEV_PTX_DUMP");
        if flag("MESHFLOW_EXPERIMENTAL_SIGNALS") {
            cfg.mode = RuntimeMode::Distributed;
        }
        if let Ok(n) = env::var("MESHFLOW_NUM_PARTITIONS")
            && let Ok(n) = n.parse::<usize>()
            && n > 0
        {
            cfg.num_partitions = n;
        }
        cfg
    }

    /// Programmatic construction for tests and embedding. Tests must not
    /// mutate the process environment.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Self::default())
    }
}

/// Fluent builder over [`Config`] defaults.
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn mode(mut self, mode: RuntimeMode) -> Self {
        self.0.mode = mode;
        self
    }

    pub fn verbose_logging(mut self, on: bool) -> Self {
        self.0.verbose_logging = on;
        self
    }

    pub fn ptx_dump(mut self, on: bool) -> Self {
        self.0.ptx_dump = on;
        self
    }

    pub fn num_partitions(mut self, n: usize) -> Self {
        self.0.num_partitions = n.max(1);
        self
    }

    /// Device block size; rounded down to a power of two, minimum 2.
    pub fn gpu_block_size(mut self, b: usize) -> Self {
        let b = b.max(2);
        self.0.gpu_block_size = 1 << (usize::BITS - 1 - b.leading_zeros());
        self
    }

    pub fn ghost_depth(mut self, d: usize) -> Self {
        self.0.ghost_depth = d.max(1);
        self
    }

    pub fn cpu_partitions(mut self, n: usize) -> Self {
        self.0.cpu_partitions = n.max(1);
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_single_node() {
        let c = Config::default();
        assert_eq!(c.mode, RuntimeMode::SingleNode);
        assert_eq!(c.gpu_block_size, 256);
        assert_eq!(c.ghost_depth, 2);
    }

    #[test]
    fn block_size_rounds_to_power_of_two() {
        let c = Config::builder().gpu_block_size(100).build();
        assert_eq!(c.gpu_block_size, 64);
        let c = Config::builder().gpu_block_size(128).build();
        assert_eq!(c.gpu_block_size, 128);
    }
}
