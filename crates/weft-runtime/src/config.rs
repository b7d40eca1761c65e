//! Runtime configuration: compile-time defaults with environment
//! overrides.

use weft_core::env::env_get;

/// Default usable stack size per fiber.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Configuration for an [`EventLoop`](crate::EventLoop) and its offload
/// pool.
///
/// Start from [`LoopConfig::from_env`] and override programmatically:
///
/// ```ignore
/// let config = LoopConfig::from_env().default_stack_size(1 << 20);
/// ```
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Usable stack bytes given to fibers spawned with no size hint.
    pub default_stack_size: usize,
    /// Worker threads for the offload pool; 0 selects the hardware
    /// parallelism.
    pub pool_threads: usize,
}

impl LoopConfig {
    /// Defaults with environment overrides applied:
    /// - `WEFT_STACK_SIZE` — default fiber stack size in bytes
    /// - `WEFT_POOL_THREADS` — offload pool worker count
    pub fn from_env() -> Self {
        Self {
            default_stack_size: env_get("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE),
            pool_threads: env_get("WEFT_POOL_THREADS", 0),
        }
    }

    pub fn default_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    pub fn pool_threads(mut self, count: usize) -> Self {
        self.pool_threads = count;
        self
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = LoopConfig::from_env()
            .default_stack_size(1 << 20)
            .pool_threads(2);
        assert_eq!(config.default_stack_size, 1 << 20);
        assert_eq!(config.pool_threads, 2);
    }
}
