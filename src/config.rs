use crate::error::EngineError;
use crate::pool_strategy::{PoolStrategyKind, DEFAULT_NEAREST_FIT_MULTIPLE};

pub const DEFAULT_MEMORY_CACHE_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_POOL_BYTES: u64 = 32 * 1024 * 1024;

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_worker_name_prefix() -> String {
    "resource-worker".to_string()
}

#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Maximum size of the memory cache in bytes.
    #[builder(default = "DEFAULT_MEMORY_CACHE_BYTES")]
    pub memory_cache_bytes: u64,
    /// Maximum size of the block pool in bytes.
    #[builder(default = "DEFAULT_POOL_BYTES")]
    pub pool_bytes: u64,
    /// Number of production threads.
    #[builder(default = "default_worker_count()")]
    pub worker_count: usize,
    #[builder(default)]
    pub pool_strategy: PoolStrategyKind,
    /// How much larger than requested a nearest-fit block may be.
    #[builder(default = "DEFAULT_NEAREST_FIT_MULTIPLE")]
    pub nearest_fit_multiple: u64,
    #[builder(default = "default_worker_name_prefix()", setter(into))]
    pub worker_name_prefix: String,
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.worker_count == Some(0) {
            return Err("worker_count must be at least 1".to_string());
        }
        if self.nearest_fit_multiple == Some(0) {
            return Err("nearest_fit_multiple must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
            pool_bytes: DEFAULT_POOL_BYTES,
            worker_count: default_worker_count(),
            pool_strategy: Default::default(),
            nearest_fit_multiple: DEFAULT_NEAREST_FIT_MULTIPLE,
            worker_name_prefix: default_worker_name_prefix(),
        }
    }
}

impl From<EngineConfigBuilderError> for EngineError {
    fn from(e: EngineConfigBuilderError) -> EngineError {
        EngineError::Config(e.to_string())
    }
}
