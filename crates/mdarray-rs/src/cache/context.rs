use crate::tensor::DType;

use super::{CacheConfig, CacheStats, PrimitiveCache};

/// Owns one [`PrimitiveCache`] per element type.
///
/// Pass a context to whatever builds primitives instead of reaching for process-wide state;
/// independent contexts (per stream, per test) never share entries.
#[derive(Debug)]
pub struct CacheContext<P> {
    config: CacheConfig,
    f32_cache: PrimitiveCache<P>,
    i32_cache: PrimitiveCache<P>,
}

impl<P> CacheContext<P> {
    pub fn new(config: CacheConfig) -> Self {
        CacheContext {
            config,
            f32_cache: PrimitiveCache::with_config(config),
            i32_cache: PrimitiveCache::with_config(config),
        }
    }

    /// Builds a context using the policy configured in the environment.
    pub fn from_env() -> Self {
        Self::new(CacheConfig::from_env())
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Cache dedicated to primitives operating on `dtype` elements.
    pub fn cache(&self, dtype: DType) -> &PrimitiveCache<P> {
        match dtype {
            DType::F32 => &self.f32_cache,
            DType::I32 => &self.i32_cache,
        }
    }

    /// Drops every cached primitive across all element types.
    pub fn clear_all(&self) -> usize {
        DType::ALL
            .iter()
            .map(|dtype| self.cache(*dtype).clear())
            .sum()
    }

    pub fn stats(&self) -> Vec<(DType, CacheStats)> {
        DType::ALL
            .iter()
            .map(|dtype| (*dtype, self.cache(*dtype).stats()))
            .collect()
    }
}

impl<P> Default for CacheContext<P> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
