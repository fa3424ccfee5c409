//! Streaming configuration
//!
//! Parsed from a TOML document with the engine's PascalCase keys:
//!
//! ```toml
//! TextureCacheSize = 536870912   # bytes
//! ModelCacheSize = 201326592
//! TextureAsync = true
//! ModelAsync = false             # load models in place, deterministic
//!
//! # Optional tuning
//! WorkerCount = 2
//! AgingIntervalMs = 1000
//! GenerationDepth = 4
//! ProtectedGenerations = 0
//! HighWaterRatio = 1.25
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ResourceResult;
use crate::generation::MIN_GENERATION_DEPTH;

const MIB: u64 = 1024 * 1024;

/// Engine-level streaming configuration covering every resource category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StreamingConfig {
    /// Texture budget in bytes
    pub texture_cache_size: u64,
    /// Model budget in bytes
    pub model_cache_size: u64,
    /// Stream textures on background workers
    pub texture_async: bool,
    /// Stream models on background workers
    pub model_async: bool,
    /// Workers per async category
    pub worker_count: usize,
    /// Time between aging ticks
    pub aging_interval_ms: u64,
    /// Number of generations in each table
    pub generation_depth: usize,
    /// Newest generations never scanned by eviction
    pub protected_generations: usize,
    /// Over-budget ratio above which starvation is reported
    pub high_water_ratio: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            texture_cache_size: 512 * MIB,
            model_cache_size: 192 * MIB,
            texture_async: true,
            model_async: true,
            worker_count: 1,
            aging_interval_ms: 1000,
            generation_depth: 4,
            protected_generations: 0,
            high_water_ratio: 1.25,
        }
    }
}

impl StreamingConfig {
    /// Parse from a TOML string
    pub fn from_toml_str(content: &str) -> ResourceResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> ResourceResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Serialize to a TOML string with the engine keys
    pub fn to_toml_string(&self) -> ResourceResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration as a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> ResourceResult<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Settings for the texture cache
    pub fn texture_cache(&self) -> CacheConfig {
        self.category("Texture", self.texture_cache_size, self.texture_async)
    }

    /// Settings for the model cache
    pub fn model_cache(&self) -> CacheConfig {
        self.category("Model", self.model_cache_size, self.model_async)
    }

    fn category(&self, name: &str, budget_bytes: u64, async_loading: bool) -> CacheConfig {
        CacheConfig {
            name: name.to_string(),
            budget_bytes,
            async_loading,
            worker_count: self.worker_count,
            aging_interval: Duration::from_millis(self.aging_interval_ms),
            generation_depth: self.generation_depth,
            protected_generations: self.protected_generations,
            high_water_ratio: self.high_water_ratio,
        }
    }
}

/// Settings of one resource manager
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Name used for worker threads and log records
    pub name: String,
    /// Resident byte budget
    pub budget_bytes: u64,
    /// `false` runs every load and unload in place on the calling thread
    pub async_loading: bool,
    pub worker_count: usize,
    /// Time between aging ticks; zero ticks on every post-sync
    pub aging_interval: Duration,
    pub generation_depth: usize,
    pub protected_generations: usize,
    pub high_water_ratio: f64,
}

impl CacheConfig {
    /// Async cache with the given budget and default tuning
    pub fn new(name: impl Into<String>, budget_bytes: u64) -> Self {
        Self {
            name: name.into(),
            budget_bytes,
            ..Self::default()
        }
    }

    pub fn with_async(mut self, async_loading: bool) -> Self {
        self.async_loading = async_loading;
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_aging_interval(mut self, interval: Duration) -> Self {
        self.aging_interval = interval;
        self
    }

    pub fn with_generation_depth(mut self, depth: usize) -> Self {
        self.generation_depth = depth;
        self
    }

    pub fn with_protected_generations(mut self, count: usize) -> Self {
        self.protected_generations = count;
        self
    }

    /// Clamp values into their usable ranges
    pub(crate) fn normalized(mut self) -> Self {
        self.worker_count = self.worker_count.max(1);
        self.generation_depth = self.generation_depth.max(MIN_GENERATION_DEPTH);
        if !self.high_water_ratio.is_finite() || self.high_water_ratio < 1.0 {
            self.high_water_ratio = 1.0;
        }
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        StreamingConfig::default().category("Resource", 256 * MIB, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engine_keys() {
        let config = StreamingConfig::from_toml_str(
            r#"
            TextureCacheSize = 1000
            ModelCacheSize = 2000
            TextureAsync = true
            ModelAsync = false
            "#,
        )
        .unwrap();

        assert_eq!(config.texture_cache_size, 1000);
        assert_eq!(config.model_cache_size, 2000);
        assert!(config.texture_async);
        assert!(!config.model_async);
        // Unspecified keys keep their defaults
        assert_eq!(config.generation_depth, 4);

        let models = config.model_cache();
        assert_eq!(models.name, "Model");
        assert_eq!(models.budget_bytes, 2000);
        assert!(!models.async_loading);
    }

    #[test]
    fn test_tuning_keys() {
        let config = StreamingConfig::from_toml_str(
            r#"
            WorkerCount = 3
            AgingIntervalMs = 250
            GenerationDepth = 6
            "#,
        )
        .unwrap();

        let textures = config.texture_cache();
        assert_eq!(textures.worker_count, 3);
        assert_eq!(textures.aging_interval, Duration::from_millis(250));
        assert_eq!(textures.generation_depth, 6);
    }

    #[test]
    fn test_save_writes_engine_keys() {
        let path = std::env::temp_dir().join(format!("void_resource_config_{}.toml", std::process::id()));
        let config = StreamingConfig {
            model_cache_size: 4096,
            model_async: false,
            worker_count: 2,
            ..StreamingConfig::default()
        };
        config.save(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("ModelCacheSize = 4096"));
        assert!(written.contains("ModelAsync = false"));
        assert_eq!(StreamingConfig::load(&path).unwrap(), config);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(StreamingConfig::from_toml_str("TextureCacheSize = \"big\"").is_err());
    }

    #[test]
    fn test_normalized() {
        let config = CacheConfig::new("x", 10)
            .with_workers(0)
            .with_generation_depth(0)
            .normalized();
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.generation_depth, MIN_GENERATION_DEPTH);
        assert_eq!(config.high_water_ratio, 1.25);
    }
}
