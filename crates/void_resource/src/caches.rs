//! Per-category caches
//!
//! Textures and models stream under independent budgets, each with its own
//! registry, generation table and workers.

use std::sync::Arc;
use std::time::Duration;

use crate::config::StreamingConfig;
use crate::error::ResourceResult;
use crate::manager::{PostSyncReport, ResourceManager};
use crate::source::ResourceSource;

/// Post-sync reports of every category
#[derive(Debug, Default)]
pub struct CachesReport {
    pub textures: PostSyncReport,
    pub models: PostSyncReport,
}

impl CachesReport {
    pub fn resident_bytes(&self) -> u64 {
        self.textures.resident_bytes + self.models.resident_bytes
    }
}

/// The engine's resource managers, one per category
#[derive(Debug)]
pub struct ResourceCaches {
    pub textures: ResourceManager,
    pub models: ResourceManager,
}

impl ResourceCaches {
    /// Build both caches reading from the same source
    pub fn new(config: &StreamingConfig, source: Arc<dyn ResourceSource>) -> ResourceResult<Self> {
        Ok(Self {
            textures: ResourceManager::new(config.texture_cache(), Arc::clone(&source))?,
            models: ResourceManager::new(config.model_cache(), source)?,
        })
    }

    /// Run the per-frame pass of every category
    pub fn perform_all_post_sync(&self, elapsed: Duration) -> CachesReport {
        CachesReport {
            textures: self.textures.perform_all_post_sync(elapsed),
            models: self.models.perform_all_post_sync(elapsed),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.textures.is_idle() && self.models.is_idle()
    }

    pub fn wait_for_idle(&self) {
        self.textures.wait_for_idle();
        self.models.wait_for_idle();
    }

    pub fn shutdown(&self) {
        self.textures.shutdown();
        self.models.shutdown();
    }
}
