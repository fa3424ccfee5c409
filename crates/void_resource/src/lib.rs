//! # void_resource - Budgeted Resource Streaming
//!
//! Lazy loading and eviction of engine resources under a byte budget:
//! - Per-resource state machine with soft-cancellable requests
//! - Background worker pipeline with a per-frame drain
//! - Generational LRU eviction
//! - Typed handles that touch on access
//!
//! ## Example
//!
//! ```ignore
//! use void_resource::prelude::*;
//!
//! let config = StreamingConfig::load("streaming.toml")?;
//! let caches = ResourceCaches::new(&config, Arc::new(DirectorySource::new("data")))?;
//!
//! // Registered Unloaded; the first access requests the load
//! let albedo = caches.textures.get_or_create("textures/rock.dds", Texture::default)?;
//! if let Some(texture) = albedo.get_loaded() {
//!     // draw with it
//! }
//!
//! // Once per frame
//! caches.perform_all_post_sync(frame_time);
//! ```

pub mod caches;
pub mod config;
pub mod error;
pub mod generation;
pub mod handle;
pub mod manager;
pub mod operation;
pub mod processor;
pub mod resource;
pub mod source;

/// Log target of the operation pipeline
pub const STREAM_TARGET: &str = "void_resource::stream";
/// Log target of budget and eviction decisions
pub const CACHE_TARGET: &str = "void_resource::cache";

pub use caches::{CachesReport, ResourceCaches};
pub use config::{CacheConfig, StreamingConfig};
pub use error::{LoadError, LoadResult, ResourceError, ResourceResult};
pub use generation::GenerationTable;
pub use handle::{HandleFlags, ResourceHandle};
pub use manager::{PostSyncReport, ResourceManager, StreamStats};
pub use operation::{OperationKind, OperationOutcome, OperationReport, ResourceOperation};
pub use processor::AsyncProcessor;
pub use resource::{Resource, ResourceCore, ResourceKey, ResourceState, Tracking};
pub use source::{DirectorySource, LoadContext, MemorySource, ResourceSource};

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::caches::ResourceCaches;
    pub use crate::config::{CacheConfig, StreamingConfig};
    pub use crate::error::{LoadError, LoadResult, ResourceError, ResourceResult};
    pub use crate::handle::{HandleFlags, ResourceHandle};
    pub use crate::manager::{ResourceManager, StreamStats};
    pub use crate::resource::{Resource, ResourceState};
    pub use crate::source::{DirectorySource, LoadContext, MemorySource, ResourceSource};
}
