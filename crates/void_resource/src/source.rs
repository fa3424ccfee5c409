//! Resource Sources - Byte streams behind resource keys
//!
//! A source maps a resource's hash string to its raw bytes. The manager
//! hands the source to every load through a [`LoadContext`], so resources
//! never hold a pointer back to the manager.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{LoadError, LoadResult};

/// Provider of raw resource bytes keyed by hash string
pub trait ResourceSource: Send + Sync {
    /// Read the full byte stream for a key
    fn read(&self, key: &str) -> LoadResult<Vec<u8>>;

    /// Check whether the key can be read
    fn exists(&self, key: &str) -> bool;
}

/// Source rooted at a directory on disk
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Create a source that resolves keys relative to `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> PathBuf {
        let path = Path::new(key);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl ResourceSource for DirectorySource {
    fn read(&self, key: &str) -> LoadResult<Vec<u8>> {
        let path = self.resolve(key);
        std::fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LoadError::NotFound(path.display().to_string()),
            _ => LoadError::Io(e),
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.resolve(key).is_file()
    }
}

/// In-memory source, mutable at runtime
#[derive(Debug, Default)]
pub struct MemorySource {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the bytes for a key
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.entries.write().insert(key.into(), data.into());
    }

    /// Remove a key, returning its bytes
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ResourceSource for MemorySource {
    fn read(&self, key: &str) -> LoadResult<Vec<u8>> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(key.to_string()))
    }

    fn exists(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

/// Context provided to a resource while it loads
pub struct LoadContext<'a> {
    key: &'a str,
    source: &'a dyn ResourceSource,
}

impl<'a> LoadContext<'a> {
    /// Create a new load context
    pub fn new(key: &'a str, source: &'a dyn ResourceSource) -> Self {
        Self { key, source }
    }

    /// Hash string of the resource being loaded
    pub fn key(&self) -> &str {
        self.key
    }

    /// File extension of the key, if any
    pub fn extension(&self) -> Option<&str> {
        Path::new(self.key).extension().and_then(|e| e.to_str())
    }

    /// The storage source
    pub fn source(&self) -> &dyn ResourceSource {
        self.source
    }

    /// Read this resource's bytes
    pub fn read_bytes(&self) -> LoadResult<Vec<u8>> {
        self.source.read(self.key)
    }

    /// Read this resource's bytes as UTF-8
    pub fn read_string(&self) -> LoadResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| LoadError::Decode(format!("Invalid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new();
        source.insert("a.txt", b"hello".to_vec());

        assert!(source.exists("a.txt"));
        assert_eq!(source.read("a.txt").unwrap(), b"hello");
        assert!(matches!(source.read("b.txt"), Err(LoadError::NotFound(_))));

        source.remove("a.txt");
        assert!(source.is_empty());
    }

    #[test]
    fn test_directory_source_missing_file() {
        let dir = std::env::temp_dir().join("void_resource_missing_dir_test");
        let source = DirectorySource::new(&dir);

        assert!(!source.exists("nope.bin"));
        assert!(matches!(source.read("nope.bin"), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn test_directory_source_reads_file() {
        let dir = std::env::temp_dir().join(format!("void_resource_src_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tex.bin"), [1u8, 2, 3]).unwrap();

        let source = DirectorySource::new(&dir);
        assert!(source.exists("tex.bin"));
        assert_eq!(source.read("tex.bin").unwrap(), vec![1, 2, 3]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_context() {
        let source = MemorySource::new();
        source.insert("shaders/basic.wgsl", "fn main() {}");

        let ctx = LoadContext::new("shaders/basic.wgsl", &source);
        assert_eq!(ctx.key(), "shaders/basic.wgsl");
        assert_eq!(ctx.extension(), Some("wgsl"));
        assert_eq!(ctx.read_string().unwrap(), "fn main() {}");
    }
}
