use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::{self, FilterType};

use crate::error::BitmapError;
use crate::logger;
use crate::types::Bitmap;

/// Decodes reference images. `size` asks for a resampled result.
pub trait BitmapLoader: Send {
    fn load(&self, path: &str, size: Option<(u32, u32)>) -> Result<Bitmap, BitmapError>;
}

/// Reads images from disk, relative to a scenario directory.
pub struct FsBitmapLoader {
    root: PathBuf,
}

impl FsBitmapLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() { p.to_path_buf() } else { self.root.join(p) }
    }
}

impl BitmapLoader for FsBitmapLoader {
    fn load(&self, path: &str, size: Option<(u32, u32)>) -> Result<Bitmap, BitmapError> {
        let full = self.resolve(path);
        if !full.is_file() {
            return Err(BitmapError::NotFound(full));
        }
        let decoded = image::open(&full)
            .map_err(|source| BitmapError::Decode { path: full.clone(), source })?
            .to_rgba8();
        resize_to(decoded, size)
    }
}

/// Resample `bitmap` to `size` when it differs. Zero sizes are rejected.
pub fn resize_to(bitmap: Bitmap, size: Option<(u32, u32)>) -> Result<Bitmap, BitmapError> {
    let Some((width, height)) = size else { return Ok(bitmap) };
    if width == 0 || height == 0 {
        return Err(BitmapError::InvalidSize { width, height });
    }
    if bitmap.dimensions() == (width, height) {
        return Ok(bitmap);
    }
    Ok(imageops::resize(&bitmap, width, height, FilterType::Triangle))
}

/// Path plus the requested size: one reference may be cached at several sizes.
type Key = (String, Option<(u32, u32)>);

struct Entry {
    bitmap: Arc<Bitmap>,
    bytes: usize,
    last_used: u64,
}

impl Entry {
    /// The cache holds one reference; any other holder is an in-flight match.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.bitmap) > 1
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU cache of decoded reference bitmaps, bounded by decoded byte size.
///
/// Entries still referenced outside the cache are never evicted, so the cache may
/// sit above its cap until those references are dropped.
pub struct BitmapCache {
    loader: Box<dyn BitmapLoader>,
    entries: HashMap<Key, Entry>,
    capacity_bytes: usize,
    used_bytes: usize,
    clock: u64,
    stats: CacheStats,
}

impl BitmapCache {
    pub fn new(loader: Box<dyn BitmapLoader>, capacity_bytes: usize) -> Self {
        Self {
            loader,
            entries: HashMap::new(),
            capacity_bytes,
            used_bytes: 0,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Cached bitmap for `path` at `size`, loading it on a miss.
    pub fn get(&mut self, path: &str, size: Option<(u32, u32)>) -> Result<Arc<Bitmap>, BitmapError> {
        self.clock += 1;
        let now = self.clock;
        let key: Key = (path.to_string(), size);

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used = now;
            self.stats.hits += 1;
            return Ok(Arc::clone(&entry.bitmap));
        }

        self.stats.misses += 1;
        let bitmap = Arc::new(self.loader.load(path, size)?);
        let bytes = bitmap.as_raw().len();
        self.entries.insert(key.clone(), Entry { bitmap: Arc::clone(&bitmap), bytes, last_used: now });
        self.used_bytes += bytes;
        self.evict_to_fit(&key);
        Ok(bitmap)
    }

    /// Drop every size of `path` from the cache. Outstanding references stay valid.
    pub fn invalidate(&mut self, path: &str) -> bool {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|(p, _), entry| {
            let keep = p != path;
            if !keep {
                freed += entry.bytes;
            }
            keep
        });
        self.used_bytes -= freed;
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    /// True when any size of `path` is cached.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.keys().any(|(p, _)| p == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn evict_to_fit(&mut self, keep: &Key) {
        while self.used_bytes > self.capacity_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|(k, e)| *k != keep && !e.in_use())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else {
                logger::debug_p("bitmaps", &format!(
                    "cache over cap ({} > {} bytes), nothing evictable",
                    self.used_bytes, self.capacity_bytes
                ));
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.used_bytes -= entry.bytes;
                self.stats.evictions += 1;
                logger::debug_p("bitmaps", &format!("evicted {}", key.0));
            }
        }
    }
}
