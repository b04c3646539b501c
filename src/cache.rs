//! Bounded cache of decoded, normalized survey images.
//!
//! Eviction is by insertion order (FIFO): a cache hit does not refresh an
//! entry, so the image loaded first is dropped first even if it is the one
//! being read most. Access-order eviction is available as
//! [`EvictionPolicy::Lru`]; under tiling access patterns, where neighbouring
//! tiles keep touching the same few images, it reloads less.
//!
//! Load failures are cached too, so a missing or corrupt file is tried once
//! per cache lifetime.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use ndarray::Array2;
use tracing::{debug, warn};

use crate::error::{Result, SkycellError};
use crate::loader::{FileImageLoader, ImageLoader};
use crate::stretch::{self, StretchConfig};

/// Images kept by the survey tiler.
pub const DEFAULT_CAPACITY: usize = 10;

/// Why a source contributes no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoadFailure {
    pub source_id: PathBuf,
    pub reason: String,
}

impl fmt::Display for SourceLoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source_id.display(), self.reason)
    }
}

impl std::error::Error for SourceLoadFailure {}

/// A normalized image, or the reason there is none.
pub type CachedImage = std::result::Result<Arc<Array2<f32>>, SourceLoadFailure>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the earliest inserted entry; hits do not reorder.
    #[default]
    Fifo,
    /// Evict the least recently used entry.
    Lru,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of images (or recorded failures) held.
    pub capacity: usize,
    pub policy: EvictionPolicy,
    pub stretch: StretchConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            policy: EvictionPolicy::default(),
            stretch: StretchConfig::default(),
        }
    }
}

struct CacheEntry {
    image: CachedImage,
    sequence: u64,
}

pub struct ImageCache<L = FileImageLoader> {
    loader: L,
    policy: EvictionPolicy,
    stretch: StretchConfig,
    entries: LruCache<PathBuf, CacheEntry>,
    next_sequence: u64,
}

impl ImageCache<FileImageLoader> {
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_loader(config, FileImageLoader)
    }
}

impl<L: ImageLoader> ImageCache<L> {
    pub fn with_loader(config: CacheConfig, loader: L) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity)
            .ok_or_else(|| SkycellError::invalid_config("image cache capacity must be positive"))?;
        Ok(Self {
            loader,
            policy: config.policy,
            stretch: config.stretch,
            entries: LruCache::new(capacity),
            next_sequence: 0,
        })
    }

    /// Normalized image for `source_id`, loading it on a miss.
    pub fn get(&mut self, source_id: &Path) -> CachedImage {
        let hit = match self.policy {
            EvictionPolicy::Fifo => self.entries.peek(source_id),
            EvictionPolicy::Lru => self.entries.get(source_id),
        };
        if let Some(entry) = hit {
            return entry.image.clone();
        }

        let image = self.load(source_id);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let entry = CacheEntry {
            image: image.clone(),
            sequence,
        };
        if let Some((evicted, old)) = self.entries.push(source_id.to_path_buf(), entry) {
            debug!(
                evicted = %evicted.display(),
                evicted_sequence = old.sequence,
                inserted = %source_id.display(),
                "image cache eviction"
            );
        }
        image
    }

    fn load(&self, source_id: &Path) -> CachedImage {
        let failure = |err: SkycellError| {
            warn!(source = %source_id.display(), error = %err, "source image unavailable");
            SourceLoadFailure {
                source_id: source_id.to_path_buf(),
                reason: err.to_string(),
            }
        };

        let raw = self.loader.load(source_id).map_err(failure)?;
        let (height, width) = raw.dim();
        let normalized = stretch::normalize(raw, &self.stretch).ok_or_else(|| {
            failure(SkycellError::EmptyImage {
                path: source_id.to_path_buf(),
            })
        })?;
        debug!(source = %source_id.display(), width, height, "loaded source image");
        Ok(Arc::new(normalized))
    }

    pub fn contains(&self, source_id: &Path) -> bool {
        self.entries.contains(source_id)
    }

    /// Insertion sequence number of a cached entry.
    pub fn sequence_of(&self, source_id: &Path) -> Option<u64> {
        self.entries.peek(source_id).map(|e| e.sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }
}
