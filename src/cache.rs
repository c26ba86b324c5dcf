//
// cache.rs
// Dicom-Frames-rs
//
// Byte-budgeted LRU of decoded pixel buffers with single-flight decoding per asset id.
//
// Thales Matheus Mendonça Santos - November 2025

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{RenderError, Result};
use crate::models::ImagingAsset;
use crate::pixels::{load_native_pixels, NativePixelData};

pub const DEFAULT_CACHE_BUDGET: usize = 512 * 1024 * 1024;

/// Source of decoded pixels. Swappable so callers can count or fake decodes.
pub trait PixelLoader: Send + Sync + 'static {
    fn load(&self, asset: &ImagingAsset) -> Result<NativePixelData>;
}

/// Reads pixel data from the asset's storage path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl PixelLoader for FileLoader {
    fn load(&self, asset: &ImagingAsset) -> Result<NativePixelData> {
        load_native_pixels(asset)
    }
}

type Shared = std::result::Result<Arc<NativePixelData>, Arc<RenderError>>;

/// One asset's decode. Failures are kept too, so every waiter of a failed decode gets its error.
#[derive(Default)]
struct Slot {
    cell: OnceCell<Shared>,
}

impl Slot {
    fn ready(&self) -> Option<&Arc<NativePixelData>> {
        match self.cell.get() {
            Some(Ok(data)) => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub decodes: u64,
    pub entries: usize,
    pub bytes: usize,
}

pub struct DecodeCache {
    slots: Mutex<LruCache<String, Arc<Slot>>>,
    budget_bytes: usize,
    loader: Arc<dyn PixelLoader>,
    hits: AtomicU64,
    misses: AtomicU64,
    decodes: AtomicU64,
}

impl DecodeCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self::with_loader(budget_bytes, Arc::new(FileLoader))
    }

    pub fn with_loader(budget_bytes: usize, loader: Arc<dyn PixelLoader>) -> Self {
        Self {
            slots: Mutex::new(LruCache::unbounded()),
            budget_bytes,
            loader,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            decodes: AtomicU64::new(0),
        }
    }

    fn slot(&self, asset_id: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(asset_id) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Slot::default());
        slots.put(asset_id.to_string(), Arc::clone(&slot));
        slot
    }

    /// Returns the decoded pixels of `asset`, decoding at most once across concurrent callers.
    ///
    /// The decode itself runs in a detached task that also settles the budget, so a caller that
    /// goes away mid-decode neither throws the result away nor leaves the cache over budget.
    pub async fn get_or_decode(
        self: &Arc<Self>,
        asset_id: &str,
        asset: &ImagingAsset,
    ) -> Result<Arc<NativePixelData>> {
        let slot = self.slot(asset_id);
        if let Some(data) = slot.ready() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(data));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let cache = Arc::clone(self);
        let loader = Arc::clone(&self.loader);
        let asset = asset.clone();
        let id = asset_id.to_string();
        let task = tokio::spawn(async move {
            let decoder = Arc::clone(&cache);
            let decode_id = id.clone();
            let outcome = slot
                .cell
                .get_or_init(|| async move {
                    debug!(asset_id = %decode_id, "decoding pixel data");
                    let loaded = match tokio::task::spawn_blocking(move || loader.load(&asset)).await {
                        Ok(loaded) => loaded,
                        Err(join) => Err(RenderError::from(join)),
                    };
                    match loaded {
                        Ok(data) => {
                            decoder.decodes.fetch_add(1, Ordering::Relaxed);
                            Ok(Arc::new(data))
                        }
                        Err(err) => Err(Arc::new(err)),
                    }
                })
                .await
                .clone();
            match &outcome {
                Ok(_) => cache.enforce_budget(&id, &slot),
                Err(_) => cache.forget_failed(&id, &slot),
            }
            outcome
        });

        task.await?
            .map_err(|err| Arc::try_unwrap(err).unwrap_or_else(|shared| shared.duplicate()))
    }

    /// Drops a failed slot so the next request decodes again.
    fn forget_failed(&self, asset_id: &str, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        let same = slots
            .peek(asset_id)
            .map(|current| Arc::ptr_eq(current, slot) && matches!(current.cell.get(), Some(Err(_))))
            .unwrap_or(false);
        if same {
            slots.pop(asset_id);
        }
    }

    /// Evicts least recently used decoded entries until the budget holds again.
    fn enforce_budget(&self, asset_id: &str, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        loop {
            let used: usize = slots
                .iter()
                .filter_map(|(_, s)| s.ready())
                .map(|d| d.byte_len())
                .sum();
            if used <= self.budget_bytes {
                return;
            }
            let victim = slots
                .iter()
                .rev()
                .find(|(key, s)| key.as_str() != asset_id && s.ready().is_some())
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    debug!(asset_id = %key, "evicting decoded pixels");
                    slots.pop(&key);
                }
                None => {
                    // Only the fresh entry is left and it alone exceeds the budget.
                    let fresh = slots
                        .peek(asset_id)
                        .map(|current| Arc::ptr_eq(current, slot))
                        .unwrap_or(false);
                    if fresh {
                        warn!(asset_id, budget = self.budget_bytes, "decoded pixels exceed cache budget, not retained");
                        slots.pop(asset_id);
                    }
                    return;
                }
            }
        }
    }

    pub fn invalidate(&self, asset_id: &str) {
        self.slots.lock().pop(asset_id);
    }

    pub fn contains(&self, asset_id: &str) -> bool {
        self.slots
            .lock()
            .peek(asset_id)
            .map(|s| s.ready().is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        let slots = self.slots.lock();
        let ready: Vec<_> = slots.iter().filter_map(|(_, s)| s.ready()).collect();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            decodes: self.decodes.load(Ordering::Relaxed),
            entries: ready.len(),
            bytes: ready.iter().map(|d| d.byte_len()).sum(),
        }
    }
}
