use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::{AllocError, Extents2D, ImageBackend, PoolImage};

/// Used to create a [`CpuBackend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackendConfig {
    /// Round allocation sizes up to the next power of two.
    pub pow2_textures: bool,
    /// Maximum number of live pixels, `None` for no limit.
    pub pixel_budget: Option<u64>,
}

struct Budget {
    live_pixels: AtomicU64,
    device_generation: AtomicU64,
}

/// Software backend storing images as `u32` pixel buffers.
#[derive(Clone)]
pub struct CpuBackend {
    config: CpuBackendConfig,
    budget: Arc<Budget>,
    next_id: Arc<AtomicU64>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(CpuBackendConfig::default())
    }
}

impl CpuBackend {
    pub fn new(config: CpuBackendConfig) -> Self {
        Self {
            config,
            budget: Arc::new(Budget {
                live_pixels: AtomicU64::new(0),
                device_generation: AtomicU64::new(0),
            }),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Pixels held by images that have not been flushed.
    pub fn live_pixels(&self) -> u64 {
        self.budget.live_pixels.load(Ordering::Acquire)
    }

    /// Invalidates every image created so far, the way a GPU device reset
    /// would.
    pub fn device_reset(&self) {
        let generation = self.budget.device_generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("cpu backend reset, device generation {}", generation);
    }

    fn reserve(&self, pixels: u64) -> bool {
        let limit = self.config.pixel_budget.unwrap_or(u64::MAX);
        self.budget
            .live_pixels
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_add(pixels).filter(|total| *total <= limit)
            })
            .is_ok()
    }

    fn unreserve(&self, pixels: u64) {
        self.budget.live_pixels.fetch_sub(pixels, Ordering::AcqRel);
    }
}

impl ImageBackend for CpuBackend {
    type Image = CpuImage;

    fn allocate(&self, width: u32, height: u32) -> Result<CpuImage, AllocError> {
        let extents = Extents2D::new(width, height);
        let pixel_count = extents.area();
        let len = usize::try_from(pixel_count).map_err(|_| AllocError::OutOfMemory(extents))?;
        if !self.reserve(pixel_count) {
            return Err(AllocError::OutOfMemory(extents));
        }

        let mut pixels = Vec::new();
        if let Err(err) = pixels.try_reserve_exact(len) {
            self.unreserve(pixel_count);
            debug!("cpu image allocation of {} failed: {}", extents, err);
            return Err(AllocError::OutOfMemory(extents));
        }
        pixels.resize(len, 0);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!("cpu image {} allocated ({})", id, extents);

        Ok(CpuImage {
            inner: Arc::new(CpuImageInner {
                id,
                extents,
                pixels: Mutex::new(Some(pixels)),
                lock_count: AtomicU32::new(1),
                flushed: AtomicBool::new(false),
                generation: self.budget.device_generation.load(Ordering::Acquire),
                budget: self.budget.clone(),
            }),
        })
    }

    fn clear(&self, image: &CpuImage) {
        if let Some(pixels) = image.inner.pixels.lock().as_mut() {
            pixels.fill(0);
        }
    }

    fn compatible_width(&self, width: u32) -> u32 {
        if self.config.pow2_textures {
            width.checked_next_power_of_two().unwrap_or(width)
        } else {
            width
        }
    }

    fn compatible_height(&self, height: u32) -> u32 {
        if self.config.pow2_textures {
            height.checked_next_power_of_two().unwrap_or(height)
        } else {
            height
        }
    }
}

struct CpuImageInner {
    id: u64,
    extents: Extents2D,
    pixels: Mutex<Option<Vec<u32>>>,
    lock_count: AtomicU32,
    flushed: AtomicBool,
    generation: u64,
    budget: Arc<Budget>,
}

impl CpuImageInner {
    fn release(&self) {
        if self.pixels.lock().take().is_some() {
            self.budget
                .live_pixels
                .fetch_sub(self.extents.area(), Ordering::AcqRel);
        }
    }
}

impl Drop for CpuImageInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Image produced by a [`CpuBackend`]. Clones share the same storage.
#[derive(Clone)]
pub struct CpuImage {
    inner: Arc<CpuImageInner>,
}

impl CpuImage {
    /// Unique per backend, stable across clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn lock_count(&self) -> u32 {
        self.inner.lock_count.load(Ordering::Acquire)
    }

    /// Access to the pixel storage, `None` once the image was flushed.
    pub fn pixels(&self) -> MutexGuard<'_, Option<Vec<u32>>> {
        self.inner.pixels.lock()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuImage")
            .field("id", &self.inner.id)
            .field("extents", &self.inner.extents)
            .field("lock_count", &self.lock_count())
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl PoolImage for CpuImage {
    fn max_width(&self) -> u32 {
        self.inner.extents.width
    }

    fn max_height(&self) -> u32 {
        self.inner.extents.height
    }

    fn lock(&self) {
        self.inner.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock(&self) {
        let _ = self
            .inner
            .lock_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
    }

    fn is_lost(&self) -> bool {
        self.inner.flushed.load(Ordering::Acquire)
            || self.inner.generation != self.inner.budget.device_generation.load(Ordering::Acquire)
    }

    fn flush(&self) {
        self.inner.flushed.store(true, Ordering::Release);
        self.inner.release();
    }
}
