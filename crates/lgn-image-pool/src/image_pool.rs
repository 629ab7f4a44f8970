use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, instrument, trace, warn};

use crate::{
    Extents2D, ImageBackend, ImagePoolConfig, NullStats, PoolError, PoolImage, Result, StatsSink,
};

new_key_type! {
    /// Generational key of an image tracked by an [`ImagePool`].
    pub struct ImageKey;
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Reclaimable,
    InUse,
    Quarantined,
}

struct Slot<I> {
    image: I,
    state: SlotState,
    // bumped on every check-out, stale copies of a `PooledImage` no longer match
    lease: u64,
}

type Slots<I> = SlotMap<ImageKey, Slot<I>>;

/// An image checked out of an [`ImagePool`]. Hand it back with
/// [`ImagePool::check_in`] once the pass that rendered into it is done.
#[derive(Clone)]
pub struct PooledImage<I> {
    pool_id: u64,
    key: ImageKey,
    lease: u64,
    image: I,
}

impl<I> PooledImage<I> {
    pub fn key(&self) -> ImageKey {
        self.key
    }

    pub fn image(&self) -> &I {
        &self.image
    }
}

impl<I> Deref for PooledImage<I> {
    type Target = I;

    fn deref(&self) -> &Self::Target {
        &self.image
    }
}

impl<I: std::fmt::Debug> std::fmt::Debug for PooledImage<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledImage")
            .field("key", &self.key)
            .field("image", &self.image)
            .finish()
    }
}

/// Number of tracked images per state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolOccupancy {
    pub reclaimable: usize,
    pub in_use: usize,
    pub quarantined: usize,
    pub reclaimable_pixels: u64,
    pub total_pixels: u64,
}

impl PoolOccupancy {
    pub fn total(&self) -> usize {
        self.reclaimable + self.in_use + self.quarantined
    }
}

struct Inner<B: ImageBackend> {
    id: u64,
    backend: B,
    config: ImagePoolConfig,
    stats: Arc<dyn StatsSink>,
    slots: Mutex<Slots<B::Image>>,
}

/// Recycles scratch images between effect passes.
///
/// Every operation runs under a single pool-wide lock, so the pool can be
/// cloned and shared with the render workers.
pub struct ImagePool<B: ImageBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: ImageBackend> Clone for ImagePool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: ImageBackend> ImagePool<B> {
    pub fn new(backend: B, config: ImagePoolConfig) -> Result<Self> {
        Self::with_stats(backend, config, Arc::new(NullStats))
    }

    pub fn with_stats(
        backend: B,
        config: ImagePoolConfig,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                backend,
                config,
                stats,
                slots: Mutex::new(SlotMap::with_key()),
            }),
        })
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn config(&self) -> &ImagePoolConfig {
        &self.inner.config
    }

    /// Size actually requested from the pool for a `width` x `height` check-out:
    /// empty requests become 1x1, then each axis is rounded up to the quantum
    /// and adjusted by the backend.
    pub fn request_extents(&self, width: u32, height: u32) -> Extents2D {
        let (width, height) = if width == 0 || height == 0 {
            (1, 1)
        } else {
            (width, height)
        };
        let config = &self.inner.config;
        let backend = &self.inner.backend;
        Extents2D::new(
            backend.compatible_width(config.quantize(width)),
            backend.compatible_height(config.quantize(height)),
        )
    }

    /// Returns a cleared image at least `width` x `height` big, reusing a
    /// reclaimable one when one fits without wasting too much memory.
    ///
    /// When the backend runs out of memory, every reclaimable image is flushed
    /// and the allocation is retried once. If that fails too,
    /// [`PoolError::AllocationExhausted`] is returned and the caller should
    /// skip the work that needed the image.
    #[instrument(skip(self), level = "trace")]
    pub fn check_out(&self, width: u32, height: u32) -> Result<PooledImage<B::Image>> {
        let requested = self.request_extents(width, height);
        self.inner.stats.record_access(requested);

        let mut slots = self.inner.slots.lock();

        if let Some(key) = self.find_best_fit(&mut slots, requested) {
            let slot = &mut slots[key];
            slot.state = SlotState::InUse;
            slot.lease += 1;
            self.inner.backend.clear(&slot.image);
            trace!("reusing {} image for {} request", slot.image.extents(), requested);
            return Ok(self.pooled(key, slot));
        }

        Self::prune_lost_in_use(&mut slots);

        let image = match self.inner.backend.allocate(requested.width, requested.height) {
            Ok(image) => image,
            Err(err) => {
                warn!(
                    "failed to allocate a {} image ({}), evicting reclaimable images",
                    requested, err
                );
                self.evict_locked(&mut slots);
                self.inner
                    .backend
                    .allocate(requested.width, requested.height)
                    .map_err(|source| {
                        warn!("no image available for {} request: {}", requested, source);
                        self.inner.stats.record_exhaustion(requested);
                        PoolError::AllocationExhausted {
                            extents: requested,
                            source,
                        }
                    })?
            }
        };

        self.inner.stats.record_creation(requested);
        let key = slots.insert(Slot {
            image,
            state: SlotState::InUse,
            lease: 0,
        });
        debug!("created {} image, {} images tracked", requested, slots.len());

        Ok(self.pooled(key, &slots[key]))
    }

    /// Hands an image back. Images that are not checked out from this pool,
    /// including ones already checked in and stale copies of an image that
    /// was checked out again since, are ignored.
    pub fn check_in(&self, image: PooledImage<B::Image>) {
        if image.pool_id != self.inner.id {
            debug!("ignoring check-in of an image owned by another pool");
            return;
        }

        let mut slots = self.inner.slots.lock();
        match slots.get_mut(image.key) {
            Some(slot) if slot.state == SlotState::InUse && slot.lease == image.lease => {
                slot.image.unlock();
                slot.state = if self.inner.config.use_quarantine {
                    SlotState::Quarantined
                } else {
                    SlotState::Reclaimable
                };
            }
            _ => trace!("ignoring check-in of an untracked image"),
        }
    }

    /// Makes quarantined images reusable. Call once per frame, after the
    /// frame was presented.
    pub fn release_quarantine(&self) {
        if !self.inner.config.use_quarantine {
            return;
        }

        let mut slots = self.inner.slots.lock();
        let mut released = 0;
        for slot in slots
            .values_mut()
            .filter(|slot| slot.state == SlotState::Quarantined)
        {
            slot.state = SlotState::Reclaimable;
            released += 1;
        }
        if released > 0 {
            trace!("released {} images from quarantine", released);
        }
    }

    /// Flushes every reclaimable image, returns how many were released.
    /// Checked out and quarantined images are left alone.
    #[instrument(skip(self))]
    pub fn evict_reclaimable(&self) -> usize {
        let mut slots = self.inner.slots.lock();
        self.evict_locked(&mut slots)
    }

    /// Flushes reclaimable images and forgets everything else. Images still
    /// checked out stay valid, their owners remain responsible for them.
    #[instrument(skip(self))]
    pub fn dispose(&self) {
        let mut slots = self.inner.slots.lock();
        for slot in slots
            .values()
            .filter(|slot| slot.state == SlotState::Reclaimable)
        {
            slot.image.flush();
        }
        debug!("disposing image pool, dropping {} entries", slots.len());
        slots.clear();
    }

    pub fn occupancy(&self) -> PoolOccupancy {
        let slots = self.inner.slots.lock();
        let mut occupancy = PoolOccupancy::default();
        for slot in slots.values() {
            let pixels = slot.image.extents().area();
            occupancy.total_pixels += pixels;
            match slot.state {
                SlotState::Reclaimable => {
                    occupancy.reclaimable += 1;
                    occupancy.reclaimable_pixels += pixels;
                }
                SlotState::InUse => occupancy.in_use += 1,
                SlotState::Quarantined => occupancy.quarantined += 1,
            }
        }
        occupancy
    }

    fn pooled(&self, key: ImageKey, slot: &Slot<B::Image>) -> PooledImage<B::Image> {
        PooledImage {
            pool_id: self.inner.id,
            key,
            lease: slot.lease,
            image: slot.image.clone(),
        }
    }

    /// Picks the reclaimable image minimizing `(w' - w) * (h' - h)` among
    /// those that hold the request and stay under the area ratio. The chosen
    /// image is returned locked. Lost images met on the way are dropped.
    #[allow(clippy::cast_precision_loss)]
    fn find_best_fit(&self, slots: &mut Slots<B::Image>, requested: Extents2D) -> Option<ImageKey> {
        let max_area = self.inner.config.max_area_ratio * requested.area() as f64;
        let mut chosen: Option<(ImageKey, u64)> = None;
        let mut lost = Vec::new();

        for (key, slot) in slots
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Reclaimable)
        {
            let image = &slot.image;
            if image.is_lost() {
                lost.push(key);
                continue;
            }

            let extents = image.extents();
            if !extents.contains(requested) || extents.area() as f64 > max_area {
                continue;
            }

            let diff = u64::from(extents.width - requested.width)
                * u64::from(extents.height - requested.height);
            if chosen.map_or(true, |(_, best)| diff < best) {
                image.lock();
                if image.is_lost() {
                    image.unlock();
                    lost.push(key);
                    continue;
                }
                if let Some((previous, _)) = chosen {
                    slots[previous].image.unlock();
                }
                chosen = Some((key, diff));
            }
        }

        for key in lost {
            if let Some(slot) = slots.remove(key) {
                debug!("dropped lost {} image", slot.image.extents());
            }
        }

        chosen.map(|(key, _)| key)
    }

    fn prune_lost_in_use(slots: &mut Slots<B::Image>) {
        slots.retain(|_, slot| slot.state != SlotState::InUse || !slot.image.is_lost());
    }

    fn evict_locked(&self, slots: &mut Slots<B::Image>) -> usize {
        let mut image_count = 0;
        let mut pixel_count = 0;
        slots.retain(|_, slot| {
            if slot.state != SlotState::Reclaimable {
                return true;
            }
            slot.image.flush();
            image_count += 1;
            pixel_count += slot.image.extents().area();
            false
        });

        self.inner.backend.reclaim_hint();
        self.inner.stats.record_eviction(image_count, pixel_count);
        debug!("evicted {} images ({} pixels)", image_count, pixel_count);
        image_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::{CpuBackend, CpuBackendConfig},
        ImagePoolStats,
    };

    fn exact_pool(max_area_ratio: f64) -> ImagePool<CpuBackend> {
        ImagePool::new(
            CpuBackend::default(),
            ImagePoolConfig {
                quantum: 1,
                max_area_ratio,
                use_quarantine: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_request_extents() {
        let pool = ImagePool::new(CpuBackend::default(), ImagePoolConfig::default()).unwrap();
        assert_eq!(pool.request_extents(0, 10), Extents2D::new(32, 32));
        assert_eq!(pool.request_extents(10, 0), Extents2D::new(32, 32));
        assert_eq!(pool.request_extents(33, 100), Extents2D::new(64, 128));

        let pool = ImagePool::new(
            CpuBackend::new(CpuBackendConfig {
                pow2_textures: true,
                ..CpuBackendConfig::default()
            }),
            ImagePoolConfig::default(),
        )
        .unwrap();
        assert_eq!(pool.request_extents(65, 100), Extents2D::new(128, 128));
    }

    #[test]
    fn test_best_fit_prefers_tightest_image() {
        let pool = exact_pool(4.0);
        let large = pool.check_out(100, 100).unwrap();
        let small = pool.check_out(60, 60).unwrap();
        let large_image = large.image().clone();
        pool.check_in(large);
        pool.check_in(small.clone());

        let chosen = pool.check_out(50, 50).unwrap();

        assert!(chosen.ptr_eq(&small));
        assert_eq!(chosen.lock_count(), 1);
        assert_eq!(large_image.lock_count(), 0);
    }

    #[test]
    fn test_two_axis_waste_metric() {
        // wide wastes less area (7000 vs 7100) but is lopsided
        let pool = exact_pool(4.0);
        let wide = pool.check_out(200, 60).unwrap();
        let square = pool.check_out(110, 110).unwrap();
        pool.check_in(wide.clone());
        pool.check_in(square.clone());

        // wide: (200-100) * (60-50) = 1000, square: (110-100) * (110-50) = 600
        let chosen = pool.check_out(100, 50).unwrap();
        assert!(chosen.ptr_eq(&square));
    }

    #[test]
    fn test_oversized_image_is_not_reused() {
        let pool = ImagePool::new(CpuBackend::default(), ImagePoolConfig::default()).unwrap();
        let huge = pool.check_out(1000, 1000).unwrap();
        pool.check_in(huge.clone());

        let image = pool.check_out(50, 50).unwrap();

        assert!(!image.ptr_eq(&huge));
        assert_eq!(image.extents(), Extents2D::new(64, 64));
        let occupancy = pool.occupancy();
        assert_eq!(occupancy.reclaimable, 1);
        assert_eq!(occupancy.in_use, 1);
    }

    #[test]
    fn test_lost_images_are_never_returned() {
        let pool = ImagePool::new(CpuBackend::default(), ImagePoolConfig::default()).unwrap();
        let first = pool.check_out(32, 32).unwrap();
        pool.check_in(first.clone());

        pool.backend().device_reset();
        let second = pool.check_out(32, 32).unwrap();

        assert!(!second.ptr_eq(&first));
        assert!(!second.is_lost());
        assert_eq!(pool.occupancy().total(), 1);
    }

    #[test]
    fn test_lost_in_use_images_are_forgotten() {
        let pool = ImagePool::new(CpuBackend::default(), ImagePoolConfig::default()).unwrap();
        let first = pool.check_out(32, 32).unwrap();
        pool.backend().device_reset();

        let _second = pool.check_out(32, 32).unwrap();
        assert_eq!(pool.occupancy().in_use, 1);

        pool.check_in(first);
        assert_eq!(pool.occupancy().reclaimable, 0);
    }

    #[test]
    fn test_eviction_on_allocation_failure() {
        let stats = Arc::new(ImagePoolStats::new());
        let pool = ImagePool::with_stats(
            CpuBackend::new(CpuBackendConfig {
                pixel_budget: Some(3 * 32 * 32),
                ..CpuBackendConfig::default()
            }),
            ImagePoolConfig::default(),
            stats.clone(),
        )
        .unwrap();

        let a = pool.check_out(32, 32).unwrap();
        let b = pool.check_out(32, 32).unwrap();
        pool.check_in(b.clone());

        // b cannot hold 64x32, and there is no room for a new one next to it
        let c = pool.check_out(64, 32).unwrap();
        assert!(b.is_lost());
        assert!(!a.is_lost());
        assert_eq!(c.extents(), Extents2D::new(64, 32));
        assert_eq!(stats.snapshot().images_evicted, 1);

        let err = pool.check_out(32, 32).unwrap_err();
        assert!(matches!(
            err,
            PoolError::AllocationExhausted { extents, .. } if extents == Extents2D::new(32, 32)
        ));
        assert_eq!(stats.snapshot().exhausted_requests, 1);

        // nothing was lost from the in-use side
        let occupancy = pool.occupancy();
        assert_eq!(occupancy.in_use, 2);
        assert_eq!(occupancy.reclaimable, 0);
    }

    #[test]
    fn test_quarantine() {
        let pool = ImagePool::new(
            CpuBackend::default(),
            ImagePoolConfig {
                use_quarantine: true,
                ..ImagePoolConfig::default()
            },
        )
        .unwrap();

        let first = pool.check_out(32, 32).unwrap();
        pool.check_in(first.clone());
        assert_eq!(pool.occupancy().quarantined, 1);

        let second = pool.check_out(32, 32).unwrap();
        assert!(!second.ptr_eq(&first));

        pool.release_quarantine();
        assert_eq!(pool.occupancy().quarantined, 0);
        let third = pool.check_out(32, 32).unwrap();
        assert!(third.ptr_eq(&first));
    }

    #[test]
    fn test_eviction_skips_quarantine() {
        let pool = ImagePool::new(
            CpuBackend::default(),
            ImagePoolConfig {
                use_quarantine: true,
                ..ImagePoolConfig::default()
            },
        )
        .unwrap();
        let image = pool.check_out(32, 32).unwrap();
        pool.check_in(image.clone());

        assert_eq!(pool.evict_reclaimable(), 0);
        assert!(!image.is_lost());

        pool.release_quarantine();
        assert_eq!(pool.evict_reclaimable(), 1);
        assert!(image.is_lost());
    }

    #[test]
    fn test_invalid_config() {
        let result = ImagePool::new(
            CpuBackend::default(),
            ImagePoolConfig {
                quantum: 0,
                ..ImagePoolConfig::default()
            },
        );
        assert!(matches!(result, Err(PoolError::Config(_))));
    }
}
