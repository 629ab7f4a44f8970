use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::info;

use crate::Extents2D;

/// Receives the pool's diagnostic events.
///
/// Every method defaults to doing nothing. Sinks are purely observational,
/// nothing they do can change what the pool hands out.
pub trait StatsSink: Send + Sync {
    /// A check-out was requested, with its quantized and adjusted extents.
    fn record_access(&self, _extents: Extents2D) {}

    /// The backend allocated a new image.
    fn record_creation(&self, _extents: Extents2D) {}

    /// Reclaimable images were flushed to make room.
    fn record_eviction(&self, _image_count: usize, _pixel_count: u64) {}

    /// A check-out failed even after eviction.
    fn record_exhaustion(&self, _extents: Extents2D) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl StatsSink for NullStats {}

/// Counting sink, share it with the pool through an `Arc`.
#[derive(Debug, Default)]
pub struct ImagePoolStats {
    effects_executed: AtomicU64,
    images_accessed: AtomicU64,
    pixels_accessed: AtomicU64,
    images_created: AtomicU64,
    pixels_created: AtomicU64,
    images_evicted: AtomicU64,
    pixels_evicted: AtomicU64,
    exhausted_requests: AtomicU64,
}

impl ImagePoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one effect pass, used to compute per-effect averages.
    pub fn record_effect(&self) {
        self.effects_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            effects_executed: self.effects_executed.load(Ordering::Relaxed),
            images_accessed: self.images_accessed.load(Ordering::Relaxed),
            pixels_accessed: self.pixels_accessed.load(Ordering::Relaxed),
            images_created: self.images_created.load(Ordering::Relaxed),
            pixels_created: self.pixels_created.load(Ordering::Relaxed),
            images_evicted: self.images_evicted.load(Ordering::Relaxed),
            pixels_evicted: self.pixels_evicted.load(Ordering::Relaxed),
            exhausted_requests: self.exhausted_requests.load(Ordering::Relaxed),
        }
    }
}

impl StatsSink for ImagePoolStats {
    fn record_access(&self, extents: Extents2D) {
        self.images_accessed.fetch_add(1, Ordering::Relaxed);
        self.pixels_accessed.fetch_add(extents.area(), Ordering::Relaxed);
    }

    fn record_creation(&self, extents: Extents2D) {
        self.images_created.fetch_add(1, Ordering::Relaxed);
        self.pixels_created.fetch_add(extents.area(), Ordering::Relaxed);
    }

    fn record_eviction(&self, image_count: usize, pixel_count: u64) {
        self.images_evicted.fetch_add(image_count as u64, Ordering::Relaxed);
        self.pixels_evicted.fetch_add(pixel_count, Ordering::Relaxed);
    }

    fn record_exhaustion(&self, _extents: Extents2D) {
        self.exhausted_requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point in time copy of [`ImagePoolStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub effects_executed: u64,
    pub images_accessed: u64,
    pub pixels_accessed: u64,
    pub images_created: u64,
    pub pixels_created: u64,
    pub images_evicted: u64,
    pub pixels_evicted: u64,
    pub exhausted_requests: u64,
}

impl StatsSnapshot {
    /// Average number of images checked out per effect, if any effect ran.
    #[allow(clippy::cast_precision_loss)]
    pub fn images_per_effect(&self) -> Option<f64> {
        (self.effects_executed != 0)
            .then(|| self.images_accessed as f64 / self.effects_executed as f64)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn pixels_per_effect(&self) -> Option<f64> {
        (self.effects_executed != 0)
            .then(|| self.pixels_accessed as f64 / self.effects_executed as f64)
    }

    /// Fraction of check-outs served from the pool rather than the backend.
    #[allow(clippy::cast_precision_loss)]
    pub fn reuse_rate(&self) -> Option<f64> {
        (self.images_accessed != 0).then(|| {
            self.images_accessed.saturating_sub(self.images_created) as f64
                / self.images_accessed as f64
        })
    }

    pub fn log_summary(&self) {
        info!("image pool statistics:\n{}", self);
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "effects executed:  {}", self.effects_executed)?;
        writeln!(f, "images created:    {}", self.images_created)?;
        writeln!(f, "pixels created:    {}", self.pixels_created)?;
        writeln!(f, "images accessed:   {}", self.images_accessed)?;
        writeln!(f, "pixels accessed:   {}", self.pixels_accessed)?;
        writeln!(f, "images evicted:    {}", self.images_evicted)?;
        write!(f, "exhausted:         {}", self.exhausted_requests)?;
        if let (Some(images), Some(pixels)) = (self.images_per_effect(), self.pixels_per_effect())
        {
            write!(f, "\nimages per effect: {:.2}", images)?;
            write!(f, "\npixels per effect: {:.2}", pixels)?;
        }
        Ok(())
    }
}
