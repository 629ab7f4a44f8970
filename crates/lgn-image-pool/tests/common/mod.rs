use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use lgn_image_pool::{
    backends::{CpuBackend, CpuImage},
    AllocError, Extents2D, ImageBackend, PoolImage,
};
use parking_lot::Mutex;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lgn_image_pool=trace")
        .with_test_writer()
        .try_init();
}

/// Wraps a `CpuBackend`, failing allocations on demand and counting calls.
#[derive(Default)]
pub struct ScriptedBackend {
    pub cpu: CpuBackend,
    failures: Mutex<VecDeque<bool>>,
    pub allocations: AtomicUsize,
    pub clears: AtomicUsize,
    pub reclaim_hints: AtomicUsize,
}

impl ScriptedBackend {
    /// Queue the outcome of the next allocations, `true` meaning failure.
    pub fn script(&self, outcomes: &[bool]) {
        self.failures.lock().extend(outcomes.iter().copied());
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn reclaim_hints(&self) -> usize {
        self.reclaim_hints.load(Ordering::SeqCst)
    }
}

impl ImageBackend for ScriptedBackend {
    type Image = CpuImage;

    fn allocate(&self, width: u32, height: u32) -> Result<CpuImage, AllocError> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        if self.failures.lock().pop_front().unwrap_or(false) {
            return Err(AllocError::OutOfMemory(Extents2D::new(width, height)));
        }
        self.cpu.allocate(width, height)
    }

    fn clear(&self, image: &CpuImage) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.cpu.clear(image);
    }

    fn reclaim_hint(&self) {
        self.reclaim_hints.fetch_add(1, Ordering::SeqCst);
    }
}

/// Backend whose images can be set up to get lost the next time they are
/// locked, like a GPU surface dropped while the pool was acquiring it.
#[derive(Default)]
pub struct FragileBackend {
    pub cpu: CpuBackend,
}

#[derive(Clone, Debug)]
pub struct FragileImage {
    pub image: CpuImage,
    lose_on_lock: Arc<AtomicBool>,
}

impl FragileImage {
    pub fn lose_on_next_lock(&self) {
        self.lose_on_lock.store(true, Ordering::SeqCst);
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.image.ptr_eq(&other.image)
    }
}

impl PoolImage for FragileImage {
    fn max_width(&self) -> u32 {
        self.image.max_width()
    }

    fn max_height(&self) -> u32 {
        self.image.max_height()
    }

    fn lock(&self) {
        self.image.lock();
        if self.lose_on_lock.swap(false, Ordering::SeqCst) {
            self.image.flush();
        }
    }

    fn unlock(&self) {
        self.image.unlock();
    }

    fn is_lost(&self) -> bool {
        self.image.is_lost()
    }

    fn flush(&self) {
        self.image.flush();
    }
}

impl ImageBackend for FragileBackend {
    type Image = FragileImage;

    fn allocate(&self, width: u32, height: u32) -> Result<FragileImage, AllocError> {
        Ok(FragileImage {
            image: self.cpu.allocate(width, height)?,
            lose_on_lock: Arc::default(),
        })
    }

    fn clear(&self, image: &FragileImage) {
        self.cpu.clear(&image.image);
    }
}
