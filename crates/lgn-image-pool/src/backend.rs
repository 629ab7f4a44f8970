use std::fmt;

use serde::{Deserialize, Serialize};

use crate::AllocError;

/// Width and height of an image, in pixels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extents2D {
    pub width: u32,
    pub height: u32,
}

impl Extents2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// True if an image of these extents can hold `other`.
    pub fn contains(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl fmt::Display for Extents2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Capability surface the pool needs from an image.
///
/// Implementations are expected to be cheap handles (usually `Arc` backed):
/// the pool keeps one clone for tracking and hands another one to the caller.
pub trait PoolImage: Clone + Send + Sync {
    /// Allocated width. Fixed for the lifetime of the image.
    fn max_width(&self) -> u32;

    /// Allocated height. Fixed for the lifetime of the image.
    fn max_height(&self) -> u32;

    fn extents(&self) -> Extents2D {
        Extents2D::new(self.max_width(), self.max_height())
    }

    /// Marks the image as referenced. Backends use this to detect an image
    /// being reused while still in flight.
    fn lock(&self);

    fn unlock(&self);

    /// True once the backend invalidated the underlying storage, for example
    /// after a device reset. A lost image is never handed out again.
    fn is_lost(&self) -> bool;

    /// Releases the native storage right away.
    fn flush(&self);
}

/// The renderer side of the pool: creates, clears and sizes images.
pub trait ImageBackend: Send + Sync {
    type Image: PoolImage;

    /// Creates an image of exactly `width` x `height`.
    ///
    /// The returned image must already be locked, the pool unlocks it when the
    /// image is checked back in.
    fn allocate(&self, width: u32, height: u32) -> Result<Self::Image, AllocError>;

    /// Resets the content of a recycled image before it is handed out again.
    fn clear(&self, image: &Self::Image);

    /// Adjusts a width to what the platform can allocate (power of two, etc).
    fn compatible_width(&self, width: u32) -> u32 {
        width
    }

    fn compatible_height(&self, height: u32) -> u32 {
        height
    }

    /// Hint that the pool just released a batch of images and the backend
    /// may want to run its own reclamation pass.
    fn reclaim_hint(&self) {}
}
