//! Legion Image Pool
//!
//! Recycles the temporary images that effect passes render into. Allocating a
//! render target is expensive on GPU backends, so images that are "close
//! enough" in size to a request get reused instead of reallocated.
//!
//! ```ignore
//! use lgn_image_pool::{backends::CpuBackend, ImagePool, ImagePoolConfig};
//!
//! let pool = ImagePool::new(CpuBackend::default(), ImagePoolConfig::default())?;
//! let image = pool.check_out(100, 40)?;
//! // render into `image`...
//! pool.check_in(image);
//!
//! // once per frame, after present
//! pool.release_quarantine();
//! ```

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]
//#![warn(missing_docs)]

pub mod backends;

mod backend;
mod config;
mod error;
mod image_pool;
mod stats;

pub use backend::{Extents2D, ImageBackend, PoolImage};
pub use config::{ImagePoolConfig, CONFIG_SECTION, DEFAULT_FILENAME};
pub use error::{AllocError, ConfigError, PoolError, Result};
pub use image_pool::{ImageKey, ImagePool, PoolOccupancy, PooledImage};
pub use stats::{ImagePoolStats, NullStats, StatsSink, StatsSnapshot};

pub mod prelude {
    //! The Legion Image Pool Prelude.
    #[doc(hidden)]
    pub use crate::{ImageBackend, ImagePool, ImagePoolConfig, PoolImage, PooledImage};
}
