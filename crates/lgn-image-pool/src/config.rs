use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// The default filename for configuration files.
pub static DEFAULT_FILENAME: &str = "legion.toml";

/// The section holding the pool settings, in files and environment variables.
///
/// Environment keys nest on `.` like the rest of Legion's configuration
/// (`LGN_IMAGE_POOL.USE_QUARANTINE=true`). Since most shells cannot export
/// such names, `__` is accepted as a separator as well
/// (`LGN_IMAGE_POOL__USE_QUARANTINE=true`).
pub static CONFIG_SECTION: &str = "image_pool";

/// Sizing and reuse policy of an [`crate::ImagePool`].
///
/// Fixed when the pool is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImagePoolConfig {
    /// Requested sizes are rounded up to a multiple of this, per axis.
    pub quantum: u32,

    /// A reclaimable image is only reused if its area is at most this many
    /// times the requested area.
    pub max_area_ratio: f64,

    /// Checked-in images are held until [`crate::ImagePool::release_quarantine`]
    /// instead of being reusable right away. Needed on tile based drivers that
    /// corrupt rendering when the same render target is used twice in a frame.
    pub use_quarantine: bool,
}

impl Default for ImagePoolConfig {
    fn default() -> Self {
        Self {
            quantum: 32,
            max_area_ratio: 2.0,
            use_quarantine: false,
        }
    }
}

impl ImagePoolConfig {
    /// Create a configuration from a TOML string holding an `[image_pool]`
    /// section. Missing values keep their defaults.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Self::defaults().merge(Toml::string(toml)))
    }

    /// Load the configuration from `legion.toml` in the current directory and
    /// from `LGN_` environment variables, the latter taking precedence.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_FILENAME)
    }

    /// Same as [`Self::load`] with an explicit configuration file. A missing
    /// file is not an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::extract(
            Self::defaults()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("LGN_").split("__")),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quantum == 0 {
            return Err(ConfigError::InvalidQuantum);
        }
        if !self.max_area_ratio.is_finite() || self.max_area_ratio < 1.0 {
            return Err(ConfigError::InvalidAreaRatio(self.max_area_ratio));
        }
        Ok(())
    }

    /// Rounds `value` up to the next multiple of the quantum.
    pub(crate) fn quantize(&self, value: u32) -> u32 {
        let quantum = self.quantum.max(1);
        let rounded = (u64::from(value) + u64::from(quantum) - 1) / u64::from(quantum)
            * u64::from(quantum);
        u32::try_from(rounded).unwrap_or(value)
    }

    fn defaults() -> Figment {
        Figment::new().merge(Serialized::default(CONFIG_SECTION, Self::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract_inner(CONFIG_SECTION)?;
        config.validate()?;
        Ok(config)
    }
}
