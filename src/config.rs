//! Configuration for the K-Buffer and the file format it is loaded from.
//!
//! Every numeric setting is coerced into its valid range instead of being
//! rejected: `k` is clamped to `[MIN_K, MAX_K]`, exposure to `>= 0`, gamma to
//! `> 0` and the material capacity to `>= 1`. The same coercions back the
//! runtime setters on [`KBuffer`](crate::KBuffer), so a config file and a
//! slider in the editor can never disagree about what is legal.
//!
//! ```toml
//! k = 16
//! tone_mapped = true
//! exposure = 1.5
//! overflow = "keep_nearest"
//! cull_mode = "none"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Smallest number of fragments kept per pixel.
pub const MIN_K: u32 = 1;
/// Largest number of fragments kept per pixel.
pub const MAX_K: u32 = 16;
/// Lower bound applied to the gamma exponent.
pub const MIN_GAMMA: f32 = f32::EPSILON;

pub fn clamp_k(k: u32) -> u32 {
    k.clamp(MIN_K, MAX_K)
}

/// NaN and negative exposures become 0.
pub fn sanitize_exposure(exposure: f32) -> f32 {
    exposure.max(0.0)
}

/// NaN and non-positive gammas become [`MIN_GAMMA`].
pub fn sanitize_gamma(gamma: f32) -> f32 {
    gamma.max(MIN_GAMMA)
}

/// Non-positive counts become 1.
pub fn sanitize_material_capacity(count: i64) -> u32 {
    count.clamp(1, u32::MAX as i64) as u32
}

/// What happens to a fragment that arrives at a pixel already holding K.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// The late fragment is dropped; the first K to claim a slot win.
    #[default]
    DropNewest,
    /// The pixel semaphore is taken and the farthest stored fragment is
    /// replaced when the new one is nearer. Keeps the K nearest surfaces at
    /// the cost of a per-pixel spin lock.
    KeepNearest,
}

/// Triangle face culling during the store pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

impl CullMode {
    pub fn to_wgpu(self) -> Option<wgpu::Face> {
        match self {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        }
    }
}

/// K-Buffer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KBufferConfig {
    pub width: u32,
    pub height: u32,
    /// Fragments stored per pixel.
    pub k: u32,
    /// Number of material palette entries reserved up front.
    pub material_capacity: u32,
    pub tone_mapped: bool,
    pub exposure: f32,
    pub gamma_corrected: bool,
    pub gamma: f32,
    /// Test fragments against the depth of opaque surfaces already drawn.
    pub depth_test: bool,
    pub cull_mode: CullMode,
    pub overflow: OverflowPolicy,
}

impl Default for KBufferConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            k: MAX_K,
            material_capacity: 1,
            tone_mapped: false,
            exposure: 1.0,
            gamma_corrected: false,
            gamma: 2.2,
            depth_test: true,
            cull_mode: CullMode::None,
            overflow: OverflowPolicy::DropNewest,
        }
    }
}

impl KBufferConfig {
    pub fn new(width: u32, height: u32, k: u32) -> Self {
        Self {
            width,
            height,
            k,
            ..Default::default()
        }
        .sanitized()
    }

    /// Returns a copy with every field coerced into its valid range.
    pub fn sanitized(mut self) -> Self {
        let k = clamp_k(self.k);
        if k != self.k {
            log::warn!("K = {} is out of range, clamped to {}", self.k, k);
            self.k = k;
        }
        if self.width == 0 || self.height == 0 {
            log::warn!(
                "K-Buffer size {}x{} is empty, using 1x1",
                self.width,
                self.height
            );
            self.width = self.width.max(1);
            self.height = self.height.max(1);
        }
        self.material_capacity = sanitize_material_capacity(self.material_capacity.into());
        self.exposure = sanitize_exposure(self.exposure);
        self.gamma = sanitize_gamma(self.gamma);
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Serializable settings stored as TOML on disk.
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        check_format(path)?;
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        check_format(path)?;
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

impl Config for KBufferConfig {}

fn check_format(path: &Path) -> Result<(), ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(()),
        _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}
