//! Resynthesis configuration

use serde::{Deserialize, Serialize};

use crate::envelope::DEFAULT_ENVELOPE_ORDER;
use crate::fft::validate_size;
use crate::{ResynthError, ResynthResult};

/// Resynthesis engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResynthConfig {
    /// Sample rate of the processed signal
    pub sample_rate: u32,

    /// Transform length (power of two)
    pub fft_size: usize,

    /// Frames covering each sample (hop = fft_size / overlap)
    pub overlap: usize,

    /// Cepstral lifter order for envelope extraction
    pub envelope_order: usize,

    /// Quality hint (0.0 - 1.0)
    pub quality: f32,

    /// Keep the source envelope when only the pitch moves
    pub preserve_formants: bool,
}

impl Default for ResynthConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            fft_size: 4096,
            overlap: 4,
            envelope_order: DEFAULT_ENVELOPE_ORDER,
            quality: 0.5,
            preserve_formants: true,
        }
    }
}

impl ResynthConfig {
    /// Create config for maximum quality (slower)
    pub fn quality() -> Self {
        Self {
            fft_size: 8192,
            quality: 1.0,
            ..Default::default()
        }
    }

    /// Create config for maximum speed
    pub fn fast() -> Self {
        Self {
            fft_size: 2048,
            quality: 0.0,
            ..Default::default()
        }
    }

    /// Set sample rate
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Set transform length
    pub fn with_fft_size(mut self, size: usize) -> Self {
        self.fft_size = size;
        self
    }

    /// Set overlap factor
    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }

    /// Set envelope lifter order
    pub fn with_envelope_order(mut self, order: usize) -> Self {
        self.envelope_order = order;
        self
    }

    /// Set quality hint, clamped to 0.0 - 1.0
    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = quality.clamp(0.0, 1.0);
        self
    }

    /// Enable or disable formant preservation
    pub fn with_preserve_formants(mut self, preserve: bool) -> Self {
        self.preserve_formants = preserve;
        self
    }

    /// Analysis hop in samples
    pub fn hop_size(&self) -> usize {
        self.fft_size / self.overlap.max(1)
    }

    /// Check every field against the engine's requirements
    pub fn validate(&self) -> ResynthResult<()> {
        if self.sample_rate == 0 {
            return Err(ResynthError::InvalidConfig(
                "sample rate must be positive".into(),
            ));
        }
        validate_size(self.fft_size)?;
        if self.overlap == 0 || self.overlap > self.fft_size || self.fft_size % self.overlap != 0 {
            return Err(ResynthError::InvalidConfig(format!(
                "overlap {} does not divide fft size {}",
                self.overlap, self.fft_size
            )));
        }
        if self.envelope_order == 0 || self.envelope_order >= self.fft_size / 2 {
            return Err(ResynthError::InvalidConfig(format!(
                "envelope order {} out of range for fft size {}",
                self.envelope_order, self.fft_size
            )));
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(ResynthError::InvalidConfig(format!(
                "quality {} outside 0.0 - 1.0",
                self.quality
            )));
        }
        Ok(())
    }

    /// Parse from JSON, missing fields take their defaults
    pub fn from_json(json: &str) -> ResynthResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> ResynthResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
